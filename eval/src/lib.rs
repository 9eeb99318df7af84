// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Rationale evaluation for ERASER-style benchmarks
//!
//! This crate provides:
//! - Ground-truth annotation and document loading
//! - Hard rationale scoring (exact match and IOU partial match)
//! - Soft rationale scoring (AUPRC, average precision, ROC-AUC)
//! - Faithfulness metrics (comprehensiveness, sufficiency, AOPC)
//! - Classification reports
//! - An end-to-end evaluation pipeline

pub mod classification;
pub mod datasets;
pub mod error;
pub mod faithfulness;
pub mod metrics;
pub mod pipeline;
pub mod rationale;
pub mod results;
pub mod soft_scores;

pub use classification::{score_classifications, ClassificationScores};
pub use datasets::{Annotation, Documents, Evidence};
pub use error::{MetricsError, Result};
pub use faithfulness::{compute_aopc_scores, AopcScores};
pub use metrics::{
    partial_match_score, score_hard_rationale_predictions, ClassificationReport, ConfusionMatrix, InstanceScores,
    PartialMatchScore,
};
pub use pipeline::{EvaluationConfig, EvaluationPipeline, EvaluationReport, EvaluationResults};
pub use rationale::Rationale;
pub use results::{InstanceResult, ResultFeatures};
pub use soft_scores::{score_soft_tokens, Granularity, PositionScoredDocument, SoftScores};
