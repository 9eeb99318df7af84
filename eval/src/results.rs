// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model output records and their run-level validation
//!
//! Provides:
//! - Typed per-instance model output ([`InstanceResult`])
//! - Run-level detection of which optional metric families apply
//! - Structural verification of results against ground truth

use crate::datasets::{load_jsonl, Annotation, Documents};
use crate::error::{MetricsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Label -> probability mapping
pub type LabelScores = BTreeMap<String, f64>;

/// A predicted hard rationale span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanPrediction {
    pub start_token: usize,
    pub end_token: usize,
}

impl SpanPrediction {
    pub fn new(start_token: usize, end_token: usize) -> Self {
        Self { start_token, end_token }
    }
}

/// Rationale predictions for one document of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPrediction {
    pub docid: String,
    #[serde(default)]
    pub hard_rationale_predictions: Option<Vec<SpanPrediction>>,
    /// One score per document token
    #[serde(default)]
    pub soft_rationale_predictions: Option<Vec<f64>>,
    /// One score per document sentence
    #[serde(default)]
    pub soft_sentence_predictions: Option<Vec<f64>>,
}

impl DocumentPrediction {
    pub fn new(docid: impl Into<String>) -> Self {
        Self {
            docid: docid.into(),
            hard_rationale_predictions: None,
            soft_rationale_predictions: None,
            soft_sentence_predictions: None,
        }
    }
}

/// Perturbed classification scores at one deletion threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdedScore {
    pub threshold: f64,
    pub comprehensiveness_classification_scores: LabelScores,
    pub sufficiency_classification_scores: LabelScores,
}

/// Model output for one annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceResult {
    pub annotation_id: String,
    /// Predicted label
    pub classification: String,
    pub classification_scores: LabelScores,
    #[serde(default)]
    pub rationales: Vec<DocumentPrediction>,
    /// Scores with the predicted rationale removed
    #[serde(default)]
    pub comprehensiveness_classification_scores: Option<LabelScores>,
    /// Scores with only the predicted rationale kept
    #[serde(default)]
    pub sufficiency_classification_scores: Option<LabelScores>,
    #[serde(default)]
    pub thresholded_scores: Option<Vec<ThresholdedScore>>,
    /// Tokens that had to be removed before the prediction flipped
    #[serde(default)]
    pub tokens_to_flip: Option<usize>,
}

impl InstanceResult {
    pub fn new<L, I, K>(annotation_id: impl Into<String>, classification: L, scores: I) -> Self
    where
        L: Into<String>,
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            annotation_id: annotation_id.into(),
            classification: classification.into(),
            classification_scores: label_scores(scores),
            rationales: Vec::new(),
            comprehensiveness_classification_scores: None,
            sufficiency_classification_scores: None,
            thresholded_scores: None,
            tokens_to_flip: None,
        }
    }

    /// Probability of the predicted label under the unperturbed input
    pub fn predicted_score(&self) -> Result<f64> {
        label_score(
            &self.classification_scores,
            &self.classification,
            || format!("classification scores of '{}'", self.annotation_id),
        )
    }
}

/// Build a [`LabelScores`] from label/probability pairs
pub fn label_scores<I, K>(scores: I) -> LabelScores
where
    I: IntoIterator<Item = (K, f64)>,
    K: Into<String>,
{
    scores.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Look up a label's probability, naming the mapping on failure
pub fn label_score(scores: &LabelScores, label: &str, context: impl FnOnce() -> String) -> Result<f64> {
    scores
        .get(label)
        .copied()
        .ok_or_else(|| MetricsError::missing_label(label, context()))
}

/// Load model output records from a JSON Lines file
pub fn load_results(path: &Path) -> anyhow::Result<Vec<InstanceResult>> {
    let results: Vec<InstanceResult> = load_jsonl(path)?;
    tracing::info!("Loaded {} instance results from {}", results.len(), path.display());
    Ok(results)
}

/// Optional metric families that apply to a whole run
///
/// Decided once from the first instance; every other instance must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFeatures {
    pub hard_predictions: bool,
    pub soft_token_predictions: bool,
    pub soft_sentence_predictions: bool,
    pub comprehensiveness: bool,
    pub sufficiency: bool,
    pub thresholded_scores: bool,
    pub tokens_to_flip: bool,
}

impl ResultFeatures {
    /// Detect the run's metric families, rejecting non-homogeneous results
    ///
    /// An empty result list has no optional families. A field counts as
    /// present whenever it is set, so an explicitly empty
    /// `hard_rationale_predictions` list still enables hard scoring (with no
    /// predicted spans for that document).
    pub fn detect(instances: &[InstanceResult]) -> Result<Self> {
        let Some(first) = instances.first() else {
            return Ok(Self::default());
        };
        let features = Self::of_instance(first)?;

        for inst in &instances[1..] {
            let other = Self::of_instance(inst)?;
            if let Some(field) = features.first_difference(&other) {
                return Err(MetricsError::InconsistentResults {
                    field,
                    annotation_id: inst.annotation_id.clone(),
                });
            }
        }

        tracing::debug!(?features, "Detected result features over {} instances", instances.len());
        Ok(features)
    }

    fn of_instance(inst: &InstanceResult) -> Result<Self> {
        Ok(Self {
            hard_predictions: rationale_field(inst, "hard_rationale_predictions", |d| {
                d.hard_rationale_predictions.is_some()
            })?,
            soft_token_predictions: rationale_field(inst, "soft_rationale_predictions", |d| {
                d.soft_rationale_predictions.is_some()
            })?,
            soft_sentence_predictions: rationale_field(inst, "soft_sentence_predictions", |d| {
                d.soft_sentence_predictions.is_some()
            })?,
            comprehensiveness: inst.comprehensiveness_classification_scores.is_some(),
            sufficiency: inst.sufficiency_classification_scores.is_some(),
            thresholded_scores: inst.thresholded_scores.is_some(),
            tokens_to_flip: inst.tokens_to_flip.is_some(),
        })
    }

    fn first_difference(&self, other: &Self) -> Option<&'static str> {
        let pairs = [
            ("hard_rationale_predictions", self.hard_predictions, other.hard_predictions),
            ("soft_rationale_predictions", self.soft_token_predictions, other.soft_token_predictions),
            ("soft_sentence_predictions", self.soft_sentence_predictions, other.soft_sentence_predictions),
            (
                "comprehensiveness_classification_scores",
                self.comprehensiveness,
                other.comprehensiveness,
            ),
            ("sufficiency_classification_scores", self.sufficiency, other.sufficiency),
            ("thresholded_scores", self.thresholded_scores, other.thresholded_scores),
            ("tokens_to_flip", self.tokens_to_flip, other.tokens_to_flip),
        ];
        pairs.into_iter().find(|(_, a, b)| a != b).map(|(name, _, _)| name)
    }
}

/// Whether a per-document field is present on an instance
///
/// Present means: at least one document record, and every record carries it.
fn rationale_field(
    inst: &InstanceResult,
    field: &'static str,
    has: impl Fn(&DocumentPrediction) -> bool,
) -> Result<bool> {
    let with = inst.rationales.iter().filter(|d| has(d)).count();
    if with == 0 {
        Ok(false)
    } else if with == inst.rationales.len() {
        Ok(true)
    } else {
        Err(MetricsError::InconsistentResults {
            field,
            annotation_id: inst.annotation_id.clone(),
        })
    }
}

/// Check the structure of every result against ground truth and documents
///
/// Returns one message per problem found; an empty list means the results are
/// well formed.
pub fn verify_results(
    instances: &[InstanceResult],
    annotations: &[Annotation],
    docs: &Documents,
) -> Vec<String> {
    let by_id: HashMap<&str, &Annotation> = annotations
        .iter()
        .map(|ann| (ann.annotation_id.as_str(), ann))
        .collect();

    let mut problems = Vec::new();
    let mut seen = BTreeSet::new();
    for inst in instances {
        if !seen.insert(inst.annotation_id.as_str()) {
            problems.push(format!("duplicate result for annotation '{}'", inst.annotation_id));
        }
        problems.extend(verify_instance(inst, by_id.get(inst.annotation_id.as_str()).copied(), docs));
    }
    problems
}

/// Check one result record
pub fn verify_instance(inst: &InstanceResult, annotation: Option<&Annotation>, docs: &Documents) -> Vec<String> {
    let id = &inst.annotation_id;
    let mut problems = Vec::new();

    let Some(annotation) = annotation else {
        problems.push(format!("'{}' does not match any annotation", id));
        return problems;
    };

    if !inst.classification_scores.contains_key(&inst.classification) {
        problems.push(format!(
            "'{}': predicted label '{}' has no classification score",
            id, inst.classification
        ));
    }

    let labels: BTreeSet<&String> = inst.classification_scores.keys().collect();
    let same_labels = |scores: &LabelScores| scores.keys().collect::<BTreeSet<_>>() == labels;
    if let Some(scores) = &inst.comprehensiveness_classification_scores {
        if !same_labels(scores) {
            problems.push(format!("'{}': comprehensiveness scores use a different label set", id));
        }
    }
    if let Some(scores) = &inst.sufficiency_classification_scores {
        if !same_labels(scores) {
            problems.push(format!("'{}': sufficiency scores use a different label set", id));
        }
    }
    for ts in inst.thresholded_scores.iter().flatten() {
        if !same_labels(&ts.comprehensiveness_classification_scores)
            || !same_labels(&ts.sufficiency_classification_scores)
        {
            problems.push(format!(
                "'{}': thresholded scores at {} use a different label set",
                id, ts.threshold
            ));
        }
    }

    let allowed = annotation.allowed_docids();
    for doc in &inst.rationales {
        if !allowed.contains(doc.docid.as_str()) {
            problems.push(format!("'{}': rationale for unexpected document '{}'", id, doc.docid));
        }
        let (Some(tokens), Some(sentences)) = (docs.token_count(&doc.docid), docs.sentence_count(&doc.docid))
        else {
            problems.push(format!("'{}': document '{}' not found", id, doc.docid));
            continue;
        };

        for span in doc.hard_rationale_predictions.iter().flatten() {
            if span.start_token > span.end_token || span.end_token > tokens {
                problems.push(format!(
                    "'{}': hard prediction ({}, {}) invalid for document '{}' of {} tokens",
                    id, span.start_token, span.end_token, doc.docid, tokens
                ));
            }
        }
        for (name, scores) in [
            ("token", &doc.soft_rationale_predictions),
            ("sentence", &doc.soft_sentence_predictions),
        ] {
            if scores.iter().flatten().any(|s| !s.is_finite()) {
                problems.push(format!(
                    "'{}': non-finite soft {} score for document '{}'",
                    id, name, doc.docid
                ));
            }
        }
        if let Some(scores) = &doc.soft_rationale_predictions {
            if scores.len() != tokens {
                problems.push(format!(
                    "'{}': {} soft token scores for document '{}' of {} tokens",
                    id,
                    scores.len(),
                    doc.docid,
                    tokens
                ));
            }
        }
        if let Some(scores) = &doc.soft_sentence_predictions {
            if scores.len() != sentences {
                problems.push(format!(
                    "'{}': {} soft sentence scores for document '{}' of {} sentences",
                    id,
                    scores.len(),
                    doc.docid,
                    sentences
                ));
            }
        }
    }

    problems
}
