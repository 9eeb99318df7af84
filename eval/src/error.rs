// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Error types for rationale scoring
//!
//! Only caller invariant violations are errors. Degenerate ratios (`0/0`),
//! empty inputs and single-class soft-score groups are handled locally by the
//! scorers and never surface here.

use thiserror::Error;

/// Result type for scoring operations
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Fatal conditions raised while scoring a run
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum MetricsError {
    /// An annotation has no corresponding model output
    #[error("no instance result for annotation '{annotation_id}'")]
    MissingInstance { annotation_id: String },

    /// An instance does not report exactly one score per working threshold
    #[error(
        "instance '{annotation_id}' is missing thresholded scores: expected thresholds {expected:?}, found {found:?}"
    )]
    MissingThreshold {
        annotation_id: String,
        expected: Vec<f64>,
        found: Vec<f64>,
    },

    /// An optional result field is present on some instances but not others
    #[error("field '{field}' is inconsistent across results (first mismatch at instance '{annotation_id}')")]
    InconsistentResults {
        field: &'static str,
        annotation_id: String,
    },

    /// A label-probability mapping lacks the label being looked up
    #[error("label '{label}' missing from {context}")]
    MissingLabel { label: String, context: String },

    /// A predicted label that never occurs in the ground truth
    #[error("label '{label}' is not part of the annotation label vocabulary")]
    UnknownLabel { label: String },

    /// Soft predictions whose length differs from the document length
    #[error(
        "soft predictions for ('{annotation_id}', '{docid}') have length {found}, document has {expected}"
    )]
    ScoreLengthMismatch {
        annotation_id: String,
        docid: String,
        expected: usize,
        found: usize,
    },

    /// Soft predictions containing NaN or infinite scores
    #[error("soft predictions for ('{annotation_id}', '{docid}') contain a non-finite score at position {position}")]
    NonFiniteScore {
        annotation_id: String,
        docid: String,
        position: usize,
    },

    /// Ground-truth evidence extends past the end of its document
    #[error("evidence for ('{annotation_id}', '{docid}') ends at {end}, document has {len} positions")]
    EvidenceOutOfRange {
        annotation_id: String,
        docid: String,
        end: usize,
        len: usize,
    },

    /// A referenced document is not in the document lookup
    #[error("document '{docid}' not found")]
    MissingDocument { docid: String },
}

impl MetricsError {
    /// Create a missing-label error
    pub fn missing_label(label: impl Into<String>, context: impl Into<String>) -> Self {
        MetricsError::MissingLabel {
            label: label.into(),
            context: context.into(),
        }
    }

    /// Create a missing-document error
    pub fn missing_document(docid: impl Into<String>) -> Self {
        MetricsError::MissingDocument { docid: docid.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_offender() {
        let err = MetricsError::MissingInstance {
            annotation_id: "ann_7".to_string(),
        };
        assert!(err.to_string().contains("ann_7"));

        let err = MetricsError::missing_label("POS", "comprehensiveness scores of 'ann_1'");
        assert!(err.to_string().contains("POS"));
        assert!(err.to_string().contains("ann_1"));
    }
}
