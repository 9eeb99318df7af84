// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Classification accuracy plus the faithfulness summaries of a run

use crate::datasets::{Annotation, Documents};
use crate::error::{MetricsError, Result};
use crate::faithfulness::{compute_aopc_scores, perturbation_summary, Perturbation};
use crate::metrics::{mean, ClassificationReport, ConfusionMatrix};
use crate::results::{InstanceResult, ResultFeatures};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Classification scores for a run
///
/// Optional fields are only filled in when every instance carries the
/// corresponding model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationScores {
    pub accuracy: f64,
    pub prf: ClassificationReport,
    pub comprehensiveness: Option<f64>,
    pub sufficiency: Option<f64>,
    pub comprehensiveness_entropy: Option<f64>,
    pub comprehensiveness_kl: Option<f64>,
    pub sufficiency_entropy: Option<f64>,
    pub sufficiency_kl: Option<f64>,
    pub aopc_thresholds: Option<Vec<f64>>,
    pub comprehensiveness_aopc: Option<f64>,
    pub comprehensiveness_aopc_points: Option<Vec<f64>>,
    pub sufficiency_aopc: Option<f64>,
    pub sufficiency_aopc_points: Option<Vec<f64>>,
    /// Mean fraction of cited-document tokens removed before the prediction flipped
    pub tokens_to_flip: Option<f64>,
}

impl ClassificationScores {
    /// Format as a human-readable summary
    pub fn format(&self) -> String {
        let mut output = format!("Accuracy: {:.4}\n\n{}", self.accuracy, self.prf.format());

        let optional = [
            ("Comprehensiveness", self.comprehensiveness),
            ("Sufficiency", self.sufficiency),
            ("Comprehensiveness entropy", self.comprehensiveness_entropy),
            ("Comprehensiveness KL", self.comprehensiveness_kl),
            ("Sufficiency entropy", self.sufficiency_entropy),
            ("Sufficiency KL", self.sufficiency_kl),
            ("Comprehensiveness AOPC", self.comprehensiveness_aopc),
            ("Sufficiency AOPC", self.sufficiency_aopc),
            ("Tokens to flip", self.tokens_to_flip),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                output.push_str(&format!("{}: {:.4}\n", name, value));
            }
        }
        output
    }
}

/// Score predicted labels against the annotations and summarise faithfulness
///
/// Every annotation must have an instance with the same id. Labels are indexed
/// in lexicographic order. `aopc_thresholds` of `None` derives the thresholds
/// from the instances themselves.
pub fn score_classifications(
    instances: &[InstanceResult],
    annotations: &[Annotation],
    docs: &Documents,
    aopc_thresholds: Option<&[f64]>,
) -> Result<ClassificationScores> {
    let features = ResultFeatures::detect(instances)?;

    let labels: BTreeSet<&str> = annotations.iter().map(|a| a.classification.as_str()).collect();
    let label_to_idx: BTreeMap<&str, usize> = labels.iter().enumerate().map(|(i, &l)| (l, i)).collect();
    let key_to_instance: BTreeMap<&str, &InstanceResult> =
        instances.iter().map(|inst| (inst.annotation_id.as_str(), inst)).collect();

    let mut truth = Vec::with_capacity(annotations.len());
    let mut predicted = Vec::with_capacity(annotations.len());
    for ann in annotations {
        let inst = lookup_instance(&key_to_instance, &ann.annotation_id)?;
        truth.push(label_to_idx[ann.classification.as_str()]);
        let pred = label_to_idx
            .get(inst.classification.as_str())
            .ok_or_else(|| MetricsError::UnknownLabel {
                label: inst.classification.clone(),
            })?;
        predicted.push(*pred);
    }

    let cm = ConfusionMatrix::from_predictions(labels.iter().map(|l| l.to_string()).collect(), &truth, &predicted);
    let prf = ClassificationReport::from_confusion_matrix(&cm);

    let comprehensiveness = features
        .comprehensiveness
        .then(|| perturbation_summary(instances, Perturbation::Comprehensiveness))
        .transpose()?;
    let sufficiency = features
        .sufficiency
        .then(|| perturbation_summary(instances, Perturbation::Sufficiency))
        .transpose()?;
    let aopc = features
        .thresholded_scores
        .then(|| compute_aopc_scores(instances, aopc_thresholds))
        .transpose()?;
    let tokens_to_flip = features
        .tokens_to_flip
        .then(|| tokens_to_flip_fraction(&key_to_instance, annotations, docs))
        .transpose()?;

    tracing::info!(
        accuracy = cm.accuracy(),
        annotations = annotations.len(),
        labels = labels.len(),
        "Scored classifications"
    );

    Ok(ClassificationScores {
        accuracy: cm.accuracy(),
        prf,
        comprehensiveness: comprehensiveness.map(|s| s.score),
        sufficiency: sufficiency.map(|s| s.score),
        comprehensiveness_entropy: comprehensiveness.map(|s| s.entropy),
        comprehensiveness_kl: comprehensiveness.map(|s| s.kl),
        sufficiency_entropy: sufficiency.map(|s| s.entropy),
        sufficiency_kl: sufficiency.map(|s| s.kl),
        comprehensiveness_aopc: aopc.as_ref().map(|a| a.comprehensiveness_aopc),
        comprehensiveness_aopc_points: aopc.as_ref().map(|a| a.comprehensiveness_points.clone()),
        sufficiency_aopc: aopc.as_ref().map(|a| a.sufficiency_aopc),
        sufficiency_aopc_points: aopc.as_ref().map(|a| a.sufficiency_points.clone()),
        aopc_thresholds: aopc.map(|a| a.thresholds),
        tokens_to_flip,
    })
}

fn lookup_instance<'a>(
    key_to_instance: &BTreeMap<&str, &'a InstanceResult>,
    annotation_id: &str,
) -> Result<&'a InstanceResult> {
    key_to_instance
        .get(annotation_id)
        .copied()
        .ok_or_else(|| MetricsError::MissingInstance {
            annotation_id: annotation_id.to_string(),
        })
}

fn tokens_to_flip_fraction(
    key_to_instance: &BTreeMap<&str, &InstanceResult>,
    annotations: &[Annotation],
    docs: &Documents,
) -> Result<f64> {
    let mut fractions = Vec::with_capacity(annotations.len());
    for ann in annotations {
        let inst = lookup_instance(key_to_instance, &ann.annotation_id)?;
        let flipped = inst.tokens_to_flip.ok_or_else(|| MetricsError::InconsistentResults {
            field: "tokens_to_flip",
            annotation_id: inst.annotation_id.clone(),
        })?;

        let mut total = 0;
        for docid in ann.cited_docids() {
            total += docs
                .token_count(docid)
                .ok_or_else(|| MetricsError::missing_document(docid))?;
        }
        fractions.push(if total == 0 { 0.0 } else { flipped as f64 / total as f64 });
    }
    Ok(mean(fractions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Evidence;
    use crate::results::{label_scores, ThresholdedScore};

    fn annotation(id: &str, label: &str, docid: &str) -> Annotation {
        Annotation::new(id, label, vec![vec![Evidence::new(docid, 0, 1)]])
    }

    fn docs() -> Documents {
        let mut docs = Documents::new();
        docs.insert_text("d1", "one two three four\nfive six seven eight");
        docs.insert_text("d2", "alpha beta\ngamma delta");
        docs
    }

    #[test]
    fn test_accuracy_and_report() {
        let annotations = vec![
            annotation("a1", "POS", "d1"),
            annotation("a2", "NEG", "d1"),
            annotation("a3", "POS", "d2"),
            annotation("a4", "NEG", "d2"),
        ];
        let instances = vec![
            InstanceResult::new("a1", "POS", [("POS", 0.9), ("NEG", 0.1)]),
            InstanceResult::new("a2", "POS", [("POS", 0.6), ("NEG", 0.4)]),
            InstanceResult::new("a3", "POS", [("POS", 0.7), ("NEG", 0.3)]),
            InstanceResult::new("a4", "NEG", [("POS", 0.2), ("NEG", 0.8)]),
        ];

        let scores = score_classifications(&instances, &annotations, &docs(), None).unwrap();
        assert!((scores.accuracy - 0.75).abs() < 1e-6);

        let pos = &scores.prf.per_class["POS"];
        assert!((pos.precision - 2.0 / 3.0).abs() < 1e-6);
        assert!((pos.recall - 1.0).abs() < 1e-6);
        assert_eq!(pos.support, 2);

        let neg = &scores.prf.per_class["NEG"];
        assert!((neg.precision - 1.0).abs() < 1e-6);
        assert!((neg.recall - 0.5).abs() < 1e-6);

        assert!(scores.comprehensiveness.is_none());
        assert!(scores.aopc_thresholds.is_none());
        assert!(scores.tokens_to_flip.is_none());
    }

    #[test]
    fn test_missing_instance() {
        let annotations = vec![annotation("a1", "POS", "d1"), annotation("a2", "NEG", "d1")];
        let instances = vec![InstanceResult::new("a1", "POS", [("POS", 0.9), ("NEG", 0.1)])];

        let err = score_classifications(&instances, &annotations, &docs(), None).unwrap_err();
        assert_eq!(
            err,
            MetricsError::MissingInstance {
                annotation_id: "a2".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_predicted_label() {
        let annotations = vec![annotation("a1", "POS", "d1")];
        let instances = vec![InstanceResult::new("a1", "MAYBE", [("MAYBE", 1.0)])];

        let err = score_classifications(&instances, &annotations, &docs(), None).unwrap_err();
        assert!(matches!(err, MetricsError::UnknownLabel { label } if label == "MAYBE"));
    }

    #[test]
    fn test_faithfulness_summaries() {
        let annotations = vec![annotation("a1", "A", "d1"), annotation("a2", "A", "d2")];

        let mut i1 = InstanceResult::new("a1", "A", [("A", 0.8), ("B", 0.2)]);
        i1.comprehensiveness_classification_scores = Some(label_scores([("A", 0.3), ("B", 0.7)]));
        i1.thresholded_scores = Some(vec![ThresholdedScore {
            threshold: 0.5,
            comprehensiveness_classification_scores: label_scores([("A", 0.3), ("B", 0.7)]),
            sufficiency_classification_scores: label_scores([("A", 0.8), ("B", 0.2)]),
        }]);
        i1.tokens_to_flip = Some(2);

        let mut i2 = InstanceResult::new("a2", "A", [("A", 0.8), ("B", 0.2)]);
        i2.comprehensiveness_classification_scores = Some(label_scores([("A", 0.5), ("B", 0.5)]));
        i2.thresholded_scores = Some(vec![ThresholdedScore {
            threshold: 0.5,
            comprehensiveness_classification_scores: label_scores([("A", 0.5), ("B", 0.5)]),
            sufficiency_classification_scores: label_scores([("A", 0.7), ("B", 0.3)]),
        }]);
        i2.tokens_to_flip = Some(1);

        let scores = score_classifications(&[i1, i2], &annotations, &docs(), Some(&[0.5][..])).unwrap();

        assert!((scores.comprehensiveness.unwrap() - 0.4).abs() < 1e-6);
        assert!(scores.comprehensiveness_entropy.is_some());
        assert!(scores.comprehensiveness_kl.unwrap() > 0.0);
        assert!(scores.sufficiency.is_none());
        assert!(scores.sufficiency_kl.is_none());

        assert_eq!(scores.aopc_thresholds, Some(vec![0.5]));
        assert!((scores.comprehensiveness_aopc.unwrap() - 0.4).abs() < 1e-6);
        assert!((scores.sufficiency_aopc_points.unwrap()[0] - 0.05).abs() < 1e-6);

        // d1 has 8 tokens and d2 has 4
        assert!((scores.tokens_to_flip.unwrap() - (2.0 / 8.0 + 1.0 / 4.0) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_inconsistent_results_rejected() {
        let annotations = vec![annotation("a1", "A", "d1"), annotation("a2", "A", "d1")];
        let mut i1 = InstanceResult::new("a1", "A", [("A", 0.8), ("B", 0.2)]);
        i1.sufficiency_classification_scores = Some(label_scores([("A", 0.6), ("B", 0.4)]));
        let i2 = InstanceResult::new("a2", "A", [("A", 0.8), ("B", 0.2)]);

        let err = score_classifications(&[i1, i2], &annotations, &docs(), None).unwrap_err();
        assert!(matches!(err, MetricsError::InconsistentResults { .. }));
    }

    #[test]
    fn test_empty_inputs() {
        let scores = score_classifications(&[], &[], &Documents::new(), None).unwrap();
        assert_eq!(scores.accuracy, 0.0);
        assert!(scores.prf.per_class.is_empty());
        assert!(scores.comprehensiveness.is_none());
    }
}
