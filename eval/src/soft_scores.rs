// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Ranking metrics for soft (per-position) rationale scores
//!
//! Each `(annotation_id, docid)` pair contributes one ranking problem: binary
//! ground truth per token (or sentence) against the model's relevance scores.
//! Scores are averaged across pairs without weighting.

use crate::datasets::{Annotation, Documents};
use crate::error::{MetricsError, Result};
use crate::metrics::mean;
use crate::results::InstanceResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resolution at which soft predictions are scored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Token,
    Sentence,
}

/// Aligned ground truth and predicted scores for one document of one annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionScoredDocument {
    pub ann_id: String,
    pub docid: String,
    pub truths: Vec<bool>,
    pub scores: Vec<f64>,
}

impl PositionScoredDocument {
    /// Pair every predicted document with its ground-truth evidence mask
    ///
    /// Documents predicted without any ground-truth evidence get an all-false
    /// mask. Records lacking predictions at this granularity are skipped.
    pub fn from_results(
        instances: &[InstanceResult],
        annotations: &[Annotation],
        docs: &Documents,
        granularity: Granularity,
    ) -> Result<Vec<Self>> {
        let doc_len = |docid: &str| -> Result<usize> {
            let len = match granularity {
                Granularity::Token => docs.token_count(docid),
                Granularity::Sentence => docs.sentence_count(docid),
            };
            len.ok_or_else(|| MetricsError::missing_document(docid))
        };

        let mut masks: BTreeMap<(String, String), Vec<bool>> = BTreeMap::new();
        for ann in annotations {
            for ev in ann.all_evidences() {
                let range = match granularity {
                    Granularity::Token => Some((ev.start_token, ev.end_token)),
                    Granularity::Sentence => ev.sentence_range(),
                };
                let Some((start, end)) = range else {
                    continue;
                };

                let len = doc_len(&ev.docid)?;
                if end > len {
                    return Err(MetricsError::EvidenceOutOfRange {
                        annotation_id: ann.annotation_id.clone(),
                        docid: ev.docid.clone(),
                        end,
                        len,
                    });
                }

                let mask = masks
                    .entry((ann.annotation_id.clone(), ev.docid.clone()))
                    .or_insert_with(|| vec![false; len]);
                for flag in mask.iter_mut().take(end).skip(start) {
                    *flag = true;
                }
            }
        }

        let mut paired = Vec::new();
        for inst in instances {
            for doc in &inst.rationales {
                let scores = match granularity {
                    Granularity::Token => doc.soft_rationale_predictions.as_ref(),
                    Granularity::Sentence => doc.soft_sentence_predictions.as_ref(),
                };
                let Some(scores) = scores else {
                    continue;
                };

                let len = doc_len(&doc.docid)?;
                if scores.len() != len {
                    return Err(MetricsError::ScoreLengthMismatch {
                        annotation_id: inst.annotation_id.clone(),
                        docid: doc.docid.clone(),
                        expected: len,
                        found: scores.len(),
                    });
                }

                check_finite(&inst.annotation_id, &doc.docid, scores)?;

                let key = (inst.annotation_id.clone(), doc.docid.clone());
                let truths = masks.get(&key).cloned().unwrap_or_else(|| vec![false; len]);
                paired.push(Self {
                    ann_id: key.0,
                    docid: key.1,
                    truths,
                    scores: scores.clone(),
                });
            }
        }

        Ok(paired)
    }

    /// Whether the ground truth holds only one class (or nothing)
    pub fn is_single_class(&self) -> bool {
        self.truths.iter().all(|&t| t) || self.truths.iter().all(|&t| !t)
    }
}

/// Aggregate ranking quality of soft predictions
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftScores {
    pub auprc: f64,
    pub average_precision: f64,
    pub roc_auc_score: f64,
}

/// Score soft predictions against binary ground truth
///
/// AUPRC averages over every pair. Average precision and ROC-AUC discard pairs
/// whose ground truth is single-class first. Any metric with nothing left to
/// average is 0.
pub fn score_soft_tokens(paired_scores: &[PositionScoredDocument]) -> Result<SoftScores> {
    let mut groups: BTreeMap<(&str, &str), &PositionScoredDocument> = BTreeMap::new();
    for ps in paired_scores {
        if ps.truths.len() != ps.scores.len() {
            return Err(MetricsError::ScoreLengthMismatch {
                annotation_id: ps.ann_id.clone(),
                docid: ps.docid.clone(),
                expected: ps.truths.len(),
                found: ps.scores.len(),
            });
        }
        check_finite(&ps.ann_id, &ps.docid, &ps.scores)?;
        groups.insert((ps.ann_id.as_str(), ps.docid.as_str()), ps);
    }

    let auprc = mean(groups.values().map(|ps| auprc(&ps.truths, &ps.scores)));
    let two_class: Vec<_> = groups.values().filter(|ps| !ps.is_single_class()).collect();
    let average_precision = mean(
        two_class
            .iter()
            .filter_map(|ps| average_precision(&ps.truths, &ps.scores)),
    );
    let roc_auc_score = mean(two_class.iter().filter_map(|ps| roc_auc(&ps.truths, &ps.scores)));

    tracing::debug!(
        groups = groups.len(),
        two_class = two_class.len(),
        auprc,
        "Scored soft predictions"
    );

    Ok(SoftScores {
        auprc,
        average_precision,
        roc_auc_score,
    })
}

fn check_finite(annotation_id: &str, docid: &str, scores: &[f64]) -> Result<()> {
    match scores.iter().position(|s| !s.is_finite()) {
        Some(position) => Err(MetricsError::NonFiniteScore {
            annotation_id: annotation_id.to_string(),
            docid: docid.to_string(),
            position,
        }),
        None => Ok(()),
    }
}

/// Cumulative (false positives, true positives) at each distinct score, highest first
fn binary_clf_curve(truths: &[bool], scores: &[f64]) -> Vec<(usize, usize)> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut points = Vec::new();
    let (mut fp, mut tp) = (0, 0);
    for (pos, &i) in order.iter().enumerate() {
        if truths[i] {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_tie = order
            .get(pos + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_tie {
            points.push((fp, tp));
        }
    }
    points
}

/// Precision/recall curve ordered by increasing threshold, ending at (precision 1, recall 0)
///
/// Recall is 1 everywhere when there are no positives.
pub fn precision_recall_curve(truths: &[bool], scores: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let points = binary_clf_curve(truths, scores);
    let total_tp = points.last().map_or(0, |&(_, tp)| tp);

    let mut precision = Vec::with_capacity(points.len() + 1);
    let mut recall = Vec::with_capacity(points.len() + 1);
    for &(fp, tp) in points.iter().rev() {
        precision.push(if tp + fp == 0 { 0.0 } else { tp as f64 / (tp + fp) as f64 });
        recall.push(if total_tp == 0 { 1.0 } else { tp as f64 / total_tp as f64 });
    }
    precision.push(1.0);
    recall.push(0.0);
    (precision, recall)
}

/// Trapezoidal area under a curve whose x values are monotonic
pub fn auc(x: &[f64], y: &[f64]) -> f64 {
    let signed: f64 = x
        .windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[0] + ys[1]) / 2.0)
        .sum();
    let decreasing = x.windows(2).all(|xs| xs[1] <= xs[0]);
    if decreasing {
        -signed
    } else {
        signed
    }
}

/// Area under the precision/recall curve; 0 for an empty sequence
pub fn auprc(truths: &[bool], scores: &[f64]) -> f64 {
    if truths.is_empty() {
        return 0.0;
    }
    let (precision, recall) = precision_recall_curve(truths, scores);
    auc(&recall, &precision)
}

/// Step-wise average precision: sum over thresholds of (R_n - R_{n-1}) * P_n
///
/// `None` when there are no positives.
pub fn average_precision(truths: &[bool], scores: &[f64]) -> Option<f64> {
    if !truths.iter().any(|&t| t) {
        return None;
    }
    let (precision, recall) = precision_recall_curve(truths, scores);
    let ap = recall
        .windows(2)
        .zip(&precision)
        .map(|(rs, p)| (rs[0] - rs[1]) * p)
        .sum();
    Some(ap)
}

/// Area under the ROC curve, with ties scored as half-ranked
///
/// `None` unless both classes are present.
pub fn roc_auc(truths: &[bool], scores: &[f64]) -> Option<f64> {
    let points = binary_clf_curve(truths, scores);
    let &(total_fp, total_tp) = points.last()?;
    if total_fp == 0 || total_tp == 0 {
        return None;
    }

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    for &(fp, tp) in &points {
        fpr.push(fp as f64 / total_fp as f64);
        tpr.push(tp as f64 / total_tp as f64);
    }
    Some(auc(&fpr, &tpr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Evidence;
    use crate::results::DocumentPrediction;

    fn scored(ann: &str, doc: &str, truths: Vec<bool>, scores: Vec<f64>) -> PositionScoredDocument {
        PositionScoredDocument {
            ann_id: ann.to_string(),
            docid: doc.to_string(),
            truths,
            scores,
        }
    }

    #[test]
    fn test_perfect_ranking() {
        let truths = [true, true, false, false];
        let scores = [0.9, 0.8, 0.2, 0.1];

        assert!((average_precision(&truths, &scores).unwrap() - 1.0).abs() < 1e-12);
        assert!((roc_auc(&truths, &scores).unwrap() - 1.0).abs() < 1e-12);
        assert!((auprc(&truths, &scores) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_imperfect_ranking() {
        let truths = [true, false, true];
        let scores = [0.9, 0.8, 0.7];

        assert!((average_precision(&truths, &scores).unwrap() - 5.0 / 6.0).abs() < 1e-12);
        assert!((roc_auc(&truths, &scores).unwrap() - 0.5).abs() < 1e-12);
        assert!((auprc(&truths, &scores) - 0.791_666_666_666_666_6).abs() < 1e-9);
    }

    #[test]
    fn test_ties_share_a_threshold() {
        let truths = [true, false];
        let scores = [0.5, 0.5];

        assert!((roc_auc(&truths, &scores).unwrap() - 0.5).abs() < 1e-12);
        assert!((average_precision(&truths, &scores).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_is_undefined() {
        assert_eq!(roc_auc(&[true, true], &[0.3, 0.4]), None);
        assert_eq!(roc_auc(&[false, false], &[0.3, 0.4]), None);
        assert_eq!(average_precision(&[false, false], &[0.3, 0.4]), None);
    }

    #[test]
    fn test_precision_recall_curve_shape() {
        let (precision, recall) = precision_recall_curve(&[true, false, true], &[0.9, 0.8, 0.7]);
        assert_eq!(precision.len(), 4);
        assert_eq!(recall, vec![1.0, 0.5, 0.5, 0.0]);
        assert_eq!(*precision.last().unwrap(), 1.0);
    }

    #[test]
    fn test_auc_direction() {
        let x = [0.0, 0.5, 1.0];
        let y = [1.0, 1.0, 1.0];
        assert!((auc(&x, &y) - 1.0).abs() < 1e-12);

        let x_rev = [1.0, 0.5, 0.0];
        assert!((auc(&x_rev, &y) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_soft_tokens_discards_single_class_for_ap_only() {
        let pairs = vec![
            scored("a", "d1", vec![true, true, false, false], vec![0.9, 0.8, 0.2, 0.1]),
            scored("b", "d1", vec![false, false, false], vec![0.9, 0.1, 0.4]),
        ];
        let scores = score_soft_tokens(&pairs).unwrap();

        assert!((scores.average_precision - 1.0).abs() < 1e-12);
        assert!((scores.roc_auc_score - 1.0).abs() < 1e-12);
        // the all-negative pair still counts for AUPRC
        let negative_auprc = auprc(&pairs[1].truths, &pairs[1].scores);
        assert!((scores.auprc - (1.0 + negative_auprc) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_soft_tokens_empty() {
        assert_eq!(score_soft_tokens(&[]).unwrap(), SoftScores::default());

        let single = vec![scored("a", "d", vec![true, true], vec![0.1, 0.2])];
        let scores = score_soft_tokens(&single).unwrap();
        assert_eq!(scores.average_precision, 0.0);
        assert_eq!(scores.roc_auc_score, 0.0);
    }

    #[test]
    fn test_score_soft_tokens_length_mismatch() {
        let pairs = vec![scored("a", "d", vec![true, false], vec![0.1])];
        assert!(matches!(
            score_soft_tokens(&pairs),
            Err(MetricsError::ScoreLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_score_soft_tokens_rejects_nan() {
        let pairs = vec![scored("a", "d", vec![true, false, false], vec![0.9, f64::NAN, 0.1])];
        assert_eq!(
            score_soft_tokens(&pairs).unwrap_err(),
            MetricsError::NonFiniteScore {
                annotation_id: "a".to_string(),
                docid: "d".to_string(),
                position: 1,
            }
        );
    }

    #[test]
    fn test_curves_do_not_panic_on_nan() {
        let truths: Vec<bool> = (0..64).map(|i| i % 3 == 0).collect();
        let scores: Vec<f64> = (0..64)
            .map(|i| if i % 5 == 0 { f64::NAN } else { (i as f64 * 0.37).fract() })
            .collect();

        let _ = auprc(&truths, &scores);
        let _ = average_precision(&truths, &scores);
        let _ = roc_auc(&truths, &scores);
    }

    fn fixture() -> (Vec<InstanceResult>, Vec<Annotation>, Documents) {
        let mut docs = Documents::new();
        docs.insert_text("d1", "a b c\nd e f");
        docs.insert_text("d2", "x y");

        let annotations = vec![Annotation::new(
            "a1",
            "POS",
            vec![vec![Evidence::new("d1", 1, 3).with_sentences(0, 1)]],
        )];

        let mut inst = InstanceResult::new("a1", "POS", [("POS", 0.9), ("NEG", 0.1)]);
        inst.rationales = vec![
            DocumentPrediction {
                soft_rationale_predictions: Some(vec![0.1, 0.9, 0.8, 0.2, 0.0, 0.3]),
                soft_sentence_predictions: Some(vec![0.7, 0.3]),
                ..DocumentPrediction::new("d1")
            },
            DocumentPrediction {
                soft_rationale_predictions: Some(vec![0.5, 0.5]),
                soft_sentence_predictions: Some(vec![0.5]),
                ..DocumentPrediction::new("d2")
            },
        ];
        (vec![inst], annotations, docs)
    }

    #[test]
    fn test_from_results_tokens() {
        let (instances, annotations, docs) = fixture();
        let paired = PositionScoredDocument::from_results(&instances, &annotations, &docs, Granularity::Token).unwrap();

        assert_eq!(paired.len(), 2);
        assert_eq!(paired[0].truths, vec![false, true, true, false, false, false]);
        assert_eq!(paired[1].truths, vec![false, false]);

        let scores = score_soft_tokens(&paired).unwrap();
        assert!((scores.roc_auc_score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_results_sentences() {
        let (instances, annotations, docs) = fixture();
        let paired =
            PositionScoredDocument::from_results(&instances, &annotations, &docs, Granularity::Sentence).unwrap();

        assert_eq!(paired[0].truths, vec![true, false]);
        assert_eq!(paired[0].scores, vec![0.7, 0.3]);
    }

    #[test]
    fn test_from_results_rejects_wrong_length() {
        let (mut instances, annotations, docs) = fixture();
        instances[0].rationales[1].soft_rationale_predictions = Some(vec![0.5]);

        let err = PositionScoredDocument::from_results(&instances, &annotations, &docs, Granularity::Token).unwrap_err();
        assert_eq!(
            err,
            MetricsError::ScoreLengthMismatch {
                annotation_id: "a1".to_string(),
                docid: "d2".to_string(),
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn test_from_results_rejects_infinite_score() {
        let (mut instances, annotations, docs) = fixture();
        instances[0].rationales[0].soft_sentence_predictions = Some(vec![0.7, f64::INFINITY]);

        let err =
            PositionScoredDocument::from_results(&instances, &annotations, &docs, Granularity::Sentence).unwrap_err();
        assert!(matches!(err, MetricsError::NonFiniteScore { docid, position: 1, .. } if docid == "d1"));
    }

    #[test]
    fn test_from_results_rejects_evidence_past_document() {
        let (instances, mut annotations, docs) = fixture();
        annotations[0].evidences[0][0].end_token = 40;

        assert!(matches!(
            PositionScoredDocument::from_results(&instances, &annotations, &docs, Granularity::Token),
            Err(MetricsError::EvidenceOutOfRange { end: 40, len: 6, .. })
        ));
    }
}
