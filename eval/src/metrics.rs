// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Precision/recall/F1 scoring
//!
//! Implements:
//! - Exact-match rationale scoring (micro and macro averaged)
//! - Partial-match rationale scoring with IOU thresholds
//! - Multi-class confusion matrix and classification report
//!
//! Every ratio with a zero denominator is defined as 0.

use crate::rationale::Rationale;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Precision, recall and F1 for one aggregation level
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceScore {
    pub p: f64,
    pub r: f64,
    pub f1: f64,
}

impl InstanceScore {
    /// Score from precision and recall, with F1 derived from them
    pub fn from_pr(p: f64, r: f64) -> Self {
        Self { p, r, f1: f1(p, r) }
    }
}

/// Micro- and macro-averaged scores over annotation instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceScores {
    pub instance_micro: InstanceScore,
    pub instance_macro: InstanceScore,
}

/// Partial-match scores at one IOU threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialMatchScore {
    pub threshold: f64,
    pub micro: InstanceScore,
    #[serde(rename = "macro")]
    pub macro_: InstanceScore,
}

/// Harmonic mean of precision and recall, 0 when either is 0
pub fn f1(p: f64, r: f64) -> f64 {
    if p == 0.0 || r == 0.0 {
        return 0.0;
    }
    2.0 * p * r / (p + r)
}

/// `num / denom`, 0 when the denominator is 0
pub(crate) fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        return 0.0;
    }
    num as f64 / denom as f64
}

/// Arithmetic mean, 0 for no values
pub(crate) fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return 0.0;
    }
    sum / count as f64
}

type Groups<'a> = BTreeMap<(&'a str, &'a str), BTreeSet<&'a Rationale>>;

/// Deduplicate rationales and group them by `(annotation_id, docid)`
fn group_by_key<'a>(rationales: impl IntoIterator<Item = &'a Rationale>) -> Groups<'a> {
    let mut groups: Groups<'a> = BTreeMap::new();
    for r in rationales {
        groups.entry(r.key()).or_default().insert(r);
    }
    groups
}

/// Exact-match rationale scoring
///
/// Micro scores pool the intersection over the full sets. Macro scores are the
/// mean of per-key precision, recall and F1 taken independently, over every
/// key present in either set.
pub fn score_hard_rationale_predictions(truth: &[Rationale], pred: &[Rationale]) -> InstanceScores {
    let truth_set: BTreeSet<&Rationale> = truth.iter().collect();
    let pred_set: BTreeSet<&Rationale> = pred.iter().collect();

    let hits = truth_set.intersection(&pred_set).count();
    let instance_micro = InstanceScore::from_pr(ratio(hits, pred_set.len()), ratio(hits, truth_set.len()));

    let truth_groups = group_by_key(truth_set.iter().copied());
    let pred_groups = group_by_key(pred_set.iter().copied());
    let keys: BTreeSet<(&str, &str)> = truth_groups.keys().chain(pred_groups.keys()).copied().collect();

    let empty = BTreeSet::new();
    let per_key: Vec<InstanceScore> = keys
        .iter()
        .map(|k| {
            let t = truth_groups.get(k).unwrap_or(&empty);
            let p = pred_groups.get(k).unwrap_or(&empty);
            let hits = t.intersection(p).count();
            InstanceScore::from_pr(ratio(hits, p.len()), ratio(hits, t.len()))
        })
        .collect();

    let instance_macro = InstanceScore {
        p: mean(per_key.iter().map(|s| s.p)),
        r: mean(per_key.iter().map(|s| s.r)),
        f1: mean(per_key.iter().map(|s| s.f1)),
    };

    InstanceScores {
        instance_micro,
        instance_macro,
    }
}

/// Partial-match rationale scoring at each IOU threshold
///
/// Each predicted span is paired with its best-IOU ground-truth span in the
/// same `(annotation_id, docid)` group; several predictions may claim the same
/// ground-truth span. A prediction is a true positive at threshold `t` when its
/// best IOU is `>= t`.
///
/// Macro recall averages over keys with ground truth and macro precision over
/// keys with predictions; macro F1 is the F1 of those two averages.
pub fn partial_match_score(truth: &[Rationale], pred: &[Rationale], thresholds: &[f64]) -> Vec<PartialMatchScore> {
    let truth_groups = group_by_key(truth);
    let pred_groups = group_by_key(pred);

    let num_truth: BTreeMap<_, usize> = truth_groups.iter().map(|(k, v)| (*k, v.len())).collect();
    let num_pred: BTreeMap<_, usize> = pred_groups.iter().map(|(k, v)| (*k, v.len())).collect();
    let total_truth: usize = num_truth.values().sum();
    let total_pred: usize = num_pred.values().sum();

    let best_ious: BTreeMap<(&str, &str), Vec<f64>> = pred_groups
        .iter()
        .map(|(k, preds)| {
            let ious = preds
                .iter()
                .map(|p| {
                    truth_groups
                        .get(k)
                        .into_iter()
                        .flatten()
                        .map(|t| p.iou(t))
                        .fold(0.0, f64::max)
                })
                .collect();
            (*k, ious)
        })
        .collect();

    thresholds
        .iter()
        .map(|&threshold| {
            let tps: BTreeMap<(&str, &str), usize> = best_ious
                .iter()
                .map(|(k, ious)| (*k, ious.iter().filter(|&&iou| iou >= threshold).count()))
                .collect();
            let total_tps: usize = tps.values().sum();

            let micro = InstanceScore::from_pr(ratio(total_tps, total_pred), ratio(total_tps, total_truth));

            let macro_r = mean(
                num_truth
                    .iter()
                    .map(|(k, &n)| ratio(tps.get(k).copied().unwrap_or(0), n)),
            );
            let macro_p = mean(
                num_pred
                    .iter()
                    .map(|(k, &n)| ratio(tps.get(k).copied().unwrap_or(0), n)),
            );

            tracing::debug!(
                threshold,
                micro_f1 = micro.f1,
                true_positives = total_tps,
                "Scored partial matches"
            );

            PartialMatchScore {
                threshold,
                micro,
                macro_: InstanceScore::from_pr(macro_p, macro_r),
            }
        })
        .collect()
}

/// Multi-class confusion matrix, rows are true labels and columns predictions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<String>,
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Create from label indices into `labels`
    pub fn from_predictions(labels: Vec<String>, truth: &[usize], predicted: &[usize]) -> Self {
        assert_eq!(truth.len(), predicted.len(), "Prediction and ground truth lengths must match");

        let n = labels.len();
        let mut counts = vec![vec![0; n]; n];
        for (&t, &p) in truth.iter().zip(predicted) {
            counts[t][p] += 1;
        }
        Self { labels, counts }
    }

    /// Total number of samples
    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.labels.len()).map(|i| self.counts[i][i]).sum()
    }

    /// Accuracy: correct / total
    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Number of samples whose true label is `idx`
    pub fn support(&self, idx: usize) -> usize {
        self.counts[idx].iter().sum()
    }

    /// Number of samples predicted as `idx`
    pub fn predicted(&self, idx: usize) -> usize {
        self.counts.iter().map(|row| row[idx]).sum()
    }

    /// Precision of one label: TP / (TP + FP)
    pub fn precision(&self, idx: usize) -> f64 {
        ratio(self.counts[idx][idx], self.predicted(idx))
    }

    /// Recall of one label: TP / (TP + FN)
    pub fn recall(&self, idx: usize) -> f64 {
        ratio(self.counts[idx][idx], self.support(idx))
    }
}

/// Precision/recall/F1 of one class or one average
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "f1-score")]
    pub f1_score: f64,
    pub support: usize,
}

/// Per-label classification report with macro and support-weighted averages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub per_class: BTreeMap<String, ClassMetrics>,
    pub accuracy: f64,
    #[serde(rename = "macro avg")]
    pub macro_avg: ClassMetrics,
    #[serde(rename = "weighted avg")]
    pub weighted_avg: ClassMetrics,
}

impl ClassificationReport {
    /// Generate full report from confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix) -> Self {
        let per_label: Vec<ClassMetrics> = (0..cm.labels.len())
            .map(|i| {
                let precision = cm.precision(i);
                let recall = cm.recall(i);
                ClassMetrics {
                    precision,
                    recall,
                    f1_score: f1(precision, recall),
                    support: cm.support(i),
                }
            })
            .collect();

        let total = cm.total();
        let macro_avg = ClassMetrics {
            precision: mean(per_label.iter().map(|m| m.precision)),
            recall: mean(per_label.iter().map(|m| m.recall)),
            f1_score: mean(per_label.iter().map(|m| m.f1_score)),
            support: total,
        };
        let weighted = |f: fn(&ClassMetrics) -> f64| {
            if total == 0 {
                return 0.0;
            }
            per_label.iter().map(|m| f(m) * m.support as f64).sum::<f64>() / total as f64
        };
        let weighted_avg = ClassMetrics {
            precision: weighted(|m| m.precision),
            recall: weighted(|m| m.recall),
            f1_score: weighted(|m| m.f1_score),
            support: total,
        };

        Self {
            per_class: cm.labels.iter().cloned().zip(per_label).collect(),
            accuracy: cm.accuracy(),
            macro_avg,
            weighted_avg,
        }
    }

    /// Format as a human-readable table
    pub fn format(&self) -> String {
        let mut output = format!(
            "{:<16} {:>10} {:>10} {:>10} {:>8}\n",
            "", "precision", "recall", "f1-score", "support"
        );
        for (label, m) in &self.per_class {
            output.push_str(&format!(
                "{:<16} {:>10.3} {:>10.3} {:>10.3} {:>8}\n",
                label, m.precision, m.recall, m.f1_score, m.support
            ));
        }
        output.push_str(&format!("\n{:<16} {:>32.3} {:>8}\n", "accuracy", self.accuracy, self.macro_avg.support));
        for (name, m) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            output.push_str(&format!(
                "{:<16} {:>10.3} {:>10.3} {:>10.3} {:>8}\n",
                name, m.precision, m.recall, m.f1_score, m.support
            ));
        }
        output
    }
}
