// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Faithfulness of rationales under token deletion
//!
//! Compares the model's confidence in its own prediction before and after the
//! input is perturbed:
//! - comprehensiveness: the rationale is removed (a large drop is good)
//! - sufficiency: only the rationale is kept (a small drop is good)
//!
//! AOPC (area over the perturbation curve) averages the confidence drop over a
//! set of deletion thresholds.

use crate::error::{MetricsError, Result};
use crate::metrics::mean;
use crate::results::{label_score, InstanceResult, LabelScores, ThresholdedScore};
use serde::{Deserialize, Serialize};

/// Which perturbed input a score refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perturbation {
    Comprehensiveness,
    Sufficiency,
}

impl Perturbation {
    pub fn field_name(&self) -> &'static str {
        match self {
            Perturbation::Comprehensiveness => "comprehensiveness_classification_scores",
            Perturbation::Sufficiency => "sufficiency_classification_scores",
        }
    }

    /// Whole-rationale perturbed scores of an instance
    pub fn scores<'a>(&self, inst: &'a InstanceResult) -> Option<&'a LabelScores> {
        match self {
            Perturbation::Comprehensiveness => inst.comprehensiveness_classification_scores.as_ref(),
            Perturbation::Sufficiency => inst.sufficiency_classification_scores.as_ref(),
        }
    }

    /// Perturbed scores at one deletion threshold
    pub fn thresholded<'a>(&self, ts: &'a ThresholdedScore) -> &'a LabelScores {
        match self {
            Perturbation::Comprehensiveness => &ts.comprehensiveness_classification_scores,
            Perturbation::Sufficiency => &ts.sufficiency_classification_scores,
        }
    }
}

/// AOPC scores and per-threshold curves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AopcScores {
    /// Working thresholds, ascending; the curves are aligned to them
    pub thresholds: Vec<f64>,
    pub comprehensiveness_aopc: f64,
    pub comprehensiveness_points: Vec<f64>,
    pub sufficiency_aopc: f64,
    pub sufficiency_points: Vec<f64>,
}

/// Sorted, deduplicated union of every threshold the instances report
pub fn derive_thresholds(instances: &[InstanceResult]) -> Vec<f64> {
    let thresholds = instances
        .iter()
        .flat_map(|inst| inst.thresholded_scores.iter().flatten())
        .map(|ts| ts.threshold)
        .collect();
    normalize_thresholds(thresholds)
}

fn normalize_thresholds(mut thresholds: Vec<f64>) -> Vec<f64> {
    thresholds.sort_by(f64::total_cmp);
    thresholds.dedup();
    thresholds
}

/// Compute comprehensiveness and sufficiency AOPC
///
/// Without explicit thresholds the union of all reported thresholds is used.
/// Every instance must report exactly one score at every working threshold.
///
/// The aggregate is the mean over the full instance x threshold grid, which
/// equals the mean of the per-threshold curve because every instance
/// contributes at every threshold. With no thresholds the curves are empty and
/// the aggregate is NaN; with no instances everything is 0.
pub fn compute_aopc_scores(instances: &[InstanceResult], thresholds: Option<&[f64]>) -> Result<AopcScores> {
    let thresholds = match thresholds {
        Some(t) => normalize_thresholds(t.to_vec()),
        None => derive_thresholds(instances),
    };

    let (comprehensiveness_aopc, comprehensiveness_points) =
        instances_aopc(instances, &thresholds, Perturbation::Comprehensiveness)?;
    let (sufficiency_aopc, sufficiency_points) = instances_aopc(instances, &thresholds, Perturbation::Sufficiency)?;

    tracing::debug!(
        thresholds = thresholds.len(),
        comprehensiveness_aopc,
        sufficiency_aopc,
        "Computed AOPC scores"
    );

    Ok(AopcScores {
        thresholds,
        comprehensiveness_aopc,
        comprehensiveness_points,
        sufficiency_aopc,
        sufficiency_points,
    })
}

fn instances_aopc(instances: &[InstanceResult], thresholds: &[f64], kind: Perturbation) -> Result<(f64, Vec<f64>)> {
    let mut grid: Vec<Vec<f64>> = Vec::with_capacity(instances.len());

    for inst in instances {
        let beta_0 = inst.predicted_score()?;

        let mut reported: Vec<&ThresholdedScore> = inst
            .thresholded_scores
            .iter()
            .flatten()
            .filter(|ts| thresholds.contains(&ts.threshold))
            .collect();
        reported.sort_by(|a, b| a.threshold.total_cmp(&b.threshold));

        let found: Vec<f64> = reported.iter().map(|ts| ts.threshold).collect();
        if found != thresholds {
            return Err(MetricsError::MissingThreshold {
                annotation_id: inst.annotation_id.clone(),
                expected: thresholds.to_vec(),
                found,
            });
        }

        let deltas = reported
            .iter()
            .map(|ts| {
                let beta_k = label_score(kind.thresholded(ts), &inst.classification, || {
                    format!(
                        "{} of '{}' at threshold {}",
                        kind.field_name(),
                        inst.annotation_id,
                        ts.threshold
                    )
                })?;
                Ok(beta_0 - beta_k)
            })
            .collect::<Result<Vec<f64>>>()?;
        grid.push(deltas);
    }

    if thresholds.is_empty() {
        return Ok((f64::NAN, Vec::new()));
    }

    let aopc = mean(grid.iter().flatten().copied());
    let points = (0..thresholds.len())
        .map(|i| mean(grid.iter().map(|row| row[i])))
        .collect();
    Ok((aopc, points))
}

/// Shannon entropy (natural log) of a distribution, normalised to sum to 1
///
/// NaN when the values sum to 0.
pub fn entropy<'a>(probabilities: impl IntoIterator<Item = &'a f64>) -> f64 {
    let values: Vec<f64> = probabilities.into_iter().copied().collect();
    let total: f64 = values.iter().sum();
    if total == 0.0 {
        return f64::NAN;
    }
    -values
        .iter()
        .map(|&v| v / total)
        .filter(|&p| p > 0.0)
        .map(|p| p * p.ln())
        .sum::<f64>()
}

/// `H(original) - H(perturbed)`
pub fn entropy_delta(original: &LabelScores, perturbed: &LabelScores) -> f64 {
    entropy(original.values()) - entropy(perturbed.values())
}

/// KL divergence `KL(perturbed || original)` over the original's labels
///
/// Both distributions are normalised first. A label with perturbed mass but no
/// original mass makes the divergence infinite.
pub fn kl_divergence(original: &LabelScores, perturbed: &LabelScores) -> Result<f64> {
    let mut pairs = Vec::with_capacity(original.len());
    for (label, &p) in original {
        let q = label_score(perturbed, label, || "perturbed scores".to_string())?;
        pairs.push((p, q));
    }

    let p_total: f64 = pairs.iter().map(|(p, _)| p).sum();
    let q_total: f64 = pairs.iter().map(|(_, q)| q).sum();
    if p_total == 0.0 || q_total == 0.0 {
        return Ok(f64::NAN);
    }

    let kl = pairs
        .iter()
        .map(|&(p, q)| {
            let (p, q) = (p / p_total, q / q_total);
            if q == 0.0 {
                0.0
            } else if p == 0.0 {
                f64::INFINITY
            } else {
                q * (q / p).ln()
            }
        })
        .sum();
    Ok(kl)
}

/// Mean confidence drop, entropy change and KL divergence for one perturbation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerturbationSummary {
    /// Mean of `P(predicted | original) - P(predicted | perturbed)`
    pub score: f64,
    pub entropy: f64,
    pub kl: f64,
}

/// Summarise one perturbation over all instances
///
/// Every instance must carry the perturbed scores. No instances gives zeros.
pub fn perturbation_summary(instances: &[InstanceResult], kind: Perturbation) -> Result<PerturbationSummary> {
    let mut deltas = Vec::with_capacity(instances.len());
    let mut entropies = Vec::with_capacity(instances.len());
    let mut kls = Vec::with_capacity(instances.len());

    for inst in instances {
        let perturbed = kind.scores(inst).ok_or_else(|| MetricsError::InconsistentResults {
            field: kind.field_name(),
            annotation_id: inst.annotation_id.clone(),
        })?;
        let context = || format!("{} of '{}'", kind.field_name(), inst.annotation_id);

        deltas.push(inst.predicted_score()? - label_score(perturbed, &inst.classification, context)?);
        entropies.push(entropy_delta(&inst.classification_scores, perturbed));
        kls.push(kl_divergence(&inst.classification_scores, perturbed)?);
    }

    Ok(PerturbationSummary {
        score: mean(deltas),
        entropy: mean(entropies),
        kl: mean(kls),
    })
}
