// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! End-to-end rationale evaluation of one dataset split
//!
//! Orchestrates:
//! - Loading annotations, documents and model results
//! - Structural verification of the results
//! - Hard, soft and classification scoring
//! - Results serialization and markdown reporting

use crate::classification::{score_classifications, ClassificationScores};
use crate::datasets::{load_annotations, Annotation, Documents};
use crate::error;
use crate::metrics::{partial_match_score, score_hard_rationale_predictions, InstanceScores, PartialMatchScore};
use crate::rationale::{to_token_level, Rationale};
use crate::results::{load_results, verify_results, InstanceResult, ResultFeatures};
use crate::soft_scores::{score_soft_tokens, Granularity, PositionScoredDocument, SoftScores};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Configuration for the evaluation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Dataset directory holding `{split}.jsonl` and the documents
    pub data_dir: PathBuf,
    /// Which split to evaluate on ("train", "val", "test")
    pub split: String,
    /// Model results, one JSON record per annotation
    pub results_path: PathBuf,
    /// Where to write the scores as JSON
    pub score_file: Option<PathBuf>,
    /// IOU thresholds for partial-match scoring
    pub iou_thresholds: Vec<f64>,
    /// AOPC deletion thresholds; `None` derives them from the results
    pub aopc_thresholds: Option<Vec<f64>>,
    /// Abort on any structural problem in the results
    pub strict: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            split: "test".to_string(),
            results_path: PathBuf::from("results.jsonl"),
            score_file: None,
            iou_thresholds: vec![0.5],
            aopc_thresholds: Some(vec![0.01, 0.05, 0.1, 0.2, 0.5]),
            strict: false,
        }
    }
}

/// Every metric family that applies to a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub iou_scores: Option<Vec<PartialMatchScore>>,
    pub rationale_prf: Option<InstanceScores>,
    pub token_prf: Option<InstanceScores>,
    pub token_soft_metrics: Option<SoftScores>,
    pub sentence_soft_metrics: Option<SoftScores>,
    pub classification_scores: Option<ClassificationScores>,
}

impl EvaluationReport {
    /// Score results against ground truth
    ///
    /// Which families are computed depends on what the results carry. Every
    /// annotation must have a result.
    pub fn compute(
        instances: &[InstanceResult],
        annotations: &[Annotation],
        docs: &Documents,
        iou_thresholds: &[f64],
        aopc_thresholds: Option<&[f64]>,
    ) -> error::Result<Self> {
        let features = ResultFeatures::detect(instances)?;
        let mut report = Self::default();

        if features.hard_predictions {
            let truth: Vec<Rationale> = annotations.iter().flat_map(Rationale::from_annotation).collect();
            let pred: Vec<Rationale> = instances.iter().flat_map(Rationale::from_instance).collect();

            report.iou_scores = Some(partial_match_score(&truth, &pred, iou_thresholds));
            report.rationale_prf = Some(score_hard_rationale_predictions(&truth, &pred));
            report.token_prf = Some(score_hard_rationale_predictions(
                &to_token_level(&truth),
                &to_token_level(&pred),
            ));
        }

        if features.soft_token_predictions {
            let paired = PositionScoredDocument::from_results(instances, annotations, docs, Granularity::Token)?;
            report.token_soft_metrics = Some(score_soft_tokens(&paired)?);
        }

        if features.soft_sentence_predictions {
            let paired = PositionScoredDocument::from_results(instances, annotations, docs, Granularity::Sentence)?;
            report.sentence_soft_metrics = Some(score_soft_tokens(&paired)?);
        }

        if !instances.is_empty() {
            report.classification_scores =
                Some(score_classifications(instances, annotations, docs, aopc_thresholds)?);
        }

        Ok(report)
    }
}

/// Complete evaluation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub config: EvaluationConfig,
    pub report: EvaluationReport,
    /// Annotations that had a result and were scored
    pub annotations_scored: usize,
    /// Annotations dropped for lack of a result
    pub annotations_dropped: usize,
    pub results_loaded: usize,
    /// Results dropped because no annotation of the split matches them
    pub results_dropped: usize,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Main evaluation pipeline
pub struct EvaluationPipeline {
    config: EvaluationConfig,
}

impl EvaluationPipeline {
    pub fn new(config: EvaluationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Load everything from disk and evaluate
    pub fn run(&self) -> Result<EvaluationResults> {
        let annotations = load_annotations(&self.config.data_dir, &self.config.split)?;

        let docids: BTreeSet<String> = annotations
            .iter()
            .flat_map(|ann| ann.allowed_docids())
            .map(str::to_string)
            .collect();
        let docs = Documents::load(&self.config.data_dir, Some(&docids))?;
        tracing::info!("Loaded {} documents from {}", docs.len(), self.config.data_dir.display());

        let instances = load_results(&self.config.results_path)?;

        self.evaluate(&annotations, &docs, &instances)
    }

    /// Evaluate already-loaded inputs
    ///
    /// Annotations without a result, and results without an annotation, are
    /// dropped with a warning. Structural problems in the results are logged,
    /// or abort the run in strict mode.
    pub fn evaluate(
        &self,
        annotations: &[Annotation],
        docs: &Documents,
        instances: &[InstanceResult],
    ) -> Result<EvaluationResults> {
        let problems = verify_results(instances, annotations, docs);
        if !problems.is_empty() {
            for problem in &problems {
                tracing::warn!("{}", problem);
            }
            if self.config.strict {
                bail!(
                    "Found {} problem(s) in {}, first: {}",
                    problems.len(),
                    self.config.results_path.display(),
                    problems[0]
                );
            }
        }

        let result_ids: BTreeSet<&str> = instances.iter().map(|inst| inst.annotation_id.as_str()).collect();
        let scored: Vec<Annotation> = annotations
            .iter()
            .filter(|ann| result_ids.contains(ann.annotation_id.as_str()))
            .cloned()
            .collect();
        let dropped = annotations.len() - scored.len();
        if dropped > 0 {
            tracing::warn!(
                "Dropping {} of {} annotations that have no result",
                dropped,
                annotations.len()
            );
        }

        let annotation_ids: BTreeSet<&str> = annotations.iter().map(|ann| ann.annotation_id.as_str()).collect();
        let matched: Vec<InstanceResult> = instances
            .iter()
            .filter(|inst| annotation_ids.contains(inst.annotation_id.as_str()))
            .cloned()
            .collect();
        let results_dropped = instances.len() - matched.len();
        if results_dropped > 0 {
            tracing::warn!(
                "Dropping {} of {} results that match no annotation in the '{}' split",
                results_dropped,
                instances.len(),
                self.config.split
            );
        }

        let aopc_thresholds = self.config.aopc_thresholds.as_deref();
        let report = EvaluationReport::compute(&matched, &scored, docs, &self.config.iou_thresholds, aopc_thresholds)
            .context("Failed to score results")?;

        if let Some(ref cls) = report.classification_scores {
            tracing::info!("Classification accuracy: {:.4}", cls.accuracy);
        }
        if let Some(ref prf) = report.token_prf {
            tracing::info!("Token-level rationale F1: {:.4}", prf.instance_macro.f1);
        }

        Ok(EvaluationResults {
            config: self.config.clone(),
            report,
            annotations_scored: scored.len(),
            annotations_dropped: dropped,
            results_loaded: instances.len(),
            results_dropped,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Save results to JSON file
    pub fn save_results(results: &EvaluationResults, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(output_path, json).with_context(|| format!("Failed to write {}", output_path.display()))?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }

    /// Generate a markdown report
    pub fn generate_report(results: &EvaluationResults) -> String {
        let mut report = String::new();

        report.push_str("# Rationale Evaluation Report\n\n");
        report.push_str(&format!("**Generated:** {}\n\n", results.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", results.version));

        report.push_str("## Dataset\n\n");
        report.push_str(&format!("- **Data Dir:** {}\n", results.config.data_dir.display()));
        report.push_str(&format!("- **Split:** {}\n", results.config.split));
        report.push_str(&format!("- **Results:** {}\n", results.config.results_path.display()));
        report.push_str(&format!(
            "- **Annotations Scored:** {} ({} dropped, {} results loaded, {} unmatched)\n\n",
            results.annotations_scored, results.annotations_dropped, results.results_loaded, results.results_dropped
        ));

        let r = &results.report;

        if r.rationale_prf.is_some() || r.token_prf.is_some() {
            report.push_str("## Hard Rationales\n\n");
            report.push_str("| Level | Micro P | Micro R | Micro F1 | Macro P | Macro R | Macro F1 |\n");
            report.push_str("|-------|---------|---------|----------|---------|---------|----------|\n");
            for (level, scores) in [("Span", &r.rationale_prf), ("Token", &r.token_prf)] {
                if let Some(s) = scores {
                    report.push_str(&format!(
                        "| {} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} |\n",
                        level,
                        s.instance_micro.p,
                        s.instance_micro.r,
                        s.instance_micro.f1,
                        s.instance_macro.p,
                        s.instance_macro.r,
                        s.instance_macro.f1
                    ));
                }
            }
            report.push('\n');
        }

        if let Some(ref iou) = r.iou_scores {
            report.push_str("### Partial Match (IOU)\n\n");
            report.push_str("| Threshold | Micro F1 | Macro P | Macro R | Macro F1 |\n");
            report.push_str("|-----------|----------|---------|---------|----------|\n");
            for s in iou {
                report.push_str(&format!(
                    "| {} | {:.4} | {:.4} | {:.4} | {:.4} |\n",
                    s.threshold, s.micro.f1, s.macro_.p, s.macro_.r, s.macro_.f1
                ));
            }
            report.push('\n');
        }

        if r.token_soft_metrics.is_some() || r.sentence_soft_metrics.is_some() {
            report.push_str("## Soft Rationales\n\n");
            report.push_str("| Level | AUPRC | Average Precision | ROC-AUC |\n");
            report.push_str("|-------|-------|-------------------|---------|\n");
            for (level, scores) in [("Token", &r.token_soft_metrics), ("Sentence", &r.sentence_soft_metrics)] {
                if let Some(s) = scores {
                    report.push_str(&format!(
                        "| {} | {:.4} | {:.4} | {:.4} |\n",
                        level, s.auprc, s.average_precision, s.roc_auc_score
                    ));
                }
            }
            report.push('\n');
        }

        if let Some(ref cls) = r.classification_scores {
            report.push_str("## Classification\n\n");
            report.push_str(&format!("```\n{}\n```\n\n", cls.format()));

            if let Some(ref thresholds) = cls.aopc_thresholds {
                report.push_str("### AOPC Curves\n\n");
                report.push_str("| Threshold | Comprehensiveness | Sufficiency |\n");
                report.push_str("|-----------|-------------------|-------------|\n");
                let comp = cls.comprehensiveness_aopc_points.as_deref().unwrap_or_default();
                let suff = cls.sufficiency_aopc_points.as_deref().unwrap_or_default();
                for (i, t) in thresholds.iter().enumerate() {
                    let cell = |points: &[f64]| points.get(i).map_or("-".to_string(), |v| format!("{:.4}", v));
                    report.push_str(&format!("| {} | {} | {} |\n", t, cell(comp), cell(suff)));
                }
                report.push('\n');
            }
        }

        report.push_str("## Configuration\n\n");
        report.push_str(&format!(
            "```json\n{}\n```\n",
            serde_json::to_string_pretty(&results.config).unwrap_or_default()
        ));

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Evidence;
    use crate::results::{label_scores, DocumentPrediction, SpanPrediction};
    use tempfile::TempDir;

    fn docs() -> Documents {
        let mut docs = Documents::new();
        docs.insert_text("d1", "the film was great\nreally great acting");
        docs.insert_text("d2", "a dull plot\nand bad pacing");
        docs
    }

    fn annotations() -> Vec<Annotation> {
        vec![
            Annotation::new("a1", "POS", vec![vec![Evidence::new("d1", 3, 4).with_sentences(0, 1)]]),
            Annotation::new("a2", "NEG", vec![vec![Evidence::new("d2", 1, 3).with_sentences(0, 1)]]),
        ]
    }

    fn instance(id: &str, label: &str, docid: &str, span: (usize, usize), soft: Vec<f64>) -> InstanceResult {
        let other = if label == "POS" { "NEG" } else { "POS" };
        let mut inst = InstanceResult::new(id, label, [(label, 0.9), (other, 0.1)]);
        inst.rationales = vec![DocumentPrediction {
            hard_rationale_predictions: Some(vec![SpanPrediction::new(span.0, span.1)]),
            soft_rationale_predictions: Some(soft),
            ..DocumentPrediction::new(docid)
        }];
        inst.comprehensiveness_classification_scores = Some(label_scores([(label, 0.4), (other, 0.6)]));
        inst
    }

    fn instances() -> Vec<InstanceResult> {
        vec![
            instance("a1", "POS", "d1", (3, 4), vec![0.1, 0.1, 0.2, 0.9, 0.3, 0.4, 0.1]),
            instance("a2", "NEG", "d2", (1, 2), vec![0.1, 0.8, 0.7, 0.2, 0.1, 0.3]),
        ]
    }

    #[test]
    fn test_evaluate_full_report() {
        let pipeline = EvaluationPipeline::new(EvaluationConfig::default());
        let results = pipeline.evaluate(&annotations(), &docs(), &instances()).unwrap();
        let report = &results.report;

        assert_eq!(results.annotations_scored, 2);
        assert_eq!(results.annotations_dropped, 0);

        // a1 matches exactly, a2 predicts half of its span
        let rationale_prf = report.rationale_prf.unwrap();
        assert!((rationale_prf.instance_micro.p - 0.5).abs() < 1e-6);

        let token_prf = report.token_prf.unwrap();
        assert!((token_prf.instance_micro.p - 1.0).abs() < 1e-6);
        assert!((token_prf.instance_micro.r - 2.0 / 3.0).abs() < 1e-6);

        let iou = report.iou_scores.as_ref().unwrap();
        assert_eq!(iou.len(), 1);
        assert!((iou[0].micro.f1 - 1.0).abs() < 1e-6);

        let soft = report.token_soft_metrics.unwrap();
        assert!((soft.auprc - 1.0).abs() < 1e-6);
        assert!(report.sentence_soft_metrics.is_none());

        let cls = report.classification_scores.as_ref().unwrap();
        assert!((cls.accuracy - 1.0).abs() < 1e-6);
        assert!((cls.comprehensiveness.unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_evaluate_drops_annotations_without_results() {
        let pipeline = EvaluationPipeline::new(EvaluationConfig::default());
        let results = pipeline.evaluate(&annotations(), &docs(), &instances()[..1]).unwrap();

        assert_eq!(results.annotations_scored, 1);
        assert_eq!(results.annotations_dropped, 1);
        let cls = results.report.classification_scores.unwrap();
        assert_eq!(cls.prf.per_class.len(), 1);
    }

    #[test]
    fn test_evaluate_drops_results_without_annotation() {
        let mut results = instances();
        results.push(instance("zz", "NEG", "dz", (0, 1), vec![0.4, 0.6]));

        let lenient = EvaluationPipeline::new(EvaluationConfig::default());
        let evaluated = lenient.evaluate(&annotations(), &docs(), &results).unwrap();
        assert_eq!(evaluated.results_loaded, 3);
        assert_eq!(evaluated.results_dropped, 1);
        assert_eq!(evaluated.annotations_scored, 2);
        assert!((evaluated.report.token_soft_metrics.unwrap().auprc - 1.0).abs() < 1e-6);

        let strict = EvaluationPipeline::new(EvaluationConfig {
            strict: true,
            ..EvaluationConfig::default()
        });
        assert!(strict.evaluate(&annotations(), &docs(), &results).is_err());
    }

    #[test]
    fn test_strict_mode_rejects_problems() {
        let mut bad = instances();
        bad[0].rationales[0].soft_rationale_predictions = Some(vec![0.5; 3]);

        let lenient = EvaluationPipeline::new(EvaluationConfig::default());
        assert!(lenient.evaluate(&annotations(), &docs(), &bad).is_err());

        bad[0].rationales[0].soft_rationale_predictions = Some(vec![0.5; 7]);
        bad[1].rationales[0].hard_rationale_predictions = Some(vec![SpanPrediction::new(4, 40)]);
        assert!(lenient.evaluate(&annotations(), &docs(), &bad).is_ok());

        let strict = EvaluationPipeline::new(EvaluationConfig {
            strict: true,
            ..EvaluationConfig::default()
        });
        assert!(strict.evaluate(&annotations(), &docs(), &bad).is_err());
    }

    #[test]
    fn test_run_from_disk_and_save() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("movies");
        std::fs::create_dir_all(data_dir.join("docs")).unwrap();
        std::fs::write(data_dir.join("docs").join("d1"), "the film was great\nreally great acting").unwrap();
        std::fs::write(data_dir.join("docs").join("d2"), "a dull plot\nand bad pacing").unwrap();

        let lines: Vec<String> = annotations().iter().map(|a| serde_json::to_string(a).unwrap()).collect();
        std::fs::write(data_dir.join("val.jsonl"), lines.join("\n")).unwrap();

        let results_path = dir.path().join("results.jsonl");
        let lines: Vec<String> = instances().iter().map(|i| serde_json::to_string(i).unwrap()).collect();
        std::fs::write(&results_path, lines.join("\n")).unwrap();

        let config = EvaluationConfig {
            data_dir,
            split: "val".to_string(),
            results_path,
            ..EvaluationConfig::default()
        };
        let results = EvaluationPipeline::new(config).run().unwrap();
        assert_eq!(results.results_loaded, 2);

        let out = dir.path().join("out").join("scores.json");
        EvaluationPipeline::save_results(&results, &out).unwrap();
        let saved: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert!(saved["report"]["classification_scores"]["prf"]["macro avg"].is_object());
        assert!(saved["report"]["iou_scores"][0]["macro"].is_object());
    }

    #[test]
    fn test_generate_report() {
        let pipeline = EvaluationPipeline::new(EvaluationConfig::default());
        let results = pipeline.evaluate(&annotations(), &docs(), &instances()).unwrap();

        let report = EvaluationPipeline::generate_report(&results);

        assert!(report.contains("Rationale Evaluation Report"));
        assert!(report.contains("Hard Rationales"));
        assert!(report.contains("Partial Match"));
        assert!(report.contains("Soft Rationales"));
        assert!(report.contains("Accuracy"));
        assert!(!report.contains("AOPC Curves"));
    }
}
