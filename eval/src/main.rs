// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Rationale evaluation CLI
//!
//! Usage:
//!   eraser-eval --data-dir ./data/movies --split val --results ./movies_val.jsonl
//!   eraser-eval -d ./data/boolq -r ./boolq.jsonl --iou-thresholds 0.1,0.5 --strict

use anyhow::{Context, Result};
use clap::Parser;
use eraser_eval::pipeline::{EvaluationConfig, EvaluationPipeline};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "eraser-eval")]
#[command(about = "Score model rationales against ERASER annotations")]
#[command(version)]
struct Args {
    /// Dataset directory with {split}.jsonl and docs
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Split to evaluate (train, val, test)
    #[arg(short, long, default_value = "test")]
    split: String,

    /// Model results, one JSON record per line
    #[arg(short, long)]
    results: PathBuf,

    /// Write scores as JSON to this file
    #[arg(long)]
    score_file: Option<PathBuf>,

    /// Also write a markdown report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// IOU thresholds for partial-match scoring (comma-separated)
    #[arg(long, default_value = "0.5")]
    iou_thresholds: String,

    /// AOPC thresholds (comma-separated)
    #[arg(long, default_value = "0.01,0.05,0.1,0.2,0.5", conflicts_with = "derive_aopc_thresholds")]
    aopc_thresholds: String,

    /// Use every threshold reported in the results for AOPC
    #[arg(long)]
    derive_aopc_thresholds: bool,

    /// Fail on any structural problem in the results
    #[arg(long)]
    strict: bool,
}

fn parse_thresholds(raw: &str, name: &str) -> Result<Vec<f64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .with_context(|| format!("Invalid {} value '{}'", name, s))
        })
        .collect()
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!("ERASER Rationale Evaluation");
    tracing::info!("===========================");
    tracing::info!("Data: {}", args.data_dir.display());
    tracing::info!("Split: {}", args.split);
    tracing::info!("Results: {}", args.results.display());

    let aopc_thresholds = if args.derive_aopc_thresholds {
        None
    } else {
        Some(parse_thresholds(&args.aopc_thresholds, "AOPC threshold")?)
    };

    let config = EvaluationConfig {
        data_dir: args.data_dir,
        split: args.split,
        results_path: args.results,
        score_file: args.score_file,
        iou_thresholds: parse_thresholds(&args.iou_thresholds, "IOU threshold")?,
        aopc_thresholds,
        strict: args.strict,
    };

    let pipeline = EvaluationPipeline::new(config);
    let results = pipeline.run()?;
    let report = &results.report;

    // Print summary to console
    println!("\n{}", "=".repeat(70));
    println!("EVALUATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!(
        "\nAnnotations scored: {} ({} without results, {} results without annotation)",
        results.annotations_scored, results.annotations_dropped, results.results_dropped
    );

    if let Some(ref iou) = report.iou_scores {
        println!("\nPartial match:");
        println!("{:-<70}", "");
        println!("{:<12} {:>10} {:>10} {:>10} {:>10}", "IOU", "Micro F1", "Macro P", "Macro R", "Macro F1");
        for s in iou {
            println!(
                "{:<12} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
                s.threshold, s.micro.f1, s.macro_.p, s.macro_.r, s.macro_.f1
            );
        }
    }

    for (name, prf) in [("Span", &report.rationale_prf), ("Token", &report.token_prf)] {
        if let Some(prf) = prf {
            println!(
                "{} exact match: P={:.4} R={:.4} F1={:.4} (macro F1={:.4})",
                name, prf.instance_micro.p, prf.instance_micro.r, prf.instance_micro.f1, prf.instance_macro.f1
            );
        }
    }

    for (name, soft) in [("Token", &report.token_soft_metrics), ("Sentence", &report.sentence_soft_metrics)] {
        if let Some(soft) = soft {
            println!(
                "{} soft scores: AUPRC={:.4} AP={:.4} ROC-AUC={:.4}",
                name, soft.auprc, soft.average_precision, soft.roc_auc_score
            );
        }
    }

    if let Some(ref cls) = report.classification_scores {
        println!("\nClassification:");
        println!("{:-<70}", "");
        print!("{}", cls.format());
        println!("{:-<70}", "");
    }

    if let Some(ref path) = results.config.score_file {
        EvaluationPipeline::save_results(&results, path)?;
        println!("\nJSON results saved to: {}", path.display());
    }

    if let Some(ref path) = args.report {
        let markdown = EvaluationPipeline::generate_report(&results);
        std::fs::write(path, markdown).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Markdown report saved to: {}", path.display());
    }

    println!("\nEvaluation complete!");

    Ok(())
}
