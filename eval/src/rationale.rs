// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Rationale spans as the unit of set comparison
//!
//! A [`Rationale`] is an evidence span flattened together with the annotation
//! it belongs to. Ground truth and predictions are both projected into this
//! form before hard scoring.

use crate::datasets::Annotation;
use crate::results::InstanceResult;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A span tied to one annotation and one document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rationale {
    pub ann_id: String,
    pub docid: String,
    /// Inclusive
    pub start_token: usize,
    /// Exclusive
    pub end_token: usize,
}

impl Rationale {
    pub fn new(ann_id: impl Into<String>, docid: impl Into<String>, start_token: usize, end_token: usize) -> Self {
        Self {
            ann_id: ann_id.into(),
            docid: docid.into(),
            start_token,
            end_token,
        }
    }

    /// Grouping key shared by ground truth and predictions
    pub fn key(&self) -> (&str, &str) {
        (&self.ann_id, &self.docid)
    }

    /// Covered token positions; an inverted span covers nothing
    pub fn token_range(&self) -> Range<usize> {
        self.start_token..self.end_token
    }

    pub fn len(&self) -> usize {
        self.end_token.saturating_sub(self.start_token)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of token positions covered by both spans
    pub fn intersection_len(&self, other: &Self) -> usize {
        let start = self.start_token.max(other.start_token);
        let end = self.end_token.min(other.end_token);
        end.saturating_sub(start)
    }

    /// Intersection over union of the covered token positions, 0 for two empty spans
    pub fn iou(&self, other: &Self) -> f64 {
        let intersection = self.intersection_len(other);
        let union = self.len() + other.len() - intersection;
        if union == 0 {
            return 0.0;
        }
        intersection as f64 / union as f64
    }

    /// Explode into one single-token rationale per covered position
    pub fn to_token_level(&self) -> Vec<Rationale> {
        self.token_range()
            .map(|t| Rationale::new(self.ann_id.clone(), self.docid.clone(), t, t + 1))
            .collect()
    }

    /// Ground-truth rationales of an annotation, one per evidence of every group
    pub fn from_annotation(annotation: &Annotation) -> Vec<Rationale> {
        annotation
            .all_evidences()
            .map(|ev| {
                Rationale::new(
                    annotation.annotation_id.clone(),
                    ev.docid.clone(),
                    ev.start_token,
                    ev.end_token,
                )
            })
            .collect()
    }

    /// Predicted rationales of an instance, one per hard span prediction
    pub fn from_instance(instance: &InstanceResult) -> Vec<Rationale> {
        instance
            .rationales
            .iter()
            .flat_map(|doc| {
                doc.hard_rationale_predictions
                    .iter()
                    .flatten()
                    .map(move |span| {
                        Rationale::new(
                            instance.annotation_id.clone(),
                            doc.docid.clone(),
                            span.start_token,
                            span.end_token,
                        )
                    })
            })
            .collect()
    }
}

/// Token-level projection of a rationale collection
pub fn to_token_level<'a>(rationales: impl IntoIterator<Item = &'a Rationale>) -> Vec<Rationale> {
    rationales.into_iter().flat_map(Rationale::to_token_level).collect()
}
