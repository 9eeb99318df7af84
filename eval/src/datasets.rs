// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Ground-truth loading for ERASER-style rationale datasets
//!
//! A dataset directory holds one annotation file per split (`train.jsonl`,
//! `val.jsonl`, `test.jsonl`) and the documents, either as a single
//! `docs.jsonl` or as a `docs/` directory with one file per docid.
//! Documents are newline-separated sentences of space-joined tokens.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Splits shipped with every ERASER dataset
pub const SPLITS: [&str; 3] = ["train", "val", "test"];

/// One human-annotated evidence span
///
/// `(docid, start_token, end_token)` is the canonical identity of the span;
/// the sentence range is a best-effort convenience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Some representation of the evidence text
    #[serde(default)]
    pub text: serde_json::Value,
    pub docid: String,
    /// Inclusive
    pub start_token: usize,
    /// Exclusive
    pub end_token: usize,
    #[serde(default, deserialize_with = "sentence_index")]
    pub start_sentence: Option<usize>,
    #[serde(default, deserialize_with = "sentence_index")]
    pub end_sentence: Option<usize>,
}

impl Evidence {
    pub fn new(docid: impl Into<String>, start_token: usize, end_token: usize) -> Self {
        Self {
            text: serde_json::Value::Null,
            docid: docid.into(),
            start_token,
            end_token,
            start_sentence: None,
            end_sentence: None,
        }
    }

    pub fn with_sentences(mut self, start_sentence: usize, end_sentence: usize) -> Self {
        self.start_sentence = Some(start_sentence);
        self.end_sentence = Some(end_sentence);
        self
    }

    /// Sentence range, when both ends are known
    pub fn sentence_range(&self) -> Option<(usize, usize)> {
        self.start_sentence.zip(self.end_sentence)
    }
}

/// Negative sentence indices mark "unknown" in the raw data
fn sentence_index<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<i64> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|v| usize::try_from(v).ok()))
}

/// A ground-truth annotation: one query, its label and its evidence groups
///
/// Each evidence group is sufficient on its own to justify the label; several
/// groups usually come from several annotators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub annotation_id: String,
    #[serde(default)]
    pub query: serde_json::Value,
    pub evidences: Vec<Vec<Evidence>>,
    pub classification: String,
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub docids: Option<Vec<String>>,
}

impl Annotation {
    pub fn new(
        annotation_id: impl Into<String>,
        classification: impl Into<String>,
        evidences: Vec<Vec<Evidence>>,
    ) -> Self {
        Self {
            annotation_id: annotation_id.into(),
            query: serde_json::Value::Null,
            evidences,
            classification: classification.into(),
            query_type: None,
            docids: None,
        }
    }

    /// Every evidence across all groups
    pub fn all_evidences(&self) -> impl Iterator<Item = &Evidence> {
        self.evidences.iter().flatten()
    }

    /// Distinct docids cited by the evidences
    pub fn cited_docids(&self) -> BTreeSet<&str> {
        self.all_evidences().map(|ev| ev.docid.as_str()).collect()
    }

    /// Documents a prediction may legitimately refer to
    pub fn allowed_docids(&self) -> BTreeSet<&str> {
        match &self.docids {
            Some(docids) => docids.iter().map(String::as_str).collect(),
            None => self.cited_docids(),
        }
    }
}

/// Tokenised documents: docid -> sentences -> tokens
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Documents {
    docs: BTreeMap<String, Vec<Vec<String>>>,
}

impl Documents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document from raw text
    pub fn insert_text(&mut self, docid: impl Into<String>, text: &str) {
        self.docs.insert(docid.into(), tokenize(text));
    }

    /// Add an already tokenised document
    pub fn insert_sentences(&mut self, docid: impl Into<String>, sentences: Vec<Vec<String>>) {
        self.docs.insert(docid.into(), sentences);
    }

    pub fn sentences(&self, docid: &str) -> Option<&[Vec<String>]> {
        self.docs.get(docid).map(Vec::as_slice)
    }

    /// Flattened token sequence of a document
    pub fn tokens(&self, docid: &str) -> Option<Vec<&str>> {
        self.docs
            .get(docid)
            .map(|sents| sents.iter().flatten().map(String::as_str).collect())
    }

    pub fn token_count(&self, docid: &str) -> Option<usize> {
        self.docs.get(docid).map(|sents| sents.iter().map(Vec::len).sum())
    }

    pub fn sentence_count(&self, docid: &str) -> Option<usize> {
        self.docs.get(docid).map(Vec::len)
    }

    pub fn contains(&self, docid: &str) -> bool {
        self.docs.contains_key(docid)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Load documents from a dataset directory
    ///
    /// With `docids` set, only those documents are read; otherwise all of them.
    pub fn load(data_dir: &Path, docids: Option<&BTreeSet<String>>) -> Result<Self> {
        let docs_file = data_dir.join("docs.jsonl");
        let docs_dir = data_dir.join("docs");

        if docs_file.exists() {
            if docs_dir.exists() {
                bail!(
                    "Both {} and {} exist; refusing to guess which to use",
                    docs_file.display(),
                    docs_dir.display()
                );
            }
            return Self::load_from_file(&docs_file, docids);
        }

        let wanted: Vec<String> = match docids {
            Some(ids) => ids.iter().cloned().collect(),
            None => {
                let mut ids = Vec::new();
                let entries = std::fs::read_dir(&docs_dir)
                    .with_context(|| format!("Failed to list documents in {}", docs_dir.display()))?;
                for entry in entries {
                    let entry = entry?;
                    ids.push(entry.file_name().to_string_lossy().to_string());
                }
                ids.sort();
                ids
            }
        };

        let mut documents = Self::new();
        for docid in wanted {
            let path = docs_dir.join(&docid);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read document: {}", path.display()))?;
            documents.insert_text(docid, &text);
        }

        tracing::debug!("Loaded {} documents from {}", documents.len(), docs_dir.display());
        Ok(documents)
    }

    fn load_from_file(path: &Path, docids: Option<&BTreeSet<String>>) -> Result<Self> {
        #[derive(Deserialize)]
        struct RawDocument {
            docid: String,
            document: String,
        }

        let raw: Vec<RawDocument> = load_jsonl(path)?;
        let mut documents = Self::new();
        for doc in raw {
            if docids.map_or(true, |ids| ids.contains(&doc.docid)) {
                documents.insert_text(doc.docid, &doc.document);
            }
        }

        if let Some(ids) = docids {
            if let Some(missing) = ids.iter().find(|id| !documents.contains(id)) {
                bail!("Document '{}' not present in {}", missing, path.display());
            }
        }

        tracing::debug!("Loaded {} documents from {}", documents.len(), path.display());
        Ok(documents)
    }
}

/// Split raw document text into non-empty sentences of whitespace tokens
fn tokenize(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .collect()
}

/// Validate a split name
pub fn check_split(split: &str) -> Result<()> {
    if !SPLITS.contains(&split) {
        bail!("Invalid split '{}': expected one of {:?}", split, SPLITS);
    }
    Ok(())
}

/// Read a JSON Lines file, one record per non-blank line
///
/// Lines that fail to parse are logged and skipped.
pub fn load_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {} in {}", idx + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("Skipping malformed line {} in {}: {}", idx + 1, path.display(), e);
            }
        }
    }

    Ok(records)
}

/// Load the annotations of one split
pub fn load_annotations(data_dir: &Path, split: &str) -> Result<Vec<Annotation>> {
    check_split(split)?;
    let path = data_dir.join(format!("{}.jsonl", split));
    let annotations: Vec<Annotation> = load_jsonl(&path)?;

    let mut seen = BTreeSet::new();
    for ann in &annotations {
        if !seen.insert(ann.annotation_id.as_str()) {
            bail!("Duplicate annotation id '{}' in {}", ann.annotation_id, path.display());
        }
    }

    tracing::info!("Loaded {} annotations from {}", annotations.len(), path.display());
    Ok(annotations)
}
