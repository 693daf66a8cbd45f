//! store.rs — item data model and the durable JSON collection.
//!
//! The store is a single JSON document keyed by `dedup_key`. It is the only
//! durable artifact of the system; evaluation history lives inside each item
//! and is append-only. Writes go through a temp file + rename so a crash can
//! never leave a half-written document behind.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::aggregate::{self, Aggregate};

/// Stable identity for an item: sha256 over `source|link`.
/// Must not change across releases or re-collection would orphan history.
pub fn dedup_key(source: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(link.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Structured judgment returned by the judge model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResponse {
    pub importance_score: f64,
    pub confidence_score: f64,
    pub summary: String,
    pub evaluation: String,
    #[serde(default)]
    pub followup: String,
    /// Internal chain-of-thought; stored for audit, never displayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratchpad: Option<String>,
}

impl JudgeResponse {
    /// Reject out-of-range scores. Non-numeric scores never get this far:
    /// they already fail JSON deserialization.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.importance_score.is_finite() || !(0.0..=100.0).contains(&self.importance_score) {
            return Err(format!(
                "importance_score {} outside [0,100]",
                self.importance_score
            ));
        }
        if !self.confidence_score.is_finite() || !(0.0..=100.0).contains(&self.confidence_score) {
            return Err(format!(
                "confidence_score {} outside [0,100]",
                self.confidence_score
            ));
        }
        Ok(())
    }
}

/// One completed judge invocation. Only fully validated responses are ever
/// stored; a failed or partially parsed round is dropped, not recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub eval_date: DateTime<Utc>,
    /// Judge model/version that produced this round, kept for audit and
    /// future model-upgrade invalidation.
    pub model: String,
    pub response: JudgeResponse,
}

/// A unit of collected content plus its accumulated evaluation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub dedup_key: String,
    pub source: String,
    pub title: String,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<DateTime<Utc>>,
    pub first_collected: DateTime<Utc>,
    pub last_collected: DateTime<Utc>,
    /// Opaque loader payload; the core only serializes it into prompts.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub evals: Vec<Evaluation>,
}

impl Item {
    /// Date used for recency: the item's own creation date when the loader
    /// provided one, otherwise when we first saw it.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.creation_date.unwrap_or(self.first_collected)
    }

    /// Derived aggregate view; recomputed, never persisted.
    pub fn aggregate(&self) -> Aggregate {
        aggregate::aggregate(&self.evals)
    }
}

/// The full item collection, backed by one JSON file.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    items: BTreeMap<String, Item>,
}

impl Store {
    /// Load the collection from `path`. A missing file means a fresh, empty
    /// store; an unreadable or unparseable file is fatal — starting over
    /// silently would destroy history.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let items = match fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("store file {} is corrupt", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading store file {}", path.display()))
            }
        };
        Ok(Self { path, items })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Item> {
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Item> {
        self.items.get_mut(key)
    }

    pub fn insert(&mut self, item: Item) {
        self.items.insert(item.dedup_key.clone(), item);
    }

    /// Iteration in key order, so planning and listings are deterministic.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    /// Atomic persistence: write a sibling temp file, then rename over the
    /// real one. Readers never observe a partial document.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating store directory {}", dir.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(&self.items).context("serializing store")?;
        let tmp = self.path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("creating temp store file {}", tmp.display()))?;
        f.write_all(json.as_bytes())
            .with_context(|| format!("writing temp store file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing store file {}", self.path.display()))?;
        Ok(())
    }
}
