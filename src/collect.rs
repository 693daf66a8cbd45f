//! collect.rs — loaders and the collection merge engine.
//!
//! Loaders are external executables that print a JSON array of raw items on
//! stdout. A loader that exits non-zero or prints invalid JSON is logged and
//! skipped; the other sources' items still merge. Merging never discards
//! evaluation history, and items that age out of a source's feed stay in the
//! store.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::store::{dedup_key, Item, Store};

/// One freshly fetched item as a loader emits it. `creation_date` accepts
/// ISO-8601 with or without an offset; loaders in the wild produce both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source: String,
    pub title: String,
    pub link: String,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: serde_json::Value,
}

fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_datetime))
}

/// Accept RFC 3339 (`...Z` / `...+02:00`) or a bare local-less timestamp,
/// which we take as UTC. Unparseable dates become `None` rather than failing
/// the whole item; recency then falls back to first-collected time.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

/// A thing that yields raw items. Implemented by the external-process loader
/// in production and by in-process fakes in tests.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RawItem>>;
    fn name(&self) -> &str;
}

/// Runs a source's loader executable and parses its stdout. Stderr is passed
/// through to the log at debug level.
pub struct ExecLoader {
    name: String,
    path: PathBuf,
}

impl ExecLoader {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl Loader for ExecLoader {
    async fn fetch(&self) -> Result<Vec<RawItem>> {
        let output = tokio::process::Command::new(&self.path)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running loader {}", self.path.display()))?;

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            if !line.trim().is_empty() {
                tracing::debug!(loader = %self.name, "{line}");
            }
        }

        if !output.status.success() {
            return Err(anyhow!(
                "loader {} exited with {}",
                self.path.display(),
                output.status
            ));
        }

        parse_loader_output(&output.stdout)
            .with_context(|| format!("parsing output of loader {}", self.path.display()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Loader stdout contract: a JSON array of items, or a single item object.
fn parse_loader_output(stdout: &[u8]) -> Result<Vec<RawItem>> {
    let value: serde_json::Value = serde_json::from_slice(stdout).context("invalid JSON")?;
    match value {
        serde_json::Value::Array(_) => {
            serde_json::from_value(value).context("invalid item array")
        }
        _ => Ok(vec![serde_json::from_value(value).context("invalid item")?]),
    }
}

/// Counters for one merge, reported in the collect log line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub fetched: usize,
    pub new_items: usize,
    pub updated: usize,
    pub batch_duplicates: usize,
    pub failed_sources: usize,
}

/// Merge freshly fetched items into the store.
///
/// New keys are inserted with empty history and both collection timestamps
/// set to `now`. Known keys refresh display fields and `last_collected` while
/// `evals`, `first_collected` and the key itself stay untouched. Duplicates
/// within the batch collapse to the first occurrence.
pub fn merge_into(store: &mut Store, fetched: Vec<RawItem>, now: DateTime<Utc>) -> MergeStats {
    let mut stats = MergeStats {
        fetched: fetched.len(),
        ..Default::default()
    };
    let mut seen = std::collections::HashSet::new();

    for raw in fetched {
        let key = dedup_key(&raw.source, &raw.link);
        if !seen.insert(key.clone()) {
            stats.batch_duplicates += 1;
            continue;
        }
        match store.get_mut(&key) {
            Some(item) => {
                item.title = raw.title;
                item.link = raw.link;
                item.creation_date = raw.creation_date.or(item.creation_date);
                item.input = raw.input;
                item.last_collected = now;
                stats.updated += 1;
            }
            None => {
                store.insert(Item {
                    dedup_key: key,
                    source: raw.source,
                    title: raw.title,
                    link: raw.link,
                    creation_date: raw.creation_date,
                    first_collected: now,
                    last_collected: now,
                    input: raw.input,
                    evals: Vec::new(),
                });
                stats.new_items += 1;
            }
        }
    }
    stats
}

/// Run every loader, merge what succeeded, persist the store. Per-loader
/// failure is normal partial-success, not a run error; only a store write
/// failure propagates.
pub async fn collect_all(store: &mut Store, loaders: &[Box<dyn Loader>]) -> Result<MergeStats> {
    let mut raw = Vec::new();
    let mut failed_sources = 0usize;
    for loader in loaders {
        match loader.fetch().await {
            Ok(mut items) => {
                tracing::info!(source = loader.name(), count = items.len(), "collected");
                raw.append(&mut items);
            }
            Err(e) => {
                tracing::warn!(source = loader.name(), error = ?e, "loader failed, skipping");
                failed_sources += 1;
            }
        }
    }

    let mut stats = merge_into(store, raw, Utc::now());
    stats.failed_sources = failed_sources;
    store.save().context("persisting store after merge")?;
    tracing::info!(
        fetched = stats.fetched,
        new_items = stats.new_items,
        updated = stats.updated,
        duplicates = stats.batch_duplicates,
        failed_sources = stats.failed_sources,
        total = store.len(),
        "merge complete"
    );
    Ok(stats)
}
