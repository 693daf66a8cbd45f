//! config.rs — layered TOML configuration for sources and evaluation.
//!
//! Layout on disk mirrors the sources directory:
//!
//! ```text
//! sources/
//!   base.toml            # shared prompt parts + evaluation knobs
//!   arxiv/config.toml    # per-source overrides (loader, prompt parts)
//!   manifund/config.toml
//! ```
//!
//! Each source's effective configuration is a shallow merge of `base.toml`
//! and its own `config.toml`, source keys winning. Secrets and deployment
//! overrides come from the environment ahead of both files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::prompt::PromptTemplate;

pub const ENV_OLLAMA_BASE_URL: &str = "OLLAMA_BASE_URL";
pub const ENV_OLLAMA_MODEL: &str = "OLLAMA_MODEL";
pub const ENV_OLLAMA_RETRIES: &str = "OLLAMA_RETRIES";

/// Evaluation knobs resolved from `base.toml` plus environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub model: String,
    pub base_url: String,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub request_timeout_secs: u64,
    /// Items older than this are frozen out of evaluation; `<= 0` disables
    /// the window.
    pub lookback_days: i64,
    pub target_rounds: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "llama3.2".into(),
            base_url: "http://localhost:11434".into(),
            max_retries: 3,
            retry_delay_secs: 1,
            request_timeout_secs: 60,
            lookback_days: 7,
            target_rounds: 1,
        }
    }
}

/// One source's resolved configuration after the base/source merge.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    /// External loader executable; sources without one are collected by
    /// other means (or are display-only) and skipped at collect time.
    pub loader: Option<PathBuf>,
    pub prompt: PromptTemplate,
}

/// Everything `load` resolves at startup. Config problems are fatal here,
/// before any work begins.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub settings: Settings,
    pub sources: Vec<SourceConfig>,
}

impl DigestConfig {
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Prompt templates keyed by source name, for the evaluation loop.
    pub fn prompts_by_source(&self) -> BTreeMap<String, PromptTemplate> {
        self.sources
            .iter()
            .map(|s| (s.name.clone(), s.prompt.clone()))
            .collect()
    }
}

/// Keys recognized in `base.toml` and per-source `config.toml`. Unknown keys
/// are ignored so loader-specific settings can live in the same file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    loader: Option<String>,
    prompt_header: Option<String>,
    prompt_introduction: Option<String>,
    prompt_container_pre: Option<String>,
    prompt_container_post: Option<String>,
    prompt_criteria: Option<String>,
    prompt_instructions: Option<String>,
    eval_model: Option<String>,
    ollama_base_url: Option<String>,
    max_retries: Option<u32>,
    retry_delay_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    lookback_days: Option<i64>,
    target_rounds: Option<u32>,
}

/// Load `sources/base.toml` plus every `sources/<name>/config.toml`.
/// A missing base file or an unreadable config is a startup error.
pub fn load(sources_dir: &Path) -> Result<DigestConfig> {
    let base_path = sources_dir.join("base.toml");
    let base_table = read_table(&base_path)
        .with_context(|| format!("loading base config {}", base_path.display()))?;

    let settings = resolve_settings(&base_table)?;

    let mut sources = Vec::new();
    let entries = fs::read_dir(sources_dir)
        .with_context(|| format!("reading sources directory {}", sources_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let config_path = entry.path().join("config.toml");
        if !config_path.exists() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let source_table = read_table(&config_path)
            .with_context(|| format!("loading source config {}", config_path.display()))?;
        let merged = merge_tables(&base_table, &source_table);
        let raw: RawConfig = toml::Value::Table(merged)
            .try_into()
            .with_context(|| format!("invalid source config {}", config_path.display()))?;
        sources.push(resolve_source(name, raw));
    }
    sources.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(DigestConfig { settings, sources })
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Shallow merge: source keys override base keys wholesale. Nested tables
/// are replaced, not merged, which keeps override semantics predictable.
fn merge_tables(base: &toml::Table, source: &toml::Table) -> toml::Table {
    let mut merged = base.clone();
    for (k, v) in source {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn resolve_settings(base_table: &toml::Table) -> Result<Settings> {
    let raw: RawConfig = toml::Value::Table(base_table.clone())
        .try_into()
        .context("invalid base config")?;
    let defaults = Settings::default();

    let mut settings = Settings {
        model: raw.eval_model.unwrap_or(defaults.model),
        base_url: raw.ollama_base_url.unwrap_or(defaults.base_url),
        max_retries: raw.max_retries.unwrap_or(defaults.max_retries),
        retry_delay_secs: raw.retry_delay_secs.unwrap_or(defaults.retry_delay_secs),
        request_timeout_secs: raw
            .request_timeout_secs
            .unwrap_or(defaults.request_timeout_secs),
        lookback_days: raw.lookback_days.unwrap_or(defaults.lookback_days),
        target_rounds: raw.target_rounds.unwrap_or(defaults.target_rounds),
    };

    // Environment wins over both config layers.
    if let Ok(v) = std::env::var(ENV_OLLAMA_BASE_URL) {
        settings.base_url = v;
    }
    if let Ok(v) = std::env::var(ENV_OLLAMA_MODEL) {
        settings.model = v;
    }
    if let Ok(v) = std::env::var(ENV_OLLAMA_RETRIES) {
        settings.max_retries = v
            .parse()
            .map_err(|_| anyhow!("{ENV_OLLAMA_RETRIES} must be an integer, got {v:?}"))?;
    }

    Ok(settings)
}

fn resolve_source(name: String, raw: RawConfig) -> SourceConfig {
    SourceConfig {
        name,
        loader: raw.loader.map(PathBuf::from),
        prompt: PromptTemplate {
            header: raw.prompt_header,
            introduction: raw.prompt_introduction,
            container_pre: raw.prompt_container_pre,
            container_post: raw.prompt_container_post,
            criteria: raw.prompt_criteria,
            instructions: raw.prompt_instructions,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_sources(dir: &Path) {
        fs::write(
            dir.join("base.toml"),
            r#"
prompt_header = "You are a triage assistant."
prompt_criteria = "Base criteria."
eval_model = "llama3.2"
lookback_days = 7
target_rounds = 3
"#,
        )
        .unwrap();
        fs::create_dir(dir.join("arxiv")).unwrap();
        fs::write(
            dir.join("arxiv").join("config.toml"),
            r#"
loader = "sources/arxiv/arxiv.py"
prompt_criteria = "Arxiv criteria."
arxiv_categories = ["stat.AP"]
"#,
        )
        .unwrap();
    }

    #[serial_test::serial]
    #[test]
    fn source_overrides_base_and_base_fills_gaps() {
        std::env::remove_var(ENV_OLLAMA_BASE_URL);
        std::env::remove_var(ENV_OLLAMA_MODEL);
        std::env::remove_var(ENV_OLLAMA_RETRIES);

        let tmp = tempfile::tempdir().unwrap();
        write_sources(tmp.path());

        let cfg = load(tmp.path()).unwrap();
        assert_eq!(cfg.settings.model, "llama3.2");
        assert_eq!(cfg.settings.target_rounds, 3);

        let arxiv = cfg.source("arxiv").unwrap();
        assert_eq!(
            arxiv.loader.as_deref(),
            Some(Path::new("sources/arxiv/arxiv.py"))
        );
        // Overridden by the source file:
        assert_eq!(arxiv.prompt.criteria.as_deref(), Some("Arxiv criteria."));
        // Inherited from base:
        assert_eq!(
            arxiv.prompt.header.as_deref(),
            Some("You are a triage assistant.")
        );
    }

    #[serial_test::serial]
    #[test]
    fn environment_beats_both_config_layers() {
        let tmp = tempfile::tempdir().unwrap();
        write_sources(tmp.path());

        std::env::set_var(ENV_OLLAMA_MODEL, "qwen3");
        std::env::set_var(ENV_OLLAMA_RETRIES, "5");
        let cfg = load(tmp.path()).unwrap();
        std::env::remove_var(ENV_OLLAMA_MODEL);
        std::env::remove_var(ENV_OLLAMA_RETRIES);

        assert_eq!(cfg.settings.model, "qwen3");
        assert_eq!(cfg.settings.max_retries, 5);
    }

    #[serial_test::serial]
    #[test]
    fn missing_base_config_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("base config"), "got: {err}");
    }
}
