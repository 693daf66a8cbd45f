//! Digest — Binary Entrypoint
//! Collects items from configured sources, evaluates them with the judge
//! model, and serves the results.
//!
//! Subcommands mirror the pipeline stages: `collect`, `evaluate`, `run`
//! (collect + evaluate), `serve`.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use digest::collect::{collect_all, ExecLoader, Loader};
use digest::config::{self, DigestConfig};
use digest::judge::{OllamaJudge, RetryPolicy};
use digest::run::{cancel_flag, run_evaluation, RunMode};
use digest::scheduler::SchedulePolicy;
use digest::store::Store;

#[derive(Parser)]
#[command(name = "digest", version, about = "Personal content digest")]
struct Cli {
    /// Path of the item store.
    #[arg(long, env = "DIGEST_STORE", default_value = "digest_data.json")]
    store: PathBuf,

    /// Directory holding base.toml and per-source config directories.
    #[arg(long, env = "DIGEST_SOURCES", default_value = "sources")]
    sources: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run source loaders and merge their items into the store.
    Collect {
        /// Collect only the named source.
        #[arg(long, short)]
        source: Option<String>,
    },
    /// Evaluate deficient items with the judge model.
    Evaluate {
        #[command(flatten)]
        opts: EvaluateOpts,
    },
    /// Collect, then evaluate.
    Run {
        #[command(flatten)]
        opts: EvaluateOpts,
    },
    /// Serve the read-only viewer API.
    Serve {
        #[arg(long, default_value_t = 5000)]
        port: u16,
    },
}

#[derive(clap::Args)]
struct EvaluateOpts {
    /// Number of evaluation passes.
    #[arg(long, default_value_t = 1, conflicts_with = "forever")]
    passes: u32,

    /// Loop until no deficit work remains (or Ctrl-C).
    #[arg(long)]
    forever: bool,

    /// Maximum judge calls per pass.
    #[arg(long)]
    budget: Option<usize>,

    /// Override the configured rounds-per-item target.
    #[arg(long)]
    target_rounds: Option<u32>,

    /// Also re-evaluate settled items.
    #[arg(long)]
    include_settled: bool,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("digest=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op elsewhere. Enables OLLAMA_* overrides.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Command::Collect { source } => {
            let cfg = config::load(&cli.sources)?;
            let mut store = Store::open(&cli.store)?;
            collect(&mut store, &cfg, source.as_deref()).await?;
        }
        Command::Evaluate { opts } => {
            let cfg = config::load(&cli.sources)?;
            let mut store = Store::open(&cli.store)?;
            evaluate(&mut store, &cfg, &opts).await?;
        }
        Command::Run { opts } => {
            let cfg = config::load(&cli.sources)?;
            let mut store = Store::open(&cli.store)?;
            collect(&mut store, &cfg, None).await?;
            evaluate(&mut store, &cfg, &opts).await?;
        }
        Command::Serve { port } => {
            let store = Store::open(&cli.store)?;
            digest::api::serve(store, port).await?;
        }
    }
    Ok(())
}

async fn collect(store: &mut Store, cfg: &DigestConfig, only: Option<&str>) -> Result<()> {
    if let Some(name) = only {
        if cfg.source(name).is_none() {
            let available: Vec<&str> = cfg.sources.iter().map(|s| s.name.as_str()).collect();
            return Err(anyhow!(
                "source {name:?} not found; available: {}",
                available.join(", ")
            ));
        }
    }

    let mut loaders: Vec<Box<dyn Loader>> = Vec::new();
    for source in &cfg.sources {
        if only.is_some_and(|name| name != source.name) {
            continue;
        }
        match &source.loader {
            Some(path) => loaders.push(Box::new(ExecLoader::new(&source.name, path))),
            None => tracing::warn!(source = %source.name, "no loader configured, skipping"),
        }
    }

    collect_all(store, &loaders).await?;
    Ok(())
}

async fn evaluate(store: &mut Store, cfg: &DigestConfig, opts: &EvaluateOpts) -> Result<()> {
    let mut policy = SchedulePolicy::from_settings(&cfg.settings);
    policy.round_budget = opts.budget;
    if let Some(target) = opts.target_rounds {
        policy.target_rounds = target;
    }
    if opts.include_settled {
        policy.skip_settled = false;
    }

    let judge = OllamaJudge::new(&cfg.settings)?;
    let retry = RetryPolicy::from_settings(&cfg.settings);
    let mode = if opts.forever {
        RunMode::Forever
    } else {
        RunMode::Passes(opts.passes)
    };

    // Ctrl-C requests cancellation; the current judge call is allowed to
    // finish or time out on its own.
    let cancel = cancel_flag();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, finishing current work unit");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let summary = run_evaluation(
        store,
        &cfg.prompts_by_source(),
        &judge,
        &policy,
        &retry,
        mode,
        &cancel,
    )
    .await?;

    tracing::info!(
        passes = summary.passes,
        scheduled = summary.scheduled,
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "evaluation summary"
    );
    Ok(())
}
