//! run.rs — drives evaluation passes: schedule, judge, persist, repeat.
//!
//! The store is saved after every single work unit, so a crash loses at most
//! the in-flight round. Per-item judge failures are counted, never fatal;
//! only store corruption, config errors, or a failed write abort the run.
//! Cancellation is observed between work units — an in-flight judge call is
//! allowed to finish or time out on its own.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::judge::{evaluate_once, EvalOutcome, Judge, RetryPolicy};
use crate::prompt::{self, PromptTemplate};
use crate::scheduler::{self, SchedulePolicy};
use crate::store::Store;

/// How many passes the orchestrator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// A fixed number of passes (1 = single evaluate).
    Passes(u32),
    /// Loop until no deficit work remains or cancellation is requested.
    Forever,
}

/// Delay between passes in forever mode when a pass made no progress, so a
/// permanently failing judge doesn't spin the loop hot.
const STALLED_PASS_DELAY: Duration = Duration::from_secs(30);

/// Shared flag the binary sets on Ctrl-C.
pub type CancelFlag = Arc<AtomicBool>;

pub fn cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

/// Totals for the whole run, logged at the end and surfaced by the binary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub passes: u32,
    pub scheduled: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Drive evaluation passes over the store.
///
/// `prompts` maps source name to its resolved template; items from unknown
/// sources count as failed units (they cannot be prompted) and are left in
/// place for a later run with fixed configuration.
pub async fn run_evaluation(
    store: &mut Store,
    prompts: &BTreeMap<String, PromptTemplate>,
    judge: &dyn Judge,
    policy: &SchedulePolicy,
    retry: &RetryPolicy,
    mode: RunMode,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    loop {
        let work = scheduler::plan(store, policy, Utc::now());
        if work.is_empty() {
            tracing::info!(passes = summary.passes, "no deficit work remains");
            break;
        }

        summary.passes += 1;
        summary.scheduled += work.len();
        tracing::info!(pass = summary.passes, units = work.len(), "starting pass");

        let mut pass_succeeded = 0usize;
        for unit in work {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("cancellation requested, stopping between work units");
                summary.cancelled = true;
                return Ok(summary);
            }

            // The item may have been scheduled from a stale plan; skip quietly.
            let Some(item) = store.get(&unit.dedup_key) else {
                continue;
            };
            let title = item.title.clone();

            let Some(template) = prompts.get(&item.source) else {
                tracing::warn!(
                    source = %item.source,
                    %title,
                    "no prompt template for source, counting unit as failed"
                );
                summary.failed += 1;
                continue;
            };

            let assembled = prompt::assemble(template, item);
            match evaluate_once(judge, &assembled, retry).await {
                EvalOutcome::Evaluated(eval) => {
                    tracing::info!(
                        %title,
                        round = unit.round,
                        importance = eval.response.importance_score,
                        confidence = eval.response.confidence_score,
                        "evaluated"
                    );
                    if let Some(item) = store.get_mut(&unit.dedup_key) {
                        item.evals.push(eval);
                    }
                    summary.succeeded += 1;
                    pass_succeeded += 1;
                }
                EvalOutcome::Failed { attempts, reason } => {
                    tracing::warn!(%title, attempts, %reason, "evaluation round failed");
                    summary.failed += 1;
                }
            }

            // Incremental persistence: prior progress survives any crash.
            store.save().context("persisting store after work unit")?;
        }

        match mode {
            RunMode::Passes(n) if summary.passes >= n => break,
            RunMode::Passes(_) => {}
            RunMode::Forever => {
                if pass_succeeded == 0 {
                    tracing::warn!(
                        delay_secs = STALLED_PASS_DELAY.as_secs(),
                        "pass made no progress, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(STALLED_PASS_DELAY) => {}
                        _ = wait_for_cancel(cancel) => {
                            summary.cancelled = true;
                            return Ok(summary);
                        }
                    }
                }
            }
        }
    }

    tracing::info!(
        passes = summary.passes,
        scheduled = summary.scheduled,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "run finished"
    );
    Ok(summary)
}

async fn wait_for_cancel(cancel: &CancelFlag) {
    while !cancel.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
