//! judge.rs — judge invocation: Ollama client, schema validation, bounded
//! retries with a tagged outcome.
//!
//! One call here is the only operation in the core that blocks for seconds.
//! Each attempt carries its own timeout; retries are fresh independent calls,
//! never resumptions. A round that exhausts its retries is reported as a
//! failed unit of work — nothing is ever partially stored.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::store::{Evaluation, JudgeResponse};

/// Why a single judge call did not produce a usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeError {
    /// Worth another attempt: timeout, network error, malformed or
    /// schema-invalid output.
    Retryable(String),
    /// No point retrying (e.g. the judge rejected the request outright).
    Permanent(String),
}

impl JudgeError {
    pub fn message(&self) -> &str {
        match self {
            JudgeError::Retryable(m) | JudgeError::Permanent(m) => m,
        }
    }
}

/// External judge capability: assembled prompt in, validated judgment out.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, prompt: &str) -> Result<JudgeResponse, JudgeError>;
    /// Identifier recorded on every evaluation this judge produces.
    fn model(&self) -> &str;
}

/// Retry budget for one evaluation round.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_retries.max(1),
            delay: Duration::from_secs(settings.retry_delay_secs),
        }
    }
}

/// Outcome of one evaluation round. Failures carry the attempt count for the
/// run summary; they never touch the store.
#[derive(Debug)]
pub enum EvalOutcome {
    Evaluated(Evaluation),
    Failed { attempts: u32, reason: String },
}

/// Perform one evaluation round: call the judge, retrying transient failures
/// up to the policy's budget with a fixed delay between attempts.
pub async fn evaluate_once(judge: &dyn Judge, prompt: &str, retry: &RetryPolicy) -> EvalOutcome {
    let mut last_reason = String::new();
    for attempt in 1..=retry.max_attempts {
        match judge.judge(prompt).await {
            Ok(response) => {
                return EvalOutcome::Evaluated(Evaluation {
                    eval_date: Utc::now(),
                    model: judge.model().to_string(),
                    response,
                });
            }
            Err(JudgeError::Permanent(reason)) => {
                tracing::warn!(attempt, %reason, "judge failed permanently");
                return EvalOutcome::Failed { attempts: attempt, reason };
            }
            Err(JudgeError::Retryable(reason)) => {
                tracing::warn!(
                    attempt,
                    max_attempts = retry.max_attempts,
                    %reason,
                    "judge attempt failed"
                );
                last_reason = reason;
                if attempt < retry.max_attempts {
                    tokio::time::sleep(retry.delay).await;
                }
            }
        }
    }
    EvalOutcome::Failed {
        attempts: retry.max_attempts,
        reason: last_reason,
    }
}

// ------------------------------------------------------------
// Ollama judge
// ------------------------------------------------------------

/// Judge backed by a local Ollama server (`POST /api/generate` with JSON
/// output forced). The per-attempt timeout lives on the HTTP client.
pub struct OllamaJudge {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    format: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaJudge {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("building judge http client")?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        })
    }
}

#[async_trait]
impl Judge for OllamaJudge {
    async fn judge(&self, prompt: &str) -> Result<JudgeResponse, JudgeError> {
        let req = GenerateRequest {
            model: &self.model,
            prompt,
            format: "json",
            stream: false,
        };

        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&req)
            .send()
            .await
            .map_err(|e| JudgeError::Retryable(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            // Server-side and throttling errors are transient; anything else
            // (bad request, unknown model) won't improve on retry.
            let err = format!("ollama returned {status}");
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(JudgeError::Retryable(err))
            } else {
                Err(JudgeError::Permanent(err))
            };
        }

        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| JudgeError::Retryable(format!("invalid generate envelope: {e}")))?;

        parse_judgment(&body.response)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Parse and validate the judge's JSON payload. Anything short of a fully
/// well-formed judgment is rejected whole and counts as retryable.
fn parse_judgment(raw: &str) -> Result<JudgeResponse, JudgeError> {
    let response: JudgeResponse = serde_json::from_str(raw)
        .map_err(|e| JudgeError::Retryable(format!("schema-invalid judgment: {e}")))?;
    response
        .validate()
        .map_err(JudgeError::Retryable)?;
    Ok(response)
}

// ------------------------------------------------------------
// Scripted judge for tests and offline runs
// ------------------------------------------------------------

/// Deterministic judge that plays back a queue of outcomes, then repeats the
/// last one. Used by tests and the dry-run path.
pub struct ScriptedJudge {
    model: String,
    script: Mutex<VecDeque<Result<JudgeResponse, JudgeError>>>,
    fallback: Result<JudgeResponse, JudgeError>,
    pub calls: Mutex<u32>,
}

impl ScriptedJudge {
    pub fn always(response: JudgeResponse) -> Self {
        Self {
            model: "scripted".into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(response),
            calls: Mutex::new(0),
        }
    }

    pub fn always_failing(reason: &str) -> Self {
        Self {
            model: "scripted".into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Err(JudgeError::Retryable(reason.to_string())),
            calls: Mutex::new(0),
        }
    }

    /// Queue outcomes to play back before falling through to the fallback.
    pub fn with_script(mut self, script: Vec<Result<JudgeResponse, JudgeError>>) -> Self {
        self.script = Mutex::new(script.into());
        self
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().expect("calls mutex poisoned")
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn judge(&self, _prompt: &str) -> Result<JudgeResponse, JudgeError> {
        *self.calls.lock().expect("calls mutex poisoned") += 1;
        let mut script = self.script.lock().expect("script mutex poisoned");
        script.pop_front().unwrap_or_else(|| self.fallback.clone())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(importance: f64, confidence: f64) -> JudgeResponse {
        JudgeResponse {
            importance_score: importance,
            confidence_score: confidence,
            summary: "s".into(),
            evaluation: "e".into(),
            followup: String::new(),
            scratchpad: None,
        }
    }

    #[test]
    fn judgment_parsing_rejects_partial_payloads() {
        // Missing the required text fields entirely.
        let err = parse_judgment(r#"{"importance_score": 50}"#).unwrap_err();
        assert!(matches!(err, JudgeError::Retryable(_)));

        // Scores present but out of range.
        let err = parse_judgment(
            r#"{"importance_score": 150, "confidence_score": 50,
                "summary": "s", "evaluation": "e", "followup": ""}"#,
        )
        .unwrap_err();
        assert!(err.message().contains("outside [0,100]"));

        // Well-formed payload passes.
        let ok = parse_judgment(
            r#"{"importance_score": 80, "confidence_score": 60,
                "summary": "s", "evaluation": "e", "followup": "later"}"#,
        )
        .unwrap();
        assert_eq!(ok.importance_score, 80.0);
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_budget() {
        let judge = ScriptedJudge::always(response(70.0, 50.0)).with_script(vec![
            Err(JudgeError::Retryable("timeout".into())),
            Err(JudgeError::Retryable("timeout".into())),
        ]);
        let retry = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(0),
        };
        match evaluate_once(&judge, "p", &retry).await {
            EvalOutcome::Evaluated(ev) => {
                assert_eq!(ev.response.importance_score, 70.0);
                assert_eq!(ev.model, "scripted");
            }
            EvalOutcome::Failed { .. } => panic!("expected success on third attempt"),
        }
        assert_eq!(judge.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_round() {
        let judge = ScriptedJudge::always_failing("connection refused");
        let retry = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(0),
        };
        match evaluate_once(&judge, "p", &retry).await {
            EvalOutcome::Failed { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("connection refused"));
            }
            EvalOutcome::Evaluated(_) => panic!("expected failure"),
        }
        assert_eq!(judge.call_count(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let judge = ScriptedJudge::always(response(70.0, 50.0))
            .with_script(vec![Err(JudgeError::Permanent("bad request".into()))]);
        let retry = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(0),
        };
        match evaluate_once(&judge, "p", &retry).await {
            EvalOutcome::Failed { attempts, .. } => assert_eq!(attempts, 1),
            EvalOutcome::Evaluated(_) => panic!("expected failure"),
        }
        assert_eq!(judge.call_count(), 1);
    }
}
