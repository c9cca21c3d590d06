//! Fluent assertion handle: `check(...).once()` / `.eventually(...)`.
//!
//! The handle is a plain value carrying the predicate, label, and
//! requiredness; there is no hidden chaining state. `eventually` implements
//! the bounded retry loop with snapshot-confidence gating, optional limit
//! growth, and a last-resort vision fallback. Only the FINAL outcome of an
//! `eventually` run is accumulated into the step; intermediate attempts are
//! emitted as `verification` events only.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use super::{AgentRuntime, RuntimeError};
use crate::llm::LLMProvider;
use crate::models::{SNAPSHOT_LIMIT_DEFAULT, clamp_snapshot_limit};
use crate::verification::{AssertOutcome, Predicate};

/// When the per-attempt limit escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrowthApply {
    /// Escalate on every attempt.
    All,
    /// Attempt 1 uses the start limit; later attempts escalate (a passing
    /// attempt would have returned already, so attempt k>1 follows a fail).
    #[default]
    OnlyOnFail,
}

/// Additive snapshot-limit schedule:
/// `limit(k) = min(max_limit, start_limit + step*(k-1))`, clamped to 1..=500.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotLimitGrowth {
    pub start_limit: Option<u32>,
    pub step: Option<u32>,
    pub max_limit: Option<u32>,
    pub apply_on: GrowthApply,
}

/// Options for [`AssertionHandle::eventually`].
#[derive(Clone, Default)]
pub struct EventuallyOptions {
    pub timeout_s: f64,
    pub poll_s: f64,
    pub min_confidence: Option<f64>,
    pub max_snapshot_attempts: u32,
    /// Fixed per-attempt limit override (superseded by `limit_growth`).
    pub snapshot_limit: Option<u32>,
    pub limit_growth: Option<SnapshotLimitGrowth>,
    pub vision_provider: Option<Arc<dyn LLMProvider>>,
    pub vision_system_prompt: Option<String>,
    pub vision_user_prompt: Option<String>,
}

impl EventuallyOptions {
    pub fn new(timeout_s: f64, poll_s: f64) -> Self {
        Self {
            timeout_s,
            poll_s,
            max_snapshot_attempts: 3,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for EventuallyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventuallyOptions")
            .field("timeout_s", &self.timeout_s)
            .field("poll_s", &self.poll_s)
            .field("min_confidence", &self.min_confidence)
            .field("max_snapshot_attempts", &self.max_snapshot_attempts)
            .field("snapshot_limit", &self.snapshot_limit)
            .field("limit_growth", &self.limit_growth)
            .field("vision_provider", &self.vision_provider.is_some())
            .finish()
    }
}

/// Resolved growth schedule with all defaults filled in.
struct ResolvedGrowth {
    start: u32,
    step: u32,
    max: u32,
    apply_on: GrowthApply,
}

impl ResolvedGrowth {
    fn limit_for_attempt(&self, attempt_1based: u32) -> u32 {
        let base = self.start + self.step * attempt_1based.saturating_sub(1);
        clamp_snapshot_limit(base.min(self.max))
    }
}

pub struct AssertionHandle<'a> {
    runtime: &'a mut AgentRuntime,
    predicate: Predicate,
    label: String,
    required: bool,
}

impl<'a> AssertionHandle<'a> {
    pub(crate) fn new(
        runtime: &'a mut AgentRuntime,
        predicate: Predicate,
        label: String,
        required: bool,
    ) -> Self {
        Self {
            runtime,
            predicate,
            label,
            required,
        }
    }

    /// Evaluate once against the current context (same as `assert_`).
    pub async fn once(self) -> bool {
        self.runtime
            .assert_(&self.predicate, &self.label, self.required)
            .await
    }

    /// Retry until the predicate passes or the deadline expires.
    pub async fn eventually(self, options: EventuallyOptions) -> Result<bool, RuntimeError> {
        let Self {
            runtime,
            predicate,
            label,
            required,
        } = self;

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs_f64(options.timeout_s.max(0.0));
        let poll = Duration::from_secs_f64(options.poll_s.max(0.0));
        let max_snapshot_attempts = options.max_snapshot_attempts.max(1);

        let growth = options.limit_growth.map(|g| ResolvedGrowth {
            start: g
                .start_limit
                .or(options.snapshot_limit)
                .unwrap_or_else(|| {
                    let configured = runtime.snapshot_options().limit;
                    if configured > 0 {
                        configured
                    } else {
                        SNAPSHOT_LIMIT_DEFAULT
                    }
                }),
            step: g.step.unwrap_or_else(|| {
                g.start_limit
                    .or(options.snapshot_limit)
                    .unwrap_or(runtime.snapshot_options().limit)
                    .max(1)
            }),
            max: g.max_limit.unwrap_or(500),
            apply_on: g.apply_on,
        });

        let mut attempt: u32 = 0;
        let mut snapshot_attempt: u32 = 0;
        let mut last_outcome: Option<AssertOutcome> = None;

        loop {
            attempt += 1;

            let snapshot_limit = match &growth {
                Some(growth) => {
                    let escalate = match growth.apply_on {
                        GrowthApply::All => true,
                        GrowthApply::OnlyOnFail => {
                            attempt == 1
                                || last_outcome.as_ref().is_some_and(|o| !o.passed)
                        }
                    };
                    Some(if escalate {
                        growth.limit_for_attempt(attempt)
                    } else {
                        clamp_snapshot_limit(growth.start)
                    })
                }
                None => options.snapshot_limit,
            };

            match snapshot_limit {
                Some(limit) => runtime.snapshot_with_limit(limit).await?,
                None => runtime.snapshot().await?,
            };
            snapshot_attempt += 1;

            // Confidence gate: only applies when diagnostics report a value,
            // so producers without diagnostics keep working.
            let confidence = runtime.last_snapshot().and_then(|s| s.confidence());
            if let (Some(min_confidence), Some(confidence)) =
                (options.min_confidence, confidence)
                && confidence < min_confidence
            {
                let diagnostics = runtime
                    .last_snapshot()
                    .and_then(|s| s.diagnostics.clone());
                let outcome = AssertOutcome {
                    passed: false,
                    reason: format!(
                        "Snapshot confidence {confidence:.3} < min_confidence {min_confidence:.3}"
                    ),
                    details: details(json!({
                        "reason_code": "snapshot_low_confidence",
                        "confidence": confidence,
                        "min_confidence": min_confidence,
                        "snapshot_attempt": snapshot_attempt,
                        "diagnostics": diagnostics,
                    })),
                };
                last_outcome = Some(outcome.clone());

                runtime.record_outcome(
                    outcome,
                    &label,
                    required,
                    "assert",
                    false,
                    attempt_extra(attempt, snapshot_attempt, snapshot_limit, &[]),
                );

                if snapshot_attempt >= max_snapshot_attempts {
                    // Last resort: ask a vision model to look at the actual
                    // pixels before declaring the snapshot channel dead.
                    if let Some(provider) = options
                        .vision_provider
                        .as_ref()
                        .filter(|p| p.supports_vision())
                    {
                        match vision_verdict(
                            runtime,
                            provider.as_ref(),
                            &label,
                            options.vision_system_prompt.as_deref(),
                            options.vision_user_prompt.as_deref(),
                        )
                        .await
                        {
                            Ok((passed, response)) => {
                                let final_outcome = AssertOutcome {
                                    passed,
                                    reason: if passed {
                                        "vision_fallback_yes".to_string()
                                    } else {
                                        "vision_fallback_no".to_string()
                                    },
                                    details: details(json!({
                                        "reason_code": if passed {
                                            "vision_fallback_pass"
                                        } else {
                                            "vision_fallback_fail"
                                        },
                                        "vision_response": response,
                                        "min_confidence": min_confidence,
                                        "snapshot_attempts": snapshot_attempt,
                                    })),
                                };
                                runtime.record_outcome(
                                    final_outcome,
                                    &label,
                                    required,
                                    "assert",
                                    true,
                                    attempt_extra(
                                        attempt,
                                        snapshot_attempt,
                                        snapshot_limit,
                                        &[("final", json!(true)), ("vision_fallback", json!(true))],
                                    ),
                                );
                                if required && !passed {
                                    runtime
                                        .persist_failure_artifacts(&format!(
                                            "assert_eventually_failed:{label}"
                                        ))
                                        .await;
                                }
                                return Ok(passed);
                            }
                            Err(vision_error) => {
                                // Vision failed too; fall through to
                                // snapshot_exhausted with the error attached.
                                if let Some(outcome) = last_outcome.as_mut() {
                                    outcome
                                        .details
                                        .insert("vision_error".to_string(), json!(vision_error));
                                }
                            }
                        }
                    }

                    let diagnostics = last_outcome
                        .as_ref()
                        .and_then(|o| o.details.get("diagnostics").cloned());
                    let final_outcome = AssertOutcome {
                        passed: false,
                        reason: format!(
                            "Snapshot exhausted after {snapshot_attempt} attempt(s) below min_confidence {min_confidence:.3}"
                        ),
                        details: details(json!({
                            "reason_code": "snapshot_exhausted",
                            "confidence": confidence,
                            "min_confidence": min_confidence,
                            "snapshot_attempts": snapshot_attempt,
                            "diagnostics": diagnostics,
                        })),
                    };
                    runtime.record_outcome(
                        final_outcome,
                        &label,
                        required,
                        "assert",
                        true,
                        attempt_extra(
                            attempt,
                            snapshot_attempt,
                            snapshot_limit,
                            &[("final", json!(true)), ("exhausted", json!(true))],
                        ),
                    );
                    if required {
                        runtime
                            .persist_failure_artifacts(&format!(
                                "assert_eventually_failed:{label}"
                            ))
                            .await;
                    }
                    return Ok(false);
                }

                if tokio::time::Instant::now() >= deadline {
                    let outcome = last_outcome.take().unwrap_or_else(|| {
                        AssertOutcome::fail("snapshot confidence below threshold")
                    });
                    runtime.record_outcome(
                        outcome,
                        &label,
                        required,
                        "assert",
                        true,
                        attempt_extra(
                            attempt,
                            snapshot_attempt,
                            snapshot_limit,
                            &[("final", json!(true)), ("timeout", json!(true))],
                        ),
                    );
                    if required {
                        runtime
                            .persist_failure_artifacts(&format!(
                                "assert_eventually_timeout:{label}"
                            ))
                            .await;
                    }
                    return Ok(false);
                }

                tokio::time::sleep(poll).await;
                continue;
            }

            let outcome = runtime.evaluate_predicate(&predicate);
            last_outcome = Some(outcome.clone());

            runtime.record_outcome(
                outcome.clone(),
                &label,
                required,
                "assert",
                false,
                attempt_extra(attempt, snapshot_attempt, snapshot_limit, &[]),
            );

            if outcome.passed {
                runtime.record_outcome(
                    outcome,
                    &label,
                    required,
                    "assert",
                    true,
                    attempt_extra(attempt, snapshot_attempt, None, &[("final", json!(true))]),
                );
                return Ok(true);
            }

            if tokio::time::Instant::now() >= deadline {
                runtime.record_outcome(
                    outcome,
                    &label,
                    required,
                    "assert",
                    true,
                    attempt_extra(
                        attempt,
                        snapshot_attempt,
                        None,
                        &[("final", json!(true)), ("timeout", json!(true))],
                    ),
                );
                if required {
                    runtime
                        .persist_failure_artifacts(&format!("assert_eventually_timeout:{label}"))
                        .await;
                }
                return Ok(false);
            }

            tokio::time::sleep(poll).await;
        }
    }
}

/// Take a screenshot and ask the vision provider for a strict YES/NO.
async fn vision_verdict(
    runtime: &mut AgentRuntime,
    provider: &dyn LLMProvider,
    label: &str,
    system_prompt: Option<&str>,
    user_prompt: Option<&str>,
) -> Result<(bool, String), String> {
    let png = runtime
        .backend()
        .screenshot_png()
        .await
        .map_err(|e| e.to_string())?;
    let image_base64 = BASE64.encode(png);

    let system = system_prompt
        .unwrap_or("You are a strict visual verifier. Answer only YES or NO.");
    let user = match user_prompt {
        Some(p) => p.to_string(),
        None => format!(
            "Given the screenshot, is the following condition satisfied?\n\n{label}\n\nAnswer YES or NO."
        ),
    };

    let response = provider
        .generate_with_image(system, &user, &image_base64, 0.0)
        .await
        .map_err(|e| e.to_string())?;
    let passed = response
        .content
        .trim()
        .to_lowercase()
        .starts_with("yes");
    Ok((passed, response.content))
}

fn attempt_extra(
    attempt: u32,
    snapshot_attempt: u32,
    snapshot_limit: Option<u32>,
    flags: &[(&str, Value)],
) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("eventually".to_string(), json!(true));
    map.insert("attempt".to_string(), json!(attempt));
    map.insert("snapshot_attempt".to_string(), json!(snapshot_attempt));
    if let Some(limit) = snapshot_limit {
        map.insert("snapshot_limit".to_string(), json!(limit));
    }
    for (key, value) in flags {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

fn details(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_schedule_is_additive_and_clamped() {
        let growth = ResolvedGrowth {
            start: 60,
            step: 40,
            max: 220,
            apply_on: GrowthApply::OnlyOnFail,
        };
        assert_eq!(growth.limit_for_attempt(1), 60);
        assert_eq!(growth.limit_for_attempt(2), 100);
        assert_eq!(growth.limit_for_attempt(3), 140);
        assert_eq!(growth.limit_for_attempt(10), 220);

        let wide = ResolvedGrowth {
            start: 400,
            step: 200,
            max: 9000,
            apply_on: GrowthApply::All,
        };
        // Clamped to the producer's hard cap.
        assert_eq!(wide.limit_for_attempt(3), 500);
    }
}
