//! Executor loop: snapshot ramp → propose → execute → settle → verify, with
//! a bounded vision-executor fallback when structured verification fails.

mod action;
mod prompt;

pub use action::{Action, ParsedAction, parse_action};
pub use prompt::{
    EXECUTOR_SYSTEM_PROMPT, build_dom_context, build_user_prompt, build_vision_user_prompt,
};

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::ReadyState;
use crate::llm::{LLMError, LLMProvider};
use crate::models::Snapshot;
use crate::runtime::{AgentRuntime, EventuallyOptions, RuntimeError, StepEndParams};
use crate::verification::Predicate;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Llm(#[from] LLMError),

    #[error("no snapshot available for action proposal")]
    NoSnapshot,
}

/// One verification attached to a step.
#[derive(Clone)]
pub struct StepVerification {
    pub predicate: Predicate,
    pub label: String,
    pub required: bool,
    /// Retry via `eventually` instead of a single `once` evaluation.
    pub eventually: bool,
    pub timeout_s: f64,
    pub poll_s: f64,
    pub min_confidence: Option<f64>,
    pub max_snapshot_attempts: u32,
}

impl StepVerification {
    pub fn new(predicate: Predicate, label: impl Into<String>) -> Self {
        Self {
            predicate,
            label: label.into(),
            required: true,
            eventually: true,
            timeout_s: 10.0,
            poll_s: 0.25,
            min_confidence: None,
            max_snapshot_attempts: 3,
        }
    }
}

/// A single observe-decide-act-verify cycle definition.
#[derive(Clone)]
pub struct RuntimeStep {
    pub goal: String,
    pub intent: Option<String>,
    pub verifications: Vec<StepVerification>,
    /// Snapshot ramp: limit(k) = min(max, base + step*(k-1)).
    pub snapshot_limit_base: u32,
    pub snapshot_limit_step: u32,
    pub snapshot_limit_max: u32,
    pub max_snapshot_attempts: u32,
    pub min_confidence: Option<f64>,
    pub min_actionables: usize,
    pub vision_executor_enabled: bool,
    pub max_vision_executor_attempts: u32,
}

impl RuntimeStep {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            intent: None,
            verifications: Vec::new(),
            snapshot_limit_base: 50,
            snapshot_limit_step: 50,
            snapshot_limit_max: 200,
            max_snapshot_attempts: 3,
            min_confidence: None,
            min_actionables: 0,
            vision_executor_enabled: false,
            max_vision_executor_attempts: 0,
        }
    }
}

/// Context handed to step hooks.
#[derive(Debug, Clone)]
pub struct StepHookContext {
    pub step_id: String,
    pub step_index: i64,
    pub goal: String,
    pub success: Option<bool>,
    pub outcome: Option<String>,
    pub error: Option<String>,
}

pub type StepHook = dyn Fn(&StepHookContext) + Send + Sync;

/// Custom prompt builder: (task_goal, step, snapshot, dom_context) →
/// (system_prompt, user_prompt).
pub type PromptBuilder =
    dyn Fn(&str, &RuntimeStep, &Snapshot, &str) -> (String, String) + Send + Sync;

pub struct RuntimeAgent {
    runtime: AgentRuntime,
    executor: Arc<dyn LLMProvider>,
    vision_executor: Option<Arc<dyn LLMProvider>>,
    short_circuit_canvas: bool,
    prompt_builder: Option<Box<PromptBuilder>>,
}

impl RuntimeAgent {
    pub fn new(runtime: AgentRuntime, executor: Arc<dyn LLMProvider>) -> Self {
        Self {
            runtime,
            executor,
            vision_executor: None,
            short_circuit_canvas: false,
            prompt_builder: None,
        }
    }

    pub fn with_vision_executor(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.vision_executor = Some(provider);
        self
    }

    /// Route canvas-heavy pages with no actionables straight to the vision
    /// executor instead of burning snapshot attempts.
    pub fn with_short_circuit_canvas(mut self, enabled: bool) -> Self {
        self.short_circuit_canvas = enabled;
        self
    }

    pub fn with_prompt_builder(mut self, builder: Box<PromptBuilder>) -> Self {
        self.prompt_builder = Some(builder);
        self
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut AgentRuntime {
        &mut self.runtime
    }

    /// Run one full step. Returns whether all required verifications passed.
    pub async fn run_step(
        &mut self,
        task_goal: &str,
        step: &RuntimeStep,
        on_step_start: Option<&StepHook>,
        on_step_end: Option<&StepHook>,
    ) -> Result<bool, AgentError> {
        let step_id = self.runtime.begin_step(&step.goal, None, true, None);
        let step_index = self.runtime.step_index();

        if let Some(hook) = on_step_start {
            hook(&StepHookContext {
                step_id: step_id.clone(),
                step_index,
                goal: step.goal.clone(),
                success: None,
                outcome: None,
                error: None,
            });
        }

        // Snapshot ramp: escalate the element cap until confidence and
        // actionable count clear the step's thresholds.
        self.snapshot_ramp(step).await?;

        let use_vision_first = self.should_short_circuit_to_vision(step).await;

        let proposal = if use_vision_first {
            self.propose_vision(task_goal, step).await
        } else {
            self.propose_structured(task_goal, step).await
        };
        let parsed = match proposal {
            Ok(parsed) => parsed,
            Err(e) => {
                self.close_step_with_error(&step_id, step_index, &step.goal, &e, on_step_end)
                    .await;
                return Err(e);
            }
        };

        // Provenance of the proposal that actually executed; re-proposals
        // below overwrite this so step_end reports the real model and reply.
        let mut exec_model = if use_vision_first {
            self.vision_model_name()
        } else {
            self.executor.model_name().to_string()
        };
        let mut exec_response = parsed.raw.clone();

        if let Err(e) = self.execute_action(&parsed).await {
            self.close_step_with_error(&step_id, step_index, &step.goal, &e, on_step_end)
                .await;
            return Err(e);
        }

        self.settle().await;

        let mut ok = self.run_verifications(step).await?;

        // Bounded vision-executor fallback: re-propose against the actual
        // pixels and retry the verification set.
        if !ok && step.vision_executor_enabled {
            let vision_available = self
                .vision_executor
                .as_ref()
                .is_some_and(|p| p.supports_vision());
            if vision_available {
                for attempt in 1..=step.max_vision_executor_attempts {
                    info!("vision executor attempt {attempt} after verification failure");
                    let parsed = match self.propose_vision(task_goal, step).await {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!("vision proposal failed: {e}");
                            break;
                        }
                    };
                    exec_model = self.vision_model_name();
                    exec_response = parsed.raw.clone();
                    if let Err(e) = self.execute_action(&parsed).await {
                        warn!("vision action failed: {e}");
                        break;
                    }
                    self.settle().await;
                    ok = self.run_verifications(step).await?;
                    if ok {
                        break;
                    }
                }
            }
        }

        let outcome = if ok { "ok" } else { "verification_failed" };
        // exec.outcome comes from the recorded action result; `outcome` here
        // only describes the step verdict for hooks.
        self.runtime
            .emit_step_end(StepEndParams {
                verify_passed: Some(ok),
                llm_data: Some(json!({
                    "model": exec_model,
                    "response_text": exec_response,
                })),
                ..Default::default()
            })
            .await;

        if let Some(hook) = on_step_end {
            hook(&StepHookContext {
                step_id,
                step_index,
                goal: step.goal.clone(),
                success: Some(ok),
                outcome: Some(outcome.to_string()),
                error: None,
            });
        }

        Ok(ok)
    }

    /// Run steps in order; stop at the first failure when requested.
    pub async fn run(
        &mut self,
        task_goal: &str,
        steps: &[RuntimeStep],
        stop_on_failure: bool,
    ) -> Result<bool, AgentError> {
        let mut all_ok = true;
        for step in steps {
            let ok = self.run_step(task_goal, step, None, None).await?;
            if !ok {
                all_ok = false;
                if stop_on_failure {
                    return Ok(false);
                }
            }
        }
        Ok(all_ok)
    }

    async fn snapshot_ramp(&mut self, step: &RuntimeStep) -> Result<(), RuntimeError> {
        let attempts = step.max_snapshot_attempts.max(1);
        for attempt in 1..=attempts {
            let limit = step
                .snapshot_limit_max
                .min(step.snapshot_limit_base + step.snapshot_limit_step * (attempt - 1));
            let snap = self.runtime.snapshot_with_limit(limit).await?;

            let confidence_ok = match (step.min_confidence, snap.confidence()) {
                (Some(min), Some(confidence)) => confidence >= min,
                _ => true,
            };
            let actionables_ok = snap.actionable_count() >= step.min_actionables;
            if confidence_ok && actionables_ok {
                return Ok(());
            }
            debug!(
                "snapshot ramp attempt {attempt}: confidence_ok={confidence_ok} actionables_ok={actionables_ok}"
            );
        }
        Ok(())
    }

    async fn should_short_circuit_to_vision(&mut self, step: &RuntimeStep) -> bool {
        if !self.short_circuit_canvas || !step.vision_executor_enabled {
            return false;
        }
        if !self
            .vision_executor
            .as_ref()
            .is_some_and(|p| p.supports_vision())
        {
            return false;
        }
        let actionables = self
            .runtime
            .last_snapshot()
            .map(|s| s.actionable_count())
            .unwrap_or(0);
        if actionables >= step.min_actionables.max(1) {
            return false;
        }
        // Bounded probe; never walks the DOM beyond a count.
        let canvas_count = self
            .runtime
            .backend()
            .eval("document.querySelectorAll('canvas').length")
            .await
            .ok()
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        canvas_count >= 1
    }

    async fn propose_structured(
        &mut self,
        task_goal: &str,
        step: &RuntimeStep,
    ) -> Result<ParsedAction, AgentError> {
        let snap = self
            .runtime
            .last_snapshot()
            .cloned()
            .ok_or(AgentError::NoSnapshot)?;
        let dom_context = build_dom_context(&snap);
        let (system, user) = match &self.prompt_builder {
            Some(builder) => builder(task_goal, step, &snap, &dom_context),
            None => (
                EXECUTOR_SYSTEM_PROMPT.to_string(),
                build_user_prompt(task_goal, &step.goal, &dom_context),
            ),
        };
        let response = self.executor.generate(&system, &user, 0.0).await?;
        Ok(parse_action(&response.content))
    }

    async fn propose_vision(
        &mut self,
        task_goal: &str,
        step: &RuntimeStep,
    ) -> Result<ParsedAction, AgentError> {
        let provider = self
            .vision_executor
            .clone()
            .ok_or_else(|| LLMError("no vision executor configured".to_string()))?;
        let png = self
            .runtime
            .backend()
            .screenshot_png()
            .await
            .map_err(RuntimeError::from)?;
        let image_base64 = BASE64.encode(png);
        let user = build_vision_user_prompt(task_goal, &step.goal);
        let response = provider
            .generate_with_image(EXECUTOR_SYSTEM_PROMPT, &user, &image_base64, 0.0)
            .await?;
        Ok(parse_action(&response.content))
    }

    async fn execute_action(&mut self, parsed: &ParsedAction) -> Result<(), AgentError> {
        let url = self.runtime.get_url().await.ok();
        self.runtime
            .record_action(&parsed.action.describe(), url.as_deref())
            .await;

        if parsed.parse_error {
            self.runtime
                .note_action_result(false, Some("parse_error"), None, Some(0));
            return Ok(());
        }

        let started = Instant::now();
        let result = self.dispatch(&parsed.action).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let step_id = self.runtime.step_id().map(String::from);
        match result {
            Ok(outcome) => {
                let success = outcome != "element_not_found";
                self.runtime
                    .note_action_result(success, Some(outcome), None, Some(duration_ms));
                self.runtime.tracer().emit_tool_call(
                    &parsed.action.describe(),
                    success,
                    None,
                    step_id.as_deref(),
                );
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.runtime.note_action_result(
                    false,
                    Some("error"),
                    Some(&message),
                    Some(duration_ms),
                );
                self.runtime.tracer().emit_tool_call(
                    &parsed.action.describe(),
                    false,
                    Some(&message),
                    step_id.as_deref(),
                );
                self.runtime
                    .persist_failure_artifacts(&format!("action_error:{message}"))
                    .await;
                Err(AgentError::Runtime(e))
            }
        }
    }

    async fn dispatch(&mut self, action: &Action) -> Result<&'static str, RuntimeError> {
        let backend = self.runtime.backend().clone();
        match action {
            Action::Click { id } => {
                let Some((x, y)) = self.element_center(*id) else {
                    return Ok("element_not_found");
                };
                backend.mouse_move(x, y).await?;
                backend
                    .mouse_click(x, y, crate::backend::MouseButton::Left, 1)
                    .await?;
                Ok("clicked")
            }
            Action::Type { id, text } => {
                let Some((x, y)) = self.element_center(*id) else {
                    return Ok("element_not_found");
                };
                backend.mouse_move(x, y).await?;
                backend
                    .mouse_click(x, y, crate::backend::MouseButton::Left, 1)
                    .await?;
                backend.type_text(text).await?;
                Ok("typed")
            }
            Action::Press { key } => {
                backend.press_key(key).await?;
                Ok("pressed")
            }
            Action::ClickXy { x, y } => {
                backend.mouse_move(*x, *y).await?;
                backend
                    .mouse_click(*x, *y, crate::backend::MouseButton::Left, 1)
                    .await?;
                Ok("clicked")
            }
            Action::Finish => Ok("finish"),
        }
    }

    fn vision_model_name(&self) -> String {
        self.vision_executor
            .as_ref()
            .map(|p| p.model_name().to_string())
            .unwrap_or_else(|| self.executor.model_name().to_string())
    }

    fn element_center(&self, id: i64) -> Option<(f64, f64)> {
        self.runtime
            .last_snapshot()?
            .elements
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.bbox.center())
    }

    async fn settle(&mut self) {
        if let Err(e) = self
            .runtime
            .backend()
            .wait_ready_state(ReadyState::Interactive, SETTLE_TIMEOUT)
            .await
        {
            debug!("settle after action did not complete: {e}");
        }
    }

    async fn run_verifications(&mut self, step: &RuntimeStep) -> Result<bool, RuntimeError> {
        let mut required_ok = true;
        for verification in &step.verifications {
            let ok = if verification.eventually {
                self.runtime
                    .check(
                        verification.predicate.clone(),
                        &verification.label,
                        verification.required,
                    )
                    .eventually(EventuallyOptions {
                        timeout_s: verification.timeout_s,
                        poll_s: verification.poll_s,
                        min_confidence: verification.min_confidence,
                        max_snapshot_attempts: verification.max_snapshot_attempts,
                        ..Default::default()
                    })
                    .await?
            } else {
                self.runtime
                    .check(
                        verification.predicate.clone(),
                        &verification.label,
                        verification.required,
                    )
                    .once()
                    .await
            };
            if verification.required && !ok {
                required_ok = false;
            }
        }
        Ok(required_ok)
    }

    async fn close_step_with_error(
        &mut self,
        step_id: &str,
        step_index: i64,
        goal: &str,
        error: &AgentError,
        on_step_end: Option<&StepHook>,
    ) {
        let message = error.to_string();
        self.runtime
            .emit_step_end(StepEndParams {
                success: Some(false),
                error: Some(message.clone()),
                outcome: Some("error".to_string()),
                verify_passed: Some(false),
                ..Default::default()
            })
            .await;
        if let Some(hook) = on_step_end {
            hook(&StepHookContext {
                step_id: step_id.to_string(),
                step_index,
                goal: goal.to_string(),
                success: Some(false),
                outcome: Some("error".to_string()),
                error: Some(message),
            });
        }
    }
}

/// Convenience conversion so callers can inspect `llm_data` easily.
pub fn llm_step_data(model: &str, response_text: &str) -> Value {
    json!({
        "model": model,
        "response_text": response_text,
    })
}
