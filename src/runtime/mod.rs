//! Agent runtime: the exclusive owner of per-step mutable state.
//!
//! A step is begin → [snapshots, actions, assertions] → end. The runtime
//! accumulates final assertion outcomes, emits every outcome as a
//! `verification` trace event, routes snapshots through CAPTCHA detection,
//! and persists the failure-artifact window when a required assertion fails.

mod handle;

pub use handle::{AssertionHandle, EventuallyOptions, GrowthApply, SnapshotLimitGrowth};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
// tokio Mutex, not a sync lock: the buffer is touched from the runtime and
// its timer task, and persist awaits the clip encoder with the guard held.
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::artifacts::{
    ArtifactError, FailureArtifactBuffer, FailureArtifactsOptions, PersistMode, PersistStatus,
};
use crate::backend::{BackendCapabilities, BackendError, BrowserBackend};
use crate::captcha::{
    CaptchaAction, CaptchaContext, CaptchaError, CaptchaOptions, CaptchaPolicy, CaptchaSource,
    PageControl, is_blocking_detection,
};
use crate::models::{
    DownloadRecord, EvaluateJsRequest, EvaluateJsResult, ImageFormat, Snapshot, SnapshotOptions,
    TabListResult, TabOperationResult, clamp_snapshot_limit,
};
use crate::snapshot::{SampledSnapshotOptions, SnapshotError, sampled_snapshot, snapshot};
use crate::trace::Tracer;
use crate::trace::builder::{ExecData, VerifyData, build_step_end_event};
use crate::verification::{AssertContext, AssertOutcome, Predicate};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Captcha(#[from] CaptchaError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl RuntimeError {
    pub fn reason_code(&self) -> &str {
        match self {
            RuntimeError::Backend(e) => e.reason_code(),
            RuntimeError::Snapshot(e) => e.reason_code(),
            RuntimeError::Captcha(e) => &e.reason_code,
            RuntimeError::Artifact(_) => "artifact_error",
        }
    }
}

/// One accumulated assertion outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AssertionRecord {
    pub label: String,
    pub passed: bool,
    pub required: bool,
    pub reason: String,
    pub details: Map<String, Value>,
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Options for [`AgentRuntime::scroll_by`].
#[derive(Debug, Clone)]
pub struct ScrollOptions {
    pub verify: bool,
    pub min_delta_px: f64,
    pub label: String,
    pub required: bool,
    pub timeout_s: f64,
    pub poll_s: f64,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub js_fallback: bool,
}

impl Default for ScrollOptions {
    fn default() -> Self {
        Self {
            verify: true,
            min_delta_px: 50.0,
            label: "scroll_effective".to_string(),
            required: true,
            timeout_s: 10.0,
            poll_s: 0.25,
            x: None,
            y: None,
            js_fallback: true,
        }
    }
}

/// Parameters for [`AgentRuntime::emit_step_end`]; every field optional so
/// callers only fill in what they know.
#[derive(Debug, Clone, Default)]
pub struct StepEndParams {
    pub action: Option<String>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub outcome: Option<String>,
    pub duration_ms: Option<i64>,
    pub attempt: u32,
    pub verify_passed: Option<bool>,
    pub verify_signals: Map<String, Value>,
    pub post_url: Option<String>,
    pub llm_data: Option<Value>,
}

pub struct AgentRuntime {
    backend: Arc<dyn BrowserBackend>,
    tracer: Tracer,
    snapshot_options: SnapshotOptions,

    step_id: Option<String>,
    step_index: i64,

    last_snapshot: Option<Snapshot>,
    step_pre_snapshot: Option<Snapshot>,
    step_pre_url: Option<String>,
    cached_url: Option<String>,

    assertions_this_step: Vec<AssertionRecord>,
    step_goal: Option<String>,
    last_action: Option<String>,
    last_action_error: Option<String>,
    last_action_outcome: Option<String>,
    last_action_duration_ms: Option<i64>,
    last_action_success: Option<bool>,

    task_done: bool,
    task_done_label: Option<String>,

    captcha_options: Option<CaptchaOptions>,
    captcha_retry_count: u32,

    artifact_buffer: Option<Arc<Mutex<FailureArtifactBuffer>>>,
    artifact_timer: Option<(CancellationToken, JoinHandle<()>)>,
}

impl AgentRuntime {
    pub fn new(backend: Arc<dyn BrowserBackend>, tracer: Tracer) -> Self {
        Self::with_options(backend, tracer, SnapshotOptions::default())
    }

    pub fn with_options(
        backend: Arc<dyn BrowserBackend>,
        tracer: Tracer,
        snapshot_options: SnapshotOptions,
    ) -> Self {
        Self {
            backend,
            tracer,
            snapshot_options,
            step_id: None,
            // 0-based indexing: the first begin_step() produces "step-0".
            step_index: -1,
            last_snapshot: None,
            step_pre_snapshot: None,
            step_pre_url: None,
            cached_url: None,
            assertions_this_step: Vec::new(),
            step_goal: None,
            last_action: None,
            last_action_error: None,
            last_action_outcome: None,
            last_action_duration_ms: None,
            last_action_success: None,
            task_done: false,
            task_done_label: None,
            captcha_options: None,
            captcha_retry_count: 0,
            artifact_buffer: None,
            artifact_timer: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn BrowserBackend> {
        &self.backend
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn step_id(&self) -> Option<&str> {
        self.step_id.as_deref()
    }

    pub fn step_index(&self) -> i64 {
        self.step_index
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn snapshot_options(&self) -> &SnapshotOptions {
        &self.snapshot_options
    }

    // ---------------------------------------------------------------- steps

    /// Begin a new step: clear per-step state, advance the index, emit
    /// `step_start`. Returns the `step-N` id.
    pub fn begin_step(
        &mut self,
        goal: &str,
        step_index: Option<i64>,
        emit_trace: bool,
        pre_url: Option<&str>,
    ) -> String {
        self.assertions_this_step.clear();
        self.step_pre_snapshot = None;
        self.step_pre_url = None;
        self.step_goal = Some(goal.to_string());
        self.last_action = None;
        self.last_action_error = None;
        self.last_action_outcome = None;
        self.last_action_duration_ms = None;
        self.last_action_success = None;

        self.step_index = step_index.unwrap_or(self.step_index + 1);
        let step_id = format!("step-{}", self.step_index);
        self.step_id = Some(step_id.clone());

        if emit_trace {
            let url = pre_url
                .map(String::from)
                .or_else(|| self.cached_url.clone())
                .unwrap_or_default();
            self.tracer
                .emit_step_start(&step_id, self.step_index, goal, 0, &url);
        }

        step_id
    }

    /// Compose and emit the `step_end` event; returns the payload.
    pub async fn emit_step_end(&mut self, params: StepEndParams) -> Value {
        let goal = self.step_goal.clone().unwrap_or_default();
        let pre_snap = self
            .step_pre_snapshot
            .as_ref()
            .or(self.last_snapshot.as_ref());
        let pre_url = self
            .step_pre_url
            .clone()
            .or_else(|| pre_snap.map(|s| s.url.clone()))
            .or_else(|| self.cached_url.clone())
            .unwrap_or_default();

        let pre_digest = compute_snapshot_digest(pre_snap);

        let post_url = match params.post_url {
            Some(url) => url,
            None => match self.get_url().await {
                Ok(url) => url,
                Err(_) => self
                    .last_snapshot
                    .as_ref()
                    .map(|s| s.url.clone())
                    .or_else(|| self.cached_url.clone())
                    .unwrap_or_else(|| pre_url.clone()),
            },
        };
        let post_url = if post_url.is_empty() {
            pre_url.clone()
        } else {
            post_url
        };

        let post_digest = compute_snapshot_digest(self.last_snapshot.as_ref());
        let url_changed = !pre_url.is_empty() && !post_url.is_empty() && pre_url != post_url;

        let mut signals = params.verify_signals;
        signals
            .entry("url_changed".to_string())
            .or_insert(json!(url_changed));
        if let Some(error) = &params.error {
            signals
                .entry("error".to_string())
                .or_insert(json!(error));
        }
        if self.task_done {
            signals
                .entry("task_done".to_string())
                .or_insert(json!(true));
            if let Some(label) = &self.task_done_label {
                signals
                    .entry("task_done_label".to_string())
                    .or_insert(json!(label));
            }
        }

        let passed = params
            .verify_passed
            .unwrap_or_else(|| self.required_assertions_passed());
        let exec_success = params
            .success
            .or(self.last_action_success)
            .unwrap_or(passed);

        let exec = ExecData {
            success: exec_success,
            action: params
                .action
                .or_else(|| self.last_action.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            outcome: params
                .outcome
                .or_else(|| self.last_action_outcome.clone())
                .unwrap_or_default(),
            duration_ms: params.duration_ms.or(self.last_action_duration_ms),
            error: params.error.or_else(|| self.last_action_error.clone()),
        };

        let assertions = self
            .assertions_this_step
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect();

        let payload = build_step_end_event(
            self.step_id.as_deref().unwrap_or(""),
            self.step_index,
            &goal,
            params.attempt,
            &pre_url,
            &post_url,
            pre_digest,
            post_digest,
            exec,
            VerifyData { passed, signals },
            assertions,
            params.llm_data.unwrap_or_else(|| json!({})),
        );
        self.tracer
            .emit("step_end", payload.clone(), self.step_id.as_deref());
        payload
    }

    /// Alias keeping the lifecycle naming symmetric with `begin_step`.
    pub async fn end_step(&mut self, params: StepEndParams) -> Value {
        self.emit_step_end(params).await
    }

    // ------------------------------------------------------------ snapshots

    pub async fn get_url(&mut self) -> Result<String, RuntimeError> {
        let url = self.backend.get_url().await?;
        self.cached_url = Some(url.clone());
        Ok(url)
    }

    /// Take a snapshot with the runtime's default options.
    pub async fn snapshot(&mut self) -> Result<Snapshot, RuntimeError> {
        let options = self.snapshot_options.clone();
        self.snapshot_inner(&options, true, false).await
    }

    /// Take a snapshot with explicit options.
    pub async fn snapshot_with(
        &mut self,
        options: &SnapshotOptions,
    ) -> Result<Snapshot, RuntimeError> {
        self.snapshot_inner(options, true, false).await
    }

    /// Default options with a different element cap.
    pub async fn snapshot_with_limit(&mut self, limit: u32) -> Result<Snapshot, RuntimeError> {
        let mut options = self.snapshot_options.clone();
        options.limit = clamp_snapshot_limit(limit);
        self.snapshot_inner(&options, true, false).await
    }

    pub(crate) async fn snapshot_inner(
        &mut self,
        options: &SnapshotOptions,
        emit_trace: bool,
        skip_captcha_handling: bool,
    ) -> Result<Snapshot, RuntimeError> {
        let snap = snapshot(self.backend.as_ref(), options).await?;

        self.cached_url = Some(snap.url.clone());
        if self.step_pre_snapshot.is_none() {
            self.step_pre_snapshot = Some(snap.clone());
            self.step_pre_url = Some(snap.url.clone());
        }
        self.last_snapshot = Some(snap.clone());

        if !skip_captcha_handling {
            self.handle_captcha_if_needed(&snap, CaptchaSource::Gateway)
                .await?;
        }

        if emit_trace {
            let format = match &options.screenshot {
                crate::models::ScreenshotRequest::Config(cfg) => Some(cfg.format),
                crate::models::ScreenshotRequest::Enabled(true) => Some(ImageFormat::Jpeg),
                crate::models::ScreenshotRequest::Enabled(false) => None,
            };
            self.tracer
                .emit_snapshot(&snap, self.step_id.as_deref(), self.step_index, format);
        }

        Ok(snap)
    }

    /// Union snapshot over K scroll positions; extraction only. Does NOT
    /// update `last_snapshot`, so verification loops keep seeing the live
    /// viewport.
    pub async fn sampled_snapshot(
        &mut self,
        sampling: &SampledSnapshotOptions,
    ) -> Result<Snapshot, RuntimeError> {
        let options = self.snapshot_options.clone();
        Ok(sampled_snapshot(self.backend.as_ref(), &options, sampling).await?)
    }

    // ----------------------------------------------------------- assertions

    fn build_context<'a>(
        snapshot: Option<&'a Snapshot>,
        cached_url: Option<&'a str>,
        step_id: Option<&'a str>,
        downloads: Option<&'a [DownloadRecord]>,
    ) -> AssertContext<'a> {
        AssertContext {
            snapshot,
            url: snapshot.map(|s| s.url.as_str()).or(cached_url),
            step_id,
            downloads,
        }
    }

    /// Evaluate a predicate against the current context.
    pub(crate) fn evaluate_predicate(&self, predicate: &Predicate) -> AssertOutcome {
        let downloads = self.backend.downloads();
        let ctx = Self::build_context(
            self.last_snapshot.as_ref(),
            self.cached_url.as_deref(),
            self.step_id.as_deref(),
            downloads.as_deref(),
        );
        predicate(&ctx)
    }

    /// Evaluate an assertion once, accumulate it, and emit a `verification`
    /// event. Required failures persist failure artifacts.
    pub async fn assert_(&mut self, predicate: &Predicate, label: &str, required: bool) -> bool {
        let outcome = self.evaluate_predicate(predicate);
        let passed = outcome.passed;
        self.record_outcome(outcome, label, required, "assert", true, Map::new());
        if required && !passed {
            self.persist_failure_artifacts(&format!("assert_failed:{label}"))
                .await;
        }
        passed
    }

    /// Required assertion that marks the task done when it passes.
    pub async fn assert_done(&mut self, predicate: &Predicate, label: &str) -> bool {
        let ok = self.assert_(predicate, label, true).await;
        if ok {
            self.task_done = true;
            self.task_done_label = Some(label.to_string());
            self.tracer.emit(
                "verification",
                json!({
                    "kind": "task_done",
                    "passed": true,
                    "label": label,
                }),
                self.step_id.as_deref(),
            );
        }
        ok
    }

    /// Build a fluent handle; does not evaluate.
    pub fn check<'a>(
        &'a mut self,
        predicate: Predicate,
        label: &str,
        required: bool,
    ) -> AssertionHandle<'a> {
        AssertionHandle::new(self, predicate, label.to_string(), required)
    }

    pub(crate) fn record_outcome(
        &mut self,
        outcome: AssertOutcome,
        label: &str,
        required: bool,
        kind: &str,
        record_in_step: bool,
        extra: Map<String, Value>,
    ) {
        let mut details = outcome.details;

        // Failure intelligence: suggest nearest elements for selector-driven
        // assertions that failed.
        if !outcome.passed
            && details.contains_key("selector")
            && !details.contains_key("nearest_matches")
            && let Some(snapshot) = &self.last_snapshot
        {
            let selector = details
                .get("selector")
                .and_then(Value::as_str)
                .unwrap_or_default();
            details.insert(
                "nearest_matches".to_string(),
                Value::Array(nearest_matches(snapshot, selector, 3)),
            );
        }

        let record = AssertionRecord {
            label: label.to_string(),
            passed: outcome.passed,
            required,
            reason: outcome.reason,
            details,
            kind: kind.to_string(),
            extra,
        };

        let mut event = serde_json::to_value(&record).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut event {
            map.insert("kind".to_string(), json!(kind));
        }
        self.tracer
            .emit("verification", event, self.step_id.as_deref());

        if record_in_step {
            self.assertions_this_step.push(record);
        }
    }

    pub fn assertions(&self) -> &[AssertionRecord] {
        &self.assertions_this_step
    }

    /// Drain and return the current step's assertions.
    pub fn flush_assertions(&mut self) -> Vec<AssertionRecord> {
        std::mem::take(&mut self.assertions_this_step)
    }

    pub fn all_assertions_passed(&self) -> bool {
        self.assertions_this_step.iter().all(|a| a.passed)
    }

    pub fn required_assertions_passed(&self) -> bool {
        self.assertions_this_step
            .iter()
            .filter(|a| a.required)
            .all(|a| a.passed)
    }

    pub fn is_task_done(&self) -> bool {
        self.task_done
    }

    /// Reset task-done state for multi-task runs.
    pub fn reset_task_done(&mut self) {
        self.task_done = false;
        self.task_done_label = None;
    }

    // --------------------------------------------------------------- scroll

    async fn scroll_metrics(&self) -> Value {
        // Single bounded expression; never dumps the DOM.
        let expr = r#"(() => {
  try {
    const el = document.scrollingElement || document.documentElement || document.body;
    const top = (el && typeof el.scrollTop === 'number')
      ? el.scrollTop
      : (typeof window.scrollY === 'number' ? window.scrollY : 0);
    const height = (el && typeof el.scrollHeight === 'number') ? el.scrollHeight : null;
    const client = (el && typeof el.clientHeight === 'number') ? el.clientHeight : null;
    return { top, height, client };
  } catch (e) {
    return { top: null, height: null, client: null, error: String(e && e.message ? e.message : e) };
  }
})()"#;
        match self.backend.eval(expr).await {
            Ok(v @ Value::Object(_)) => v,
            Ok(v) => json!({"top": v, "height": null, "client": null}),
            Err(e) => json!({"top": null, "height": null, "client": null, "error": e.to_string()}),
        }
    }

    /// Scroll and deterministically verify the page actually moved.
    ///
    /// Wheel first (most compatible); if it produced no movement, one bounded
    /// JS `scrollBy` fallback. Emits a `scroll_effective` assertion with the
    /// observed delta.
    pub async fn scroll_by(
        &mut self,
        dy: f64,
        options: ScrollOptions,
    ) -> Result<bool, RuntimeError> {
        let url = self.get_url().await.ok();
        self.record_action(&format!("scroll_by(dy={dy})"), url.as_deref())
            .await;

        if !options.verify {
            self.backend.wheel(dy, options.x, options.y).await?;
            return Ok(true);
        }

        let before = self.scroll_metrics().await;
        let before_top = before.get("top").and_then(Value::as_f64).unwrap_or(0.0);

        let mut used_js_fallback = false;
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs_f64(options.timeout_s.max(0.0));

        self.backend.wheel(dy, options.x, options.y).await?;

        loop {
            let after = self.scroll_metrics().await;
            let after_top = after
                .get("top")
                .and_then(Value::as_f64)
                .unwrap_or(before_top);
            let delta = after_top - before_top;
            let passed = delta.abs() >= options.min_delta_px;

            if passed {
                let outcome = AssertOutcome {
                    passed: true,
                    reason: String::new(),
                    details: details_map(json!({
                        "dy": dy,
                        "min_delta_px": options.min_delta_px,
                        "before": before,
                        "after": after,
                        "delta_px": delta,
                        "js_fallback_used": used_js_fallback,
                    })),
                };
                self.record_outcome(
                    outcome,
                    &options.label,
                    options.required,
                    "scroll",
                    true,
                    Map::new(),
                );
                return Ok(true);
            }

            if tokio::time::Instant::now() >= deadline {
                let outcome = AssertOutcome {
                    passed: false,
                    reason: format!(
                        "scroll delta {delta:.1}px < min_delta_px={:.1}px",
                        options.min_delta_px
                    ),
                    details: details_map(json!({
                        "dy": dy,
                        "min_delta_px": options.min_delta_px,
                        "before": before,
                        "after": after,
                        "delta_px": delta,
                        "js_fallback_used": used_js_fallback,
                        "timeout_s": options.timeout_s,
                    })),
                };
                self.record_outcome(
                    outcome,
                    &options.label,
                    options.required,
                    "scroll",
                    true,
                    Map::new(),
                );
                if options.required {
                    self.persist_failure_artifacts(&format!("scroll_failed:{}", options.label))
                        .await;
                }
                return Ok(false);
            }

            if options.js_fallback && !used_js_fallback && delta.abs() < 1.0 {
                used_js_fallback = true;
                self.backend
                    .eval(&format!("window.scrollBy(0, {dy})"))
                    .await?;
            }

            tokio::time::sleep(Duration::from_secs_f64(options.poll_s.max(0.0))).await;
        }
    }

    // ----------------------------------------------------- tabs/capabilities

    pub async fn list_tabs(&self) -> TabListResult {
        match self.backend.list_tabs().await {
            Ok(tabs) => TabListResult {
                ok: true,
                tabs,
                error: None,
            },
            Err(e) => TabListResult {
                ok: false,
                tabs: Vec::new(),
                error: Some(tab_error_string(e)),
            },
        }
    }

    pub async fn open_tab(&self, url: &str) -> TabOperationResult {
        tab_operation(self.backend.open_tab(url).await)
    }

    pub async fn switch_tab(&self, tab_id: &str) -> TabOperationResult {
        tab_operation(self.backend.switch_tab(tab_id).await)
    }

    pub async fn close_tab(&self, tab_id: &str) -> TabOperationResult {
        tab_operation(self.backend.close_tab(tab_id).await)
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    pub fn can(&self, capability: &str) -> bool {
        let caps = self.capabilities();
        match capability {
            "tabs" => caps.tabs,
            "evaluate_js" => caps.evaluate_js,
            "downloads" => caps.downloads,
            "filesystem_tools" => caps.filesystem_tools,
            "keyboard" => caps.keyboard,
            "permissions" => caps.permissions,
            _ => false,
        }
    }

    /// Bounded JS escape hatch; failures become `ok=false` results.
    pub async fn evaluate_js(&self, request: EvaluateJsRequest) -> EvaluateJsResult {
        PageControl::new(self.backend.clone())
            .evaluate_js(request)
            .await
    }

    // -------------------------------------------------------------- captcha

    /// Opt in to CAPTCHA handling. Detection runs on every snapshot until
    /// cleared.
    pub fn set_captcha_options(&mut self, options: CaptchaOptions) {
        self.captcha_options = Some(options);
        self.captcha_retry_count = 0;
    }

    fn is_captcha_detected(&self, snapshot: &Snapshot) -> bool {
        let Some(options) = &self.captcha_options else {
            return false;
        };
        snapshot
            .diagnostics
            .as_ref()
            .and_then(|d| d.captcha.as_ref())
            .is_some_and(|captcha| is_blocking_detection(captcha, options.min_confidence))
    }

    fn emit_captcha_event(&self, reason_code: &str, details: Value) {
        let mut data = json!({
            "kind": "captcha",
            "passed": false,
            "label": reason_code,
            "details": {"reason_code": reason_code},
        });
        if let (Some(map), Value::Object(extra)) =
            (data["details"].as_object_mut(), details)
        {
            for (k, v) in extra {
                map.insert(k, v);
            }
        }
        self.tracer
            .emit("verification", data, self.step_id.as_deref());
    }

    async fn handle_captcha_if_needed(
        &mut self,
        snapshot: &Snapshot,
        source: CaptchaSource,
    ) -> Result<(), RuntimeError> {
        let Some(options) = self.captcha_options.clone() else {
            return Ok(());
        };
        if !self.is_captcha_detected(snapshot) {
            return Ok(());
        }

        let captcha = snapshot
            .diagnostics
            .as_ref()
            .and_then(|d| d.captcha.clone());
        self.emit_captcha_event(
            "captcha_detected",
            json!({"captcha": captcha}),
        );

        let resolution = match options.policy {
            CaptchaPolicy::Abort => crate::captcha::CaptchaResolution::abort(),
            CaptchaPolicy::Callback => {
                let Some(handler) = &options.handler else {
                    self.emit_captcha_event("captcha_handler_error", json!({}));
                    return Err(CaptchaError::new(
                        "captcha_handler_error",
                        "Captcha handler is required for policy=callback.",
                    )
                    .into());
                };
                let ctx = CaptchaContext {
                    run_id: self.tracer.run_id().to_string(),
                    step_index: self.step_index,
                    url: snapshot.url.clone(),
                    source,
                    captcha: snapshot
                        .diagnostics
                        .as_ref()
                        .and_then(|d| d.captcha.clone()),
                    page_control: PageControl::new(self.backend.clone()),
                };
                match handler.on_captcha(ctx).await {
                    Ok(resolution) => resolution,
                    Err(e) => {
                        self.emit_captcha_event(
                            "captcha_handler_error",
                            json!({"error": e.to_string()}),
                        );
                        return Err(CaptchaError::new(
                            "captcha_handler_error",
                            "Captcha handler failed.",
                        )
                        .into());
                    }
                }
            }
        };

        self.apply_captcha_resolution(resolution, &options, source)
            .await
    }

    async fn apply_captcha_resolution(
        &mut self,
        resolution: crate::captcha::CaptchaResolution,
        options: &CaptchaOptions,
        source: CaptchaSource,
    ) -> Result<(), RuntimeError> {
        match resolution.action {
            CaptchaAction::Abort => {
                self.emit_captcha_event(
                    "captcha_policy_abort",
                    json!({"message": resolution.message}),
                );
                Err(CaptchaError::new(
                    "captcha_policy_abort",
                    resolution
                        .message
                        .unwrap_or_else(|| "Captcha detected. Aborting per policy.".to_string()),
                )
                .into())
            }
            CaptchaAction::RetryNewSession => {
                self.captcha_retry_count += 1;
                self.emit_captcha_event("captcha_retry_new_session", json!({}));
                if self.captcha_retry_count > options.max_retries_new_session {
                    self.emit_captcha_event("captcha_retry_exhausted", json!({}));
                    return Err(CaptchaError::new(
                        "captcha_retry_exhausted",
                        "Captcha retry_new_session exhausted.",
                    )
                    .into());
                }
                let Some(reset) = &options.reset_session else {
                    return Err(CaptchaError::new(
                        "captcha_retry_new_session",
                        "reset_session is required for retry_new_session.",
                    )
                    .into());
                };
                reset.reset().await?;
                Ok(())
            }
            CaptchaAction::WaitUntilCleared => {
                let timeout_ms = resolution.timeout_ms.unwrap_or(options.timeout_ms);
                let poll_ms = resolution.poll_ms.unwrap_or(options.poll_ms);
                self.wait_until_captcha_cleared(timeout_ms, poll_ms, source)
                    .await?;
                self.emit_captcha_event("captcha_resumed", json!({}));
                Ok(())
            }
        }
    }

    async fn wait_until_captcha_cleared(
        &mut self,
        timeout_ms: u64,
        poll_ms: u64,
        source: CaptchaSource,
    ) -> Result<(), RuntimeError> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() <= deadline {
            tokio::time::sleep(Duration::from_millis(poll_ms)).await;
            let options = self.snapshot_options.clone();
            // Detection suppressed while polling, or we would recurse.
            let snap = Box::pin(self.snapshot_inner(&options, false, true)).await?;
            if !self.is_captcha_detected(&snap) {
                self.emit_captcha_event("captcha_cleared", json!({"source": source}));
                return Ok(());
            }
        }
        self.emit_captcha_event("captcha_wait_timeout", json!({"timeout_ms": timeout_ms}));
        Err(CaptchaError::new("captcha_wait_timeout", "Captcha wait_until_cleared timed out.").into())
    }

    // ------------------------------------------------------------ artifacts

    /// Allocate the artifact ring buffer and start the frame timer if
    /// `fps > 0`.
    pub fn enable_failure_artifacts(
        &mut self,
        options: FailureArtifactsOptions,
    ) -> Result<(), ArtifactError> {
        self.disable_failure_artifacts();
        let fps = options.fps;
        let frame_format = options.frame_format;
        let buffer = Arc::new(Mutex::new(FailureArtifactBuffer::new(
            self.tracer.run_id(),
            options,
        )?));
        self.artifact_buffer = Some(buffer.clone());

        if fps > 0.0 {
            let token = CancellationToken::new();
            let child = token.clone();
            let backend = self.backend.clone();
            let interval = Duration::from_secs_f64(1.0 / fps.max(0.001));
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = child.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            capture_frame_into(backend.as_ref(), &buffer, frame_format).await;
                        }
                    }
                }
                debug!("artifact frame timer stopped");
            });
            self.artifact_timer = Some((token, task));
        }
        Ok(())
    }

    /// Stop background capture and drop the buffer.
    pub fn disable_failure_artifacts(&mut self) {
        if let Some((token, _task)) = self.artifact_timer.take() {
            token.cancel();
        }
        self.artifact_buffer = None;
    }

    /// Record an action into the artifact timeline, capturing one frame when
    /// configured.
    pub async fn record_action(&mut self, action: &str, url: Option<&str>) {
        self.last_action = Some(action.to_string());
        let Some(buffer) = self.artifact_buffer.clone() else {
            return;
        };
        let (capture, format) = {
            let mut guard = buffer.lock().await;
            guard.record_step(action, self.step_id.as_deref(), self.step_index, url);
            (guard.options().capture_on_action, guard.options().frame_format)
        };
        if capture {
            capture_frame_into(self.backend.as_ref(), &buffer, format).await;
        }
    }

    /// Note the outcome of the last executed action (used by the executor
    /// loop; folded into `step_end`).
    pub fn note_action_result(
        &mut self,
        success: bool,
        outcome: Option<&str>,
        error: Option<&str>,
        duration_ms: Option<i64>,
    ) {
        self.last_action_success = Some(success);
        self.last_action_outcome = outcome.map(String::from);
        self.last_action_error = error.map(String::from);
        self.last_action_duration_ms = duration_ms;
    }

    pub(crate) async fn persist_failure_artifacts(&mut self, reason: &str) {
        let Some(buffer) = self.artifact_buffer.clone() else {
            return;
        };
        let metadata = self.artifact_metadata();
        let persist_mode = {
            let mut guard = buffer.lock().await;
            if let Err(e) = guard
                .persist(
                    Some(reason),
                    PersistStatus::Failure,
                    self.last_snapshot.as_ref(),
                    self.last_snapshot
                        .as_ref()
                        .and_then(|s| s.diagnostics.as_ref()),
                    metadata,
                )
                .await
            {
                warn!("failure artifact persist failed: {e}");
            }
            guard.cleanup();
            guard.options().persist_mode
        };
        if persist_mode == PersistMode::OnFail {
            self.disable_failure_artifacts();
        }
    }

    /// Finalize the buffer at the end of the run.
    pub async fn finalize_run(&mut self, success: bool) {
        let Some(buffer) = self.artifact_buffer.clone() else {
            return;
        };
        if success {
            let persist_always = buffer.lock().await.options().persist_mode == PersistMode::Always;
            if persist_always {
                let metadata = self.artifact_metadata();
                let mut guard = buffer.lock().await;
                if let Err(e) = guard
                    .persist(
                        Some("success"),
                        PersistStatus::Success,
                        self.last_snapshot.as_ref(),
                        self.last_snapshot
                            .as_ref()
                            .and_then(|s| s.diagnostics.as_ref()),
                        metadata,
                    )
                    .await
                {
                    warn!("artifact persist failed: {e}");
                }
            }
            buffer.lock().await.cleanup();
            self.disable_failure_artifacts();
        } else {
            self.persist_failure_artifacts("finalize_failure").await;
            self.disable_failure_artifacts();
        }
    }

    fn artifact_metadata(&self) -> Map<String, Value> {
        let url = self
            .last_snapshot
            .as_ref()
            .map(|s| s.url.clone())
            .or_else(|| self.cached_url.clone());
        let mut map = Map::new();
        map.insert("backend".to_string(), json!(self.backend.name()));
        map.insert("url".to_string(), json!(url));
        map
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        if let Some((token, _)) = self.artifact_timer.take() {
            token.cancel();
        }
    }
}

async fn capture_frame_into(
    backend: &dyn BrowserBackend,
    buffer: &Arc<Mutex<FailureArtifactBuffer>>,
    format: ImageFormat,
) {
    let bytes = match format {
        ImageFormat::Jpeg => backend.screenshot_jpeg(None).await,
        ImageFormat::Png => backend.screenshot_png().await,
    };
    match bytes {
        Ok(bytes) => {
            if let Err(e) = buffer.lock().await.add_frame(&bytes, format) {
                warn!("failed to buffer frame: {e}");
            }
        }
        Err(e) => debug!("frame capture failed: {e}"),
    }
}

fn tab_error_string(e: BackendError) -> String {
    match e {
        BackendError::UnsupportedCapability(_) => "unsupported_capability".to_string(),
        other => other.to_string(),
    }
}

fn tab_operation(
    result: Result<crate::models::TabInfo, BackendError>,
) -> TabOperationResult {
    match result {
        Ok(tab) => TabOperationResult {
            ok: true,
            tab: Some(tab),
            error: None,
        },
        Err(e) => TabOperationResult {
            ok: false,
            tab: None,
            error: Some(tab_error_string(e)),
        },
    }
}

fn details_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// `sha256(url|timestamp)` digest used to correlate snapshots in `step_end`.
fn compute_snapshot_digest(snapshot: Option<&Snapshot>) -> Option<String> {
    let snapshot = snapshot?;
    let mut hasher = Sha256::new();
    hasher.update(snapshot.url.as_bytes());
    if let Some(ts) = &snapshot.timestamp {
        hasher.update(ts.as_bytes());
    }
    Some(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Character-bigram similarity for nearest-match suggestions.
fn similarity_ratio(a: &str, b: &str) -> f64 {
    fn bigrams(s: &str) -> Vec<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let ba = bigrams(a);
    let mut bb = bigrams(b);
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }
    let mut overlap = 0usize;
    for bigram in &ba {
        if let Some(pos) = bb.iter().position(|x| x == bigram) {
            bb.swap_remove(pos);
            overlap += 1;
        }
    }
    (2.0 * overlap as f64) / (ba.len() + bigrams(b).len()) as f64
}

fn nearest_matches(snapshot: &Snapshot, selector: &str, limit: usize) -> Vec<Value> {
    let needle = selector.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(f64, &crate::models::Element)> = snapshot
        .elements
        .iter()
        .filter_map(|el| {
            let hay = el
                .name
                .as_deref()
                .or(el.text.as_deref())
                .unwrap_or("")
                .trim()
                .to_lowercase();
            if hay.is_empty() {
                return None;
            }
            Some((similarity_ratio(&needle, &hay), el))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(limit)
        .map(|(score, el)| {
            json!({
                "id": el.id,
                "role": el.role,
                "text": el.text.as_deref().map(|t| t.chars().take(80).collect::<String>()),
                "name": el.name.as_deref().map(|n| n.chars().take(80).collect::<String>()),
                "score": (score * 10_000.0).round() / 10_000.0,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_ratio_orders_sensibly() {
        let a = similarity_ratio("submit order", "submit order");
        let b = similarity_ratio("submit order", "submit");
        let c = similarity_ratio("submit order", "cancel");
        assert!(a > b && b > c);
        assert_eq!(similarity_ratio("", "x"), 0.0);
    }

    #[test]
    fn snapshot_digest_is_prefixed_and_stable() {
        let snap = Snapshot {
            status: crate::models::SnapshotStatus::Success,
            url: "https://example.com".to_string(),
            timestamp: Some("2024-01-01T00:00:00Z".to_string()),
            viewport: None,
            elements: vec![],
            screenshot: None,
            screenshot_format: None,
            diagnostics: None,
            error: None,
        };
        let a = compute_snapshot_digest(Some(&snap)).expect("digest");
        let b = compute_snapshot_digest(Some(&snap)).expect("digest");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
        assert!(compute_snapshot_digest(None).is_none());
    }
}
