//! Snapshot acquisition through the backend port.
//!
//! The in-page snapshot producer ships separately (a content script exposing
//! `window.veristep.snapshot(options)`); this module waits for it, invokes it
//! with navigation-in-flight retries, optionally routes the raw result
//! through the refinement gateway, and deserializes the final snapshot.

pub mod gateway;
mod merge;

pub use gateway::{GatewayCallError, GatewayError, VERISTEP_API_URL};
pub use merge::merge_snapshots;

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{BackendError, BrowserBackend, ReadyState};
use crate::models::{ScreenshotRequest, Snapshot, SnapshotOptions, clamp_snapshot_limit};

const READINESS_TIMEOUT: Duration = Duration::from_secs(5);
const READINESS_POLL: Duration = Duration::from_millis(100);
const NAVIGATION_RETRIES: u32 = 10;
const NAVIGATION_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot facility not loaded within {timeout_ms}ms")]
    ExtensionNotLoaded {
        timeout_ms: u64,
        /// Best-effort page-side diagnostics gathered at timeout.
        diagnostics: Value,
    },

    #[error("snapshot facility returned no data{}", url.as_deref().map(|u| format!(" (url: {u})")).unwrap_or_default())]
    Null { url: Option<String> },

    #[error("snapshot result did not deserialize: {0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SnapshotError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            SnapshotError::ExtensionNotLoaded { .. } => "extension_not_loaded",
            SnapshotError::Null { .. } => "snapshot_null",
            SnapshotError::Invalid(_) => "snapshot_invalid",
            SnapshotError::Backend(_) => "backend_error",
            SnapshotError::Gateway(_) => "gateway_error",
        }
    }
}

/// Navigation tears down the execution context; these signatures mark evals
/// that should be retried once the new document settles.
fn is_execution_context_destroyed(e: &BackendError) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("execution context was destroyed")
        || msg.contains("most likely because of a navigation")
        || msg.contains("cannot find context with specified id")
}

/// Evaluate JS, retrying while a navigation is in flight.
///
/// Covers the common "press Enter, snapshot immediately" race: wait for the
/// new document to reach `interactive`, then retry with a capped backoff.
async fn eval_with_navigation_retry(
    backend: &dyn BrowserBackend,
    expression: &str,
) -> Result<Value, BackendError> {
    let mut last_err: Option<BackendError> = None;
    for attempt in 0..=NAVIGATION_RETRIES {
        match backend.eval(expression).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_execution_context_destroyed(&e) || attempt >= NAVIGATION_RETRIES {
                    return Err(e);
                }
                debug!("eval hit navigation in flight (attempt {attempt}), retrying");
                if let Err(settle_err) = backend
                    .wait_ready_state(ReadyState::Interactive, NAVIGATION_SETTLE_TIMEOUT)
                    .await
                {
                    // readyState polling can also fail mid-nav; retry anyway.
                    debug!("ready-state settle failed: {settle_err}");
                }
                let backoff = Duration::from_millis((250 * (attempt as u64 + 1)).min(1500));
                tokio::time::sleep(backoff).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| BackendError::Eval("eval failed".to_string())))
}

/// Poll until the in-page snapshot function exists, or fail with diagnostics.
async fn wait_for_snapshot_api(backend: &dyn BrowserBackend) -> Result<(), SnapshotError> {
    let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
    loop {
        match backend
            .eval(
                "typeof window.veristep !== 'undefined' && \
                 typeof window.veristep.snapshot === 'function'",
            )
            .await
        {
            Ok(Value::Bool(true)) => return Ok(()),
            Ok(_) => {}
            Err(e) => debug!("snapshot readiness poll failed: {e}"),
        }

        if tokio::time::Instant::now() >= deadline {
            let diagnostics = backend
                .eval(
                    "(() => ({ \
                       veristep_defined: typeof window.veristep !== 'undefined', \
                       veristep_snapshot: typeof window.veristep?.snapshot === 'function', \
                       url: window.location.href \
                     }))()",
                )
                .await
                .unwrap_or(Value::Null);
            return Err(SnapshotError::ExtensionNotLoaded {
                timeout_ms: READINESS_TIMEOUT.as_millis() as u64,
                diagnostics,
            });
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
}

/// Options passed to the in-page producer.
fn build_producer_options(options: &SnapshotOptions) -> Value {
    let mut out = serde_json::Map::new();
    match &options.screenshot {
        ScreenshotRequest::Enabled(false) => {}
        ScreenshotRequest::Enabled(true) => {
            out.insert("screenshot".to_string(), Value::Bool(true));
        }
        ScreenshotRequest::Config(cfg) => {
            out.insert(
                "screenshot".to_string(),
                serde_json::to_value(cfg).unwrap_or(Value::Bool(true)),
            );
        }
    }
    out.insert(
        "limit".to_string(),
        Value::from(clamp_snapshot_limit(options.limit)),
    );
    if let Some(goal) = &options.goal {
        out.insert("goal".to_string(), Value::String(goal.clone()));
    }
    if let Some(filter) = &options.filter {
        out.insert(
            "filter".to_string(),
            serde_json::to_value(filter).unwrap_or(Value::Null),
        );
    }
    Value::Object(out)
}

async fn invoke_producer(
    backend: &dyn BrowserBackend,
    producer_options: &Value,
) -> Result<Value, SnapshotError> {
    let expression = format!(
        "(() => {{\n  const options = {};\n  return window.veristep.snapshot(options);\n}})()",
        serde_json::to_string(producer_options).unwrap_or_else(|_| "{}".to_string())
    );
    let result = eval_with_navigation_retry(backend, &expression).await?;
    if result.is_null() {
        let url = backend
            .eval("window.location.href")
            .await
            .ok()
            .and_then(|v| v.as_str().map(String::from));
        return Err(SnapshotError::Null { url });
    }
    Ok(result)
}

fn deserialize_snapshot(value: Value) -> Result<Snapshot, SnapshotError> {
    serde_json::from_value(value).map_err(|e| SnapshotError::Invalid(e.to_string()))
}

/// Take a snapshot of the current page.
///
/// With `use_api` enabled (explicitly, or implicitly by supplying an API key)
/// the raw producer result is posted to the refinement gateway and the
/// server ranking replaces the local one; on transport failure the raw local
/// result is used, while structured gateway errors surface unchanged.
pub async fn snapshot(
    backend: &dyn BrowserBackend,
    options: &SnapshotOptions,
) -> Result<Snapshot, SnapshotError> {
    wait_for_snapshot_api(backend).await?;

    let producer_options = build_producer_options(options);
    let raw = invoke_producer(backend, &producer_options).await?;

    let use_api = options.use_api.unwrap_or(options.api_key.is_some());
    if use_api && let Some(api_key) = options.api_key.as_deref() {
        let payload = gateway::build_payload(&raw, options);
        match gateway::refine_snapshot(
            &payload,
            api_key,
            VERISTEP_API_URL,
            options.gateway_timeout_s,
        )
        .await
        {
            Ok(api_result) => {
                return deserialize_snapshot(gateway::merge_api_result(&api_result, &raw));
            }
            Err(GatewayCallError::Gateway(e)) => return Err(e.into()),
            Err(GatewayCallError::Transport(e)) => {
                warn!("Snapshot refinement unavailable, using local result: {e}");
            }
        }
    }

    deserialize_snapshot(raw)
}

/// Options for [`sampled_snapshot`].
#[derive(Debug, Clone)]
pub struct SampledSnapshotOptions {
    pub samples: u32,
    /// Scroll distance between samples; defaults to 90% of viewport height.
    pub scroll_delta_y: Option<f64>,
    pub settle_ms: u64,
    pub union_limit: Option<usize>,
    pub restore_scroll: bool,
}

impl Default for SampledSnapshotOptions {
    fn default() -> Self {
        Self {
            samples: 4,
            scroll_delta_y: None,
            settle_ms: 250,
            union_limit: None,
            restore_scroll: true,
        }
    }
}

/// Take K snapshots while scrolling and merge them into a union snapshot.
///
/// For long or virtualized pages where one viewport misses most content. The
/// merged snapshot is extraction-only: bboxes are not click-safe.
pub async fn sampled_snapshot(
    backend: &dyn BrowserBackend,
    options: &SnapshotOptions,
    sampling: &SampledSnapshotOptions,
) -> Result<Snapshot, SnapshotError> {
    let samples = sampling.samples.max(1);
    if samples == 1 {
        return snapshot(backend, options).await;
    }

    let (base_scroll_y, viewport_height) = match backend.page_info().await {
        Ok(info) => (info.scroll_y, info.height),
        Err(_) => (0.0, 800.0),
    };

    let mut delta = sampling.scroll_delta_y.unwrap_or(viewport_height * 0.9);
    if delta <= 0.0 {
        delta = (viewport_height * 0.9).max(200.0);
    }

    let mut snaps = Vec::with_capacity(samples as usize);
    let result = async {
        snaps.push(snapshot(backend, options).await?);
        for _ in 1..samples {
            if let Err(e) = backend.wheel(delta, None, None).await {
                // Wheel can be refused by some backends; fall back to scrollBy.
                debug!("wheel failed during sampling ({e}), trying scrollBy");
                if backend
                    .eval(&format!("window.scrollBy(0, {delta})"))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            if sampling.settle_ms > 0 {
                tokio::time::sleep(Duration::from_millis(sampling.settle_ms)).await;
            }
            snaps.push(snapshot(backend, options).await?);
        }
        Ok::<_, SnapshotError>(())
    }
    .await;

    if sampling.restore_scroll {
        if backend
            .eval(&format!("window.scrollTo(0, {base_scroll_y})"))
            .await
            .is_err()
        {
            debug!("failed to restore scroll position after sampling");
        } else if sampling.settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(sampling.settle_ms.min(200))).await;
        }
    }

    result?;
    merge_snapshots(&snaps, sampling.union_limit)
        .ok_or_else(|| SnapshotError::Invalid("no samples collected".to_string()))
}
