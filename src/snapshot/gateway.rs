//! Snapshot refinement gateway client.
//!
//! Posts the raw producer result to the refinement service, which returns
//! re-ranked `elements` and `diagnostics`. Structured gateway errors are
//! surfaced verbatim; transport failures let the caller fall back to the raw
//! local snapshot.

use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::models::SnapshotOptions;

/// Default refinement service endpoint.
pub const VERISTEP_API_URL: &str = "https://api.veristep.dev";

/// Error returned by the refinement service itself (non-2xx with a JSON
/// body). Preserved unchanged for callers.
#[derive(Debug, Clone, Error)]
#[error("gateway error ({status}): {message}")]
pub struct GatewayError {
    pub status: u16,
    pub message: String,
    /// Raw response body, verbatim.
    pub body: Value,
}

/// Transport-level failure (connect, timeout, non-JSON response). The caller
/// falls back to the local snapshot on these.
#[derive(Debug, Error)]
pub enum GatewayCallError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("gateway transport error: {0}")]
    Transport(String),
}

/// Build the refinement request payload from the raw producer result.
pub(crate) fn build_payload(raw: &Value, options: &SnapshotOptions) -> Value {
    json!({
        "raw_elements": raw.get("elements").cloned().unwrap_or(Value::Array(vec![])),
        "url": raw.get("url").cloned().unwrap_or(Value::Null),
        "viewport": raw.get("viewport").cloned().unwrap_or(Value::Null),
        "goal": options.goal,
        "options": {
            "limit": options.limit,
            "filter": options.filter,
        },
    })
}

/// Merge the gateway response into the raw local result: server `elements`
/// and `diagnostics` replace the local ranking, everything collected locally
/// (screenshot in particular) is preserved.
pub(crate) fn merge_api_result(api: &Value, raw: &Value) -> Value {
    let mut merged = raw.clone();
    if let (Value::Object(merged_map), Value::Object(api_map)) = (&mut merged, api) {
        for key in ["elements", "diagnostics"] {
            if let Some(v) = api_map.get(key) {
                merged_map.insert(key.to_string(), v.clone());
            }
        }
    }
    merged
}

/// POST the payload to the refinement endpoint.
pub(crate) async fn refine_snapshot(
    payload: &Value,
    api_key: &str,
    api_url: &str,
    timeout_s: f64,
) -> Result<Value, GatewayCallError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs_f64(timeout_s.max(0.001)))
        .build()
        .map_err(|e| GatewayCallError::Transport(e.to_string()))?;

    let url = url::Url::parse(api_url)
        .and_then(|u| u.join("/v1/snapshot"))
        .map_err(|e| GatewayCallError::Transport(format!("invalid gateway url: {e}")))?;
    debug!("Refining snapshot via {url}");

    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(payload)
        .send()
        .await
        .map_err(|e| GatewayCallError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body
            .get("error")
            .and_then(|e| e.as_str().map(String::from).or_else(|| {
                e.get("message").and_then(|m| m.as_str()).map(String::from)
            }))
            .unwrap_or_else(|| format!("HTTP {status}"));
        return Err(GatewayError {
            status: status.as_u16(),
            message,
            body,
        }
        .into());
    }

    response
        .json()
        .await
        .map_err(|e| GatewayCallError::Transport(e.to_string()))
}
