//! Narrow browser-control port consumed by the runtime.
//!
//! The core never talks to a browser outside this contract. Optional
//! operations (tabs, downloads, permissions) default to
//! [`BackendError::UnsupportedCapability`]; callers discover support through
//! [`BrowserBackend::capabilities`] and fail fast otherwise.

pub mod chromium;
pub mod launch;

pub use chromium::ChromiumBackend;
pub use launch::{BrowserHandle, find_browser_executable, launch_browser};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{DownloadRecord, Geolocation, TabInfo};

/// Document ready states, ordered by load progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Loading => "loading",
            ReadyState::Interactive => "interactive",
            ReadyState::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loading" => Some(ReadyState::Loading),
            "interactive" => Some(ReadyState::Interactive),
            "complete" => Some(ReadyState::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

/// Capability record for explicit discovery.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub tabs: bool,
    pub evaluate_js: bool,
    pub downloads: bool,
    pub filesystem_tools: bool,
    pub keyboard: bool,
    pub permissions: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported_capability: {0}")]
    UnsupportedCapability(&'static str),

    #[error("evaluation failed: {0}")]
    Eval(String),

    #[error("timed out waiting for ready state '{state}' after {timeout_ms}ms")]
    ReadyStateTimeout { state: ReadyState, timeout_ms: u64 },

    #[error("browser error: {0}")]
    Browser(String),

    #[error("screenshot failed: {0}")]
    Screenshot(String),
}

impl BackendError {
    /// Stable reason code for traces and error switching.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BackendError::UnsupportedCapability(_) => "unsupported_capability",
            BackendError::Eval(_) => "eval_failed",
            BackendError::ReadyStateTimeout { .. } => "ready_state_timeout",
            BackendError::Browser(_) => "browser_error",
            BackendError::Screenshot(_) => "screenshot_failed",
        }
    }
}

/// Scroll geometry collected by [`BrowserBackend::page_info`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PageInfo {
    pub width: f64,
    pub height: f64,
    pub scroll_x: f64,
    pub scroll_y: f64,
}

/// The browser-control contract. Keep this narrow: everything the runtime
/// needs and nothing it doesn't.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Short backend name for artifact metadata and logs.
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn get_url(&self) -> Result<String, BackendError>;

    /// Evaluate a JS expression; the result must be JSON-serializable.
    async fn eval(&self, code: &str) -> Result<Value, BackendError>;

    /// Poll `document.readyState` until it reaches `state` or the timeout.
    async fn wait_ready_state(
        &self,
        state: ReadyState,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(Value::String(s)) = self.eval("document.readyState").await
                && ReadyState::parse(&s).is_some_and(|current| current >= state)
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::ReadyStateTimeout {
                    state,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<(), BackendError>;

    async fn mouse_click(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
    ) -> Result<(), BackendError>;

    async fn wheel(
        &self,
        delta_y: f64,
        x: Option<f64>,
        y: Option<f64>,
    ) -> Result<(), BackendError>;

    async fn type_text(&self, text: &str) -> Result<(), BackendError>;

    async fn press_key(&self, key: &str) -> Result<(), BackendError>;

    async fn screenshot_png(&self) -> Result<Vec<u8>, BackendError>;

    async fn screenshot_jpeg(&self, quality: Option<u8>) -> Result<Vec<u8>, BackendError>;

    /// Viewport and scroll geometry. Default goes through `eval`.
    async fn page_info(&self) -> Result<PageInfo, BackendError> {
        let value = self
            .eval(
                "(() => ({ width: window.innerWidth, height: window.innerHeight, \
                 scroll_x: window.scrollX, scroll_y: window.scrollY }))()",
            )
            .await?;
        serde_json::from_value(value).map_err(|e| BackendError::Eval(e.to_string()))
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            evaluate_js: true,
            keyboard: true,
            ..Default::default()
        }
    }

    // Optional: tab management.
    async fn list_tabs(&self) -> Result<Vec<TabInfo>, BackendError> {
        Err(BackendError::UnsupportedCapability("tabs"))
    }

    async fn open_tab(&self, _url: &str) -> Result<TabInfo, BackendError> {
        Err(BackendError::UnsupportedCapability("tabs"))
    }

    async fn switch_tab(&self, _tab_id: &str) -> Result<TabInfo, BackendError> {
        Err(BackendError::UnsupportedCapability("tabs"))
    }

    async fn close_tab(&self, _tab_id: &str) -> Result<TabInfo, BackendError> {
        Err(BackendError::UnsupportedCapability("tabs"))
    }

    /// Optional: downloads observed by the backend.
    fn downloads(&self) -> Option<Vec<DownloadRecord>> {
        None
    }

    // Optional: permissions.
    async fn grant_permissions(
        &self,
        _permissions: &[String],
        _origin: Option<&str>,
    ) -> Result<(), BackendError> {
        Err(BackendError::UnsupportedCapability("permissions"))
    }

    async fn clear_permissions(&self) -> Result<(), BackendError> {
        Err(BackendError::UnsupportedCapability("permissions"))
    }

    async fn set_geolocation(&self, _geolocation: Geolocation) -> Result<(), BackendError> {
        Err(BackendError::UnsupportedCapability("permissions"))
    }
}

/// Apply a startup permission policy to a backend.
///
/// Grants every `auto_grant` permission (scoped to `origin` when set) and
/// applies the geolocation override. Fails fast with
/// `unsupported_capability` when the backend has no permission support;
/// callers that treat permissions as optional should check
/// `capabilities().permissions` first.
pub async fn apply_permission_policy(
    backend: &dyn BrowserBackend,
    policy: &crate::models::PermissionPolicy,
) -> Result<(), BackendError> {
    if !policy.auto_grant.is_empty() {
        backend
            .grant_permissions(&policy.auto_grant, policy.origin.as_deref())
            .await?;
    }
    if let Some(geolocation) = policy.geolocation {
        backend.set_geolocation(geolocation).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_state_ordering() {
        assert!(ReadyState::Complete > ReadyState::Interactive);
        assert!(ReadyState::Interactive > ReadyState::Loading);
        assert_eq!(ReadyState::parse("interactive"), Some(ReadyState::Interactive));
        assert_eq!(ReadyState::parse("weird"), None);
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(
            BackendError::UnsupportedCapability("tabs").reason_code(),
            "unsupported_capability"
        );
        assert_eq!(
            BackendError::ReadyStateTimeout {
                state: ReadyState::Interactive,
                timeout_ms: 100
            }
            .reason_code(),
            "ready_state_timeout"
        );
    }
}
