//! Verification-first browser agent runtime.
//!
//! Drives a browser on behalf of an LLM-planned agent and, at every step,
//! issues deterministic, retrying verifications against a structured page
//! snapshot: snapshot the DOM, propose an action, execute it, wait for the
//! page to settle, then evaluate predicates with bounded retry, confidence
//! gating, and an optional vision fallback. Every outcome is a structured
//! trace event; failures persist a ring-buffered artifact bundle.

pub mod agent;
pub mod artifacts;
pub mod backend;
pub mod captcha;
pub mod llm;
pub mod models;
pub mod runtime;
pub mod snapshot;
pub mod trace;
pub mod verification;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserConfig,

    /// Default element cap for snapshots.
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: u32,

    /// Default artifact output directory.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
}

/// Browser security and launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Run browser in headless mode
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Disable web security features (Same-Origin Policy, etc.)
    /// WARNING: Only enable for trusted content
    #[serde(default = "default_disable_security")]
    pub disable_security: bool,

    /// Window dimensions
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_width")]
    pub width: u32,

    #[serde(default = "default_window_height")]
    pub height: u32,
}

fn default_snapshot_limit() -> u32 {
    models::SNAPSHOT_LIMIT_DEFAULT
}

fn default_artifact_dir() -> String {
    ".veristep/artifacts".to_string()
}

fn default_headless() -> bool {
    true
}

fn default_disable_security() -> bool {
    false // SECURE BY DEFAULT
}

fn default_window_width() -> u32 {
    1280
}

fn default_window_height() -> u32 {
    720
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browser: BrowserConfig::default(),
            snapshot_limit: default_snapshot_limit(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            disable_security: default_disable_security(),
            window: WindowConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_window_width(),
            height: default_window_height(),
        }
    }
}

/// Load config from config.yaml in the package root, falling back to
/// defaults when absent.
pub fn load_yaml_config() -> anyhow::Result<Config> {
    let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config.yaml");

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

pub use agent::{
    Action, AgentError, ParsedAction, RuntimeAgent, RuntimeStep, StepHookContext,
    StepVerification, parse_action,
};
pub use artifacts::{
    ClipMode, ClipOptions, FailureArtifactBuffer, FailureArtifactsOptions, PersistMode,
    PersistStatus, RedactionContext, RedactionResult,
};
pub use backend::{
    BackendCapabilities, BackendError, BrowserBackend, BrowserHandle, ChromiumBackend,
    MouseButton, ReadyState, apply_permission_policy, find_browser_executable, launch_browser,
};
pub use captcha::{
    CaptchaAction, CaptchaContext, CaptchaError, CaptchaHandler, CaptchaOptions, CaptchaPolicy,
    CaptchaResolution, CaptchaSource, PageControl, SessionReset,
};
pub use llm::{LLMError, LLMProvider, LLMResponse};
pub use models::{
    BBox, CaptchaDiagnostics, CaptchaEvidence, DownloadRecord, Element, EvaluateJsRequest,
    EvaluateJsResult, Geolocation, ImageFormat, LLMStepData, PermissionPolicy,
    PermissionRecoveryConfig, ScreenshotConfig, ScreenshotRequest, Snapshot,
    SnapshotDiagnostics, SnapshotFilter, SnapshotOptions, SnapshotStatus, TabInfo, Viewport,
    VisualCues,
};
pub use runtime::{
    AgentRuntime, AssertionHandle, AssertionRecord, EventuallyOptions, GrowthApply,
    RuntimeError, ScrollOptions, SnapshotLimitGrowth, StepEndParams,
};
pub use snapshot::{
    GatewayError, SampledSnapshotOptions, SnapshotError, merge_snapshots, sampled_snapshot,
    snapshot,
};
pub use trace::{JsonlTraceSink, MemorySink, TraceEvent, TraceSink, Tracer};
pub use verification::{
    AssertContext, AssertOutcome, Predicate, Selector, exists, has_download, is_checked,
    is_disabled, is_enabled, is_expanded, predicate, url_contains, url_matches, value_contains,
    value_equals,
};
