//! Core data model: snapshots, elements, diagnostics, and snapshot options.
//!
//! A `Snapshot` is an immutable point-in-time capture of the page produced by
//! the in-page snapshot facility (`window.veristep`). The runtime and the
//! predicate library only ever read from it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bounding box, viewport-relative pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    /// Center point, used for click targeting.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Viewport dimensions in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// Visual salience hints collected by the snapshot producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualCues {
    pub is_primary: bool,
    pub is_clickable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color_name: Option<String>,
}

/// One addressable UI item within a snapshot.
///
/// `id` is stable within a single snapshot only; virtualized pages can remount
/// nodes between snapshots. `bbox` is viewport-relative; `doc_y` is
/// document-absolute when the producer reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub id: i64,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    pub importance: i64,
    pub bbox: BBox,
    pub visual_cues: VisualCues,
    #[serde(default = "default_true")]
    pub in_viewport: bool,
    #[serde(default)]
    pub is_occluded: bool,
    #[serde(default)]
    pub z_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_y: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// Snapshot producer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Success,
    Error,
}

/// Screenshot encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

/// Evidence strings backing a CAPTCHA detection, grouped by source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptchaEvidence {
    #[serde(default)]
    pub iframe_src_hits: Vec<String>,
    #[serde(default)]
    pub url_hits: Vec<String>,
    #[serde(default)]
    pub text_hits: Vec<String>,
    #[serde(default)]
    pub selector_hits: Vec<String>,
}

/// CAPTCHA detection report carried in snapshot diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaDiagnostics {
    pub detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_hint: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<CaptchaEvidence>,
}

/// Producer-side diagnostics: ranking confidence, CAPTCHA report, metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotDiagnostics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha: Option<CaptchaDiagnostics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

/// Point-in-time page state. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub status: SnapshotStatus,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub elements: Vec<Element>,
    /// Base64-encoded image data when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_format: Option<ImageFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<SnapshotDiagnostics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Snapshot {
    /// Ranking confidence reported by the producer, if any.
    pub fn confidence(&self) -> Option<f64> {
        self.diagnostics.as_ref().and_then(|d| d.confidence)
    }

    /// Count of elements the executor could act on.
    pub fn actionable_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|e| e.visual_cues.is_clickable || e.role == "textbox")
            .count()
    }
}

/// Screenshot request: off, or on with encoding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScreenshotRequest {
    Enabled(bool),
    Config(ScreenshotConfig),
}

impl Default for ScreenshotRequest {
    fn default() -> Self {
        ScreenshotRequest::Enabled(false)
    }
}

impl ScreenshotRequest {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ScreenshotRequest::Enabled(false))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotConfig {
    pub format: ImageFormat,
    /// JPEG quality, 1..=100. Ignored for PNG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

/// Element filter applied by the snapshot producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_z_index: Option<i64>,
}

pub const SNAPSHOT_LIMIT_MIN: u32 = 1;
pub const SNAPSHOT_LIMIT_MAX: u32 = 500;
pub const SNAPSHOT_LIMIT_DEFAULT: u32 = 50;

/// Clamp an element cap into the supported range.
pub fn clamp_snapshot_limit(limit: u32) -> u32 {
    limit.clamp(SNAPSHOT_LIMIT_MIN, SNAPSHOT_LIMIT_MAX)
}

/// Options for a single snapshot acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotOptions {
    /// Maximum elements to return, 1..=500.
    pub limit: u32,
    /// Task goal used by the producer/gateway as a ranking hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default)]
    pub screenshot: ScreenshotRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<SnapshotFilter>,
    /// Route the raw result through the refinement gateway when credentials
    /// are present. `None` means "auto": enabled iff an API key is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_api: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Refinement gateway request timeout in seconds.
    #[serde(default = "default_gateway_timeout_s")]
    pub gateway_timeout_s: f64,
}

fn default_gateway_timeout_s() -> f64 {
    30.0
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            limit: SNAPSHOT_LIMIT_DEFAULT,
            goal: None,
            screenshot: ScreenshotRequest::default(),
            filter: None,
            use_api: None,
            api_key: None,
            gateway_timeout_s: default_gateway_timeout_s(),
        }
    }
}

/// One finished or in-flight download, as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub suggested_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

/// Tab descriptor for backends with tab support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// Result of a tab listing. Never an error value for missing capability;
/// `error` carries `unsupported_capability` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabListResult {
    pub ok: bool,
    #[serde(default)]
    pub tabs: Vec<TabInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabOperationResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded JS evaluation request (CAPTCHA escape hatch, scroll metrics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateJsRequest {
    pub code: String,
    #[serde(default = "default_true")]
    pub truncate: bool,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_max_output_chars() -> usize {
    4096
}

impl EvaluateJsRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            truncate: true,
            max_output_chars: default_max_output_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateJsResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// LLM interaction summary attached to `step_end` events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMStepData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
}

/// Startup permission policy applied at backend/browser creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub auto_grant: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<Geolocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Bounded permission recovery: restart the backend with grants re-applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default)]
    pub auto_grant: Vec<String>,
}

fn default_max_restarts() -> u32 {
    1
}

impl Default for PermissionRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: default_max_restarts(),
            auto_grant: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_center_is_midpoint() {
        let b = BBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 40.0,
        };
        assert_eq!(b.center(), (60.0, 40.0));
    }

    #[test]
    fn snapshot_limit_clamps_to_range() {
        assert_eq!(clamp_snapshot_limit(0), 1);
        assert_eq!(clamp_snapshot_limit(50), 50);
        assert_eq!(clamp_snapshot_limit(9999), 500);
    }

    #[test]
    fn element_defaults_deserialize() {
        let el: Element = serde_json::from_value(serde_json::json!({
            "id": 1,
            "role": "button",
            "importance": 100,
            "bbox": {"x": 0.0, "y": 0.0, "width": 10.0, "height": 10.0},
            "visual_cues": {"is_primary": false, "is_clickable": true}
        }))
        .expect("element should deserialize with defaults");
        assert!(el.in_viewport);
        assert!(!el.is_occluded);
        assert_eq!(el.z_index, 0);
        assert!(el.disabled.is_none());
    }

    #[test]
    fn screenshot_request_untagged_roundtrip() {
        let off: ScreenshotRequest = serde_json::from_str("false").expect("bool form");
        assert!(!off.is_enabled());
        let cfg: ScreenshotRequest =
            serde_json::from_str(r#"{"format": "jpeg", "quality": 70}"#).expect("config form");
        assert!(cfg.is_enabled());
    }
}
