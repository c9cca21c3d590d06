//! CAPTCHA interrupt protocol: detection gating, handler contract, and typed
//! errors with stable reason codes.
//!
//! The crate never solves CAPTCHAs. It detects them from snapshot diagnostics
//! and hands control to the caller's policy: abort, or a callback that may
//! abort, request a fresh session, or wait for the challenge to clear.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BrowserBackend;
use crate::models::{CaptchaDiagnostics, EvaluateJsRequest, EvaluateJsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaPolicy {
    Abort,
    Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaAction {
    Abort,
    RetryNewSession,
    WaitUntilCleared,
}

/// Where the detection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaSource {
    Extension,
    Gateway,
    Runtime,
}

/// Handler verdict.
#[derive(Debug, Clone)]
pub struct CaptchaResolution {
    pub action: CaptchaAction,
    pub message: Option<String>,
    pub timeout_ms: Option<u64>,
    pub poll_ms: Option<u64>,
}

impl CaptchaResolution {
    pub fn abort() -> Self {
        Self {
            action: CaptchaAction::Abort,
            message: None,
            timeout_ms: None,
            poll_ms: None,
        }
    }

    pub fn retry_new_session() -> Self {
        Self {
            action: CaptchaAction::RetryNewSession,
            message: None,
            timeout_ms: None,
            poll_ms: None,
        }
    }

    pub fn wait_until_cleared() -> Self {
        Self {
            action: CaptchaAction::WaitUntilCleared,
            message: None,
            timeout_ms: None,
            poll_ms: None,
        }
    }
}

/// Bounded page access granted to CAPTCHA handlers: JS evaluation only.
#[derive(Clone)]
pub struct PageControl {
    backend: Arc<dyn BrowserBackend>,
}

impl PageControl {
    pub(crate) fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        Self { backend }
    }

    pub async fn evaluate_js(&self, request: EvaluateJsRequest) -> EvaluateJsResult {
        match self.backend.eval(&request.code).await {
            Ok(value) => {
                let mut text = match &value {
                    serde_json::Value::Null => "null".to_string(),
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let mut truncated = false;
                if request.truncate && text.len() > request.max_output_chars {
                    text.truncate(request.max_output_chars);
                    text.push_str("...");
                    truncated = true;
                }
                EvaluateJsResult {
                    ok: true,
                    value: Some(value),
                    text,
                    truncated,
                    error: None,
                }
            }
            Err(e) => EvaluateJsResult {
                ok: false,
                value: None,
                text: String::new(),
                truncated: false,
                error: Some(e.to_string()),
            },
        }
    }
}

impl fmt::Debug for PageControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageControl").finish_non_exhaustive()
    }
}

/// Context handed to the CAPTCHA handler.
#[derive(Debug, Clone)]
pub struct CaptchaContext {
    pub run_id: String,
    pub step_index: i64,
    pub url: String,
    pub source: CaptchaSource,
    pub captcha: Option<CaptchaDiagnostics>,
    pub page_control: PageControl,
}

/// Caller-supplied CAPTCHA resolution strategy.
#[async_trait]
pub trait CaptchaHandler: Send + Sync {
    async fn on_captcha(&self, ctx: CaptchaContext) -> Result<CaptchaResolution, CaptchaError>;
}

/// Caller-supplied session reset used by `retry_new_session`.
#[async_trait]
pub trait SessionReset: Send + Sync {
    async fn reset(&self) -> Result<(), CaptchaError>;
}

#[derive(Clone)]
pub struct CaptchaOptions {
    pub policy: CaptchaPolicy,
    pub min_confidence: f64,
    pub timeout_ms: u64,
    pub poll_ms: u64,
    pub max_retries_new_session: u32,
    pub handler: Option<Arc<dyn CaptchaHandler>>,
    pub reset_session: Option<Arc<dyn SessionReset>>,
}

impl Default for CaptchaOptions {
    fn default() -> Self {
        Self {
            policy: CaptchaPolicy::Abort,
            min_confidence: 0.7,
            timeout_ms: 120_000,
            poll_ms: 1_000,
            max_retries_new_session: 1,
            handler: None,
            reset_session: None,
        }
    }
}

impl fmt::Debug for CaptchaOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptchaOptions")
            .field("policy", &self.policy)
            .field("min_confidence", &self.min_confidence)
            .field("timeout_ms", &self.timeout_ms)
            .field("poll_ms", &self.poll_ms)
            .field("max_retries_new_session", &self.max_retries_new_session)
            .field("handler", &self.handler.is_some())
            .field("reset_session", &self.reset_session.is_some())
            .finish()
    }
}

/// CAPTCHA-flow error with a stable reason code suitable for switching on.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CaptchaError {
    pub reason_code: String,
    pub message: String,
}

impl CaptchaError {
    pub fn new(reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.to_string(),
            message: message.into(),
        }
    }
}

const STRONG_TEXT_PHRASES: &[&str] = &[
    "i'm not a robot",
    "verify you are human",
    "human verification",
    "complete the security check",
    "please verify",
];

const STRONG_IFRAME_TOKENS: &[&str] = &["api2/bframe", "hcaptcha", "turnstile"];

const STRONG_SELECTOR_TOKENS: &[&str] = &[
    "g-recaptcha-response",
    "h-captcha-response",
    "cf-turnstile-response",
    "recaptcha-checkbox",
    "hcaptcha-checkbox",
];

/// Whether a detection should block execution.
///
/// Many sites load CAPTCHA libraries proactively (v3 badges, preloaded
/// scripts). Only detections with evidence of an interactive challenge block:
/// at least one iframe/url/text hit, plus a strong phrase, iframe token, or
/// response-selector token. Generic "captcha"/"recaptcha" mentions alone are
/// passive.
pub fn is_blocking_detection(captcha: &CaptchaDiagnostics, min_confidence: f64) -> bool {
    if !captcha.detected {
        return false;
    }

    if let Some(evidence) = &captcha.evidence {
        if evidence.iframe_src_hits.is_empty()
            && evidence.url_hits.is_empty()
            && evidence.text_hits.is_empty()
        {
            // Selector/script hints alone never block.
            return false;
        }

        let hits: Vec<String> = evidence
            .iframe_src_hits
            .iter()
            .chain(&evidence.url_hits)
            .chain(&evidence.text_hits)
            .chain(&evidence.selector_hits)
            .map(|h| h.to_lowercase())
            .collect();

        let joined = hits.join(" ");
        let strong_text = STRONG_TEXT_PHRASES.iter().any(|k| joined.contains(k));
        let strong_iframe = hits
            .iter()
            .any(|h| STRONG_IFRAME_TOKENS.iter().any(|k| h.contains(k)));
        let strong_selector = hits
            .iter()
            .any(|h| STRONG_SELECTOR_TOKENS.iter().any(|k| h.contains(k)));

        // Generic-token suppression covers script/url/text mentions only; an
        // actual provider iframe embedded in the page is evidence of a
        // challenge surface regardless of its path.
        let only_generic = !strong_text
            && !strong_iframe
            && !strong_selector
            && evidence.iframe_src_hits.is_empty()
            && hits
                .iter()
                .all(|h| h.contains("captcha") || h.contains("recaptcha"));
        if only_generic {
            return false;
        }
    }

    captcha.confidence >= min_confidence
}
