//! CAPTCHA interrupt protocol: abort, passive badges, wait-until-cleared,
//! and session-retry exhaustion.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use common::{MockBackend, make_runtime, make_snapshot, snapshot_with_captcha};
use veristep::captcha::{
    CaptchaContext, CaptchaError, CaptchaHandler, CaptchaOptions, CaptchaPolicy,
    CaptchaResolution, SessionReset,
};
use veristep::models::{CaptchaDiagnostics, CaptchaEvidence};
use veristep::runtime::RuntimeError;

fn recaptcha_iframe_diagnostics() -> CaptchaDiagnostics {
    CaptchaDiagnostics {
        detected: true,
        provider_hint: Some("recaptcha".to_string()),
        confidence: 0.9,
        evidence: Some(CaptchaEvidence {
            iframe_src_hits: vec!["https://www.google.com/recaptcha/api2/anchor".to_string()],
            ..Default::default()
        }),
    }
}

fn passive_badge_diagnostics() -> CaptchaDiagnostics {
    CaptchaDiagnostics {
        detected: true,
        provider_hint: Some("recaptcha".to_string()),
        confidence: 0.9,
        evidence: Some(CaptchaEvidence {
            selector_hits: vec!["recaptcha".to_string()],
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn strong_detection_with_abort_policy_raises() {
    let backend = Arc::new(MockBackend::new(vec![snapshot_with_captcha(
        "https://site.test/login",
        recaptcha_iframe_diagnostics(),
    )]));
    let (mut runtime, sink) = make_runtime(backend);
    runtime.set_captcha_options(CaptchaOptions::default());
    runtime.begin_step("login", None, true, None);

    let err = runtime.snapshot().await.expect_err("captcha must abort");
    match &err {
        RuntimeError::Captcha(e) => assert_eq!(e.reason_code, "captcha_policy_abort"),
        other => panic!("expected captcha error, got {other:?}"),
    }

    let labels: Vec<String> = sink
        .events_of_type("verification")
        .into_iter()
        .filter(|e| e.data["kind"] == "captcha")
        .map(|e| e.data["label"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(labels, vec!["captcha_detected", "captcha_policy_abort"]);
}

#[tokio::test]
async fn passive_badge_is_non_blocking() {
    let backend = Arc::new(MockBackend::new(vec![snapshot_with_captcha(
        "https://site.test/home",
        passive_badge_diagnostics(),
    )]));
    let (mut runtime, sink) = make_runtime(backend);
    runtime.set_captcha_options(CaptchaOptions::default());
    runtime.begin_step("browse", None, true, None);

    let snap = runtime.snapshot().await.expect("snapshot returned normally");
    assert_eq!(snap.url, "https://site.test/home");
    let detected = snap
        .diagnostics
        .as_ref()
        .and_then(|d| d.captcha.as_ref())
        .map(|c| c.detected);
    assert_eq!(detected, Some(true));

    // Detection reported but nothing emitted and nothing raised.
    let captcha_events: Vec<_> = sink
        .events_of_type("verification")
        .into_iter()
        .filter(|e| e.data["kind"] == "captcha")
        .collect();
    assert!(captcha_events.is_empty());
}

struct WaitHandler;

#[async_trait]
impl CaptchaHandler for WaitHandler {
    async fn on_captcha(&self, _ctx: CaptchaContext) -> Result<CaptchaResolution, CaptchaError> {
        let mut resolution = CaptchaResolution::wait_until_cleared();
        resolution.timeout_ms = Some(2_000);
        resolution.poll_ms = Some(10);
        Ok(resolution)
    }
}

#[tokio::test]
async fn wait_until_cleared_resumes_when_detector_clears() {
    let backend = Arc::new(MockBackend::new(vec![
        snapshot_with_captcha("https://site.test/guard", recaptcha_iframe_diagnostics()),
        make_snapshot("https://site.test/guard", vec![], Some(0.9)),
    ]));
    let (mut runtime, sink) = make_runtime(backend);
    runtime.set_captcha_options(CaptchaOptions {
        policy: CaptchaPolicy::Callback,
        handler: Some(Arc::new(WaitHandler)),
        ..Default::default()
    });
    runtime.begin_step("guarded", None, true, None);

    runtime.snapshot().await.expect("resumes after clearing");

    let labels: Vec<String> = sink
        .events_of_type("verification")
        .into_iter()
        .filter(|e| e.data["kind"] == "captcha")
        .map(|e| e.data["label"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        labels,
        vec!["captcha_detected", "captcha_cleared", "captcha_resumed"]
    );
}

struct RetryHandler;

#[async_trait]
impl CaptchaHandler for RetryHandler {
    async fn on_captcha(&self, _ctx: CaptchaContext) -> Result<CaptchaResolution, CaptchaError> {
        Ok(CaptchaResolution::retry_new_session())
    }
}

struct CountingReset {
    resets: AtomicU32,
}

#[async_trait]
impl SessionReset for CountingReset {
    async fn reset(&self) -> Result<(), CaptchaError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn retry_new_session_exhausts_after_max_retries() {
    let backend = Arc::new(MockBackend::new(vec![snapshot_with_captcha(
        "https://site.test/wall",
        recaptcha_iframe_diagnostics(),
    )]));
    let (mut runtime, sink) = make_runtime(backend);
    let reset = Arc::new(CountingReset {
        resets: AtomicU32::new(0),
    });
    runtime.set_captcha_options(CaptchaOptions {
        policy: CaptchaPolicy::Callback,
        handler: Some(Arc::new(RetryHandler)),
        reset_session: Some(reset.clone()),
        max_retries_new_session: 1,
        ..Default::default()
    });
    runtime.begin_step("walled", None, true, None);

    // First detection: session reset requested, call returns so the caller
    // can re-issue the step.
    runtime.snapshot().await.expect("first retry succeeds");
    assert_eq!(reset.resets.load(Ordering::SeqCst), 1);

    // Second detection: retry budget exceeded.
    let err = runtime.snapshot().await.expect_err("retries exhausted");
    match &err {
        RuntimeError::Captcha(e) => assert_eq!(e.reason_code, "captcha_retry_exhausted"),
        other => panic!("expected captcha error, got {other:?}"),
    }
    assert_eq!(reset.resets.load(Ordering::SeqCst), 1);

    let labels: Vec<String> = sink
        .events_of_type("verification")
        .into_iter()
        .filter(|e| e.data["kind"] == "captcha")
        .map(|e| e.data["label"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(labels.contains(&"captcha_retry_exhausted".to_string()));
}

struct PageControlHandler;

#[async_trait]
impl CaptchaHandler for PageControlHandler {
    async fn on_captcha(&self, ctx: CaptchaContext) -> Result<CaptchaResolution, CaptchaError> {
        // The bounded escape hatch: handlers may inspect the page via JS.
        let result = ctx
            .page_control
            .evaluate_js(veristep::models::EvaluateJsRequest::new(
                "window.location.href",
            ))
            .await;
        if result.ok && result.text.contains("site.test") {
            Ok(CaptchaResolution::abort())
        } else {
            Err(CaptchaError::new("captcha_handler_error", "unexpected page"))
        }
    }
}

#[tokio::test]
async fn handler_gets_bounded_page_control() {
    let backend = Arc::new(MockBackend::new(vec![snapshot_with_captcha(
        "https://site.test/challenge",
        recaptcha_iframe_diagnostics(),
    )]));
    let (mut runtime, _sink) = make_runtime(backend);
    runtime.set_captcha_options(CaptchaOptions {
        policy: CaptchaPolicy::Callback,
        handler: Some(Arc::new(PageControlHandler)),
        ..Default::default()
    });
    runtime.begin_step("challenge", None, true, None);

    let err = runtime.snapshot().await.expect_err("handler chose abort");
    match &err {
        RuntimeError::Captcha(e) => assert_eq!(e.reason_code, "captcha_policy_abort"),
        other => panic!("expected captcha error, got {other:?}"),
    }
}
