//! Step lifecycle, assertion accumulation, scroll verification, and tabs.

mod common;

use std::sync::Arc;

use common::{MockBackend, clickable_element, make_runtime, make_snapshot};
use veristep::models::{BBox, Element, VisualCues};
use veristep::runtime::{ScrollOptions, StepEndParams};
use veristep::verification::{exists, is_disabled, is_enabled, url_contains, value_equals};

#[tokio::test]
async fn step_ids_are_monotonic_and_state_clears() {
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test",
        vec![clickable_element(1)],
        None,
    )]));
    let (mut runtime, sink) = make_runtime(backend);

    let id0 = runtime.begin_step("first", None, true, None);
    assert_eq!(id0, "step-0");
    runtime.snapshot().await.expect("snapshot");
    assert!(runtime.assert_(&exists("role=button"), "has_button", false).await);
    assert_eq!(runtime.assertions().len(), 1);

    let id1 = runtime.begin_step("second", None, true, None);
    assert_eq!(id1, "step-1");
    // Previous step's assertions are gone.
    assert!(runtime.assertions().is_empty());

    let id5 = runtime.begin_step("explicit", Some(5), true, None);
    assert_eq!(id5, "step-5");
    assert_eq!(runtime.step_index(), 5);

    let starts = sink.events_of_type("step_start");
    assert_eq!(starts.len(), 3);
    assert_eq!(starts[0].data["step_index"], 0);
    assert_eq!(starts[2].data["step_index"], 5);
}

#[tokio::test]
async fn assert_emits_verification_event_and_accumulates() {
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test/cart",
        vec![clickable_element(1)],
        None,
    )]));
    let (mut runtime, sink) = make_runtime(backend);
    runtime.begin_step("verify", None, true, None);
    runtime.snapshot().await.expect("snapshot");

    assert!(runtime.assert_(&url_contains("/cart"), "on_cart", true).await);
    assert!(!runtime.assert_(&exists("role=dialog"), "no_dialog", false).await);

    assert_eq!(runtime.assertions().len(), 2);
    assert!(runtime.required_assertions_passed());
    assert!(!runtime.all_assertions_passed());

    let events = sink.events_of_type("verification");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].data["label"], "on_cart");
    assert_eq!(events[0].data["kind"], "assert");
    assert_eq!(events[0].step_id.as_deref(), Some("step-0"));
}

#[tokio::test]
async fn failed_selector_assertion_suggests_nearest_matches() {
    let mut el = clickable_element(1);
    el.text = Some("Submit order".to_string());
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test",
        vec![el],
        None,
    )]));
    let (mut runtime, _sink) = make_runtime(backend);
    runtime.begin_step("nearest", None, true, None);
    runtime.snapshot().await.expect("snapshot");

    runtime
        .assert_(&exists("text=submit orders"), "typo_selector", false)
        .await;
    let record = &runtime.assertions()[0];
    let nearest = record
        .details
        .get("nearest_matches")
        .and_then(|v| v.as_array())
        .expect("nearest matches attached");
    assert!(!nearest.is_empty());
    assert_eq!(nearest[0]["text"], "Submit order");
}

#[tokio::test]
async fn assert_done_marks_task_complete() {
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test/receipt",
        vec![clickable_element(1)],
        None,
    )]));
    let (mut runtime, sink) = make_runtime(backend);
    runtime.begin_step("finish", None, true, None);
    runtime.snapshot().await.expect("snapshot");

    assert!(!runtime.is_task_done());
    assert!(runtime.assert_done(&url_contains("/receipt"), "task_complete").await);
    assert!(runtime.is_task_done());

    let task_done_events: Vec<_> = sink
        .events_of_type("verification")
        .into_iter()
        .filter(|e| e.data["kind"] == "task_done")
        .collect();
    assert_eq!(task_done_events.len(), 1);

    runtime.reset_task_done();
    assert!(!runtime.is_task_done());
}

#[tokio::test]
async fn state_predicates_run_against_snapshot_context() {
    let cues = VisualCues {
        is_primary: false,
        is_clickable: true,
        background_color_name: None,
    };
    let elements = vec![
        Element {
            id: 1,
            role: "button".to_string(),
            text: Some("Submit".to_string()),
            name: None,
            href: None,
            value: None,
            input_type: None,
            importance: 10,
            bbox: BBox {
                x: 0.0,
                y: 0.0,
                width: 100.0,
                height: 40.0,
            },
            visual_cues: cues.clone(),
            in_viewport: true,
            is_occluded: false,
            z_index: 0,
            disabled: Some(false),
            checked: None,
            expanded: None,
            doc_y: None,
        },
        Element {
            id: 2,
            role: "textbox".to_string(),
            text: None,
            name: None,
            href: None,
            value: Some("hello".to_string()),
            input_type: Some("text".to_string()),
            importance: 5,
            bbox: BBox {
                x: 0.0,
                y: 50.0,
                width: 200.0,
                height: 40.0,
            },
            visual_cues: cues.clone(),
            in_viewport: true,
            is_occluded: false,
            z_index: 0,
            disabled: Some(false),
            checked: None,
            expanded: None,
            doc_y: None,
        },
        Element {
            id: 3,
            role: "button".to_string(),
            text: Some("Disabled".to_string()),
            name: None,
            href: None,
            value: None,
            input_type: None,
            importance: 4,
            bbox: BBox {
                x: 0.0,
                y: 100.0,
                width: 120.0,
                height: 40.0,
            },
            visual_cues: cues,
            in_viewport: true,
            is_occluded: false,
            z_index: 0,
            disabled: Some(true),
            checked: None,
            expanded: None,
            doc_y: None,
        },
    ];
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test",
        elements,
        None,
    )]));
    let (mut runtime, _sink) = make_runtime(backend);
    runtime.begin_step("states", None, true, None);
    runtime.snapshot().await.expect("snapshot");

    assert!(runtime.assert_(&is_enabled("text~'Submit'"), "enabled", false).await);
    assert!(runtime.assert_(&is_disabled("text~'Disabled'"), "disabled", false).await);
    assert!(runtime
        .assert_(&value_equals("role=textbox", "hello"), "value", false)
        .await);
    assert_eq!(runtime.assertions().len(), 3);
    assert!(runtime.all_assertions_passed());
}

#[tokio::test]
async fn step_end_reports_urls_digests_and_assertions() {
    let backend = Arc::new(MockBackend::new(vec![
        make_snapshot("https://site.test/form", vec![clickable_element(1)], None),
        make_snapshot("https://site.test/thanks", vec![clickable_element(1)], None),
    ]));
    let (mut runtime, sink) = make_runtime(backend);
    runtime.begin_step("submit", None, true, None);

    runtime.snapshot().await.expect("pre snapshot");
    runtime.record_action("CLICK(1)", Some("https://site.test/form")).await;
    runtime.snapshot().await.expect("post snapshot");
    runtime.assert_(&url_contains("/thanks"), "navigated", true).await;

    let payload = runtime.emit_step_end(StepEndParams::default()).await;

    assert_eq!(payload["step_id"], "step-0");
    assert_eq!(payload["pre_url"], "https://site.test/form");
    assert_eq!(payload["post_url"], "https://site.test/thanks");
    assert_eq!(payload["verify"]["signals"]["url_changed"], true);
    assert_eq!(payload["verify"]["passed"], true);
    assert!(
        payload["snapshot_digest"]
            .as_str()
            .expect("digest")
            .starts_with("sha256:")
    );
    assert_eq!(payload["assertions"].as_array().map(Vec::len), Some(1));
    assert_eq!(payload["exec"]["action"], "CLICK(1)");

    let ends = sink.events_of_type("step_end");
    assert_eq!(ends.len(), 1);
}

#[tokio::test]
async fn scroll_by_verifies_wheel_effect() {
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test/long",
        vec![],
        None,
    )]));
    let (mut runtime, _sink) = make_runtime(backend.clone());
    runtime.begin_step("scroll", None, true, None);

    let ok = runtime
        .scroll_by(600.0, ScrollOptions::default())
        .await
        .expect("no runtime error");
    assert!(ok);
    assert_eq!(backend.wheel_deltas.lock().expect("lock").as_slice(), &[600.0]);

    let record = &runtime.assertions()[0];
    assert_eq!(record.kind, "scroll");
    assert!(record.passed);
    assert_eq!(record.details["delta_px"], 600.0);
    assert_eq!(record.details["js_fallback_used"], false);
}

#[tokio::test]
async fn scroll_by_uses_js_fallback_when_wheel_is_inert() {
    let mut backend = MockBackend::new(vec![make_snapshot("https://site.test/long", vec![], None)]);
    backend.wheel_moves_page = false;
    backend.js_scroll_moves_page = true;
    let backend = Arc::new(backend);
    let (mut runtime, _sink) = make_runtime(backend);
    runtime.begin_step("scroll-fallback", None, true, None);

    let ok = runtime
        .scroll_by(
            500.0,
            ScrollOptions {
                timeout_s: 2.0,
                poll_s: 0.01,
                ..Default::default()
            },
        )
        .await
        .expect("no runtime error");
    assert!(ok);
    let record = &runtime.assertions()[0];
    assert_eq!(record.details["js_fallback_used"], true);
}

#[tokio::test]
async fn scroll_by_times_out_when_nothing_moves() {
    let mut backend = MockBackend::new(vec![make_snapshot("https://site.test/frozen", vec![], None)]);
    backend.wheel_moves_page = false;
    backend.js_scroll_moves_page = false;
    let backend = Arc::new(backend);
    let (mut runtime, _sink) = make_runtime(backend);
    runtime.begin_step("scroll-timeout", None, true, None);

    let ok = runtime
        .scroll_by(
            500.0,
            ScrollOptions {
                timeout_s: 0.2,
                poll_s: 0.02,
                required: false,
                ..Default::default()
            },
        )
        .await
        .expect("no runtime error");
    assert!(!ok);
    let record = &runtime.assertions()[0];
    assert!(!record.passed);
    assert!(record.reason.contains("min_delta_px"));
}

#[tokio::test]
async fn tab_operations_report_unsupported_capability() {
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test",
        vec![],
        None,
    )]));
    let (runtime, _sink) = make_runtime(backend);

    let tabs = runtime.list_tabs().await;
    assert!(!tabs.ok);
    assert_eq!(tabs.error.as_deref(), Some("unsupported_capability"));

    let opened = runtime.open_tab("https://site.test/next").await;
    assert!(!opened.ok);
    assert_eq!(opened.error.as_deref(), Some("unsupported_capability"));

    assert!(!runtime.can("tabs"));
    assert!(runtime.can("evaluate_js"));
}

#[tokio::test]
async fn permission_policy_fails_fast_without_capability() {
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test",
        vec![],
        None,
    )]));
    let policy = veristep::models::PermissionPolicy {
        auto_grant: vec!["geolocation".to_string()],
        ..Default::default()
    };
    let err = veristep::apply_permission_policy(backend.as_ref(), &policy)
        .await
        .expect_err("mock has no permission support");
    assert_eq!(err.reason_code(), "unsupported_capability");

    // An empty policy is a no-op even without capability.
    let empty = veristep::models::PermissionPolicy::default();
    veristep::apply_permission_policy(backend.as_ref(), &empty)
        .await
        .expect("nothing to apply");
}

#[tokio::test]
async fn evaluate_js_truncates_long_output() {
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test/a-rather-long-url-for-testing-truncation",
        vec![],
        None,
    )]));
    let (runtime, _sink) = make_runtime(backend);

    let mut request = veristep::models::EvaluateJsRequest::new("window.location.href");
    request.max_output_chars = 10;
    let result = runtime.evaluate_js(request).await;
    assert!(result.ok);
    assert!(result.truncated);
    assert_eq!(result.text.len(), 13); // 10 chars + "..."
}
