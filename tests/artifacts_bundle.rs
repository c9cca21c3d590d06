//! Failure-artifact wiring through the runtime: capture on action, persist on
//! required-assertion failure, redaction of sensitive values.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::{MockBackend, clickable_element, make_runtime, make_snapshot};
use veristep::artifacts::FailureArtifactsOptions;
use veristep::models::{BBox, Element, VisualCues};
use veristep::verification::url_contains;

fn temp_output_dir() -> PathBuf {
    std::env::temp_dir().join(format!("veristep-it-{}", uuid::Uuid::new_v4().simple()))
}

fn bundle_dirs(output_dir: &PathBuf) -> Vec<PathBuf> {
    std::fs::read_dir(output_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default()
}

fn password_field(id: i64) -> Element {
    Element {
        id,
        role: "textbox".to_string(),
        text: None,
        name: Some("Password".to_string()),
        href: None,
        value: Some("hunter2".to_string()),
        input_type: Some("password".to_string()),
        importance: 50,
        bbox: BBox {
            x: 0.0,
            y: 0.0,
            width: 200.0,
            height: 30.0,
        },
        visual_cues: VisualCues {
            is_primary: false,
            is_clickable: false,
            background_color_name: None,
        },
        in_viewport: true,
        is_occluded: false,
        z_index: 0,
        disabled: None,
        checked: None,
        expanded: None,
        doc_y: None,
    }
}

#[tokio::test]
async fn required_failure_persists_bundle_with_redacted_snapshot() {
    let output_dir = temp_output_dir();
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test/login",
        vec![clickable_element(1), password_field(2)],
        None,
    )]));
    let (mut runtime, _sink) = make_runtime(backend);
    runtime
        .enable_failure_artifacts(FailureArtifactsOptions {
            output_dir: output_dir.clone(),
            buffer_seconds: 30.0,
            ..Default::default()
        })
        .expect("enable artifacts");

    runtime.begin_step("login", None, true, None);
    runtime.snapshot().await.expect("snapshot");
    runtime
        .record_action("CLICK(1)", Some("https://site.test/login"))
        .await;

    // Required assertion fails: bundle persists.
    assert!(!runtime.assert_(&url_contains("/dashboard"), "logged_in", true).await);

    let bundles = bundle_dirs(&output_dir);
    assert_eq!(bundles.len(), 1, "exactly one bundle persisted");
    let bundle = &bundles[0];

    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(bundle.join("manifest.json")).expect("manifest"),
    )
    .expect("valid json");
    assert_eq!(manifest["status"], "failure");
    assert_eq!(manifest["reason"], "assert_failed:logged_in");
    assert_eq!(manifest["metadata"]["backend"], "mock");
    // One frame captured by record_action.
    assert_eq!(manifest["frame_count"], 1);
    let frame_files: Vec<_> = std::fs::read_dir(bundle.join("frames"))
        .expect("frames dir")
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(frame_files.len(), manifest["frame_count"].as_u64().unwrap() as usize);

    let snapshot_json: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(bundle.join("snapshot.json")).expect("snapshot.json"),
    )
    .expect("valid json");
    let elements = snapshot_json["elements"].as_array().expect("elements");
    let password = elements
        .iter()
        .find(|e| e["input_type"] == "password")
        .expect("password element present");
    assert_eq!(password["value"], serde_json::Value::Null);
    assert_eq!(password["value_redacted"], true);

    let steps: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(bundle.join("steps.json")).expect("steps.json"),
    )
    .expect("valid json");
    assert_eq!(steps[0]["action"], "CLICK(1)");
    assert_eq!(steps[0]["step_id"], "step-0");

    // A second required failure does not produce a second bundle: the buffer
    // persisted once and was disabled (persist_mode=onFail).
    runtime
        .assert_(&url_contains("/dashboard"), "logged_in_again", true)
        .await;
    assert_eq!(bundle_dirs(&output_dir).len(), 1);

    std::fs::remove_dir_all(&output_dir).ok();
}

#[tokio::test]
async fn finalize_run_success_without_always_mode_persists_nothing() {
    let output_dir = temp_output_dir();
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test",
        vec![],
        None,
    )]));
    let (mut runtime, _sink) = make_runtime(backend);
    runtime
        .enable_failure_artifacts(FailureArtifactsOptions {
            output_dir: output_dir.clone(),
            ..Default::default()
        })
        .expect("enable artifacts");

    runtime.begin_step("ok", None, true, None);
    runtime.snapshot().await.expect("snapshot");
    runtime.record_action("PRESS('Enter')", None).await;
    runtime.finalize_run(true).await;

    assert!(bundle_dirs(&output_dir).is_empty());
    std::fs::remove_dir_all(&output_dir).ok();
}

#[tokio::test]
async fn finalize_run_failure_persists_bundle() {
    let output_dir = temp_output_dir();
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test",
        vec![],
        None,
    )]));
    let (mut runtime, _sink) = make_runtime(backend);
    runtime
        .enable_failure_artifacts(FailureArtifactsOptions {
            output_dir: output_dir.clone(),
            ..Default::default()
        })
        .expect("enable artifacts");

    runtime.begin_step("doomed", None, true, None);
    runtime.snapshot().await.expect("snapshot");
    runtime.record_action("CLICK(9)", None).await;
    runtime.finalize_run(false).await;

    let bundles = bundle_dirs(&output_dir);
    assert_eq!(bundles.len(), 1);
    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(bundles[0].join("manifest.json")).expect("manifest"),
    )
    .expect("valid json");
    assert_eq!(manifest["reason"], "finalize_failure");
    std::fs::remove_dir_all(&output_dir).ok();
}

#[tokio::test]
async fn frame_timer_captures_in_background() {
    let output_dir = temp_output_dir();
    let backend = Arc::new(MockBackend::new(vec![make_snapshot(
        "https://site.test",
        vec![],
        None,
    )]));
    let (mut runtime, _sink) = make_runtime(backend);
    runtime
        .enable_failure_artifacts(FailureArtifactsOptions {
            output_dir: output_dir.clone(),
            fps: 50.0,
            capture_on_action: false,
            ..Default::default()
        })
        .expect("enable artifacts");

    runtime.begin_step("timed", None, true, None);
    runtime.snapshot().await.expect("snapshot");
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    runtime.finalize_run(false).await;

    let bundles = bundle_dirs(&output_dir);
    assert_eq!(bundles.len(), 1);
    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(bundles[0].join("manifest.json")).expect("manifest"),
    )
    .expect("valid json");
    assert!(
        manifest["frame_count"].as_u64().expect("count") >= 1,
        "timer captured at least one frame"
    );
    std::fs::remove_dir_all(&output_dir).ok();
}
