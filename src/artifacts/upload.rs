//! Cloud upload of a persisted artifact bundle.
//!
//! Protocol: POST init to obtain per-artifact signed PUT URLs plus an index
//! PUT URL, PUT each artifact, PUT the index, POST complete. Any non-2xx
//! aborts with no retry; the whole flow is best-effort and returns `None` on
//! failure.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::{debug, warn};

struct UploadArtifact {
    name: String,
    path: PathBuf,
    content_type: &'static str,
    size_bytes: u64,
}

fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".json") {
        "application/json"
    } else if name.ends_with(".png") {
        "image/png"
    } else if name.ends_with(".jpeg") || name.ends_with(".jpg") {
        "image/jpeg"
    } else if name.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    }
}

/// Enumerate the bundle's files per its manifest.
fn collect_artifacts(persisted_dir: &Path, manifest: &Value) -> Vec<UploadArtifact> {
    let mut names: Vec<String> = vec!["manifest.json".to_string(), "steps.json".to_string()];
    if manifest.get("snapshot").and_then(Value::as_str).is_some() {
        names.push("snapshot.json".to_string());
    }
    if manifest.get("diagnostics").and_then(Value::as_str).is_some() {
        names.push("diagnostics.json".to_string());
    }
    if let Some(clip) = manifest.get("clip").and_then(Value::as_str) {
        names.push(clip.to_string());
    }
    if let Some(frames) = manifest.get("frames").and_then(Value::as_array) {
        for frame in frames {
            if let Some(file) = frame.get("file").and_then(Value::as_str) {
                names.push(format!("frames/{file}"));
            }
        }
    }

    names
        .into_iter()
        .filter_map(|name| {
            let path = persisted_dir.join(&name);
            let size_bytes = std::fs::metadata(&path).ok()?.len();
            Some(UploadArtifact {
                content_type: content_type_for(&name),
                name,
                path,
                size_bytes,
            })
        })
        .collect()
}

/// Run the upload flow. Returns the artifact index storage key.
pub(super) async fn upload_bundle(
    run_id: &str,
    api_key: &str,
    persisted_dir: &Path,
    api_url: &str,
) -> Option<String> {
    let manifest_path = persisted_dir.join("manifest.json");
    let manifest: Value = match std::fs::read_to_string(&manifest_path) {
        Ok(text) => serde_json::from_str(&text).ok()?,
        Err(e) => {
            debug!("no manifest at {}: {e}", manifest_path.display());
            return None;
        }
    };

    let artifacts = collect_artifacts(persisted_dir, &manifest);
    if artifacts.is_empty() {
        return None;
    }

    let client = reqwest::Client::new();
    let base = api_url.trim_end_matches('/');

    let init_payload = json!({
        "run_id": run_id,
        "artifacts": artifacts
            .iter()
            .map(|a| json!({
                "name": a.name,
                "content_type": a.content_type,
                "size_bytes": a.size_bytes,
            }))
            .collect::<Vec<_>>(),
    });

    let init: Value = match client
        .post(format!("{base}/v1/artifacts/init"))
        .bearer_auth(api_key)
        .json(&init_payload)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => resp.json().await.ok()?,
        Ok(resp) => {
            warn!("artifact upload init failed: HTTP {}", resp.status());
            return None;
        }
        Err(e) => {
            warn!("artifact upload init failed: {e}");
            return None;
        }
    };

    let upload_urls = init.get("upload_urls")?.as_array()?;
    let index_upload = init.get("artifact_index_upload")?;
    let index_url = index_upload.get("upload_url")?.as_str()?;
    let index_key = index_upload.get("storage_key")?.as_str()?.to_string();

    let mut index_entries: Vec<Value> = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        let entry = upload_urls
            .iter()
            .find(|u| u.get("name").and_then(Value::as_str) == Some(artifact.name.as_str()))?;
        let upload_url = entry.get("upload_url")?.as_str()?;
        let storage_key = entry.get("storage_key")?.as_str()?;

        let bytes = std::fs::read(&artifact.path).ok()?;
        match client
            .put(upload_url)
            .header("content-type", artifact.content_type)
            .body(bytes)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!("artifact PUT failed for {}: HTTP {}", artifact.name, resp.status());
                return None;
            }
            Err(e) => {
                warn!("artifact PUT failed for {}: {e}", artifact.name);
                return None;
            }
        }
        index_entries.push(json!({
            "name": artifact.name,
            "storage_key": storage_key,
            "content_type": artifact.content_type,
            "size_bytes": artifact.size_bytes,
        }));
    }

    let index_payload = json!({
        "run_id": run_id,
        "artifacts": index_entries,
    });
    match client
        .put(index_url)
        .header("content-type", "application/json")
        .body(serde_json::to_vec(&index_payload).ok()?)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {}
        _ => {
            warn!("artifact index PUT failed");
            return None;
        }
    }

    match client
        .post(format!("{base}/v1/artifacts/complete"))
        .bearer_auth(api_key)
        .json(&json!({"run_id": run_id, "artifact_index_key": index_key}))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => Some(index_key),
        Ok(resp) => {
            warn!("artifact upload complete failed: HTTP {}", resp.status());
            None
        }
        Err(e) => {
            warn!("artifact upload complete failed: {e}");
            None
        }
    }
}
