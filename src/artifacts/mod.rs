//! Failure artifact buffer: a ring of recent frames plus structured step
//! metadata, persisted as an atomic on-disk bundle when a run fails.
//!
//! Frames accumulate in a per-run temp directory and are pruned by age.
//! `persist` is idempotent and writes every JSON file via `.tmp` + rename so
//! an aborted process never leaves a corrupt bundle.

mod clip;
mod upload;

pub use clip::is_ffmpeg_available;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{ImageFormat, Snapshot, SnapshotDiagnostics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistMode {
    OnFail,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipMode {
    Off,
    Auto,
    On,
}

/// Video clip generation settings. Requires an external `ffmpeg`.
#[derive(Debug, Clone)]
pub struct ClipOptions {
    pub mode: ClipMode,
    pub fps: u32,
    /// Cap the clip to the trailing N seconds of frames.
    pub seconds: Option<f64>,
}

impl Default for ClipOptions {
    fn default() -> Self {
        Self {
            mode: ClipMode::Off,
            fps: 8,
            seconds: None,
        }
    }
}

/// Context handed to the redaction callback before anything is copied.
#[derive(Debug, Clone)]
pub struct RedactionContext {
    pub run_id: String,
    pub reason: Option<String>,
    pub status: PersistStatus,
    pub snapshot: Option<Value>,
    pub diagnostics: Option<Value>,
    pub frame_paths: Vec<PathBuf>,
    pub metadata: Map<String, Value>,
}

/// Substitutions returned by the redaction callback. `None` keeps the
/// original; `drop_frames` removes all frames from the bundle.
#[derive(Debug, Clone, Default)]
pub struct RedactionResult {
    pub snapshot: Option<Value>,
    pub diagnostics: Option<Value>,
    pub frame_paths: Option<Vec<PathBuf>>,
    pub drop_frames: bool,
}

/// Redaction hook. An `Err` fails closed: frames are dropped but persistence
/// continues.
pub type RedactionCallback =
    Arc<dyn Fn(RedactionContext) -> Result<RedactionResult, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistStatus {
    Failure,
    Success,
}

#[derive(Clone)]
pub struct FailureArtifactsOptions {
    pub buffer_seconds: f64,
    pub capture_on_action: bool,
    /// Background frame capture rate; 0 disables the timer.
    pub fps: f64,
    pub persist_mode: PersistMode,
    pub output_dir: PathBuf,
    pub on_before_persist: Option<RedactionCallback>,
    pub redact_snapshot_values: bool,
    pub frame_format: ImageFormat,
    pub clip: ClipOptions,
}

impl Default for FailureArtifactsOptions {
    fn default() -> Self {
        Self {
            buffer_seconds: 15.0,
            capture_on_action: true,
            fps: 0.0,
            persist_mode: PersistMode::OnFail,
            output_dir: PathBuf::from(".veristep/artifacts"),
            on_before_persist: None,
            redact_snapshot_values: true,
            frame_format: ImageFormat::Png,
            clip: ClipOptions::default(),
        }
    }
}

impl std::fmt::Debug for FailureArtifactsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureArtifactsOptions")
            .field("buffer_seconds", &self.buffer_seconds)
            .field("capture_on_action", &self.capture_on_action)
            .field("fps", &self.fps)
            .field("persist_mode", &self.persist_mode)
            .field("output_dir", &self.output_dir)
            .field("on_before_persist", &self.on_before_persist.is_some())
            .field("redact_snapshot_values", &self.redact_snapshot_values)
            .field("frame_format", &self.frame_format)
            .field("clip", &self.clip)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
struct FrameRecord {
    ts: f64,
    file_name: String,
    path: PathBuf,
}

/// Seconds-since-epoch clock, injectable for tests.
pub type TimeFn = Arc<dyn Fn() -> f64 + Send + Sync>;

fn system_time_fn() -> TimeFn {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    })
}

pub struct FailureArtifactBuffer {
    run_id: String,
    options: FailureArtifactsOptions,
    time_fn: TimeFn,
    temp_dir: PathBuf,
    frames_dir: PathBuf,
    frames: Vec<FrameRecord>,
    steps: Vec<Value>,
    persisted: bool,
}

impl FailureArtifactBuffer {
    pub fn new(
        run_id: impl Into<String>,
        options: FailureArtifactsOptions,
    ) -> Result<Self, ArtifactError> {
        Self::with_time_fn(run_id, options, system_time_fn())
    }

    /// Test entry point with a controllable clock.
    pub fn with_time_fn(
        run_id: impl Into<String>,
        options: FailureArtifactsOptions,
        time_fn: TimeFn,
    ) -> Result<Self, ArtifactError> {
        let temp_dir = std::env::temp_dir().join(format!(
            "veristep-artifacts-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let frames_dir = temp_dir.join("frames");
        std::fs::create_dir_all(&frames_dir)?;
        Ok(Self {
            run_id: run_id.into(),
            options,
            time_fn,
            temp_dir,
            frames_dir,
            frames: Vec::new(),
            steps: Vec::new(),
            persisted: false,
        })
    }

    pub fn options(&self) -> &FailureArtifactsOptions {
        &self.options
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Append an action record to the steps log.
    pub fn record_step(
        &mut self,
        action: &str,
        step_id: Option<&str>,
        step_index: i64,
        url: Option<&str>,
    ) {
        self.steps.push(json!({
            "ts": (self.time_fn)(),
            "action": action,
            "step_id": step_id,
            "step_index": step_index,
            "url": url,
        }));
    }

    /// Write a frame into the ring, then prune frames past the buffer window.
    pub fn add_frame(&mut self, bytes: &[u8], format: ImageFormat) -> Result<(), ArtifactError> {
        let ts = (self.time_fn)();
        let file_name = format!("frame_{}.{}", (ts * 1000.0) as i64, format.extension());
        let path = self.frames_dir.join(&file_name);
        std::fs::write(&path, bytes)?;
        self.frames.push(FrameRecord {
            ts,
            file_name,
            path,
        });
        self.prune();
        Ok(())
    }

    fn prune(&mut self) {
        let cutoff = (self.time_fn)() - self.options.buffer_seconds.max(0.0);
        let mut keep = Vec::with_capacity(self.frames.len());
        for frame in self.frames.drain(..) {
            if frame.ts >= cutoff {
                keep.push(frame);
            } else if let Err(e) = std::fs::remove_file(&frame.path) {
                warn!("failed to unlink pruned frame {}: {e}", frame.path.display());
            }
        }
        self.frames = keep;
    }

    fn write_json_atomic(path: &Path, data: &Value) -> Result<(), ArtifactError> {
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(data)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Null out values of sensitive input fields.
    fn redact_snapshot_defaults(payload: Value) -> Value {
        let Value::Object(mut map) = payload else {
            return payload;
        };
        if let Some(Value::Array(elements)) = map.get_mut("elements") {
            for el in elements.iter_mut() {
                let Value::Object(el_map) = el else { continue };
                let input_type = el_map
                    .get("input_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_lowercase();
                if matches!(input_type.as_str(), "password" | "email" | "tel")
                    && el_map.contains_key("value")
                {
                    el_map.insert("value".to_string(), Value::Null);
                    el_map.insert("value_redacted".to_string(), Value::Bool(true));
                }
            }
        }
        Value::Object(map)
    }

    /// Persist the current window as a bundle. Idempotent: the second call is
    /// a no-op returning `Ok(None)`.
    ///
    /// JSON and frame writes are small and run inline; clip encoding waits on
    /// an external process and runs on the blocking pool.
    pub async fn persist(
        &mut self,
        reason: Option<&str>,
        status: PersistStatus,
        snapshot: Option<&Snapshot>,
        diagnostics: Option<&SnapshotDiagnostics>,
        metadata: Map<String, Value>,
    ) -> Result<Option<PathBuf>, ArtifactError> {
        if self.persisted {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.options.output_dir)?;
        let ts_ms = ((self.time_fn)() * 1000.0) as i64;
        let run_dir = self.options.output_dir.join(format!("{}-{}", self.run_id, ts_ms));
        let frames_out = run_dir.join("frames");
        std::fs::create_dir_all(&frames_out)?;

        let mut snapshot_payload = match snapshot {
            Some(s) => Some(serde_json::to_value(s)?),
            None => None,
        };
        if self.options.redact_snapshot_values
            && let Some(payload) = snapshot_payload.take()
        {
            snapshot_payload = Some(Self::redact_snapshot_defaults(payload));
        }

        let mut diagnostics_payload = match diagnostics {
            Some(d) => Some(serde_json::to_value(d)?),
            None => None,
        };

        let mut frame_paths: Vec<PathBuf> = self.frames.iter().map(|f| f.path.clone()).collect();
        let mut drop_frames = false;
        let mut frames_redacted = false;

        if let Some(callback) = &self.options.on_before_persist {
            frames_redacted = true;
            let ctx = RedactionContext {
                run_id: self.run_id.clone(),
                reason: reason.map(String::from),
                status,
                snapshot: snapshot_payload.clone(),
                diagnostics: diagnostics_payload.clone(),
                frame_paths: frame_paths.clone(),
                metadata: metadata.clone(),
            };
            match callback(ctx) {
                Ok(result) => {
                    if let Some(s) = result.snapshot {
                        snapshot_payload = Some(s);
                    }
                    if let Some(d) = result.diagnostics {
                        diagnostics_payload = Some(d);
                    }
                    if let Some(paths) = result.frame_paths {
                        frame_paths = paths;
                    }
                    drop_frames = result.drop_frames;
                }
                Err(e) => {
                    // Fail closed on redaction errors.
                    warn!("redaction callback failed, dropping frames: {e}");
                    drop_frames = true;
                }
            }
        }

        let mut copied_frames: Vec<(String, Option<f64>)> = Vec::new();
        if !drop_frames {
            for frame_path in &frame_paths {
                if !frame_path.exists() {
                    continue;
                }
                let Some(file_name) = frame_path.file_name().map(|n| n.to_string_lossy().to_string())
                else {
                    continue;
                };
                std::fs::copy(frame_path, frames_out.join(&file_name))?;
                let ts = self
                    .frames
                    .iter()
                    .find(|f| f.file_name == file_name)
                    .map(|f| f.ts);
                copied_frames.push((file_name, ts));
            }
        }

        Self::write_json_atomic(&run_dir.join("steps.json"), &Value::Array(self.steps.clone()))?;
        if let Some(payload) = &snapshot_payload {
            Self::write_json_atomic(&run_dir.join("snapshot.json"), payload)?;
        }
        if let Some(payload) = &diagnostics_payload {
            Self::write_json_atomic(&run_dir.join("diagnostics.json"), payload)?;
        }

        let mut clip_file: Option<String> = None;
        let mut clip_fps: Option<u32> = None;
        if self.options.clip.mode != ClipMode::Off && !drop_frames && !copied_frames.is_empty() {
            let frames_dir = frames_out.clone();
            let out_path = run_dir.join("failure.mp4");
            let clip_options = self.options.clip.clone();
            let frame_format = self.options.frame_format;
            // The encoder wait blocks a whole OS thread (up to 60s); keep it
            // off the async workers.
            let encoded = tokio::task::spawn_blocking(move || {
                clip::generate_clip(&frames_dir, &out_path, &clip_options, frame_format)
            })
            .await;
            match encoded {
                Ok(Ok(true)) => {
                    clip_file = Some("failure.mp4".to_string());
                    clip_fps = Some(self.options.clip.fps);
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!("clip generation failed: {e}"),
                Err(e) => warn!("clip generation task failed: {e}"),
            }
        }

        let manifest = json!({
            "run_id": self.run_id,
            "created_at_ms": ts_ms,
            "status": status,
            "reason": reason,
            "buffer_seconds": self.options.buffer_seconds,
            "frame_count": if drop_frames { 0 } else { copied_frames.len() },
            "frames": if drop_frames {
                Vec::<Value>::new()
            } else {
                copied_frames
                    .iter()
                    .map(|(file, ts)| json!({"file": file, "ts": ts}))
                    .collect()
            },
            "snapshot": snapshot_payload.as_ref().map(|_| "snapshot.json"),
            "diagnostics": diagnostics_payload.as_ref().map(|_| "diagnostics.json"),
            "clip": clip_file,
            "clip_fps": clip_fps,
            "metadata": Value::Object(metadata),
            "frames_redacted": frames_redacted && !drop_frames,
            "frames_dropped": drop_frames,
        });
        Self::write_json_atomic(&run_dir.join("manifest.json"), &manifest)?;

        info!("persisted artifact bundle to {}", run_dir.display());
        self.persisted = true;
        Ok(Some(run_dir))
    }

    /// Upload a persisted bundle. Best-effort; returns the artifact index
    /// storage key, or `None` on any failure.
    pub async fn upload_to_cloud(
        &self,
        api_key: &str,
        persisted_dir: &Path,
        api_url: &str,
    ) -> Option<String> {
        upload::upload_bundle(&self.run_id, api_key, persisted_dir, api_url).await
    }

    /// Remove the temp working directory.
    pub fn cleanup(&mut self) {
        if self.temp_dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&self.temp_dir)
        {
            warn!("failed to remove artifact temp dir: {e}");
        }
        self.frames.clear();
    }
}

impl Drop for FailureArtifactBuffer {
    fn drop(&mut self) {
        if self.temp_dir.exists() {
            let _ = std::fs::remove_dir_all(&self.temp_dir);
        }
    }
}
