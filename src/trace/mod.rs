//! Structured JSONL event emission with step correlation.
//!
//! Events are emitted synchronously in program order per run. Emission is
//! telemetry: sink failures are logged and swallowed, never surfaced to the
//! verification loop.

pub mod builder;

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::models::{ImageFormat, Snapshot};

/// One trace event. `ts` is Unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub run_id: String,
    pub ts: i64,
}

/// Destination for trace events.
pub trait TraceSink: Send + Sync {
    fn write(&self, event: &TraceEvent) -> std::io::Result<()>;
}

/// Appends one JSON object per line to a file.
pub struct JsonlTraceSink {
    file: Mutex<File>,
}

impl JsonlTraceSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl TraceSink for JsonlTraceSink {
    fn write(&self, event: &TraceEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// In-memory sink for tests and embedding.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Events of one type, in emission order.
    pub fn events_of_type(&self, event_type: &str) -> Vec<TraceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl TraceSink for MemorySink {
    fn write(&self, event: &TraceEvent) -> std::io::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Event emitter bound to one run.
#[derive(Clone)]
pub struct Tracer {
    run_id: String,
    sink: Arc<dyn TraceSink>,
}

impl Tracer {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            run_id: run_id.into(),
            sink,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit one event. Sink errors are swallowed.
    pub fn emit(&self, event_type: &str, data: Value, step_id: Option<&str>) {
        let event = TraceEvent {
            event_type: event_type.to_string(),
            data,
            step_id: step_id.map(String::from),
            run_id: self.run_id.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.sink.write(&event) {
            warn!("trace emission failed (ignored): {e}");
        }
    }

    pub fn emit_step_start(
        &self,
        step_id: &str,
        step_index: i64,
        goal: &str,
        attempt: u32,
        pre_url: &str,
    ) {
        self.emit(
            "step_start",
            serde_json::json!({
                "step_id": step_id,
                "step_index": step_index,
                "goal": goal,
                "attempt": attempt,
                "pre_url": pre_url,
            }),
            Some(step_id),
        );
    }

    /// Compact snapshot metadata; the full element list never enters the
    /// trace stream.
    pub fn emit_snapshot(
        &self,
        snapshot: &Snapshot,
        step_id: Option<&str>,
        step_index: i64,
        screenshot_format: Option<ImageFormat>,
    ) {
        let mut data = serde_json::json!({
            "step_id": step_id,
            "step_index": step_index,
            "url": snapshot.url,
            "element_count": snapshot.elements.len(),
            "screenshot_format": screenshot_format.map(|f| f.extension()),
        });
        if let Some(confidence) = snapshot.confidence() {
            data["confidence"] = serde_json::json!(confidence);
        }
        self.emit("snapshot", data, step_id);
    }

    pub fn emit_tool_call(&self, name: &str, success: bool, error: Option<&str>, step_id: Option<&str>) {
        let mut data = serde_json::json!({
            "name": name,
            "success": success,
        });
        if let Some(error) = error {
            data["error"] = serde_json::json!(error);
        }
        self.emit("tool_call", data, step_id);
    }
}
