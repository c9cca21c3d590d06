//! Shared test harness: a scripted mock backend, scripted LLM providers, and
//! snapshot builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use veristep::backend::{BackendCapabilities, BackendError, BrowserBackend};
use veristep::llm::{LLMError, LLMProvider, LLMResponse};
use veristep::models::{
    BBox, CaptchaDiagnostics, Element, Snapshot, SnapshotDiagnostics, SnapshotStatus, Viewport,
    VisualCues,
};
use veristep::trace::{MemorySink, Tracer};
use veristep::runtime::AgentRuntime;

static LIMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""limit":\s*(\d+)"#).expect("regex"));

/// Backend that serves scripted snapshots through the in-page producer
/// protocol and records every input action.
pub struct MockBackend {
    pub snapshots: Mutex<VecDeque<Snapshot>>,
    pub url: Mutex<String>,
    pub clicks: Mutex<Vec<(f64, f64)>>,
    pub typed: Mutex<Vec<String>>,
    pub keys: Mutex<Vec<String>>,
    pub wheel_deltas: Mutex<Vec<f64>>,
    pub eval_exprs: Mutex<Vec<String>>,
    pub seen_limits: Mutex<Vec<u32>>,
    pub scroll_top: Mutex<f64>,
    /// When true, wheel events move the page (scroll_top += dy).
    pub wheel_moves_page: bool,
    /// When true, a JS `scrollBy` moves the page even if wheel does not.
    pub js_scroll_moves_page: bool,
    pub canvas_count: u64,
}

impl MockBackend {
    pub fn new(snapshots: Vec<Snapshot>) -> Self {
        let url = snapshots
            .first()
            .map(|s| s.url.clone())
            .unwrap_or_else(|| "about:blank".to_string());
        Self {
            snapshots: Mutex::new(snapshots.into()),
            url: Mutex::new(url),
            clicks: Mutex::new(Vec::new()),
            typed: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
            wheel_deltas: Mutex::new(Vec::new()),
            eval_exprs: Mutex::new(Vec::new()),
            seen_limits: Mutex::new(Vec::new()),
            scroll_top: Mutex::new(0.0),
            wheel_moves_page: true,
            js_scroll_moves_page: true,
            canvas_count: 0,
        }
    }

    /// Serve the next scripted snapshot; the last one repeats forever.
    fn next_snapshot(&self) -> Snapshot {
        let mut queue = self.snapshots.lock().expect("lock");
        let snap = if queue.len() > 1 {
            queue.pop_front().expect("non-empty")
        } else {
            queue.front().cloned().unwrap_or_else(|| make_snapshot("about:blank", vec![], None))
        };
        *self.url.lock().expect("lock") = snap.url.clone();
        snap
    }
}

#[async_trait]
impl BrowserBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn get_url(&self) -> Result<String, BackendError> {
        Ok(self.url.lock().expect("lock").clone())
    }

    async fn eval(&self, code: &str) -> Result<Value, BackendError> {
        self.eval_exprs.lock().expect("lock").push(code.to_string());

        if code.contains("typeof window.veristep") {
            return Ok(Value::Bool(true));
        }
        if code.contains("window.veristep.snapshot") {
            if let Some(m) = LIMIT_RE.captures(code)
                && let Ok(limit) = m[1].parse::<u32>()
            {
                self.seen_limits.lock().expect("lock").push(limit);
            }
            let snap = self.next_snapshot();
            return Ok(serde_json::to_value(snap).expect("snapshot serializes"));
        }
        if code.contains("document.readyState") {
            return Ok(Value::String("complete".to_string()));
        }
        if code.contains("window.location.href") {
            return Ok(Value::String(self.url.lock().expect("lock").clone()));
        }
        if code.contains("querySelectorAll('canvas')") {
            return Ok(Value::from(self.canvas_count));
        }
        if code.contains("scrollingElement") {
            let top = *self.scroll_top.lock().expect("lock");
            return Ok(serde_json::json!({"top": top, "height": 5000.0, "client": 720.0}));
        }
        if code.contains("window.scrollBy") {
            if self.js_scroll_moves_page
                && let Some(dy) = code
                    .split(',')
                    .nth(1)
                    .and_then(|s| s.trim().trim_end_matches(')').parse::<f64>().ok())
            {
                *self.scroll_top.lock().expect("lock") += dy;
            }
            return Ok(Value::Null);
        }
        if code.contains("innerWidth") {
            return Ok(serde_json::json!({
                "width": 1280.0, "height": 720.0,
                "scroll_x": 0.0, "scroll_y": *self.scroll_top.lock().expect("lock"),
            }));
        }
        Ok(Value::Null)
    }

    async fn mouse_move(&self, _x: f64, _y: f64) -> Result<(), BackendError> {
        Ok(())
    }

    async fn mouse_click(
        &self,
        x: f64,
        y: f64,
        _button: veristep::backend::MouseButton,
        _click_count: u32,
    ) -> Result<(), BackendError> {
        self.clicks.lock().expect("lock").push((x, y));
        Ok(())
    }

    async fn wheel(
        &self,
        delta_y: f64,
        _x: Option<f64>,
        _y: Option<f64>,
    ) -> Result<(), BackendError> {
        self.wheel_deltas.lock().expect("lock").push(delta_y);
        if self.wheel_moves_page {
            *self.scroll_top.lock().expect("lock") += delta_y;
        }
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), BackendError> {
        self.typed.lock().expect("lock").push(text.to_string());
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), BackendError> {
        self.keys.lock().expect("lock").push(key.to_string());
        Ok(())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, BackendError> {
        Ok(b"png-bytes".to_vec())
    }

    async fn screenshot_jpeg(&self, _quality: Option<u8>) -> Result<Vec<u8>, BackendError> {
        Ok(b"jpeg-bytes".to_vec())
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            tabs: false,
            evaluate_js: true,
            downloads: false,
            filesystem_tools: false,
            keyboard: true,
            permissions: false,
        }
    }
}

/// Scripted LLM provider; pops one response per call, `FINISH()` when dry.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<(String, String)>>,
    pub image_calls: Mutex<Vec<String>>,
    vision: bool,
    model: &'static str,
}

impl ScriptedProvider {
    pub fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
            image_calls: Mutex::new(Vec::new()),
            vision: false,
            model: "scripted",
        }
    }

    pub fn with_vision(responses: &[&str]) -> Self {
        Self {
            vision: true,
            model: "scripted-vision",
            ..Self::new(responses)
        }
    }

    fn next_response(&self) -> String {
        self.responses
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| "FINISH()".to_string())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("lock").len() + self.image_calls.lock().expect("lock").len()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _temperature: f64,
    ) -> Result<LLMResponse, LLMError> {
        self.calls
            .lock()
            .expect("lock")
            .push((system_prompt.to_string(), user_prompt.to_string()));
        Ok(LLMResponse {
            content: self.next_response(),
            model_name: self.model.to_string(),
        })
    }

    async fn generate_with_image(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        _image_base64: &str,
        _temperature: f64,
    ) -> Result<LLMResponse, LLMError> {
        self.image_calls
            .lock()
            .expect("lock")
            .push(user_prompt.to_string());
        Ok(LLMResponse {
            content: self.next_response(),
            model_name: self.model.to_string(),
        })
    }

    fn supports_vision(&self) -> bool {
        self.vision
    }

    fn model_name(&self) -> &str {
        self.model
    }
}

pub fn make_snapshot(url: &str, elements: Vec<Element>, confidence: Option<f64>) -> Snapshot {
    Snapshot {
        status: SnapshotStatus::Success,
        url: url.to_string(),
        timestamp: Some("2026-08-01T00:00:00Z".to_string()),
        viewport: Some(Viewport {
            width: 1280.0,
            height: 720.0,
        }),
        elements,
        screenshot: None,
        screenshot_format: None,
        diagnostics: confidence.map(|confidence| SnapshotDiagnostics {
            confidence: Some(confidence),
            captcha: None,
            metrics: None,
        }),
        error: None,
    }
}

pub fn snapshot_with_captcha(url: &str, captcha: CaptchaDiagnostics) -> Snapshot {
    let mut snap = make_snapshot(url, vec![], Some(0.9));
    snap.diagnostics = Some(SnapshotDiagnostics {
        confidence: Some(0.9),
        captcha: Some(captcha),
        metrics: None,
    });
    snap
}

pub fn clickable_element(id: i64) -> Element {
    Element {
        id,
        role: "button".to_string(),
        text: Some("OK".to_string()),
        name: None,
        href: None,
        value: None,
        input_type: None,
        importance: 100,
        bbox: BBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 40.0,
        },
        visual_cues: VisualCues {
            is_primary: true,
            is_clickable: true,
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

/// Runtime wired to a memory sink; returns the sink for event inspection.
pub fn make_runtime(backend: Arc<MockBackend>) -> (AgentRuntime, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let tracer = Tracer::new("test-run", sink.clone());
    let runtime = AgentRuntime::new(backend, tracer);
    (runtime, sink)
}
