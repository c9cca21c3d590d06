//! Composition of the `step_end` event payload.

use serde_json::{Map, Value, json};

/// Execution summary for the step's action.
#[derive(Debug, Clone)]
pub struct ExecData {
    pub success: bool,
    pub action: String,
    pub outcome: String,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

impl ExecData {
    fn into_value(self) -> Value {
        let mut map = Map::new();
        map.insert("success".into(), json!(self.success));
        map.insert("action".into(), json!(self.action));
        map.insert("outcome".into(), json!(self.outcome));
        if let Some(duration_ms) = self.duration_ms {
            map.insert("duration_ms".into(), json!(duration_ms));
        }
        if let Some(error) = self.error {
            map.insert("error".into(), json!(error));
        }
        Value::Object(map)
    }
}

/// Verification summary: overall pass plus free-form signals.
#[derive(Debug, Clone)]
pub struct VerifyData {
    pub passed: bool,
    pub signals: Map<String, Value>,
}

/// Build the `step_end` event payload.
///
/// `assertions` holds final assertion records only; intermediate `eventually`
/// attempts are emitted as separate `verification` events and never land here.
#[allow(clippy::too_many_arguments)]
pub fn build_step_end_event(
    step_id: &str,
    step_index: i64,
    goal: &str,
    attempt: u32,
    pre_url: &str,
    post_url: &str,
    snapshot_digest: Option<String>,
    post_snapshot_digest: Option<String>,
    exec: ExecData,
    verify: VerifyData,
    assertions: Vec<Value>,
    llm_data: Value,
) -> Value {
    json!({
        "step_id": step_id,
        "step_index": step_index,
        "goal": goal,
        "attempt": attempt,
        "pre_url": pre_url,
        "post_url": post_url,
        "snapshot_digest": snapshot_digest,
        "post_snapshot_digest": post_snapshot_digest,
        "exec": exec.into_value(),
        "verify": {
            "passed": verify.passed,
            "signals": Value::Object(verify.signals),
        },
        "assertions": assertions,
        "llm_data": llm_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_end_payload_shape() {
        let mut signals = Map::new();
        signals.insert("url_changed".into(), json!(true));
        let payload = build_step_end_event(
            "step-3",
            3,
            "submit the form",
            0,
            "https://a",
            "https://b",
            Some("sha256:abc".into()),
            None,
            ExecData {
                success: true,
                action: "CLICK(4)".into(),
                outcome: "ok".into(),
                duration_ms: Some(120),
                error: None,
            },
            VerifyData {
                passed: true,
                signals,
            },
            vec![json!({"label": "on_b", "passed": true})],
            json!({}),
        );
        assert_eq!(payload["step_id"], "step-3");
        assert_eq!(payload["exec"]["duration_ms"], 120);
        assert!(payload["exec"].get("error").is_none());
        assert_eq!(payload["verify"]["signals"]["url_changed"], true);
        assert_eq!(payload["assertions"].as_array().map(Vec::len), Some(1));
    }
}
