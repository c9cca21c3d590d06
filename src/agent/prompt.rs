//! Compact prompt format for the executor LLM.
//!
//! One line per element, salience-ordered by the snapshot producer. This is
//! deliberately minimal: richer prompt construction belongs to callers via
//! the custom builder hook.

use crate::models::{Element, Snapshot};

pub const EXECUTOR_SYSTEM_PROMPT: &str = "\
You control a web browser through numbered page elements.
Reply with EXACTLY ONE action call and nothing else:
  CLICK(id)            click element by id
  TYPE(id, \"text\")     click element by id, then type text
  PRESS('key')         press a keyboard key (e.g. 'Enter', 'Tab')
  CLICK_XY(x, y)       click at viewport coordinates
  FINISH()             the step goal is already satisfied
Use only ids that appear in the element list.";

fn element_line(el: &Element) -> String {
    let label = el
        .text
        .as_deref()
        .or(el.name.as_deref())
        .unwrap_or("")
        .trim()
        .chars()
        .take(80)
        .collect::<String>();

    let mut flags = Vec::new();
    if el.visual_cues.is_primary {
        flags.push("primary");
    }
    if el.disabled == Some(true) {
        flags.push("disabled");
    }
    if !el.in_viewport {
        flags.push("offscreen");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" ({})", flags.join(", "))
    };

    let value = el
        .value
        .as_deref()
        .map(|v| format!(" value={:?}", v.chars().take(40).collect::<String>()))
        .unwrap_or_default();

    format!("[{}] {} {:?}{}{}", el.id, el.role, label, value, flags)
}

/// Render the snapshot as a compact element list.
pub fn build_dom_context(snapshot: &Snapshot) -> String {
    let mut lines = Vec::with_capacity(snapshot.elements.len() + 1);
    lines.push(format!("URL: {}", snapshot.url));
    for el in &snapshot.elements {
        lines.push(element_line(el));
    }
    lines.join("\n")
}

/// Default user prompt: task framing plus the element list.
pub fn build_user_prompt(task_goal: &str, step_goal: &str, dom_context: &str) -> String {
    format!(
        "TASK: {task_goal}\nCURRENT STEP: {step_goal}\n\nPAGE ELEMENTS:\n{dom_context}\n\nAction:"
    )
}

/// User prompt for the vision executor: same contract, grounded in pixels.
pub fn build_vision_user_prompt(task_goal: &str, step_goal: &str) -> String {
    format!(
        "TASK: {task_goal}\nCURRENT STEP: {step_goal}\n\nThe screenshot shows the current page. \
         Structured element data is unavailable; prefer CLICK_XY(x, y) with coordinates read \
         from the screenshot.\n\nAction:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BBox, SnapshotStatus, VisualCues};

    #[test]
    fn dom_context_is_one_line_per_element() {
        let snapshot = Snapshot {
            status: SnapshotStatus::Success,
            url: "https://example.com".to_string(),
            timestamp: None,
            viewport: None,
            elements: vec![Element {
                id: 4,
                role: "button".to_string(),
                text: Some("Continue".to_string()),
                name: None,
                href: None,
                value: None,
                input_type: None,
                importance: 100,
                bbox: BBox {
                    x: 0.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
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
            }],
            screenshot: None,
            screenshot_format: None,
            diagnostics: None,
            error: None,
        };
        let ctx = build_dom_context(&snapshot);
        assert_eq!(ctx.lines().count(), 2);
        assert!(ctx.contains("[4] button \"Continue\" (primary)"));
    }
}
