//! Executor action variants and the lenient reply parser.
//!
//! The LLM replies with a single call like `CLICK(12)` or
//! `TYPE(3, "user@example.com")`. Parsing is lenient: the first recognized
//! call anywhere in the reply wins, and anything unrecognized degrades to
//! `Finish` with a parse-error flag rather than failing the step loop.

use once_cell::sync::Lazy;
use regex::Regex;

/// Closed set of actions the executor can take.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Click { id: i64 },
    Type { id: i64, text: String },
    Press { key: String },
    ClickXy { x: f64, y: f64 },
    Finish,
}

impl Action {
    /// Canonical textual form, used for action recording.
    pub fn describe(&self) -> String {
        match self {
            Action::Click { id } => format!("CLICK({id})"),
            Action::Type { id, text } => format!("TYPE({id}, {text:?})"),
            Action::Press { key } => format!("PRESS('{key}')"),
            Action::ClickXy { x, y } => format!("CLICK_XY({x}, {y})"),
            Action::Finish => "FINISH()".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedAction {
    pub action: Action,
    /// Raw reply text the action was parsed from.
    pub raw: String,
    pub parse_error: bool,
}

static CLICK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCLICK\s*\(\s*(\d+)\s*\)").expect("static regex"));
static TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bTYPE\s*\(\s*(\d+)\s*,\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)')\s*\)"#)
        .expect("static regex")
});
static PRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bPRESS\s*\(\s*(?:"([^"]+)"|'([^']+)')\s*\)"#).expect("static regex")
});
static CLICK_XY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bCLICK_XY\s*\(\s*(-?\d+(?:\.\d+)?)\s*,\s*(-?\d+(?:\.\d+)?)\s*\)")
        .expect("static regex")
});
static FINISH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bFINISH\s*\(\s*\)").expect("static regex"));

fn unescape(s: &str) -> String {
    s.replace("\\\"", "\"").replace("\\'", "'").replace("\\\\", "\\")
}

/// Parse an executor reply into an [`Action`].
pub fn parse_action(text: &str) -> ParsedAction {
    // Earliest match in the reply wins; CLICK_XY is checked as its own
    // pattern, so a CLICK_XY call never half-matches as CLICK.
    let mut best: Option<(usize, Action)> = None;

    let mut consider = |start: usize, action: Action| {
        if best.as_ref().is_none_or(|(s, _)| start < *s) {
            best = Some((start, action));
        }
    };

    if let Some(m) = CLICK_XY_RE.captures(text) {
        let whole = m.get(0).expect("match");
        if let (Ok(x), Ok(y)) = (m[1].parse::<f64>(), m[2].parse::<f64>()) {
            consider(whole.start(), Action::ClickXy { x, y });
        }
    }
    if let Some(m) = CLICK_RE.captures(text) {
        let whole = m.get(0).expect("match");
        if let Ok(id) = m[1].parse::<i64>() {
            consider(whole.start(), Action::Click { id });
        }
    }
    if let Some(m) = TYPE_RE.captures(text) {
        let whole = m.get(0).expect("match");
        if let Ok(id) = m[1].parse::<i64>() {
            let raw_text = m.get(2).or_else(|| m.get(3)).map(|g| g.as_str()).unwrap_or("");
            consider(
                whole.start(),
                Action::Type {
                    id,
                    text: unescape(raw_text),
                },
            );
        }
    }
    if let Some(m) = PRESS_RE.captures(text) {
        let whole = m.get(0).expect("match");
        let key = m.get(1).or_else(|| m.get(2)).map(|g| g.as_str()).unwrap_or("");
        if !key.is_empty() {
            consider(
                whole.start(),
                Action::Press {
                    key: key.to_string(),
                },
            );
        }
    }
    if let Some(m) = FINISH_RE.find(text) {
        consider(m.start(), Action::Finish);
    }

    match best {
        Some((_, action)) => ParsedAction {
            action,
            raw: text.to_string(),
            parse_error: false,
        },
        None => ParsedAction {
            action: Action::Finish,
            raw: text.to_string(),
            parse_error: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_click() {
        let parsed = parse_action("CLICK(42)");
        assert_eq!(parsed.action, Action::Click { id: 42 });
        assert!(!parsed.parse_error);
    }

    #[test]
    fn parses_type_with_quotes_and_escapes() {
        let parsed = parse_action(r#"TYPE(3, "user \"admin\"")"#);
        assert_eq!(
            parsed.action,
            Action::Type {
                id: 3,
                text: r#"user "admin""#.to_string()
            }
        );
        let single = parse_action("TYPE(7, 'hello world')");
        assert_eq!(
            single.action,
            Action::Type {
                id: 7,
                text: "hello world".to_string()
            }
        );
    }

    #[test]
    fn parses_press_and_click_xy_and_finish() {
        assert_eq!(
            parse_action("PRESS('Enter')").action,
            Action::Press {
                key: "Enter".to_string()
            }
        );
        assert_eq!(
            parse_action("CLICK_XY(100, 200)").action,
            Action::ClickXy { x: 100.0, y: 200.0 }
        );
        assert_eq!(parse_action("FINISH()").action, Action::Finish);
    }

    #[test]
    fn click_xy_does_not_parse_as_click() {
        let parsed = parse_action("CLICK_XY(10, 20)");
        assert_eq!(parsed.action, Action::ClickXy { x: 10.0, y: 20.0 });
    }

    #[test]
    fn surrounding_prose_is_tolerated() {
        let parsed = parse_action("I think the best action is CLICK(5) because the button is visible.");
        assert_eq!(parsed.action, Action::Click { id: 5 });
        assert!(!parsed.parse_error);
    }

    #[test]
    fn earliest_action_wins() {
        let parsed = parse_action("CLICK(1) then later FINISH()");
        assert_eq!(parsed.action, Action::Click { id: 1 });
    }

    #[test]
    fn garbage_becomes_finish_with_parse_error() {
        let parsed = parse_action("I am not sure what to do here.");
        assert_eq!(parsed.action, Action::Finish);
        assert!(parsed.parse_error);
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(parse_action("click(9)").action, Action::Click { id: 9 });
    }
}
