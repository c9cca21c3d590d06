//! Built-in predicates over snapshots, URLs, element state, and downloads.

use serde_json::json;

use super::selector::Selector;
use super::{AssertContext, AssertOutcome, Predicate, always_fail, predicate};
use crate::models::Element;

/// Passes iff at least one element matches the selector.
pub fn exists(selector: &str) -> Predicate {
    let sel = match Selector::parse(selector) {
        Ok(sel) => sel,
        Err(e) => return always_fail(e.to_string()),
    };
    predicate(move |ctx| {
        let Some(snapshot) = ctx.snapshot else {
            return AssertOutcome::fail("no snapshot in context")
                .with_detail("selector", json!(sel.source()));
        };
        let count = sel.all_matches(&snapshot.elements).len();
        let outcome = if count > 0 {
            AssertOutcome::pass()
        } else {
            AssertOutcome::fail(format!("no element matches '{}'", sel.source()))
        };
        outcome
            .with_detail("selector", json!(sel.source()))
            .with_detail("match_count", json!(count))
    })
}

/// Pure URL substring check.
pub fn url_contains(substring: &str) -> Predicate {
    let needle = substring.to_string();
    predicate(move |ctx| {
        let Some(url) = ctx.url else {
            return AssertOutcome::fail("no url in context").with_detail("substring", json!(needle));
        };
        let passed = url.contains(&needle);
        let outcome = if passed {
            AssertOutcome::pass()
        } else {
            AssertOutcome::fail(format!("url '{url}' does not contain '{needle}'"))
        };
        outcome
            .with_detail("substring", json!(needle))
            .with_detail("url", json!(url))
    })
}

/// Pure URL regex check. `flags` supports `i` (case-insensitive).
pub fn url_matches(pattern: &str, flags: Option<&str>) -> Predicate {
    let mut source = String::new();
    if flags.is_some_and(|f| f.contains('i')) {
        source.push_str("(?i)");
    }
    source.push_str(pattern);
    let re = match regex::Regex::new(&source) {
        Ok(re) => re,
        Err(e) => return always_fail(format!("invalid regex '{pattern}': {e}")),
    };
    let pattern = pattern.to_string();
    predicate(move |ctx| {
        let Some(url) = ctx.url else {
            return AssertOutcome::fail("no url in context").with_detail("pattern", json!(pattern));
        };
        let passed = re.is_match(url);
        let outcome = if passed {
            AssertOutcome::pass()
        } else {
            AssertOutcome::fail(format!("url '{url}' does not match /{pattern}/"))
        };
        outcome
            .with_detail("pattern", json!(pattern))
            .with_detail("url", json!(url))
    })
}

/// Shared shape for state predicates: resolve the selector, then check an
/// explicitly-set state field. Absent state never passes.
fn state_predicate(
    selector: &str,
    state_name: &'static str,
    check: impl Fn(&Element) -> Option<bool> + Send + Sync + 'static,
) -> Predicate {
    let sel = match Selector::parse(selector) {
        Ok(sel) => sel,
        Err(e) => return always_fail(e.to_string()),
    };
    predicate(move |ctx| {
        let Some(snapshot) = ctx.snapshot else {
            return AssertOutcome::fail("no snapshot in context")
                .with_detail("selector", json!(sel.source()));
        };
        let Some(element) = sel.first_match(&snapshot.elements) else {
            return AssertOutcome::fail(format!("no element matches '{}'", sel.source()))
                .with_detail("selector", json!(sel.source()));
        };
        match check(element) {
            Some(true) => AssertOutcome::pass()
                .with_detail("selector", json!(sel.source()))
                .with_detail("element_id", json!(element.id)),
            Some(false) => AssertOutcome::fail(format!(
                "element {} does not satisfy {state_name}",
                element.id
            ))
            .with_detail("selector", json!(sel.source()))
            .with_detail("element_id", json!(element.id)),
            None => AssertOutcome::fail(format!(
                "element {} has no {state_name} state reported",
                element.id
            ))
            .with_detail("selector", json!(sel.source()))
            .with_detail("element_id", json!(element.id)),
        }
    })
}

pub fn is_enabled(selector: &str) -> Predicate {
    state_predicate(selector, "enabled", |e| e.disabled.map(|d| !d))
}

pub fn is_disabled(selector: &str) -> Predicate {
    state_predicate(selector, "disabled", |e| e.disabled)
}

pub fn is_checked(selector: &str) -> Predicate {
    state_predicate(selector, "checked", |e| e.checked)
}

pub fn is_expanded(selector: &str) -> Predicate {
    state_predicate(selector, "expanded", |e| e.expanded)
}

fn value_predicate(selector: &str, expected: &str, exact: bool) -> Predicate {
    let sel = match Selector::parse(selector) {
        Ok(sel) => sel,
        Err(e) => return always_fail(e.to_string()),
    };
    let expected = expected.to_string();
    predicate(move |ctx| {
        let Some(snapshot) = ctx.snapshot else {
            return AssertOutcome::fail("no snapshot in context")
                .with_detail("selector", json!(sel.source()));
        };
        let Some(element) = sel.first_match(&snapshot.elements) else {
            return AssertOutcome::fail(format!("no element matches '{}'", sel.source()))
                .with_detail("selector", json!(sel.source()));
        };
        let Some(value) = element.value.as_deref() else {
            return AssertOutcome::fail(format!("element {} has no value reported", element.id))
                .with_detail("selector", json!(sel.source()))
                .with_detail("element_id", json!(element.id));
        };
        let passed = if exact {
            value == expected
        } else {
            value.to_lowercase().contains(&expected.to_lowercase())
        };
        let outcome = if passed {
            AssertOutcome::pass()
        } else {
            AssertOutcome::fail(format!(
                "value '{value}' does not {} '{expected}'",
                if exact { "equal" } else { "contain" }
            ))
        };
        outcome
            .with_detail("selector", json!(sel.source()))
            .with_detail("element_id", json!(element.id))
            .with_detail("expected", json!(expected))
    })
}

pub fn value_equals(selector: &str, expected: &str) -> Predicate {
    value_predicate(selector, expected, true)
}

pub fn value_contains(selector: &str, expected: &str) -> Predicate {
    value_predicate(selector, expected, false)
}

/// Passes iff a completed download's suggested filename contains `substring`
/// (case-insensitive). Requires the backend to report downloads.
pub fn has_download(substring: &str) -> Predicate {
    let needle = substring.to_lowercase();
    let raw = substring.to_string();
    predicate(move |ctx: &AssertContext<'_>| {
        let Some(downloads) = ctx.downloads else {
            return AssertOutcome::fail("backend reports no downloads")
                .with_detail("substring", json!(raw));
        };
        let hit = downloads.iter().find(|d| {
            d.completed && d.suggested_filename.to_lowercase().contains(&needle)
        });
        match hit {
            Some(d) => AssertOutcome::pass()
                .with_detail("substring", json!(raw))
                .with_detail("filename", json!(d.suggested_filename)),
            None => AssertOutcome::fail(format!("no completed download matching '{raw}'"))
                .with_detail("substring", json!(raw))
                .with_detail("download_count", json!(downloads.len())),
        }
    })
}
