//! Union-merge of scroll-sampled snapshots.
//!
//! Element ids are not reliable across snapshots (virtualization remounts
//! nodes) and bboxes are viewport-relative, so dedupe works off content keys
//! and approximate document position. The merged snapshot is for
//! extraction/analysis only: bboxes are not click-safe and the screenshot is
//! dropped.

use std::collections::HashMap;

use crate::models::{Element, Snapshot};

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable-ish dedupe key across scroll positions.
///
/// Preference order: href, then (role, name), then (role, text prefix,
/// doc_y bucket), then (role, doc_y bucket), then the per-snapshot id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DedupeKey {
    Href(String),
    RoleName(String, String),
    RoleTextDocY(String, String, i64),
    RoleText(String, String),
    RoleDocY(String, i64),
    Id(i64),
}

pub(crate) fn dedupe_key(el: &Element) -> DedupeKey {
    if let Some(href) = el.href.as_deref() {
        let href = href.trim();
        if !href.is_empty() {
            return DedupeKey::Href(href.to_string());
        }
    }

    if let Some(name) = el.name.as_deref() {
        let name = normalize_ws(name);
        if !name.is_empty() {
            return DedupeKey::RoleName(el.role.clone(), name);
        }
    }

    let text = el.text.as_deref().map(normalize_ws).unwrap_or_default();
    if !text.is_empty() {
        let prefix: String = text.chars().take(120).collect();
        if let Some(doc_y) = el.doc_y {
            return DedupeKey::RoleTextDocY(el.role.clone(), prefix, (doc_y / 10.0).floor() as i64);
        }
        return DedupeKey::RoleText(el.role.clone(), prefix);
    }

    if let Some(doc_y) = el.doc_y {
        return DedupeKey::RoleDocY(el.role.clone(), (doc_y / 10.0).floor() as i64);
    }

    DedupeKey::Id(el.id)
}

/// Lexicographic quality score; higher wins among duplicates.
fn quality_score(el: &Element) -> (i64, u8, u8, u8, u8) {
    let has_href = el.href.as_deref().is_some_and(|h| !h.trim().is_empty());
    let has_text = el
        .text
        .as_deref()
        .is_some_and(|t| !normalize_ws(t).is_empty());
    let has_name = el
        .name
        .as_deref()
        .is_some_and(|n| !normalize_ws(n).is_empty());
    (
        el.importance,
        has_href as u8,
        has_text as u8,
        has_name as u8,
        el.doc_y.is_some() as u8,
    )
}

/// Merge snapshots into a single union snapshot.
///
/// Keeps the best representative per dedupe key, orders by ascending `doc_y`
/// (ties broken by descending importance), and appends elements without
/// `doc_y` in first-seen order. Base url/viewport/diagnostics come from the
/// first snapshot; the screenshot is dropped.
pub fn merge_snapshots(snaps: &[Snapshot], union_limit: Option<usize>) -> Option<Snapshot> {
    let base = snaps.first()?;

    let mut best_by_key: HashMap<DedupeKey, Element> = HashMap::new();
    let mut first_seen: HashMap<DedupeKey, usize> = HashMap::new();
    let mut idx = 0usize;

    for snap in snaps {
        for el in &snap.elements {
            let key = dedupe_key(el);
            first_seen.entry(key.clone()).or_insert(idx);
            match best_by_key.get(&key) {
                Some(prev) if quality_score(prev) >= quality_score(el) => {}
                _ => {
                    best_by_key.insert(key, el.clone());
                }
            }
            idx += 1;
        }
    }

    let mut merged: Vec<Element> = best_by_key.values().cloned().collect();
    merged.sort_by(|a, b| match (a.doc_y, b.doc_y) {
        (Some(ya), Some(yb)) => ya
            .partial_cmp(&yb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.importance.cmp(&a.importance)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => {
            let fa = first_seen.get(&dedupe_key(a)).copied().unwrap_or(usize::MAX);
            let fb = first_seen.get(&dedupe_key(b)).copied().unwrap_or(usize::MAX);
            fa.cmp(&fb)
        }
    });

    if let Some(limit) = union_limit {
        merged.truncate(limit.max(1));
    }

    let mut out = base.clone();
    out.elements = merged;
    out.screenshot = None;
    out.screenshot_format = None;
    Some(out)
}
