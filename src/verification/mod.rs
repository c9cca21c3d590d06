//! Predicate evaluation primitives.
//!
//! A predicate is a pure function from an [`AssertContext`] to an
//! [`AssertOutcome`]. Predicates never perform I/O and never mutate; anything
//! that can fail (e.g. an invalid regex) is folded into a failing outcome at
//! construction time so that evaluation itself is infallible.

mod predicates;
mod selector;

pub use predicates::{
    exists, has_download, is_checked, is_disabled, is_enabled, is_expanded, url_contains,
    url_matches, value_contains, value_equals,
};
pub use selector::{Selector, SelectorClause, SelectorField, SelectorOp};

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::models::{DownloadRecord, Snapshot};

/// Evaluation context handed to predicates.
///
/// Borrowed views only: the runtime owns the snapshot and download records.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssertContext<'a> {
    pub snapshot: Option<&'a Snapshot>,
    pub url: Option<&'a str>,
    pub step_id: Option<&'a str>,
    pub downloads: Option<&'a [DownloadRecord]>,
}

/// Result of one predicate evaluation.
#[derive(Debug, Clone)]
pub struct AssertOutcome {
    pub passed: bool,
    pub reason: String,
    pub details: Map<String, Value>,
}

impl AssertOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: String::new(),
            details: Map::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Shared, cloneable predicate. `Arc` so a step definition can be re-run.
pub type Predicate = Arc<dyn Fn(&AssertContext<'_>) -> AssertOutcome + Send + Sync>;

/// Wrap a closure as a [`Predicate`].
pub fn predicate<F>(f: F) -> Predicate
where
    F: Fn(&AssertContext<'_>) -> AssertOutcome + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A predicate that fails unconditionally with the given reason. Used when a
/// predicate constructor is handed invalid input (bad selector, bad regex).
pub(crate) fn always_fail(reason: String) -> Predicate {
    Arc::new(move |_ctx| AssertOutcome::fail(reason.clone()))
}
