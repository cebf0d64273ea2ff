//! Mutation notification model
//!
//! The host's business-rule engine emits one notification per accepted
//! mutation (a code applied, a source imported, ...). This subsystem only
//! consumes them: notifications are immutable and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Coarse mutation families produced by the host.
///
/// Closed set so that grouping in the commit-message synthesizer is
/// exhaustive; adding a family is a compile-time change rather than a new
/// string prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationCategory {
    /// Code operations: create, apply, merge, recolor, ...
    Coding,
    /// Source document operations: import, rename, delete, ...
    Sources,
    /// Case operations
    Cases,
    /// Journal entries
    Journals,
    /// Attribute definitions and values
    Attributes,
    /// Project-level settings and metadata
    Project,
}

impl MutationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationCategory::Coding => "coding",
            MutationCategory::Sources => "sources",
            MutationCategory::Cases => "cases",
            MutationCategory::Journals => "journals",
            MutationCategory::Attributes => "attributes",
            MutationCategory::Project => "project",
        }
    }
}

impl fmt::Display for MutationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully-qualified mutation kind, e.g. `coding.apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationKind {
    pub category: MutationCategory,
    pub action: String,
}

impl MutationKind {
    pub fn new(category: MutationCategory, action: impl Into<String>) -> Self {
        Self {
            category,
            action: action.into(),
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category, self.action)
    }
}

/// One mutation accepted by the host's business rules.
///
/// Delivered at-most-once and in emission order by the host feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationNotification {
    pub kind: MutationKind,
    pub occurred_at: DateTime<Utc>,
    /// Short human-readable description of the affected subject.
    pub subject: String,
}

impl MutationNotification {
    pub fn new(kind: MutationKind, subject: impl Into<String>) -> Self {
        Self {
            kind,
            occurred_at: Utc::now(),
            subject: subject.into(),
        }
    }
}

/// Buffer of notifications awaiting the next snapshot cycle.
///
/// Owned exclusively by the listener loop: grows on each notification and
/// is drained atomically when a quiet period elapses.
#[derive(Debug, Default)]
pub struct PendingBatch {
    events: Vec<MutationNotification>,
    opened_at: Option<Instant>,
}

impl PendingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notification, stamping the batch open time on the first one.
    pub fn push(&mut self, notification: MutationNotification) {
        if self.events.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.events.push(notification);
    }

    /// Swap the buffered events out, leaving this batch empty.
    pub fn drain(&mut self) -> PendingBatch {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[MutationNotification] {
        &self.events
    }

    /// When the first event of this batch arrived, if any.
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        let kind = MutationKind::new(MutationCategory::Coding, "apply");
        assert_eq!(kind.to_string(), "coding.apply");
        assert_eq!(
            MutationKind::new(MutationCategory::Sources, "import").to_string(),
            "sources.import"
        );
    }

    #[test]
    fn test_batch_drain_leaves_empty() {
        let mut batch = PendingBatch::new();
        batch.push(MutationNotification::new(
            MutationKind::new(MutationCategory::Coding, "create"),
            "code 'interview'",
        ));
        batch.push(MutationNotification::new(
            MutationKind::new(MutationCategory::Coding, "apply"),
            "code 'interview' on source 3",
        ));
        assert_eq!(batch.len(), 2);
        assert!(batch.opened_at().is_some());

        let drained = batch.drain();
        assert_eq!(drained.len(), 2);
        assert!(batch.is_empty());
        assert!(batch.opened_at().is_none());
    }

    #[test]
    fn test_batch_preserves_emission_order() {
        let mut batch = PendingBatch::new();
        for action in ["create", "apply", "rename"] {
            batch.push(MutationNotification::new(
                MutationKind::new(MutationCategory::Coding, action),
                action,
            ));
        }
        let actions: Vec<_> = batch.events().iter().map(|n| n.kind.action.as_str()).collect();
        assert_eq!(actions, vec!["create", "apply", "rename"]);
    }
}
