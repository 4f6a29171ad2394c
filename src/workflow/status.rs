//! Bottom-up status aggregation
//!
//! A parent's status is derived from its sub-actions by an ordered list of
//! (predicate, result) rules; the first rule that matches wins. The rules
//! are pure over a tally of child statuses, so they can be tested without
//! touching storage.

use super::item::WorkItemStatus;

/// Tally of sub-action statuses under one parent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub not_started: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub canceled: usize,
}

impl StatusCounts {
    pub fn tally(children: &[WorkItemStatus]) -> Self {
        let mut counts = Self::default();
        for status in children {
            match status {
                WorkItemStatus::NotStarted => counts.not_started += 1,
                WorkItemStatus::InProgress => counts.in_progress += 1,
                WorkItemStatus::Completed => counts.completed += 1,
                WorkItemStatus::Canceled => counts.canceled += 1,
                // Sub-actions never hold Aborted; ignore if one slips through
                WorkItemStatus::Aborted => {}
            }
        }
        counts
    }
}

type Rule = (fn(&StatusCounts) -> bool, WorkItemStatus);

fn any_in_progress(c: &StatusCounts) -> bool {
    c.in_progress > 0
}

fn nothing_underway(c: &StatusCounts) -> bool {
    c.in_progress == 0 && c.completed == 0
}

fn partially_complete(c: &StatusCounts) -> bool {
    (c.not_started > 0 || c.in_progress > 0) && (c.completed > 0 || c.canceled > 0)
}

fn all_resolved_with_completions(c: &StatusCounts) -> bool {
    c.not_started == 0 && c.in_progress == 0 && c.completed > 0
}

/// Aggregation rules in priority order; first match wins
const RULES: &[Rule] = &[
    (any_in_progress, WorkItemStatus::InProgress),
    (nothing_underway, WorkItemStatus::NotStarted),
    (partially_complete, WorkItemStatus::InProgress),
    (all_resolved_with_completions, WorkItemStatus::Completed),
];

/// Derive a parent's status from its sub-actions
///
/// Callers short-circuit to `Aborted` for an explicitly aborted parent
/// before consulting this function.
pub fn derive_parent_status(children: &[WorkItemStatus]) -> WorkItemStatus {
    let counts = StatusCounts::tally(children);
    RULES
        .iter()
        .find(|(applies, _)| applies(&counts))
        .map(|&(_, status)| status)
        .unwrap_or(WorkItemStatus::NotStarted)
}
