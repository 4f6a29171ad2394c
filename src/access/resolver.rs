//! Effective-owner resolution and permission predicates
//!
//! Ownership is recomputed from a fresh snapshot and `now` on every call.
//! Caching the resolved owner would grant or deny access incorrectly the
//! instant a delegation window opens or closes, so nothing here holds state.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::assignment::ResponsibilityAssignment;
use super::delegation::Delegation;
use crate::models::Agent;
use crate::workflow::{WorkItemKind, WorkItemStatus};

/// Point-in-time view of a zone's responsibility records
#[derive(Debug, Clone, Default)]
pub struct OwnershipSnapshot {
    /// The active permanent assignment, if any
    pub assignment: Option<ResponsibilityAssignment>,
    /// Administratively active delegations for the zone
    pub delegations: Vec<Delegation>,
}

impl OwnershipSnapshot {
    /// Resolve the effective owner of the zone at `now`
    ///
    /// With no active assignment the zone is an administrative gap and has
    /// no owner, delegations notwithstanding. An in-effect delegation
    /// overrides the permanent assignee.
    pub fn resolve_owner(&self, now: DateTime<Utc>) -> Option<Uuid> {
        let assignment = self.assignment.as_ref().filter(|a| a.active)?;
        let delegated = self
            .delegations
            .iter()
            .find(|d| d.is_in_effect(now))
            .map(|d| d.to_agent);
        Some(delegated.unwrap_or(assignment.agent_id))
    }
}

/// The slice of a work item the permission predicates need
#[derive(Debug, Clone, Copy)]
pub struct WorkItemCtx {
    pub kind: WorkItemKind,
    pub status: WorkItemStatus,
    pub created_by: Uuid,
}

/// May `principal` create, modify or close out this work item?
///
/// Non-admins must be the current effective owner of the report's zone and,
/// for anything below a report, the item's author. Admins skip both checks.
/// Nobody manages an item that is already completed or aborted.
pub fn can_manage(principal: &Agent, item: &WorkItemCtx, owner: Option<Uuid>) -> bool {
    if !principal.active {
        return false;
    }
    if matches!(item.status, WorkItemStatus::Completed | WorkItemStatus::Aborted) {
        return false;
    }
    if principal.is_acting_admin() {
        return true;
    }
    if owner != Some(principal.id) {
        return false;
    }
    match item.kind {
        WorkItemKind::Report => true,
        _ => item.created_by == principal.id,
    }
}

/// May `principal` abort this work item?
///
/// Admins may always abort; any current effective owner may abort anyone's
/// item, authorship aside. Terminal items and sub-actions cannot be aborted.
pub fn can_abort(principal: &Agent, item: &WorkItemCtx, owner: Option<Uuid>) -> bool {
    if !principal.active {
        return false;
    }
    if item.kind == WorkItemKind::SubAction || item.status.is_terminal() {
        return false;
    }
    if principal.is_acting_admin() {
        return true;
    }
    owner == Some(principal.id)
}

/// May `principal` add a sub-action under `parent`?
///
/// Only the parent's author, only while still the current effective owner,
/// and only while the parent is open. Admins get no bypass here.
pub fn can_create_sub_action(principal: &Agent, parent: &WorkItemCtx, owner: Option<Uuid>) -> bool {
    if !principal.active {
        return false;
    }
    if !parent.kind.owns_sub_actions() || parent.status.is_terminal() {
        return false;
    }
    parent.created_by == principal.id && owner == Some(principal.id)
}
