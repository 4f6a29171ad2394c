//! Work-item types
//!
//! Reports, actions, corrective actions and sub-actions share one status
//! vocabulary; the kind discriminator is fixed at load time rather than
//! sniffed per call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    NotStarted,
    InProgress,
    Completed,
    Canceled,
    /// Parents only; sub-actions are forced to `Canceled` instead
    Aborted,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::NotStarted => "not_started",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Canceled => "canceled",
            WorkItemStatus::Aborted => "aborted",
        }
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed | WorkItemStatus::Canceled | WorkItemStatus::Aborted
        )
    }

    /// Whether a directly-asserted transition to `next` is allowed
    pub fn can_transition_to(&self, next: WorkItemStatus) -> bool {
        matches!(
            (self, next),
            (WorkItemStatus::NotStarted, WorkItemStatus::InProgress)
                | (WorkItemStatus::NotStarted, WorkItemStatus::Canceled)
                | (WorkItemStatus::InProgress, WorkItemStatus::Completed)
                | (WorkItemStatus::InProgress, WorkItemStatus::Canceled)
        )
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(WorkItemStatus::NotStarted),
            "in_progress" => Ok(WorkItemStatus::InProgress),
            "completed" => Ok(WorkItemStatus::Completed),
            "canceled" => Ok(WorkItemStatus::Canceled),
            "aborted" => Ok(WorkItemStatus::Aborted),
            _ => Err(format!("Invalid work item status: {}", s)),
        }
    }
}

/// Kind of node in the work-item tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    Report,
    Action,
    CorrectiveAction,
    SubAction,
}

impl WorkItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemKind::Report => "report",
            WorkItemKind::Action => "action",
            WorkItemKind::CorrectiveAction => "corrective_action",
            WorkItemKind::SubAction => "sub_action",
        }
    }

    /// Whether items of this kind own sub-actions
    pub fn owns_sub_actions(&self) -> bool {
        matches!(self, WorkItemKind::Action | WorkItemKind::CorrectiveAction)
    }
}

impl std::str::FromStr for WorkItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(WorkItemKind::Report),
            "action" => Ok(WorkItemKind::Action),
            "corrective_action" => Ok(WorkItemKind::CorrectiveAction),
            "sub_action" => Ok(WorkItemKind::SubAction),
            _ => Err(format!("Invalid work item kind: {}", s)),
        }
    }
}

/// A safety incident report, root of a work-item tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: WorkItemStatus,
    pub created_by: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    pub fn new(
        zone_id: Uuid,
        title: impl Into<String>,
        description: impl Into<String>,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            zone_id,
            title: title.into(),
            description: description.into(),
            status: WorkItemStatus::NotStarted,
            created_by,
            aborted_by: None,
            aborted_at: None,
            abort_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn abort(
        &mut self,
        actor: Uuid,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "Cannot abort report with terminal status: {}",
                self.status.as_str()
            ));
        }
        self.status = WorkItemStatus::Aborted;
        self.aborted_by = Some(actor);
        self.aborted_at = Some(now);
        self.abort_reason = Some(reason.into());
        self.updated_at = now;
        Ok(())
    }
}

/// An action, corrective action or sub-action on a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub report_id: Uuid,
    /// Parent action for sub-actions; `None` for report-level items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub kind: WorkItemKind,
    pub description: String,
    pub status: WorkItemStatus,
    pub created_by: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    fn new(
        report_id: Uuid,
        parent_id: Option<Uuid>,
        kind: WorkItemKind,
        description: impl Into<String>,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            report_id,
            parent_id,
            kind,
            description: description.into(),
            status: WorkItemStatus::NotStarted,
            created_by,
            aborted_by: None,
            aborted_at: None,
            abort_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn action(
        report_id: Uuid,
        description: impl Into<String>,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(report_id, None, WorkItemKind::Action, description, created_by, now)
    }

    pub fn corrective_action(
        report_id: Uuid,
        description: impl Into<String>,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            report_id,
            None,
            WorkItemKind::CorrectiveAction,
            description,
            created_by,
            now,
        )
    }

    pub fn sub_action(
        report_id: Uuid,
        parent_id: Uuid,
        description: impl Into<String>,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            report_id,
            Some(parent_id),
            WorkItemKind::SubAction,
            description,
            created_by,
            now,
        )
    }

    /// Assert a sub-action's status directly
    pub fn set_status(&mut self, status: WorkItemStatus, now: DateTime<Utc>) -> Result<(), String> {
        if self.kind != WorkItemKind::SubAction {
            return Err(format!(
                "Status of a {} is derived from its children",
                self.kind.as_str()
            ));
        }
        if status == WorkItemStatus::Aborted {
            return Err("Sub-actions are never aborted directly".to_string());
        }
        if !self.status.can_transition_to(status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                status.as_str()
            ));
        }
        self.status = status;
        self.updated_at = now;
        Ok(())
    }

    /// Record a freshly derived status on a parent item
    pub fn apply_derived(&mut self, status: WorkItemStatus, now: DateTime<Utc>) -> bool {
        // Aborted overrides any derived value
        if self.status == WorkItemStatus::Aborted || self.status == status {
            return false;
        }
        self.status = status;
        self.updated_at = now;
        true
    }

    pub fn abort(
        &mut self,
        actor: Uuid,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if self.kind == WorkItemKind::SubAction {
            return Err("Sub-actions are canceled by their parent's abort".to_string());
        }
        if self.status.is_terminal() {
            return Err(format!(
                "Cannot abort work item with terminal status: {}",
                self.status.as_str()
            ));
        }
        self.status = WorkItemStatus::Aborted;
        self.aborted_by = Some(actor);
        self.aborted_at = Some(now);
        self.abort_reason = Some(reason.into());
        self.updated_at = now;
        Ok(())
    }

    /// Force-cancel during a parent abort; completed work is left untouched
    pub fn cancel_for_cascade(&mut self, now: DateTime<Utc>) -> bool {
        if matches!(
            self.status,
            WorkItemStatus::Completed | WorkItemStatus::Canceled
        ) {
            return false;
        }
        self.status = WorkItemStatus::Canceled;
        self.updated_at = now;
        true
    }
}
