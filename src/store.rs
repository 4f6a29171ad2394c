//! Database store for zones, responsibilities, delegations and work items
//!
//! Invariant-bearing writes (zone assignment, delegation creation, status
//! recomputation, abort cascades) run their check and write inside a single
//! transaction, so two racing requests cannot both pass the check. Effective
//! ownership is resolved from a fresh snapshot on every call and never
//! cached. State-transition events are broadcast fire-and-forget; a dropped
//! event never rolls back a committed write.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::access::resolver::{self, OwnershipSnapshot, WorkItemCtx};
use crate::access::{Delegation, ResponsibilityAssignment};
use crate::error::{AppError, Result};
use crate::models::{Agent, CreateDelegationRequest, Zone};
use crate::workflow::status::derive_parent_status;
use crate::workflow::{Report, WorkItem, WorkItemKind, WorkItemStatus};

/// Events emitted after successful state transitions
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ZoneAssigned {
        zone_id: Uuid,
        agent_id: Uuid,
    },
    ZoneRevoked {
        zone_id: Uuid,
        agent_id: Uuid,
    },
    DelegationCreated {
        delegation_id: Uuid,
        zone_id: Uuid,
        from_agent: Uuid,
        to_agent: Uuid,
    },
    DelegationUpdated {
        delegation_id: Uuid,
    },
    DelegationEnded {
        delegation_id: Uuid,
    },
    ReportCreated {
        report_id: Uuid,
        zone_id: Uuid,
        created_by: Uuid,
    },
    WorkItemCreated {
        work_item_id: Uuid,
        report_id: Uuid,
        kind: WorkItemKind,
    },
    StatusChanged {
        item_id: Uuid,
        old_status: WorkItemStatus,
        new_status: WorkItemStatus,
    },
    WorkItemAborted {
        item_id: Uuid,
        aborted_by: Uuid,
        canceled_children: u64,
    },
}

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self { pool, event_tx }
    }

    /// Subscribe to state-transition events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }

    // Agent operations

    pub async fn create_agent(
        &self,
        name: &str,
        email: &str,
        is_admin: bool,
    ) -> Result<Agent> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO agents (id, name, email, is_admin, active, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .bind(email)
        .bind(is_admin)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Agent {
            id,
            name: name.to_string(),
            email: email.to_string(),
            is_admin,
            active: true,
            created_at: now,
        })
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Agent> {
        let row = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, name, email, is_admin, active, created_at
            FROM agents
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Agent {} not found", id)))?;

        row.try_into()
    }

    // Zone operations

    pub async fn create_zone(&self, name: &str, code: &str) -> Result<Zone> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM zones WHERE code = ?")
                .bind(code)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(AppError::Conflict(format!(
                "Zone code {} is already in use",
                code
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO zones (id, name, code, active, created_at)
            VALUES (?, ?, ?, 1, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(name)
        .bind(code)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Zone {
            id,
            name: name.to_string(),
            code: code.to_string(),
            active: true,
            created_at: now,
        })
    }

    pub async fn get_zone(&self, id: Uuid) -> Result<Zone> {
        let row = sqlx::query_as::<_, ZoneRow>(
            r#"
            SELECT id, name, code, active, created_at
            FROM zones
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Zone {} not found", id)))?;

        row.try_into()
    }

    pub async fn list_zones(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query_as::<_, ZoneRow>(
            r#"
            SELECT id, name, code, active, created_at
            FROM zones
            ORDER BY code ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Soft-deactivate a zone; existing records keep referencing it
    pub async fn deactivate_zone(&self, id: Uuid) -> Result<()> {
        let affected = sqlx::query("UPDATE zones SET active = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if affected == 0 {
            return Err(AppError::NotFound(format!("Zone {} not found", id)));
        }
        Ok(())
    }

    // Responsibility operations

    /// Assign permanent responsibility for a zone
    ///
    /// Creates a fresh assignment or reactivates the agent's previous one.
    /// Idempotent when the agent already holds the zone.
    pub async fn assign_zone(
        &self,
        agent_id: Uuid,
        zone_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ResponsibilityAssignment> {
        self.get_agent(agent_id).await?;
        let zone = self.get_zone(zone_id).await?;
        if !zone.active {
            return Err(AppError::Conflict(format!(
                "Zone {} is deactivated",
                zone.code
            )));
        }

        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, ResponsibilityRow>(
            r#"
            SELECT id, agent_id, zone_id, assigned_at, active
            FROM responsibilities
            WHERE zone_id = ? AND active = 1
            "#,
        )
        .bind(zone_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = current {
            let current: ResponsibilityAssignment = row.try_into()?;
            if current.agent_id == agent_id {
                return Ok(current);
            }
            return Err(AppError::Conflict(format!(
                "Zone {} is already owned by agent {}",
                zone.code, current.agent_id
            )));
        }

        let previous = sqlx::query_as::<_, ResponsibilityRow>(
            r#"
            SELECT id, agent_id, zone_id, assigned_at, active
            FROM responsibilities
            WHERE zone_id = ? AND agent_id = ? AND active = 0
            ORDER BY assigned_at DESC
            LIMIT 1
            "#,
        )
        .bind(zone_id.to_string())
        .bind(agent_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let assignment = if let Some(row) = previous {
            let mut assignment: ResponsibilityAssignment = row.try_into()?;
            sqlx::query("UPDATE responsibilities SET active = 1, assigned_at = ? WHERE id = ?")
                .bind(now)
                .bind(assignment.id.to_string())
                .execute(&mut *tx)
                .await?;
            assignment.active = true;
            assignment.assigned_at = now;
            assignment
        } else {
            let assignment = ResponsibilityAssignment::new(agent_id, zone_id, now);
            sqlx::query(
                r#"
                INSERT INTO responsibilities (id, agent_id, zone_id, assigned_at, active)
                VALUES (?, ?, ?, ?, 1)
                "#,
            )
            .bind(assignment.id.to_string())
            .bind(agent_id.to_string())
            .bind(zone_id.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            assignment
        };

        tx.commit().await?;

        let _ = self.event_tx.send(StoreEvent::ZoneAssigned { zone_id, agent_id });

        Ok(assignment)
    }

    /// Revoke an agent's responsibility for a zone
    ///
    /// Blocked while the zone has delegations that are administratively
    /// active and not yet lapsed.
    pub async fn revoke_zone(
        &self,
        agent_id: Uuid,
        zone_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, ResponsibilityRow>(
            r#"
            SELECT id, agent_id, zone_id, assigned_at, active
            FROM responsibilities
            WHERE zone_id = ? AND agent_id = ? AND active = 1
            "#,
        )
        .bind(zone_id.to_string())
        .bind(agent_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Agent {} holds no active responsibility for zone {}",
                agent_id, zone_id
            ))
        })?;
        let current: ResponsibilityAssignment = current.try_into()?;

        let delegations = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, zone_id, from_agent, to_agent, starts_at, ends_at,
                   reason, active, created_by, created_at
            FROM delegations
            WHERE zone_id = ? AND active = 1
            "#,
        )
        .bind(zone_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        let blocking = delegations
            .into_iter()
            .map(Delegation::try_from)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .any(|d| d.ends_at > now);
        if blocking {
            return Err(AppError::Conflict(format!(
                "Zone {} still has active delegations; end them first",
                zone_id
            )));
        }

        sqlx::query("UPDATE responsibilities SET active = 0 WHERE id = ?")
            .bind(current.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let _ = self.event_tx.send(StoreEvent::ZoneRevoked { zone_id, agent_id });

        Ok(())
    }

    /// The active permanent assignment for a zone, if any
    pub async fn active_responsibility(
        &self,
        zone_id: Uuid,
    ) -> Result<Option<ResponsibilityAssignment>> {
        let row = sqlx::query_as::<_, ResponsibilityRow>(
            r#"
            SELECT id, agent_id, zone_id, assigned_at, active
            FROM responsibilities
            WHERE zone_id = ? AND active = 1
            "#,
        )
        .bind(zone_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    // Delegation operations

    pub async fn create_delegation(
        &self,
        req: &CreateDelegationRequest,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Delegation> {
        Delegation::validate_interval(req.starts_at, req.ends_at, now)
            .map_err(AppError::Validation)?;
        if req.reason.trim().is_empty() {
            return Err(AppError::Validation(
                "A delegation requires a reason".to_string(),
            ));
        }
        self.get_agent(req.from_agent).await?;
        self.get_agent(req.to_agent).await?;
        self.get_zone(req.zone_id).await?;

        let mut tx = self.pool.begin().await?;

        let owner = sqlx::query_as::<_, ResponsibilityRow>(
            r#"
            SELECT id, agent_id, zone_id, assigned_at, active
            FROM responsibilities
            WHERE zone_id = ? AND active = 1
            "#,
        )
        .bind(req.zone_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let holds_zone = match owner {
            Some(row) => {
                let assignment: ResponsibilityAssignment = row.try_into()?;
                assignment.agent_id == req.from_agent
            }
            None => false,
        };
        if !holds_zone {
            return Err(AppError::Conflict(format!(
                "Agent {} does not hold responsibility for zone {}",
                req.from_agent, req.zone_id
            )));
        }

        let existing = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, zone_id, from_agent, to_agent, starts_at, ends_at,
                   reason, active, created_by, created_at
            FROM delegations
            WHERE zone_id = ? AND active = 1
            "#,
        )
        .bind(req.zone_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        for row in existing {
            let other: Delegation = row.try_into()?;
            if other.overlaps(req.starts_at, req.ends_at) {
                return Err(AppError::Conflict(format!(
                    "Zone {} is already delegated over an overlapping window ({})",
                    req.zone_id, other.id
                )));
            }
        }

        let delegation = Delegation::new(
            req.zone_id,
            req.from_agent,
            req.to_agent,
            req.starts_at,
            req.ends_at,
            req.reason.clone(),
            created_by,
            now,
        );

        sqlx::query(
            r#"
            INSERT INTO delegations
                (id, zone_id, from_agent, to_agent, starts_at, ends_at,
                 reason, active, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(delegation.id.to_string())
        .bind(delegation.zone_id.to_string())
        .bind(delegation.from_agent.to_string())
        .bind(delegation.to_agent.to_string())
        .bind(delegation.starts_at)
        .bind(delegation.ends_at)
        .bind(&delegation.reason)
        .bind(delegation.created_by.to_string())
        .bind(delegation.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let _ = self.event_tx.send(StoreEvent::DelegationCreated {
            delegation_id: delegation.id,
            zone_id: delegation.zone_id,
            from_agent: delegation.from_agent,
            to_agent: delegation.to_agent,
        });

        Ok(delegation)
    }

    /// Edit the window or reason of a delegation that has not yet ended
    pub async fn update_delegation(
        &self,
        id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Delegation> {
        if reason.trim().is_empty() {
            return Err(AppError::Validation(
                "A delegation requires a reason".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, zone_id, from_agent, to_agent, starts_at, ends_at,
                   reason, active, created_by, created_at
            FROM delegations
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Delegation {} not found", id)))?;
        let mut delegation: Delegation = row.try_into()?;

        if !delegation.is_editable(now) {
            return Err(AppError::Conflict(format!(
                "Cannot edit a {} delegation",
                delegation.state_at(now).as_str()
            )));
        }
        if starts_at >= ends_at {
            return Err(AppError::Validation(format!(
                "delegation must end after it starts ({} >= {})",
                starts_at, ends_at
            )));
        }
        // The start may stay in the past only if it is unchanged
        if starts_at != delegation.starts_at && starts_at < now {
            return Err(AppError::Validation(
                "delegation must not start in the past".to_string(),
            ));
        }

        let others = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, zone_id, from_agent, to_agent, starts_at, ends_at,
                   reason, active, created_by, created_at
            FROM delegations
            WHERE zone_id = ? AND active = 1 AND id != ?
            "#,
        )
        .bind(delegation.zone_id.to_string())
        .bind(id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        for row in others {
            let other: Delegation = row.try_into()?;
            if other.overlaps(starts_at, ends_at) {
                return Err(AppError::Conflict(format!(
                    "Zone {} is already delegated over an overlapping window ({})",
                    delegation.zone_id, other.id
                )));
            }
        }

        sqlx::query(
            r#"
            UPDATE delegations SET starts_at = ?, ends_at = ?, reason = ? WHERE id = ?
            "#,
        )
        .bind(starts_at)
        .bind(ends_at)
        .bind(reason)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        delegation.starts_at = starts_at;
        delegation.ends_at = ends_at;
        delegation.reason = reason.to_string();

        let _ = self
            .event_tx
            .send(StoreEvent::DelegationUpdated { delegation_id: id });

        Ok(delegation)
    }

    /// End a delegation early. Idempotent.
    pub async fn end_delegation(&self, id: Uuid) -> Result<()> {
        let was_active: Option<bool> =
            sqlx::query_scalar("SELECT active FROM delegations WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        let was_active = was_active
            .ok_or_else(|| AppError::NotFound(format!("Delegation {} not found", id)))?;

        if !was_active {
            return Ok(());
        }

        sqlx::query("UPDATE delegations SET active = 0 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        let _ = self
            .event_tx
            .send(StoreEvent::DelegationEnded { delegation_id: id });

        Ok(())
    }

    pub async fn get_delegation(&self, id: Uuid) -> Result<Delegation> {
        let row = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, zone_id, from_agent, to_agent, starts_at, ends_at,
                   reason, active, created_by, created_at
            FROM delegations
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Delegation {} not found", id)))?;

        row.try_into()
    }

    pub async fn list_delegations_for_zone(&self, zone_id: Uuid) -> Result<Vec<Delegation>> {
        let rows = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, zone_id, from_agent, to_agent, starts_at, ends_at,
                   reason, active, created_by, created_at
            FROM delegations
            WHERE zone_id = ?
            ORDER BY starts_at ASC
            "#,
        )
        .bind(zone_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    // Access resolution

    /// Load a fresh point-in-time view of a zone's responsibility records
    pub async fn ownership_snapshot(&self, zone_id: Uuid) -> Result<OwnershipSnapshot> {
        let assignment = self.active_responsibility(zone_id).await?;

        let rows = sqlx::query_as::<_, DelegationRow>(
            r#"
            SELECT id, zone_id, from_agent, to_agent, starts_at, ends_at,
                   reason, active, created_by, created_at
            FROM delegations
            WHERE zone_id = ? AND active = 1
            "#,
        )
        .bind(zone_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let delegations = rows
            .into_iter()
            .map(Delegation::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(OwnershipSnapshot {
            assignment,
            delegations,
        })
    }

    /// Resolve the effective owner of a zone at `now`
    pub async fn resolve_owner(&self, zone_id: Uuid, now: DateTime<Utc>) -> Result<Option<Uuid>> {
        let snapshot = self.ownership_snapshot(zone_id).await?;
        Ok(snapshot.resolve_owner(now))
    }

    pub async fn can_manage(
        &self,
        principal_id: Uuid,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let principal = self.get_agent(principal_id).await?;
        let (ctx, zone_id) = self.item_ctx(item_id).await?;
        let owner = self.resolve_owner(zone_id, now).await?;
        Ok(resolver::can_manage(&principal, &ctx, owner))
    }

    pub async fn can_abort(
        &self,
        principal_id: Uuid,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let principal = self.get_agent(principal_id).await?;
        let (ctx, zone_id) = self.item_ctx(item_id).await?;
        let owner = self.resolve_owner(zone_id, now).await?;
        Ok(resolver::can_abort(&principal, &ctx, owner))
    }

    pub async fn can_create_sub_action(
        &self,
        principal_id: Uuid,
        parent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let principal = self.get_agent(principal_id).await?;
        let (ctx, zone_id) = self.item_ctx(parent_id).await?;
        let owner = self.resolve_owner(zone_id, now).await?;
        Ok(resolver::can_create_sub_action(&principal, &ctx, owner))
    }

    // Report operations

    pub async fn create_report(
        &self,
        zone_id: Uuid,
        title: &str,
        description: &str,
        author_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Report> {
        let author = self.get_agent(author_id).await?;
        let zone = self.get_zone(zone_id).await?;
        if !zone.active {
            return Err(AppError::Conflict(format!(
                "Zone {} is deactivated",
                zone.code
            )));
        }

        let owner = self.resolve_owner(zone_id, now).await?;
        if !author.is_acting_admin() && owner != Some(author_id) {
            return Err(AppError::Permission(format!(
                "Agent {} is not the effective owner of zone {}",
                author_id, zone.code
            )));
        }

        let report = Report::new(zone_id, title, description, author_id, now);

        sqlx::query(
            r#"
            INSERT INTO reports
                (id, zone_id, title, description, status, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(report.id.to_string())
        .bind(zone_id.to_string())
        .bind(&report.title)
        .bind(&report.description)
        .bind(report.status.as_str())
        .bind(author_id.to_string())
        .bind(report.created_at)
        .bind(report.updated_at)
        .execute(&self.pool)
        .await?;

        let _ = self.event_tx.send(StoreEvent::ReportCreated {
            report_id: report.id,
            zone_id,
            created_by: author_id,
        });

        Ok(report)
    }

    pub async fn get_report(&self, id: Uuid) -> Result<Report> {
        self.find_report(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Report {} not found", id)))
    }

    pub async fn list_reports_for_zone(&self, zone_id: Uuid) -> Result<Vec<Report>> {
        let rows = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, zone_id, title, description, status, created_by,
                   aborted_by, aborted_at, abort_reason, created_at, updated_at
            FROM reports
            WHERE zone_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(zone_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    // Work item operations

    pub async fn create_action(
        &self,
        report_id: Uuid,
        description: &str,
        author_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        self.create_report_item(report_id, WorkItemKind::Action, description, author_id, now)
            .await
    }

    pub async fn create_corrective_action(
        &self,
        report_id: Uuid,
        description: &str,
        author_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        self.create_report_item(
            report_id,
            WorkItemKind::CorrectiveAction,
            description,
            author_id,
            now,
        )
        .await
    }

    async fn create_report_item(
        &self,
        report_id: Uuid,
        kind: WorkItemKind,
        description: &str,
        author_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let author = self.get_agent(author_id).await?;
        let report = self.get_report(report_id).await?;

        let ctx = WorkItemCtx {
            kind: WorkItemKind::Report,
            status: report.status,
            created_by: report.created_by,
        };
        let owner = self.resolve_owner(report.zone_id, now).await?;
        if !resolver::can_manage(&author, &ctx, owner) {
            return Err(AppError::Permission(format!(
                "Agent {} may not add items to report {}",
                author_id, report_id
            )));
        }

        let item = match kind {
            WorkItemKind::CorrectiveAction => {
                WorkItem::corrective_action(report_id, description, author_id, now)
            }
            _ => WorkItem::action(report_id, description, author_id, now),
        };

        self.insert_work_item(&item).await?;

        let _ = self.event_tx.send(StoreEvent::WorkItemCreated {
            work_item_id: item.id,
            report_id,
            kind,
        });

        Ok(item)
    }

    /// Create a sub-action under an action or corrective action
    ///
    /// Does not recompute the parent: aggregation runs on child status
    /// changes, never on creation.
    pub async fn create_sub_action(
        &self,
        parent_id: Uuid,
        description: &str,
        author_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let author = self.get_agent(author_id).await?;
        let parent = self.get_work_item(parent_id).await?;
        if !parent.kind.owns_sub_actions() {
            return Err(AppError::Validation(format!(
                "Sub-actions can only be created under an action, not a {}",
                parent.kind.as_str()
            )));
        }
        let report = self.get_report(parent.report_id).await?;

        let ctx = WorkItemCtx {
            kind: parent.kind,
            status: parent.status,
            created_by: parent.created_by,
        };
        let owner = self.resolve_owner(report.zone_id, now).await?;
        if !resolver::can_create_sub_action(&author, &ctx, owner) {
            return Err(AppError::Permission(format!(
                "Agent {} may not add sub-actions under {}",
                author_id, parent_id
            )));
        }

        let item = WorkItem::sub_action(parent.report_id, parent_id, description, author_id, now);
        self.insert_work_item(&item).await?;

        let _ = self.event_tx.send(StoreEvent::WorkItemCreated {
            work_item_id: item.id,
            report_id: parent.report_id,
            kind: WorkItemKind::SubAction,
        });

        Ok(item)
    }

    pub async fn get_work_item(&self, id: Uuid) -> Result<WorkItem> {
        self.find_work_item(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Work item {} not found", id)))
    }

    pub async fn list_children(&self, parent_id: Uuid) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT id, report_id, parent_id, kind, description, status, created_by,
                   aborted_by, aborted_at, abort_reason, created_at, updated_at
            FROM work_items
            WHERE parent_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn list_work_items_for_report(&self, report_id: Uuid) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT id, report_id, parent_id, kind, description, status, created_by,
                   aborted_by, aborted_at, abort_reason, created_at, updated_at
            FROM work_items
            WHERE report_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(report_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Assert a sub-action's status and recompute its parent atomically
    pub async fn set_sub_action_status(
        &self,
        id: Uuid,
        status: WorkItemStatus,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkItem> {
        let principal = self.get_agent(principal_id).await?;
        let mut item = self.get_work_item(id).await?;
        if item.kind != WorkItemKind::SubAction {
            return Err(AppError::Validation(format!(
                "Status of a {} is derived, not asserted",
                item.kind.as_str()
            )));
        }
        let report = self.get_report(item.report_id).await?;

        let ctx = WorkItemCtx {
            kind: item.kind,
            status: item.status,
            created_by: item.created_by,
        };
        let owner = self.resolve_owner(report.zone_id, now).await?;
        if !resolver::can_manage(&principal, &ctx, owner) {
            return Err(AppError::Permission(format!(
                "Agent {} may not modify sub-action {}",
                principal_id, id
            )));
        }

        let parent_id = item
            .parent_id
            .ok_or_else(|| AppError::Internal(format!("Sub-action {} has no parent", id)))?;

        let mut tx = self.pool.begin().await?;

        // Re-read inside the transaction and guard the write on the status
        // just read, so a racing update cannot be silently overwritten.
        let stored: Option<String> =
            sqlx::query_scalar("SELECT status FROM work_items WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let stored =
            stored.ok_or_else(|| AppError::NotFound(format!("Work item {} not found", id)))?;
        item.status = parse_status(&stored)?;

        let old_status = item.status;
        item.set_status(status, now).map_err(AppError::Conflict)?;

        let affected =
            sqlx::query("UPDATE work_items SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(item.status.as_str())
                .bind(now)
                .bind(id.to_string())
                .bind(old_status.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        if affected == 0 {
            return Err(AppError::Conflict(format!(
                "Sub-action {} was modified concurrently",
                id
            )));
        }

        let parent_change = self.recompute_in_tx(&mut tx, parent_id, now).await?;

        tx.commit().await?;

        let _ = self.event_tx.send(StoreEvent::StatusChanged {
            item_id: id,
            old_status,
            new_status: item.status,
        });
        if let Some((old, new)) = parent_change {
            let _ = self.event_tx.send(StoreEvent::StatusChanged {
                item_id: parent_id,
                old_status: old,
                new_status: new,
            });
        }

        Ok(item)
    }

    /// Re-derive a parent's status from its sub-actions
    ///
    /// The only path by which a parent's status changes implicitly. Safe to
    /// call repeatedly; the derivation is idempotent over the child set.
    pub async fn recompute_parent_status(&self, parent_id: Uuid) -> Result<WorkItemStatus> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let change = self.recompute_in_tx(&mut tx, parent_id, now).await?;
        tx.commit().await?;

        match change {
            Some((old, new)) => {
                let _ = self.event_tx.send(StoreEvent::StatusChanged {
                    item_id: parent_id,
                    old_status: old,
                    new_status: new,
                });
                Ok(new)
            }
            None => {
                let parent = self.get_work_item(parent_id).await?;
                Ok(parent.status)
            }
        }
    }

    /// Runs the read-children/derive/write-parent sequence inside the
    /// caller's transaction. Returns the (old, new) pair when the stored
    /// status changed.
    async fn recompute_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        parent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<(WorkItemStatus, WorkItemStatus)>> {
        let row = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT id, report_id, parent_id, kind, description, status, created_by,
                   aborted_by, aborted_at, abort_reason, created_at, updated_at
            FROM work_items
            WHERE id = ?
            "#,
        )
        .bind(parent_id.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Work item {} not found", parent_id)))?;
        let parent: WorkItem = row.try_into()?;

        // An explicit abort overrides anything the children say
        if parent.status == WorkItemStatus::Aborted {
            return Ok(None);
        }

        let children: Vec<String> =
            sqlx::query_scalar("SELECT status FROM work_items WHERE parent_id = ?")
                .bind(parent_id.to_string())
                .fetch_all(&mut **tx)
                .await?;
        let statuses = children
            .iter()
            .map(|s| s.parse::<WorkItemStatus>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(AppError::Internal)?;

        let derived = derive_parent_status(&statuses);
        if derived == parent.status {
            return Ok(None);
        }

        sqlx::query("UPDATE work_items SET status = ?, updated_at = ? WHERE id = ?")
            .bind(derived.as_str())
            .bind(now)
            .bind(parent_id.to_string())
            .execute(&mut **tx)
            .await?;

        Ok(Some((parent.status, derived)))
    }

    /// Abort a report, action or corrective action
    ///
    /// The parent transitions to `Aborted` and every non-completed
    /// descendant is forced to `Canceled` in the same transaction; an abort
    /// either lands in full or not at all.
    pub async fn abort_work_item(
        &self,
        item_id: Uuid,
        actor_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(AppError::Validation(
                "An abort requires a reason".to_string(),
            ));
        }
        let actor = self.get_agent(actor_id).await?;
        let (ctx, zone_id) = self.item_ctx(item_id).await?;
        let owner = self.resolve_owner(zone_id, now).await?;
        if !resolver::can_abort(&actor, &ctx, owner) {
            return Err(AppError::Permission(format!(
                "Agent {} may not abort work item {}",
                actor_id, item_id
            )));
        }

        let mut tx = self.pool.begin().await?;

        // The abort and the cascade see one consistent snapshot; the terminal
        // gate is re-checked by the write itself so a racing abort or
        // completion cannot be overwritten.
        let canceled_children = if ctx.kind == WorkItemKind::Report {
            let aborted = sqlx::query(
                r#"
                UPDATE reports
                SET status = 'aborted', aborted_by = ?, aborted_at = ?, abort_reason = ?,
                    updated_at = ?
                WHERE id = ? AND status NOT IN ('completed', 'canceled', 'aborted')
                "#,
            )
            .bind(actor_id.to_string())
            .bind(now)
            .bind(reason)
            .bind(now)
            .bind(item_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if aborted == 0 {
                return Err(AppError::Conflict(format!(
                    "Report {} is already in a terminal state",
                    item_id
                )));
            }

            // Entire subtree: actions, corrective actions and sub-actions.
            // Already-aborted items are terminal and keep their own metadata.
            sqlx::query(
                r#"
                UPDATE work_items
                SET status = 'canceled', updated_at = ?
                WHERE report_id = ? AND status NOT IN ('completed', 'canceled', 'aborted')
                "#,
            )
            .bind(now)
            .bind(item_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            let aborted = sqlx::query(
                r#"
                UPDATE work_items
                SET status = 'aborted', aborted_by = ?, aborted_at = ?, abort_reason = ?,
                    updated_at = ?
                WHERE id = ? AND status NOT IN ('completed', 'canceled', 'aborted')
                "#,
            )
            .bind(actor_id.to_string())
            .bind(now)
            .bind(reason)
            .bind(now)
            .bind(item_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if aborted == 0 {
                return Err(AppError::Conflict(format!(
                    "Work item {} is already in a terminal state",
                    item_id
                )));
            }

            sqlx::query(
                r#"
                UPDATE work_items
                SET status = 'canceled', updated_at = ?
                WHERE parent_id = ? AND status NOT IN ('completed', 'canceled', 'aborted')
                "#,
            )
            .bind(now)
            .bind(item_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        tx.commit().await?;

        let _ = self.event_tx.send(StoreEvent::WorkItemAborted {
            item_id,
            aborted_by: actor_id,
            canceled_children,
        });

        Ok(())
    }

    // Internal helpers

    async fn insert_work_item(&self, item: &WorkItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO work_items
                (id, report_id, parent_id, kind, description, status, created_by,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.report_id.to_string())
        .bind(item.parent_id.map(|u| u.to_string()))
        .bind(item.kind.as_str())
        .bind(&item.description)
        .bind(item.status.as_str())
        .bind(item.created_by.to_string())
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_report(&self, id: Uuid) -> Result<Option<Report>> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, zone_id, title, description, status, created_by,
                   aborted_by, aborted_at, abort_reason, created_at, updated_at
            FROM reports
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    async fn find_work_item(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT id, report_id, parent_id, kind, description, status, created_by,
                   aborted_by, aborted_at, abort_reason, created_at, updated_at
            FROM work_items
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_into()).transpose()
    }

    /// Resolve any node of the work-item tree to its permission context and
    /// the zone of its owning report
    async fn item_ctx(&self, item_id: Uuid) -> Result<(WorkItemCtx, Uuid)> {
        if let Some(report) = self.find_report(item_id).await? {
            let ctx = WorkItemCtx {
                kind: WorkItemKind::Report,
                status: report.status,
                created_by: report.created_by,
            };
            return Ok((ctx, report.zone_id));
        }

        let item = self
            .find_work_item(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Work item {} not found", item_id)))?;
        let report = self.get_report(item.report_id).await?;
        let ctx = WorkItemCtx {
            kind: item.kind,
            status: item.status,
            created_by: item.created_by,
        };
        Ok((ctx, report.zone_id))
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    name: String,
    email: String,
    is_admin: bool,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = AppError;

    fn try_from(row: AgentRow) -> Result<Self> {
        Ok(Agent {
            id: parse_uuid(&row.id)?,
            name: row.name,
            email: row.email,
            is_admin: row.is_admin,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ZoneRow {
    id: String,
    name: String,
    code: String,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<ZoneRow> for Zone {
    type Error = AppError;

    fn try_from(row: ZoneRow) -> Result<Self> {
        Ok(Zone {
            id: parse_uuid(&row.id)?,
            name: row.name,
            code: row.code,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResponsibilityRow {
    id: String,
    agent_id: String,
    zone_id: String,
    assigned_at: DateTime<Utc>,
    active: bool,
}

impl TryFrom<ResponsibilityRow> for ResponsibilityAssignment {
    type Error = AppError;

    fn try_from(row: ResponsibilityRow) -> Result<Self> {
        Ok(ResponsibilityAssignment {
            id: parse_uuid(&row.id)?,
            agent_id: parse_uuid(&row.agent_id)?,
            zone_id: parse_uuid(&row.zone_id)?,
            assigned_at: row.assigned_at,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DelegationRow {
    id: String,
    zone_id: String,
    from_agent: String,
    to_agent: String,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    reason: String,
    active: bool,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<DelegationRow> for Delegation {
    type Error = AppError;

    fn try_from(row: DelegationRow) -> Result<Self> {
        Ok(Delegation {
            id: parse_uuid(&row.id)?,
            zone_id: parse_uuid(&row.zone_id)?,
            from_agent: parse_uuid(&row.from_agent)?,
            to_agent: parse_uuid(&row.to_agent)?,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            reason: row.reason,
            active: row.active,
            created_by: parse_uuid(&row.created_by)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    id: String,
    zone_id: String,
    title: String,
    description: String,
    status: String,
    created_by: String,
    aborted_by: Option<String>,
    aborted_at: Option<DateTime<Utc>>,
    abort_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReportRow> for Report {
    type Error = AppError;

    fn try_from(row: ReportRow) -> Result<Self> {
        Ok(Report {
            id: parse_uuid(&row.id)?,
            zone_id: parse_uuid(&row.zone_id)?,
            title: row.title,
            description: row.description,
            status: parse_status(&row.status)?,
            created_by: parse_uuid(&row.created_by)?,
            aborted_by: row.aborted_by.as_deref().map(parse_uuid).transpose()?,
            aborted_at: row.aborted_at,
            abort_reason: row.abort_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    report_id: String,
    parent_id: Option<String>,
    kind: String,
    description: String,
    status: String,
    created_by: String,
    aborted_by: Option<String>,
    aborted_at: Option<DateTime<Utc>>,
    abort_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = AppError;

    fn try_from(row: WorkItemRow) -> Result<Self> {
        Ok(WorkItem {
            id: parse_uuid(&row.id)?,
            report_id: parse_uuid(&row.report_id)?,
            parent_id: row.parent_id.as_deref().map(parse_uuid).transpose()?,
            kind: row
                .kind
                .parse()
                .map_err(|e| AppError::Internal(format!("Invalid kind: {}", e)))?,
            description: row.description,
            status: parse_status(&row.status)?,
            created_by: parse_uuid(&row.created_by)?,
            aborted_by: row.aborted_by.as_deref().map(parse_uuid).transpose()?,
            aborted_at: row.aborted_at,
            abort_reason: row.abort_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))
}

fn parse_status(s: &str) -> Result<WorkItemStatus> {
    s.parse()
        .map_err(|e| AppError::Internal(format!("Invalid status: {}", e)))
}
