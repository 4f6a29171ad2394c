//! Time-boxed delegations
//!
//! A delegation temporarily hands a zone's responsibility from its current
//! owner to another agent over a half-open `[starts_at, ends_at)` window.
//! The administrative flag (`active`) and the time window are independent:
//! a revoked delegation never takes effect again, while an administratively
//! active one is only in effect inside its window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a delegation, derived from flag + time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationState {
    /// Administratively active, window not yet open
    Scheduled,
    /// Administratively active and inside the window
    InEffect,
    /// Window has closed; the delegation lapsed naturally
    Lapsed,
    /// Ended early by an administrator
    Revoked,
}

impl DelegationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationState::Scheduled => "scheduled",
            DelegationState::InEffect => "in_effect",
            DelegationState::Lapsed => "lapsed",
            DelegationState::Revoked => "revoked",
        }
    }
}

/// A temporary hand-over of zone responsibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub from_agent: Uuid,
    pub to_agent: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub reason: String,
    pub active: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Delegation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        zone_id: Uuid,
        from_agent: Uuid,
        to_agent: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        reason: impl Into<String>,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            zone_id,
            from_agent,
            to_agent,
            starts_at,
            ends_at,
            reason: reason.into(),
            active: true,
            created_by,
            created_at: now,
        }
    }

    /// Validate a delegation window at creation time
    pub fn validate_interval(
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if starts_at >= ends_at {
            return Err(format!(
                "delegation must end after it starts ({} >= {})",
                starts_at, ends_at
            ));
        }
        if starts_at < now {
            return Err("delegation must not start in the past".to_string());
        }
        Ok(())
    }

    /// Derive the lifecycle state at `now`
    pub fn state_at(&self, now: DateTime<Utc>) -> DelegationState {
        if !self.active {
            DelegationState::Revoked
        } else if now >= self.ends_at {
            DelegationState::Lapsed
        } else if now < self.starts_at {
            DelegationState::Scheduled
        } else {
            DelegationState::InEffect
        }
    }

    /// Whether this delegation currently hands ownership to `to_agent`
    pub fn is_in_effect(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == DelegationState::InEffect
    }

    /// Whether the dates/reason may still be edited
    pub fn is_editable(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.state_at(now),
            DelegationState::Scheduled | DelegationState::InEffect
        )
    }

    /// Half-open interval overlap against another window
    pub fn overlaps(&self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> bool {
        self.starts_at < ends_at && starts_at < self.ends_at
    }

    /// End early. Idempotent.
    pub fn revoke(&mut self) {
        self.active = false;
    }
}
