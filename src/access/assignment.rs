//! Permanent responsibility assignments
//!
//! A zone has at most one active assignment at any moment. Assignments are
//! deactivated on reassignment or revocation, never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A permanent (agent, zone) responsibility record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsibilityAssignment {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub zone_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub active: bool,
}

impl ResponsibilityAssignment {
    pub fn new(agent_id: Uuid, zone_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            zone_id,
            assigned_at: now,
            active: true,
        }
    }

    /// Soft-revoke. Idempotent.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Whether this record makes `agent_id` the responsible party
    pub fn is_held_by(&self, agent_id: Uuid) -> bool {
        self.active && self.agent_id == agent_id
    }
}
