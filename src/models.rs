//! Catalog data: zones and agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An organizational zone of safety responsibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
    /// Unique short code, e.g. "NORTH"
    pub code: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A principal who can own or be delegated a zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_acting_admin(&self) -> bool {
        self.active && self.is_admin
    }
}

/// Request to create a new zone
#[derive(Debug, Deserialize)]
pub struct CreateZoneRequest {
    pub name: String,
    pub code: String,
}

/// Request to register a new agent
#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// Request to create a delegation for a zone
#[derive(Debug, Deserialize)]
pub struct CreateDelegationRequest {
    pub zone_id: Uuid,
    pub from_agent: Uuid,
    pub to_agent: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub reason: String,
}
