//! Zone responsibility and delegation layer
//!
//! Permanent zone-to-agent assignments, time-boxed delegations between
//! agents, and the pure resolver that derives the effective owner of a
//! zone at a given instant.

pub mod assignment;
pub mod delegation;
pub mod resolver;

pub use assignment::ResponsibilityAssignment;
pub use delegation::{Delegation, DelegationState};
pub use resolver::{OwnershipSnapshot, WorkItemCtx};
