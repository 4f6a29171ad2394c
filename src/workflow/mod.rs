//! Work-item graph and status machine
//!
//! A report owns actions and corrective actions; each of those owns
//! sub-actions. Sub-action statuses are asserted directly; parent statuses
//! are derived bottom-up, except for an explicit abort which overrides
//! anything the children say.

pub mod item;
pub mod status;

pub use item::{Report, WorkItem, WorkItemKind, WorkItemStatus};
pub use status::{derive_parent_status, StatusCounts};
