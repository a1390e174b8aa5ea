//! Batch planning.
//!
//! A planner decides what one orchestrator run works on, creating or
//! resuming ledger records as needed.
//!
//! - [`master::MasterPlanner`]: one batch per run; new, retried or resumed
//! - [`slave::SlavePlanner`]: nothing, a single batch, or a consolidated group
//! - [`resize`]: peak-hour batch size cap with a daily ignore window

pub mod master;
pub mod resize;
pub mod slave;

pub use master::{MasterPlan, MasterPlanPath, MasterPlanner};
pub use resize::{resize, IgnoreWindow};
pub use slave::{should_consolidate, SlavePlan, SlavePlanner};
