// File: orchestrator/src/scheduler/mod.rs
//! Facade over the whole orchestrator: the CLI and the installed timers both
//! enter through here, and all SchedulerState mutation happens here.

pub mod facade;
pub mod state;

pub use facade::{MaintenanceReport, ProfileStatus, SchedulerFacade};
pub use state::{SchedulerState, StateStore};
