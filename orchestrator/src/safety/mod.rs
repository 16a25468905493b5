// File: orchestrator/src/safety/mod.rs
//! Safety envelope around a maintenance run.
//!
//! Every run goes through the same phase sequence: pre-run integrity checks,
//! a rollback snapshot, the operations themselves, and post-run verification.
//! A post-run failure restores the snapshot; a failed restore captures an
//! emergency snapshot and raises a CRITICAL alert.

pub mod guard;
pub mod integrity;

pub use guard::{GuardOutcome, GuardPhase, SafetyGuard};
pub use integrity::IntegrityChecker;
