//! Pre-run snapshot and rollback management.
//!
//! A snapshot is a sealed, checksummed tar.gz archive plus a JSON metadata
//! record, captured before any safety-guarded run and again before a
//! rollback. Restoration is automatic for configuration files and
//! service-enablement state (the subsystems the safety guard can verify
//! post-restore) and reports manual follow-up steps for packages,
//! installation files, and user data.
//!
//! # Snapshot Process
//!
//! 1. Stage configuration and user-data paths (structure preserved)
//! 2. Capture package selections and enabled-service lists
//! 3. Seal the staging tree into a gzip tar archive
//! 4. Checksum (SHA-256) and verify the archive immediately
//! 5. Write the metadata record and delete the staging tree
//! 6. Delete snapshots beyond the retention count, oldest first

pub mod manager;

pub use manager::{
    BackupManager, BackupSources, RestoreAction, RestoreReport, SnapshotContents, SnapshotPoint,
    SubsystemRestore,
};
