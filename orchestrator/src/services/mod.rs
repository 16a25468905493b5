//! Service layer: job execution and notification dispatch.

pub mod job_executor;
pub mod notification_service;

pub use job_executor::{BackgroundJobExecutor, JobSession, JobStart, OperationOutcome};
pub use notification_service::NotificationDispatcher;
