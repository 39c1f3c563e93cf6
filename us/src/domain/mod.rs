//! Domain types for the upload scheduler
//!
//! Core value types: Priority, JobStatus, Payload, JobRecord.
//! The scheduler owns every JobRecord; callers only ever see JobSnapshot copies.

mod job;
mod priority;

pub use job::{JobId, JobRecord, JobSnapshot, JobStatus, Payload, Progress, estimate_remaining, new_job_id};
pub use priority::Priority;
