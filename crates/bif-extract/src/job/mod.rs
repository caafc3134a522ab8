//! Job records, their lifecycle and persistence

pub mod machine;
pub mod status;
pub mod store;

pub use machine::StatusMachine;
pub use status::JobStatus;
pub use store::{InMemoryJobStore, JobMetrics, JobRecord, JobStore, NewJob, StatusUpdate};
