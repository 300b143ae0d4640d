//! Adapter-host runs with a human approval interrupt and an ordered,
//! redacted event log.

pub mod models;
pub mod service;

pub use models::{Run, RunEvent, RunEventType, RunStatus, now_ms};
pub use service::{CreateRunRequest, CreateRunResponse, ResumeRequest, RunService, approval_interrupt};
