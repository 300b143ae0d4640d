//! Execution routing behind a budget gate.
//!
//! An [`ExecutionRequest`] is estimated from the decomposition's
//! parallelization stats, checked against its [`BudgetCeilings`], and only
//! then handed to an [`ExecutionAdapter`]. Every outcome is reported as an
//! [`ExecutionEnvelope`].

pub mod adapter;
pub mod budget;
pub mod dispatch;
pub mod local;
pub mod request;

pub use adapter::{AdapterResponse, ExecutionAdapter, HttpExecutionAdapter};
pub use budget::{BudgetCeilings, CostModel, ExecutionEstimate, check_budget};
pub use dispatch::{ExecutionEnvelope, ExecutionRouter, ExecutionState};
pub use local::{BuildProgressSink, LocalExecutionAdapter};
pub use request::{ALLOWED_FIELDS, ExecutionBody, ExecutionRequest, parse_execution_body};
