//! Wave-by-wave execution of a decomposed build.
//!
//! The [`WaveExecutor`] owns workstream status transitions during a run and
//! reports them through a [`WorkstreamStatusSink`]. Agents are launched by a
//! [`WorkstreamRunner`]; [`ProcessWorkstreamRunner`] spawns the configured
//! agent CLI once per workstream.

mod runner;
mod wave_executor;

pub use runner::{ProcessWorkstreamRunner, WorkstreamRunner};
pub use wave_executor::{
    NoopStatusSink, WaveExecutor, WaveRunSummary, WorkstreamResult, WorkstreamStatusSink,
};
