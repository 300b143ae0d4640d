//! Server-sent status streams for builds and runs.

pub mod frame;
pub mod manager;
pub mod sources;

pub use frame::SseFrame;
pub use manager::{
    StatusSource, StreamKey, StreamKind, StreamLimits, StreamManager, StreamSubscription,
    TERMINAL_STATES, is_terminal_state,
};
pub use sources::{BuildStatusSource, RunStatusSource};
