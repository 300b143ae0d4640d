//! HTTP surface and persistence for the Agent Factory.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘   SSE    │         │                                        │
//!                       │         ├─ decomposition  (spec → waves)         │
//!                       │         ├─ router         (budget gate → adapter)│
//!                       │         ├─ drafts         (plan → gate → effect) │
//!                       │         ├─ runs           (interrupt / resume)   │
//!                       │         └─ streaming      (status SSE)           │
//!                       │                                                  │
//!                       │  db.rs  (SQLite via DbHandle)                    │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Stored records: `Project`, `BuildRecord`, `Adapter`, ...    |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//!
//! ## Typical Request Flow (execute a build)
//!
//! 1. `POST /api/builds` decomposes the spec and stores waves and workstreams.
//! 2. `POST /api/builds/{id}/execute` with an `x-user-id` header validates
//!    the body against the allow-list and attaches the configured ceilings.
//! 3. The router estimates cost from the parallelization stats; a violation
//!    returns `BUDGET_EXCEEDED` without touching the adapter.
//! 4. The local adapter runs the waves in the background while
//!    `GET /api/builds/{id}/stream` reports status until a terminal state.

pub mod api;
pub mod db;
pub mod models;
pub mod server;
