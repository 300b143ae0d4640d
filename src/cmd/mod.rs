//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module      | Commands handled |
//! |-------------|------------------|
//! | `serve`     | `Serve`          |
//! | `decompose` | `Decompose`      |
//! | `config`    | `Config`         |

pub mod config;
pub mod decompose;
pub mod serve;

pub use config::cmd_config;
pub use decompose::cmd_decompose;
pub use serve::cmd_serve;
