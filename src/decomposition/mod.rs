//! Build decomposition for the Agent Factory.
//!
//! A free-text build spec is turned into workstreams that are grouped into
//! dependency waves. Workstreams in the same wave have no dependencies among
//! themselves and never own the same file, so a wave can run concurrently.
//!
//! - **Parsing**: `<workstreams>` JSON blocks or markdown `##` sections
//! - **Layering**: topological wave assignment with ownership serialization
//! - **Validation**: structural checks before anything is executed
//! - **Analysis**: parallelization statistics for previews and estimates
//!
//! ## Example
//!
//! ```no_run
//! use agent_factory::decomposition::{BuildSpec, analyze, decompose, validate_decomposition};
//!
//! let spec = BuildSpec::new("## Schema\n- Owns: db.sql\n\n## API\n- Depends on: schema\n");
//! let decomposition = decompose(&spec).unwrap();
//! assert!(validate_decomposition(&decomposition).is_empty());
//! println!("{} waves", analyze(&decomposition).total_waves);
//! ```

mod analyzer;
mod decomposer;
mod graph;
mod parser;
mod types;
mod validator;

pub use analyzer::{ParallelizationStats, analyze};
pub use decomposer::{decompose, infer_agent};
pub use graph::{DependencyGraph, NodeIndex};
pub use parser::{RawWorkstream, parse_workstreams, slugify};
pub use types::{BuildSpec, Decomposition, Wave, Workstream, WorkstreamStatus};
pub use validator::validate_decomposition;
