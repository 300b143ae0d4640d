pub mod decomposition;
pub mod drafts;
pub mod errors;
pub mod execution;
pub mod factory;
pub mod factory_config;
pub mod redaction;
pub mod router;
pub mod runs;
pub mod streaming;
