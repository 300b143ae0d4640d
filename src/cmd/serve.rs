//! HTTP server command: `agent-factory serve`.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use tracing::warn;

use agent_factory::factory::server::start_server;
use agent_factory::factory_config::FactoryToml;

pub async fn cmd_serve(
    config_path: &Path,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let mut config = FactoryToml::resolve(config_path)?;

    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    if dev {
        config.server.dev = true;
    }

    let report = config.validate();
    for warning in &report.warnings {
        warn!(config = %config_path.display(), "{}", warning);
    }
    if !report.is_ok() {
        for error in &report.errors {
            eprintln!("  - {}", error);
        }
        bail!(
            "Invalid configuration in {} ({} error(s))",
            config_path.display(),
            report.errors.len()
        );
    }

    start_server(config).await
}
