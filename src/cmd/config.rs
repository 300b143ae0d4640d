//! Configuration view and validation commands: `agent-factory config`.

use anyhow::{Result, bail};
use std::path::Path;

use agent_factory::factory_config::{FactoryToml, init_config};

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Agent Factory Configuration");
            println!("===========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No factory.toml found at {}", config_path.display());
                println!("Using defaults. Run 'agent-factory config init' to create one.");
            }
            println!();

            // Effective values, including environment overrides.
            let config = FactoryToml::resolve(config_path)?;
            print!("{}", config.to_toml_string()?);
            println!();
            println!(
                "GITHUB_TOKEN: {}",
                if config.github_token.is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No factory.toml found. Using defaults.");
            }

            let config = FactoryToml::resolve(config_path)?;
            let report = config.validate();

            if !report.warnings.is_empty() {
                println!("Configuration warnings:");
                for warning in &report.warnings {
                    println!("  - {}", warning);
                }
                println!();
            }
            if !report.is_ok() {
                println!("Configuration errors:");
                for error in &report.errors {
                    println!("  - {}", error);
                }
                println!();
                bail!("Configuration is invalid ({} error(s))", report.errors.len());
            }
            println!("Configuration is valid.");
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            init_config(config_path, force)?;

            println!("Created factory.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [budget] max_cost_usd, max_agents, max_runtime_sec");
            println!("  - [execution] adapter, agent_cmd, base_url");
            println!("  - [council] gated_kinds");
            println!();
        }
    }

    Ok(())
}
