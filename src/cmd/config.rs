//! Configuration view and validation commands — `anvil config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use anvil::config::AnvilConfig;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = AnvilConfig::config_path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = AnvilConfig::load(project_dir)?;
            println!();
            println!("Anvil Configuration");
            println!("===================");
            println!();
            if config_path.exists() {
                println!("File: {}", config_path.display());
            } else {
                println!("File: (none, using defaults)");
            }
            println!();
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(ConfigCommands::Validate) => {
            let config = AnvilConfig::load(project_dir)?;
            match config.validate() {
                Ok(warnings) if warnings.is_empty() => {
                    println!("Configuration is valid.");
                }
                Ok(warnings) => {
                    println!("Configuration is valid, with warnings:");
                    for warning in warnings {
                        println!("  - {}", warning);
                    }
                }
                Err(e) => {
                    anyhow::bail!("Configuration is invalid: {}", e);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                anyhow::bail!("{} already exists", config_path.display());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(&config_path, AnvilConfig::default_toml())
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}
