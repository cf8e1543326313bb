//! Configuration view and validation commands (`scriptorium config`).

use anyhow::Result;
use scriptorium::config::{CONFIG_FILE_NAME, Config, ScriptoriumToml};
use std::path::{Path, PathBuf};

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            match config.source {
                Some(ref path) => println!("# Config file: {}", path.display()),
                None => println!("# No {} found, using defaults", CONFIG_FILE_NAME),
            }
            println!("# Effective values (with env overrides):");
            println!();
            print!("{}", config.toml.to_toml_string()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => cmd_config_init(config.source.as_deref())?,
    }

    Ok(())
}

/// Write a default config to `path` (or `./scriptorium.toml`) unless one exists.
pub fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    if path.exists() {
        println!("{} already exists at {}", CONFIG_FILE_NAME, path.display());
        println!("Delete it first if you want to recreate it.");
        return Ok(());
    }

    ScriptoriumToml::default().save(&path)?;

    println!("Created {}", path.display());
    println!();
    println!("You can now customize:");
    println!("  - [llm] command, model, timeout_secs");
    println!("  - [[tournament.generators]] id, temperature, style");
    println!("  - [compliance] threshold, forbidden_words");
    println!("  - [jury] pass_threshold and [[jury.personas]]");
    println!();
    Ok(())
}
