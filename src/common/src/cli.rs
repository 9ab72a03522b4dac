use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by the binaries
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands that only inspect the configuration
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};

    /// Initialize logging from CLI flags, falling back to the configured filter
    pub fn init_logging(args: &CommonArgs, config: &Configuration) {
        let filter = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            config.logging.filter.as_str()
        };
        crate::logging::init_logging(filter);
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("promsearch configuration:");
            println!("=========================");
            println!("Timezone: {}", config.promql.timezone);
            println!("Max query points: {}", config.promql.max_query_points);
            println!("Default step: {:?}", config.promql.default_step);
            println!("Lookback delta: {:?}", config.promql.lookback_delta);
            println!("Log filter: {}", config.logging.filter);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        config
            .promql
            .tz()
            .map_err(|err| anyhow::anyhow!("Invalid timezone {:?}: {err}", config.promql.timezone))?;

        if config.promql.max_query_points < 1 {
            anyhow::bail!("max_query_points must be at least 1");
        }

        if config.promql.default_step.is_zero() {
            anyhow::bail!("default_step must not be zero");
        }

        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle the configuration-only commands
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Validate => validate_config(config),
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(())
            }
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
