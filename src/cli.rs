// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

use crate::config::DEFAULT_CONFIG_FILE;

/// Command-line arguments for `dagflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagflow",
    version,
    about = "Run dependency-ordered task steps on a worker node.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// Node name; overrides `[node].name`.
    #[arg(long, value_name = "NAME")]
    pub node_name: Option<String>,

    /// Tasks run at once; overrides `[node].pool_size`.
    #[arg(long, value_name = "N")]
    pub pool_size: Option<usize>,

    /// Message broker URL (`inmemory://`, `amqp://...`); overrides
    /// `[node].broker_url`.
    #[arg(long, value_name = "URL")]
    pub broker_url: Option<String>,

    /// Submit the configured tasks, wait until all of them finish, then exit.
    #[arg(long)]
    pub once: bool,

    /// Parse + validate, print each task's step graph, run nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_optional() {
        let args = CliArgs::try_parse_from(["dagflow"]).unwrap();
        assert_eq!(args.config, "Dagflow.toml");
        assert!(args.node_name.is_none() && args.pool_size.is_none());

        let args = CliArgs::try_parse_from([
            "dagflow",
            "--node-name",
            "n2",
            "--pool-size",
            "4",
            "--once",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.node_name.as_deref(), Some("n2"));
        assert_eq!(args.pool_size, Some(4));
        assert!(args.once);
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }
}
