//! Command-line interface handling for the gateway.
//!
//! This module provides command-line argument parsing using the `clap`
//! crate. Every option overrides the corresponding configuration file value.

use clap::{value_parser, Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for bind address
    pub bind_address: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for the number of runtime worker threads
    pub workers: Option<usize>,
}

impl CliArgs {
    fn command() -> Command {
        Command::new("Game Gateway")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Connection, session and protocol gateway for game clients")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Bind address (e.g., 127.0.0.1:8080)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("workers")
                    .short('w')
                    .long("workers")
                    .value_name("COUNT")
                    .help("Runtime worker threads (0 uses one per CPU core)")
                    .value_parser(value_parser!(usize)),
            )
    }

    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    /// Parses an explicit argument list.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&Self::command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            workers: matches.get_one::<usize>("workers").copied(),
        }
    }
}
