//! Command-line interface
//!
//! Every option may appear at most once; positional arguments are rejected.
//! `--test-config` and `--runtime-control` are mutually exclusive.

use std::path::PathBuf;

use clap::Parser;

use ipcservice_core::ConfigOverrides;

/// IPC service daemon - echo service over Unix domain sockets
#[derive(Parser, Debug)]
#[command(name = "ipcserviced")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path [default: $XDG_CONFIG_HOME/ipcservice/ipcserviced.toml]
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Send a runtime control option (status, shutdown, ping) to the running daemon
    #[arg(
        short = 'R',
        long,
        value_name = "OPTION",
        conflicts_with = "test_config"
    )]
    pub runtime_control: Option<String>,

    /// Validate the configuration and exit
    #[arg(short = 'T', long)]
    pub test_config: bool,

    /// Stay in the foreground instead of detaching
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Root directory holding the service sockets
    #[arg(long, value_name = "DIR")]
    pub root_dir: Option<PathBuf>,

    /// Service name to serve or to control
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,

    /// Connect timeout for runtime control, in milliseconds
    #[arg(long, value_name = "MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Cli {
    /// Configuration overrides given on the command line
    pub fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref root) = self.root_dir {
            overrides = overrides.with_root_dir(root.clone());
        }
        if let Some(ref name) = self.name {
            overrides = overrides.with_service_name(name.clone());
        }
        if let Some(ms) = self.connect_timeout_ms {
            overrides = overrides.with_connect_timeout_ms(ms);
        }
        if let Some(ref level) = self.log_level {
            overrides = overrides.with_log_level(level.clone());
        }
        overrides
    }
}
