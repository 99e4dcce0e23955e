//! CLI argument definitions for scipass-daemon.

use std::path::PathBuf;

use clap::Parser;

/// SciPass control plane daemon.
///
/// Balances monitored prefixes across sensor groups and keeps the
/// forwarding state of every configured switch in line with it.
#[derive(Parser, Debug)]
#[command(name = "scipass-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to scipass.toml configuration file.
    #[arg(short, long, default_value = "/etc/scipass/scipass.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,
}

impl DaemonCli {
    /// Applies command-line overrides to the general section.
    pub fn apply_overrides(&self, general: &mut scipass_core::config::GeneralConfig) {
        if let Some(level) = &self.log_level {
            general.log_level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            general.log_format.clone_from(format);
        }
        if let Some(pid_file) = &self.pid_file {
            general.pid_file.clone_from(pid_file);
        }
    }
}
