// System
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// Third Party
use clap::Parser;

// Local
use crate::controller::ControllerSettings;
use crate::error::{Error, Result};
use crate::projector::TransferSpec;

/// Log verbosity accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Info,
    Debug,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(level: &str) -> Result<Self> {
        match level.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(Error::UnknownLogLevel(level.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        f.write_str(level)
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

/// Copy selected node labels onto the pods scheduled on each node.
#[derive(Parser, Debug)]
#[command(name = "node-label-transfer", version)]
pub struct Args {
    /// A label to transfer from the node to the pod. May be repeated.
    #[arg(short = 'l', long = "label", value_name = "KEY")]
    pub labels: Vec<String>,

    /// Log level. Can be 'error', 'info', or 'debug'.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Idle time between two reconciliation passes, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,

    /// Number of pods patched concurrently within one pass.
    #[arg(long, default_value_t = 1)]
    pub concurrency: usize,

    /// Give up waiting for the initial cache sync after this many seconds.
    #[arg(long)]
    pub sync_timeout_secs: Option<u64>,
}

/// Validated process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub transfer: TransferSpec,
    pub log_level: LogLevel,
    pub controller: ControllerSettings,
}

impl TryFrom<Args> for Config {
    type Error = Error;

    fn try_from(args: Args) -> Result<Self> {
        let log_level = args.log_level.parse()?;
        let transfer = TransferSpec::new(args.labels)?;
        if args.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "--concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Config {
            transfer,
            log_level,
            controller: ControllerSettings {
                interval: Duration::from_millis(args.interval_ms),
                concurrency: args.concurrency,
                sync_timeout: args.sync_timeout_secs.map(Duration::from_secs),
                ..Default::default()
            },
        })
    }
}
