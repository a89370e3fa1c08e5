//! Command-line interface for the rinit supervisor.
use clap::Parser;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

use crate::supervisor::Options;

/// Wrapper around `LevelFilter` so clap can parse log level names.
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(pub LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let level = match value.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            other => return Err(format!("invalid log level '{other}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for the supervisor binary.
#[derive(Parser)]
#[command(name = "rinit", version, author)]
#[command(about = "A process-1 init and service supervisor", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,

    /// Run in system mode (process 1 semantics, system paths). Requires root.
    #[arg(long = "sys")]
    pub sys: bool,

    /// Reload automatically when configuration files change.
    #[arg(long)]
    pub autoreload: bool,

    /// Kernel-style arguments: `rescue`, `single` (or `S`), or a runlevel
    /// digit overriding the configured default.
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

/// Parses the process arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}

impl Cli {
    /// Folds the kernel-style trailing arguments into supervisor options.
    pub fn options(&self) -> Options {
        let mut options = Options {
            autoreload: self.autoreload,
            ..Options::default()
        };

        for arg in &self.args {
            match arg.as_str() {
                "rescue" | "recover" => options.rescue = true,
                "single" | "s" | "S" => options.single = true,
                other => {
                    // A lone digit is a runlevel override; 6 stays reserved.
                    if let Ok(level) = other.parse::<u8>() {
                        if (1..=9).contains(&level) && level != 6 {
                            options.runlevel = Some(level);
                        }
                    }
                }
            }
        }
        options
    }
}
