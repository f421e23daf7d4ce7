pub mod build;
pub mod cli;
pub mod config;
pub mod container;
pub mod debcache;
pub mod distro;
pub mod error;
pub mod executor;
pub mod image;
pub mod lint;
pub mod privilege;
pub mod runlog;
pub mod script;
pub mod session;
pub mod source;

pub use error::MonciError;

use anyhow::{Context, Result};
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(FmtSubscriber::builder().with_max_level(filter).finish())
        .context("failed to set global default tracing subscriber")
}
