//! Tracing subscriber setup.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::settings::LoggingConfig;

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Human readable output on stdout, plus JSON lines in `combined.log` (every
/// level) and `error.log` (errors only) when a log directory is configured.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { config.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (combined, errors) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let combined = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(open_append(&dir.join("combined.log"))?));
            let errors = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(open_append(&dir.join("error.log"))?))
                .with_filter(LevelFilter::ERROR);
            (Some(combined), Some(errors))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(combined)
        .with(errors)
        .try_init()?;
    Ok(())
}
