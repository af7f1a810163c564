//! Tracing setup for the veil binaries.
//!
//! [`init`] wires a non-blocking rolling file sink (plus an optional
//! stderr mirror) into the global subscriber and hands back a
//! [`Telemetry`] guard. The guard owns the background writer: drop it
//! and buffered log lines are lost, so keep it alive for the life of
//! the process.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Handle returned by [`init`]; flushes the log writer on drop.
#[must_use = "dropping Telemetry stops the background log writer"]
pub struct Telemetry {
    _guard: WorkerGuard,
    log_dir: PathBuf,
}

impl Telemetry {
    /// Directory the daily `veil.log` files are written to.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Knobs for [`init`].
#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    /// Log directory. Falls back to `$VEIL_LOG_DIR`, then to
    /// `~/.local/share/veil/logs`.
    pub directory: Option<PathBuf>,
    /// Mirror events to stderr for interactive runs.
    pub stderr: bool,
    /// Emit JSON lines instead of plain text.
    pub json: bool,
    /// Filter applied when `RUST_LOG` is unset; `None` means `info`.
    pub default_filter: Option<String>,
}

/// Install the global `tracing` subscriber.
///
/// Fails if a subscriber is already set, so call it once from the
/// binary entry point and thread the returned guard outward.
pub fn init(options: TelemetryOptions) -> anyhow::Result<Telemetry> {
    let log_dir = options
        .directory
        .or_else(|| std::env::var_os("VEIL_LOG_DIR").map(PathBuf::from))
        .unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let (file_writer, guard) = tracing_appender::non_blocking(rolling::daily(&log_dir, "veil.log"));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(options.default_filter.as_deref().unwrap_or("info"))
    });
    let base = tracing_subscriber::registry().with(filter);

    let installed = if options.json {
        base.with(fmt::layer().json().with_writer(file_writer))
            .with(options.stderr.then(|| fmt::layer().json().with_writer(io::stderr)))
            .try_init()
    } else {
        base.with(fmt::layer().with_ansi(false).with_writer(file_writer))
            .with(options.stderr.then(|| fmt::layer().with_writer(io::stderr)))
            .try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;

    Ok(Telemetry {
        _guard: guard,
        log_dir,
    })
}

fn default_log_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/veil/logs"),
        None => PathBuf::from("veil-logs"),
    }
}
