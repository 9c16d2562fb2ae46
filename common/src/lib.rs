//! Engine of `objsync`: object stores, the sorted differ, transfers and the worker pool.
//!
//! A run lists both endpoints in key order, classifies every key into a [`object::WorkItem`]
//! and hands the items to workers over a bounded queue. [`run`] hosts a binary's async entry
//! point inside a tokio runtime with logging and progress reporting set up.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

pub mod checksum;
pub mod config;
pub mod copy;
pub mod differ;
pub mod download;
pub mod filter;
pub mod listing;
pub mod object;
pub mod progress;
pub mod retry;
pub mod stats;
pub mod store;
pub mod sync;
pub mod version;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, SyncConfig};
pub use stats::{RunContext, Stat, Stats};

pub use progress::ProgressType;

/// Default delay between text progress reports.
pub const DEFAULT_PROGRESS_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// Default redraw interval of the progress bar.
pub const DEFAULT_BAR_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable duration, e.g. "500ms" or "1min"
    pub delay: Option<String>,
}

impl ProgressSettings {
    /// The explicit delay, or the default of the resolved progress type.
    pub fn delay(&self) -> anyhow::Result<std::time::Duration> {
        match &self.delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid progress delay {delay:?}: {err}")),
            None => match self.progress_type.resolve() {
                ProgressType::ProgressBar => Ok(DEFAULT_BAR_DELAY),
                _ => Ok(DEFAULT_PROGRESS_DELAY),
            },
        }
    }
}

fn log_filter(output: &OutputConfig) -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        return EnvFilter::from_default_env();
    }
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    EnvFilter::new(level)
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// Run `func` on a fresh runtime, returning `None` when it failed.
///
/// Logs go to stderr at the level picked by `output` unless `RUST_LOG` is set. When
/// `progress` is given, the counters in `stats` are shown as a bar or printed periodically
/// until `func` finishes. Errors are printed with their whole chain unless `output.quiet` is set.
pub fn run<Fut, Summary>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    stats: Arc<Stats>,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(&output))
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set up logging: {err}");
    }
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(err) => {
            if !output.quiet {
                eprintln!("failed to start the async runtime: {err}");
            }
            return None;
        }
    };
    let res = runtime.block_on(async move {
        let printer = match progress {
            Some(settings) => Some(progress::spawn(
                settings.progress_type,
                stats,
                settings.delay()?,
            )),
            None => None,
        };
        let res = func().await;
        if let Some(printer) = printer {
            printer.abort();
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(err) => {
            if !output.quiet {
                eprintln!("{err:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_delay_parses_human_durations() -> anyhow::Result<()> {
        let settings = ProgressSettings {
            delay: Some("250ms".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.delay()?, std::time::Duration::from_millis(250));
        let text = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            delay: None,
        };
        assert_eq!(text.delay()?, DEFAULT_PROGRESS_DELAY);
        let bar = ProgressSettings {
            progress_type: ProgressType::ProgressBar,
            delay: None,
        };
        assert_eq!(bar.delay()?, DEFAULT_BAR_DELAY);
        let bad = ProgressSettings {
            delay: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(bad.delay().is_err());
        Ok(())
    }
}
