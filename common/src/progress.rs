//! Progress reporting: an animated bar on terminals, periodic text reports otherwise.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use crate::stats::Stats;

/// How progress is shown while a run is going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressType {
    /// Bar when stderr is a terminal, text updates otherwise
    #[default]
    Auto,
    ProgressBar,
    TextUpdates,
}

impl ProgressType {
    /// Pick the concrete type for `Auto` based on stderr.
    pub fn resolve(self) -> Self {
        match self {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        }
    }
}

impl std::str::FromStr for ProgressType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "auto" => Ok(ProgressType::Auto),
            "progressbar" | "bar" => Ok(ProgressType::ProgressBar),
            "textupdates" | "text" => Ok(ProgressType::TextUpdates),
            _ => Err(format!(
                "unknown progress type {value:?}, expected Auto, ProgressBar or TextUpdates"
            )),
        }
    }
}

pub struct ProgressPrinter<'a> {
    stats: &'a Stats,
    last_handled: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(stats: &'a Stats) -> Self {
        Self {
            stats,
            last_handled: stats.handled.get(),
            last_bytes: stats.copied_bytes.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let total_duration_secs = self.stats.elapsed().as_secs_f64().max(f64::EPSILON);
        let curr_duration_secs = (time_now - self.last_update)
            .as_secs_f64()
            .max(f64::EPSILON);
        let handled = self.stats.handled.get();
        let total = self.stats.total.get();
        let average_ops_rate = handled as f64 / total_duration_secs;
        let current_ops_rate =
            handled.saturating_sub(self.last_handled) as f64 / curr_duration_secs;
        let bytes = self.stats.copied_bytes.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = bytes.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        // update self
        self.last_handled = handled;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            OBJECTS:\n\
            handled: {:>10} / {}\n\
            average: {:>10.2} items/s\n\
            current: {:>10.2} items/s\n\
            -----------------------\n\
            COPIED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            objects: {:>10}\n\
            -----------------------\n\
            checked: {:>10} ({})\n\
            deleted: {:>10}\n\
            skipped: {:>10}\n\
            failed:  {:>10}",
            handled,
            total,
            average_ops_rate,
            current_ops_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.stats.copied.get(),
            self.stats.checked.get(),
            bytesize::ByteSize(self.stats.checked_bytes.get()),
            self.stats.deleted.get(),
            self.stats.skipped.get(),
            self.stats.failed.get(),
        )
    }
}

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} objects {msg}";

/// One-line status shown next to the bar.
fn bar_message(stats: &Stats) -> String {
    let elapsed = stats.elapsed().as_secs_f64().max(f64::EPSILON);
    let bytes = stats.copied_bytes.get();
    format!(
        "copied {} ({}, {}/s) checked {} deleted {} skipped {} failed {}",
        stats.copied.get(),
        bytesize::ByteSize(bytes),
        bytesize::ByteSize((bytes as f64 / elapsed) as u64),
        stats.checked.get(),
        stats.deleted.get(),
        stats.skipped.get(),
        stats.failed.get(),
    )
}

fn spawn_bar(stats: Arc<Stats>, delay: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = indicatif::ProgressBar::new(stats.total.get());
        bar.set_style(
            indicatif::ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        loop {
            // total keeps growing while the differ runs
            bar.set_length(stats.total.get());
            bar.set_position(stats.handled.get());
            bar.set_message(bar_message(&stats));
            tokio::time::sleep(delay).await;
        }
    })
}

fn spawn_printer(stats: Arc<Stats>, delay: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut printer = ProgressPrinter::new(&stats);
        loop {
            tokio::time::sleep(delay).await;
            eprintln!("{}", printer.print());
        }
    })
}

/// Show progress of `stats` every `delay` until the returned handle is aborted.
pub fn spawn(
    progress_type: ProgressType,
    stats: Arc<Stats>,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    match progress_type.resolve() {
        ProgressType::ProgressBar => spawn_bar(stats, delay),
        _ => spawn_printer(stats, delay),
    }
}
