use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use common::{RunContext, Stat, Stats, SyncConfig};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "objsync",
    version,
    about = "Sync objects between two storage endpoints - rsync for object storage",
    long_about = "`objsync` lists both endpoints in key order, copies what is missing or outdated at the \
destination and optionally deletes or verifies. Large objects are copied with multipart upload.

EXAMPLES:
    # Mirror a directory, removing destination-only objects
    objsync --delete-dst --summary /data/src/ file:///data/dst/

    # Spread the work over two more hosts
    objsync --worker node1,alice@node2:2222 --threads 20 /shared/src/ /shared/dst/"
)]
struct Args {
    // Sync options
    /// Copy objects whose source is newer than the destination
    #[arg(short = 'u', long, help_heading = "Sync options")]
    update: bool,

    /// Always copy objects that exist on both sides
    #[arg(short = 'f', long, help_heading = "Sync options")]
    force_update: bool,

    /// Propagate owner, group and mode
    #[arg(long, help_heading = "Sync options")]
    perms: bool,

    /// Sync directory entries too
    #[arg(long, help_heading = "Sync options")]
    dirs: bool,

    /// Delete objects from the source once they are present at the destination
    #[arg(long, help_heading = "Sync options")]
    delete_src: bool,

    /// Delete destination objects missing from the source
    #[arg(long, help_heading = "Sync options")]
    delete_dst: bool,

    /// Compare the contents of every object present on both sides
    #[arg(long, help_heading = "Sync options")]
    check_all: bool,

    /// Verify the contents of every copied object
    #[arg(long, help_heading = "Sync options")]
    check_new: bool,

    /// Only log what would be done
    #[arg(long, help_heading = "Sync options")]
    dry: bool,

    // Filtering
    /// First key to sync
    #[arg(long, value_name = "KEY", help_heading = "Filtering")]
    start: Option<String>,

    /// Last key to sync (inclusive)
    #[arg(long, value_name = "KEY", help_heading = "Filtering")]
    end: Option<String>,

    /// Skip keys matching this regular expression (can be specified multiple times)
    ///
    /// Excludes win over includes.
    #[arg(long, value_name = "REGEX", action = clap::ArgAction::Append, help_heading = "Filtering")]
    exclude: Vec<String>,

    /// Only sync keys matching one of these regular expressions (can be specified multiple times)
    #[arg(long, value_name = "REGEX", action = clap::ArgAction::Append, help_heading = "Filtering")]
    include: Vec<String>,

    // Performance & throttling
    /// Number of concurrent workers
    #[arg(long, default_value_t = common::config::DEFAULT_THREADS, value_name = "N", help_heading = "Performance & throttling")]
    threads: usize,

    /// Maximum number of parts, chunks and range fetches in flight across all workers
    #[arg(long, default_value_t = common::config::DEFAULT_THREADS, value_name = "N", help_heading = "Performance & throttling")]
    concurrency: usize,

    /// Bandwidth limit in Mbps, 0 means unlimited
    #[arg(long, default_value = "0", value_name = "MBPS", help_heading = "Performance & throttling")]
    bwlimit: u64,

    /// Objects of at least this size are copied with multipart upload, e.g. "64MiB"
    #[arg(long, default_value = "10MiB", value_name = "SIZE", help_heading = "Performance & throttling")]
    large_object_threshold: bytesize::ByteSize,

    // Cluster options
    /// Address of the manager, runs this process as a cluster worker
    #[arg(long, value_name = "ADDR", conflicts_with = "worker", help_heading = "Cluster options")]
    manager: Option<String>,

    /// Hosts to start workers on, as [user@]host[:port] (comma separated)
    #[arg(long, value_name = "HOSTS", value_delimiter = ',', help_heading = "Cluster options")]
    worker: Vec<String>,

    /// Path of an objsync binary already present on the worker hosts
    #[arg(long, value_name = "PATH", help_heading = "Cluster options")]
    worker_path: Option<String>,

    /// Never copy this binary to the worker hosts, only reuse a compatible install
    #[arg(long, help_heading = "Cluster options")]
    no_deploy: bool,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates, e.g. "500ms", "10s"
    ///
    /// Defaults to 200ms for the progress bar and 10s for text updates.
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Advanced settings")]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Advanced settings")]
    max_blocking_threads: usize,

    /// Print protocol version information as JSON and exit
    ///
    /// Used by the manager to decide whether a deployed worker can be reused
    #[arg(long, help_heading = "Advanced settings")]
    protocol_version: bool,

    // ARGUMENTS
    /// Source endpoint, a directory path, file:///dir/ or mem://name/
    #[arg()]
    src: String,

    /// Destination endpoint
    #[arg()]
    dst: String,
}

impl Args {
    fn sync_config(&self) -> anyhow::Result<SyncConfig> {
        let filters = common::filter::FilterSettings::from_patterns(&self.include, &self.exclude)?;
        let config = SyncConfig {
            start: self.start.clone().unwrap_or_default(),
            end: self.end.clone().unwrap_or_default(),
            threads: self.threads,
            concurrency: self.concurrency.max(1),
            update: self.update,
            force_update: self.force_update,
            perms: self.perms,
            dirs: self.dirs,
            delete_src: self.delete_src,
            delete_dst: self.delete_dst,
            check_all: self.check_all,
            check_new: self.check_new,
            dry: self.dry,
            filters,
            bandwidth: bandwidth(self.bwlimit),
            large_object_threshold: self.large_object_threshold.as_u64(),
            ..Default::default()
        };
        config.validate().map_err(|err| anyhow!(err))?;
        Ok(config)
    }
}

/// Mbps to bytes per second, `None` when unlimited.
fn bandwidth(mbps: u64) -> Option<u64> {
    (mbps > 0).then(|| mbps.saturating_mul(1 << 20) / 8)
}

/// Endpoints are directory-like.
fn endpoint_uri(uri: &str) -> String {
    if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{uri}/")
    }
}

fn open(uri: &str) -> anyhow::Result<common::store::Endpoint> {
    common::store::open(&endpoint_uri(uri)).with_context(|| format!("failed to open {uri}"))
}

#[instrument(skip(config, stats))]
async fn async_main(args: Args, config: Arc<SyncConfig>, stats: Arc<Stats>) -> anyhow::Result<Stat> {
    let src = open(&args.src)?;
    let dst = open(&args.dst)?;
    let ctx = RunContext::new(stats, config.bandwidth, config.concurrency);
    if let Some(manager) = &args.manager {
        return remote::cluster::run_worker(config, src, dst, ctx, manager).await;
    }
    let res = if args.worker.is_empty() {
        common::sync::sync(config, src, dst, ctx).await
    } else {
        let hosts = args
            .worker
            .iter()
            .map(|host| host.parse())
            .collect::<anyhow::Result<Vec<remote::SshSession>>>()?;
        let cli: Vec<String> = std::env::args().skip(1).collect();
        let env = remote::protocol::forwarded_env(std::env::vars());
        let (worker_path, no_deploy) = (args.worker_path.clone(), args.no_deploy);
        let launch = move |manager: std::net::SocketAddr| {
            let settings = remote::LaunchSettings {
                args: remote::protocol::worker_args(&cli, &manager.to_string()),
                env,
                worker_path,
                no_deploy,
            };
            remote::launch_workers(hosts, Arc::new(settings), manager)
        };
        let bind = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        remote::cluster::run_manager(config, src, dst, ctx, bind, launch).await
    };
    match res {
        Ok(summary) => Ok(summary),
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> anyhow::Result<()> {
    // --protocol-version must work without the positional arguments
    let raw: Vec<String> = std::env::args().collect();
    let before_separator = raw.iter().position(|arg| arg == "--").unwrap_or(raw.len());
    if raw[..before_separator].iter().any(|arg| arg == "--protocol-version") {
        println!("{}", common::version::ProtocolVersion::current().to_json()?);
        return Ok(());
    }
    let args = Args::parse();
    let config = Arc::new(args.sync_config()?);
    let stats = Arc::new(Stats::new());
    let func = {
        let (args, config, stats) = (args.clone(), config.clone(), stats.clone());
        || async_main(args, config, stats)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let wants_progress =
        args.progress || args.progress_type.is_some() || args.progress_delay.is_some();
    let progress = (args.manager.is_none() && wants_progress).then(|| common::ProgressSettings {
        progress_type: args.progress_type.unwrap_or_default(),
        delay: args.progress_delay.clone(),
    });
    let res = common::run(progress, output, runtime, stats, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("objsync").chain(args.iter().copied()))
    }

    #[test]
    fn bwlimit_is_in_megabits() {
        assert_eq!(bandwidth(0), None);
        assert_eq!(bandwidth(8), Some(1 << 20));
        assert_eq!(bandwidth(100), Some(100 * (1 << 20) / 8));
    }

    #[test]
    fn endpoints_get_a_trailing_slash() {
        assert_eq!(endpoint_uri("/data/src"), "/data/src/");
        assert_eq!(endpoint_uri("mem://a/"), "mem://a/");
    }

    #[test]
    fn progress_type_is_parsed() {
        let args = parse(&["--progress-type", "TextUpdates", "src", "dst"]);
        assert_eq!(args.progress_type, Some(common::ProgressType::TextUpdates));
        let args = parse(&["src", "dst"]);
        assert_eq!(args.progress_type, None);
        let bad = Args::try_parse_from(["objsync", "--progress-type", "fancy", "src", "dst"]);
        assert!(bad.is_err());
    }

    #[test]
    fn flags_map_onto_the_sync_policy() -> anyhow::Result<()> {
        let args = parse(&[
            "-u",
            "--perms",
            "--exclude",
            "^tmp/",
            "--threads",
            "3",
            "--large-object-threshold",
            "64MiB",
            "--start",
            "a",
            "--end",
            "m",
            "--bwlimit",
            "16",
            "src",
            "dst",
        ]);
        let config = args.sync_config()?;
        assert!(config.update && config.perms);
        assert_eq!(config.threads, 3);
        assert_eq!(config.large_object_threshold, 64 << 20);
        assert_eq!(config.bandwidth, Some(2 << 20));
        assert_eq!((config.start.as_str(), config.end.as_str()), ("a", "m"));
        assert!(!config.filters.should_include("tmp/x").is_included());
        Ok(())
    }

    #[test]
    fn contradictory_flags_are_rejected() {
        assert!(parse(&["--delete-src", "--delete-dst", "a", "b"]).sync_config().is_err());
        assert!(parse(&["--start", "z", "--end", "a", "a", "b"]).sync_config().is_err());
        assert!(parse(&["--exclude", "(", "a", "b"]).sync_config().is_err());
    }

    #[test]
    fn worker_hosts_are_comma_separated() {
        let args = parse(&["--worker", "h1,u@h2:22", "--worker", "h3", "a", "b"]);
        assert_eq!(args.worker, ["h1", "u@h2:22", "h3"]);
    }
}
