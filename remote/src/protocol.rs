//! Wire contract between the manager and its workers.
//!
//! `GET /fetch` answers with a JSON array of [`WorkItem`]s, an empty array once the queue is
//! closed and drained. `POST /stats` takes a JSON [`common::Stat`] delta and answers `OK`.

use std::time::Duration;

pub use common::object::WorkItem;

pub const FETCH_PATH: &str = "/fetch";
pub const STATS_PATH: &str = "/stats";

/// Body of a successful stats push.
pub const STATS_OK: &str = "OK";

/// Maximum number of items handed out by one fetch.
pub const FETCH_BATCH: usize = 100;

/// How often a worker pushes its counters.
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between attempts to reach an unreachable manager.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Environment variables with these prefixes are forwarded to remote workers.
pub const FORWARDED_ENV_PREFIXES: &[&str] = &["OBJSYNC_", "AWS_"];
pub const FORWARDED_ENV_VARS: &[&str] = &["RUST_LOG"];

const SECRET_MARKERS: &[&str] = &["SECRET", "TOKEN", "PASSWORD", "KEY", "CREDENTIAL"];

/// Manager flags that make no sense on a worker.
const MANAGER_ONLY_FLAGS: &[&str] = &["--no-deploy", "--progress"];
const MANAGER_ONLY_OPTIONS: &[&str] = &[
    "--worker",
    "--worker-path",
    "--progress-type",
    "--progress-delay",
    "--manager",
];

/// Arguments for a remote worker: the manager's own command line without the manager-only
/// flags, pointed back at `manager`.
///
/// `args` excludes the program name.
pub fn worker_args(args: &[String], manager: &str) -> Vec<String> {
    let mut out = vec!["--manager".to_string(), manager.to_string()];
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            out.push(arg.clone());
            out.extend(iter.by_ref().cloned());
            break;
        }
        if MANAGER_ONLY_FLAGS.contains(&arg.as_str()) {
            continue;
        }
        if MANAGER_ONLY_OPTIONS.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        let takes_inline_value = MANAGER_ONLY_OPTIONS
            .iter()
            .chain(MANAGER_ONLY_FLAGS)
            .any(|option| arg.strip_prefix(option).is_some_and(|rest| rest.starts_with('=')));
        if takes_inline_value {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

/// Pick the variables a remote worker inherits.
pub fn forwarded_env(vars: impl IntoIterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut env: Vec<_> = vars
        .into_iter()
        .filter(|(name, _)| {
            FORWARDED_ENV_VARS.contains(&name.as_str())
                || FORWARDED_ENV_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
        })
        .collect();
    env.sort();
    env
}

/// `NAME=value` with secret-looking values replaced, for logs only.
pub fn display_env(name: &str, value: &str) -> String {
    let upper = name.to_ascii_uppercase();
    if SECRET_MARKERS.iter().any(|marker| upper.contains(marker)) {
        format!("{name}=******")
    } else {
        format!("{name}={value}")
    }
}
