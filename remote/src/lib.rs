//! Cluster mode of `objsync`: the manager endpoint, the worker loop and SSH bootstrap of
//! remote workers.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::io::AsyncBufReadExt;
use tracing::instrument;

pub mod client;
pub mod cluster;
pub mod deploy;
pub mod manager;
pub mod protocol;

/// A worker host given as `[user@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSession {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl std::str::FromStr for SshSession {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        let value = value.trim();
        let (user, rest) = match value.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(anyhow!("empty user in worker host {value:?}")),
            None => (None, value),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .with_context(|| format!("invalid port in worker host {value:?}"))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() {
            return Err(anyhow!("empty host in worker host {value:?}"));
        }
        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl SshSession {
    /// `user@host` or `host`, as understood by ssh and rsync.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

async fn setup_ssh_session(session: &SshSession) -> anyhow::Result<Arc<openssh::Session>> {
    let destination = match session.port {
        Some(port) => format!("ssh://{}:{port}", session.destination()),
        None => format!("ssh://{}", session.destination()),
    };
    tracing::debug!("connecting to {destination}");
    let session = openssh::Session::connect(destination, openssh::KnownHosts::Accept)
        .await
        .with_context(|| format!("failed to establish SSH connection to {session}"))?;
    Ok(Arc::new(session))
}

/// How the manager starts its remote workers.
#[derive(Debug, Clone, Default)]
pub struct LaunchSettings {
    /// Worker command line, see [`protocol::worker_args`]
    pub args: Vec<String>,
    /// Variables set for the worker process, see [`protocol::forwarded_env`]
    pub env: Vec<(String, String)>,
    /// Run this binary on the hosts instead of deploying one
    pub worker_path: Option<String>,
    /// Only use an install already present in the hosts' cache
    pub no_deploy: bool,
}

/// Start a worker on every host and wait until all of them exit.
///
/// Failures are logged per host; the manager's own reconciliation notices lost work.
pub async fn launch_workers(hosts: Vec<SshSession>, settings: Arc<LaunchSettings>, manager: SocketAddr) {
    let mut join_set = tokio::task::JoinSet::new();
    for host in hosts {
        let settings = settings.clone();
        join_set.spawn(async move {
            if let Err(err) = run_remote_worker(&host, &settings, manager).await {
                tracing::error!("{host}: {err:#}");
            }
        });
    }
    while let Some(res) = join_set.join_next().await {
        if let Err(err) = res {
            tracing::error!("worker launcher failed: {err}");
        }
    }
}

#[instrument(skip(settings))]
async fn run_remote_worker(
    host: &SshSession,
    settings: &LaunchSettings,
    manager: SocketAddr,
) -> anyhow::Result<()> {
    let session = setup_ssh_session(host).await?;
    let binary = match &settings.worker_path {
        Some(path) => path.clone(),
        None => deploy::ensure_worker_binary(&session, host, settings.no_deploy).await?,
    };
    let child = start_worker(&session, &binary, settings).await?;
    tracing::info!("launched a worker on {host}");
    wait_for_worker(host, child).await
}

async fn start_worker(
    session: &Arc<openssh::Session>,
    binary: &str,
    settings: &LaunchSettings,
) -> anyhow::Result<openssh::Child<Arc<openssh::Session>>> {
    let masked: Vec<_> = settings
        .env
        .iter()
        .map(|(name, value)| protocol::display_env(name, value))
        .collect();
    tracing::debug!("worker command: {} {} {}", masked.join(" "), binary, settings.args.join(" "));
    let mut cmd = if settings.env.is_empty() {
        session.clone().arc_command(binary)
    } else {
        let mut cmd = session.clone().arc_command("env");
        for (name, value) in &settings.env {
            cmd.arg(format!("{name}={value}"));
        }
        cmd.arg(binary);
        cmd
    };
    cmd.args(&settings.args)
        .stdin(openssh::Stdio::null())
        .stdout(openssh::Stdio::null())
        .stderr(openssh::Stdio::piped())
        .spawn()
        .await
        .context("failed to spawn the worker")
}

/// Relay the worker's stderr line by line with a `host:` prefix until it exits.
async fn wait_for_worker(
    host: &SshSession,
    mut child: openssh::Child<Arc<openssh::Session>>,
) -> anyhow::Result<()> {
    if let Some(stderr) = child.stderr().take() {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => eprintln!("{host}: {line}"),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("{host}: reading worker output failed: {err}");
                    break;
                }
            }
        }
    }
    let status = child.wait().await.context("failed to wait for the worker")?;
    if !status.success() {
        return Err(anyhow!("worker exited with status {:?}", status.code()));
    }
    tracing::info!("worker on {host} finished");
    Ok(())
}

/// First address of an up, non-loopback IPv4 interface.
pub fn get_local_ip() -> anyhow::Result<std::net::IpAddr> {
    let interfaces = if_addrs::get_if_addrs().context("failed to list network interfaces")?;
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .find(std::net::IpAddr::is_ipv4)
        .ok_or_else(|| anyhow!("no network interface with an IPv4 address, are you connected to the network?"))
}

/// Quote `value` for a POSIX shell.
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `$HOME` of the SSH user.
pub async fn get_remote_home(session: &Arc<openssh::Session>) -> anyhow::Result<String> {
    let output = session
        .command("sh")
        .arg("-c")
        .arg("echo \"$HOME\"")
        .output()
        .await
        .context("failed to read $HOME on the remote host")?;
    let home = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || home.is_empty() {
        return Err(anyhow!("$HOME is not set on the remote host"));
    }
    Ok(home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_hosts() -> anyhow::Result<()> {
        let full: SshSession = "alice@node-1:2222".parse()?;
        assert_eq!(
            full,
            SshSession {
                user: Some("alice".to_string()),
                host: "node-1".to_string(),
                port: Some(2222),
            }
        );
        assert_eq!(full.to_string(), "alice@node-1:2222");
        assert_eq!(full.destination(), "alice@node-1");
        let bare: SshSession = "node-2".parse()?;
        assert_eq!(bare.user, None);
        assert_eq!(bare.port, None);
        assert!("node:port".parse::<SshSession>().is_err());
        assert!("@node".parse::<SshSession>().is_err());
        assert!("bob@".parse::<SshSession>().is_err());
        Ok(())
    }

    #[test]
    fn shell_escape_quotes() {
        assert_eq!(shell_escape("/home/a b"), "'/home/a b'");
        assert_eq!(shell_escape("it's"), r"'it'\''s'");
    }
}
