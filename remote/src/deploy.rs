//! Versioned deployment of the worker agent.
//!
//! The agent is this very binary, installed on each worker host at
//! `~/.cache/objsync/bin/objsync-{version}`. An install is reused when its
//! `--protocol-version` answer is compatible with ours; otherwise the binary is transferred
//! (rsync when available, base64 over the SSH channel otherwise), its SHA-256 checksum is
//! verified on the host and old versions are pruned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use common::version::ProtocolVersion;
use sha2::{Digest, Sha256};

use crate::{SshSession, shell_escape};

/// Cache directory relative to the remote `$HOME`.
pub const CACHE_DIR: &str = ".cache/objsync/bin";

/// Number of installed versions kept on each host.
pub const KEEP_VERSIONS: usize = 3;

/// Path of the running executable.
pub fn find_local_binary() -> anyhow::Result<PathBuf> {
    let path = std::env::current_exe().context("failed to get current executable path")?;
    if !path.is_file() {
        anyhow::bail!("current executable {} is not a regular file", path.display());
    }
    Ok(path)
}

/// Path of a worker binary on `host` matching our version, deploying it when needed.
pub async fn ensure_worker_binary(
    session: &Arc<openssh::Session>,
    host: &SshSession,
    no_deploy: bool,
) -> anyhow::Result<String> {
    let version = ProtocolVersion::current();
    let home = crate::get_remote_home(session).await?;
    let remote_path = format!("{home}/{CACHE_DIR}/{}", version.install_name());
    match remote_version(session, &remote_path).await {
        Some(installed) if installed.is_compatible_with(&version) => {
            tracing::info!("{host}: reusing worker {installed} at {remote_path}");
            return Ok(remote_path);
        }
        Some(installed) => tracing::info!("{host}: replacing incompatible worker {installed}"),
        None => tracing::debug!("{host}: no worker installed at {remote_path}"),
    }
    if no_deploy {
        anyhow::bail!("no compatible worker installed at {remote_path} and deployment is disabled");
    }
    let local = find_local_binary()?;
    deploy(session, host, &local, &remote_path).await?;
    if let Err(err) = cleanup_old_versions(session, &home, KEEP_VERSIONS).await {
        tracing::warn!("{host}: cleanup of old versions failed: {err:#}");
    }
    Ok(remote_path)
}

/// Ask the binary at `path` for its version, `None` if it is missing or unusable.
async fn remote_version(session: &Arc<openssh::Session>, path: &str) -> Option<ProtocolVersion> {
    let output = session
        .command(path)
        .arg("--protocol-version")
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    ProtocolVersion::from_json(&String::from_utf8_lossy(&output.stdout)).ok()
}

/// Transfer `local` to `remote_path` on `host` and verify it arrived intact.
pub async fn deploy(
    session: &Arc<openssh::Session>,
    host: &SshSession,
    local: &Path,
    remote_path: &str,
) -> anyhow::Result<()> {
    let binary = tokio::fs::read(local)
        .await
        .with_context(|| format!("failed to read local binary {}", local.display()))?;
    let expected = compute_sha256(&binary);
    tracing::info!(
        "deploying {} ({}) to {host}:{remote_path}",
        local.display(),
        bytesize::ByteSize(binary.len() as u64)
    );
    let dir = Path::new(remote_path)
        .parent()
        .and_then(Path::to_str)
        .context("remote path must have a parent directory")?;
    run_remote(session, &format!("mkdir -p {}", shell_escape(dir))).await?;
    match transfer_rsync(host, local, remote_path).await {
        Ok(()) => {
            run_remote(session, &format!("chmod 700 {}", shell_escape(remote_path))).await?;
        }
        Err(err) => {
            tracing::debug!("{host}: rsync failed, falling back to base64 transfer: {err:#}");
            transfer_base64(session, &binary, remote_path).await?;
        }
    }
    verify_remote_checksum(session, remote_path, &expected).await?;
    tracing::info!("{host}: checksum of {remote_path} verified");
    Ok(())
}

async fn run_remote(session: &Arc<openssh::Session>, cmd: &str) -> anyhow::Result<String> {
    let output = session
        .command("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .with_context(|| format!("failed to run {cmd:?} on the remote host"))?;
    if !output.status.success() {
        anyhow::bail!(
            "{cmd:?} failed on the remote host: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn transfer_rsync(host: &SshSession, local: &Path, remote_path: &str) -> anyhow::Result<()> {
    let ssh = match host.port {
        Some(port) => format!("ssh -p {port}"),
        None => "ssh".to_string(),
    };
    let status = tokio::process::Command::new("rsync")
        .arg("-a")
        .arg("-e")
        .arg(ssh)
        .arg(local)
        .arg(format!("{}:{remote_path}", host.destination()))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .context("failed to run rsync")?;
    if !status.success() {
        anyhow::bail!("rsync exited with {status}");
    }
    Ok(())
}

/// Stream the binary through ssh stdin into a temporary file, then move it into place.
async fn transfer_base64(
    session: &Arc<openssh::Session>,
    binary: &[u8],
    remote_path: &str,
) -> anyhow::Result<()> {
    use base64::Engine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let encoded = base64::engine::general_purpose::STANDARD.encode(binary);
    // $$ keeps concurrent deployments from sharing a temporary file
    let temp_path = format!("{remote_path}.tmp.$$");
    let cmd = format!(
        "base64 -d > \"{temp}\" && chmod 700 \"{temp}\" && mv -f \"{temp}\" {dst}",
        temp = temp_path.replace('"', "\\\""),
        dst = shell_escape(remote_path),
    );
    let mut child = session
        .command("sh")
        .arg("-c")
        .arg(&cmd)
        .stdin(openssh::Stdio::piped())
        .stdout(openssh::Stdio::null())
        .stderr(openssh::Stdio::piped())
        .spawn()
        .await
        .context("failed to spawn remote command for binary transfer")?;
    let mut stdin = child
        .stdin()
        .take()
        .context("failed to get stdin for remote command")?;
    let mut stderr = child
        .stderr()
        .take()
        .context("failed to get stderr for remote command")?;
    stdin
        .write_all(encoded.as_bytes())
        .await
        .context("failed to write base64 data to remote stdin")?;
    // EOF before waiting, or base64 never finishes
    stdin.shutdown().await.context("failed to shutdown stdin")?;
    drop(stdin);
    let mut errors = Vec::new();
    let _ = stderr.read_to_end(&mut errors).await;
    let status = child
        .wait()
        .await
        .context("failed to wait for remote command completion")?;
    if !status.success() {
        anyhow::bail!(
            "failed to transfer binary to remote host: {}\n\
            This may indicate insufficient disk space, no permission to create ~/{CACHE_DIR} \
            or a missing base64 command.",
            String::from_utf8_lossy(&errors).trim()
        );
    }
    Ok(())
}

async fn verify_remote_checksum(
    session: &Arc<openssh::Session>,
    remote_path: &str,
    expected: &[u8],
) -> anyhow::Result<()> {
    let stdout = run_remote(session, &format!("sha256sum {}", shell_escape(remote_path))).await?;
    let remote = stdout
        .split_whitespace()
        .next()
        .context("unexpected sha256sum output format")?;
    let expected = hex::encode(expected);
    if remote != expected {
        anyhow::bail!(
            "checksum mismatch after transfer\nexpected: {expected}\ngot:      {remote}\n\
            The binary transfer may have been corrupted."
        );
    }
    Ok(())
}

fn compute_sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Remove all but the `keep` most recent installs.
pub async fn cleanup_old_versions(
    session: &Arc<openssh::Session>,
    home: &str,
    keep: usize,
) -> anyhow::Result<()> {
    let cache_dir = format!("{home}/{CACHE_DIR}");
    let cmd = format!(
        "cd {} 2>/dev/null && ls -t | grep -v '\\.tmp\\.' | grep '^objsync-' | tail -n +{} | xargs -r rm -f",
        shell_escape(&cache_dir),
        keep + 1
    );
    run_remote(session, &cmd).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_inputs() {
        assert_eq!(
            hex::encode(compute_sha256(b"hello world")),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            hex::encode(compute_sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn local_binary_is_found() -> anyhow::Result<()> {
        let path = find_local_binary()?;
        assert!(path.is_absolute());
        Ok(())
    }
}
