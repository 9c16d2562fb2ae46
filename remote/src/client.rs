//! Worker side of the manager protocol.

use anyhow::{Context, anyhow};
use common::{Stat, Stats};

use crate::protocol::{FETCH_PATH, STATS_OK, STATS_PATH, WorkItem};

#[derive(Debug, Clone)]
pub struct ManagerClient {
    http: reqwest::Client,
    base: String,
}

impl ManagerClient {
    /// `manager` is `host:port` as passed to `--manager`.
    pub fn new(manager: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("failed to build the HTTP client")?;
        let base = if manager.starts_with("http://") {
            manager.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", manager.trim_end_matches('/'))
        };
        Ok(Self { http, base })
    }

    /// Next batch of work, empty once the manager has nothing left.
    pub async fn fetch(&self) -> anyhow::Result<Vec<WorkItem>> {
        let url = format!("{}{FETCH_PATH}", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch jobs from {url}"))?
            .error_for_status()?;
        response
            .json()
            .await
            .with_context(|| format!("invalid job batch from {url}"))
    }

    pub async fn push_stats(&self, delta: &Stat) -> anyhow::Result<()> {
        let url = format!("{}{STATS_PATH}", self.base);
        let response = self
            .http
            .post(&url)
            .json(delta)
            .send()
            .await
            .with_context(|| format!("failed to push stats to {url}"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() || body != STATS_OK {
            return Err(anyhow!("manager rejected stats ({status}): {body}"));
        }
        Ok(())
    }

    /// Push everything accumulated in `stats` since the last push.
    ///
    /// The delta goes back into `stats` when the push fails, so nothing is lost or counted twice.
    pub async fn flush(&self, stats: &Stats) -> anyhow::Result<Stat> {
        let delta = stats.drain();
        if delta.is_zero() {
            return Ok(delta);
        }
        if let Err(err) = self.push_stats(&delta).await {
            stats.merge(&delta);
            return Err(err);
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_accepts_plain_addresses() -> anyhow::Result<()> {
        assert_eq!(ManagerClient::new("10.1.2.3:4000")?.base, "http://10.1.2.3:4000");
        assert_eq!(ManagerClient::new("http://m:1/")?.base, "http://m:1");
        Ok(())
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_delta() -> anyhow::Result<()> {
        // nothing listens on the discard port
        let client = ManagerClient::new("127.0.0.1:9")?;
        let stats = Stats::new();
        stats.copied.add(2);
        stats.handled.add(2);
        assert!(client.flush(&stats).await.is_err());
        assert_eq!(stats.copied.get(), 2);
        assert_eq!(stats.handled.get(), 2);
        Ok(())
    }
}
