//! Manager and worker roles of a distributed sync.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::anyhow;
use common::sync::{Error, QUEUE_SIZE, reconcile};
use common::worker::{Worker, run_workers};
use common::{RunContext, Stat, Stats, SyncConfig, differ, store::Endpoint};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::client::ManagerClient;
use crate::manager::ManagerServer;
use crate::protocol::{FETCH_BATCH, RETRY_DELAY, STATS_INTERVAL};

/// Run the differ and a local worker pool while remote workers drain the same queue over HTTP.
///
/// `launch` receives the manager address and resolves once every remote worker has exited.
/// Remote workers push their final counters before exiting, so the run reconciles over the
/// whole cluster.
#[instrument(skip_all, fields(src = %src, dst = %dst))]
pub async fn run_manager<F, Fut>(
    config: Arc<SyncConfig>,
    src: Endpoint,
    dst: Endpoint,
    ctx: RunContext,
    bind: IpAddr,
    launch: F,
) -> Result<Stat, Error>
where
    F: FnOnce(SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = async_channel::bounded(QUEUE_SIZE);
    let server = match ManagerServer::start(bind, rx.clone(), ctx.stats.clone()).await {
        Ok(server) => server,
        Err(err) => return Err(Error::new(err, ctx.stats.snapshot())),
    };
    let remote = tokio::spawn(launch(server.addr()));
    let worker = Worker::new(config.clone(), src.clone(), dst.clone(), ctx.clone());
    let pool = tokio::spawn(run_workers(worker, config.threads, rx));
    let produced = differ::produce(&config, src, dst, &ctx.stats, tx).await;
    if produced.is_err() {
        tracing::error!("listing failed, stop syncing, waiting for pending objects");
    }
    let pooled = pool.await;
    let remote = remote.await;
    server.shutdown().await;
    if let Err(err) = produced {
        return Err(Error::new(err.into(), ctx.stats.snapshot()));
    }
    if let Err(err) = pooled {
        return Err(Error::new(anyhow!("worker pool failed: {err}"), ctx.stats.snapshot()));
    }
    if let Err(err) = remote {
        return Err(Error::new(anyhow!("remote workers failed: {err}"), ctx.stats.snapshot()));
    }
    reconcile(&ctx.stats)
}

/// Pull work from `manager` until it runs dry, pushing counters every second.
///
/// Returns everything this worker reported. The manager is never given up on: failed fetches
/// and pushes are retried until they go through.
#[instrument(skip(config, src, dst, ctx))]
pub async fn run_worker(
    config: Arc<SyncConfig>,
    src: Endpoint,
    dst: Endpoint,
    ctx: RunContext,
    manager: &str,
) -> anyhow::Result<Stat> {
    let client = ManagerClient::new(manager)?;
    let (tx, rx) = async_channel::bounded(FETCH_BATCH);
    let worker = Worker::new(config.clone(), src, dst, ctx.clone());
    let pool = tokio::spawn(run_workers(worker, config.threads, rx));
    let stop = CancellationToken::new();
    let reporter = tokio::spawn(report_stats(client.clone(), ctx.stats.clone(), stop.clone()));
    let mut fetched = 0;
    loop {
        let batch = match client.fetch().await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!("{err:#}");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };
        if batch.is_empty() {
            break;
        }
        tracing::debug!("got {} jobs", batch.len());
        fetched += batch.len();
        for item in batch {
            tx.send(item)
                .await
                .map_err(|_| anyhow!("local task queue closed unexpectedly"))?;
        }
    }
    drop(tx);
    tracing::info!("manager has no more work, finishing {fetched} fetched objects");
    pool.await?;
    stop.cancel();
    Ok(reporter.await?)
}

/// Push deltas every [`STATS_INTERVAL`] until `stop`, then push the rest until it is accepted.
async fn report_stats(client: ManagerClient, stats: Arc<Stats>, stop: CancellationToken) -> Stat {
    let mut reported = Stat::default();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(STATS_INTERVAL) => {}
        }
        match client.flush(&stats).await {
            Ok(delta) => reported = reported + delta,
            Err(err) => tracing::error!("update stats: {err:#}"),
        }
    }
    loop {
        match client.flush(&stats).await {
            Ok(delta) => return reported + delta,
            Err(err) => {
                tracing::error!("update stats: {err:#}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
