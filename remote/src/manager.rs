//! HTTP endpoint through which remote workers drain the manager's task queue.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use axum::{Json, Router, extract::State, routing::get, routing::post};
use common::Stats;
use tokio_util::sync::CancellationToken;

use crate::protocol::{FETCH_BATCH, FETCH_PATH, STATS_OK, STATS_PATH, WorkItem};

#[derive(Clone)]
struct ManagerState {
    tasks: async_channel::Receiver<WorkItem>,
    stats: Arc<Stats>,
}

/// `GET /fetch`: waits for one item, then takes whatever else is ready up to the batch size.
async fn fetch(State(state): State<ManagerState>) -> Json<Vec<WorkItem>> {
    let Ok(first) = state.tasks.recv().await else {
        return Json(Vec::new());
    };
    let mut batch = vec![first];
    while batch.len() < FETCH_BATCH {
        match state.tasks.try_recv() {
            Ok(item) => batch.push(item),
            Err(_) => break,
        }
    }
    tracing::debug!("handing out {} objects", batch.len());
    Json(batch)
}

/// `POST /stats`: adds a worker's delta to the run counters.
async fn stats(State(state): State<ManagerState>, Json(delta): Json<common::Stat>) -> &'static str {
    tracing::debug!("received stats {delta:?}");
    state.stats.merge(&delta);
    STATS_OK
}

fn routes(state: ManagerState) -> Router {
    Router::new()
        .route(FETCH_PATH, get(fetch))
        .route(STATS_PATH, post(stats))
        .with_state(state)
}

/// A running manager endpoint.
pub struct ManagerServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl ManagerServer {
    /// Serve `tasks` on an ephemeral port of `bind`.
    ///
    /// The advertised address is `bind` itself, or this host's outward-facing address when
    /// `bind` is unspecified.
    pub async fn start(
        bind: IpAddr,
        tasks: async_channel::Receiver<WorkItem>,
        stats: Arc<Stats>,
    ) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(bind, 0))
            .await
            .with_context(|| format!("failed to listen on {bind}"))?;
        let port = listener.local_addr()?.port();
        let ip = if bind.is_unspecified() {
            crate::get_local_ip().context("failed to find the address workers can reach")?
        } else {
            bind
        };
        let addr = SocketAddr::new(ip, port);
        tracing::info!("manager listening on {addr}");
        let cancel = CancellationToken::new();
        let app = routes(ManagerState { tasks, stats });
        let server = tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.clone().cancelled_owned())
                .into_future(),
        );
        Ok(Self {
            addr,
            cancel,
            server,
        })
    }

    /// Address workers connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        match self.server.await {
            Ok(Ok(())) => tracing::debug!("manager endpoint stopped"),
            Ok(Err(err)) => tracing::warn!("manager endpoint failed: {err}"),
            Err(err) => tracing::warn!("manager endpoint task failed: {err}"),
        }
    }
}
