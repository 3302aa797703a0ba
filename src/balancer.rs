//! Balancer worker: round-robins inbound HTTP across the regular workers.
//!
//! At startup it asks the primary for the worker registry and cannot
//! forward anything until the answer arrives. The target list is captured
//! once; the primary's crash-recovery churn is never re-polled, so the
//! list can go stale until the process restarts. That staleness is an
//! accepted limitation of the topology, not something the balancer papers
//! over with health checks or retries.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail, ensure};
use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tokio::{net::TcpListener, select};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::control::{self, Control};
use crate::message::{Command, Envelope, Role, WorkerRecord};

const INTERNAL_ERROR: &str = "Internal Server Error";

/// Round-robin dispatcher over the target ports.
///
/// The cursor is advanced before each pick, so the very first request goes
/// to index 1 when more than one target exists. That matches the original
/// dispatcher and is the canonical behavior, not a bug.
struct RoundRobin {
    targets: Vec<u16>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    fn new(targets: Vec<u16>) -> Self {
        Self {
            targets,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> u16 {
        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed) + 1;
        self.targets[cursor % self.targets.len()]
    }
}

/// The registry filtered down to forwardable targets: balancers are
/// excluded so the balancer never forwards to itself or a peer, and the
/// DB worker is excluded because it owns no HTTP listener.
fn http_targets(workers: &[WorkerRecord]) -> Vec<u16> {
    workers
        .iter()
        .filter(|worker| worker.role == Role::Regular)
        .filter_map(|worker| worker.port)
        .collect()
}

struct BalancerState {
    client: reqwest::Client,
    dispatcher: RoundRobin,
}

pub async fn run(control_addr: SocketAddr, port: u16) -> Result<()> {
    let mut control = control::connect(control_addr).await?;

    control
        .outbound
        .send(Envelope::bare(Command::WorkersRequest))
        .await
        .context("failed to request worker registry")?;
    let workers = await_registry(&mut control).await?;

    let targets = http_targets(&workers);
    ensure!(!targets.is_empty(), "no request workers to balance across");
    info!(pid = std::process::id(), ?targets, "balancer received registry");

    let state = Arc::new(BalancerState {
        client: reqwest::Client::new(),
        dispatcher: RoundRobin::new(targets),
    });

    let app = Router::new()
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("balancer failed to bind public port {port}"))?;
    info!(addr = %listener.local_addr()?, "balancer listening");

    // If the control channel drops the primary is gone; exit instead of
    // serving from an unsupervised process.
    let control_watch = tokio::spawn(async move {
        while control.inbound.recv().await.is_some() {}
    });

    let server = axum::serve(listener, app).into_future();
    select! {
        served = server => served.map_err(Into::into),
        _ = control_watch => bail!("control channel to primary closed"),
    }
}

/// Blocks until the registry snapshot arrives; anything else on the
/// channel before it is noise and gets dropped.
async fn await_registry(control: &mut Control) -> Result<Vec<WorkerRecord>> {
    loop {
        match control.inbound.recv().await {
            Some(Envelope {
                command: Command::WorkersResponse { workers },
                ..
            }) => return Ok(workers),
            Some(other) => warn!(cmd = ?other.command, "unexpected frame before registry"),
            None => bail!("control channel closed before the registry arrived"),
        }
    }
}

async fn proxy(State(state): State<Arc<BalancerState>>, request: Request) -> Response {
    match forward(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            // No retry against another target and no health bookkeeping;
            // the client just sees a 500.
            warn!(?err, "proxying to worker failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": INTERNAL_ERROR })),
            )
                .into_response()
        }
    }
}

/// Relays method, path, headers, and body verbatim to the chosen worker
/// and streams its status and body back unchanged.
async fn forward(state: &BalancerState, request: Request) -> Result<Response> {
    let port = state.dispatcher.next();
    let (parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://127.0.0.1:{port}{path_and_query}");
    debug!(method = %parts.method, %url, "redirecting to worker");

    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .context("failed to read client body")?;

    let mut headers = parts.headers;
    // The worker derives its own Host; everything else passes through.
    headers.remove(header::HOST);

    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(headers)
        .body(bytes.to_vec())
        .send()
        .await
        .context("worker request failed")?;

    let status = upstream.status();
    let payload = upstream
        .bytes()
        .await
        .context("failed to read worker response")?;

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload))
        .context("failed to assemble relayed response")
}
