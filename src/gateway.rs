//! Request (regular) worker: a stateless axum front end that turns each
//! inbound HTTP call into one control-channel request and suspends the
//! HTTP response until the matching reply returns.
//!
//! Replies are matched by a per-request correlation id held in a keyed map
//! of pending oneshot senders. A single "current response" slot would
//! misroute replies whenever two requests are in flight at once, so the
//! map is load-bearing, not an optimization.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
};
use nanoid::nanoid;
use serde_json::{Value, json};
use tokio::{net::TcpListener, select, sync::{mpsc, oneshot}};
use tracing::{error, info, warn};
use tower_http::trace::TraceLayer;

use crate::control::{self, Control};
use crate::message::{Command, Envelope, UserFields};
use crate::validate;

const USER_NOT_FOUND: &str = "User not found";
const UNKNOWN_METHOD: &str = "Unknown method";
const ROUTE_NOT_FOUND: &str = "Route not found";
const ROUTE_INVALID: &str = "Route is invalid";
const INTERNAL_ERROR: &str = "Internal Server Error";

pub struct GatewayState {
    outbox: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<String, oneshot::Sender<Command>>>,
}

impl GatewayState {
    fn new(outbox: mpsc::Sender<Envelope>) -> Self {
        Self {
            outbox,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The lock is never held across an await, and a poisoned map is still
    /// structurally sound, so poisoning is not treated as fatal.
    fn pending_map(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Command>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands an inbound response to whichever HTTP request is waiting on
    /// its correlation id.
    fn resolve(&self, envelope: Envelope) {
        let Some(correlation_id) = envelope.correlation_id else {
            warn!("response frame without a correlation id; dropping");
            return;
        };
        let waiter = self.pending_map().remove(&correlation_id);
        let Some(waiter) = waiter else {
            warn!(%correlation_id, "no suspended request for this response");
            return;
        };
        // The client may have hung up in the meantime; that is fine.
        let _ = waiter.send(envelope.command);
    }
}

/// Clears a registered correlation entry when the request future is dropped
/// before its reply arrives, e.g. the client hung up or the reply was lost
/// in a DB worker crash. After a normal resolution the entry is already
/// gone and the remove is a no-op.
struct PendingCleanup<'a> {
    state: &'a GatewayState,
    correlation_id: &'a str,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.state.pending_map().remove(self.correlation_id);
    }
}

pub async fn run(control_addr: SocketAddr, port: u16) -> Result<()> {
    let control = control::connect(control_addr).await?;
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("request worker failed to bind port {port}"))?;
    info!(
        pid = std::process::id(),
        addr = %listener.local_addr()?,
        "request worker listening"
    );
    serve(listener, control).await
}

/// Serves HTTP on an already-bound listener; split out so tests can wire a
/// gateway to a stub primary on ephemeral ports.
pub async fn serve(listener: TcpListener, control: Control) -> Result<()> {
    let state = Arc::new(GatewayState::new(control.outbound));

    let resolver = {
        let state = Arc::clone(&state);
        let mut inbound = control.inbound;
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                state.resolve(envelope);
            }
        })
    };

    let server = axum::serve(listener, router(state)).into_future();
    select! {
        served = server => served.map_err(Into::into),
        _ = resolver => bail!("control channel to primary closed"),
    }
}

fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/api/users", any(collection))
        .route("/api/users/:id", any(item))
        .fallback(route_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn route_not_found() -> Response {
    message_response(StatusCode::NOT_FOUND, ROUTE_NOT_FOUND)
}

async fn collection(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    body: Bytes,
) -> Response {
    match method {
        Method::GET => match round_trip(&state, Command::GetAllUsersRequest).await {
            Ok(Command::GetAllUsersResponse { users }) => {
                (StatusCode::OK, Json(users)).into_response()
            }
            Ok(other) => mismatched_response(other),
            Err(response) => response,
        },
        Method::POST => {
            let fields = match parse_body(&body) {
                Ok(fields) => fields,
                Err(response) => return response,
            };
            match round_trip(&state, Command::CreateUserRequest { body: fields }).await {
                Ok(Command::CreateUserResponse { user }) => {
                    (StatusCode::CREATED, Json(user)).into_response()
                }
                Ok(other) => mismatched_response(other),
                Err(response) => response,
            }
        }
        _ => message_response(StatusCode::BAD_REQUEST, UNKNOWN_METHOD),
    }
}

async fn item(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    method: Method,
    body: Bytes,
) -> Response {
    match method {
        Method::GET => {
            let id = match validate::validate_id(&id) {
                Ok(id) => id,
                Err(message) => return message_response(StatusCode::BAD_REQUEST, &message),
            };
            match round_trip(&state, Command::GetOneUserRequest { id }).await {
                Ok(Command::GetOneUserResponse { user: Some(user) }) => {
                    (StatusCode::OK, Json(user)).into_response()
                }
                Ok(Command::GetOneUserResponse { user: None }) => {
                    message_response(StatusCode::NOT_FOUND, USER_NOT_FOUND)
                }
                Ok(other) => mismatched_response(other),
                Err(response) => response,
            }
        }
        Method::PUT => {
            let id = match validate::validate_id(&id) {
                Ok(id) => id,
                Err(message) => return message_response(StatusCode::BAD_REQUEST, &message),
            };
            let fields = match parse_body(&body) {
                Ok(fields) => fields,
                Err(response) => return response,
            };
            match round_trip(&state, Command::UpdateUserRequest { id, body: fields }).await {
                Ok(Command::UpdateUserResponse { user: Some(user) }) => {
                    (StatusCode::OK, Json(user)).into_response()
                }
                Ok(Command::UpdateUserResponse { user: None }) => {
                    message_response(StatusCode::NOT_FOUND, USER_NOT_FOUND)
                }
                Ok(other) => mismatched_response(other),
                Err(response) => response,
            }
        }
        Method::DELETE => {
            let id = match validate::validate_id(&id) {
                Ok(id) => id,
                Err(message) => return message_response(StatusCode::BAD_REQUEST, &message),
            };
            match round_trip(&state, Command::DeleteUserRequest { id }).await {
                Ok(Command::DeleteUserResponse { ok: true }) => {
                    StatusCode::NO_CONTENT.into_response()
                }
                Ok(Command::DeleteUserResponse { ok: false }) => {
                    message_response(StatusCode::NOT_FOUND, USER_NOT_FOUND)
                }
                Ok(other) => mismatched_response(other),
                Err(response) => response,
            }
        }
        // POST on an item path is a malformed route, not a bad method.
        Method::POST => message_response(StatusCode::BAD_REQUEST, ROUTE_INVALID),
        _ => message_response(StatusCode::BAD_REQUEST, UNKNOWN_METHOD),
    }
}

/// Sends one request through the primary and suspends until the matching
/// response arrives. There is deliberately no timeout: a hung DB worker
/// stalls the request until crash detection tears the channel down.
async fn round_trip(state: &GatewayState, command: Command) -> Result<Command, Response> {
    let correlation_id = nanoid!();
    let (waiter_tx, waiter_rx) = oneshot::channel();
    state
        .pending_map()
        .insert(correlation_id.clone(), waiter_tx);
    let _cleanup = PendingCleanup {
        state,
        correlation_id: &correlation_id,
    };

    let envelope = Envelope {
        command,
        worker_id: None,
        correlation_id: Some(correlation_id.clone()),
    };
    if state.outbox.send(envelope).await.is_err() {
        error!("control channel down while sending request");
        return Err(message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR));
    }

    waiter_rx.await.map_err(|_| {
        error!(%correlation_id, "suspended request abandoned");
        message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
    })
}

fn parse_body(body: &[u8]) -> Result<UserFields, Response> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| message_response(StatusCode::BAD_REQUEST, validate::JSON_INVALID))?;
    validate::validate_body(&value)
        .map_err(|message| message_response(StatusCode::BAD_REQUEST, &message))
}

fn message_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

fn mismatched_response(command: Command) -> Response {
    error!(cmd = ?command, "response command does not match the request");
    message_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
}
