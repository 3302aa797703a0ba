//! The DB worker: sole owner of the user [`Store`].
//!
//! It answers one CRUD request frame at a time, which is what gives every
//! operation atomicity without locks. `workerID` and `correlationId` are
//! echoed verbatim so the primary and the requesting worker can route the
//! response home.

use std::net::SocketAddr;

use anyhow::Result;
use tracing::{info, warn};

use crate::control;
use crate::message::{Command, Envelope};
use crate::store::Store;

pub async fn run(control_addr: SocketAddr) -> Result<()> {
    let mut control = control::connect(control_addr).await?;
    let mut store = Store::new();
    info!(pid = std::process::id(), "db worker ready");

    while let Some(envelope) = control.inbound.recv().await {
        let Some(response) = respond(&mut store, envelope) else {
            continue;
        };
        if control.outbound.send(response).await.is_err() {
            break;
        }
    }

    // Control channel gone means the primary is gone; a replacement primary
    // will fork a fresh DB worker rather than adopt this one.
    info!("control channel closed; db worker exiting");
    Ok(())
}

fn respond(store: &mut Store, envelope: Envelope) -> Option<Envelope> {
    let Envelope {
        command,
        worker_id,
        correlation_id,
    } = envelope;

    let response = match command {
        Command::GetAllUsersRequest => Command::GetAllUsersResponse { users: store.all() },
        Command::GetOneUserRequest { id } => Command::GetOneUserResponse {
            user: store.get(&id),
        },
        Command::CreateUserRequest { body } => Command::CreateUserResponse {
            user: store.create(body),
        },
        Command::UpdateUserRequest { id, body } => Command::UpdateUserResponse {
            user: store.update(&id, body),
        },
        Command::DeleteUserRequest { id } => Command::DeleteUserResponse {
            ok: store.delete(&id),
        },
        other => {
            warn!(cmd = ?other, "db worker received a non-CRUD command; ignoring");
            return None;
        }
    };

    Some(Envelope {
        command: response,
        worker_id,
        correlation_id,
    })
}
