//! Worker-process entry: role and wiring read once from the environment
//! the primary set at fork time.

use std::net::SocketAddr;

use anyhow::{Context, Result, bail};

use crate::message::Role;
use crate::{balancer, db, gateway};

pub const ENV_ROLE: &str = "USER_CLUSTER_ROLE";
pub const ENV_PORT: &str = "USER_CLUSTER_PORT";
pub const ENV_CONTROL: &str = "USER_CLUSTER_CONTROL";

/// Fork-time assignment for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub role: Role,
    pub port: Option<u16>,
    pub control_addr: SocketAddr,
}

/// Returns `None` when the process was started directly (primary mode)
/// rather than forked by a primary.
pub fn from_env() -> Result<Option<WorkerEnv>> {
    let Ok(role) = std::env::var(ENV_ROLE) else {
        return Ok(None);
    };
    let role = match role.as_str() {
        "db" => Role::Db,
        "balancer" => Role::Balancer,
        "regular" => Role::Regular,
        other => bail!("unknown worker role '{other}'"),
    };

    let control_addr = std::env::var(ENV_CONTROL)
        .with_context(|| format!("{ENV_CONTROL} missing for forked worker"))?
        .parse()
        .context("control address is not a socket address")?;

    let port = match std::env::var(ENV_PORT) {
        Ok(raw) => Some(raw.parse().context("worker port is not a port number")?),
        Err(_) => None,
    };

    Ok(Some(WorkerEnv {
        role,
        port,
        control_addr,
    }))
}

pub async fn run(env: WorkerEnv) -> Result<()> {
    match env.role {
        Role::Db => db::run(env.control_addr).await,
        Role::Balancer => {
            let port = env.port.context("balancer forked without a port")?;
            balancer::run(env.control_addr, port).await
        }
        Role::Regular => {
            let port = env.port.context("request worker forked without a port")?;
            gateway::run(env.control_addr, port).await
        }
    }
}
