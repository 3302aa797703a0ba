//! The primary coordinator: forks the worker topology, owns the worker
//! registry, and routes every control-channel envelope between workers.
//!
//! The registry is owned by a single event-loop task and mutated only in
//! its handlers; workers, connections, and child-exit watchers all talk to
//! it through one mpsc event stream. The primary never retries and never
//! waits on a worker: it is a pure forwarding and supervision layer, and
//! frames that cannot be delivered right now, whether the target is dead
//! or just not draining its outbox, are logged and dropped.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    process::Command as ProcessCommand,
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::message::{Command, Envelope, Hello, Role, WorkerRecord, read_message, write_message};
use crate::worker::{ENV_CONTROL, ENV_PORT, ENV_ROLE};

pub struct PrimaryConfig {
    /// Port the balancer binds; the public face of the service.
    pub public_port: u16,
    /// Number of HTTP workers to fork (one balancer plus regulars), not
    /// counting the DB worker.
    pub num_workers: usize,
}

/// Events feeding the registry task. Connections and child watchers only
/// ever send these; they never touch the registry directly.
enum Event {
    /// A worker's control connection completed its handshake.
    Connected {
        id: u32,
        outbox: mpsc::Sender<Envelope>,
    },
    /// A frame arrived from worker `id`.
    Inbound { id: u32, envelope: Envelope },
    /// The worker process exited.
    Exited { id: u32 },
}

struct WorkerHandle {
    record: WorkerRecord,
    /// Present once the worker's control connection has registered.
    outbox: Option<mpsc::Sender<Envelope>>,
}

/// Assigns strictly increasing ports to regular workers, starting just
/// above the public port. Respawns reuse the dead worker's port and never
/// consult the planner.
struct PortPlanner {
    public_port: u16,
    high_water: u16,
}

impl PortPlanner {
    fn new(public_port: u16) -> Self {
        Self {
            public_port,
            high_water: 0,
        }
    }

    fn next(&mut self) -> u16 {
        self.high_water = self.high_water.max(self.public_port) + 1;
        self.high_water
    }
}

pub struct Primary {
    registry: HashMap<u32, WorkerHandle>,
    events_tx: mpsc::Sender<Event>,
    control_addr: SocketAddr,
    binary: PathBuf,
}

pub async fn run(config: PrimaryConfig) -> Result<()> {
    let (mut primary, events_rx) = Primary::start(&config).await?;
    primary.run_until_ctrl_c(events_rx).await
}

impl Primary {
    /// Binds the control socket and forks the full topology: the DB worker
    /// first, so CRUD requests always have a destination before any HTTP
    /// worker binds, then the balancer at the public port, then regulars.
    async fn start(config: &PrimaryConfig) -> Result<(Self, mpsc::Receiver<Event>)> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind control socket")?;
        let control_addr = listener.local_addr()?;
        info!(%control_addr, "control socket bound");

        let (events_tx, events_rx) = mpsc::channel(128);
        spawn_accept_loop(listener, events_tx.clone());

        let binary = std::env::current_exe().context("failed to resolve own executable")?;
        let mut primary = Primary {
            registry: HashMap::new(),
            events_tx,
            control_addr,
            binary,
        };

        primary.spawn_worker(Role::Db, None)?;
        primary.spawn_worker(Role::Balancer, Some(config.public_port))?;

        let mut ports = PortPlanner::new(config.public_port);
        for _ in 1..config.num_workers {
            let port = ports.next();
            primary.spawn_worker(Role::Regular, Some(port))?;
        }

        info!(
            workers = primary.registry.len(),
            public_port = config.public_port,
            "cluster topology forked"
        );
        Ok((primary, events_rx))
    }

    async fn run_until<F>(&mut self, mut events: mpsc::Receiver<Event>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            select! {
                _ = &mut shutdown => {
                    info!("primary shutting down; workers die with it");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_until_ctrl_c(&mut self, events: mpsc::Receiver<Event>) -> Result<()> {
        self.run_until(events, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected { id, outbox } => match self.registry.get_mut(&id) {
                Some(handle) => {
                    debug!(id, role = handle.record.role.as_str(), "worker registered");
                    handle.outbox = Some(outbox);
                }
                None => warn!(id, "control connection from unknown process; ignoring"),
            },
            Event::Inbound { id, envelope } => self.route(id, envelope),
            Event::Exited { id } => self.respawn(id),
        }
    }

    /// Routes one envelope per the forwarding rules:
    /// - `workersRequest` is answered directly with a registry snapshot;
    /// - CRUD requests are stamped with the sender's id and forwarded to
    ///   the DB worker;
    /// - CRUD responses are forwarded to the live worker named by
    ///   `workerID`, or dropped if it died in the interim.
    fn route(&mut self, from: u32, mut envelope: Envelope) {
        match &envelope.command {
            Command::WorkersRequest => {
                let workers = self.snapshot();
                self.send_to(from, Envelope::bare(Command::WorkersResponse { workers }));
            }
            command if command.is_crud_request() => {
                let Some(db) = self.db_worker() else {
                    warn!(from, "no live DB worker; dropping request");
                    return;
                };
                envelope.worker_id = Some(from);
                self.send_to(db, envelope);
            }
            command if command.is_crud_response() => match envelope.worker_id {
                Some(target) if self.registry.contains_key(&target) => {
                    self.send_to(target, envelope);
                }
                Some(target) => {
                    // The requester died while the DB worked; the reply has
                    // nowhere to go.
                    warn!(target, "dropping response addressed to dead worker");
                }
                None => warn!(from, "dropping response without a workerID"),
            },
            other => warn!(from, cmd = ?other, "unroutable command; dropping"),
        }
    }

    fn snapshot(&self) -> Vec<WorkerRecord> {
        self.registry
            .values()
            .map(|handle| handle.record.clone())
            .collect()
    }

    fn db_worker(&self) -> Option<u32> {
        self.registry
            .values()
            .find(|handle| handle.record.role == Role::Db)
            .map(|handle| handle.record.id)
    }

    /// Delivery is strictly non-blocking: the router task must keep serving
    /// every other worker even when one worker stops draining its outbox,
    /// so a full outbox loses the frame instead of suspending the loop.
    fn send_to(&self, id: u32, envelope: Envelope) {
        let Some(outbox) = self.registry.get(&id).and_then(|h| h.outbox.as_ref()) else {
            warn!(id, "worker has no control connection yet; dropping frame");
            return;
        };
        match outbox.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(id, "worker not draining its outbox; dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(id, "worker connection gone; dropping frame");
            }
        }
    }

    /// Forks one worker and records it. The child learns its role, port,
    /// and the control address from its environment, read once at startup.
    fn spawn_worker(&mut self, role: Role, port: Option<u16>) -> Result<u32> {
        let mut command = ProcessCommand::new(&self.binary);
        command
            .env(ENV_ROLE, role.as_str())
            .env(ENV_CONTROL, self.control_addr.to_string())
            .kill_on_drop(true);
        if let Some(port) = port {
            command.env(ENV_PORT, port.to_string());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to fork {} worker", role.as_str()))?;
        let id = child
            .id()
            .context("forked worker exited before its pid was known")?;

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            debug!(id, ?status, "worker process exited");
            let _ = events.send(Event::Exited { id }).await;
        });

        info!(id, role = role.as_str(), port, "worker forked");
        self.registry
            .insert(id, WorkerHandle { record: WorkerRecord { id, role, port }, outbox: None });
        Ok(id)
    }

    /// Replaces a dead worker with a fresh one holding the same role and
    /// port, preserving the topology invariant. In-flight requests
    /// addressed to the dead worker are abandoned.
    fn respawn(&mut self, id: u32) {
        let Some(handle) = self.registry.remove(&id) else {
            // Already replaced, or exit raced a deliberate shutdown.
            return;
        };
        let WorkerRecord { role, port, .. } = handle.record;
        warn!(id, role = role.as_str(), port, "worker died; respawning");
        if let Err(err) = self.spawn_worker(role, port) {
            warn!(?err, role = role.as_str(), "failed to respawn worker");
        }
    }
}

fn spawn_accept_loop(listener: TcpListener, events: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let events = events.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, events).await {
                            warn!(%peer, ?err, "control connection ended with error");
                        }
                    });
                }
                Err(err) => warn!(?err, "failed to accept control connection"),
            }
        }
    });
}

/// Performs the `Hello` handshake, then pumps frames in both directions
/// until either side goes away.
async fn handle_connection(stream: TcpStream, events: mpsc::Sender<Event>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let hello = match read_message::<_, Hello>(&mut reader).await? {
        Some(hello) => hello,
        None => anyhow::bail!("connection closed before handshake"),
    };
    let id = hello.id;

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Envelope>(64);
    if events
        .send(Event::Connected { id, outbox: outbox_tx })
        .await
        .is_err()
    {
        anyhow::bail!("registry task gone");
    }

    tokio::spawn(async move {
        while let Some(envelope) = outbox_rx.recv().await {
            if let Err(err) = write_message(&mut writer, &envelope).await {
                warn!(id, ?err, "failed to deliver frame to worker");
                break;
            }
        }
    });

    loop {
        match read_message::<_, Envelope>(&mut reader).await {
            Ok(Some(envelope)) => {
                if events.send(Event::Inbound { id, envelope }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => warn!(id, ?err, "discarding malformed frame"),
        }
    }
    Ok(())
}
