//! Worker-side control channel to the primary.
//!
//! Every worker opens one TCP connection to the primary's loopback control
//! socket, identifies itself with a [`Hello`] frame, and then exchanges
//! [`Envelope`] frames. The connection is split into an outbound writer
//! task and an inbound reader task so callers deal only with channels.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::message::{Envelope, Hello, read_message, write_message};

/// Channel pair for a live control connection. When `inbound` yields `None`
/// the primary is gone and the worker should exit; it will be respawned by
/// a new primary, never adopted.
pub struct Control {
    pub inbound: mpsc::Receiver<Envelope>,
    pub outbound: mpsc::Sender<Envelope>,
}

pub async fn connect(addr: SocketAddr) -> Result<Control> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to reach control socket at {addr}"))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(&mut writer, &Hello { id: std::process::id() })
        .await
        .context("failed to send control handshake")?;
    debug!(%addr, "control channel established");

    let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(64);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(64);

    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if let Err(err) = write_message(&mut writer, &envelope).await {
                warn!(?err, "control write failed; dropping connection");
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match read_message::<_, Envelope>(&mut reader).await {
                Ok(Some(envelope)) => {
                    if inbound_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                // A bad frame is discarded; the stream itself is still good.
                Err(err) => warn!(?err, "discarding malformed control frame"),
            }
        }
    });

    Ok(Control {
        inbound: inbound_rx,
        outbound: outbound_tx,
    })
}
