//! Notify channel listener
//!
//! The client binds a local endpoint and the host connects to it to push
//! commands. Every accepted connection gets a reader task feeding a single
//! bounded queue that the sync loop drains.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use stagelink_protocol::{Endpoint, Multipart, MultipartCodec};
use stagelink_utils::{Result, StagelinkError};

/// Messages buffered between connection readers and the sync loop
const QUEUE_DEPTH: usize = 256;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How the host uses the notify channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Fire-and-forget pushes
    #[default]
    Pull,
    /// Every message is answered before the next one is read
    Reply,
}

impl ChannelRole {
    pub fn can_reply(self) -> bool {
        matches!(self, ChannelRole::Reply)
    }
}

/// Answers one inbound message
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Multipart>,
}

impl Responder {
    /// Send the reply; `false` if the connection is already gone
    pub fn send(self, reply: Multipart) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// A message received on the notify channel
#[derive(Debug)]
pub struct Inbound {
    pub frames: Multipart,
    /// Present only in the reply-capable role
    pub reply: Option<Responder>,
}

impl Inbound {
    /// Message that expects no answer
    pub fn fire_and_forget(frames: Multipart) -> Self {
        Self { frames, reply: None }
    }

    /// Message carrying a responder, plus the receiving end of its reply
    pub fn with_responder(frames: Multipart) -> (Self, oneshot::Receiver<Multipart>) {
        let (tx, rx) = oneshot::channel();
        let inbound = Self {
            frames,
            reply: Some(Responder { tx }),
        };
        (inbound, rx)
    }
}

/// Listening notify endpoint
///
/// Owns `cancel`: dropping the listener cancels it, which stops the accept
/// loop and every connection reader.
pub struct NotifyListener {
    address: Endpoint,
    role: ChannelRole,
    inbound_rx: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
}

impl NotifyListener {
    /// Bind `endpoint` (TCP only) and start accepting host connections
    pub async fn bind(endpoint: &Endpoint, role: ChannelRole, cancel: CancellationToken) -> Result<Self> {
        let addr = endpoint.socket_addr().ok_or_else(|| {
            StagelinkError::config(format!("notify channel must bind a TCP endpoint, got {}", endpoint))
        })?;

        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            StagelinkError::connection(format!("Failed to bind notify channel on {}: {}", addr, e))
        })?;
        let address = announced_address(listener.local_addr()?);

        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(accept_loop(listener, role, inbound_tx, cancel.clone()));

        info!(%address, ?role, "Notify channel listening");
        Ok(Self {
            address,
            role,
            inbound_rx,
            cancel,
        })
    }

    /// Address the host should connect to
    pub fn address(&self) -> &Endpoint {
        &self.address
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Take the next inbound message
    ///
    /// With `block` set, waits until a message arrives or the listener is
    /// cancelled. Otherwise returns `None` right away when nothing is queued.
    pub async fn poll(&mut self, block: bool) -> Option<Inbound> {
        if block {
            return tokio::select! {
                _ = self.cancel.cancelled() => None,
                inbound = self.inbound_rx.recv() => inbound,
            };
        }

        match self.inbound_rx.try_recv() {
            Ok(inbound) => Some(inbound),
            Err(_) => {
                // Give connection readers a turn before reporting an empty queue
                tokio::task::yield_now().await;
                self.inbound_rx.try_recv().ok()
            }
        }
    }
}

impl Drop for NotifyListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Address to hand to the host for a bound socket
fn announced_address(local: SocketAddr) -> Endpoint {
    let ip = if local.ip().is_unspecified() {
        IpAddr::from([127, 0, 0, 1])
    } else {
        local.ip()
    };
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    };
    Endpoint::Tcp {
        host,
        port: local.port(),
    }
}

async fn accept_loop(
    listener: TcpListener,
    role: ChannelRole,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "Host connected to notify channel");
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_connection(
                    stream,
                    peer.to_string(),
                    role,
                    inbound_tx.clone(),
                    cancel.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept notify connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("Notify accept loop stopped");
}

/// Read messages from one host connection into the queue
async fn serve_connection<S>(
    stream: S,
    peer: String,
    role: ChannelRole,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, MultipartCodec::new());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => next,
        };

        let frames = match next {
            Some(Ok(frames)) => frames,
            Some(Err(e)) => {
                warn!(%peer, error = %e, "Notify connection error");
                break;
            }
            None => {
                debug!(%peer, "Host closed notify connection");
                break;
            }
        };
        trace!(%peer, frames = frames.len(), bytes = frames.byte_len(), "Notify message received");

        if !role.can_reply() {
            if inbound_tx.send(Inbound::fire_and_forget(frames)).await.is_err() {
                break;
            }
            continue;
        }

        // Strict alternation: the reply goes out before the next read
        let (inbound, reply_rx) = Inbound::with_responder(frames);
        if inbound_tx.send(inbound).await.is_err() {
            break;
        }
        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            reply = reply_rx => reply,
        };
        match reply {
            Ok(reply) => {
                if let Err(e) = framed.send(reply).await {
                    warn!(%peer, error = %e, "Failed to send notify reply");
                    break;
                }
            }
            Err(_) => trace!(%peer, "Message left unanswered"),
        }
    }
}
