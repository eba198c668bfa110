//! One-message-per-stream delivery between brokers.
//!
//! A [`TcpTransport`] binds a local TCP listener and accepts one message per
//! inbound connection, publishing it on the inbound channel handed to
//! [`PeerTransport::start`]. Outbound, every [`PeerTransport::send`] opens a
//! fresh connection, writes the stream header and the message, and closes.
//!
//! No retries happen here; the buffered node owns retry policy.

use crate::message::*;
use crate::peer::PeerAddr;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tfagent_types::config::TransportConfig;
use tfagent_types::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Upper bound on the time an inbound stream may take to deliver its message.
const INBOUND_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the peer transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is shutting down")]
    Cancelled,
    #[error("delivery to {peer} exceeded the {timeout:?} deadline")]
    DeadlineExceeded { peer: String, timeout: Duration },
    #[error("transport not started")]
    NotStarted,
    #[error("transport already started")]
    AlreadyStarted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("frame too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("unexpected protocol '{0}'")]
    ProtocolMismatch(String),
    #[error("stream addressed to node {0}")]
    WrongRecipient(String),
    #[error("invalid peer address '{addr}': {reason}")]
    InvalidPeerAddr { addr: String, reason: String },
}

/// Capability to move messages between brokers.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Bring up the transport under the identity `key`, publishing every
    /// received message on `inbound` until `shutdown` flips.
    async fn start(
        &self,
        key: &SigningKey,
        inbound: mpsc::Sender<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError>;

    /// Deliver one message to `peer` within `timeout`.
    async fn send(
        &self,
        message: &Message,
        peer: &PeerAddr,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Identity string of the local node, empty before start.
    fn local_identity(&self) -> String;
}

/// Wait until `shutdown` carries `true`.
///
/// Never completes if the sending side is dropped without signalling.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

struct Running {
    identity: PeerAddr,
    shutdown: watch::Receiver<bool>,
}

/// TCP implementation of [`PeerTransport`].
pub struct TcpTransport {
    config: TransportConfig,
    running: OnceLock<Running>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            running: OnceLock::new(),
        }
    }

    /// Identity of the started transport.
    pub fn identity(&self) -> Option<&PeerAddr> {
        self.running.get().map(|r| &r.identity)
    }

    /// Accept loop, run in a spawned task.
    async fn accept_loop(
        listener: TcpListener,
        node_id: String,
        inbound: mpsc::Sender<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown_requested(&mut shutdown) => {
                    info!("peer transport: shutdown signal received");
                    return;
                }
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "peer transport: accepted stream");
                    let node_id = node_id.clone();
                    let inbound = inbound.clone();
                    tokio::spawn(async move {
                        let handled = tokio::time::timeout(
                            INBOUND_READ_TIMEOUT,
                            Self::handle_inbound(stream, &node_id, &inbound),
                        )
                        .await;
                        match handled {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(peer = %addr, error = %e, "peer transport: dropped stream")
                            }
                            Err(_) => debug!(peer = %addr, "peer transport: stream timed out"),
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "peer transport: accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Read the header and exactly one message from an inbound stream.
    async fn handle_inbound(
        mut stream: TcpStream,
        node_id: &str,
        inbound: &mpsc::Sender<Message>,
    ) -> Result<(), TransportError> {
        let header: StreamHeader = read_frame(&mut stream).await?;
        if header.protocol != PROTOCOL_ID {
            return Err(TransportError::ProtocolMismatch(header.protocol));
        }
        if header.to != node_id {
            return Err(TransportError::WrongRecipient(header.to));
        }

        let message: Message = read_frame(&mut stream).await?;
        debug!(
            from = %header.from,
            sender = message.sender,
            receiver = message.receiver,
            "peer transport: received message"
        );
        inbound
            .send(message)
            .await
            .map_err(|_| TransportError::Cancelled)
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn start(
        &self,
        key: &SigningKey,
        inbound: mpsc::Sender<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        if self.running.get().is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let bound: SocketAddr = listener.local_addr()?;
        let identity = PeerAddr::from_key(
            &key.verifying_key(),
            self.config.advertise_addr.unwrap_or(bound),
        );
        let node_id = identity.node_id.clone();

        self.running
            .set(Running {
                identity: identity.clone(),
                shutdown: shutdown.clone(),
            })
            .map_err(|_| TransportError::AlreadyStarted)?;

        info!(peer = %identity, listen = %bound, "peer transport: listening");
        tokio::spawn(Self::accept_loop(listener, node_id, inbound, shutdown));
        Ok(())
    }

    async fn send(
        &self,
        message: &Message,
        peer: &PeerAddr,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let running = self.running.get().ok_or(TransportError::NotStarted)?;
        let mut shutdown = running.shutdown.clone();
        if *shutdown.borrow() {
            return Err(TransportError::Cancelled);
        }

        let header = StreamHeader::new(running.identity.node_id.clone(), peer.node_id.clone());
        let deliver = async {
            let mut stream = TcpStream::connect(peer.addr).await?;
            write_frame(&mut stream, &header).await?;
            write_frame(&mut stream, message).await?;
            stream.shutdown().await?;
            Ok::<(), TransportError>(())
        };

        let result = tokio::select! {
            delivered = tokio::time::timeout(timeout, deliver) => match delivered {
                Ok(result) => result,
                Err(_) => Err(TransportError::DeadlineExceeded {
                    peer: peer.to_string(),
                    timeout,
                }),
            },
            _ = shutdown_requested(&mut shutdown) => Err(TransportError::Cancelled),
        };

        match &result {
            Ok(()) => debug!(peer = %peer, "peer transport: sent message"),
            Err(e) => warn!(peer = %peer, error = %e, "peer transport: could not send message"),
        }
        result
    }

    fn local_identity(&self) -> String {
        self.identity().map(ToString::to_string).unwrap_or_default()
    }
}

/// Write a framed value (4-byte length + JSON).
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_frame(value)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed value (4-byte length + JSON).
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed);
        }
        Err(e) => return Err(TransportError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    Ok(decode_frame(&body)?)
}
