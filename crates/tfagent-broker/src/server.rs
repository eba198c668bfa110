//! Client-facing RESP listener.
//!
//! One task per accepted connection. Each connection owns its
//! [`ConnectionState`]; commands are dispatched against the shared
//! [`BufferedNode`] and answered with one reply each.

use crate::connection::{ConnectionState, Operation, Outcome};
use crate::error::{BrokerError, ServerError};
use crate::node::BufferedNode;
use crate::resp::{self, Command, Reply, RespError};
use std::net::SocketAddr;
use std::sync::Arc;
use tfagent_types::{Message, TwinStore};
use tfagent_wire::shutdown_requested;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Server name reported by HELLO.
pub const SERVER_NAME: &str = "tfagent";

/// Protocol revision reported by HELLO.
pub const PROTOCOL_VERSION: i64 = 1;

/// Client protocol server.
pub struct ProtocolServer {
    node: Arc<BufferedNode>,
    twins: Arc<dyn TwinStore>,
    local_addr: SocketAddr,
}

impl ProtocolServer {
    /// Bind `listen_addr` and spawn the accept loop.
    ///
    /// The returned handle resolves once shutdown is requested, or with
    /// [`ServerError::Accept`] if the listener fails.
    pub async fn start(
        listen_addr: SocketAddr,
        node: Arc<BufferedNode>,
        twins: Arc<dyn TwinStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, JoinHandle<Result<(), ServerError>>), ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: listen_addr,
            source,
        };
        let listener = TcpListener::bind(listen_addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let server = Arc::new(Self {
            node,
            twins,
            local_addr,
        });
        info!(listen = %local_addr, "Protocol server listening");

        let handle = tokio::spawn(Arc::clone(&server).accept_loop(listener, shutdown));
        Ok((server, handle))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Protocol server: shutdown signal received");
                    return Ok(());
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(client = %peer, "Accepted client connection");
                    let server = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer, shutdown).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Protocol server: accept failed");
                    return Err(ServerError::Accept(e));
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut state = ConnectionState::default();

        loop {
            let command = tokio::select! {
                command = resp::read_command(&mut reader) => command,
                _ = shutdown_requested(&mut shutdown) => {
                    debug!(client = %peer, "Closing client connection on shutdown");
                    return;
                }
            };

            let reply = match command {
                Ok(command) => self.dispatch(&mut state, &command).await,
                Err(e @ RespError::Protocol(_)) => {
                    debug!(client = %peer, error = %e, "Malformed request");
                    Reply::error(e)
                }
                Err(RespError::Closed) => {
                    debug!(client = %peer, twin = ?state.twin(), "Client disconnected");
                    return;
                }
                Err(RespError::Io(e)) => {
                    warn!(client = %peer, error = %e, "Client read failed");
                    return;
                }
            };

            if let Err(e) = resp::write_reply(&mut writer, &reply).await {
                error!(client = %peer, error = %e, "Failed to write reply");
                return;
            }
        }
    }

    /// Run one command against `state`, binding the connection on a
    /// successful AUTH.
    pub async fn dispatch(&self, state: &mut ConnectionState, command: &Command) -> Reply {
        let name = command.name();
        match name.as_str() {
            "PING" => match command.args() {
                [] => Reply::simple("PONG"),
                [echo] => Reply::bulk(echo.clone()),
                _ => Reply::error(BrokerError::InvalidArgCount("ping".to_string())),
            },
            "HELLO" if command.args().is_empty() => self.hello(),
            "HELLO" => Reply::error(BrokerError::InvalidArgCount("hello".to_string())),
            _ => {
                let result = match Operation::parse(&name, command.args()) {
                    Ok(op) => state.execute(op, &self.node, self.twins.as_ref()).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(Outcome::Authenticated(twin)) => {
                        *state = ConnectionState::Authenticated(twin);
                        Reply::simple("Authenticated")
                    }
                    Ok(outcome) => outcome_reply(outcome),
                    Err(e) => {
                        debug!(command = %name, twin = ?state.twin(), error = %e, "Command failed");
                        Reply::error(e)
                    }
                }
            }
        }
    }

    fn hello(&self) -> Reply {
        Reply::Array(vec![
            Reply::bulk("server"),
            Reply::bulk(SERVER_NAME),
            Reply::bulk("version"),
            Reply::bulk(env!("CARGO_PKG_VERSION")),
            Reply::bulk("proto"),
            Reply::Integer(PROTOCOL_VERSION),
            Reply::bulk("id"),
            Reply::bulk(self.node.local_identity()),
        ])
    }
}

fn outcome_reply(outcome: Outcome) -> Reply {
    match outcome {
        Outcome::Authenticated(_) => Reply::simple("Authenticated"),
        Outcome::Pushed(_) => Reply::simple("OK"),
        Outcome::Popped(Some(message)) => Reply::Array(Vec::from(entry(message))),
        Outcome::Popped(None) => Reply::Nil,
        Outcome::Length(count) => Reply::Integer(i64::try_from(count).unwrap_or(i64::MAX)),
        Outcome::Range(messages) => Reply::Array(messages.into_iter().flat_map(entry).collect()),
    }
}

/// `[composed key, payload]` for one message.
fn entry(message: Message) -> [Reply; 2] {
    [Reply::bulk(message.composed_key()), Reply::Bulk(message.payload)]
}
