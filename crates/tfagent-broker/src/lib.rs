//! Authenticated store-and-forward mailboxes for digital twins.
//!
//! ## Architecture
//!
//! - **ProtocolServer**: RESP listener, one task per client connection
//! - **ConnectionState**: Per-connection AUTH gate and mailbox commands
//! - **BufferedNode**: Delivery with timeout fallback, receive queue, retries
//! - **MemoryTwinStore**: Twin directory (public keys and peer identities)
//!
//! [`launch`] wires these together over a [`TcpTransport`] from a
//! [`BrokerConfig`].

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod node;
pub mod resp;
pub mod server;
pub mod store;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionState, Operation, Outcome};
pub use error::{BrokerError, BrokerResult, ServerError};
pub use node::{BufferedNode, Delivery, MaintenanceReport};
pub use server::ProtocolServer;
pub use store::MemoryTwinStore;

use ed25519_dalek::SigningKey;
use std::net::SocketAddr;
use std::sync::Arc;
use tfagent_types::config::BrokerConfig;
use tfagent_wire::TcpTransport;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// A started broker.
pub struct RunningBroker {
    pub node: Arc<BufferedNode>,
    pub server: Arc<ProtocolServer>,
    /// Shared with the node; updates are visible immediately.
    pub twins: MemoryTwinStore,
    accept_task: JoinHandle<Result<(), ServerError>>,
}

impl RunningBroker {
    /// Address of the client listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Transport identity of this broker.
    pub fn identity(&self) -> String {
        self.node.local_identity()
    }

    /// Wait for the accept loop to finish.
    pub async fn wait(self) -> Result<(), ServerError> {
        self.accept_task
            .await
            .map_err(|e| ServerError::Task(e.to_string()))?
    }
}

/// Start a broker from `config`, loading or generating its identity key.
pub async fn launch(
    config: &BrokerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<RunningBroker, ServerError> {
    let key = crypto::load_or_generate_key(config.identity_key.as_deref())?;
    launch_with_key(config, &key, shutdown).await
}

/// Start a broker from `config` under the identity `key`.
pub async fn launch_with_key(
    config: &BrokerConfig,
    key: &SigningKey,
    shutdown: watch::Receiver<bool>,
) -> Result<RunningBroker, ServerError> {
    let twins = MemoryTwinStore::from_config(&config.twins)?;
    let transport = Arc::new(TcpTransport::new(config.transport.clone()));
    let node = Arc::new(BufferedNode::new(
        Arc::new(twins.clone()),
        transport,
        config.node.clone(),
        shutdown.clone(),
    ));
    node.start(key).await?;

    let (server, accept_task) = ProtocolServer::start(
        config.listen_addr,
        Arc::clone(&node),
        Arc::new(twins.clone()),
        shutdown,
    )
    .await?;

    info!(
        listen = %server.local_addr(),
        peer = %node.local_identity(),
        twins = twins.len(),
        "Broker started"
    );

    Ok(RunningBroker {
        node,
        server,
        twins,
        accept_task,
    })
}
