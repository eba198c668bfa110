//! Test doubles shared by the unit tests.

use crate::node::BufferedNode;
use crate::store::MemoryTwinStore;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tfagent_types::config::NodeConfig;
use tfagent_types::{Message, TwinId};
use tfagent_wire::{PeerAddr, PeerTransport, TransportError};
use tokio::sync::{mpsc, watch};

pub const LOCAL: &str = "1111111111111111111111111111111111111111111111111111111111111111";
pub const REMOTE: &str = "2222222222222222222222222222222222222222222222222222222222222222";
pub const OTHER_REMOTE: &str = "3333333333333333333333333333333333333333333333333333333333333333";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Deliver,
    Timeout,
    Refuse,
}

/// Transport that records sends and fails on demand.
pub struct MockTransport {
    mode: Mutex<Mode>,
    /// Node ids that hang for the whole send timeout.
    stalled: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<PeerAddr>>,
    sent: Mutex<Vec<(Message, PeerAddr)>>,
    inbound: Mutex<Option<mpsc::Sender<Message>>>,
}

impl MockTransport {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            stalled: Mutex::new(HashSet::new()),
            attempts: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
        })
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn stall(&self, node_id: &str) {
        self.stalled.lock().unwrap().insert(node_id.to_string());
    }

    /// Every peer a send was attempted to, in order.
    pub fn attempts(&self) -> Vec<PeerAddr> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(Message, PeerAddr)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn inbound(&self) -> mpsc::Sender<Message> {
        self.inbound.lock().unwrap().clone().unwrap()
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn start(
        &self,
        _key: &SigningKey,
        inbound: mpsc::Sender<Message>,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        *self.inbound.lock().unwrap() = Some(inbound);
        Ok(())
    }

    async fn send(
        &self,
        message: &Message,
        peer: &PeerAddr,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.attempts.lock().unwrap().push(peer.clone());
        let stalled = self.stalled.lock().unwrap().contains(&peer.node_id);
        if stalled {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::DeadlineExceeded {
                peer: peer.to_string(),
                timeout,
            });
        }

        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Deliver => {
                self.sent
                    .lock()
                    .unwrap()
                    .push((message.clone(), peer.clone()));
                Ok(())
            }
            Mode::Timeout => Err(TransportError::DeadlineExceeded {
                peer: peer.to_string(),
                timeout,
            }),
            Mode::Refuse => Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            ))),
        }
    }

    fn local_identity(&self) -> String {
        format!("{LOCAL}@127.0.0.1:7000")
    }
}

/// Twins 7 and 9 live on the local node, 20 and 30 on two remote ones,
/// 21 has a broken peer id and 22 none at all.
pub fn twin_store() -> MemoryTwinStore {
    let store = MemoryTwinStore::new();
    store.insert(7, [7u8; 32], Some(format!("{LOCAL}@127.0.0.1:7000")));
    store.insert(9, [9u8; 32], Some(format!("{LOCAL}@127.0.0.1:7000")));
    store.insert(20, [20u8; 32], Some(format!("{REMOTE}@127.0.0.1:7001")));
    store.insert(21, [21u8; 32], Some("garbage".to_string()));
    store.insert(22, [22u8; 32], None);
    store.insert(30, [30u8; 32], Some(format!("{OTHER_REMOTE}@127.0.0.1:7002")));
    store
}

/// A node over [`twin_store`] and `transport`, plus its shutdown switch.
pub fn node(
    twins: MemoryTwinStore,
    transport: Arc<MockTransport>,
) -> (Arc<BufferedNode>, watch::Sender<bool>) {
    node_with_config(twins, transport, NodeConfig::default())
}

pub fn node_with_config(
    twins: MemoryTwinStore,
    transport: Arc<MockTransport>,
    config: NodeConfig,
) -> (Arc<BufferedNode>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = BufferedNode::new(Arc::new(twins), transport, config, shutdown_rx);
    (Arc::new(node), shutdown_tx)
}

pub fn message(sender: TwinId, receiver: TwinId, topic: &str, payload: &str) -> Message {
    Message::new(
        sender,
        receiver,
        topic,
        payload.as_bytes().to_vec(),
        chrono::Duration::hours(1),
    )
}
