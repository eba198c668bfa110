//! Store-and-forward layer over the peer transport.
//!
//! Sending resolves the receiver twin to a transport identity and tries a
//! direct delivery. A delivery that runs into its deadline is queued for
//! retry and reported as success. Inbound messages are drained from the
//! transport into a receive queue which authenticated connections query
//! as their mailbox.
//!
//! A maintenance loop re-attempts queued sends and evicts expired messages
//! from both queues. Queries never return expired messages, even between
//! sweeps.

use crate::error::{BrokerError, BrokerResult};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tfagent_types::config::NodeConfig;
use tfagent_types::{Message, TwinId, TwinStore};
use tfagent_wire::{shutdown_requested, PeerAddr, PeerTransport, TransportError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How a successful [`BufferedNode::send`] was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the receiver's broker.
    Sent,
    /// The receiver lives on this broker; appended to the receive queue.
    Local,
    /// The delivery deadline passed; kept in the retry queue.
    Queued,
    /// The message TTL had already passed; dropped.
    Expired,
}

/// Counters from one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired messages evicted from the receive queue.
    pub evicted_received: usize,
    /// Expired messages dropped from the retry queue.
    pub evicted_pending: usize,
    /// Queued messages delivered on this pass.
    pub redelivered: usize,
    /// Queued messages that failed again and were put back.
    pub requeued: usize,
}

/// Store-and-forward node.
pub struct BufferedNode {
    transport: Arc<dyn PeerTransport>,
    twins: Arc<dyn TwinStore>,
    config: NodeConfig,
    /// Receive queue, in arrival order.
    received: Mutex<Vec<Message>>,
    /// Retry queue, in enqueue order.
    pending: Mutex<VecDeque<Message>>,
    shutdown: watch::Receiver<bool>,
}

impl BufferedNode {
    pub fn new(
        twins: Arc<dyn TwinStore>,
        transport: Arc<dyn PeerTransport>,
        config: NodeConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            twins,
            config,
            received: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            shutdown,
        }
    }

    /// Start draining inbound messages and the maintenance loop, then bring
    /// up the transport under `key`.
    pub async fn start(self: &Arc<Self>, key: &SigningKey) -> BrokerResult<()> {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_buffer.max(1));

        let node = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { node.drain_inbound(inbound_rx, shutdown).await });

        self.transport
            .start(key, inbound_tx, self.shutdown.clone())
            .await?;

        let node = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { node.maintenance_loop(shutdown).await });

        info!(
            peer = %self.local_identity(),
            send_timeout_secs = self.config.send_timeout_secs,
            "Buffered node started"
        );
        Ok(())
    }

    /// Identity of the underlying transport.
    pub fn local_identity(&self) -> String {
        self.transport.local_identity()
    }

    /// Lifetime applied to messages pushed by clients.
    pub fn message_ttl(&self) -> chrono::Duration {
        self.config.message_ttl()
    }

    /// Send a message to its receiver.
    ///
    /// A delivery that exceeds the send timeout is queued and reported as
    /// [`Delivery::Queued`]. Any other failure is returned.
    pub async fn send(&self, message: Message) -> BrokerResult<Delivery> {
        if *self.shutdown.borrow() {
            return Err(BrokerError::Cancelled);
        }
        if message.is_expired() {
            debug!(
                sender = message.sender,
                receiver = message.receiver,
                "Dropping expired message"
            );
            return Ok(Delivery::Expired);
        }

        match self.deliver(&message).await {
            Err(BrokerError::Transport(TransportError::DeadlineExceeded { peer, .. })) => {
                info!(
                    receiver = message.receiver,
                    peer = %peer,
                    "Delivery timed out, queueing message for retry"
                );
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_back(message);
                Ok(Delivery::Queued)
            }
            other => other,
        }
    }

    /// One delivery attempt, without any queueing.
    async fn deliver(&self, message: &Message) -> BrokerResult<Delivery> {
        let peer_id = self
            .twins
            .peer_id(message.receiver)
            .map_err(BrokerError::UnknownRecipient)?;
        let peer: PeerAddr = peer_id
            .parse()
            .map_err(|e: TransportError| BrokerError::InvalidPeerId(e.to_string()))?;

        if self.is_local(&peer) {
            self.receive(message.clone());
            return Ok(Delivery::Local);
        }

        match self
            .transport
            .send(message, &peer, self.config.send_timeout())
            .await
        {
            Ok(()) => Ok(Delivery::Sent),
            Err(TransportError::Cancelled) => Err(BrokerError::Cancelled),
            Err(e) => Err(BrokerError::Transport(e)),
        }
    }

    fn is_local(&self, peer: &PeerAddr) -> bool {
        self.local_identity()
            .parse::<PeerAddr>()
            .map(|local| local.node_id == peer.node_id)
            .unwrap_or(false)
    }

    /// Node id `twin` resolves to, if it resolves at all.
    fn peer_node_of(&self, twin: TwinId) -> Option<String> {
        let peer_id = self.twins.peer_id(twin).ok()?;
        peer_id.parse::<PeerAddr>().ok().map(|peer| peer.node_id)
    }

    fn hosts(&self, twin: TwinId) -> bool {
        let local = self.local_identity().parse::<PeerAddr>().ok();
        match (local, self.peer_node_of(twin)) {
            (Some(local), Some(node_id)) => local.node_id == node_id,
            _ => false,
        }
    }

    /// Append an arriving message to the receive queue.
    ///
    /// Only messages for twins hosted here are kept, and their lifetime is
    /// cut to this node's own message TTL.
    fn receive(&self, mut message: Message) {
        let now = Utc::now();
        if message.is_expired_at(now) {
            debug!(
                sender = message.sender,
                receiver = message.receiver,
                "Dropping expired inbound message"
            );
            return;
        }
        if !self.hosts(message.receiver) {
            debug!(
                sender = message.sender,
                receiver = message.receiver,
                "Dropping inbound message for a twin not hosted here"
            );
            return;
        }

        let limit = now
            .checked_add_signed(self.message_ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        message.ttl = message.ttl.min(limit);
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    async fn drain_inbound(
        &self,
        mut inbound: mpsc::Receiver<Message>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.receive(message),
                    None => {
                        debug!("Inbound channel closed");
                        return;
                    }
                },
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Inbound drain: shutdown signal received");
                    return;
                }
            }
        }
    }

    async fn maintenance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.maintenance_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Maintenance loop: shutdown signal received");
                    return;
                }
            }
            let report = self.run_maintenance().await;
            if report != MaintenanceReport::default() {
                debug!(?report, "Maintenance pass");
            }
        }
    }

    /// Evict expired messages and re-attempt every queued send.
    ///
    /// Queued messages are retried per destination node, all nodes at once.
    /// Once a node times out, its remaining messages wait for the next pass.
    /// Messages that fail again go back to the front of the retry queue in
    /// their original order, ahead of anything queued while this pass ran.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let now = Utc::now();
        let mut report = MaintenanceReport::default();

        {
            let mut received = self.received.lock().unwrap_or_else(|e| e.into_inner());
            let before = received.len();
            received.retain(|m| !m.is_expired_at(now));
            report.evicted_received = before - received.len();
        }

        let batch: Vec<Message> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        let mut groups: Vec<Vec<(usize, Message)>> = Vec::new();
        let mut by_node: HashMap<Option<String>, usize> = HashMap::new();
        for (position, message) in batch.into_iter().enumerate() {
            if message.is_expired_at(now) {
                report.evicted_pending += 1;
                continue;
            }
            let group = *by_node
                .entry(self.peer_node_of(message.receiver))
                .or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
            groups[group].push((position, message));
        }

        let attempts = groups.into_iter().map(|group| self.redeliver(group));
        let mut failed = Vec::new();
        for (delivered, mut requeue) in futures::future::join_all(attempts).await {
            report.redelivered += delivered;
            failed.append(&mut requeue);
        }

        if !failed.is_empty() {
            failed.sort_by_key(|(position, _)| *position);
            report.requeued = failed.len();
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            for (_, message) in failed.into_iter().rev() {
                pending.push_front(message);
            }
        }

        if report.evicted_received + report.evicted_pending > 0 {
            warn!(
                received = report.evicted_received,
                pending = report.evicted_pending,
                "Evicted expired messages"
            );
        }
        report
    }

    /// Retry one destination's messages in order. Returns the number
    /// delivered and the messages to put back.
    async fn redeliver(&self, group: Vec<(usize, Message)>) -> (usize, Vec<(usize, Message)>) {
        let mut delivered = 0;
        let mut failed = Vec::new();
        let mut timed_out = false;
        for (position, message) in group {
            if timed_out {
                failed.push((position, message));
                continue;
            }
            match self.deliver(&message).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    timed_out = matches!(
                        e,
                        BrokerError::Transport(TransportError::DeadlineExceeded { .. })
                    );
                    debug!(receiver = message.receiver, error = %e, "Redelivery failed");
                    failed.push((position, message));
                }
            }
        }
        (delivered, failed)
    }

    /// Remove and return the oldest matching message for `receiver`.
    ///
    /// `sender == 0` matches any sender, an empty `topic` any topic.
    pub fn pop(&self, receiver: TwinId, sender: TwinId, topic: &str) -> Option<Message> {
        let now = Utc::now();
        let mut received = self.received.lock().unwrap_or_else(|e| e.into_inner());
        let index = received
            .iter()
            .position(|m| is_visible(m, now, receiver, sender, topic))?;
        Some(received.remove(index))
    }

    /// Number of matching messages for `receiver`.
    pub fn length(&self, receiver: TwinId, sender: TwinId, topic: &str) -> usize {
        let now = Utc::now();
        let received = self.received.lock().unwrap_or_else(|e| e.into_inner());
        received
            .iter()
            .filter(|m| is_visible(m, now, receiver, sender, topic))
            .count()
    }

    /// Matching messages at positions `start..=end` of the matching subset,
    /// without removing them. Negative positions count from the end.
    pub fn range(
        &self,
        receiver: TwinId,
        sender: TwinId,
        topic: &str,
        start: i64,
        end: i64,
    ) -> Vec<Message> {
        let now = Utc::now();
        let received = self.received.lock().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<&Message> = received
            .iter()
            .filter(|m| is_visible(m, now, receiver, sender, topic))
            .collect();
        match window(matching.len(), start, end) {
            Some((first, last)) => matching[first..=last]
                .iter()
                .map(|m| (*m).clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of the retry queue.
    pub fn pending_sends(&self) -> Vec<Message> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Number of messages in the receive queue, all receivers included.
    pub fn pending_receives(&self) -> usize {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn is_visible(
    message: &Message,
    now: DateTime<Utc>,
    receiver: TwinId,
    sender: TwinId,
    topic: &str,
) -> bool {
    !message.is_expired_at(now) && message.matches(receiver, sender, topic)
}

/// Resolve an inclusive `start..=end` window over `len` items, Redis style.
fn window(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if start > end || start >= len || end < 0 {
        return None;
    }
    Some((start as usize, end as usize))
}
