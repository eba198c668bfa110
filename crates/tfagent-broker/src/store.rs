//! In-memory directory of known digital twins.
//!
//! The [`MemoryTwinStore`] is a thread-safe map from twin ID to the twin's
//! public key and current transport identity, seeded from the `[[twins]]`
//! section of the broker config.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tfagent_types::config::TwinConfig;
use tfagent_types::twin::decode_public_key;
use tfagent_types::{LookupError, PublicKey, TwinId, TwinStore, ANY_TWIN};
use tracing::debug;

/// A single known twin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinRecord {
    /// Ed25519 public key the twin authenticates with.
    pub public_key: PublicKey,
    /// Transport identity the twin is reachable at, if known.
    pub peer_id: Option<String>,
}

/// Thread-safe in-memory [`TwinStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTwinStore {
    twins: Arc<RwLock<HashMap<TwinId, TwinRecord>>>,
}

impl MemoryTwinStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from config entries.
    pub fn from_config(entries: &[TwinConfig]) -> Result<Self, LookupError> {
        let store = Self::new();
        for entry in entries {
            if entry.id == ANY_TWIN {
                return Err(LookupError::Backend(
                    "twin id 0 is reserved and cannot be registered".to_string(),
                ));
            }
            let public_key = decode_public_key(entry.id, &entry.public_key)?;
            store.insert(entry.id, public_key, entry.peer.clone());
        }
        Ok(store)
    }

    /// Register or replace a twin.
    pub fn insert(&self, twin: TwinId, public_key: PublicKey, peer_id: Option<String>) {
        let mut twins = self.twins.write().unwrap_or_else(|e| e.into_inner());
        twins.insert(
            twin,
            TwinRecord {
                public_key,
                peer_id,
            },
        );
    }

    /// Snapshot of a twin record.
    pub fn get(&self, twin: TwinId) -> Option<TwinRecord> {
        let twins = self.twins.read().unwrap_or_else(|e| e.into_inner());
        twins.get(&twin).cloned()
    }

    pub fn len(&self) -> usize {
        self.twins.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TwinStore for MemoryTwinStore {
    fn peer_id(&self, twin: TwinId) -> Result<String, LookupError> {
        let record = self.get(twin).ok_or(LookupError::NotFound(twin))?;
        record.peer_id.ok_or(LookupError::NoPeer(twin))
    }

    fn public_key(&self, twin: TwinId) -> Result<PublicKey, LookupError> {
        self.get(twin)
            .map(|record| record.public_key)
            .ok_or(LookupError::NotFound(twin))
    }

    fn set_peer_id(&self, twin: TwinId, peer_id: String) {
        let mut twins = self.twins.write().unwrap_or_else(|e| e.into_inner());
        match twins.get_mut(&twin) {
            Some(record) => {
                debug!(twin, peer = %peer_id, "Updated twin peer");
                record.peer_id = Some(peer_id);
            }
            None => debug!(twin, "Ignoring peer update for unknown twin"),
        }
    }
}
