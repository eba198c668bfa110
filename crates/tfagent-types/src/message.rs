//! Messages exchanged between digital twins and the mailbox keys used to
//! address them on the client protocol.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Digital twin identifier.
pub type TwinId = u64;

/// Wildcard twin ID, only meaningful in query filters ("any sender").
pub const ANY_TWIN: TwinId = 0;

/// Separator between the twin ID and the subject of a mailbox key.
pub const KEY_SEPARATOR: char = ':';

/// A message being sent between twins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Authenticated sender twin ID.
    pub sender: TwinId,
    /// Intended receiver twin ID.
    pub receiver: TwinId,
    /// Application-defined subject. An empty topic is a valid topic.
    pub topic: String,
    /// Absolute deadline after which the message is flushed from the
    /// receive and send buffers.
    pub ttl: DateTime<Utc>,
    /// Opaque payload, base64 encoded on the wire.
    #[serde(with = "crate::serde_compat::base64_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message that expires `ttl` from now.
    pub fn new(
        sender: TwinId,
        receiver: TwinId,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> Self {
        Self {
            sender,
            receiver,
            topic: topic.into(),
            ttl: Utc::now()
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            payload: payload.into(),
        }
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.ttl <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Mailbox predicate: addressed to `receiver`, sent by `sender`
    /// (or [`ANY_TWIN`]), on `topic` (or any topic when empty).
    pub fn matches(&self, receiver: TwinId, sender: TwinId, topic: &str) -> bool {
        self.receiver == receiver
            && (sender == ANY_TWIN || self.sender == sender)
            && (topic.is_empty() || self.topic == topic)
    }

    /// The `"<sender>:<topic>"` key returned to clients alongside the payload.
    pub fn composed_key(&self) -> String {
        MailboxKey::new(self.sender, self.topic.clone()).to_string()
    }
}

/// Errors from parsing a mailbox key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed key '{0}': missing ':' separator")]
    MissingSeparator(String),
    #[error("malformed key '{0}': more than one ':' separator")]
    ExtraSeparator(String),
    #[error("malformed key '{key}': invalid twin id: {reason}")]
    InvalidTwinId { key: String, reason: String },
    #[error("malformed key: not valid UTF-8")]
    NotUtf8,
}

/// A `"<dtid>:<subject>"` key as used by LPUSH/LPOP/LLEN/LRANGE.
///
/// The subject may be empty; it may not contain the separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxKey {
    pub twin: TwinId,
    pub subject: String,
}

impl MailboxKey {
    pub fn new(twin: TwinId, subject: impl Into<String>) -> Self {
        Self {
            twin,
            subject: subject.into(),
        }
    }

    /// Parse a key from raw protocol bytes.
    pub fn parse_bytes(raw: &[u8]) -> Result<Self, KeyError> {
        let key = std::str::from_utf8(raw).map_err(|_| KeyError::NotUtf8)?;
        key.parse()
    }
}

impl FromStr for MailboxKey {
    type Err = KeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let (twin, subject) = key
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| KeyError::MissingSeparator(key.to_string()))?;
        if subject.contains(KEY_SEPARATOR) {
            return Err(KeyError::ExtraSeparator(key.to_string()));
        }
        let twin = twin.parse::<TwinId>().map_err(|e| KeyError::InvalidTwinId {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(twin, subject))
    }
}

impl fmt::Display for MailboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.twin, KEY_SEPARATOR, self.subject)
    }
}
