//! Core types and traits for the tfagent twin message broker.
//!
//! This crate defines the data shared between the peer transport, the
//! buffered node and the client protocol server. It contains no I/O.

pub mod config;
pub mod message;
pub mod serde_compat;
pub mod twin;

pub use message::{KeyError, MailboxKey, Message, TwinId, ANY_TWIN, KEY_SEPARATOR};
pub use twin::{LookupError, PublicKey, TwinStore, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
