//! Broker error types.
//!
//! Every [`BrokerError`] variant is recoverable at the command level: the
//! server turns it into an `ERR` reply and keeps the connection open.
//! [`ServerError`] covers the failures that stop the broker.

use std::net::SocketAddr;
use tfagent_types::{KeyError, LookupError, TwinId};
use tfagent_wire::TransportError;
use thiserror::Error;

/// Command-level broker error.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The command name is not part of the protocol.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Wrong number of arguments for the command.
    #[error("invalid amount of arguments for '{0}'")]
    InvalidArgCount(String),

    /// An argument has the wrong shape (e.g. a non-integer bound).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The signature is neither 64 raw bytes nor 128 hex characters.
    #[error("invalid signature length {0}, expected 64 raw bytes or 128 hex characters")]
    InvalidSignatureLength(usize),

    /// A 128-byte signature that does not decode as hex.
    #[error("invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    /// The signature does not verify against the twin's key.
    #[error("authentication failed for twin {0}")]
    AuthenticationFailed(TwinId),

    /// A mailbox command on an unauthenticated connection.
    #[error("command requires authentication")]
    NotAuthenticated,

    /// AUTH on a connection already bound to a twin.
    #[error("already authenticated as twin {0}")]
    AlreadyAuthenticated(TwinId),

    /// The mailbox key could not be parsed.
    #[error(transparent)]
    MalformedKey(#[from] KeyError),

    /// Twin ID 0 used where an actual twin is required.
    #[error("twin id 0 is reserved as a wildcard")]
    ReservedTwinId,

    /// Public key lookup failed during AUTH.
    #[error("could not get public key: {0}")]
    Lookup(LookupError),

    /// The receiver of a message could not be resolved to a peer.
    #[error("could not load receiver peer: {0}")]
    UnknownRecipient(LookupError),

    /// The resolved transport identity is not a valid peer address.
    #[error("invalid receiver peer id: {0}")]
    InvalidPeerId(String),

    /// Delivery failed for a reason other than a timeout.
    #[error("could not send message: {0}")]
    Transport(#[from] TransportError),

    /// The broker is shutting down.
    #[error("broker is shutting down")]
    Cancelled,

    /// The identity key could not be loaded.
    #[error("identity key: {0}")]
    IdentityKey(String),
}

/// Alias for Result with BrokerError.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Fatal broker startup or listener failure.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("invalid twin directory: {0}")]
    Twins(#[from] LookupError),

    #[error("failed to start node: {0}")]
    Node(#[from] BrokerError),

    #[error("accept task failed: {0}")]
    Task(String),
}
