//! Per-connection authorization state.
//!
//! Every client connection starts [`ConnectionState::Unauthenticated`]. The
//! only transition is a successful AUTH, after which the server replaces
//! the state with [`ConnectionState::Authenticated`] bound to that twin. The
//! bound twin is the implicit receiver of every mailbox query.

use crate::crypto::{decode_signature, signature_valid};
use crate::error::{BrokerError, BrokerResult};
use crate::node::{BufferedNode, Delivery};
use tfagent_types::{MailboxKey, Message, TwinId, TwinStore, ANY_TWIN};
use tracing::{debug, info, warn};

/// Authorization state of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unauthenticated,
    Authenticated(TwinId),
}

/// A mailbox-surface command with its raw arguments.
///
/// Arguments stay unparsed until the state allows the command, so an
/// unauthenticated connection is refused before its arguments are looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    Auth { twin: &'a [u8], signature: &'a [u8] },
    Push { key: &'a [u8], payload: &'a [u8] },
    Pop { key: &'a [u8] },
    Len { key: &'a [u8] },
    Range { key: &'a [u8], start: &'a [u8], end: &'a [u8] },
}

impl<'a> Operation<'a> {
    /// Build an operation from an upper-case command name and its
    /// arguments (the name excluded).
    pub fn parse(name: &str, args: &'a [Vec<u8>]) -> BrokerResult<Self> {
        let op = match (name, args) {
            ("AUTH", [twin, signature]) => Operation::Auth {
                twin: twin.as_slice(),
                signature: signature.as_slice(),
            },
            ("LPUSH", [key, payload]) => Operation::Push {
                key: key.as_slice(),
                payload: payload.as_slice(),
            },
            ("LPOP", [key]) => Operation::Pop { key: key.as_slice() },
            ("LLEN", [key]) => Operation::Len { key: key.as_slice() },
            ("LRANGE", [key, start, end]) => Operation::Range {
                key: key.as_slice(),
                start: start.as_slice(),
                end: end.as_slice(),
            },
            ("AUTH" | "LPUSH" | "LPOP" | "LLEN" | "LRANGE", _) => {
                return Err(BrokerError::InvalidArgCount(name.to_lowercase()))
            }
            _ => return Err(BrokerError::UnknownCommand(name.to_lowercase())),
        };
        Ok(op)
    }
}

/// Successful result of an [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// AUTH succeeded; the connection should become bound to this twin.
    Authenticated(TwinId),
    Pushed(Delivery),
    /// `None` when no message matched.
    Popped(Option<Message>),
    Length(usize),
    Range(Vec<Message>),
}

impl ConnectionState {
    /// The twin this connection is bound to, if any.
    pub fn twin(&self) -> Option<TwinId> {
        match self {
            ConnectionState::Unauthenticated => None,
            ConnectionState::Authenticated(twin) => Some(*twin),
        }
    }

    /// Run `op` under this state.
    pub async fn execute(
        &self,
        op: Operation<'_>,
        node: &BufferedNode,
        twins: &dyn TwinStore,
    ) -> BrokerResult<Outcome> {
        match (*self, op) {
            (ConnectionState::Unauthenticated, Operation::Auth { twin, signature }) => {
                let twin = parse_twin_id(twin)?;
                authenticate(twins, twin, signature)?;
                Ok(Outcome::Authenticated(twin))
            }
            (ConnectionState::Unauthenticated, _) => Err(BrokerError::NotAuthenticated),
            (ConnectionState::Authenticated(bound), Operation::Auth { .. }) => {
                Err(BrokerError::AlreadyAuthenticated(bound))
            }
            (ConnectionState::Authenticated(bound), Operation::Push { key, payload }) => {
                let key = MailboxKey::parse_bytes(key)?;
                if key.twin == ANY_TWIN {
                    return Err(BrokerError::ReservedTwinId);
                }
                let message = Message::new(
                    bound,
                    key.twin,
                    key.subject,
                    payload.to_vec(),
                    node.message_ttl(),
                );
                let delivery = node.send(message).await?;
                debug!(sender = bound, receiver = key.twin, ?delivery, "Pushed message");
                Ok(Outcome::Pushed(delivery))
            }
            (ConnectionState::Authenticated(bound), Operation::Pop { key }) => {
                let key = MailboxKey::parse_bytes(key)?;
                Ok(Outcome::Popped(node.pop(bound, key.twin, &key.subject)))
            }
            (ConnectionState::Authenticated(bound), Operation::Len { key }) => {
                let key = MailboxKey::parse_bytes(key)?;
                Ok(Outcome::Length(node.length(bound, key.twin, &key.subject)))
            }
            (ConnectionState::Authenticated(bound), Operation::Range { key, start, end }) => {
                let key = MailboxKey::parse_bytes(key)?;
                let start = parse_bound(start)?;
                let end = parse_bound(end)?;
                Ok(Outcome::Range(
                    node.range(bound, key.twin, &key.subject, start, end),
                ))
            }
        }
    }
}

/// Verify `raw_signature` for `twin`.
///
/// Does not change any connection state; the caller binds the connection
/// on success.
pub fn authenticate(twins: &dyn TwinStore, twin: TwinId, raw_signature: &[u8]) -> BrokerResult<()> {
    let signature = decode_signature(raw_signature)?;
    let public_key = twins.public_key(twin).map_err(BrokerError::Lookup)?;
    if signature_valid(&public_key, &signature) {
        info!(twin, "Twin authenticated");
        Ok(())
    } else {
        warn!(twin, "Rejected AUTH with invalid signature");
        Err(BrokerError::AuthenticationFailed(twin))
    }
}

fn parse_twin_id(raw: &[u8]) -> BrokerResult<TwinId> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            BrokerError::InvalidArgument(format!(
                "twin id '{}' is not a valid integer",
                String::from_utf8_lossy(raw)
            ))
        })
}

fn parse_bound(raw: &[u8]) -> BrokerResult<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            BrokerError::InvalidArgument("value is not an integer or out of range".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sign_challenge;
    use crate::store::MemoryTwinStore;
    use crate::testing::{self, Mode, MockTransport};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::sync::Arc;
    use tfagent_types::KeyError;

    struct Fixture {
        node: Arc<BufferedNode>,
        twins: MemoryTwinStore,
        key: SigningKey,
        _shutdown: tokio::sync::watch::Sender<bool>,
    }

    /// Twin 7 registered with a fresh key, reachable on the local node.
    fn fixture() -> Fixture {
        let twins = testing::twin_store();
        let key = SigningKey::generate(&mut OsRng);
        let local = twins.get(7).unwrap().peer_id;
        twins.insert(7, key.verifying_key().to_bytes(), local);
        let (node, shutdown) = testing::node(twins.clone(), MockTransport::new(Mode::Deliver));
        Fixture {
            node,
            twins,
            key,
            _shutdown: shutdown,
        }
    }

    fn args(values: &[&str]) -> Vec<Vec<u8>> {
        values.iter().map(|v| v.as_bytes().to_vec()).collect()
    }

    async fn run(
        fx: &Fixture,
        state: ConnectionState,
        name: &str,
        values: &[&str],
    ) -> BrokerResult<Outcome> {
        let args = args(values);
        let op = Operation::parse(name, &args)?;
        state.execute(op, &fx.node, &fx.twins).await
    }

    #[test]
    fn test_parse_arg_counts() {
        assert!(Operation::parse("LPOP", &args(&["7:x"])).is_ok());
        assert!(matches!(
            Operation::parse("LPOP", &args(&[])),
            Err(BrokerError::InvalidArgCount(name)) if name == "lpop"
        ));
        assert!(matches!(
            Operation::parse("AUTH", &args(&["7"])),
            Err(BrokerError::InvalidArgCount(_))
        ));
        assert!(matches!(
            Operation::parse("LRANGE", &args(&["7:x", "0"])),
            Err(BrokerError::InvalidArgCount(_))
        ));
        assert!(matches!(
            Operation::parse("SET", &args(&["a", "b"])),
            Err(BrokerError::UnknownCommand(name)) if name == "set"
        ));
    }

    #[tokio::test]
    async fn test_auth_success() {
        let fx = fixture();
        let sig = hex::encode(sign_challenge(&fx.key));
        let outcome = run(&fx, ConnectionState::Unauthenticated, "AUTH", &["7", &sig])
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Authenticated(7));
    }

    #[tokio::test]
    async fn test_auth_raw_signature() {
        let fx = fixture();
        let sig = sign_challenge(&fx.key);
        let args = vec![b"7".to_vec(), sig.to_vec()];
        let op = Operation::parse("AUTH", &args).unwrap();
        let outcome = ConnectionState::Unauthenticated
            .execute(op, &fx.node, &fx.twins)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Authenticated(7));
    }

    #[tokio::test]
    async fn test_auth_failures() {
        let fx = fixture();
        let mut sig = sign_challenge(&fx.key);
        sig[0] ^= 0x01;
        let tampered = hex::encode(sig);
        assert!(matches!(
            run(&fx, ConnectionState::Unauthenticated, "AUTH", &["7", &tampered]).await,
            Err(BrokerError::AuthenticationFailed(7))
        ));

        let valid = hex::encode(sign_challenge(&fx.key));
        assert!(matches!(
            run(&fx, ConnectionState::Unauthenticated, "AUTH", &["404", &valid]).await,
            Err(BrokerError::Lookup(_))
        ));
        assert!(matches!(
            run(&fx, ConnectionState::Unauthenticated, "AUTH", &["7", "abc"]).await,
            Err(BrokerError::InvalidSignatureLength(3))
        ));
        assert!(matches!(
            run(&fx, ConnectionState::Unauthenticated, "AUTH", &["seven", &valid]).await,
            Err(BrokerError::InvalidArgument(_))
        ));
        // Another twin's key does not verify.
        assert!(matches!(
            run(&fx, ConnectionState::Unauthenticated, "AUTH", &["9", &valid]).await,
            Err(BrokerError::AuthenticationFailed(9))
        ));
    }

    #[tokio::test]
    async fn test_unauthenticated_is_gated() {
        let fx = fixture();
        let state = ConnectionState::Unauthenticated;
        for (name, values) in [
            ("LPUSH", vec!["9:ping", "hi"]),
            ("LPUSH", vec!["garbage", "hi"]),
            ("LPOP", vec!["0:"]),
            ("LLEN", vec!["not a key"]),
            ("LRANGE", vec!["0:", "x", "y"]),
        ] {
            assert!(matches!(
                run(&fx, state, name, &values).await,
                Err(BrokerError::NotAuthenticated)
            ));
        }
        assert_eq!(fx.node.pending_receives(), 0);
    }

    #[tokio::test]
    async fn test_already_authenticated() {
        let fx = fixture();
        let sig = hex::encode(sign_challenge(&fx.key));
        assert!(matches!(
            run(&fx, ConnectionState::Authenticated(9), "AUTH", &["7", &sig]).await,
            Err(BrokerError::AlreadyAuthenticated(9))
        ));
    }

    #[tokio::test]
    async fn test_push_and_drain_mailbox() {
        let fx = fixture();
        let sender = ConnectionState::Authenticated(7);
        let receiver = ConnectionState::Authenticated(9);

        let pushed = run(&fx, sender, "LPUSH", &["9:ping", "hi"]).await.unwrap();
        assert_eq!(pushed, Outcome::Pushed(Delivery::Local));
        run(&fx, sender, "LPUSH", &["9:pong", "yo"]).await.unwrap();

        assert_eq!(
            run(&fx, receiver, "LLEN", &["0:"]).await.unwrap(),
            Outcome::Length(2)
        );
        assert_eq!(
            run(&fx, receiver, "LLEN", &["7:pong"]).await.unwrap(),
            Outcome::Length(1)
        );
        // Twin 7 has nothing addressed to itself.
        assert_eq!(
            run(&fx, sender, "LLEN", &["0:"]).await.unwrap(),
            Outcome::Length(0)
        );

        match run(&fx, receiver, "LRANGE", &["7:", "0", "-1"]).await.unwrap() {
            Outcome::Range(messages) => assert_eq!(messages.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }

        match run(&fx, receiver, "LPOP", &["7:"]).await.unwrap() {
            Outcome::Popped(Some(m)) => {
                assert_eq!(m.composed_key(), "7:ping");
                assert_eq!(m.payload, b"hi");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        match run(&fx, receiver, "LPOP", &["7:"]).await.unwrap() {
            Outcome::Popped(Some(m)) => assert_eq!(m.topic, "pong"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            run(&fx, receiver, "LPOP", &["7:"]).await.unwrap(),
            Outcome::Popped(None)
        );
    }

    #[tokio::test]
    async fn test_push_timeout_reports_queued() {
        let twins = testing::twin_store();
        let (node, _tx) = testing::node(twins.clone(), MockTransport::new(Mode::Timeout));
        let args = args(&["20:ping", "hi"]);
        let op = Operation::parse("LPUSH", &args).unwrap();
        let outcome = ConnectionState::Authenticated(7)
            .execute(op, &node, &twins)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Pushed(Delivery::Queued));
        assert_eq!(node.pending_sends().len(), 1);
        assert_eq!(node.pending_sends()[0].sender, 7);
    }

    #[tokio::test]
    async fn test_push_errors() {
        let fx = fixture();
        let state = ConnectionState::Authenticated(7);
        assert!(matches!(
            run(&fx, state, "LPUSH", &["0:ping", "hi"]).await,
            Err(BrokerError::ReservedTwinId)
        ));
        assert!(matches!(
            run(&fx, state, "LPUSH", &["nokey", "hi"]).await,
            Err(BrokerError::MalformedKey(KeyError::MissingSeparator(_)))
        ));
        assert!(matches!(
            run(&fx, state, "LPUSH", &["404:ping", "hi"]).await,
            Err(BrokerError::UnknownRecipient(_))
        ));
    }

    #[tokio::test]
    async fn test_range_bounds_must_be_integers() {
        let fx = fixture();
        assert!(matches!(
            run(&fx, ConnectionState::Authenticated(9), "LRANGE", &["0:", "a", "1"]).await,
            Err(BrokerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_state_twin() {
        assert_eq!(ConnectionState::default().twin(), None);
        assert_eq!(ConnectionState::Authenticated(3).twin(), Some(3));
    }
}
