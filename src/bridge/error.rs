use super::state::ConnectionState;
use crate::protocol::{CorrelationKey, DialogueError};
use thiserror::Error;

/// Errors surfaced by bridge operations.
///
/// None of these escape as a crash of the owning connection: the server bridge
/// turns them into a well-formed HTTP response, the client bridge into a
/// sentinel reply message.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge `{bridge}` is not connected")]
    NotConnected { bridge: &'static str },
    #[error("bridge `{bridge}` is {state}, try again once it settles")]
    Busy {
        bridge: &'static str,
        state: ConnectionState,
    },
    #[error("correlation key `{key}` is already pending")]
    DuplicateKey { key: CorrelationKey },
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] DialogueError),
    #[error("failed to start HTTP transport on {address}: {source}")]
    TransportStart {
        address: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid reply: {0}")]
    InvalidReply(String),
    #[error("outbound call failed: {0}")]
    ExternalCall(String),
}

/// Outcome of waiting on a pending slot that did not deliver a value.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("no reply arrived within the response window")]
    TimedOut,
    #[error("pending exchange expired before a reply arrived")]
    Expired,
}
