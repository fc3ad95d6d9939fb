//! HTTP bridges between live HTTP exchanges and the internal message bus.
//!
//! [`ServerBridge`] turns inbound HTTP requests into internal request
//! messages and answers each one with the correlated internal reply.
//! [`ClientBridge`] performs outbound HTTP calls on behalf of internal
//! request messages and publishes the outcome as a reply.

pub mod client;
pub mod error;
pub mod mailbox;
pub mod pending;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod verify;

use crate::protocol::Envelope;
use async_trait::async_trait;

pub use client::{ClientBridge, CLIENT_BRIDGE_ADDRESS, DEFAULT_EXCEPTION_CODE};
pub use error::{BridgeError, WaitError};
pub use mailbox::{Mailbox, MailboxSlot};
pub use pending::{PendingExchanges, PendingSlot};
pub use server::{
    Delivery, ServerBridge, ServerBridgeBuilder, TransportRequest, TransportResponse,
    SERVER_BRIDGE_ADDRESS,
};
pub use state::ConnectionState;
pub use supervisor::{ShutdownReport, TaskSupervisor};
pub use verify::{AllowAll, OpenApiSpec, RequestVerifier, VerifyError};

/// A bridge attached to the internal message bus.
///
/// `send` hands an envelope from the bus to the bridge; `receive` yields the
/// next envelope the bridge publishes onto the bus. Both fail fast with
/// [`BridgeError::NotConnected`] outside of `connect()`/`disconnect()`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Short bridge name, used in logs and errors.
    fn name(&self) -> &str;

    /// Bus address the bridge sends from.
    fn address(&self) -> &str;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Allocate the mailbox and start the transport. Idempotent while connected.
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Stop the transport and cancel in-flight work. Idempotent.
    async fn disconnect(&self) -> Result<(), BridgeError>;

    async fn send(&self, envelope: Envelope) -> Result<(), BridgeError>;

    /// Wait for the next published envelope. `Ok(None)` once the bridge
    /// disconnects while waiting.
    async fn receive(&self) -> Result<Option<Envelope>, BridgeError>;
}
