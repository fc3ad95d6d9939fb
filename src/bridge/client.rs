//! Outbound bridge: internal request messages become real HTTP calls whose
//! outcome is published back onto the bus as the correlated reply.

use super::error::BridgeError;
use super::mailbox::{Mailbox, MailboxSlot};
use super::state::{ConnectionState, ConnectionStatus};
use super::supervisor::TaskSupervisor;
use super::Connection;
use crate::config::ClientBridgeConfig;
use crate::protocol::{
    headers_to_string, parse_header_block, CorrelationKey, DialogueError, Dialogues, Envelope,
    HttpMessage, Performative, Role,
};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const CLIENT_BRIDGE_NAME: &str = "http_client";
/// Default address the client bridge replies from.
pub const CLIENT_BRIDGE_ADDRESS: &str = "clawbridge/http_client:0.1.0";

/// Status code of the reply synthesized when the outbound call fails.
pub const DEFAULT_EXCEPTION_CODE: u16 = 600;
pub const EXCEPTION_STATUS_TEXT: &str = "HTTPConnection request error.";

/// Request headers the HTTP client derives itself.
const DERIVED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

struct ClientShared {
    address: String,
    status: ConnectionStatus,
    mailbox: MailboxSlot<Envelope>,
    dialogues: Mutex<Dialogues>,
    http: reqwest::Client,
    request_timeout: Duration,
}

fn exception_reply(detail: String) -> Performative {
    Performative::Response {
        version: String::new(),
        status_code: DEFAULT_EXCEPTION_CODE,
        status_text: EXCEPTION_STATUS_TEXT.to_string(),
        headers: headers_to_string(std::iter::empty()),
        body: detail.into_bytes(),
    }
}

impl ClientShared {
    async fn perform(
        &self,
        key: CorrelationKey,
        label: &str,
        request: HttpMessage,
        mailbox: Arc<Mailbox<Envelope>>,
    ) -> anyhow::Result<()> {
        let performative = match self.call(&request.performative).await {
            Ok(performative) => performative,
            Err(error) => {
                tracing::warn!("Exception raised during http call: {label}: {error:#}");
                exception_reply(format!("{error:?}"))
            }
        };

        let answered = self.dialogues.lock().reply(&key, performative.clone());
        let reply = match answered {
            Ok(reply) => reply,
            Err(error) => {
                // The dialogue is gone; answer the opening directly so the
                // requester is never left without a reply.
                tracing::warn!("Cannot answer dialogue {key}: {error}");
                let refused = self.dialogues.lock().refuse(&request, performative);
                refused.with_context(|| format!("Cannot answer request {key}"))?
            }
        };
        self.publish(&mailbox, reply);
        Ok(())
    }

    fn publish(&self, mailbox: &Mailbox<Envelope>, reply: HttpMessage) {
        tracing::debug!("Publishing {reply}");
        if mailbox.enqueue(Envelope::new(reply)).is_err() {
            tracing::debug!("Mailbox closed, reply discarded");
        }
    }

    async fn call(&self, request: &Performative) -> anyhow::Result<Performative> {
        let Performative::Request {
            method,
            url,
            headers,
            body,
            ..
        } = request
        else {
            anyhow::bail!("Only request messages can be sent");
        };

        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("Unsupported HTTP method: {method}"))?;
        let mut builder = self
            .http
            .request(method, url.as_str())
            .timeout(self.request_timeout);
        for (name, value) in parse_header_block(headers) {
            if DERIVED_HEADERS
                .iter()
                .any(|derived| name.eq_ignore_ascii_case(derived))
            {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !body.is_empty() {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("HTTP call to {url} failed"))?;

        let status = response.status();
        let status_text = response
            .extensions()
            .get::<hyper::ext::ReasonPhrase>()
            .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
            .or_else(|| status.canonical_reason())
            .unwrap_or_default()
            .to_string();
        let headers = headers_to_string(response.headers().iter().filter_map(|(name, value)| {
            value.to_str().ok().map(|value| (name.as_str(), value))
        }));
        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from {url}"))?
            .to_vec();

        Ok(Performative::Response {
            version: String::new(),
            status_code: status.as_u16(),
            status_text,
            headers,
            body,
        })
    }
}

/// Outbound HTTP bridge.
///
/// Each request envelope is answered asynchronously: the call runs in a
/// supervised task and its reply (or a [`DEFAULT_EXCEPTION_CODE`] reply on
/// failure) is published for [`receive`](Connection::receive).
pub struct ClientBridge {
    shared: Arc<ClientShared>,
    supervisor: TaskSupervisor,
}

impl std::fmt::Debug for ClientBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBridge")
            .field("address", &self.shared.address)
            .field("state", &self.shared.status.get())
            .field("in_flight", &self.supervisor.in_flight())
            .finish_non_exhaustive()
    }
}

impl ClientBridge {
    pub fn new(config: &ClientBridgeConfig) -> anyhow::Result<Self> {
        Self::with_address(config, CLIENT_BRIDGE_ADDRESS)
    }

    pub fn with_address(config: &ClientBridgeConfig, address: impl Into<String>) -> anyhow::Result<Self> {
        let address = address.into();
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            shared: Arc::new(ClientShared {
                dialogues: Mutex::new(Dialogues::with_capacity(
                    address.clone(),
                    Role::Server,
                    config.max_open_dialogues,
                )),
                address,
                status: ConnectionStatus::new(),
                mailbox: MailboxSlot::new(CLIENT_BRIDGE_NAME),
                http,
                request_timeout: config.request_timeout(),
            }),
            supervisor: TaskSupervisor::new(CLIENT_BRIDGE_NAME),
        })
    }

    /// Outbound calls still running.
    pub fn in_flight(&self) -> usize {
        self.supervisor.in_flight()
    }

    /// Resolve once every outbound call has finished.
    pub async fn wait_idle(&self) {
        self.supervisor.wait_idle().await;
    }
}

#[async_trait]
impl Connection for ClientBridge {
    fn name(&self) -> &str {
        CLIENT_BRIDGE_NAME
    }

    fn address(&self) -> &str {
        &self.shared.address
    }

    fn state(&self) -> ConnectionState {
        self.shared.status.get()
    }

    async fn connect(&self) -> Result<(), BridgeError> {
        if let Err(state) = self.shared.status.transition(ConnectionState::Connecting) {
            return match state {
                ConnectionState::Connected => Ok(()),
                state => Err(BridgeError::Busy {
                    bridge: CLIENT_BRIDGE_NAME,
                    state,
                }),
            };
        }
        self.shared.mailbox.install();
        self.supervisor.reopen();
        let _ = self.shared.status.transition(ConnectionState::Connected);
        tracing::info!("HTTP client bridge ready at {}", self.shared.address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        match self.shared.status.transition(ConnectionState::Disconnecting) {
            Ok(_) => {}
            Err(ConnectionState::Disconnected) => return Ok(()),
            Err(state) => {
                return Err(BridgeError::Busy {
                    bridge: CLIENT_BRIDGE_NAME,
                    state,
                })
            }
        }

        let report = self.supervisor.shutdown().await;
        for failure in &report.failed {
            tracing::error!("Exception on task cancel: {failure}");
        }
        self.shared.dialogues.lock().expire_all();
        self.shared.mailbox.tear_down();
        let _ = self.shared.status.transition(ConnectionState::Disconnected);
        tracing::info!(
            "HTTP Client has shutdown, {} in-flight call(s) cancelled.",
            report.cancelled
        );
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        if !self.shared.status.is_connected() {
            return Err(BridgeError::NotConnected {
                bridge: CLIENT_BRIDGE_NAME,
            });
        }
        let message = envelope.message;
        if !message.is_request() {
            tracing::warn!("The HttpMessage performative must be a request. Envelope dropped: {message}");
            return Ok(());
        }

        let mailbox = self.shared.mailbox.get()?;
        let resolved = self.shared.dialogues.lock().update(&message);
        let key = match resolved {
            Ok(key) => key,
            Err(DialogueError::CapacityExhausted { max_open }) => {
                tracing::warn!("Refusing message={message}: {max_open} requests already in flight");
                let refusal = self.shared.dialogues.lock().refuse(
                    &message,
                    exception_reply(format!("{max_open} requests already in flight")),
                )?;
                self.shared.publish(&mailbox, refusal);
                return Ok(());
            }
            Err(error) => {
                tracing::warn!("Could not create dialogue for message={message}: {error}");
                return Ok(());
            }
        };

        let shared = Arc::clone(&self.shared);
        let label = match &message.performative {
            Performative::Request { method, url, .. } => {
                format!("{} {url}", method.to_ascii_uppercase())
            }
            Performative::Response { .. } => key.to_string(),
        };
        let spawned = self.supervisor.spawn(label.clone(), {
            let key = key.clone();
            async move { shared.perform(key, &label, message, mailbox).await }
        });
        if spawned.is_none() {
            self.shared.dialogues.lock().expire(&key);
            return Err(BridgeError::NotConnected {
                bridge: CLIENT_BRIDGE_NAME,
            });
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Envelope>, BridgeError> {
        self.shared.mailbox.dequeue().await
    }
}
