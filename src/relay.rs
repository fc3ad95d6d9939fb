//! In-process consumers that sit behind the server bridge and answer the
//! request messages it publishes.

use crate::bridge::{
    ClientBridge, Connection, PendingExchanges, PendingSlot, ServerBridge, TaskSupervisor,
    DEFAULT_EXCEPTION_CODE,
};
use crate::protocol::{
    header_value, headers_to_string, parse_header_block, CorrelationKey, Dialogues, Envelope,
    HttpMessage, Performative, Role,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RELAY_NAME: &str = "relay";

/// A consumer draining the server bridge until `shutdown` fires or the
/// bridge disconnects.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Wait for the next request published by `server`, or `None` once either
/// the bridge or `shutdown` stops the loop.
async fn next_request(server: &ServerBridge, shutdown: &CancellationToken) -> Result<Option<HttpMessage>> {
    tokio::select! {
        () = shutdown.cancelled() => Ok(None),
        next = server.receive() => Ok(next?.map(|envelope| envelope.message)),
    }
}

/// Answers every request with `200 Success`, echoing its body and content type.
pub struct EchoResponder {
    server: Arc<ServerBridge>,
    dialogues: Mutex<Dialogues>,
}

impl EchoResponder {
    pub fn new(server: Arc<ServerBridge>) -> Self {
        let dialogues = Dialogues::new(server.target_address(), Role::Server);
        Self {
            server,
            dialogues: Mutex::new(dialogues),
        }
    }

    fn respond(&self, request: &HttpMessage) -> Result<HttpMessage> {
        let mut dialogues = self.dialogues.lock();
        let key = dialogues
            .update(request)
            .with_context(|| format!("Could not create dialogue for message={request}"))?;

        let headers = parse_header_block(request.performative.headers());
        let content_type = header_value(&headers, "content-type");
        let reply = dialogues.reply(
            &key,
            Performative::Response {
                version: String::new(),
                status_code: 200,
                status_text: "Success".into(),
                headers: headers_to_string(content_type.map(|value| ("Content-Type", value))),
                body: request.performative.body().to_vec(),
            },
        )?;
        Ok(reply)
    }
}

#[async_trait]
impl Consumer for EchoResponder {
    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Echo responder listening as {}", self.server.target_address());
        while let Some(request) = next_request(&self.server, &shutdown).await? {
            match self.respond(&request) {
                Ok(reply) => self.server.send(Envelope::new(reply)).await?,
                Err(error) => tracing::warn!("Echo responder dropped a request: {error:#}"),
            }
        }
        tracing::info!("Echo responder stopped");
        Ok(())
    }
}

/// Rebase `url` onto `upstream`, keeping its path and query.
pub fn rebase_url(url: &str, upstream: &str) -> String {
    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path_and_query = after_scheme
        .find('/')
        .map_or("/", |index| &after_scheme[index..]);
    format!("{}{path_and_query}", upstream.trim_end_matches('/'))
}

struct RelayShared {
    server: Arc<ServerBridge>,
    client: Arc<ClientBridge>,
    upstream: String,
    inbound: Mutex<Dialogues>,
    outbound: Mutex<Dialogues>,
    pending: PendingExchanges<HttpMessage>,
    timeout: Duration,
}

impl RelayShared {
    fn admit(&self, request: &HttpMessage) -> Result<CorrelationKey> {
        self.inbound
            .lock()
            .update(request)
            .with_context(|| format!("Could not create dialogue for message={request}"))
    }

    /// Open the outbound dialogue for an admitted request and hand it to the
    /// client bridge.
    async fn forward(&self, request: &HttpMessage) -> Result<PendingSlot<HttpMessage>> {
        let Performative::Request {
            method,
            url,
            version,
            headers,
            body,
        } = &request.performative
        else {
            anyhow::bail!("Only requests can be relayed");
        };
        let upstream_url = rebase_url(url, &self.upstream);
        tracing::debug!("Relaying {method} {url} to {upstream_url}");

        let (message, outbound_key) = self.outbound.lock().create(
            self.client.address(),
            Performative::Request {
                method: method.clone(),
                url: upstream_url,
                version: version.clone(),
                headers: headers.clone(),
                body: body.clone(),
            },
        )?;
        let sent = match self.pending.register(outbound_key.clone()) {
            Ok(slot) => self.client.send(Envelope::new(message)).await.map(|()| slot),
            Err(error) => Err(error),
        };
        if sent.is_err() {
            self.outbound.lock().expire(&outbound_key);
        }
        Ok(sent?)
    }

    async fn answer(&self, inbound_key: &CorrelationKey, outcome: Performative) -> Result<()> {
        let reply = self.inbound.lock().reply(inbound_key, outcome)?;
        self.server.send(Envelope::new(reply)).await?;
        Ok(())
    }

    /// Route replies from the client bridge to their waiting exchange.
    async fn pump_replies(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                next = self.client.receive() => next?,
            };
            let Some(envelope) = next else {
                return Ok(());
            };
            let reply = envelope.message;
            let attributed = self.outbound.lock().update(&reply);
            let key = match attributed {
                Ok(key) => key,
                Err(error) => {
                    tracing::warn!("Could not attribute upstream reply={reply}: {error}");
                    continue;
                }
            };
            if let Err(reply) = self.pending.try_fulfil(&key, reply) {
                tracing::warn!("Dropping message={reply} for correlation key={key} which has timed out.");
            }
        }
    }
}

fn bad_gateway(detail: &str) -> Performative {
    Performative::Response {
        version: String::new(),
        status_code: 502,
        status_text: "Bad Gateway".into(),
        headers: headers_to_string(std::iter::empty()),
        body: detail.as_bytes().to_vec(),
    }
}

/// Relays every inbound request to an upstream base URL through a client
/// bridge and answers with whatever the upstream returned.
pub struct UpstreamRelay {
    shared: Arc<RelayShared>,
    supervisor: TaskSupervisor,
}

impl UpstreamRelay {
    pub fn new(
        server: Arc<ServerBridge>,
        client: Arc<ClientBridge>,
        upstream: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let address = server.target_address().to_string();
        Self {
            shared: Arc::new(RelayShared {
                inbound: Mutex::new(Dialogues::new(address.clone(), Role::Server)),
                outbound: Mutex::new(Dialogues::new(address, Role::Client)),
                server,
                client,
                upstream: upstream.into(),
                pending: PendingExchanges::new(),
                timeout,
            }),
            supervisor: TaskSupervisor::new(RELAY_NAME),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    async fn relay(&self, request: HttpMessage) {
        let inbound_key = match self.shared.admit(&request) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!("Relay dropped a request: {error:#}");
                return;
            }
        };
        let slot = match self.shared.forward(&request).await {
            Ok(slot) => slot,
            Err(error) => {
                tracing::warn!("Could not relay {inbound_key}: {error:#}");
                if let Err(error) = self
                    .shared
                    .answer(&inbound_key, bad_gateway(&format!("{error:#}")))
                    .await
                {
                    tracing::warn!("Could not answer {inbound_key}: {error:#}");
                }
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let label = format!("relay {inbound_key}");
        let spawned = self.supervisor.spawn(label, async move {
            let outbound_key = slot.key().clone();
            let outcome = match slot.wait(shared.timeout).await {
                Ok(reply) => match reply.performative {
                    Performative::Response {
                        status_code: DEFAULT_EXCEPTION_CODE,
                        body,
                        ..
                    } => bad_gateway(&String::from_utf8_lossy(&body)),
                    response @ Performative::Response { .. } => response,
                    Performative::Request { .. } => bad_gateway("upstream answered with a request"),
                },
                Err(error) => {
                    tracing::warn!("Upstream exchange {inbound_key} failed: {error}");
                    shared.outbound.lock().expire(&outbound_key);
                    bad_gateway(&error.to_string())
                }
            };
            shared.answer(&inbound_key, outcome).await
        });
        if spawned.is_none() {
            tracing::debug!("Relay is stopping, request left to the server bridge timeout");
        }
    }
}

#[async_trait]
impl Consumer for UpstreamRelay {
    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            "Relaying {} to {}",
            self.shared.server.target_address(),
            self.shared.upstream
        );
        let pump = {
            let shared = Arc::clone(&self.shared);
            let shutdown = shutdown.clone();
            self.supervisor
                .spawn("reply pump", async move { shared.pump_replies(shutdown).await })
        };
        if let Some(pump) = pump {
            tracing::debug!("Reply pump started as task {pump}");
        }

        let outcome = async {
            while let Some(request) = next_request(&self.shared.server, &shutdown).await? {
                self.relay(request).await;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        shutdown.cancel();
        let expired = self.shared.pending.expire_all();
        let report = self.supervisor.shutdown().await;
        for failure in &report.failed {
            tracing::error!("Relay task failed during shutdown: {failure}");
        }
        tracing::info!(
            "Relay stopped ({} exchange(s) expired, {} task(s) cancelled)",
            expired,
            report.cancelled
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{TransportRequest, CLIENT_BRIDGE_ADDRESS};
    use crate::config::{ClientBridgeConfig, ServerBridgeConfig};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_bridge() -> Arc<ServerBridge> {
        let config = ServerBridgeConfig {
            port: 0,
            ..ServerBridgeConfig::default()
        };
        let bridge = ServerBridge::builder(&config)
            .response_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        bridge.connect().await.unwrap();
        Arc::new(bridge)
    }

    fn header_pair(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    #[test]
    fn rebase_keeps_path_and_query() {
        assert_eq!(
            rebase_url("http://127.0.0.1:8000/pets/1?limit=2", "http://upstream:9000/"),
            "http://upstream:9000/pets/1?limit=2"
        );
        assert_eq!(rebase_url("http://127.0.0.1:8000", "http://up"), "http://up/");
    }

    #[tokio::test]
    async fn echo_responder_answers_with_the_request_body() {
        let server = server_bridge().await;
        let shutdown = CancellationToken::new();
        let echo = EchoResponder::new(Arc::clone(&server));
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { echo.run(shutdown).await }
        });

        let response = server
            .handle(TransportRequest::from_url(
                "POST",
                "http://127.0.0.1:8000/echo",
                vec![header_pair("Content-Type", "application/json")],
                b"{\"ping\":true}".to_vec(),
            ))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.reason, "Success");
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.body, b"{\"ping\":true}");

        shutdown.cancel();
        running.await.unwrap().unwrap();
        server.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn upstream_relay_forwards_and_answers() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pets"))
            .and(query_param("limit", "2"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("x-upstream", "yes")
                    .set_body_string("[]"),
            )
            .expect(1)
            .mount(&upstream)
            .await;

        let server = server_bridge().await;
        let client = Arc::new(ClientBridge::new(&ClientBridgeConfig::default()).unwrap());
        client.connect().await.unwrap();
        assert_eq!(client.address(), CLIENT_BRIDGE_ADDRESS);

        let shutdown = CancellationToken::new();
        let relay = Arc::new(UpstreamRelay::new(
            Arc::clone(&server),
            Arc::clone(&client),
            upstream.uri(),
            Duration::from_secs(5),
        ));
        let running = tokio::spawn({
            let relay = Arc::clone(&relay);
            let shutdown = shutdown.clone();
            async move { relay.run(shutdown).await }
        });

        let response = server
            .handle(TransportRequest::from_url(
                "GET",
                "http://127.0.0.1:8000/pets?limit=2",
                vec![header_pair("Host", "127.0.0.1:8000")],
                Vec::new(),
            ))
            .await;
        assert_eq!(response.status_code, 202);
        assert_eq!(response.reason, "Accepted");
        assert_eq!(response.header("x-upstream"), Some("yes"));
        assert_eq!(response.body, b"[]");
        assert_eq!(relay.in_flight(), 0);

        shutdown.cancel();
        running.await.unwrap().unwrap();
        client.disconnect().await.unwrap();
        server.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_upstream_answers_bad_gateway() {
        let server = server_bridge().await;
        let client = Arc::new(ClientBridge::new(&ClientBridgeConfig::default()).unwrap());
        client.connect().await.unwrap();

        let shutdown = CancellationToken::new();
        let relay = UpstreamRelay::new(
            Arc::clone(&server),
            Arc::clone(&client),
            "http://127.0.0.1:1",
            Duration::from_secs(5),
        );
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { relay.run(shutdown).await }
        });

        let response = server
            .handle(TransportRequest::from_url(
                "GET",
                "http://127.0.0.1:8000/",
                Vec::new(),
                Vec::new(),
            ))
            .await;
        assert_eq!(response.status_code, 502);
        assert_eq!(response.reason, "Bad Gateway");
        assert!(!response.body.is_empty());

        shutdown.cancel();
        running.await.unwrap().unwrap();
        client.disconnect().await.unwrap();
        server.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn failed_hand_off_answers_bad_gateway_promptly() {
        let server = server_bridge().await;
        let client = Arc::new(ClientBridge::new(&ClientBridgeConfig::default()).unwrap());

        let shutdown = CancellationToken::new();
        let relay = Arc::new(UpstreamRelay::new(
            Arc::clone(&server),
            Arc::clone(&client),
            "http://127.0.0.1:1",
            Duration::from_secs(5),
        ));
        let running = tokio::spawn({
            let relay = Arc::clone(&relay);
            let shutdown = shutdown.clone();
            async move { relay.run(shutdown).await }
        });

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            server.handle(TransportRequest::from_url(
                "GET",
                "http://127.0.0.1:8000/pets",
                Vec::new(),
                Vec::new(),
            )),
        )
        .await
        .expect("answered before the bridge timeout");
        assert_eq!(response.status_code, 502);
        assert!(String::from_utf8_lossy(&response.body).contains("not connected"));
        assert_eq!(relay.in_flight(), 0);

        shutdown.cancel();
        running.await.unwrap().unwrap();
        server.disconnect().await.unwrap();
    }
}
