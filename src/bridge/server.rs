//! Inbound bridge: HTTP requests become internal request messages and wait,
//! bounded in time, for the correlated internal reply.

use super::error::{BridgeError, WaitError};
use super::mailbox::MailboxSlot;
use super::pending::PendingExchanges;
use super::state::{ConnectionState, ConnectionStatus};
use super::verify::{AllowAll, OpenApiSpec, RequestVerifier};
use super::Connection;
use crate::config::ServerBridgeConfig;
use crate::protocol::{
    headers_to_string, parse_header_block, Correlator, DialogueError, Dialogues,
    Envelope, HttpMessage, Performative, Role,
};
use anyhow::Context;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::limit::RequestBodyLimitLayer;

pub const SERVER_BRIDGE_NAME: &str = "http_server";
/// Default address the server bridge uses as message sender.
pub const SERVER_BRIDGE_ADDRESS: &str = "clawbridge/http_server:0.1.0";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Headers that describe one hop of the HTTP connection and are never copied
/// from a reply onto the transport response.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

// ── Transport descriptors ─────────────────────────────────────────

/// Inbound request as seen by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: String,
    /// Absolute URL including the query string.
    pub url: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportRequest {
    /// Build a descriptor from an absolute URL, deriving `path` and `query`.
    pub fn from_url(
        method: impl Into<String>,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Self {
        let url = url.into();
        let after_scheme = url.split_once("://").map_or(url.as_str(), |(_, rest)| rest);
        let path_and_query = after_scheme
            .find('/')
            .map_or("/", |start| &after_scheme[start..]);
        let path_and_query = path_and_query.split('#').next().unwrap_or(path_and_query);
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query.to_string(), None),
        };
        Self {
            method: method.into(),
            path,
            query,
            url,
            headers,
            body,
        }
    }
}

/// Outbound response produced by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            reason: reason.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(404, "Request Not Found")
    }

    pub fn timed_out() -> Self {
        Self::new(408, "Request Timeout")
    }

    pub fn unavailable() -> Self {
        Self::new(503, "Service Unavailable")
    }

    pub fn server_error(detail: Option<String>) -> Self {
        let mut response = Self::new(500, "Server Error");
        if let Some(detail) = detail {
            response.headers.push((
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            ));
            response.body = detail.into_bytes();
        }
        response
    }

    /// Copy a reply verbatim. A `Content-Length` header, when present, is
    /// rewritten to the actual body length.
    pub fn from_reply(reply: &HttpMessage) -> Self {
        let Performative::Response {
            status_code,
            status_text,
            headers,
            body,
            ..
        } = &reply.performative
        else {
            return Self::server_error(None);
        };

        let mut headers = parse_header_block(headers);
        for (name, value) in &mut headers {
            if name.eq_ignore_ascii_case("content-length") {
                *value = body.len().to_string();
            }
        }
        Self {
            status_code: *status_code,
            reason: status_text.clone(),
            headers,
            body: body.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::protocol::header_value(&self.headers, name)
    }

    fn into_http(self) -> Response {
        // Codes past 599 are bus-internal sentinels and never reach the wire.
        let status = match StatusCode::from_u16(self.status_code) {
            Ok(status) if self.status_code <= 599 => status,
            _ => {
                tracing::warn!(
                    "Reply carried unusable status code {}, answering 500",
                    self.status_code
                );
                return Self::server_error(None).into_http();
            }
        };

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;
        for (name, value) in self.headers {
            if HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop)) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => tracing::debug!("Skipping invalid reply header {name:?}"),
            }
        }

        if !self.reason.is_empty() && status.canonical_reason() != Some(self.reason.as_str()) {
            match hyper::ext::ReasonPhrase::try_from(self.reason.into_bytes()) {
                Ok(reason) => {
                    response.extensions_mut().insert(reason);
                }
                Err(error) => tracing::debug!("Skipping invalid reason phrase: {error}"),
            }
        }
        response
    }
}

// ── Bridge core ───────────────────────────────────────────────────

/// What happened to a reply handed to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The waiting HTTP exchange received it.
    Delivered,
    /// Correlated, but nothing is waiting any more (timed out or abandoned).
    Orphaned,
    /// Could not be attributed to any exchange.
    Uncorrelated,
}

#[derive(Debug)]
enum ExchangeError {
    Wait(WaitError),
    Bridge(BridgeError),
}

impl From<WaitError> for ExchangeError {
    fn from(error: WaitError) -> Self {
        Self::Wait(error)
    }
}

impl From<BridgeError> for ExchangeError {
    fn from(error: BridgeError) -> Self {
        Self::Bridge(error)
    }
}

impl From<DialogueError> for ExchangeError {
    fn from(error: DialogueError) -> Self {
        Self::Bridge(error.into())
    }
}

struct ServerShared {
    address: String,
    target_address: String,
    status: ConnectionStatus,
    mailbox: MailboxSlot<Envelope>,
    pending: PendingExchanges<HttpMessage>,
    dialogues: Mutex<Dialogues>,
    verifier: Arc<dyn RequestVerifier>,
    response_timeout: Duration,
    expose_errors: bool,
}

impl ServerShared {
    async fn handle(&self, request: TransportRequest) -> TransportResponse {
        if let Err(reason) = self.verifier.verify(&request) {
            tracing::debug!("Rejected {} {}: {reason}", request.method, request.url);
            return TransportResponse::not_found();
        }

        let url = request.url.clone();
        match self.exchange(request).await {
            Ok(reply) => TransportResponse::from_reply(&reply),
            Err(ExchangeError::Wait(WaitError::TimedOut)) => {
                tracing::warn!(
                    "Request timed out after {}s waiting for a reply: {url}",
                    self.response_timeout.as_secs_f64()
                );
                TransportResponse::timed_out()
            }
            Err(ExchangeError::Wait(WaitError::Expired)) => {
                tracing::info!("Request abandoned while the bridge shut down: {url}");
                TransportResponse::timed_out()
            }
            Err(ExchangeError::Bridge(BridgeError::ProtocolViolation(
                DialogueError::CapacityExhausted { max_open },
            ))) => {
                tracing::warn!("Refusing {url}: {max_open} exchanges already open");
                TransportResponse::unavailable()
            }
            Err(ExchangeError::Bridge(error)) => {
                tracing::error!("Failed to bridge request {url}: {error}");
                TransportResponse::server_error(self.expose_errors.then(|| format!("{error:?}")))
            }
        }
    }

    async fn exchange(&self, request: TransportRequest) -> Result<HttpMessage, ExchangeError> {
        let mailbox = self.mailbox.get()?;
        let performative = Performative::Request {
            method: request.method.to_ascii_lowercase(),
            url: request.url,
            version: String::new(),
            headers: headers_to_string(
                request
                    .headers
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            ),
            body: request.body,
        };

        let (message, key) = self
            .dialogues
            .lock()
            .create(self.target_address.as_str(), performative)?;
        // Registered before publishing so an immediate reply finds its slot.
        let slot = match self.pending.register(key.clone()) {
            Ok(slot) => slot,
            Err(error) => {
                self.dialogues.lock().expire(&key);
                return Err(error.into());
            }
        };

        tracing::debug!("Bridging {message}");
        if mailbox.enqueue(Envelope::new(message)).is_err() {
            self.dialogues.lock().expire(&key);
            return Err(BridgeError::NotConnected {
                bridge: SERVER_BRIDGE_NAME,
            }
            .into());
        }

        match slot.wait(self.response_timeout).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                // Kept open so a late reply is still recognised as ours.
                self.dialogues.lock().expire(&key);
                Err(error.into())
            }
        }
    }

    fn deliver(&self, message: HttpMessage) -> Delivery {
        let resolved = self.dialogues.lock().resolve(&message);
        let Some(key) = resolved else {
            tracing::warn!("Could not create dialogue for message={message}");
            return Delivery::Uncorrelated;
        };

        match self.pending.try_fulfil(&key, message) {
            Ok(()) => {
                tracing::debug!("Delivered reply for {key}");
                Delivery::Delivered
            }
            Err(message) => {
                tracing::warn!(
                    "Dropping message={message} for correlation key={key} which has timed out."
                );
                Delivery::Orphaned
            }
        }
    }
}

struct ListenerContext {
    shared: Arc<ServerShared>,
    scheme: &'static str,
    authority: String,
    max_body_bytes: usize,
}

struct RunningListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Inbound HTTP bridge.
///
/// Every accepted request becomes one internal exchange addressed to the
/// configured target. The reply arrives through [`send`](Connection::send)
/// and is matched back to the waiting request by dialogue correlation.
pub struct ServerBridge {
    shared: Arc<ServerShared>,
    config: ServerBridgeConfig,
    listener: Mutex<Option<RunningListener>>,
}

impl std::fmt::Debug for ServerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBridge")
            .field("address", &self.shared.address)
            .field("target_address", &self.shared.target_address)
            .field("state", &self.shared.status.get())
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServerBridge`], for settings that have no config key.
#[must_use]
pub struct ServerBridgeBuilder {
    config: ServerBridgeConfig,
    address: String,
    verifier: Option<Arc<dyn RequestVerifier>>,
    response_timeout: Duration,
}

impl ServerBridgeBuilder {
    /// Use `address` as the sender of bridged requests.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Replace the verifier derived from `api_spec_path`.
    pub fn verifier(mut self, verifier: Arc<dyn RequestVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Override the response window (sub-second precision, unlike the config).
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Fails when a configured API document cannot be loaded.
    pub fn build(self) -> anyhow::Result<ServerBridge> {
        let verifier: Arc<dyn RequestVerifier> = match (self.verifier, &self.config.api_spec_path) {
            (Some(verifier), _) => verifier,
            (None, Some(path)) => Arc::new(OpenApiSpec::from_path(
                path,
                &self.config.server_address(),
            )?),
            (None, None) => Arc::new(AllowAll),
        };

        Ok(ServerBridge {
            shared: Arc::new(ServerShared {
                dialogues: Mutex::new(Dialogues::with_capacity(
                    self.address.clone(),
                    Role::Client,
                    self.config.max_open_dialogues,
                )),
                address: self.address,
                target_address: self.config.target_address.clone(),
                status: ConnectionStatus::new(),
                mailbox: MailboxSlot::new(SERVER_BRIDGE_NAME),
                pending: PendingExchanges::new(),
                verifier,
                response_timeout: self.response_timeout,
                expose_errors: self.config.expose_errors,
            }),
            config: self.config,
            listener: Mutex::new(None),
        })
    }
}

impl ServerBridge {
    pub fn builder(config: &ServerBridgeConfig) -> ServerBridgeBuilder {
        ServerBridgeBuilder {
            config: config.clone(),
            address: SERVER_BRIDGE_ADDRESS.to_string(),
            verifier: None,
            response_timeout: config.response_timeout(),
        }
    }

    /// Build a bridge from `config` alone.
    pub fn new(config: &ServerBridgeConfig) -> anyhow::Result<Self> {
        Self::builder(config).build()
    }

    pub fn target_address(&self) -> &str {
        &self.shared.target_address
    }

    /// Address of the running listener, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|running| running.local_addr)
    }

    /// Number of HTTP exchanges currently waiting for a reply.
    pub fn pending_exchanges(&self) -> usize {
        self.shared.pending.len()
    }

    /// Run one exchange without going through the socket listener.
    pub async fn handle(&self, request: TransportRequest) -> TransportResponse {
        self.shared.handle(request).await
    }

    /// Hand a reply to the bridge and report what became of it.
    pub fn deliver(&self, message: HttpMessage) -> Delivery {
        self.shared.deliver(message)
    }

    /// Axum router serving the bridge, for embedding into another server.
    pub fn router(&self) -> Router {
        let scheme = if self.config.tls().is_some() { "https" } else { "http" };
        listener_router(Arc::new(ListenerContext {
            shared: Arc::clone(&self.shared),
            scheme,
            authority: format!("{}:{}", self.config.host, self.config.port),
            max_body_bytes: self.config.max_body_bytes,
        }))
    }

    async fn start_listener(&self) -> anyhow::Result<RunningListener> {
        let tls = match self.config.tls() {
            Some((cert, key)) => Some(load_tls_acceptor(cert, key)?),
            None => None,
        };

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", self.config.host, self.config.port))?;
        let local_addr = listener.local_addr()?;

        let context = Arc::new(ListenerContext {
            shared: Arc::clone(&self.shared),
            scheme: if tls.is_some() { "https" } else { "http" },
            authority: local_addr.to_string(),
            max_body_bytes: self.config.max_body_bytes,
        });
        let router = listener_router(context);
        let shutdown = CancellationToken::new();

        let task = match tls {
            Some(acceptor) => tokio::spawn(serve_tls(listener, acceptor, router, shutdown.clone())),
            None => {
                let signal = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(error) = axum::serve(listener, router)
                        .with_graceful_shutdown(signal.cancelled_owned())
                        .await
                    {
                        tracing::error!("HTTP server bridge stopped: {error}");
                    }
                })
            }
        };

        Ok(RunningListener {
            local_addr,
            shutdown,
            task,
        })
    }
}

#[async_trait]
impl Connection for ServerBridge {
    fn name(&self) -> &str {
        SERVER_BRIDGE_NAME
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
                    bridge: SERVER_BRIDGE_NAME,
                    state,
                }),
            };
        }

        self.shared.mailbox.install();
        match self.start_listener().await {
            Ok(running) => {
                let scheme = if self.config.tls().is_some() { "https" } else { "http" };
                tracing::info!(
                    "HTTP server bridge listening on {scheme}://{}, forwarding to {}",
                    running.local_addr,
                    self.shared.target_address
                );
                *self.listener.lock() = Some(running);
                let _ = self.shared.status.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(source) => {
                self.shared.mailbox.tear_down();
                let _ = self.shared.status.transition(ConnectionState::Disconnected);
                let address = format!("{}:{}", self.config.host, self.config.port);
                tracing::error!("Failed to start server on {address}: {source:#}");
                Err(BridgeError::TransportStart { address, source })
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        match self.shared.status.transition(ConnectionState::Disconnecting) {
            Ok(_) => {}
            Err(ConnectionState::Disconnected) => return Ok(()),
            Err(state) => {
                return Err(BridgeError::Busy {
                    bridge: SERVER_BRIDGE_NAME,
                    state,
                })
            }
        }

        let running = self.listener.lock().take();
        if let Some(running) = &running {
            running.shutdown.cancel();
        }
        self.shared.mailbox.tear_down();
        let expired = self.shared.pending.expire_all();
        if expired > 0 {
            tracing::info!("Expired {expired} in-flight HTTP exchange(s)");
        }
        self.shared.dialogues.lock().expire_all();

        if let Some(running) = running {
            let mut task = running.task;
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!(
                    "HTTP server bridge did not drain within {}s, aborting",
                    SHUTDOWN_GRACE.as_secs()
                );
                task.abort();
                if let Err(error) = task.await {
                    if !error.is_cancelled() {
                        tracing::error!("HTTP server bridge task failed during teardown: {error}");
                    }
                }
            }
            tracing::info!(
                "HTTP Server has shutdown on port: {}.",
                running.local_addr.port()
            );
        }

        let _ = self.shared.status.transition(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        if !self.shared.status.is_connected() {
            return Err(BridgeError::NotConnected {
                bridge: SERVER_BRIDGE_NAME,
            });
        }
        self.shared.deliver(envelope.message);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Envelope>, BridgeError> {
        self.shared.mailbox.dequeue().await
    }
}

// ── HTTP plumbing ─────────────────────────────────────────────────

fn listener_router(context: Arc<ListenerContext>) -> Router {
    let limit = context.max_body_bytes;
    Router::new()
        .fallback(bridge_request)
        .with_state(context)
        .layer(RequestBodyLimitLayer::new(limit))
}

/// Catch-all handler: every method and path is bridged.
async fn bridge_request(State(context): State<Arc<ListenerContext>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, context.max_body_bytes).await {
        Ok(body) => body.to_vec(),
        Err(error) => {
            tracing::debug!("Rejecting request body: {error}");
            return TransportResponse::new(413, "Payload Too Large").into_http();
        }
    };

    let authority = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(ToString::to_string))
        .unwrap_or_else(|| context.authority.clone());
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());

    let request = TransportRequest {
        method: parts.method.as_str().to_string(),
        url: format!("{}://{authority}{path_and_query}", context.scheme),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body,
    };

    context.shared.handle(request).await.into_http()
}

fn load_tls_acceptor(cert: &Path, key: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs: Vec<rustls_pki_types::CertificateDer<'static>> = rustls_pemfile::certs(
        &mut BufReader::new(
            File::open(cert)
                .with_context(|| format!("Failed to open certificate {}", cert.display()))?,
        ),
    )
    .collect::<Result<_, _>>()
    .context("Failed to parse certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", cert.display());
    }

    let private_key: rustls_pki_types::PrivateKeyDer<'static> = rustls_pemfile::private_key(
        &mut BufReader::new(
            File::open(key).with_context(|| format!("Failed to open private key {}", key.display()))?,
        ),
    )
    .context("Failed to parse private key")?
    .with_context(|| format!("No private key found in {}", key.display()))?;

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("Failed to select TLS protocol versions")?
    .with_no_client_auth()
    .with_single_cert(certs, private_key)
    .context("Certificate and key do not form a valid pair")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) {
    let graceful = GracefulShutdown::new();
    let builder = auto::Builder::new(TokioExecutor::new());

    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!("Failed to accept connection: {error}");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let builder = builder.clone();
        let watcher = graceful.watcher();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::debug!("TLS handshake with {peer} failed: {error}");
                    return;
                }
            };
            let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                router.clone().oneshot(request.map(Body::new))
            });
            let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
            if let Err(error) = watcher.watch(connection).await {
                tracing::debug!("Connection from {peer} ended with error: {error}");
            }
        });
    }

    drop(listener);
    graceful.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::verify::OpenApiSpec;
    use http_body_util::BodyExt;

    const SKILL: &str = "skill/pets:0.1.0";

    fn config() -> ServerBridgeConfig {
        ServerBridgeConfig {
            port: 0,
            target_address: SKILL.into(),
            ..ServerBridgeConfig::default()
        }
    }

    async fn connected(timeout: Duration) -> Arc<ServerBridge> {
        let bridge = ServerBridge::builder(&config())
            .response_timeout(timeout)
            .build()
            .unwrap();
        bridge.connect().await.expect("bind on an ephemeral port");
        Arc::new(bridge)
    }

    /// Minimal in-test skill: answers the next request with `status`.
    async fn answer_next(bridge: &ServerBridge, status_code: u16, headers: &str, body: &[u8]) -> HttpMessage {
        let envelope = bridge.receive().await.unwrap().expect("request envelope");
        let mut skill = Dialogues::new(SKILL, Role::Server);
        let key = skill.update(&envelope.message).expect("skill accepts request");
        let reply = skill
            .reply(
                &key,
                Performative::Response {
                    version: String::new(),
                    status_code,
                    status_text: "Success".into(),
                    headers: headers.into(),
                    body: body.to_vec(),
                },
            )
            .unwrap();
        bridge.send(Envelope::new(reply)).await.unwrap();
        envelope.message
    }

    #[test]
    fn transport_request_splits_path_and_query() {
        let request = TransportRequest::from_url(
            "GET",
            "http://127.0.0.1:8000/pets/1?limit=3#frag",
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(request.path, "/pets/1");
        assert_eq!(request.query.as_deref(), Some("limit=3"));

        let bare = TransportRequest::from_url("GET", "http://host", Vec::new(), Vec::new());
        assert_eq!(bare.path, "/");
        assert!(bare.query.is_none());
    }

    #[test]
    fn reply_is_copied_with_content_length_corrected() {
        let mut dialogues = Dialogues::new(SERVER_BRIDGE_ADDRESS, Role::Client);
        let (mut message, _) = dialogues
            .create(
                SKILL,
                Performative::Request {
                    method: "get".into(),
                    url: "http://x/".into(),
                    version: String::new(),
                    headers: "\n".into(),
                    body: Vec::new(),
                },
            )
            .unwrap();
        message.performative = Performative::Response {
            version: String::new(),
            status_code: 201,
            status_text: "Created".into(),
            headers: "X-Trace: abc\ncontent-length: 999\n\n".into(),
            body: b"Response body".to_vec(),
        };

        let response = TransportResponse::from_reply(&message);
        assert_eq!(response.status_code, 201);
        assert_eq!(response.reason, "Created");
        assert_eq!(response.header("Content-Length"), Some("13"));
        assert_eq!(response.header("x-trace"), Some("abc"));
        assert_eq!(response.body, b"Response body");
    }

    #[tokio::test]
    async fn receive_before_connect_fails_fast() {
        let bridge = ServerBridge::new(&config()).unwrap();
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        assert!(matches!(
            bridge.receive().await,
            Err(BridgeError::NotConnected { .. })
        ));

        let response = bridge
            .handle(TransportRequest::from_url("GET", "http://x/", Vec::new(), Vec::new()))
            .await;
        assert_eq!(response.status_code, 500);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn round_trip_through_the_router() {
        let bridge = connected(Duration::from_secs(5)).await;
        let skill = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                answer_next(
                    &bridge,
                    200,
                    "Content-Type: text/plain\nContent-Length: 999\n\n",
                    b"Response body",
                )
                .await
            })
        };

        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/pets?limit=1")
            .header("host", "example.test")
            .body(Body::empty())
            .unwrap();
        let response = bridge.router().oneshot(request).await.unwrap();

        let forwarded = skill.await.unwrap();
        match &forwarded.performative {
            Performative::Request {
                method,
                url,
                version,
                ..
            } => {
                assert_eq!(method, "get");
                assert_eq!(url, "http://example.test/pets?limit=1");
                assert!(version.is_empty());
            }
            Performative::Response { .. } => panic!("expected a request"),
        }

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-length"], "13");
        assert_eq!(
            response
                .extensions()
                .get::<hyper::ext::ReasonPhrase>()
                .map(hyper::ext::ReasonPhrase::as_bytes),
            Some(&b"Success"[..])
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Response body");
        assert_eq!(bridge.pending_exchanges(), 0);

        bridge.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_request_never_reaches_the_mailbox() {
        let spec = OpenApiSpec::parse(
            "openapi: 3.0.0\npaths:\n  /pets:\n    get: {}\n",
            "http://127.0.0.1:8000",
        )
        .unwrap();
        let bridge = ServerBridge::builder(&config())
            .verifier(Arc::new(spec))
            .build()
            .unwrap();
        bridge.connect().await.unwrap();

        let response = bridge
            .handle(TransportRequest::from_url(
                "GET",
                "http://127.0.0.1:8000/owners",
                Vec::new(),
                Vec::new(),
            ))
            .await;
        assert_eq!(response.status_code, 404);
        assert_eq!(response.reason, "Request Not Found");
        assert!(response.body.is_empty());
        assert_eq!(bridge.pending_exchanges(), 0);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), bridge.receive())
                .await
                .is_err(),
            "nothing may be published for a rejected request"
        );

        bridge.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn silence_times_out_and_late_reply_is_orphaned() {
        let bridge = connected(Duration::from_millis(100)).await;
        let response = bridge
            .handle(TransportRequest::from_url("GET", "http://x/slow", Vec::new(), Vec::new()))
            .await;
        assert_eq!(response.status_code, 408);
        assert_eq!(response.reason, "Request Timeout");
        assert_eq!(bridge.pending_exchanges(), 0);

        let envelope = bridge.receive().await.unwrap().unwrap();
        let mut skill = Dialogues::new(SKILL, Role::Server);
        let key = skill.update(&envelope.message).unwrap();
        let late = skill
            .reply(
                &key,
                Performative::Response {
                    version: String::new(),
                    status_code: 200,
                    status_text: "Success".into(),
                    headers: "\n".into(),
                    body: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(bridge.deliver(late.clone()), Delivery::Orphaned);
        // Same reply again: the dialogue is concluded now.
        assert_eq!(bridge.deliver(late), Delivery::Uncorrelated);

        bridge.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_releases_waiting_requests() {
        let bridge = connected(Duration::from_secs(60)).await;
        let waiter = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .handle(TransportRequest::from_url("GET", "http://x/", Vec::new(), Vec::new()))
                    .await
            })
        };
        let _request = bridge.receive().await.unwrap().unwrap();
        assert_eq!(bridge.pending_exchanges(), 1);

        tokio::time::timeout(Duration::from_secs(2), bridge.disconnect())
            .await
            .expect("disconnect is bounded")
            .unwrap();
        let response = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
        assert_eq!(response.status_code, 408);
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        assert!(bridge.local_addr().is_none());

        bridge.disconnect().await.unwrap();
        assert!(matches!(
            bridge.receive().await,
            Err(BridgeError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn bind_failure_leaves_bridge_disconnected() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let bridge = ServerBridge::new(&ServerBridgeConfig {
            port,
            ..config()
        })
        .unwrap();

        let error = bridge.connect().await.expect_err("port is taken");
        assert!(matches!(error, BridgeError::TransportStart { .. }));
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
        assert!(matches!(
            bridge.receive().await,
            Err(BridgeError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn missing_tls_material_fails_connect() {
        let bridge = ServerBridge::new(&ServerBridgeConfig {
            ssl_cert: Some("/nonexistent/cert.pem".into()),
            ssl_key: Some("/nonexistent/key.pem".into()),
            ..config()
        })
        .unwrap();
        let error = bridge.connect().await.expect_err("no certificate");
        assert!(error.to_string().contains("Failed to open certificate"));
        assert_eq!(bridge.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn send_requires_a_connection() {
        let bridge = ServerBridge::new(&config()).unwrap();
        let mut skill_side = Dialogues::new(SKILL, Role::Client);
        let (message, _) = skill_side
            .create(
                SERVER_BRIDGE_ADDRESS,
                Performative::Request {
                    method: "get".into(),
                    url: "http://x/".into(),
                    version: String::new(),
                    headers: "\n".into(),
                    body: Vec::new(),
                },
            )
            .unwrap();
        assert!(matches!(
            bridge.send(Envelope::new(message)).await,
            Err(BridgeError::NotConnected { .. })
        ));
    }

    async fn connected_with(config: ServerBridgeConfig, timeout: Duration) -> Arc<ServerBridge> {
        let bridge = ServerBridge::builder(&config)
            .response_timeout(timeout)
            .build()
            .unwrap();
        bridge.connect().await.unwrap();
        Arc::new(bridge)
    }

    fn spawn_handle(bridge: &Arc<ServerBridge>, url: &str) -> JoinHandle<TransportResponse> {
        let bridge = Arc::clone(bridge);
        let url = url.to_string();
        tokio::spawn(async move {
            bridge
                .handle(TransportRequest::from_url("GET", url, Vec::new(), Vec::new()))
                .await
        })
    }

    #[tokio::test]
    async fn full_bridge_refuses_new_work_and_keeps_live_exchanges() {
        let bridge = connected_with(
            ServerBridgeConfig {
                max_open_dialogues: 1,
                ..config()
            },
            Duration::from_secs(5),
        )
        .await;

        let first = spawn_handle(&bridge, "http://x/first");
        let envelope = bridge.receive().await.unwrap().unwrap();

        let second = bridge
            .handle(TransportRequest::from_url("GET", "http://x/second", Vec::new(), Vec::new()))
            .await;
        assert_eq!(second.status_code, 503);
        assert_eq!(second.reason, "Service Unavailable");

        let mut skill = Dialogues::new(SKILL, Role::Server);
        let key = skill.update(&envelope.message).unwrap();
        let reply = skill
            .reply(
                &key,
                Performative::Response {
                    version: String::new(),
                    status_code: 200,
                    status_text: "Success".into(),
                    headers: "\n".into(),
                    body: b"first".to_vec(),
                },
            )
            .unwrap();
        assert_eq!(bridge.deliver(reply), Delivery::Delivered);

        let first = first.await.unwrap();
        assert_eq!(first.status_code, 200);
        assert_eq!(first.body, b"first");
        bridge.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_exchanges_make_room_for_new_ones() {
        let bridge = connected_with(
            ServerBridgeConfig {
                max_open_dialogues: 1,
                ..config()
            },
            Duration::from_millis(50),
        )
        .await;

        let stale = bridge
            .handle(TransportRequest::from_url("GET", "http://x/stale", Vec::new(), Vec::new()))
            .await;
        assert_eq!(stale.status_code, 408);
        let _stale = bridge.receive().await.unwrap().unwrap();

        let fresh = spawn_handle(&bridge, "http://x/fresh");
        let envelope = bridge.receive().await.unwrap().unwrap();
        let mut skill = Dialogues::new(SKILL, Role::Server);
        let key = skill.update(&envelope.message).unwrap();
        let reply = skill
            .reply(
                &key,
                Performative::Response {
                    version: String::new(),
                    status_code: 204,
                    status_text: "No Content".into(),
                    headers: "\n".into(),
                    body: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(bridge.deliver(reply), Delivery::Delivered);
        assert_eq!(fresh.await.unwrap().status_code, 204);
        bridge.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn internal_status_codes_never_reach_the_wire() {
        let bridge = connected(Duration::from_secs(5)).await;
        let skill = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { answer_next(&bridge, 600, "\n", b"boom").await })
        };

        let request = axum::http::Request::builder()
            .uri("/pets")
            .header("host", "example.test")
            .body(Body::empty())
            .unwrap();
        let response = bridge.router().oneshot(request).await.unwrap();
        skill.await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
        bridge.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn api_spec_file_gates_requests() {
        let dir = tempfile::tempdir().unwrap();
        let spec_path = dir.path().join("pets.yaml");
        std::fs::write(
            &spec_path,
            "openapi: 3.0.0\nservers:\n  - url: http://pets.test\npaths:\n  /pets/{petId}:\n    get: {}\n",
        )
        .unwrap();

        let bridge = connected_with(
            ServerBridgeConfig {
                api_spec_path: Some(spec_path),
                ..config()
            },
            Duration::from_secs(5),
        )
        .await;

        let unknown = bridge
            .handle(TransportRequest::from_url("GET", "http://pets.test/owners", Vec::new(), Vec::new()))
            .await;
        assert_eq!(unknown.status_code, 404);
        let wrong_method = bridge
            .handle(TransportRequest::from_url("DELETE", "http://pets.test/pets/7", Vec::new(), Vec::new()))
            .await;
        assert_eq!(wrong_method.status_code, 404);
        assert_eq!(bridge.pending_exchanges(), 0);

        let known = spawn_handle(&bridge, "http://pets.test/pets/7");
        let published = answer_next(&bridge, 200, "\n", b"rex").await;
        assert!(matches!(
            published.performative,
            Performative::Request { ref url, .. } if url == "http://pets.test/pets/7"
        ));
        assert_eq!(known.await.unwrap().status_code, 200);
        bridge.disconnect().await.unwrap();
    }

    #[test]
    fn unreadable_api_spec_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let Err(error) = ServerBridge::new(&ServerBridgeConfig {
            api_spec_path: Some(dir.path().join("missing.yaml")),
            ..config()
        }) else {
            panic!("spec file does not exist");
        };
        assert!(format!("{error:#}").contains("Failed to read API spec"));

        let garbage = dir.path().join("garbage.yaml");
        std::fs::write(&garbage, "openapi: 3.0.0\n").unwrap();
        assert!(ServerBridge::new(&ServerBridgeConfig {
            api_spec_path: Some(garbage),
            ..config()
        })
        .is_err());
    }
}
