use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level clawbridge configuration, loaded from `config.toml`.
///
/// Resolution order: `--config` path, then `~/.clawbridge/config.toml`.
/// Environment overrides are applied after the file is parsed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Inbound HTTP bridge (`[server]`).
    #[serde(default)]
    pub server: ServerBridgeConfig,

    /// Outbound HTTP bridge (`[client]`).
    #[serde(default)]
    pub client: ClientBridgeConfig,
}

// ── Server bridge ─────────────────────────────────────────────────

/// Inbound bridge configuration (`[server]` section).
///
/// Controls where the HTTP listener binds, which internal address receives
/// bridged requests, and how long an exchange may wait for its reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServerBridgeConfig {
    /// Listener host (default: 127.0.0.1)
    #[serde(default = "default_server_host")]
    pub host: String,
    /// Listener port (default: 8000)
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Internal address that receives bridged requests.
    #[serde(default = "default_target_address")]
    pub target_address: String,
    /// Optional OpenAPI / Swagger document used to verify inbound requests.
    #[serde(default)]
    pub api_spec_path: Option<PathBuf>,
    /// PEM certificate chain. Set together with `ssl_key` to serve HTTPS.
    #[serde(default)]
    pub ssl_cert: Option<PathBuf>,
    /// PEM private key. Set together with `ssl_cert` to serve HTTPS.
    #[serde(default)]
    pub ssl_key: Option<PathBuf>,
    /// Seconds an inbound request waits for its reply before answering 408.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    /// Largest accepted request body in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Upper bound on retained dialogues.
    #[serde(default = "default_max_open_dialogues")]
    pub max_open_dialogues: usize,
    /// Put internal error detail into 500 bodies. Debugging only.
    #[serde(default)]
    pub expose_errors: bool,
}

fn default_server_host() -> String {
    "127.0.0.1".into()
}

fn default_server_port() -> u16 {
    8000
}

fn default_target_address() -> String {
    "clawbridge/relay:0.1.0".into()
}

fn default_response_timeout_secs() -> u64 {
    150
}

fn default_max_body_bytes() -> usize {
    1_048_576
}

fn default_max_open_dialogues() -> usize {
    10_000
}

impl Default for ServerBridgeConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            target_address: default_target_address(),
            api_spec_path: None,
            ssl_cert: None,
            ssl_key: None,
            response_timeout_secs: default_response_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            max_open_dialogues: default_max_open_dialogues(),
            expose_errors: false,
        }
    }
}

impl ServerBridgeConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    /// Certificate and key paths when TLS is configured.
    pub fn tls(&self) -> Option<(&Path, &Path)> {
        match (&self.ssl_cert, &self.ssl_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    /// Base URL the bridge is reachable under, e.g. `http://127.0.0.1:8000`.
    pub fn server_address(&self) -> String {
        let scheme = if self.tls().is_some() { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

// ── Client bridge ─────────────────────────────────────────────────

/// Outbound bridge configuration (`[client]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClientBridgeConfig {
    /// Total time budget for one outbound call, in seconds (default: 300)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// TCP connect timeout, in seconds (default: 10)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound on concurrently answered requests; further ones get the
    /// error reply straight away.
    #[serde(default = "default_max_open_dialogues")]
    pub max_open_dialogues: usize,
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ClientBridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_open_dialogues: default_max_open_dialogues(),
        }
    }
}

impl ClientBridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ── Loading ───────────────────────────────────────────────────────

/// `~/.clawbridge/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".clawbridge").join("config.toml"))
}

impl Config {
    /// Load the config at `path` (or the default location), writing a default
    /// file first when none exists.
    pub async fn load_or_init(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path()?,
        };

        let (mut config, initialized) = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            (config, false)
        } else {
            let config = Config {
                config_path,
                ..Config::default()
            };
            config.save().await?;
            (config, true)
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Write the config to `config_path` as pretty TOML.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;
        fs::write(&self.config_path, toml_str)
            .await
            .with_context(|| format!("Failed to write config file {}", self.config_path.display()))?;
        Ok(())
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("server.host must not be empty");
        }
        if self.server.target_address.trim().is_empty() {
            anyhow::bail!("server.target_address must not be empty");
        }
        if self.server.response_timeout_secs == 0 {
            anyhow::bail!("server.response_timeout_secs must be greater than 0");
        }
        if self.server.max_body_bytes == 0 {
            anyhow::bail!("server.max_body_bytes must be greater than 0");
        }
        if self.server.ssl_cert.is_some() != self.server.ssl_key.is_some() {
            anyhow::bail!("Please specify both server.ssl_cert and server.ssl_key or neither");
        }
        if self.client.request_timeout_secs == 0 {
            anyhow::bail!("client.request_timeout_secs must be greater than 0");
        }
        if self.client.connect_timeout_secs == 0 {
            anyhow::bail!("client.connect_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CLAWBRIDGE_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }

        if let Ok(port) = std::env::var("CLAWBRIDGE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(target) = std::env::var("CLAWBRIDGE_TARGET") {
            if !target.is_empty() {
                self.server.target_address = target;
            }
        }

        if let Ok(timeout_secs) = std::env::var("CLAWBRIDGE_RESPONSE_TIMEOUT_SECS") {
            if let Ok(timeout_secs) = timeout_secs.parse::<u64>() {
                if timeout_secs > 0 {
                    self.server.response_timeout_secs = timeout_secs;
                }
            }
        }

        if let Ok(timeout_secs) = std::env::var("CLAWBRIDGE_REQUEST_TIMEOUT_SECS") {
            if let Ok(timeout_secs) = timeout_secs.parse::<u64>() {
                if timeout_secs > 0 {
                    self.client.request_timeout_secs = timeout_secs;
                }
            }
        }
    }
}
