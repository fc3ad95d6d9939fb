#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clawbridge::bridge::{ClientBridge, Connection, ServerBridge};
use clawbridge::protocol::{headers_to_string, Dialogues, Envelope, Performative, Role};
use clawbridge::relay::{Consumer, EchoResponder, UpstreamRelay};
use clawbridge::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Address the `fetch` command speaks from.
const CLI_ADDRESS: &str = "clawbridge/cli:0.1.0";

/// `clawbridge` - bridge live HTTP exchanges onto an agent message bus.
#[derive(Parser, Debug)]
#[command(name = "clawbridge")]
#[command(author = "theonlyhennygod")]
#[command(version)]
#[command(about = "HTTP <-> message bus bridge.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.clawbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server bridge with an in-process consumer
    #[command(long_about = "\
Run the server bridge with an in-process consumer.

Every inbound HTTP request is published as a request message. By default an \
echo responder answers it; with --upstream the request is relayed to that \
base URL through a client bridge.

Examples:
  clawbridge serve                               # echo responder
  clawbridge serve -p 0                          # random available port
  clawbridge serve --upstream http://127.0.0.1:9000")]
    Serve {
        /// Relay every request to this base URL
        #[arg(long)]
        upstream: Option<String>,

        /// Port to listen on; defaults to config server.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config server.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Perform one HTTP call through a client bridge and print the reply
    Fetch {
        url: String,

        /// Request method
        #[arg(short = 'X', long = "request", default_value = "GET")]
        method: String,

        /// Request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short = 'd', long = "data")]
        data: Option<String>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the JSON schema of the config file
    Schema,
    /// Load, validate and print the effective config
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for Rustls TLS.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Schema output must stay stdout-only: no config load, no logging.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let mut config = Config::load_or_init(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Schema => unreachable!(),
            ConfigCommands::Check => {
                println!("# {}", config.config_path.display());
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        },
        Commands::Serve {
            upstream,
            port,
            host,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            serve(&config, upstream).await
        }
        Commands::Fetch {
            url,
            method,
            headers,
            data,
        } => fetch(&config, url, &method, &headers, data).await,
    }
}

async fn serve(config: &Config, upstream: Option<String>) -> Result<()> {
    let server = Arc::new(ServerBridge::new(&config.server)?);
    server.connect().await?;

    let client = match &upstream {
        Some(_) => {
            let client = Arc::new(ClientBridge::new(&config.client)?);
            client.connect().await?;
            Some(client)
        }
        None => None,
    };
    let consumer: Arc<dyn Consumer> = match (&upstream, &client) {
        (Some(upstream), Some(client)) => Arc::new(UpstreamRelay::new(
            Arc::clone(&server),
            Arc::clone(client),
            upstream.clone(),
            config.client.request_timeout(),
        )),
        _ => Arc::new(EchoResponder::new(Arc::clone(&server))),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {e}");
                return;
            }
            info!("Received Ctrl-C, shutting down");
            shutdown.cancel();
        }
    });

    let outcome = consumer.run(shutdown.clone()).await;
    if !shutdown.is_cancelled() {
        warn!("Consumer stopped before shutdown was requested");
    }

    server.disconnect().await?;
    if let Some(client) = client {
        client.disconnect().await?;
    }
    outcome
}

/// Turn `-H "Name: value"` arguments into a bus header block.
fn header_block(headers: &[String]) -> Result<String> {
    let mut pairs = Vec::with_capacity(headers.len());
    for raw in headers {
        let Some((name, value)) = raw.split_once(':') else {
            bail!("Malformed header {raw:?}, expected `Name: value`");
        };
        pairs.push((name.trim(), value.trim()));
    }
    Ok(headers_to_string(pairs))
}

async fn fetch(
    config: &Config,
    url: String,
    method: &str,
    headers: &[String],
    data: Option<String>,
) -> Result<()> {
    let client = ClientBridge::new(&config.client)?;
    client.connect().await?;

    let mut dialogues = Dialogues::new(CLI_ADDRESS, Role::Client);
    let (request, key) = dialogues.create(
        client.address(),
        Performative::Request {
            method: method.to_ascii_lowercase(),
            url,
            version: String::new(),
            headers: header_block(headers)?,
            body: data.map(String::into_bytes).unwrap_or_default(),
        },
    )?;
    client.send(Envelope::new(request)).await?;

    let envelope = client
        .receive()
        .await?
        .context("Client bridge closed before replying")?;
    let reply_key = dialogues.update(&envelope.message)?;
    if reply_key != key {
        bail!("Reply belongs to dialogue {reply_key}, expected {key}");
    }

    if let Performative::Response {
        status_code,
        status_text,
        headers,
        body,
        ..
    } = &envelope.message.performative
    {
        println!("{status_code} {status_text}");
        print!("{headers}");
        println!("{}", String::from_utf8_lossy(body));
    }

    client.disconnect().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn fetch_accepts_curl_style_flags() {
        let cli = Cli::try_parse_from([
            "clawbridge",
            "fetch",
            "http://localhost:9000/pets",
            "-X",
            "POST",
            "-H",
            "Content-Type: application/json",
            "-H",
            "X-Trace: 1",
            "-d",
            "{}",
        ])
        .expect("fetch arguments should parse");

        match cli.command {
            Commands::Fetch {
                url,
                method,
                headers,
                data,
            } => {
                assert_eq!(url, "http://localhost:9000/pets");
                assert_eq!(method, "POST");
                assert_eq!(headers.len(), 2);
                assert_eq!(data.as_deref(), Some("{}"));
            }
            other => panic!("expected fetch command, got {other:?}"),
        }
    }

    #[test]
    fn serve_accepts_upstream_and_port() {
        let cli = Cli::try_parse_from([
            "clawbridge",
            "--config",
            "/tmp/bridge.toml",
            "serve",
            "--upstream",
            "http://127.0.0.1:9000",
            "-p",
            "0",
        ])
        .expect("serve arguments should parse");

        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/bridge.toml")));
        match cli.command {
            Commands::Serve { upstream, port, .. } => {
                assert_eq!(upstream.as_deref(), Some("http://127.0.0.1:9000"));
                assert_eq!(port, Some(0));
            }
            other => panic!("expected serve command, got {other:?}"),
        }
    }

    #[test]
    fn header_block_rejects_malformed_headers() {
        assert_eq!(
            header_block(&["Accept: text/plain".into()]).unwrap(),
            "Accept: text/plain\n\n"
        );
        assert!(header_block(&["no-colon".into()]).is_err());
    }
}
