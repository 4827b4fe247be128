//! textveil command-line gateway
//!
//! Reads one JSON chat-completion request per stdin line, screens it,
//! forwards it upstream, and writes the reversed response to stdout.
//! Logs go to stderr so stdout stays a clean protocol channel.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;
use textveil_core::{Decision, Gateway, Protocol, RequestContext, UpstreamClient};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "info", help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: String,

    #[arg(long, default_value = "openai", help = "Wire protocol: openai or anthropic")]
    pub protocol: String,

    #[arg(long, help = "Tenant identifier for screening, audit, and key derivation")]
    pub tenant: String,

    #[arg(long, help = "Pseudonym session identifier (defaults to a fresh UUID)")]
    pub session: Option<String>,

    #[arg(long, help = "Override the configured upstream base URL")]
    pub upstream: Option<String>,
}

impl Args {
    pub fn protocol(&self) -> Result<Protocol> {
        Protocol::from_str(&self.protocol)
    }

    pub fn upstream_path(&self) -> Result<&'static str> {
        Ok(match self.protocol()? {
            Protocol::OpenAiChat => "/v1/chat/completions",
            Protocol::AnthropicMessages => "/v1/messages",
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log_level.parse::<tracing::Level>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", args.log_level);
        tracing::Level::INFO
    });

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting textveil gateway");

    let mut config = match args.config.as_ref() {
        Some(config_path) => {
            info!("Loading configuration from: {}", config_path.display());
            textveil_core::Config::from_file(config_path)?
        }
        None => match textveil_core::Config::get_default_config_path() {
            Ok(default_path) if default_path.exists() => {
                info!(
                    "Loading configuration from default location: {}",
                    default_path.display()
                );
                textveil_core::Config::from_file(&default_path)?
            }
            Ok(default_path) => {
                info!("Creating default configuration at: {}", default_path.display());
                let mut config = textveil_core::Config::default();
                config.resolve_paths()?;
                config.to_file(&default_path)?;
                config
            }
            Err(_) => {
                info!("Using default configuration (could not determine config directory)");
                let mut config = textveil_core::Config::default();
                config.resolve_paths()?;
                config
            }
        },
    };

    if let Some(upstream) = args.upstream.as_ref() {
        config.gateway.upstream_url = upstream.clone();
    }

    config.validate()?;
    info!("Configuration validated successfully");

    let protocol = args.protocol()?;
    let path = args.upstream_path()?;

    let upstream = UpstreamClient::new(
        &config.gateway.upstream_url,
        config.gateway.upstream_max_retries,
        std::time::Duration::from_millis(config.gateway.upstream_backoff_ms),
    )?;
    let gateway = Gateway::new(config)?;

    let ctx = RequestContext {
        tenant_id: args.tenant.clone(),
        session_id: args
            .session
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ..Default::default()
    };

    info!(
        "Gateway ready: tenant '{}', session '{}', protocol '{}'",
        ctx.tenant_id, ctx.session_id, args.protocol
    );

    run_loop(&gateway, &upstream, protocol, path, &ctx).await
}

async fn run_loop(
    gateway: &Gateway,
    upstream: &UpstreamClient,
    protocol: Protocol,
    path: &str,
    ctx: &RequestContext,
) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let body: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping unparseable request line: {}", e);
                continue;
            }
        };

        let outcome = gateway.screen_request(protocol, &body, ctx).await?;
        let forwarded = match outcome.decision {
            Decision::Block { status, body } => {
                info!("Request blocked with status {}", status);
                writeln!(stdout, "{}", serde_json::to_string(&body)?)?;
                stdout.flush()?;
                continue;
            }
            Decision::Forward(body) => body,
        };

        let streaming = forwarded
            .get("stream")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if streaming {
            let mut response = upstream.post_stream(path, &forwarded).await?;
            let mut transform = gateway.stream_transform(protocol, ctx)?;

            while let Some(chunk) = response.chunk().await? {
                let out = transform.transform_chunk(&chunk)?;
                stdout.write_all(&out)?;
                stdout.flush()?;
            }
            let tail = transform.finish()?;
            stdout.write_all(&tail)?;
        } else {
            let (status, response) = upstream.post_json(path, &forwarded).await?;
            let restored = if status < 400 {
                gateway.screen_response(protocol, &response, ctx)?
            } else {
                response
            };
            writeln!(stdout, "{}", serde_json::to_string(&restored)?)?;
        }
        stdout.flush()?;
    }

    info!("stdin closed, shutting down");
    Ok(())
}
