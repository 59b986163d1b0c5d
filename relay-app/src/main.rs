//! relaychat: a single-endpoint chat relay with a local fallback responder.

mod chat;
mod client_ip;
mod config;
mod conversation;
mod fallback;
mod history;
mod rate_limit;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::fmt::format::{DefaultFields, FmtSpan, Format};

#[derive(Debug, Parser)]
#[command(name = "relaychat", version, about = "Chat relay with an offline fallback")]
struct Cli {
    /// Path to a TOML config file. Defaults to ./relaychat.toml when present.
    #[arg(long, global = true, env = "RELAYCHAT_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Load and validate config, then print the effective settings.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    fn parse(raw: Option<&str>) -> anyhow::Result<Self> {
        match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("json") => Ok(Self::Json),
            Some("pretty") => Ok(Self::Pretty),
            Some("compact") => Ok(Self::Compact),
            Some(other) => Err(anyhow::anyhow!(
                "unsupported RELAYCHAT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            )),
        }
    }
}

fn base_subscriber(env_filter: EnvFilter) -> SubscriberBuilder<DefaultFields, Format, EnvFilter> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,relaychat=debug,relay_app=debug,relay_llm=debug,tower_http=info")
    });
    let log_format = LogFormat::parse(std::env::var("RELAYCHAT_LOG_FORMAT").ok().as_deref())?;

    let subscriber = base_subscriber(env_filter);
    match log_format {
        LogFormat::Json => subscriber
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Compact => subscriber.compact().init(),
    }

    tracing::info!(
        log_format = ?log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            panic_location = %location,
            panic_payload = %server::panic_payload_to_string(panic_info.payload()),
            "panic captured"
        );
        default_hook(panic_info);
    }));
}
