use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use chatrelay_core::{
    blocks::{Block, parse_blocks, parse_chunks},
    buffer::ContentBuffer,
    config::{Config, RelayMethod, ResponseMode},
    http_client::{HttpClient, sse_lines},
    model::{ChatCompletionChunk, ChatMessage},
    relay::{ChatRelay, Relay, RelayOutput, RelayRequest},
    server::{AppState, run_server},
    stream::{ByteStream, StreamEvent, chunk_events},
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chat relay server and block parser", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP relay server
    Serve {
        /// JSON or TOML config; the built-in endpoint set when omitted
        #[arg(long, env = "CHATRELAY_CONFIG")]
        config: Option<PathBuf>,
        /// Listen address, overrides `server.bind`
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Send one message through a relay (prints deltas live, then a block summary)
    Chat {
        #[arg(long)]
        relay: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long, env = "CHATRELAY_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Segment text (or a JSON array of completion chunks) into blocks
    Blocks {
        /// Input is a JSON array of completion chunks
        #[arg(long)]
        chunks: bool,
        /// Read from this file instead of stdin
        file: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::from_path(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(Config::builtin()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed");
    }
    tracing::info!("shutting down");
}

async fn serve(config: Option<PathBuf>, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    let cfg = load_config(config.as_ref())?;
    let addr = match bind {
        Some(addr) => addr,
        None => cfg
            .server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", cfg.server.bind))?,
    };
    let state = AppState::from_config(&cfg)?;
    tracing::info!(relays = ?state.relays.names(), %addr, "chatrelay starting");
    run_server(state, addr, shutdown_signal()).await?;
    Ok(())
}

/// Print an SSE reply as it arrives and return the accumulated text.
async fn print_reply(mode: ResponseMode, body: ByteStream) -> anyhow::Result<ContentBuffer> {
    let mut out = std::io::stdout();
    let mut buf = ContentBuffer::new();
    if mode == ResponseMode::Collect {
        let mut lines = sse_lines(body);
        let mut reply = Vec::new();
        while let Some(line) = lines.next().await {
            let line = line?.line;
            if line == "event: end" {
                break;
            }
            if let Some(data) = line.strip_prefix("data: ") {
                reply.push(data.to_string());
            }
        }
        buf.push_str(&reply.join("\n"));
        writeln!(out, "{}", buf.as_str())?;
        return Ok(buf);
    }

    let mut events = chunk_events(sse_lines(body));
    while let Some(ev) = events.next().await {
        if let Some(text) = ev.as_text_delta() {
            write!(out, "{text}")?;
            out.flush()?;
        }
        match ev {
            StreamEvent::Chunk(chunk) => buf.push_chunk(&chunk),
            StreamEvent::Done => break,
            StreamEvent::Error(e) => return Err(e.into()),
            _ => {}
        }
    }
    writeln!(out)?;
    if let Some(reason) = buf.stop_reason() {
        eprintln!("[stop: {reason:?}]");
    }
    Ok(buf)
}

fn summarize(blocks: &[Block]) {
    let languages: Vec<&str> = blocks
        .iter()
        .filter_map(|b| match b {
            Block::Code {
                inline: false,
                language,
                ..
            } => Some(language.as_str()),
            _ => None,
        })
        .collect();
    let code = blocks.iter().filter(|b| b.is_code()).count();
    eprintln!(
        "[blocks: {} text, {} code, fenced languages: {:?}]",
        blocks.len() - code,
        code,
        languages
    );
}

async fn chat(relay_name: String, message: String, config: Option<PathBuf>) -> anyhow::Result<()> {
    let cfg = load_config(config.as_ref())?;
    let profile = cfg
        .relays
        .iter()
        .find(|r| r.name == relay_name)
        .cloned()
        .with_context(|| format!("no relay named '{relay_name}'"))?;
    let mode = profile.response;
    let http = HttpClient::new(&cfg.http)?;
    let relay = Relay::from_profile(profile, http, &|k| std::env::var(k).ok());

    let req = match relay.method() {
        RelayMethod::Post => RelayRequest::messages(Some(vec![ChatMessage::user(message)])),
        RelayMethod::Get => RelayRequest::prompt(Some(message), None),
    };
    let buf = match relay.relay(req).await? {
        RelayOutput::Stream(body) => print_reply(mode, body).await?,
        RelayOutput::Json(value) => {
            let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            println!("{text}");
            let mut buf = ContentBuffer::new();
            buf.push_str(&text);
            buf
        }
    };
    summarize(&buf.finish());
    Ok(())
}

async fn blocks(chunks: bool, file: Option<PathBuf>) -> anyhow::Result<()> {
    let input = match file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut s = String::new();
            tokio::io::stdin().read_to_string(&mut s).await?;
            s
        }
    };
    let blocks = if chunks {
        let parsed: Vec<ChatCompletionChunk> =
            serde_json::from_str(&input).context("expected a JSON array of completion chunks")?;
        parse_chunks(&parsed)
    } else {
        parse_blocks(&input)
    };
    println!("{}", serde_json::to_string_pretty(&blocks)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, bind } => serve(config, bind).await,
        Commands::Chat {
            relay,
            message,
            config,
        } => chat(relay, message, config).await,
        Commands::Blocks { chunks, file } => blocks(chunks, file).await,
    }
}
