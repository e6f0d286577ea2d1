//! courier-ctl — command-line client for a running courierd.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use courier_core::config::{CourierConfig, SocketSettings};
use courier_core::keystore::KeyStore;
use courier_core::Message;
use courier_services::{ChunkManager, FailurePolicy};
use courierd::ClientDispatcher;

// ── Output ────────────────────────────────────────────────────────────────────

fn print_reply(reply: &Message) -> Result<()> {
    println!("type:    {:?}", reply.kind);
    println!("from:    {}", reply.owner_id);
    println!("bytes:   {}", reply.body.len());
    println!(
        "headers: {}",
        serde_json::to_string_pretty(&reply.headers).context("failed to render headers")?
    );
    if reply.is_file() {
        if let Some(name) = reply.headers.file_name() {
            println!("file:    {name}");
        }
    } else {
        println!();
        println!("{}", reply.body_text());
    }
    Ok(())
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_handshake(client: &ClientDispatcher, settings: &SocketSettings) -> Result<()> {
    let key = client
        .handshake(settings)
        .await
        .with_context(|| format!("handshake with {} failed (is courierd running?)", settings.endpoint()))?;
    println!("server key:       {}", key.public_key.to_hex());
    println!("server signature: {}", key.signature);
    Ok(())
}

async fn cmd_send(client: &ClientDispatcher, settings: &SocketSettings, text: &str) -> Result<()> {
    cmd_handshake(client, settings).await?;
    let reply = client.send_text(text, settings).await.context("send failed")?;
    print_reply(&reply)
}

async fn cmd_send_file(client: &ClientDispatcher, settings: &SocketSettings, path: &str) -> Result<()> {
    cmd_handshake(client, settings).await?;
    let reply = client
        .send_file(Path::new(path), settings)
        .await
        .with_context(|| format!("sending {path} failed"))?;
    print_reply(&reply)
}

fn print_usage() {
    println!("Usage: courier-ctl [--host <host>] [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  handshake          Exchange keys with the server");
    println!("  send <text>        Send a text message and print the reply");
    println!("  send-file <path>   Upload a file and print the reply");
    println!();
    println!("Options:");
    println!("  --host <host>   Server host (default: from config)");
    println!("  --port <port>   Server port (default: from config)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = CourierConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CourierConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --host / --port options
    let mut host = config.network.host.clone();
    let mut port = config.network.port;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                host = args.get(i).context("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    if matches!(remaining.as_slice(), [] | ["help"] | ["--help"] | ["-h"]) {
        print_usage();
        return Ok(());
    }

    let name = format!("{}-ctl", config.identity.name);
    let identity = KeyStore::new(&config.identity.keystore_root)
        .identity(&name)
        .with_context(|| format!("failed to load identity {name:?}"))?;
    let chunks = Arc::new(ChunkManager::new(Duration::from_secs(config.chunks.group_ttl_secs)));
    let client = ClientDispatcher::new(identity, FailurePolicy::from_strict(config.codec.strict), chunks)
        .with_reply_policy(config.client.reply_policy);
    let settings = config.socket_settings(name).host(host).port(port);

    match remaining.as_slice() {
        ["handshake"]           => cmd_handshake(&client, &settings).await,
        ["send", text @ ..] if !text.is_empty() => cmd_send(&client, &settings, &text.join(" ")).await,
        ["send-file", path]     => cmd_send_file(&client, &settings, path).await,
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
