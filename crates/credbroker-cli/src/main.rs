//! Thin Unix-socket client for the credential broker daemon.
//!
//! Sends one newline-delimited JSON request per invocation and prints the
//! response. This binary does not implement rotation hooks, heartbeat
//! configuration, or anything else that belongs to the daemon — it only
//! speaks the wire protocol.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "credbroker", about = "Client for the local credential broker daemon")]
struct Cli {
    /// Path to the daemon's Unix socket.
    #[arg(long, env = "CREDBROKER_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initializes the broker's identity and store.
    Init,
    /// Adds a new secret.
    Add {
        reference: String,
        value: String,
        #[arg(long)]
        rotate_via: Option<String>,
    },
    /// Deletes a secret and revokes its leases.
    Delete { reference: String },
    /// Lists secret metadata (never values).
    List {
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Acquires a time-bounded lease on a secret, returning its value.
    Lease {
        reference: String,
        #[arg(long)]
        client_id: String,
        #[arg(long, default_value_t = 0)]
        ttl_secs: i64,
    },
    /// Revokes a single lease.
    Revoke { lease_id: String },
    /// Revokes every active lease, or every active lease in one namespace.
    RevokeAll {
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Rotates one secret, or every secret with a rotation hook.
    Rotate { reference: Option<String> },
    /// Shows recent audit entries.
    Audit {
        #[arg(long, default_value_t = 20)]
        tail: usize,
    },
    /// Shows broker status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli
        .socket
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".credbroker/broker.sock")))
        .context("no socket path configured: pass --socket or set CREDBROKER_SOCKET")?;

    let (method, params) = build_request(cli.command);
    let response = send_request(&socket_path, &method, params).await?;

    if let Some(error) = response.get("error") {
        bail!(
            "broker error {}: {}",
            error["code"],
            error["message"].as_str().unwrap_or("unknown error")
        );
    }

    println!("{}", serde_json::to_string_pretty(&response["result"])?);
    Ok(())
}

fn build_request(command: Commands) -> (String, Value) {
    match command {
        Commands::Init => ("init".to_string(), json!({})),
        Commands::Add {
            reference,
            value,
            rotate_via,
        } => (
            "add".to_string(),
            json!({ "reference": reference, "value": value, "rotate_via": rotate_via }),
        ),
        Commands::Delete { reference } => {
            ("delete".to_string(), json!({ "reference": reference }))
        }
        Commands::List { namespace } => ("list".to_string(), json!({ "namespace": namespace })),
        Commands::Lease {
            reference,
            client_id,
            ttl_secs,
        } => (
            "lease".to_string(),
            json!({ "reference": reference, "client_id": client_id, "ttl_secs": ttl_secs }),
        ),
        Commands::Revoke { lease_id } => {
            ("revoke".to_string(), json!({ "lease_id": lease_id }))
        }
        Commands::RevokeAll { namespace } => {
            ("revokeAll".to_string(), json!({ "namespace": namespace }))
        }
        Commands::Rotate { reference } => {
            ("rotate".to_string(), json!({ "reference": reference }))
        }
        Commands::Audit { tail } => ("audit".to_string(), json!({ "tail": tail })),
        Commands::Status => ("status".to_string(), json!({})),
    }
}

async fn send_request(socket_path: &PathBuf, method: &str, params: Value) -> Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    let request = json!({ "id": 1, "method": method, "params": params });
    let mut line = serde_json::to_vec(&request)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    let response_line = lines
        .next_line()
        .await?
        .context("connection closed before a response was received")?;
    Ok(serde_json::from_str(&response_line)?)
}
