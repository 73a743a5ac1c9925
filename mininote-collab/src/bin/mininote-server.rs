//! mininote sync server binary.
//!
//! Usage:
//!   # In-memory mode (ephemeral)
//!   MININOTE_JWT_SECRET=dev cargo run -p mininote-collab --bin mininote-server
//!
//!   # Persistent mode
//!   cargo run -p mininote-collab --bin mininote-server -- \
//!       --jwt-secret dev --storage-path ./mininote_data
//!
//! `RUST_LOG=debug` for per-event logging.

use std::path::PathBuf;

use clap::builder::NonEmptyStringValueParser;
use clap::Parser;

use mininote_collab::{JoinPolicy, ReconstructMode, ServerConfig, SyncServer};

/// Real-time sync server for block notes.
#[derive(Parser, Debug)]
#[command(name = "mininote-server")]
#[command(about = "WebSocket sync server for collaborative block notes")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "MININOTE_BIND_ADDR", default_value = "127.0.0.1:9090")]
    bind_addr: String,

    /// HS256 secret used to verify credential tokens
    #[arg(
        long,
        env = "MININOTE_JWT_SECRET",
        hide_env_values = true,
        value_parser = NonEmptyStringValueParser::new()
    )]
    jwt_secret: String,

    /// RocksDB directory; omit to keep documents in memory
    #[arg(long, env = "MININOTE_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// What JoinNote does while already joined elsewhere: switch | reject
    #[arg(long, env = "MININOTE_JOIN_POLICY", default_value = "switch")]
    join_policy: JoinPolicy,

    /// Content sent to clients: full-tree | shallow
    #[arg(long, env = "MININOTE_CONTENT_MODE", default_value = "full-tree")]
    content_mode: ReconstructMode,

    /// Frames buffered per session before dropping
    #[arg(long, env = "MININOTE_OUTBOX_CAPACITY", default_value_t = 256)]
    outbox_capacity: usize,

    /// Upper bound on a single store call, in milliseconds
    #[arg(long, env = "MININOTE_STORE_TIMEOUT_MS", default_value_t = 5000)]
    store_timeout_ms: u64,

    /// Clock skew tolerated on token expiry, in seconds
    #[arg(long, env = "MININOTE_TOKEN_LEEWAY_SECS", default_value_t = 30)]
    token_leeway_secs: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind_addr,
            outbox_capacity: args.outbox_capacity,
            store_timeout_ms: args.store_timeout_ms,
            join_policy: args.join_policy,
            content_mode: args.content_mode,
            storage_path: args.storage_path,
            jwt_secret: args.jwt_secret,
            token_leeway_secs: args.token_leeway_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from(Args::parse());
    match &config.storage_path {
        Some(path) => log::info!("Using persistent store at {}", path.display()),
        None => log::info!("Using in-memory store"),
    }
    log::info!(
        "Join policy: {}, content mode: {}",
        config.join_policy,
        config.content_mode
    );

    let server = SyncServer::new(config)?;
    server.run().await
}
