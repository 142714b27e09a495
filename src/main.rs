use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tether_server::{EngineState, ServerConfig, TokenKeeper};
use tether_store::Database;

#[derive(Parser)]
#[command(name = "tether", about = "Browser-session sync server")]
struct Args {
    /// Port to listen on (0 picks a free port).
    #[arg(long, default_value_t = 9310)]
    port: u16,

    /// Database file path. Defaults to ~/.tether/tether.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Disable the durable warn/error sync trail.
    #[arg(long)]
    no_trail: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let tether_dir = dirs_home().join(".tether");

    let trail_path = tether_dir.join("trail.db");
    let _telemetry =
        tether_telemetry::init_telemetry((!args.no_trail).then_some(trail_path.as_path()));

    tracing::info!("starting tether server");

    // Same secret the HTTP layer signs ws tokens with
    let secret = std::env::var("TETHER_WS_SECRET")
        .expect("TETHER_WS_SECRET environment variable is missing");

    let db_path = args.db.unwrap_or_else(|| tether_dir.join("tether.db"));
    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let engine = Arc::new(EngineState::new(db, TokenKeeper::new(&secret)));

    let config = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = tether_server::start(config, engine)
        .await
        .expect("failed to start server");
    tracing::info!(port = handle.port, "tether ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
