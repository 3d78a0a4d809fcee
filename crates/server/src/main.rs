use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use kudos_core::{
    auth::StaticTokenResolver,
    config::KudosConfig,
    db::generate_temp_db,
    liveness::{upstream_from_config, StatusCache},
    store::Database,
};
use server::{run, tls, ServerContext};
use tokio::{net::TcpListener, signal::ctrl_c};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    /// Path to config file; defaults to ~/.kudos/kudos.toml
    config: Option<PathBuf>,

    #[arg(short, long)]
    /// Socket address to listen on, overrides the config
    socket: Option<SocketAddr>,

    #[arg(long, value_name = "FILE")]
    /// Path to the sqlite db, overrides the config
    db: Option<PathBuf>,

    #[arg(long)]
    /// Use a throwaway db in the temp dir, deleted on Ctrl-C
    temp_db: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = KudosConfig::load(args.config)?;
    if let Some(socket) = args.socket {
        config.socket = socket;
    }
    let db_path = match (args.temp_db, args.db) {
        (true, _) => generate_temp_db(),
        (false, Some(db)) => db,
        (false, None) => config.db.clone(),
    };

    let (db, db_handle) = Database::open(db_path.clone()).await?;
    let upstream = upstream_from_config(&config.liveness)?;
    let ctx = Arc::new(ServerContext {
        db,
        liveness: StatusCache::from_config(upstream, &config.liveness),
        sessions: Arc::new(StaticTokenResolver::new(config.admin_token.clone())),
    });

    let acceptor = match (&config.cert, &config.pkey) {
        (Some(cert), Some(pkey)) => Some(tls::acceptor(cert, pkey)?),
        _ => {
            warn!("No certificate configured, serving plain TCP");
            None
        }
    };
    let listener = TcpListener::bind(config.socket).await?;

    info!("Press Ctrl-C to stop the server");
    tokio::select! {
        _ = run(listener, acceptor, ctx) => {}
        result = ctrl_c() => {
            result?;
            info!("Ctrl-C, shutting down");
        }
    }

    // Dropping the accept loop aborted its connections, so nothing holds the
    // db any more and the actor stops.
    db_handle.await?;
    if args.temp_db {
        std::fs::remove_file(&db_path)?;
        info!(db = %db_path.display(), "Removed temp db");
    }
    Ok(())
}
