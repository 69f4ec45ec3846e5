use std::sync::Arc;

use clap::Parser;
use subbot_core::config::StoreBackend;
use subbot_core::{MemoryStore, PgStore, Store, SubbotConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use subbot_server::gateway::GatewayProtocol;
use subbot_server::subsystems::heartbeat;
use subbot_server::{server, Orchestrator};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "subbot.toml")]
    config: String,

    /// Check store connectivity and exit
    #[arg(long)]
    health: bool,

    /// Apply the schema and exit
    #[arg(long)]
    migrate_only: bool,

    /// Pairing code proposed to the engine instead of a generated one
    #[arg(long, env = "SUBBOT_PAIRING_CODE")]
    pairing_code: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let mut config = match SubbotConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(code) = args.pairing_code {
        config.auth.custom_pairing_code = Some(code);
    }

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.as_str()));
    fmt().with_env_filter(filter).init();

    let store: Arc<dyn Store> = match config.database.backend {
        StoreBackend::Postgres => {
            let pool = match subbot_core::db::create_pool(&config.database).await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            };

            if args.health {
                match subbot_core::db::health_check(&pool).await {
                    Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                    Err(e) => {
                        println!("❌ PostgreSQL connection failed: {}", e);
                        std::process::exit(1);
                    }
                }
                println!("✅ Subbot store health check passed");
                return Ok(());
            }

            if config.database.run_migrations || args.migrate_only {
                subbot_core::db::run_migrations(&pool).await?;
                tracing::info!("Schema up to date");
            }
            if args.migrate_only {
                return Ok(());
            }

            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            if args.health || args.migrate_only {
                println!("✅ In-memory store, nothing to check");
                return Ok(());
            }
            tracing::warn!("Using the in-memory store: sessions will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let protocol = Arc::new(GatewayProtocol::new(&config.protocol));
    let orchestrator = Arc::new(Orchestrator::new(store, protocol, config.clone()));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Relaunch everything the store says should be live
    if config.recovery.enabled {
        let recovery_orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if let Err(e) = recovery_orchestrator.recover().await {
                tracing::error!("Startup recovery failed: {}", e);
            }
        });
    }

    tokio::spawn(heartbeat::run_liveness_loop(
        Arc::clone(orchestrator.store()),
        orchestrator.supervisor().clone(),
        config.heartbeat.clone(),
        tx.subscribe(),
    ));

    let socket_path = config.service.socket_path.clone();

    if config.http.enabled {
        let http_orchestrator = Arc::clone(&orchestrator);
        let http_config = config.http.clone();
        let http_socket = socket_path.clone();
        let http_shutdown = tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = subbot_server::http::start_http_server(
                http_orchestrator,
                http_config,
                http_socket,
                http_shutdown,
            )
            .await
            {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let served = server::run_unix_server(&socket_path, Arc::clone(&orchestrator), tx.subscribe()).await;

    let report = orchestrator.shutdown().await;
    tracing::info!(
        drained = report.drained,
        marked_disconnected = report.marked_disconnected,
        "Subbot server stopped"
    );

    served
}
