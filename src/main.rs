// # Game Server Binary
//
// Entry point for `rusty-net-gamed`: parses flags, wires the engine, the
// DB task queue and the optional DB-server link, then runs until a shutdown
// signal arrives. Exit code 0 on clean shutdown, 1 on initialization
// failure.

use clap::Parser;
use std::sync::Arc;

use rusty_net::config::{init_tracing, parse_log_level};
use rusty_net::db::{Database, MemoryDatabase};
use rusty_net::net::EngineConfig;
use rusty_net::server::{DbLinkConfig, GameServer, GameServerConfig};
use rusty_net::{signal, VERSION};

#[derive(Parser, Debug)]
#[command(
    name = "rusty-net-gamed",
    version = VERSION,
    about = "Asynchronous TCP game server"
)]
struct Args {
    /// Listen port
    #[arg(short = 'p', long = "port", default_value_t = 9000)]
    port: u16,

    /// Listen address
    #[arg(long = "host", default_value = "0.0.0.0")]
    host: String,

    /// Log level: DEBUG, INFO, WARN, ERROR
    #[arg(short = 'l', long = "log-level", default_value = "INFO")]
    log_level: String,

    /// Database connection string ("memory" for the in-memory store)
    #[arg(short = 'd', long = "db-conn")]
    db_conn: Option<String>,

    /// Connect to a DB server
    #[arg(long = "db", default_value_t = false)]
    db: bool,

    /// DB server host
    #[arg(long = "db-host", default_value = "127.0.0.1")]
    db_host: String,

    /// DB server port
    #[arg(long = "db-port", default_value_t = 8001)]
    db_port: u16,

    /// Write-ahead log path for the DB task queue
    #[arg(long = "wal-path", default_value = "gamed.wal")]
    wal_path: String,

    /// Numeric id this server reports to the DB server
    #[arg(long = "server-id", default_value_t = 1)]
    server_id: u32,

    /// Name this server reports to the DB server
    #[arg(long = "server-name", default_value = "game-01")]
    server_name: String,

    /// Force a provider backend (iocp, rio, epoll, io_uring, kqueue)
    #[arg(long = "io-backend")]
    io_backend: Option<String>,
}

fn open_database(conn: Option<&str>) -> Option<Arc<dyn Database>> {
    match conn {
        None => None,
        Some("memory") => Some(Arc::new(MemoryDatabase::new())),
        Some(other) => {
            tracing::warn!(conn = other, "unsupported connection string - running without database");
            None
        }
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(parse_log_level(&args.log_level));

    println!("====================================");
    println!("  rusty-net-gamed v{VERSION}");
    println!("====================================");

    let db_link = args.db.then(|| DbLinkConfig {
        host: args.db_host.clone(),
        port: args.db_port,
    });

    let config = GameServerConfig {
        engine: EngineConfig {
            host: args.host,
            port: args.port,
            platform_hint: args.io_backend,
            ..Default::default()
        },
        wal_path: args.wal_path.into(),
        db_link,
        server_id: args.server_id,
        server_name: args.server_name,
        ..Default::default()
    };

    let database = open_database(args.db_conn.as_deref());

    let server = match GameServer::new(config, database) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to create game server");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.start() {
        tracing::error!(error = %e, "failed to start game server");
        std::process::exit(1);
    }

    signal::install();
    tracing::info!("server is running - press Ctrl+C to stop");
    signal::wait_for_shutdown(|| server.is_running());

    tracing::info!("shutting down");
    server.stop();

    let engine_stats = server.engine().stats();
    let db_stats = server.db_tasks().stats();
    if let (Ok(engine_json), Ok(db_json)) = (
        serde_json::to_string(&engine_stats),
        serde_json::to_string(&db_stats),
    ) {
        tracing::info!(engine = %engine_json, db = %db_json, "final statistics");
    }

    println!("Server shutdown complete.");
}
