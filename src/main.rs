//! Docserve - document session server.
//!
//! Usage:
//!   docserve serve [--port 5006] [--host localhost:5006]... [--app /app]...

use clap::{Parser, Subcommand};
use docserve::{http_server, Application, ServerConfig, ServerCore, StaticApplication};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "docserve")]
#[command(about = "Document session server with WebSocket connections")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "5006")]
        port: u16,

        /// Allowed Host header value (repeatable)
        #[arg(long = "host", default_values_t = vec!["localhost:5006".to_string()])]
        hosts: Vec<String>,

        /// Milliseconds between keep-alive pings, 0 disables
        #[arg(long, default_value = "37000", allow_hyphen_values = true)]
        keep_alive: i64,

        /// Milliseconds an unused session is kept before it is discarded
        #[arg(long, default_value = "1800000")]
        unused_session_lifetime: u64,

        /// Background worker pool size
        #[arg(long, default_value = "4")]
        num_workers: usize,

        /// Application path to serve (repeatable)
        #[arg(long = "app", default_values_t = vec!["/".to_string()])]
        apps: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            hosts,
            keep_alive,
            unused_session_lifetime,
            num_workers,
            apps,
        } => {
            let config = ServerConfig {
                hosts,
                keep_alive_ms: keep_alive,
                unused_session_linger: Duration::from_millis(unused_session_lifetime),
                num_workers,
                ..ServerConfig::default()
            };
            let applications = apps
                .into_iter()
                .map(|path| {
                    let app: Arc<dyn Application> = Arc::new(StaticApplication::new(path.clone()));
                    (path, app)
                })
                .collect();

            let core = match ServerCore::new(config, applications) {
                Ok(core) => core,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };

            if let Err(e) = http_server::run_server(core, port).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
    }
}
