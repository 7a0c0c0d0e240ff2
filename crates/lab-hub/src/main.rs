mod api;
mod hub;
mod normalizer;
mod supervisor;

use api::AppState;
use clap::Parser;
use hub::Hub;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use supervisor::RunRegistry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lab-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = hub::DEFAULT_REPLAY_CAPACITY)]
    replay_capacity: usize,
    /// Seconds a finished run's replay buffer is kept around.
    #[arg(long, default_value_t = 300)]
    retention: u64,
    #[arg(long, default_value_t = hub::DEFAULT_MAX_SUBSCRIBERS)]
    max_subscribers: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let addr_str = resolve_addr(&args.addr);
    let addr: SocketAddr = match addr_str.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %addr_str);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %addr_str, reason = "loopback only");
        return;
    }

    let hub = Arc::new(Hub::new(
        args.replay_capacity,
        Duration::from_secs(args.retention),
        args.max_subscribers,
    ));
    hub.clone().start_sweeper();
    let registry = Arc::new(RunRegistry::new(hub.clone()));

    let app = api::router(AppState {
        hub,
        registry,
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bind_error", error = %err, addr = %addr_str);
            return;
        }
    };

    info!(event = "hub_start", addr = %addr_str);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(event = "hub_error", error = %err);
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("LAB_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("LAB_HUB_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:8787".to_string()
}
