//! heimdall daemon (bifrost) entrypoint.
//!
//! A small local service that tracks currently running shell commands
//! (reported by shell hooks), decides whether finished commands deserve a
//! chat notification, and keeps a TTL-refreshed cache of command results.
//! State is in-memory only; stopping the daemon forgets everything.

use std::env;
use std::net::TcpListener;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use heimdall_core::config;
use heimdall_core::executor::SystemExecutor;
use heimdall_core::notify::{ChatNotifier, LogNotifier, Notifier};

mod server;
mod service;

use service::Bifrost;

fn main() {
    init_logging();

    let config = match config::load(None) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load config");
            std::process::exit(1);
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.chat.webhook_url {
        Some(url) => Arc::new(ChatNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };
    let service = Arc::new(Bifrost::new(&config, Arc::new(SystemExecutor), notifier));

    let addr = format!("127.0.0.1:{}", config.port());
    let listener = match TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %addr, "Failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "heimdall daemon started");
    server::serve(listener, service);
}

fn init_logging() {
    let debug_enabled = env::var("HEIMDALL_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
