//! gcaas - Geocoding-as-a-service backend
//!
//! One binary hosting the HTTP edge, the geocoder RPC core, batch ingress
//! and the worker pool. Subsystems talk over NATS subjects, so any role can
//! be scaled out by running more instances; workers share a queue group on
//! the job-ready topic.

mod cli;
mod config;
mod defaults;
mod edge;
mod errors;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    dotenvy::dotenv().ok();

    let config = config::Config::from_env()?;

    match cli.command {
        Some(cli::Command::Serve) | None => run_server(config).await,
    }
}

async fn run_server(config: config::Config) -> Result<()> {
    let logs_dir = std::env::var("LOGS_DIR")
        .unwrap_or_else(|_| "./logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        &logs_dir,
        "gcaas.log",
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,gcaas=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    info!("Starting gcaas...");
    info!("Configuration loaded (environment {})", config.environment);

    let nats_client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    let engine = services::search::create_engine();
    let storage = services::storage::create_storage(&config)?;
    let status_cache = services::status_cache::create_status_cache(config.status_cache_capacity);
    let response_cache = Arc::new(services::response_cache::ResponseCache::new(
        config.response_cache_capacity,
        config.cache_ttl,
        config.cache_max_results,
    ));

    let edge_state = edge::EdgeState {
        client: nats_client.clone(),
        cache: response_cache,
        coord_precision: config.coord_precision,
        request_timeout: config.edge_request_timeout,
    };
    let edge_host = config.edge_host.clone();
    let edge_port = config.edge_port;

    let handlers_handle = tokio::spawn(handlers::start_handlers(
        nats_client,
        config,
        engine,
        storage,
        status_cache,
    ));

    let edge_handle =
        tokio::spawn(async move { edge::serve(edge_state, &edge_host, edge_port).await });

    tokio::select! {
        result = handlers_handle => {
            error!("Message handlers finished: {:?}", result);
        }
        result = edge_handle => {
            error!("Edge server finished: {:?}", result);
        }
    }

    Ok(())
}
