use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use chat_relay::transport::{line, websocket};
use chat_relay::{http, AppState, Settings};
use dotenv::dotenv;
use std::io;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const RATE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

fn build_cors(config: &Settings) -> Cors {
    if !config.cors.enabled {
        // CORS disabled - use most restrictive settings
        return Cors::default();
    }

    let cors = if config.cors.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:3000")
            .allowed_origin("http://127.0.0.1:3000")
            .allowed_methods(vec!["GET"])
    };

    cors.max_age(config.cors.max_age as usize)
}

/// Waits on a listener task; a missing one never finishes.
async fn supervise(name: &str, task: Option<JoinHandle<io::Result<()>>>) -> anyhow::Result<()> {
    match task {
        Some(task) => task
            .await
            .with_context(|| format!("{} listener panicked", name))?
            .with_context(|| format!("{} listener stopped", name)),
        None => futures::future::pending().await,
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Settings::new().context("failed to load configuration")?;
    info!("Configuration loaded successfully ({})", config.environment);

    let state = AppState::new(config.clone());

    let line_task = if config.line.enabled {
        let listener = line::bind_unix(&config.line.socket_path)
            .await
            .with_context(|| format!("failed to bind {}", config.line.socket_path))?;
        Some(tokio::spawn(line::serve_unix(listener, state.room.clone())))
    } else {
        None
    };

    let ws_task = if config.websocket.enabled {
        let addr = format!("{}:{}", config.server.host, config.websocket.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        Some(tokio::spawn(websocket::serve(listener, state.room.clone())))
    } else {
        None
    };

    if config.rate.persist_across_sessions {
        let room = state.room.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RATE_CLEANUP_INTERVAL).await;
                room.rate_guard().cleanup().await;
            }
        });
    }

    info!("Starting HTTP server at {}:{}", config.server.host, config.server.http_port);
    let http_config = config.clone();
    let data = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&http_config))
            .app_data(data.clone())
            .configure(http::configure)
    })
    .bind((config.server.host.as_str(), config.server.http_port))
    .context("failed to bind HTTP server")?
    .workers(config.server.workers as usize)
    .run();

    let result = tokio::select! {
        result = server => result.context("HTTP server failed"),
        result = supervise("line", line_task) => result,
        result = supervise("websocket", ws_task) => result,
    };

    if let Err(e) = &result {
        error!("Shutting down: {:#}", e);
    }
    result
}
