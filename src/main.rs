use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use seagoat::config::AppConfig;
use seagoat::facade::SearchFacade;
use seagoat::routes::health;
use seagoat::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Resolve log directory (next to the cache root or from env)
    let log_dir = std::env::var("SEAGOAT_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| seagoat::config::cache_root().join("logs"));
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files
    let file_appender = tracing_appender::rolling::daily(&log_dir, "seagoat-server.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "seagoat=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Log panics before unwinding tears the worker down
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        error!(target: "seagoat::panic", location = %location, "PANIC: thread panicked");
        default_panic(panic_info);
    }));

    health::init_start_time();

    let repo_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let repo_path = dunce::canonicalize(&repo_path)
        .map_err(|e| anyhow::anyhow!("Repository path {}: {}", repo_path.display(), e))?;

    let config = AppConfig::load(&repo_path)?;
    let port = config.server.port;

    info!(
        repo = %repo_path.display(),
        port,
        read_max_commits = config.server.read_max_commits,
        batch_size = config.server.chroma.batch_size,
        embedding_function = %config.server.chroma.embedding_function,
        "Seagoat server starting"
    );

    // Engine construction reads the cache and the vector store from disk;
    // keep it off the async runtime.
    let facade = tokio::task::spawn_blocking({
        let repo_path = repo_path.clone();
        move || SearchFacade::start(config, &repo_path)
    })
    .await??;

    let state = AppState {
        facade: Arc::new(facade),
    };

    let app = server::create_app(state.clone());

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Seagoat server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Dropping the last facade reference closes the queue, joins the
    // worker, and persists the cache.
    drop(state);
    info!("Seagoat server stopped");
    Ok(())
}

/// Resolve on the first of: HTTP /shutdown, Ctrl-C, or SIGTERM. Container
/// runtimes send SIGTERM; without this arm the process is hard-killed and
/// never persists the cache or vector index.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = health::wait_for_shutdown() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining");
}
