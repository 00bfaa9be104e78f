use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use routecodex::config::load_config;
use routecodex::observability::init_tracing;
use routecodex::server::dispatch_request;
use routecodex::server::lifecycle::{
    port_is_occupied, resolve_bind_addr, restart_existing, restart_in_place, PidRegistry,
};
use routecodex::state::AppState;

const GRACEFUL_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

struct CliArgs {
    config_path: String,
    restart: bool,
}

fn parse_args() -> CliArgs {
    let mut args = CliArgs {
        config_path: "config.yaml".to_string(),
        restart: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = iter.next() {
                    args.config_path = path;
                }
            }
            "--restart" => args.restart = true,
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
    }
    args
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn main() {
    let args = parse_args();
    let config = load_config(&args.config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Copy 'config.example.yaml' to '{}' and adjust it.", args.config_path);
        std::process::exit(1);
    });

    init_tracing(&config.server.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });

    runtime.block_on(async move {
        run(config, args.restart).await;
    });
}

async fn run(config: routecodex::config::AppConfig, restart: bool) {
    let host = config.server.host.clone();
    let port = config.server.port;
    let home = home_dir();
    let registry = home.as_deref().map(PidRegistry::new);

    if port_is_occupied(&host, port) {
        if restart {
            if let Some(registry) = registry.as_ref() {
                restart_existing(&host, port, registry).await;
            }
            if port_is_occupied(&host, port) {
                tracing::error!("port_check_result: still_occupied_after_restart");
                std::process::exit(1);
            }
        } else {
            tracing::error!("port_check_result: occupied_no_restart");
            eprintln!("Port {port} is already in use; pass --restart to replace the instance.");
            std::process::exit(1);
        }
    }

    let (state, event_rx) = AppState::from_config(config, home).unwrap_or_else(|e| {
        eprintln!("Failed to initialize gateway state: {e}");
        std::process::exit(1);
    });

    // The quota daemon owns all pool-state writes; it runs for the life of
    // the process and saves once more on shutdown.
    let daemon = state.quota.clone();
    let daemon_shutdown = state.shutdown.subscribe();
    tokio::spawn(async move {
        daemon.run(event_rx, daemon_shutdown).await;
    });

    if let (Some(antigravity), Some(probe)) =
        (state.antigravity.clone(), state.antigravity_probe.clone())
    {
        let bus = state.events.clone();
        let refresh_shutdown = state.shutdown.subscribe();
        tokio::spawn(async move {
            antigravity
                .run_refresh_loop(probe, bus, refresh_shutdown)
                .await;
        });
    }

    if let Some(registry) = registry.as_ref() {
        if let Err(err) = registry.record_self() {
            tracing::warn!(error = %err, "failed to record managed PID");
        }
    }

    let addr = resolve_bind_addr(&host, port).unwrap_or_else(|e| {
        eprintln!("Failed to resolve {host}:{port}: {e}");
        std::process::exit(1);
    });
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {host}:{port}: {e}");
        std::process::exit(1);
    });

    tracing::info!("routecodex listening on {host}:{port}");

    let mut shutdown_rx = state.shutdown.subscribe();
    let serve_state = Arc::clone(&state);
    let accept_loop = tokio::spawn(async move {
        serve_accept_loop(listener, serve_state).await;
    });

    tokio::select! {
        _ = shutdown_rx.changed() => {
            tracing::info!("shutdown requested via /shutdown");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested via signal");
            state.shutdown.send_replace(true);
        }
        () = sigusr2_restart_only() => {
            tracing::info!("in-place restart signal received");
            state.shutdown.send_replace(true);
        }
    }

    accept_loop.abort();
    // Bounded grace period for in-flight work (the daemon saves on exit).
    tokio::time::sleep(GRACEFUL_SHUTDOWN_DEADLINE).await;
    if let Some(registry) = registry.as_ref() {
        let _ = registry.remove_self();
    }
}

async fn serve_accept_loop(listener: tokio::net::TcpListener, state: Arc<AppState>) {
    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept error");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("failed to enable TCP_NODELAY for {remote_addr}: {err}");
        }

        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let request_state = Arc::clone(&state);
        let hyper_service = service_fn(move |request: Request<Incoming>| {
            dispatch_request(
                Arc::clone(&request_state),
                remote_addr,
                request.map(Body::new),
            )
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, hyper_service).await {
                tracing::debug!("failed to serve connection from {remote_addr}: {err:#}");
            }
        });
    }
}

/// Resolve only when the in-place restart mode is enabled and SIGUSR2
/// arrives; otherwise pend forever.
async fn sigusr2_restart_only() {
    if !restart_in_place() {
        std::future::pending::<()>().await;
    }
    #[cfg(unix)]
    {
        let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined2())
        {
            Ok(signal) => signal,
            Err(_) => {
                std::future::pending::<()>().await;
                return;
            }
        };
        signal.recv().await;
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
