use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use wafrelay::api::dispatch::dispatch_request;
use wafrelay::config::{load_config, AppConfig};
use wafrelay::observability::init_tracing;
use wafrelay::scheduler::{spawn_checkin_job, spawn_primary_probe_job};
use wafrelay::state::AppState;

fn main() {
    let config = load_config("config.yaml").unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    init_tracing(&config.server.log_level);
    let runtime = build_runtime(&config);

    runtime.block_on(async move {
        run(config).await;
    });
}

fn build_runtime(config: &AppConfig) -> tokio::runtime::Runtime {
    let worker_threads = config.server.runtime_worker_threads;
    let mut runtime_builder = if worker_threads == Some(1) {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(threads) = worker_threads {
            builder.worker_threads(threads);
        }
        builder
    };
    runtime_builder.enable_io();
    runtime_builder.enable_time();
    if let Some(max_blocking_threads) = config.server.runtime_max_blocking_threads {
        runtime_builder.max_blocking_threads(max_blocking_threads);
    }
    runtime_builder.build().unwrap_or_else(|e| {
        eprintln!("Failed to initialize Tokio runtime: {e}");
        std::process::exit(1);
    })
}

async fn run(config: AppConfig) {
    let host = config.server.host.clone();
    let port = config.server.port;
    let state = AppState::new(config);

    if let Err(e) = state.accounts.load() {
        tracing::error!(error = %e, "initial account load failed; serving with an empty pool");
    }

    let any_waf_site = state.config.sites.iter().any(|site| site.need_waf);
    if any_waf_site {
        // Warm the cookie jar so the first proxied request does not pay for
        // a full browser navigation, then keep it fresh in the background.
        let warmup = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = warmup.waf.get().await {
                tracing::warn!(error = %e, "initial WAF cookie warm-up failed");
            }
        });
        Arc::clone(&state.waf).spawn_refresh_loop();
    }

    if state.config.checkin.enabled {
        spawn_checkin_job(Arc::clone(&state));
    } else {
        tracing::info!("check-in scheduler is disabled");
    }
    if state.config.primary_check.enabled {
        spawn_primary_probe_job(Arc::clone(&state));
    } else {
        tracing::info!("primary site health check is disabled");
    }

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}"))
        .await
        .unwrap_or_else(|err| {
            eprintln!("Failed to bind to {host}:{port}: {err}");
            std::process::exit(1);
        });
    tracing::info!(
        host = %host,
        port,
        sites = state.sites.len(),
        "wafrelay is ready to accept connections"
    );

    tokio::select! {
        () = serve_accept_loop(listener, Arc::clone(&state)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    state.browser.stop().await;
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
            dispatch_request(Arc::clone(&request_state), request.map(Body::new))
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, hyper_service).await {
                tracing::debug!("failed to serve connection from {remote_addr}: {err:#}");
            }
        });
    }
}
