use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{body::Bytes, http::StatusCode};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::sigtun::{
    admin,
    config::{self, Role},
    logging, net,
    signal::{self, Credentials, SignalClient, SignalClientOptions, SignalServer},
    socks, telemetry,
    tunnel::{
        client::{Client, ClientOptions},
        server::{Server, ServerOptions},
        transport::{TransportConfig, transport_by_name},
    },
};

pub async fn run_client(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(Role::Client, config_path)?;
    let cfg = config::load_client_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        local_address = %cfg.local_address,
        signal = %cfg.signal_base_url,
        user_id = cfg.user_id,
        transport = %cfg.transport,
        "sigtun: starting client"
    );

    let signal_client = SignalClient::new(SignalClientOptions {
        poll_interval: cfg.poll_interval,
        request_timeout: cfg.request_timeout,
        insecure_skip_verify: cfg.insecure_skip_verify,
        ..SignalClientOptions::new(
            cfg.signal_base_url.clone(),
            cfg.user_id,
            cfg.password.clone(),
        )
    })
    .context("signal client")?;

    let transport = transport_by_name(
        &cfg.transport,
        TransportConfig {
            ice_servers: cfg.ice_servers.clone(),
            ..Default::default()
        },
    )?;

    let client = Arc::new(Client::new(
        transport,
        Arc::new(signal_client),
        ClientOptions {
            timeout: cfg.timeout,
            max_attempts: cfg.max_attempts,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let listen_addr = cfg.local_address.clone();
        let opts = socks::SocksOptions {
            connect_timeout: cfg.connect_timeout,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { socks::serve(&listen_addr, client, opts, shutdown).await });
    }

    supervise(tasks, shutdown_tx).await
}

pub async fn run_server(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(Role::Server, config_path)?;
    let cfg = config::load_server_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    let admin_enabled = !cfg.admin_addr.trim().is_empty();

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server_addr = %cfg.server_addr,
        admin_addr = %cfg.admin_addr,
        transport = %cfg.transport,
        rendezvous_addr = %cfg.rendezvous.listen_addr,
        users = cfg.users.len(),
        "sigtun: starting server"
    );

    let prom = telemetry::init_prometheus()?;

    let status = StatusCode::from_u16(cfg.deny.status)
        .with_context(|| format!("invalid deny status: {}", cfg.deny.status))?;
    let deny = if status == StatusCode::NOT_FOUND && cfg.deny.body.is_empty() {
        signal::server::not_found()
    } else {
        signal::server::status_deny(status, Bytes::from(cfg.deny.body.clone()))
    };

    let signal_srv = Arc::new(SignalServer::new(
        Arc::new(Credentials::new(cfg.users.clone())),
        signal::SignalServerOptions {
            answer_ttl: cfg.answer_ttl,
            deny,
            ..Default::default()
        },
    ));

    let transport = transport_by_name(
        &cfg.transport,
        TransportConfig {
            ice_servers: cfg.ice_servers.clone(),
            listen_addr: cfg.rendezvous.listen_addr.clone(),
            advertise: cfg.rendezvous.advertise.clone(),
        },
    )?;

    let server = Server::new(
        transport,
        signal_srv.clone(),
        ServerOptions {
            handshake_timeout: cfg.handshake_timeout,
            session_deadline: cfg.session_deadline,
            deadline_mode: cfg.deadline_mode,
        },
    );
    let active = server.active_connections();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // Signal relay over HTTP.
    {
        let bind_addr = net::normalize_bind_addr(&cfg.server_addr);
        let listener = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind server_addr {}", cfg.server_addr))?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(signal_srv.clone().serve(listener, shutdown));
    }

    // Admin server.
    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            signal: signal_srv.clone(),
            active_connections: active,
            prometheus: prom,
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Exit node.
    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.serve(shutdown).await });
    }

    supervise(tasks, shutdown_tx).await
}

/// Waits for Ctrl-C / SIGTERM or the first task to stop, then drains the rest.
async fn supervise(
    mut tasks: JoinSet<anyhow::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let mut result = Ok(());

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %err, "shutdown: task ended with error");
            }
        }
    };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
