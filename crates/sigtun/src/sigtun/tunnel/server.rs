use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};

use crate::sigtun::{
    net,
    signal::SignalMethod,
    tunnel::{
        pipe::{self, IdleTimeout},
        protocol::{self, Command, Request},
        transport::Transport,
    },
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SESSION_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// How the session deadline is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlineMode {
    /// Caps the whole session.
    #[default]
    Absolute,
    /// Cuts the session after that long without traffic in either direction.
    Idle,
}

impl DeadlineMode {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "absolute" => Ok(DeadlineMode::Absolute),
            "idle" => Ok(DeadlineMode::Idle),
            other => anyhow::bail!("unknown deadline mode {other:?} (expected absolute|idle)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub handshake_timeout: Duration,
    pub session_deadline: Duration,
    pub deadline_mode: DeadlineMode,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session_deadline: DEFAULT_SESSION_DEADLINE,
            deadline_mode: DeadlineMode::Absolute,
        }
    }
}

struct ActiveConnGuard(Arc<AtomicUsize>);

impl ActiveConnGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sigtun_connections_total").increment(1);
        metrics::gauge!("sigtun_active_connections").increment(1.0);
        Self(counter)
    }

    fn alive(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("sigtun_active_connections").decrement(1.0);
    }
}

/// Exit-node side: accepts tunnel connections and connects them to their targets.
pub struct Server {
    transport: Arc<dyn Transport>,
    signal: Arc<dyn SignalMethod>,
    opts: Arc<ServerOptions>,
    active: Arc<AtomicUsize>,
}

impl Server {
    pub fn new(
        transport: Arc<dyn Transport>,
        signal: Arc<dyn SignalMethod>,
        opts: ServerOptions,
    ) -> Self {
        Self {
            transport,
            signal,
            opts: Arc::new(opts),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }

    /// Runs the accept loop until shutdown. An accept error stops the listener and is returned.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = self.transport.listener(self.signal.clone());
        listener.start().await?;

        let data_addr = listener
            .local_addr()
            .await
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!(
            transport = %self.transport.name(),
            data_addr = %data_addr,
            deadline_mode = ?self.opts.deadline_mode,
            session_deadline = %humantime::format_duration(self.opts.session_deadline),
            "tunnel: server ready"
        );

        loop {
            if *shutdown.borrow() {
                listener.stop().await;
                return Ok(());
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        listener.stop().await;
                        return Ok(());
                    }
                }
                res = listener.accept() => {
                    let conn = match res {
                        Ok(c) => c,
                        Err(err) => {
                            listener.stop().await;
                            return Err(err.context("tunnel: accept"));
                        }
                    };
                    tracing::debug!(label = %conn.label, "tunnel: accepted");
                    tokio::spawn(handle_conn(conn.stream, self.opts.clone(), self.active.clone()));
                }
            }
        }
    }
}

async fn handle_conn<S>(mut stream: S, opts: Arc<ServerOptions>, active: Arc<AtomicUsize>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let read = protocol::read_request(&mut stream);
    let req = if opts.handshake_timeout.is_zero() {
        read.await
    } else {
        match tokio::time::timeout(opts.handshake_timeout, read).await {
            Ok(r) => r,
            Err(_) => {
                tracing::debug!("tunnel: request read timed out");
                return;
            }
        }
    };
    let req = match req {
        Ok(r) => r,
        Err(err) => {
            tracing::debug!(err = %err, "tunnel: bad request");
            return;
        }
    };

    let active = ActiveConnGuard::new(active);
    tracing::debug!(
        command = ?req.command,
        network = %req.network,
        address = %req.address,
        alive = active.alive(),
        "tunnel: dispatch"
    );
    match req.command {
        Command::Connect => handle_connect(stream, req, &opts).await,
        other => tracing::debug!(command = ?other, "tunnel: unsupported command"),
    }
}

async fn handle_connect<S>(mut stream: S, req: Request, opts: &ServerOptions)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let outbound = match net::dial(req.network, &req.address).await {
        Ok(c) => c,
        Err(err) => {
            tracing::debug!(network = %req.network, address = %req.address, err = %err, "tunnel: dial failed");
            return;
        }
    };
    let _ = outbound.set_nodelay(true);
    let local = outbound
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let resp = Request::connect(req.network, local);
    if let Err(err) = protocol::write_response(&mut stream, &resp).await {
        tracing::debug!(err = %err, "tunnel: write response failed");
        return;
    }

    let deadline = opts.session_deadline;
    let stats = match opts.deadline_mode {
        DeadlineMode::Absolute => pipe::relay_with_deadline(stream, outbound, deadline).await,
        DeadlineMode::Idle => Some(pipe::relay(IdleTimeout::new(stream, deadline), outbound).await),
    };

    match stats {
        Some(s) => {
            metrics::counter!("sigtun_bytes_ingress_total").increment(s.a_to_b);
            metrics::counter!("sigtun_bytes_egress_total").increment(s.b_to_a);
            tracing::debug!(
                address = %req.address,
                up = s.a_to_b,
                down = s.b_to_a,
                "tunnel: session closed"
            )
        }
        None => tracing::debug!(address = %req.address, "tunnel: session deadline reached"),
    }
}
