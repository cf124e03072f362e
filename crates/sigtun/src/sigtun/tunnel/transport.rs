use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

use crate::sigtun::signal::SignalMethod;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// An inbound tunnel connection and the label the dialing side attached to it.
pub struct TunnelConn {
    pub stream: BoxedStream,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// STUN/TURN URLs, for substrates that traverse NAT.
    pub ice_servers: Vec<String>,
    /// Server side data listener address.
    pub listen_addr: String,
    /// Addresses handed to dialers, in preference order. Empty = the bound address.
    pub advertise: Vec<String>,
}

/// A connection substrate bootstrapped through a signaling method.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    /// Negotiates a fresh session with the remote side.
    async fn dialer(&self, signal: Arc<dyn SignalMethod>) -> anyhow::Result<Arc<dyn Dialer>>;
    fn listener(&self, signal: Arc<dyn SignalMethod>) -> Box<dyn Listener>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens one tunnel connection. Fails once the underlying session is gone.
    async fn dial(&self, label: &str) -> anyhow::Result<BoxedStream>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn accept(&self) -> anyhow::Result<TunnelConn>;
    async fn stop(&self);
    /// Bound data address once started, for substrates that listen on one.
    async fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

pub mod rendezvous;

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "rendezvous".into();
    }
    match n.as_str() {
        "rendezvous" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected rendezvous)"),
    }
}

pub fn transport_by_name(name: &str, cfg: TransportConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "rendezvous" => Ok(Arc::new(rendezvous::RendezvousTransport::new(cfg))),
        _ => unreachable!(),
    }
}
