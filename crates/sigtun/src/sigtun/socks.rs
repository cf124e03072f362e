//! Local SOCKS5 front end (RFC 1928, NO AUTH, CONNECT only).

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::watch,
};

use crate::sigtun::{
    net,
    tunnel::{
        client::{Client, ConnectError},
        pipe,
        protocol::NetworkType,
        transport::BoxedStream,
    },
};

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("socks: invalid version {0}")]
    InvalidVersion(u8),
    #[error("socks: no acceptable authentication method")]
    NoAcceptableMethods,
    #[error("socks: unsupported address type {0}")]
    UnsupportedAddressType(u8),
    #[error("socks: domain is not valid utf-8")]
    InvalidDomain,
    #[error("socks: handshake timed out")]
    HandshakeTimeout,
    #[error("socks: io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SocksRequest {
    command: u8,
    network: NetworkType,
    address: String,
}

/// What the front end hands accepted requests to.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        network: NetworkType,
        address: &str,
    ) -> Result<(BoxedStream, String), ConnectError>;
    async fn bind(&self, address: &str) -> Result<(BoxedStream, String), ConnectError>;
    async fn udp_associate(&self, address: &str) -> Result<(BoxedStream, String), ConnectError>;
}

#[async_trait]
impl Connector for Client {
    async fn connect(
        &self,
        network: NetworkType,
        address: &str,
    ) -> Result<(BoxedStream, String), ConnectError> {
        Client::connect(self, network, address).await
    }

    async fn bind(&self, address: &str) -> Result<(BoxedStream, String), ConnectError> {
        Client::bind(self, address).await
    }

    async fn udp_associate(&self, address: &str) -> Result<(BoxedStream, String), ConnectError> {
        Client::udp_associate(self, address).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct SocksOptions {
    /// Bounds the whole tunnel connect, retries included. Zero = unbounded.
    pub connect_timeout: Duration,
}

pub async fn serve(
    listen_addr: &str,
    connector: Arc<dyn Connector>,
    opts: SocksOptions,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind socks {listen_addr}"))?;
    tracing::info!(listen_addr = %listen_addr, "socks: listening");
    serve_listener(ln, connector, opts, shutdown).await
}

pub async fn serve_listener(
    ln: TcpListener,
    connector: Arc<dyn Connector>,
    opts: SocksOptions,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let opts = Arc::new(opts);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let _ = conn.set_nodelay(true);
                let connector = connector.clone();
                let opts = opts.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle(conn, connector, &opts).await {
                        tracing::debug!(client = %peer, err = %err, "socks: session failed");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle<S>(
    mut conn: S,
    connector: Arc<dyn Connector>,
    opts: &SocksOptions,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handshake = async {
        negotiate_method(&mut conn).await?;
        read_request(&mut conn).await
    };
    let res = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await;
    let req = match res {
        Ok(Ok(req)) => req,
        Ok(Err(err @ SocksError::UnsupportedAddressType(_))) => {
            let _ = send_reply(&mut conn, REPLY_ADDRESS_TYPE_NOT_SUPPORTED, None).await;
            return Err(err);
        }
        Ok(Err(err)) => return Err(err),
        Err(_) => return Err(SocksError::HandshakeTimeout),
    };

    let res = match req.command {
        CMD_CONNECT => {
            let fut = connector.connect(req.network, &req.address);
            if opts.connect_timeout.is_zero() {
                fut.await
            } else {
                match tokio::time::timeout(opts.connect_timeout, fut).await {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::debug!(address = %req.address, "socks: connect timed out");
                        send_reply(&mut conn, REPLY_GENERAL_FAILURE, None).await?;
                        return Ok(());
                    }
                }
            }
        }
        CMD_BIND => connector.bind(&req.address).await,
        CMD_UDP_ASSOCIATE => connector.udp_associate(&req.address).await,
        other => {
            tracing::debug!(command = other, "socks: unknown command");
            send_reply(&mut conn, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
            return Ok(());
        }
    };

    let (stream, bound) = match res {
        Ok(v) => v,
        Err(err) => {
            let code = match err {
                ConnectError::CommandNotSupported(_) => REPLY_COMMAND_NOT_SUPPORTED,
                _ => REPLY_GENERAL_FAILURE,
            };
            tracing::debug!(address = %req.address, err = %err, "socks: request failed");
            send_reply(&mut conn, code, None).await?;
            return Ok(());
        }
    };

    send_reply(&mut conn, REPLY_SUCCEEDED, bound.parse().ok()).await?;
    tracing::debug!(network = %req.network, address = %req.address, "socks: connected");

    let stats = pipe::relay(conn, stream).await;
    tracing::debug!(address = %req.address, up = stats.a_to_b, down = stats.b_to_a, "socks: closed");
    Ok(())
}

async fn negotiate_method<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    } else {
        let _ = stream
            .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
            .await;
        Err(SocksError::NoAcceptableMethods)
    }
}

async fn read_request<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + Unpin,
{
    // VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidVersion(header[0]));
    }
    let command = header[1];

    let (network, address) = match header[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            (NetworkType::Tcp4, SocketAddrV4::new(ip, port).to_string())
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut buf = vec![0u8; len + 2];
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            let host = std::str::from_utf8(&buf[..len]).map_err(|_| SocksError::InvalidDomain)?;
            (net::network_for_host(host), format!("{host}:{port}"))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            (
                NetworkType::Tcp6,
                SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0).to_string(),
            )
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };

    Ok(SocksRequest {
        command,
        network,
        address,
    })
}

/// Writes a reply; `None` sends the unspecified address `0.0.0.0:0`.
async fn send_reply<S>(stream: &mut S, reply: u8, bound: Option<SocketAddr>) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[SOCKS5_VERSION, reply, 0x00]);
    match bound {
        SocketAddr::V4(a) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&a.ip().octets());
            buf.extend_from_slice(&a.port().to_be_bytes());
        }
        SocketAddr::V6(a) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&a.ip().octets());
            buf.extend_from_slice(&a.port().to_be_bytes());
        }
    }
    stream.write_all(&buf).await?;
    stream.flush().await
}
