use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single request/response frame (command + address type + address).
pub const MAX_FRAME_BYTES: usize = 1024;

const HEADER_BYTES: usize = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame truncated")]
    Truncated,
    #[error("invalid command: {0}")]
    InvalidCommand(u8),
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),
    #[error("address is not valid utf-8")]
    InvalidAddress,
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Proxy command, numbered like the SOCKS5 request commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(ProtocolError::InvalidCommand(other)),
        }
    }
}

/// Network the exit node should dial on. The byte values reuse the SOCKS5
/// address-type markers: domain name for plain `tcp`, IPv4 for `tcp4`, IPv6 for `tcp6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Tcp,
    Tcp4,
    Tcp6,
}

impl NetworkType {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x03 => Ok(NetworkType::Tcp),
            0x01 => Ok(NetworkType::Tcp4),
            0x04 => Ok(NetworkType::Tcp6),
            other => Err(ProtocolError::UnsupportedAddressType(other)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            NetworkType::Tcp => 0x03,
            NetworkType::Tcp4 => 0x01,
            NetworkType::Tcp6 => 0x04,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkType::Tcp => "tcp",
            NetworkType::Tcp4 => "tcp4",
            NetworkType::Tcp6 => "tcp6",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub network: NetworkType,
    pub address: String,
}

/// Responses share the request layout; `address` carries the exit node's
/// local address of the outbound connection.
pub type Response = Request;

impl Request {
    pub fn connect(network: NetworkType, address: impl Into<String>) -> Self {
        Self {
            command: Command::Connect,
            network,
            address: address.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let addr = self.address.as_bytes();
        let n = HEADER_BYTES + addr.len();
        if n > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(n));
        }
        let mut out = Vec::with_capacity(n);
        out.push(self.command as u8);
        out.push(self.network.to_byte());
        out.extend_from_slice(addr);
        Ok(out)
    }

    /// Parses one complete frame; every byte after the two header bytes is the address.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(buf.len()));
        }
        if buf.len() < HEADER_BYTES {
            return Err(ProtocolError::Truncated);
        }
        let command = Command::from_byte(buf[0])?;
        let network = NetworkType::from_byte(buf[1])?;
        let address = std::str::from_utf8(&buf[HEADER_BYTES..])
            .map_err(|_| ProtocolError::InvalidAddress)?
            .to_string();
        Ok(Self {
            command,
            network,
            address,
        })
    }
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &Request,
) -> Result<(), ProtocolError> {
    let frame = req.encode()?;
    // encode() bounds the frame to MAX_FRAME_BYTES, so it always fits a u16.
    w.write_u16(frame.len() as u16).await?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Request, ProtocolError> {
    let n = r.read_u16().await? as usize;
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }
    if n < HEADER_BYTES {
        return Err(ProtocolError::Truncated);
    }
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).await?;
    Request::decode(&buf)
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    resp: &Response,
) -> Result<(), ProtocolError> {
    write_request(w, resp).await
}

pub async fn read_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<Response, ProtocolError> {
    read_request(r).await
}
