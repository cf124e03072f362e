//! Offer/answer signaling over HTTPS.
//!
//! The client posts an HMAC-authenticated offer and polls for the answer; the server
//! queues offers for the local transport listener and hands answers back exactly once.
//! Every failure on the server side is answered by the deny handler, so a failed
//! signaling attempt looks the same as a request for a route that does not exist.

pub mod auth;
pub mod client;
pub mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use auth::Credentials;
pub use client::{SignalClient, SignalClientOptions};
pub use server::{SignalServer, SignalServerOptions};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_PENDING: &str = "pending";

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal: empty endpoint is not allowed")]
    EmptyEndpoint,
    #[error("signal: http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("signal: {reason}, HTTP status: {status}, response: {body}")]
    BadResponse {
        status: u16,
        body: String,
        reason: String,
    },
    #[error("signal: offer not found")]
    OfferNotFound,
    #[error("signal: not implemented by {0}")]
    NotImplemented(&'static str),
    #[error("signal: offer queue closed")]
    QueueClosed,
    #[error("signal: base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// The signaling capability a transport substrate is configured with.
///
/// The client role implements `offer`/`read_answer`; the server role implements
/// `read_offer`/`answer`. The other pair fails with `NotImplemented`.
#[async_trait]
pub trait SignalMethod: Send + Sync {
    async fn offer(&self, payload: &[u8]) -> Result<u64, SignalError>;
    async fn read_answer(&self, offer_id: u64) -> Result<Vec<u8>, SignalError>;
    async fn read_offer(&self) -> Result<(u64, Vec<u8>), SignalError>;
    async fn answer(&self, offer_id: u64, payload: &[u8]) -> Result<(), SignalError>;
}

/// JSON body shared by `/offer` and `/answer` replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

pub fn format_id(id: u64) -> String {
    format!("{id:x}")
}

/// Parses a bare lowercase/uppercase hex u64 (no sign, no `0x`).
pub fn parse_id(s: &str) -> Option<u64> {
    if s.is_empty() || s.len() > 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}
