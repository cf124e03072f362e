use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::StatusCode;

use super::{
    STATUS_PENDING, STATUS_SUCCESS, SignalError, SignalMethod, SignalReply, auth, format_id,
    parse_id,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SignalClientOptions {
    /// `host[:port][/prefix]`, or a full `http(s)://` URL.
    pub endpoint: String,
    pub user_id: u64,
    pub password: Vec<u8>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Accept any server certificate. Debugging only.
    pub insecure_skip_verify: bool,
}

impl SignalClientOptions {
    pub fn new(endpoint: impl Into<String>, user_id: u64, password: Vec<u8>) -> Self {
        Self {
            endpoint: endpoint.into(),
            user_id,
            password,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            insecure_skip_verify: false,
        }
    }
}

/// Client role of the signal relay.
pub struct SignalClient {
    http: reqwest::Client,
    base: String,
    user_id: u64,
    password: Vec<u8>,
    poll_interval: Duration,
}

fn base_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return String::new();
    }
    let url = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    };
    url.trim_end_matches('/').to_string()
}

fn bad_response(status: StatusCode, body: &str, reason: &str) -> SignalError {
    SignalError::BadResponse {
        status: status.as_u16(),
        body: body.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_reply(status: StatusCode, body: &str) -> Result<SignalReply, SignalError> {
    serde_json::from_str(body)
        .map_err(|_| bad_response(status, body, "failed to parse JSON response"))
}

impl SignalClient {
    pub fn new(opts: SignalClientOptions) -> Result<Self, SignalError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(opts.request_timeout)
            .danger_accept_invalid_certs(opts.insecure_skip_verify)
            .build()?;

        if opts.insecure_skip_verify {
            tracing::warn!("signal: TLS certificate verification is disabled");
        }

        Ok(Self {
            http,
            base: base_url(&opts.endpoint),
            user_id: opts.user_id,
            password: opts.password,
            poll_interval: opts.poll_interval,
        })
    }

    fn url(&self, path: &str) -> Result<String, SignalError> {
        if self.base.is_empty() {
            return Err(SignalError::EmptyEndpoint);
        }
        Ok(format!("{}{path}", self.base))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(StatusCode, String), SignalError> {
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        Ok((status, body))
    }
}

#[async_trait]
impl SignalMethod for SignalClient {
    async fn offer(&self, payload: &[u8]) -> Result<u64, SignalError> {
        let url = self.url("/offer")?;
        let tag = auth::sign(&self.password, payload);
        let form = [
            ("offer", BASE64.encode(payload)),
            ("mac", BASE64.encode(tag)),
            ("uid", format_id(self.user_id)),
        ];

        let (status, body) = self.send(self.http.post(url).form(&form)).await?;
        let reply = parse_reply(status, &body)?;
        if reply.status != STATUS_SUCCESS {
            return Err(bad_response(status, &body, "offer was not accepted"));
        }
        reply
            .offer_id
            .as_deref()
            .and_then(parse_id)
            .ok_or_else(|| bad_response(status, &body, "failed to parse offer ID"))
    }

    async fn read_answer(&self, offer_id: u64) -> Result<Vec<u8>, SignalError> {
        let url = self.url("/answer")?;
        let query = [("oid", format_id(offer_id)), ("uid", format_id(self.user_id))];

        loop {
            let (status, body) = self.send(self.http.get(&url).query(&query)).await?;
            let reply = parse_reply(status, &body)?;
            match reply.status.as_str() {
                STATUS_SUCCESS => {
                    let Some(answer) = reply.answer else {
                        return Err(bad_response(status, &body, "answer missing"));
                    };
                    return Ok(BASE64.decode(answer)?);
                }
                STATUS_PENDING => {
                    tracing::trace!(offer_id = %format_id(offer_id), "signal: answer pending");
                    tokio::time::sleep(self.poll_interval).await;
                }
                _ => return Err(bad_response(status, &body, "unexpected answer status")),
            }
        }
    }

    async fn read_offer(&self) -> Result<(u64, Vec<u8>), SignalError> {
        Err(SignalError::NotImplemented("signal client"))
    }

    async fn answer(&self, _offer_id: u64, _payload: &[u8]) -> Result<(), SignalError> {
        Err(SignalError::NotImplemented("signal client"))
    }
}
