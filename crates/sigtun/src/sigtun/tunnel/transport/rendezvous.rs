//! Direct-connect substrate: the exit node advertises TCP candidates and a one-time
//! token through signaling, the dialer connects, presents the token, and both ends
//! run a yamux session over that connection. Every tunnel connection is one yamux
//! stream prefixed with a `[len u8][label]` header.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::sigtun::{
    net::normalize_bind_addr,
    signal::{SignalMethod, format_id},
    tunnel::transport::{BoxedStream, Dialer, Listener, Transport, TransportConfig, TunnelConn},
};

const OFFER_VERSION: u8 = 1;
const TOKEN_BYTES: usize = 16;
const TOKEN_HEX_LEN: usize = TOKEN_BYTES * 2;
pub const TOKEN_TTL: Duration = Duration::from_secs(60);
pub const TOKEN_READ_TIMEOUT: Duration = Duration::from_secs(10);
const CANDIDATE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LABEL_BYTES: usize = u8::MAX as usize;

#[derive(Debug, Serialize, Deserialize)]
struct RendezvousOffer {
    v: u8,
    session: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RendezvousAnswer {
    token: String,
    candidates: Vec<String>,
}

pub struct RendezvousTransport {
    cfg: TransportConfig,
}

impl RendezvousTransport {
    pub fn new(cfg: TransportConfig) -> Self {
        if !cfg.ice_servers.is_empty() {
            tracing::debug!(
                ice_servers = ?cfg.ice_servers,
                "rendezvous: ice servers are not used by this transport"
            );
        }
        Self { cfg }
    }
}

#[async_trait]
impl Transport for RendezvousTransport {
    fn name(&self) -> &'static str {
        "rendezvous"
    }

    async fn dialer(&self, signal: Arc<dyn SignalMethod>) -> anyhow::Result<Arc<dyn Dialer>> {
        let session = hex::encode(rng().random::<[u8; 8]>());
        let offer = serde_json::to_vec(&RendezvousOffer {
            v: OFFER_VERSION,
            session: session.clone(),
        })?;

        let oid = signal.offer(&offer).await.context("rendezvous: send offer")?;
        tracing::debug!(offer_id = %format_id(oid), session = %session, "rendezvous: offer sent");

        let raw = signal
            .read_answer(oid)
            .await
            .context("rendezvous: read answer")?;
        let answer: RendezvousAnswer =
            serde_json::from_slice(&raw).context("rendezvous: malformed answer")?;
        if answer.token.len() != TOKEN_HEX_LEN {
            anyhow::bail!("rendezvous: malformed token in answer");
        }

        let mut last_err = None;
        for candidate in &answer.candidates {
            match connect_candidate(candidate, &answer.token).await {
                Ok(c) => {
                    tracing::info!(candidate = %candidate, session = %session, "rendezvous: session established");
                    return Ok(Arc::new(RendezvousDialer::new(c)));
                }
                Err(err) => {
                    tracing::debug!(candidate = %candidate, err = %err, "rendezvous: candidate failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("rendezvous: answer carried no candidates")))
    }

    fn listener(&self, signal: Arc<dyn SignalMethod>) -> Box<dyn Listener> {
        Box::new(RendezvousListener::new(signal, self.cfg.clone()))
    }
}

async fn connect_candidate(candidate: &str, token: &str) -> anyhow::Result<TcpStream> {
    let mut c = tokio::time::timeout(CANDIDATE_CONNECT_TIMEOUT, TcpStream::connect(candidate))
        .await
        .context("connect timeout")??;
    let _ = c.set_nodelay(true);
    c.write_all(token.as_bytes()).await?;
    Ok(c)
}

fn label_header(label: &str) -> Vec<u8> {
    let mut n = label.len().min(MAX_LABEL_BYTES);
    while !label.is_char_boundary(n) {
        n -= 1;
    }
    let mut out = Vec::with_capacity(1 + n);
    out.push(n as u8);
    out.extend_from_slice(&label.as_bytes()[..n]);
    out
}

async fn read_label<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<String> {
    let n = r.read_u8().await? as usize;
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

struct RendezvousDialer {
    control: Mutex<tokio_yamux::Control>,
    task: JoinHandle<()>,
}

impl RendezvousDialer {
    fn new(c: TcpStream) -> Self {
        let mut session = tokio_yamux::Session::new_client(c, tokio_yamux::Config::default());
        let control = session.control();

        // The client never accepts streams; polling the session only drives its I/O.
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                if next.is_err() {
                    break;
                }
            }
            tracing::debug!("rendezvous: client session ended");
        });

        Self {
            control: Mutex::new(control),
            task,
        }
    }
}

impl Drop for RendezvousDialer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Dialer for RendezvousDialer {
    async fn dial(&self, label: &str) -> anyhow::Result<BoxedStream> {
        if self.task.is_finished() {
            anyhow::bail!("rendezvous: session closed");
        }
        let mut st = {
            let mut ctrl = self.control.lock().await;
            ctrl.open_stream().await?
        };
        st.write_all(&label_header(label)).await?;
        Ok(Box::new(st))
    }
}

type Tokens = Arc<Mutex<HashMap<String, Instant>>>;

pub struct RendezvousListener {
    signal: Arc<dyn SignalMethod>,
    cfg: TransportConfig,
    tokens: Tokens,
    incoming_tx: mpsc::Sender<TunnelConn>,
    incoming: Mutex<mpsc::Receiver<TunnelConn>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stop_tx: watch::Sender<bool>,
}

impl RendezvousListener {
    pub fn new(signal: Arc<dyn SignalMethod>, cfg: TransportConfig) -> Self {
        let (incoming_tx, incoming) = mpsc::channel(64);
        let (stop_tx, _) = watch::channel(false);
        Self {
            signal,
            cfg,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            incoming_tx,
            incoming: Mutex::new(incoming),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            stop_tx,
        }
    }
}

#[async_trait]
impl Listener for RendezvousListener {
    async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    async fn start(&self) -> anyhow::Result<()> {
        let addr = normalize_bind_addr(&self.cfg.listen_addr).into_owned();
        let ln = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("rendezvous: bind {addr}"))?;
        let bound = ln.local_addr()?;
        *self.local_addr.lock().await = Some(bound);

        let candidates = if self.cfg.advertise.is_empty() {
            if bound.ip().is_unspecified() {
                tracing::warn!(addr = %bound, "rendezvous: listening on a wildcard address without advertise; remote dialers may not reach it");
            }
            vec![bound.to_string()]
        } else {
            self.cfg.advertise.clone()
        };
        tracing::info!(listen_addr = %bound, candidates = ?candidates, "rendezvous: listening");

        let signaling = tokio::spawn(signaling_loop(
            self.signal.clone(),
            self.tokens.clone(),
            candidates,
            self.stop_tx.subscribe(),
        ));
        let data = tokio::spawn(accept_loop(
            ln,
            self.tokens.clone(),
            self.incoming_tx.clone(),
            self.stop_tx.subscribe(),
        ));
        self.tasks.lock().await.extend([signaling, data]);
        Ok(())
    }

    async fn accept(&self) -> anyhow::Result<TunnelConn> {
        let mut stop = self.stop_tx.subscribe();
        if *stop.borrow() {
            anyhow::bail!("rendezvous: listener stopped");
        }
        let mut rx = self.incoming.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or_else(|| anyhow::anyhow!("rendezvous: listener closed")),
            _ = stop.wait_for(|v| *v) => anyhow::bail!("rendezvous: listener stopped"),
        }
    }

    async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn signaling_loop(
    signal: Arc<dyn SignalMethod>,
    tokens: Tokens,
    candidates: Vec<String>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            next = signal.read_offer() => next,
            _ = stop.wait_for(|v| *v) => return,
        };
        let (oid, payload) = match next {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(err = %err, "rendezvous: signaling stopped");
                return;
            }
        };

        let offer = match serde_json::from_slice::<RendezvousOffer>(&payload) {
            Ok(o) if o.v == OFFER_VERSION => o,
            _ => {
                tracing::debug!(offer_id = %format_id(oid), "rendezvous: ignoring malformed offer");
                continue;
            }
        };

        let token = hex::encode(rng().random::<[u8; TOKEN_BYTES]>());
        {
            let mut t = tokens.lock().await;
            let now = Instant::now();
            t.retain(|_, expiry| *expiry > now);
            t.insert(token.clone(), now + TOKEN_TTL);
        }

        let answer = RendezvousAnswer {
            token,
            candidates: candidates.clone(),
        };
        let encoded = match serde_json::to_vec(&answer) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(err = %err, "rendezvous: encode answer");
                continue;
            }
        };
        match signal.answer(oid, &encoded).await {
            Ok(()) => {
                tracing::debug!(offer_id = %format_id(oid), session = %offer.session, "rendezvous: answered")
            }
            Err(err) => {
                tracing::warn!(offer_id = %format_id(oid), err = %err, "rendezvous: answer failed")
            }
        }
    }
}

async fn accept_loop(
    ln: TcpListener,
    tokens: Tokens,
    incoming: mpsc::Sender<TunnelConn>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = ln.accept() => accepted,
            _ = stop.wait_for(|v| *v) => return,
        };
        match accepted {
            Ok((c, peer)) => {
                tokio::spawn(serve_session(
                    c,
                    peer,
                    tokens.clone(),
                    incoming.clone(),
                    stop.clone(),
                ));
            }
            Err(err) => {
                tracing::warn!(err = %err, "rendezvous: accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn take_token(tokens: &Tokens, presented: &str) -> bool {
    let mut t = tokens.lock().await;
    match t.remove(presented) {
        Some(expiry) => expiry > Instant::now(),
        None => false,
    }
}

async fn serve_session(
    mut c: TcpStream,
    peer: SocketAddr,
    tokens: Tokens,
    incoming: mpsc::Sender<TunnelConn>,
    mut stop: watch::Receiver<bool>,
) {
    let mut presented = [0u8; TOKEN_HEX_LEN];
    match tokio::time::timeout(TOKEN_READ_TIMEOUT, c.read_exact(&mut presented)).await {
        Ok(Ok(_)) => {}
        _ => {
            tracing::debug!(peer = %peer, "rendezvous: no token");
            return;
        }
    }
    let presented = String::from_utf8_lossy(&presented).into_owned();
    if !take_token(&tokens, &presented).await {
        tracing::debug!(peer = %peer, "rendezvous: rejected token");
        return;
    }

    let _ = c.set_nodelay(true);
    let mut session = tokio_yamux::Session::new_server(c, tokio_yamux::Config::default());
    tracing::info!(peer = %peer, "rendezvous: session accepted");

    loop {
        let next = tokio::select! {
            next = session.next() => next,
            _ = stop.wait_for(|v| *v) => break,
        };
        match next {
            Some(Ok(mut st)) => {
                let incoming = incoming.clone();
                tokio::spawn(async move {
                    let label =
                        match tokio::time::timeout(TOKEN_READ_TIMEOUT, read_label(&mut st)).await {
                            Ok(Ok(label)) => label,
                            _ => return,
                        };
                    let _ = incoming
                        .send(TunnelConn {
                            stream: Box::new(st),
                            label,
                        })
                        .await;
                });
            }
            Some(Err(err)) => {
                tracing::debug!(peer = %peer, err = ?err, "rendezvous: session error");
                break;
            }
            None => break,
        }
    }
    tracing::debug!(peer = %peer, "rendezvous: session ended");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::sigtun::signal::SignalError;

    /// Both signaling roles in one process, without HTTP.
    struct MemorySignal {
        next_id: AtomicU64,
        offers_tx: mpsc::Sender<(u64, Vec<u8>)>,
        offers_rx: Mutex<mpsc::Receiver<(u64, Vec<u8>)>>,
        answers: Mutex<HashMap<u64, Vec<u8>>>,
    }

    impl MemorySignal {
        fn new() -> Arc<Self> {
            let (offers_tx, offers_rx) = mpsc::channel(8);
            Arc::new(Self {
                next_id: AtomicU64::new(1),
                offers_tx,
                offers_rx: Mutex::new(offers_rx),
                answers: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl SignalMethod for MemorySignal {
        async fn offer(&self, payload: &[u8]) -> Result<u64, SignalError> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.offers_tx
                .send((id, payload.to_vec()))
                .await
                .map_err(|_| SignalError::QueueClosed)?;
            Ok(id)
        }

        async fn read_answer(&self, offer_id: u64) -> Result<Vec<u8>, SignalError> {
            loop {
                if let Some(a) = self.answers.lock().await.remove(&offer_id) {
                    return Ok(a);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn read_offer(&self) -> Result<(u64, Vec<u8>), SignalError> {
            self.offers_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(SignalError::QueueClosed)
        }

        async fn answer(&self, offer_id: u64, payload: &[u8]) -> Result<(), SignalError> {
            self.answers.lock().await.insert(offer_id, payload.to_vec());
            Ok(())
        }
    }

    fn local_cfg() -> TransportConfig {
        TransportConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dialed_streams_arrive_with_their_labels() {
        let signal = MemorySignal::new();
        let transport = RendezvousTransport::new(local_cfg());

        let listener = transport.listener(signal.clone());
        listener.start().await.unwrap();

        let dialer = transport.dialer(signal.clone()).await.unwrap();
        let mut out = dialer.dial("tcp-example.com:80-abcde").await.unwrap();
        out.write_all(b"ping").await.unwrap();

        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.label, "tcp-example.com:80-abcde");
        let mut buf = [0u8; 4];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.stream.write_all(b"pong").await.unwrap();
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Several streams share one session.
        let _second = dialer.dial("second").await.unwrap();
        assert_eq!(listener.accept().await.unwrap().label, "second");

        listener.stop().await;
    }

    #[tokio::test]
    async fn unknown_token_is_disconnected() {
        let signal = MemorySignal::new();
        let listener = RendezvousListener::new(signal, local_cfg());
        listener.start().await.unwrap();
        let addr = listener.local_addr().await.unwrap();

        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(&[b'a'; TOKEN_HEX_LEN]).await.unwrap();
        let mut rest = Vec::new();
        c.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        listener.stop().await;
    }

    #[tokio::test]
    async fn tokens_are_single_use_and_expire() {
        let tokens: Tokens = Arc::new(Mutex::new(HashMap::new()));
        tokens
            .lock()
            .await
            .insert("fresh".into(), Instant::now() + TOKEN_TTL);
        tokens
            .lock()
            .await
            .insert("stale".into(), Instant::now() - Duration::from_millis(1));

        assert!(take_token(&tokens, "fresh").await);
        assert!(!take_token(&tokens, "fresh").await);
        assert!(!take_token(&tokens, "stale").await);
        assert!(!take_token(&tokens, "missing").await);
    }

    #[tokio::test]
    async fn stopped_listener_fails_accept_and_kills_sessions() {
        let signal = MemorySignal::new();
        let transport = RendezvousTransport::new(local_cfg());
        let listener = transport.listener(signal.clone());
        listener.start().await.unwrap();
        let dialer = transport.dialer(signal).await.unwrap();

        listener.stop().await;
        assert!(listener.accept().await.is_err());

        let mut dead = false;
        for _ in 0..100 {
            if dialer.dial("x").await.is_err() {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dead, "dialer kept working after the listener stopped");
    }

    #[test]
    fn long_labels_are_cut_on_a_char_boundary() {
        let label = "é".repeat(200);
        let h = label_header(&label);
        assert_eq!(h[0] as usize, h.len() - 1);
        assert!(h.len() - 1 <= MAX_LABEL_BYTES);
        assert!(std::str::from_utf8(&h[1..]).is_ok());
    }
}
