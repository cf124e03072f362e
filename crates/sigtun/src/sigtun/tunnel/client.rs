use std::{sync::Arc, time::Duration};

use rand::{RngExt, rng};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::sigtun::{
    signal::SignalMethod,
    tunnel::{
        pipe::IdleTimeout,
        protocol::{self, Command, NetworkType, ProtocolError, Request},
        transport::{BoxedStream, Dialer, Transport},
    },
};

/// How long the exit node gets to answer a CONNECT request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

const LABEL_SUFFIX_LEN: usize = 5;
const LABEL_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("tunnel: transport: {0:#}")]
    Transport(anyhow::Error),
    #[error("tunnel: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("tunnel: no response within {0:?}")]
    ResponseTimeout(Duration),
    #[error("tunnel: response does not match the request")]
    ProtocolMismatch,
    #[error("tunnel: command not supported: {0:?}")]
    CommandNotSupported(Command),
    #[error("tunnel: giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<ConnectError>,
    },
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bounds dialer construction and each dial; also the idle timeout of a tunnel
    /// connection. Zero disables all three.
    pub timeout: Duration,
    /// Attempts per `connect`. Zero retries until success.
    pub max_attempts: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 0,
        }
    }
}

#[derive(Default)]
struct DialerSlot {
    generation: u64,
    current: Option<Arc<dyn Dialer>>,
}

/// Opens tunnel connections to the exit node and runs the CONNECT handshake on them.
///
/// One transport dialer is shared by all callers. A failed connection clears it
/// (if nobody replaced it meanwhile) so the next caller negotiates a fresh one.
pub struct Client {
    transport: Arc<dyn Transport>,
    signal: Arc<dyn SignalMethod>,
    opts: ClientOptions,
    slot: Mutex<DialerSlot>,
}

async fn bounded<F, T>(timeout: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {}", humantime::format_duration(timeout)))?
}

fn make_label(network: NetworkType, address: &str) -> String {
    let mut r = rng();
    let suffix: String = (0..LABEL_SUFFIX_LEN)
        .map(|_| LABEL_LETTERS[r.random_range(0..LABEL_LETTERS.len())] as char)
        .collect();
    format!("{network}-{address}-{suffix}")
}

fn retry_backoff() -> Duration {
    Duration::from_millis(rng().random_range(100..=500))
}

impl Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        signal: Arc<dyn SignalMethod>,
        opts: ClientOptions,
    ) -> Self {
        Self {
            transport,
            signal,
            opts,
            slot: Mutex::new(DialerSlot::default()),
        }
    }

    /// Returns the live dialer, building one if the slot is empty.
    ///
    /// Construction happens under the slot lock, so concurrent callers wait for a
    /// single build instead of racing their own.
    async fn ensure_dialer(&self) -> Result<(u64, Arc<dyn Dialer>), ConnectError> {
        let mut slot = self.slot.lock().await;
        if let Some(d) = &slot.current {
            return Ok((slot.generation, d.clone()));
        }

        let d = bounded(self.opts.timeout, self.transport.dialer(self.signal.clone()))
            .await
            .map_err(ConnectError::Transport)?;
        slot.generation += 1;
        slot.current = Some(d.clone());
        tracing::info!(
            transport = %self.transport.name(),
            generation = slot.generation,
            "tunnel: dialer ready"
        );
        Ok((slot.generation, d))
    }

    async fn invalidate(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.current.is_some() && slot.generation == generation {
            slot.current = None;
            tracing::debug!(generation, "tunnel: dialer discarded");
        }
    }

    async fn open(&self, dialer: &Arc<dyn Dialer>, label: &str) -> Result<BoxedStream, ConnectError> {
        let stream = bounded(self.opts.timeout, dialer.dial(label))
            .await
            .map_err(ConnectError::Transport)?;
        if self.opts.timeout.is_zero() {
            return Ok(stream);
        }
        Ok(Box::new(IdleTimeout::new(stream, self.opts.timeout)))
    }

    /// Opens one raw tunnel connection tagged with `label`.
    pub async fn dial(&self, label: &str) -> Result<BoxedStream, ConnectError> {
        let (_, dialer) = self.ensure_dialer().await?;
        self.open(&dialer, label).await
    }

    async fn connect_once(
        &self,
        dialer: &Arc<dyn Dialer>,
        network: NetworkType,
        address: &str,
    ) -> Result<(BoxedStream, String), ConnectError> {
        let mut stream = self.open(dialer, &make_label(network, address)).await?;

        protocol::write_request(&mut stream, &Request::connect(network, address)).await?;
        let resp = tokio::time::timeout(RESPONSE_TIMEOUT, protocol::read_response(&mut stream))
            .await
            .map_err(|_| ConnectError::ResponseTimeout(RESPONSE_TIMEOUT))??;

        if resp.command != Command::Connect || resp.network != network {
            return Err(ConnectError::ProtocolMismatch);
        }
        Ok((stream, resp.address))
    }

    /// Asks the exit node to connect to `address` and returns the tunnel stream plus
    /// the exit node's local address for the outbound connection.
    pub async fn connect(
        &self,
        network: NetworkType,
        address: &str,
    ) -> Result<(BoxedStream, String), ConnectError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let err = match self.ensure_dialer().await {
                Ok((generation, dialer)) => {
                    match self.connect_once(&dialer, network, address).await {
                        Ok(v) => return Ok(v),
                        Err(ConnectError::ProtocolMismatch) => {
                            return Err(ConnectError::ProtocolMismatch);
                        }
                        Err(err) => {
                            self.invalidate(generation).await;
                            err
                        }
                    }
                }
                Err(err) => err,
            };

            tracing::debug!(
                network = %network,
                address = %address,
                attempt = attempts,
                err = %err,
                "tunnel: connect attempt failed"
            );

            if self.opts.max_attempts > 0 && attempts >= self.opts.max_attempts {
                return Err(ConnectError::RetriesExhausted {
                    attempts,
                    last_error: Box::new(err),
                });
            }
            tokio::time::sleep(retry_backoff()).await;
        }
    }

    pub async fn bind(&self, _address: &str) -> Result<(BoxedStream, String), ConnectError> {
        Err(ConnectError::CommandNotSupported(Command::Bind))
    }

    pub async fn udp_associate(
        &self,
        _address: &str,
    ) -> Result<(BoxedStream, String), ConnectError> {
        Err(ConnectError::CommandNotSupported(Command::UdpAssociate))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        sync::Notify,
    };

    use super::*;
    use crate::sigtun::{
        signal::SignalError,
        tunnel::transport::Listener,
    };

    struct NoSignal;

    #[async_trait]
    impl SignalMethod for NoSignal {
        async fn offer(&self, _: &[u8]) -> Result<u64, SignalError> {
            Err(SignalError::NotImplemented("test"))
        }
        async fn read_answer(&self, _: u64) -> Result<Vec<u8>, SignalError> {
            Err(SignalError::NotImplemented("test"))
        }
        async fn read_offer(&self) -> Result<(u64, Vec<u8>), SignalError> {
            Err(SignalError::NotImplemented("test"))
        }
        async fn answer(&self, _: u64, _: &[u8]) -> Result<(), SignalError> {
            Err(SignalError::NotImplemented("test"))
        }
    }

    #[derive(Clone, Copy)]
    enum Exit {
        Reply,
        Silent,
        Mismatch,
    }

    struct MockTransport {
        exit: Exit,
        builds: AtomicU32,
        broken_builds: u32,
        failing_builds: u32,
        closed: Arc<Notify>,
    }

    impl MockTransport {
        fn new(exit: Exit) -> Self {
            Self {
                exit,
                builds: AtomicU32::new(0),
                broken_builds: 0,
                failing_builds: 0,
                closed: Arc::new(Notify::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn dialer(&self, _signal: Arc<dyn SignalMethod>) -> anyhow::Result<Arc<dyn Dialer>> {
            let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failing_builds {
                anyhow::bail!("signaling failed");
            }
            tokio::task::yield_now().await;
            Ok(Arc::new(MockDialer {
                broken: n <= self.broken_builds,
                exit: self.exit,
                closed: self.closed.clone(),
            }))
        }

        fn listener(&self, _signal: Arc<dyn SignalMethod>) -> Box<dyn Listener> {
            unimplemented!("client tests never listen")
        }
    }

    struct MockDialer {
        broken: bool,
        exit: Exit,
        closed: Arc<Notify>,
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self, _label: &str) -> anyhow::Result<BoxedStream> {
            if self.broken {
                anyhow::bail!("session closed");
            }
            let (near, far) = tokio::io::duplex(4096);
            tokio::spawn(exit_node(far, self.exit, self.closed.clone()));
            Ok(Box::new(near))
        }
    }

    async fn exit_node(mut s: DuplexStream, exit: Exit, closed: Arc<Notify>) {
        let Ok(req) = protocol::read_request(&mut s).await else {
            return;
        };
        match exit {
            Exit::Reply => {
                let resp = Request::connect(req.network, "10.0.0.2:40000");
                if protocol::write_response(&mut s, &resp).await.is_err() {
                    return;
                }
                let (mut r, mut w) = tokio::io::split(s);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            }
            Exit::Mismatch => {
                let resp = Request {
                    command: Command::Bind,
                    ..req
                };
                let _ = protocol::write_response(&mut s, &resp).await;
                let _ = s.read_to_end(&mut Vec::new()).await;
            }
            Exit::Silent => {
                let _ = s.read_to_end(&mut Vec::new()).await;
                closed.notify_one();
            }
        }
    }

    fn client(transport: Arc<MockTransport>, max_attempts: u32) -> Client {
        Client::new(
            transport,
            Arc::new(NoSignal),
            ClientOptions {
                timeout: Duration::from_secs(10),
                max_attempts,
            },
        )
    }

    #[tokio::test]
    async fn connect_returns_stream_and_exit_address() {
        let c = client(Arc::new(MockTransport::new(Exit::Reply)), 0);

        let (mut s, bound) = c.connect(NetworkType::Tcp4, "1.2.3.4:80").await.unwrap();
        assert_eq!(bound, "10.0.0.2:40000");

        s.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn concurrent_failures_rebuild_the_dialer_once() {
        let transport = Arc::new(MockTransport {
            broken_builds: 1,
            ..MockTransport::new(Exit::Reply)
        });
        let c = Arc::new(client(transport.clone(), 0));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let c = c.clone();
            tasks.spawn(async move { c.connect(NetworkType::Tcp, &format!("host{i}:80")).await });
        }
        while let Some(res) = tasks.join_next().await {
            assert!(res.unwrap().is_ok());
        }

        assert_eq!(transport.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_exit_times_out_and_the_stream_is_closed() {
        let transport = Arc::new(MockTransport::new(Exit::Silent));
        let c = client(transport.clone(), 1);

        let started = tokio::time::Instant::now();
        let err = c
            .connect(NetworkType::Tcp, "example.com:443")
            .await
            .err()
            .expect("connect should fail");
        assert!(started.elapsed() >= RESPONSE_TIMEOUT);

        match err {
            ConnectError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last_error, ConnectError::ResponseTimeout(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }

        transport.closed.notified().await;
    }

    #[tokio::test]
    async fn mismatched_response_is_terminal() {
        let transport = Arc::new(MockTransport::new(Exit::Mismatch));
        let c = client(transport.clone(), 0);

        let err = c
            .connect(NetworkType::Tcp6, "[::1]:22")
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, ConnectError::ProtocolMismatch));
        assert_eq!(transport.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_capped() {
        let transport = Arc::new(MockTransport {
            failing_builds: u32::MAX,
            ..MockTransport::new(Exit::Reply)
        });
        let c = client(transport.clone(), 3);

        let err = c
            .connect(NetworkType::Tcp, "example.com:80")
            .await
            .err()
            .expect("connect should fail");
        match err {
            ConnectError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last_error, ConnectError::Transport(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(transport.builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bind_and_udp_are_not_supported() {
        let c = client(Arc::new(MockTransport::new(Exit::Reply)), 0);
        assert!(matches!(
            c.bind("0.0.0.0:0").await,
            Err(ConnectError::CommandNotSupported(Command::Bind))
        ));
        assert!(matches!(
            c.udp_associate("0.0.0.0:0").await,
            Err(ConnectError::CommandNotSupported(Command::UdpAssociate))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tunnel_stream_times_out() {
        let c = client(Arc::new(MockTransport::new(Exit::Reply)), 0);
        let started = tokio::time::Instant::now();
        let (mut s, _) = c.connect(NetworkType::Tcp, "example.com:80").await.unwrap();

        let mut buf = [0u8; 1];
        let err = s.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn raw_dial_reuses_the_dialer() {
        let transport = Arc::new(MockTransport::new(Exit::Reply));
        let c = client(transport.clone(), 0);
        let _a = c.dial("a").await.unwrap();
        let _b = c.dial("b").await.unwrap();
        assert_eq!(transport.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn labels_carry_network_address_and_a_letter_suffix() {
        let label = make_label(NetworkType::Tcp4, "1.2.3.4:80");
        let suffix = label.strip_prefix("tcp4-1.2.3.4:80-").unwrap();
        assert_eq!(suffix.len(), LABEL_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| b.is_ascii_alphabetic()));
    }
}
