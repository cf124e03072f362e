//! Bidirectional relay between two byte streams.
//!
//! Each relay runs one direction on a spawned task and the other on the caller's task.
//! The first direction to finish (EOF or error) tears the whole session down: the other
//! direction is cancelled and both streams are dropped, which closes them.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    time::{Instant, Sleep},
};

const RELAY_BUFFER_BYTES: usize = 32 * 1024;

/// Byte counts for a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    // Aborted on drop so a caller-side timeout also stops the spawned direction.
    let mut back = AbortOnDrop(tokio::spawn({
        let counter = b_to_a.clone();
        async move {
            let res = copy_counted(&mut b_rd, &mut a_wr, &counter).await;
            let _ = a_wr.shutdown().await;
            res
        }
    }));

    let forward = {
        let counter = a_to_b.clone();
        async move {
            let res = copy_counted(&mut a_rd, &mut b_wr, &counter).await;
            let _ = b_wr.shutdown().await;
            res
        }
    };

    tokio::select! {
        res = forward => {
            if let Err(err) = res {
                tracing::trace!(err = %err, "pipe: a->b ended");
            }
            back.0.abort();
            let _ = (&mut back.0).await;
        }
        res = &mut back.0 => {
            if let Ok(Err(err)) = res {
                tracing::trace!(err = %err, "pipe: b->a ended");
            }
        }
    }

    RelayStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    }
}

struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn copy_counted<R, W>(r: &mut R, w: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_BYTES];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        w.flush().await?;
    }
}

/// Runs `relay` under an absolute deadline. Returns `None` if the deadline cut the session.
pub async fn relay_with_deadline<A, B>(a: A, b: B, deadline: Duration) -> Option<RelayStats>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    if deadline.is_zero() {
        return Some(relay(a, b).await);
    }
    tokio::time::timeout(deadline, relay(a, b)).await.ok()
}

pin_project! {
    /// Fails reads and writes with `TimedOut` once the stream has been idle for `timeout`.
    ///
    /// Any successful read or write pushes the deadline forward. A zero timeout disables it.
    pub struct IdleTimeout<S> {
        #[pin]
        inner: S,
        sleep: Pin<Box<Sleep>>,
        timeout: Duration,
    }
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep(timeout)),
            timeout,
        }
    }
}

fn idle_expired(sleep: &mut Pin<Box<Sleep>>, timeout: Duration, cx: &mut Context<'_>) -> bool {
    !timeout.is_zero() && sleep.as_mut().poll(cx).is_ready()
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "idle timeout")
}

impl<S: AsyncRead> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(res) => {
                if !this.timeout.is_zero() {
                    this.sleep.as_mut().reset(Instant::now() + *this.timeout);
                }
                Poll::Ready(res)
            }
            Poll::Pending => {
                if idle_expired(this.sleep, *this.timeout, cx) {
                    Poll::Ready(Err(timed_out()))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, data) {
            Poll::Ready(res) => {
                if !this.timeout.is_zero() {
                    this.sleep.as_mut().reset(Instant::now() + *this.timeout);
                }
                Poll::Ready(res)
            }
            Poll::Pending => {
                if idle_expired(this.sleep, *this.timeout, cx) {
                    Poll::Ready(Err(timed_out()))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
