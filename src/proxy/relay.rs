use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, split};
use tokio::time::Instant;

use crate::error::{DispatchError, Result};

const RELAY_BUFFER: usize = 16 * 1024;

/// Bytes moved in each direction and how the relay ended.
#[derive(Debug)]
pub struct RelayOutcome {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub result: Result<()>,
}

/// Last time a byte crossed in either direction.
#[derive(Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock()
    }
}

async fn pump<R, W>(mut r: R, mut w: W, counter: Arc<AtomicU64>, activity: Activity) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        activity.touch();
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
    // Half-close: the peer sees EOF, the other direction keeps flowing.
    w.shutdown().await
}

async fn idle_watchdog(activity: Activity, idle: Duration) {
    loop {
        let deadline = activity.last() + idle;
        tokio::time::sleep_until(deadline).await;
        if activity.last() + idle <= Instant::now() {
            return;
        }
    }
}

/// Byte counters and idle clock shared by the [`Metered`] streams of one
/// session.
#[derive(Clone)]
pub struct Meter {
    read: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
    activity: Activity,
}

impl Meter {
    pub fn new() -> Self {
        Self {
            read: Arc::new(AtomicU64::new(0)),
            written: Arc::new(AtomicU64::new(0)),
            activity: Activity::new(),
        }
    }

    pub fn wrap<S>(&self, inner: S) -> Metered<S> {
        Metered {
            inner,
            meter: self.clone(),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Time since the last byte moved.
    pub fn quiet_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.activity.last())
    }

    /// Resolves once nothing has moved for `idle`.
    pub async fn idle(&self, idle: Duration) {
        idle_watchdog(self.activity.clone(), idle).await
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

/// A stream whose reads and writes feed a [`Meter`].
pub struct Metered<S> {
    inner: S,
    meter: Meter,
}

impl<S: AsyncRead + Unpin> AsyncRead for Metered<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n > 0 {
            this.meter.read.fetch_add(n as u64, Ordering::Relaxed);
            this.meter.activity.touch();
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Metered<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if n > 0 {
            this.meter.written.fetch_add(n as u64, Ordering::Relaxed);
            this.meter.activity.touch();
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Pumps bytes between `a` and `b` until both directions reach end of
/// stream, either side fails, or nothing moves for `idle`.
///
/// Both streams are dropped before this returns.
pub async fn run<A, B>(a: A, b: B, idle: Duration) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (ar, aw) = split(a);
    let (br, bw) = split(b);
    let up = Arc::new(AtomicU64::new(0));
    let down = Arc::new(AtomicU64::new(0));
    let activity = Activity::new();

    let result = {
        let forward = pump(ar, bw, up.clone(), activity.clone());
        let backward = pump(br, aw, down.clone(), activity.clone());
        tokio::select! {
            r = async { tokio::try_join!(forward, backward) } => {
                r.map(|_| ()).map_err(DispatchError::from)
            }
            _ = idle_watchdog(activity.clone(), idle) => Err(DispatchError::IdleTimeout),
        }
    };

    RelayOutcome {
        a_to_b: up.load(Ordering::Relaxed),
        b_to_a: down.load(Ordering::Relaxed),
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_counts_bytes_both_ways() {
        let (mut client, relay_a) = duplex(1024);
        let (relay_b, mut server) = duplex(1024);

        let relay = tokio::spawn(run(relay_a, relay_b, Duration::from_secs(60)));

        let upload = vec![7u8; 100];
        client.write_all(&upload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, upload);

        server.write_all(&[9u8; 50]).await.unwrap();
        server.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed.len(), 50);

        let outcome = relay.await.unwrap();
        assert_eq!(outcome.a_to_b, 100);
        assert_eq!(outcome.b_to_a, 50);
        assert!(outcome.result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (mut client, relay_a) = duplex(1024);
        let (relay_b, mut server) = duplex(1024);

        let started = Instant::now();
        let outcome = run(relay_a, relay_b, Duration::from_secs(60)).await;
        assert!(matches!(outcome.result, Err(DispatchError::IdleTimeout)));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(outcome.a_to_b + outcome.b_to_a, 0);

        // Both relay ends are gone, so each peer reads end of stream.
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_idle_timeout() {
        let (mut client, relay_a) = duplex(1024);
        let (relay_b, mut server) = duplex(1024);
        let relay = tokio::spawn(run(relay_a, relay_b, Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(40)).await;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(!relay.is_finished());

        let outcome = relay.await.unwrap();
        assert!(matches!(outcome.result, Err(DispatchError::IdleTimeout)));
        assert_eq!(outcome.a_to_b, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metered_stream_counts_and_resets_idle() {
        let (near, mut far) = duplex(1024);
        let meter = Meter::new();
        let mut stream = meter.wrap(near);

        tokio::time::sleep(Duration::from_secs(30)).await;
        stream.write_all(b"hello").await.unwrap();
        far.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(meter.bytes_written(), 5);
        assert_eq!(meter.bytes_read(), 2);
        assert_eq!(meter.quiet_for(), Duration::ZERO);

        let started = Instant::now();
        meter.idle(Duration::from_secs(10)).await;
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_error_ends_relay() {
        let (client, relay_a) = duplex(1024);
        let (relay_b, server) = duplex(1024);
        drop(server);

        let mut client = client;
        let relay = tokio::spawn(run(relay_a, relay_b, Duration::from_secs(60)));
        client.write_all(b"data").await.unwrap();

        let outcome = relay.await.unwrap();
        assert!(outcome.result.is_err());
        assert_eq!(outcome.a_to_b, 0);
    }
}
