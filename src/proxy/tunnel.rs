//! Byte relay between the client and an established upstream tunnel

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, Instrument, Span};

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction over a tunnel's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Last time bytes moved in either direction.
#[derive(Debug)]
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Copies bytes both ways until either side closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relay {
    idle_timeout: Option<Duration>,
}

impl Relay {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self { idle_timeout }
    }

    /// Run the tunnel to completion.
    ///
    /// Each direction runs as its own task. When one stops it shuts down its
    /// write side and tells the other to stop, so both connections are
    /// released once this returns. With an idle timeout, the tunnel is
    /// closed only after neither direction has moved a byte for that long.
    pub async fn run<C, U>(self, client: C, upstream: U) -> RelayStats
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        U: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);
        let (closed_tx, closed_rx) = watch::channel(false);
        let activity = Arc::new(Activity::new());

        let idle_watch = self.idle_timeout.map(|limit| {
            tokio::spawn(
                watchdog(activity.clone(), limit, closed_tx.clone()).instrument(Span::current()),
            )
        });

        let outbound = tokio::spawn(
            pump(
                client_read,
                upstream_write,
                closed_tx.clone(),
                closed_rx.clone(),
                activity.clone(),
                "client_to_upstream",
            )
            .instrument(Span::current()),
        );
        let inbound = tokio::spawn(
            pump(
                upstream_read,
                client_write,
                closed_tx,
                closed_rx,
                activity,
                "upstream_to_client",
            )
            .instrument(Span::current()),
        );

        let (outbound, inbound) = tokio::join!(outbound, inbound);
        if let Some(idle_watch) = idle_watch {
            idle_watch.abort();
        }
        let stats = RelayStats {
            client_to_upstream: outbound.unwrap_or_else(|e| {
                debug!("Client to upstream task ended abnormally: {}", e);
                0
            }),
            upstream_to_client: inbound.unwrap_or_else(|e| {
                debug!("Upstream to client task ended abnormally: {}", e);
                0
            }),
        };

        debug!(
            bytes_sent = stats.client_to_upstream,
            bytes_received = stats.upstream_to_client,
            "Tunnel closed"
        );
        stats
    }
}

/// Signal both directions to stop once the tunnel has been quiet for `limit`.
async fn watchdog(activity: Arc<Activity>, limit: Duration, closed_tx: watch::Sender<bool>) {
    loop {
        let idle = activity.idle_for();
        if idle >= limit {
            debug!(idle_ms = idle.as_millis() as u64, "Relay idle timeout");
            let _ = closed_tx.send(true);
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

/// Copy one direction until EOF, error or a stop signal.
async fn pump<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    closed_tx: watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
    activity: Arc<Activity>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = closed_rx.changed() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                activity.touch();
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!(direction, error = %e, "Relay write failed");
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                debug!(direction, error = %e, "Relay read ended");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    let _ = closed_tx.send(true);
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::time::timeout;

    async fn read_to_end<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
        let mut out = Vec::new();
        timeout(Duration::from_secs(1), stream.read_to_end(&mut out))
            .await
            .expect("read timed out")
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_client_bytes_reach_upstream() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);
        let relay = tokio::spawn(Relay::default().run(client, upstream));

        client_peer.write_all(b"hello from client").await.unwrap();
        client_peer.write_all(b", twice").await.unwrap();
        client_peer.shutdown().await.unwrap();

        assert_eq!(read_to_end(&mut upstream_peer).await, b"hello from client, twice");
        // The client closing ends the other direction as well.
        assert!(read_to_end(&mut client_peer).await.is_empty());

        let stats = timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(stats.client_to_upstream, 24);
        assert_eq!(stats.upstream_to_client, 0);
    }

    #[tokio::test]
    async fn test_upstream_bytes_reach_client() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);
        let relay = tokio::spawn(Relay::default().run(client, upstream));

        upstream_peer.write_all(b"hello from upstream").await.unwrap();
        upstream_peer.shutdown().await.unwrap();

        assert_eq!(read_to_end(&mut client_peer).await, b"hello from upstream");

        let stats = timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay did not finish")
            .unwrap();
        assert_eq!(stats.upstream_to_client, 19);
    }

    #[tokio::test]
    async fn test_interleaved_traffic() {
        let (client, mut client_peer) = duplex(64);
        let (upstream, mut upstream_peer) = duplex(64);
        let relay = tokio::spawn(Relay::default().run(client, upstream));

        let mut buf = [0u8; 16];
        for round in 0..5u8 {
            client_peer.write_all(&[round; 8]).await.unwrap();
            upstream_peer.read_exact(&mut buf[..8]).await.unwrap();
            assert_eq!(&buf[..8], &[round; 8]);

            upstream_peer.write_all(&[round + 100; 16]).await.unwrap();
            client_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [round + 100; 16]);
        }

        drop(upstream_peer);
        assert!(read_to_end(&mut client_peer).await.is_empty());
        let stats = timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
        assert_eq!(
            stats,
            RelayStats {
                client_to_upstream: 40,
                upstream_to_client: 80,
            }
        );
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_tunnel() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);
        let relay = tokio::spawn(Relay::new(Some(Duration::from_millis(50))).run(client, upstream));

        let stats = timeout(Duration::from_secs(1), relay)
            .await
            .expect("idle tunnel was not closed")
            .unwrap();
        assert_eq!(stats, RelayStats::default());
        assert!(read_to_end(&mut client_peer).await.is_empty());
        assert!(read_to_end(&mut upstream_peer).await.is_empty());
    }

    #[tokio::test]
    async fn test_one_way_traffic_keeps_tunnel_open() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);
        let relay = tokio::spawn(Relay::new(Some(Duration::from_millis(100))).run(client, upstream));

        // The client never sends; the upstream streams for well past the limit.
        let download = tokio::spawn(async move {
            for _ in 0..20 {
                upstream_peer.write_all(b"chunk").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            upstream_peer
        });

        let mut received = vec![0u8; 100];
        timeout(Duration::from_secs(2), client_peer.read_exact(&mut received))
            .await
            .expect("download stalled")
            .unwrap();
        assert_eq!(received, b"chunk".repeat(20));
        assert!(!relay.is_finished());

        // Once both sides are quiet the limit applies again.
        let _upstream_peer = download.await.unwrap();
        let stats = timeout(Duration::from_secs(1), relay)
            .await
            .expect("idle tunnel was not closed")
            .unwrap();
        assert_eq!(stats.upstream_to_client, 100);
        assert_eq!(stats.client_to_upstream, 0);
        assert!(read_to_end(&mut client_peer).await.is_empty());
    }
}
