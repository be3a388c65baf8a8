//! Full-duplex byte relay between two connections.
//!
//! Both directions run concurrently and are joined explicitly. The first
//! direction to end (EOF or error) signals the other to stop, and both stop
//! once neither has moved a byte for the idle timeout. Once both have
//! returned, each write half is shut down exactly once and both connections
//! are dropped.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Local client to upstream.
    pub local_to_upstream: u64,
    /// Upstream to local client.
    pub upstream_to_local: u64,
}

/// Last time either direction moved bytes, shared by both.
struct Activity {
    start: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self, idle: Duration) -> Instant {
        self.start + Duration::from_millis(self.last_millis.load(Ordering::Relaxed)) + idle
    }

    /// Resolves once the whole relay has been silent for `idle`.
    async fn idle_for(&self, idle: Duration) {
        loop {
            let deadline = self.deadline(idle);
            tokio::time::sleep_until(deadline).await;
            if self.deadline(idle) <= Instant::now() {
                return;
            }
        }
    }
}

/// Relay bytes between `local` and `upstream` until either side is done.
///
/// The relay ends on EOF or an error in either direction, or when neither
/// direction has moved a byte for `idle`.
pub async fn relay<L, U>(local: L, upstream: U, idle: Duration) -> RelayStats
where
    L: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let (stop_tx, stop_rx) = watch::channel(false);
    let activity = Activity::new();

    let (local_to_upstream, upstream_to_local) = tokio::join!(
        pipe(
            &mut local_read,
            &mut upstream_write,
            &activity,
            idle,
            &stop_tx,
            stop_rx.clone(),
            "local->upstream",
        ),
        pipe(
            &mut upstream_read,
            &mut local_write,
            &activity,
            idle,
            &stop_tx,
            stop_rx,
            "upstream->local",
        ),
    );

    close(&mut upstream_write, "upstream").await;
    close(&mut local_write, "local").await;

    let stats = RelayStats {
        local_to_upstream,
        upstream_to_local,
    };
    debug!(
        "Relay finished: {} bytes up, {} bytes down",
        stats.local_to_upstream, stats.upstream_to_local
    );
    stats
}

/// Copy `reader` into `writer` until EOF, error, relay-wide idleness, or a
/// stop signal. Reads and writes both give way to the last two. Signals stop
/// on the way out.
async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    idle: Duration,
    stop_tx: &watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            _ = stop_rx.changed() => {
                trace!("{}: stopped by peer direction", direction);
                break;
            }
            _ = activity.idle_for(idle) => {
                debug!("{}: relay idle for {:?}, closing", direction, idle);
                break;
            }
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                trace!("{}: EOF", direction);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("{}: read failed: {}", direction, e);
                break;
            }
        };
        activity.touch();

        let written = tokio::select! {
            _ = stop_rx.changed() => {
                trace!("{}: stopped by peer direction while writing", direction);
                break;
            }
            _ = activity.idle_for(idle) => {
                debug!("{}: write stalled for {:?}, closing", direction, idle);
                break;
            }
            written = write_all_flush(writer, &buf[..n]) => written,
        };

        if let Err(e) = written {
            debug!("{}: write failed: {}", direction, e);
            break;
        }
        activity.touch();
        total += n as u64;
    }

    // Receivers may already be gone; nothing to do then.
    let _ = stop_tx.send(true);
    total
}

async fn write_all_flush<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

async fn close<W: AsyncWrite + Unpin>(writer: &mut W, side: &'static str) {
    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown of {} side failed: {}", side, e);
    }
}
