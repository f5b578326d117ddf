use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Last time any byte moved in either direction of one tunnel.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Copies bytes both ways between `client` and `server`. Returns
/// `(client -> server, server -> client)` byte counts.
///
/// The first direction to reach EOF or fail ends the whole tunnel; the
/// caller then drops both sockets. With `idle_timeout` set, the tunnel is
/// also torn down once nothing has moved in either direction for that long.
pub async fn relay(
    client: &mut TcpStream,
    server: &mut TcpStream,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)> {
    let activity = Activity::new();
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);
    let (mut client_read, mut client_write) = client.split();
    let (mut server_read, mut server_write) = server.split();

    tokio::select! {
        done = copy_half(&mut client_read, &mut server_write, idle_timeout, &activity, &sent) => done?,
        done = copy_half(&mut server_read, &mut client_write, idle_timeout, &activity, &received) => done?,
    }

    Ok((sent.load(Ordering::Relaxed), received.load(Ordering::Relaxed)))
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    activity: &Activity,
    copied: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = match idle_timeout {
            None => reader.read(&mut buf).await?,
            Some(limit) => loop {
                match timeout(limit, reader.read(&mut buf)).await {
                    Ok(read) => break read?,
                    // The other direction is still busy.
                    Err(_) if activity.idle_for() < limit => continue,
                    Err(_) => return Err(idle_error()),
                }
            },
        };

        if n == 0 {
            // Peer may already be gone; nothing left to tell it.
            let _ = writer.shutdown().await;
            return Ok(());
        }

        match idle_timeout {
            None => writer.write_all(&buf[..n]).await?,
            Some(limit) => timeout(limit, writer.write_all(&buf[..n]))
                .await
                .map_err(|_| idle_error())??,
        }

        activity.touch();
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn idle_error() -> io::Error {
    io::Error::new(ErrorKind::TimedOut, "relay idle timeout")
}
