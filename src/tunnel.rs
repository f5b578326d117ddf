use std::io;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::error::ProxyError;
use crate::fragment::{self, TLS_HANDSHAKE_TYPE, TLS_RECORD_HEADER_LEN};
use crate::packet::HttpPacket;
use crate::proxy::{Context, RESPONSE_200_CONNECT, RESPONSE_502};
use crate::relay::relay;

// Largest TLSCiphertext a peer may send; anything bigger is not a ClientHello.
const MAX_CLIENT_HELLO_LEN: usize = 16 * 1024 + 2048;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    AwaitConnect,
    TunnelAck,
    AwaitClientHello,
    FragmentAndSend,
    Relay,
    Closed,
}

/// What the client sent first once the tunnel was up.
#[derive(Debug, PartialEq, Eq)]
enum FirstFlight {
    /// A complete TLS handshake record.
    Tls(Vec<u8>),
    /// Anything else, or a record cut short by EOF or the read deadline.
    Other(Vec<u8>),
}

/// Serves one CONNECT request: acknowledge, split the ClientHello across
/// writes, then relay until either side is done.
pub async fn handle_https(
    mut client: TcpStream,
    request: &HttpPacket,
    ctx: &Context,
) -> Result<(), ProxyError> {
    let host = request.host();
    let result = run_tunnel(&mut client, request, ctx).await;
    enter(host, TunnelState::Closed);
    result
}

async fn run_tunnel(
    client: &mut TcpStream,
    request: &HttpPacket,
    ctx: &Context,
) -> Result<(), ProxyError> {
    let host = request.host();
    enter(host, TunnelState::AwaitConnect);

    let mut server = match ctx.connector.connect(host, request.port()).await {
        Ok(server) => server,
        Err(e) => {
            let _ = client.write_all(RESPONSE_502).await;
            return Err(e);
        }
    };

    enter(host, TunnelState::TunnelAck);
    client.write_all(RESPONSE_200_CONNECT).await?;
    client.flush().await?;

    enter(host, TunnelState::AwaitClientHello);
    let first = read_first_flight(
        client,
        request.trailing(),
        Instant::now() + ctx.config.client_hello_timeout,
    )
    .await?;

    enter(host, TunnelState::FragmentAndSend);
    match first {
        FirstFlight::Tls(hello) if ctx.config.is_direct(host) => {
            ctx.stats.direct.fetch_add(1, Ordering::Relaxed);
            debug!("{} is on the direct list, ClientHello sent whole", host);
            server.write_all(&hello).await?;
            server.flush().await?;
        }
        FirstFlight::Tls(hello) => {
            let policy = &ctx.config.fragment;
            let fragments = fragment::split(&hello, policy);
            trace!(
                "{}: {} byte ClientHello as {:?}",
                host,
                hello.len(),
                fragments.iter().map(|f| f.len()).collect::<Vec<_>>()
            );
            fragment::write_fragments(&mut server, &fragments, policy.delay).await?;
            ctx.stats.fragmented.fetch_add(1, Ordering::Relaxed);
        }
        FirstFlight::Other(bytes) => {
            debug!("{}: first {} bytes are not a ClientHello", host, bytes.len());
            if !bytes.is_empty() {
                server.write_all(&bytes).await?;
                server.flush().await?;
            }
        }
    }

    enter(host, TunnelState::Relay);
    match relay(client, &mut server, ctx.config.idle_timeout).await {
        Ok((sent, received)) => {
            ctx.stats.record_transfer(sent, received);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            debug!("Idle timeout for {}", host);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn enter(host: &str, state: TunnelState) {
    trace!("{} -> {:?}", host, state);
}

/// Reads the client's first TLS record, starting with whatever was already
/// pipelined behind the CONNECT header block.
async fn read_first_flight<R>(
    client: &mut R,
    pending: &[u8],
    deadline: Instant,
) -> io::Result<FirstFlight>
where
    R: AsyncRead + Unpin,
{
    let mut buf = pending.to_vec();

    match timeout_at(deadline, fill_to(client, &mut buf, TLS_RECORD_HEADER_LEN)).await {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) | Err(_) => return Ok(FirstFlight::Other(buf)),
        Ok(Err(e)) => return Err(e),
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf[0] != TLS_HANDSHAKE_TYPE || record_len == 0 || record_len > MAX_CLIENT_HELLO_LEN {
        return Ok(FirstFlight::Other(buf));
    }

    let want = TLS_RECORD_HEADER_LEN + record_len;
    match timeout_at(deadline, fill_to(client, &mut buf, want)).await {
        Ok(Ok(true)) => Ok(FirstFlight::Tls(buf)),
        Ok(Ok(false)) | Err(_) => Ok(FirstFlight::Other(buf)),
        Ok(Err(e)) => Err(e),
    }
}

/// Reads until `buf` holds at least `want` bytes. Returns `false` on EOF.
/// Never reads past `want`, so bytes after the record stay in the socket.
async fn fill_to<R>(reader: &mut R, buf: &mut Vec<u8>, want: usize) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    while buf.len() < want {
        let limit = (want - buf.len()).min(READ_CHUNK);
        let n = reader.read(&mut chunk[..limit]).await?;
        if n == 0 {
            return Ok(false);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(true)
}
