use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::rr::RecordType;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::doh::DohClient;
use crate::error::ProxyError;

const IPV4_ONLY: &[RecordType] = &[RecordType::A];
const IPV4_AND_IPV6: &[RecordType] = &[RecordType::A, RecordType::AAAA];
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Resolves and dials destinations for both handlers.
#[derive(Clone)]
pub struct Connector {
    doh: Option<&'static DohClient>,
    record_types: &'static [RecordType],
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(doh: Option<&'static DohClient>, ipv6: bool, connect_timeout: Duration) -> Self {
        Self {
            doh,
            record_types: if ipv6 { IPV4_AND_IPV6 } else { IPV4_ONLY },
            connect_timeout,
        }
    }

    /// Opens a TCP connection to `host:port`.
    ///
    /// IP literals are dialed as-is. Host names go through DoH when it is
    /// configured and fall back to the system resolver when DoH has nothing.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let target = format!("{host}:{port}");
        let addrs = self.resolve(host, port).await?;

        let per_attempt = attempt_timeout(self.connect_timeout, addrs.len());
        let stream = match timeout(self.connect_timeout, dial_any(&addrs, per_attempt)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(classify_dial_error(&target, e)),
            Err(_) => return Err(ProxyError::ConnectTimeout(target)),
        };

        let _ = stream.set_nodelay(true);
        debug!("Connected to {} via {:?}", target, stream.peer_addr().ok());
        Ok(stream)
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ProxyError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        if let Some(doh) = self.doh {
            match doh.resolve(host, self.record_types).await {
                Ok(ips) if !ips.is_empty() => {
                    return Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect());
                }
                Ok(_) => debug!("[DoH] no address for {}, using system resolver", host),
                Err(e) => warn!("[DoH] {} failed: {}, using system resolver", host, e),
            }
        }

        let lookup = tokio::net::lookup_host((host, port));
        let addrs: Vec<SocketAddr> = match timeout(self.connect_timeout, lookup).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => return Err(ProxyError::ResolveFailed(format!("{host}: {e}"))),
            Err(_) => return Err(ProxyError::ResolveFailed(format!("{host}: lookup timed out"))),
        };

        if addrs.is_empty() {
            return Err(ProxyError::ResolveFailed(host.to_string()));
        }
        Ok(addrs)
    }
}

/// Share of `total` each address gets, so one unresponsive address cannot
/// use up the whole budget. Never below `MIN_ATTEMPT_TIMEOUT` or above `total`.
fn attempt_timeout(total: Duration, addrs: usize) -> Duration {
    let addrs = u32::try_from(addrs.max(1)).unwrap_or(u32::MAX);
    (total / addrs).max(MIN_ATTEMPT_TIMEOUT).min(total)
}

/// Tries each address in order, returning the first that connects.
async fn dial_any(addrs: &[SocketAddr], per_attempt: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(per_attempt, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                debug!("Dial {} timed out after {:?}", addr, per_attempt);
                last_err = Some(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("dial {addr} timed out"),
                ));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no addresses to dial")))
}

fn classify_dial_error(target: &str, e: io::Error) -> ProxyError {
    match e.kind() {
        ErrorKind::ConnectionRefused => ProxyError::ConnectRefused(target.to_string()),
        ErrorKind::TimedOut => ProxyError::ConnectTimeout(target.to_string()),
        _ => ProxyError::Io(e),
    }
}

/// A loopback address whose accept queue is full, so new connects hang.
#[cfg(test)]
pub(crate) mod blackhole {
    use std::net::SocketAddr;
    use std::time::Duration;

    use socket2::{Domain, Protocol, Socket, Type};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    pub(crate) struct Blackhole {
        pub(crate) addr: SocketAddr,
        _listener: Socket,
        _queued: Vec<TcpStream>,
    }

    pub(crate) async fn blackhole() -> Blackhole {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        listener
            .bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into())
            .unwrap();
        // Never accepted from; with a zero backlog the queue fills at once.
        listener.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let mut queued = Vec::new();
        for _ in 0..8 {
            match timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => queued.push(stream),
                _ => break,
            }
        }

        Blackhole {
            addr,
            _listener: listener,
            _queued: queued,
        }
    }
}
