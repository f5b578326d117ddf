use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::connector::Connector;
use crate::doh::DohClient;
use crate::error::ProxyError;
use crate::packet::{read_request, HttpPacket};
use crate::stats::Stats;
use crate::{forward, tunnel};

pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
pub const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 64;

/// Source of client connections for the accept loop.
pub trait Accept {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Decides what the accept loop does after a failed `accept`.
#[derive(Debug)]
struct AcceptErrors {
    backoff: Duration,
    max_consecutive: u32,
    consecutive: u32,
}

impl Default for AcceptErrors {
    fn default() -> Self {
        Self {
            backoff: ACCEPT_BACKOFF,
            max_consecutive: MAX_CONSECUTIVE_ACCEPT_ERRORS,
            consecutive: 0,
        }
    }
}

impl AcceptErrors {
    fn on_success(&mut self) {
        self.consecutive = 0;
    }

    /// `Continue(backoff)` to sleep and retry, `Break` once the listener
    /// has failed `max_consecutive` times in a row.
    fn on_error(&mut self, e: &io::Error) -> ControlFlow<(), Duration> {
        self.consecutive += 1;
        warn!(
            "Accept failed ({}/{}): {}",
            self.consecutive, self.max_consecutive, e
        );
        if self.consecutive >= self.max_consecutive {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(self.backoff)
        }
    }
}

/// Everything a connection task needs, cloned into each one.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<ProxyConfig>,
    pub connector: Connector,
    pub stats: Arc<Stats>,
}

impl Context {
    pub fn new(config: ProxyConfig, doh: Option<&'static DohClient>) -> Self {
        let connector = Connector::new(doh, config.ipv6, config.connect_timeout);
        Self {
            config: Arc::new(config),
            connector,
            stats: Arc::new(Stats::new()),
        }
    }
}

pub struct Proxy {
    ctx: Context,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let doh = match config.doh_upstream {
            Some(ref upstream) => {
                let client = DohClient::global(upstream).context("Failed to set up DoH")?;
                info!("Resolving through DoH at {}", client.upstream());
                Some(client)
            }
            None => None,
        };

        Ok(Self {
            ctx: Context::new(config, doh),
        })
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.ctx.stats
    }

    /// Binds the configured address and serves until the listener dies.
    pub async fn start(&self) -> anyhow::Result<()> {
        let addr = self.ctx.config.listen;
        let listener = bind_listener(addr).with_context(|| format!("Failed to bind {addr}"))?;

        info!("Proxy listening on http://{}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve<L: Accept + Send>(&self, listener: L) -> anyhow::Result<()> {
        self.serve_with(listener, AcceptErrors::default()).await
    }

    async fn serve_with<L: Accept + Send>(
        &self,
        mut listener: L,
        mut errors: AcceptErrors,
    ) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => {
                    errors.on_success();
                    conn
                }
                Err(e) => match errors.on_error(&e) {
                    ControlFlow::Continue(backoff) => {
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    ControlFlow::Break(()) => {
                        return Err(e).context("Listener keeps failing, giving up");
                    }
                },
            };

            let ctx = self.ctx.clone();
            let guard = ctx.stats.track_connection();

            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = handle_connection(stream, &ctx).await {
                    debug!("Connection error from {}: {}", peer, e);
                    if !e.is_expected() {
                        ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    }
}

pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn handle_connection(mut client: TcpStream, ctx: &Context) -> Result<(), ProxyError> {
    let _ = client.set_nodelay(true);

    let raw = read_request(&mut client, ctx.config.request_timeout).await?;
    let request = HttpPacket::parse(raw)?;

    if !request.is_valid_method() {
        return Err(ProxyError::UnsupportedMethod(request.method().to_string()));
    }

    debug!(
        "{} {}:{}",
        request.method(),
        request.host(),
        request.port()
    );

    if request.is_connect_method() {
        tunnel::handle_https(client, &request, ctx).await
    } else {
        forward::handle_http(client, &request, ctx).await
    }
}
