use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::ProxyError;

const MAX_HEADER_SIZE: usize = 8192;
const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Connect,
    Unsupported(String),
}

impl Method {
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            "CONNECT" => Method::Connect,
            other => Method::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Connect => "CONNECT",
            Method::Unsupported(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client's opening request, parsed once and never mutated.
#[derive(Debug, Clone)]
pub struct HttpPacket {
    method: Method,
    host: String,
    port: u16,
    raw: Vec<u8>,
    header_len: usize,
}

impl HttpPacket {
    /// Parses the request line and headers out of `raw`.
    ///
    /// An unknown method still parses; callers check `is_valid_method`.
    pub fn parse(raw: Vec<u8>) -> Result<Self, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let header_len = match request.parse(&raw) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::Parse("incomplete header block".into()))
            }
            Err(e) => return Err(ProxyError::Parse(e.to_string())),
        };

        let method = request
            .method
            .map(Method::from_token)
            .ok_or_else(|| ProxyError::Parse("missing method".into()))?;
        let target = request
            .path
            .ok_or_else(|| ProxyError::Parse("missing request target".into()))?;

        let (host, port) = if method == Method::Connect {
            split_host_port(target, DEFAULT_HTTPS_PORT)?
        } else {
            let host_header = request
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(str::trim)
                .filter(|v| !v.is_empty());

            match host_header {
                Some(value) => split_host_port(value, default_port_for(target))?,
                None => {
                    let authority = absolute_form_authority(target).ok_or_else(|| {
                        ProxyError::Parse(format!("no Host header and no authority in `{target}`"))
                    })?;
                    split_host_port(authority, default_port_for(target))?
                }
            }
        };

        Ok(Self {
            method,
            host,
            port,
            raw,
            header_len,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every byte received from the client so far.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Bytes the client sent past the end of the header block.
    pub fn trailing(&self) -> &[u8] {
        &self.raw[self.header_len..]
    }

    pub fn is_valid_method(&self) -> bool {
        !matches!(self.method, Method::Unsupported(_))
    }

    pub fn is_connect_method(&self) -> bool {
        self.method == Method::Connect
    }
}

/// Reads from `reader` until a full header block is buffered.
///
/// `read_timeout` bounds the whole exchange, not each read.
pub async fn read_request<R>(reader: &mut R, read_timeout: Duration) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let read_all = async {
        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProxyError::Parse(format!(
                    "client closed after {} bytes",
                    buf.len()
                )));
            }

            // Only the tail can complete the terminator.
            let scan_from = buf.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
            buf.extend_from_slice(&chunk[..n]);

            if buf[scan_from..]
                .windows(HEADER_TERMINATOR.len())
                .any(|w| w == HEADER_TERMINATOR)
            {
                return Ok(buf);
            }

            if buf.len() > MAX_HEADER_SIZE {
                return Err(ProxyError::Parse("header block too large".into()));
            }
        }
    };

    match timeout(read_timeout, read_all).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Parse("timed out waiting for request".into())),
    }
}

fn default_port_for(target: &str) -> u16 {
    if target
        .get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
    {
        DEFAULT_HTTPS_PORT
    } else {
        DEFAULT_HTTP_PORT
    }
}

/// `http://user@host:port/path?q` -> `host:port`
fn absolute_form_authority(target: &str) -> Option<&str> {
    let (_, rest) = target.split_once("://")?;
    let end = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
    let authority = &rest[..end];
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    (!authority.is_empty()).then_some(authority)
}

/// Splits `host[:port]`, `[v6]:port` or a bare IPv6 literal.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let bad = || ProxyError::Parse(format!("invalid authority `{authority}`"));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(bad)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or_else(bad)?)),
        }
    } else if authority.matches(':').count() > 1 {
        (authority, None)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(bad());
    }

    let port = match port {
        Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(bad)?,
        None => default_port,
    };

    Ok((host.to_string(), port))
}
