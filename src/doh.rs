use std::net::IpAddr;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::error::ProxyError;

const DOH_CONTENT_TYPE: &str = "application/dns-message";
const DOH_PATH: &str = "/dns-query";

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_HOST: usize = 100;

static DOH_CLIENT: OnceCell<DohClient> = OnceCell::new();

/// DNS-over-HTTPS resolver sharing one pooled HTTP client.
#[derive(Debug)]
pub struct DohClient {
    upstream: String,
    http: reqwest::Client,
}

impl DohClient {
    /// The process-wide client. Built on the first call; later calls get the
    /// same instance whatever `upstream` they pass.
    pub fn global(upstream: &str) -> Result<&'static DohClient, ProxyError> {
        DOH_CLIENT.get_or_try_init(|| DohClient::new(upstream))
    }

    pub fn new(upstream: &str) -> Result<Self, ProxyError> {
        // reqwest's overall timeout also covers the TLS handshake.
        let http = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .no_proxy()
            .use_rustls_tls()
            .build()
            .map_err(|e| ProxyError::DohTransport(format!("building HTTP client: {e}")))?;

        Ok(Self {
            upstream: normalize_upstream(upstream),
            http,
        })
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Resolves `domain` for each of `record_types` in turn.
    ///
    /// A/AAAA answers are returned in the order received; other records are
    /// ignored. A non-NoError rcode skips that type. Transport and decode
    /// failures abort the whole call.
    ///
    /// Dropping the returned future cancels the in-flight request.
    pub async fn resolve(
        &self,
        domain: &str,
        record_types: &[RecordType],
    ) -> Result<Vec<IpAddr>, ProxyError> {
        let mut addrs = Vec::new();

        for &record_type in record_types {
            let query = build_query(domain, record_type)?;
            let response = self.exchange(&query).await?;

            if response.response_code() != ResponseCode::NoError {
                debug!(
                    "[DoH] {} {} answered {}",
                    domain,
                    record_type,
                    response.response_code()
                );
                continue;
            }

            for record in response.answers() {
                match record.data() {
                    Some(RData::A(a)) => addrs.push(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => addrs.push(IpAddr::V6(aaaa.0)),
                    _ => {}
                }
            }
        }

        trace!("[DoH] {} -> {:?}", domain, addrs);
        Ok(addrs)
    }

    async fn exchange(&self, query: &Message) -> Result<Message, ProxyError> {
        let packet = query
            .to_vec()
            .map_err(|e| ProxyError::DohTransport(format!("encoding query: {e}")))?;
        let url = format!("{}?dns={}", self.upstream, URL_SAFE_NO_PAD.encode(packet));

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, DOH_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| ProxyError::DohTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::DohTransport(format!(
                "{} returned {}",
                self.upstream, status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::DohTransport(format!("reading body: {e}")))?;

        Message::from_vec(&body)
            .map_err(|e| ProxyError::DohTransport(format!("decoding answer: {e}")))
    }
}

/// `dns.example.com` -> `https://dns.example.com/dns-query`.
///
/// Applying it to its own output changes nothing. An explicit scheme is
/// kept as given.
pub fn normalize_upstream(upstream: &str) -> String {
    let upstream = upstream.trim();
    let (scheme, rest) = upstream.split_once("://").unwrap_or(("https", upstream));

    // Only the part after the scheme is trimmed; "https://" keeps its slashes.
    let rest = rest.trim_end_matches('/');
    if rest.ends_with(DOH_PATH) {
        format!("{scheme}://{rest}")
    } else {
        format!("{scheme}://{rest}{DOH_PATH}")
    }
}

/// Host (and port) part of an upstream, `None` when there is none.
pub fn upstream_authority(upstream: &str) -> Option<&str> {
    let upstream = upstream.trim();
    let rest = upstream.split_once("://").map_or(upstream, |(_, rest)| rest);
    rest.split(['/', '?']).next().filter(|host| !host.is_empty())
}

fn build_query(domain: &str, record_type: RecordType) -> Result<Message, ProxyError> {
    let fqdn = if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{domain}.")
    };
    let name = Name::from_ascii(&fqdn)
        .map_err(|e| ProxyError::ResolveFailed(format!("{domain}: {e}")))?;

    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));

    Ok(message)
}


#[cfg(test)]
mod tests {
    use super::stub::{reply, stub_server};
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA, TXT};
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn client_for(addr: SocketAddr) -> DohClient {
        DohClient::new(&format!("http://{addr}")).unwrap()
    }

    #[test]
    fn test_normalize_upstream() {
        assert_eq!(
            normalize_upstream("dns.example.com"),
            "https://dns.example.com/dns-query"
        );
        assert_eq!(
            normalize_upstream("https://dns.example.com/"),
            "https://dns.example.com/dns-query"
        );
        assert_eq!(
            normalize_upstream("http://127.0.0.1:8053"),
            "http://127.0.0.1:8053/dns-query"
        );
    }

    #[test]
    fn test_normalize_upstream_is_idempotent() {
        for input in [
            "dns.example.com",
            "1.1.1.1",
            "https://dns.google/dns-query",
            "https://dns.google/dns-query/",
            "x/",
            "https://",
            "https:///",
        ] {
            let once = normalize_upstream(input);
            assert_eq!(normalize_upstream(&once), once, "{input:?}");
        }
    }

    #[test]
    fn test_scheme_slashes_survive_normalization() {
        assert_eq!(normalize_upstream("https://"), "https:///dns-query");
        assert_eq!(
            normalize_upstream("https://dns.google/dns-query/"),
            "https://dns.google/dns-query"
        );
    }

    #[test]
    fn test_upstream_authority() {
        assert_eq!(upstream_authority("1.1.1.1"), Some("1.1.1.1"));
        assert_eq!(
            upstream_authority("https://dns.google:443/dns-query"),
            Some("dns.google:443")
        );
        assert_eq!(upstream_authority("https://"), None);
        assert_eq!(upstream_authority("https:///dns-query"), None);
        assert_eq!(upstream_authority("/dns-query"), None);
    }

    #[test]
    fn test_global_client_built_once() {
        let clients: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    scope.spawn(move || {
                        let upstream = format!("dns{i}.example.com");
                        DohClient::global(&upstream).unwrap() as *const DohClient as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(clients.windows(2).all(|w| w[0] == w[1]));

        let first = DohClient::global("other.example.com").unwrap();
        assert_eq!(first as *const DohClient as usize, clients[0]);
        assert!(first.upstream().starts_with("https://dns"));
        assert!(first.upstream().ends_with(".example.com/dns-query"));
    }

    #[test]
    fn test_build_query() {
        let query = build_query("example.com", RecordType::AAAA).unwrap();
        assert_eq!(query.queries().len(), 1);
        assert_eq!(query.queries()[0].query_type(), RecordType::AAAA);
        assert_eq!(query.queries()[0].name().to_ascii(), "example.com.");
        assert!(query.recursion_desired());
    }

    #[tokio::test]
    async fn test_resolve_single_a_record() {
        let (addr, seen) = stub_server(Arc::new(|q: &Message| {
            reply(q, ResponseCode::NoError, vec![RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))])
        }))
        .await;

        let client = client_for(addr);
        let addrs = client.resolve("example.com", &[RecordType::A]).await.unwrap();
        let addrs: Vec<String> = addrs.iter().map(ToString::to_string).collect();
        assert_eq!(addrs, vec!["93.184.216.34"]);

        let heads = seen.lock().unwrap();
        assert_eq!(heads.len(), 1);
        assert!(heads[0].starts_with("GET /dns-query?dns="));
        assert!(heads[0].to_ascii_lowercase().contains("accept: application/dns-message"));
    }

    #[tokio::test]
    async fn test_resolve_keeps_order_and_ignores_other_records() {
        let (addr, _) = stub_server(Arc::new(|q: &Message| match q.queries()[0].query_type() {
            RecordType::A => reply(
                q,
                ResponseCode::NoError,
                vec![
                    RData::A(A(Ipv4Addr::new(10, 0, 0, 2))),
                    RData::TXT(TXT::new(vec!["ignored".to_string()])),
                    RData::A(A(Ipv4Addr::new(10, 0, 0, 1))),
                ],
            ),
            _ => reply(
                q,
                ResponseCode::NoError,
                vec![RData::AAAA(AAAA(Ipv6Addr::LOCALHOST))],
            ),
        }))
        .await;

        let client = client_for(addr);
        let addrs = client
            .resolve("example.com", &[RecordType::A, RecordType::AAAA])
            .await
            .unwrap();

        assert_eq!(
            addrs,
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_skips_failed_rcode() {
        let (addr, _) = stub_server(Arc::new(|q: &Message| match q.queries()[0].query_type() {
            RecordType::A => reply(q, ResponseCode::ServFail, vec![]),
            _ => reply(
                q,
                ResponseCode::NoError,
                vec![RData::AAAA(AAAA(Ipv6Addr::LOCALHOST))],
            ),
        }))
        .await;

        let client = client_for(addr);
        let addrs = client
            .resolve("example.com", &[RecordType::A, RecordType::AAAA])
            .await
            .unwrap();
        assert_eq!(addrs, vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]);
    }

    #[tokio::test]
    async fn test_resolve_undecodable_body() {
        let (addr, _) = stub_server(Arc::new(|_: &Message| vec![0xde, 0xad])).await;

        let client = client_for(addr);
        let err = client.resolve("example.com", &[RecordType::A]).await.unwrap_err();
        assert!(matches!(err, ProxyError::DohTransport(_)));
    }

    #[tokio::test]
    async fn test_resolve_unreachable_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(addr);
        let err = client.resolve("example.com", &[RecordType::A]).await.unwrap_err();
        assert!(matches!(err, ProxyError::DohTransport(_)));
    }
}
