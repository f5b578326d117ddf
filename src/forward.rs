use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ProxyError;
use crate::packet::HttpPacket;
use crate::proxy::{Context, RESPONSE_502};
use crate::relay::relay;

/// Plain HTTP: the request goes out exactly as the client sent it and the
/// connection becomes a byte pipe after that.
pub async fn handle_http(
    mut client: TcpStream,
    request: &HttpPacket,
    ctx: &Context,
) -> Result<(), ProxyError> {
    let host = request.host();

    let mut server = match ctx.connector.connect(host, request.port()).await {
        Ok(server) => server,
        Err(e) => {
            let _ = client.write_all(RESPONSE_502).await;
            return Err(e);
        }
    };

    debug!("{} {}:{}", request.method(), host, request.port());
    server.write_all(request.raw()).await?;
    server.flush().await?;

    match relay(&mut client, &mut server, ctx.config.idle_timeout).await {
        Ok((sent, received)) => {
            ctx.stats.record_transfer(sent + request.raw().len() as u64, received);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            debug!("Idle timeout for {}", host);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn client_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_request_forwarded_unmodified() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        let raw = format!(
            "GET http://127.0.0.1:{port}/index.html HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nUser-Agent: test\r\n\r\n"
        )
        .into_bytes();
        let request = HttpPacket::parse(raw.clone()).unwrap();

        let ctx = Context::new(ProxyConfig::default(), None);
        let stats = Arc::clone(&ctx.stats);
        let (mut client, proxied) = client_pair().await;
        let handler = tokio::spawn(async move { handle_http(proxied, &request, &ctx).await });

        let (mut server, _) = origin.accept().await.unwrap();
        let mut received = vec![0u8; raw.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, raw);

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        server.write_all(response).await.unwrap();
        drop(server);

        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, response);

        drop(client);
        handler.await.unwrap().unwrap();
        assert_eq!(stats.bytes_in.load(Ordering::Relaxed), response.len() as u64);
        assert_eq!(stats.bytes_out.load(Ordering::Relaxed), raw.len() as u64);
    }

    #[tokio::test]
    async fn test_unreachable_origin_gets_502() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let raw = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n").into_bytes();
        let request = HttpPacket::parse(raw).unwrap();
        let ctx = Context::new(ProxyConfig::default(), None);
        let (mut client, proxied) = client_pair().await;

        let err = handle_http(proxied, &request, &ctx).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConnectRefused(_)));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, RESPONSE_502);
    }
}
