//! Outbound CONNECT handshake with a candidate proxy

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::candidates::Candidate;

/// Largest response head accepted from an upstream proxy.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response head too large")]
    HeadTooLarge,

    #[error("connection closed before response")]
    Closed,

    #[error("upstream answered {0}")]
    Rejected(StatusCode),
}

/// Deadlines for dialing and for the CONNECT exchange.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimeouts {
    pub connect: Duration,
    pub exchange: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            exchange: Duration::from_secs(30),
        }
    }
}

/// Response head of a successful upstream CONNECT.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

/// An upstream tunnel ready for relaying.
#[derive(Debug)]
pub struct Established<S> {
    pub upstream: S,
    pub response: UpstreamResponse,
    /// Bytes the upstream sent after its response head
    pub leftover: Bytes,
}

/// Dial `candidate` and ask it to CONNECT to `target`.
pub async fn establish(
    candidate: &Candidate,
    target: &str,
    inbound: &HeaderMap,
    timeouts: &HandshakeTimeouts,
) -> Result<Established<TcpStream>, HandshakeError> {
    let stream = timeout(timeouts.connect, TcpStream::connect(&candidate.address))
        .await
        .map_err(|_| HandshakeError::Timeout("connect"))?
        .map_err(HandshakeError::Connect)?;
    let _ = stream.set_nodelay(true);

    let request = connect_request(target, inbound, candidate.proxy_authorization().as_deref());
    timeout(timeouts.exchange, exchange(stream, &request))
        .await
        .map_err(|_| HandshakeError::Timeout("handshake"))?
}

/// Serialize the outbound CONNECT request.
///
/// Inbound headers are copied except `Host`, which names the target, and
/// `Proxy-Authorization`, which belongs to this hop.
pub fn connect_request(target: &str, inbound: &HeaderMap, authorization: Option<&str>) -> Vec<u8> {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n").into_bytes();
    for (name, value) in inbound {
        if name == HOST || name == PROXY_AUTHORIZATION {
            continue;
        }
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    if let Some(authorization) = authorization {
        request.extend_from_slice(b"Proxy-Authorization: ");
        request.extend_from_slice(authorization.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");
    request
}

/// Write `request` and read the upstream's answer. Anything but 2xx is a failure.
pub async fn exchange<S>(mut stream: S, request: &[u8]) -> Result<Established<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await?;
    stream.flush().await?;

    let (response, leftover) = read_response(&mut stream).await?;
    if !response.status.is_success() {
        return Err(HandshakeError::Rejected(response.status));
    }
    Ok(Established {
        upstream: stream,
        response,
        leftover,
    })
}

/// Read one response head, returning it with any bytes that followed it.
pub async fn read_response<S>(stream: &mut S) -> Result<(UpstreamResponse, Bytes), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some((response, head_len)) = parse_head(&buf)? {
            let leftover = buf.split_off(head_len).freeze();
            return Ok((response, leftover));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HandshakeError::HeadTooLarge);
        }
        if buf.capacity() == buf.len() {
            buf.reserve(1024);
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(UpstreamResponse, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
    };
    if head_len > MAX_HEAD_SIZE {
        return Err(HandshakeError::HeadTooLarge);
    }

    let code = parsed
        .code
        .ok_or_else(|| HandshakeError::Malformed("missing status".into()))?;
    let status =
        StatusCode::from_u16(code).map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        header_map.append(name, value);
    }

    Ok(Some((
        UpstreamResponse {
            status,
            reason: parsed.reason.map(str::to_string),
            headers: header_map,
        },
        head_len,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("ignored.example"));
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic eDp5"));
        headers.insert("user-agent", HeaderValue::from_static("curl/8.0"));
        headers
    }

    #[test]
    fn test_connect_request_headers() {
        let request = connect_request("example.com:443", &inbound(), Some("Basic Zm9vOmJhcg=="));
        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n"));
        assert!(request.contains("user-agent: curl/8.0\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic Zm9vOmJhcg==\r\n"));
        assert!(!request.contains("eDp5"));
        assert!(!request.contains("ignored.example"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_connect_request_without_credentials() {
        let request = connect_request("example.com:443", &HeaderMap::new(), None);
        assert_eq!(
            request,
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_exchange_success_keeps_leftover() {
        let (client, mut server) = duplex(4096);
        let upstream = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECT example.com:443 HTTP/1.1\r\n"));
            server
                .write_all(b"HTTP/1.1 200 Connection Established\r\nVia: upstream\r\n\r\nhello")
                .await
                .unwrap();
            server
        });

        let request = connect_request("example.com:443", &HeaderMap::new(), None);
        let established = exchange(client, &request).await.unwrap();
        assert_eq!(established.response.status, StatusCode::OK);
        assert_eq!(
            established.response.reason.as_deref(),
            Some("Connection Established")
        );
        assert_eq!(established.response.headers.get("via").unwrap(), "upstream");
        assert_eq!(&established.leftover[..], b"hello");
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_rejects_non_2xx() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await;
            let _ = server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
            server
        });

        let err = exchange(client, b"CONNECT a:1 HTTP/1.1\r\n\r\n").await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Rejected(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        ));
    }

    #[tokio::test]
    async fn test_read_response_split_across_reads() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"HTTP/1.1 200 OK\r\nX-A").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            server.write_all(b": 1\r\n\r\n").await.unwrap();
            server
        });

        let (response, leftover) = read_response(&mut client).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("x-a").unwrap(), "1");
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_read_response_errors() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"HTTP/1.1 200").await.unwrap();
        });
        assert!(matches!(
            read_response(&mut client).await,
            Err(HandshakeError::Closed)
        ));

        let (mut client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            let mut head = b"HTTP/1.1 200 OK\r\n".to_vec();
            for i in 0..400 {
                head.extend_from_slice(format!("X-Pad-{}: padding\r\n", i).as_bytes());
            }
            let _ = server.write_all(&head).await;
            server
        });
        assert!(matches!(
            read_response(&mut client).await,
            Err(HandshakeError::HeadTooLarge) | Err(HandshakeError::Malformed(_))
        ));

        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let _ = server.write_all(b"garbage\r\n\r\n").await;
            server
        });
        assert!(matches!(
            read_response(&mut client).await,
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_establish_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let candidate = Candidate::parse(&addr.to_string()).unwrap();
        let err = establish(
            &candidate,
            "example.com:443",
            &HeaderMap::new(),
            &HandshakeTimeouts::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::Connect(_)));
    }

    #[tokio::test]
    async fn test_establish_handshake_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let candidate = Candidate::parse(&addr.to_string()).unwrap();
        let timeouts = HandshakeTimeouts {
            connect: Duration::from_secs(1),
            exchange: Duration::from_millis(50),
        };
        let err = establish(&candidate, "example.com:443", &HeaderMap::new(), &timeouts)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout("handshake")));
        silent.abort();
    }
}
