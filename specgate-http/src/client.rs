//! Minimal outbound HTTP/1.1 client.
//!
//! Backs the OAuth2 login flow: resolves hosts through the gateway's DNS
//! resolver, speaks HTTP/1.1 with `Connection: close`, and delegates TLS
//! to an injected connector.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use specgate_core::{Error, Result};
use specgate_dns::Resolver;

use crate::conn::{read_chunked_body, read_exact_body};
use crate::headers::Headers;

/// A combined async stream, as produced by a TLS connector.
pub trait ClientStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ClientStream for T {}

/// Wraps a plain TCP stream in TLS.  The gateway core carries no TLS
/// implementation of its own; deployments inject one.
#[async_trait]
pub trait TlsConnector: Send + Sync {
    async fn connect(&self, domain: &str, stream: TcpStream) -> Result<Box<dyn ClientStream>>;
}

/// A buffered response from an outbound request.
#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Upstream(format!("invalid JSON response: {e}")))
    }

    /// Decode an `application/x-www-form-urlencoded` body.
    pub fn form(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(&self.body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

/// Outbound HTTP client.
pub struct HttpClient {
    resolver: Arc<Resolver>,
    tls: Option<Arc<dyn TlsConnector>>,
}

impl HttpClient {
    pub fn new(resolver: Arc<Resolver>) -> HttpClient {
        HttpClient { resolver, tls: None }
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsConnector>) -> HttpClient {
        self.tls = Some(tls);
        self
    }

    pub async fn get(&self, url: &Url) -> Result<ClientResponse> {
        self.request("GET", url, &[], None).await
    }

    pub async fn get_with_headers(
        &self,
        url: &Url,
        headers: &[(&str, &str)],
    ) -> Result<ClientResponse> {
        self.request("GET", url, headers, None).await
    }

    /// POST an `application/x-www-form-urlencoded` body.
    pub async fn post_form(&self, url: &Url, params: &[(&str, &str)]) -> Result<ClientResponse> {
        let body: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        self.request(
            "POST",
            url,
            &[("Content-Type", "application/x-www-form-urlencoded")],
            Some(body.into_bytes()),
        )
        .await
    }

    async fn request(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<ClientResponse> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::Upstream(format!("URL has no host: {url}")))?
            .to_string();
        let secure = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(Error::Upstream(format!("unsupported scheme '{other}'"))),
        };
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        let addr = self.resolve_host(&host).await?;
        debug!("connecting to {host} at {addr}:{port}");

        let tcp = TcpStream::connect(SocketAddr::new(addr, port))
            .await
            .map_err(|e| Error::Upstream(format!("connect to {host}: {e}")))?;

        let mut stream: Box<dyn ClientStream> = if secure {
            match &self.tls {
                Some(tls) => tls.connect(&host, tcp).await?,
                None => {
                    return Err(Error::Upstream(format!(
                        "https requested for {host} but no TLS connector is configured"
                    )))
                }
            }
        } else {
            Box::new(tcp)
        };

        // Request head
        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let mut head = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n");
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        if let Some(body) = &body {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if let Some(body) = body {
            out.extend_from_slice(&body);
        }
        stream
            .write_all(&out)
            .await
            .map_err(|e| Error::Upstream(format!("write to {host}: {e}")))?;

        self.read_response(&mut stream).await
    }

    async fn resolve_host(&self, host: &str) -> Result<IpAddr> {
        if host == "localhost" {
            return Ok(IpAddr::from([127, 0, 0, 1]));
        }

        let addrs = self
            .resolver
            .resolve(host, false)
            .await
            .map_err(|e| Error::Upstream(format!("resolving {host}: {e}")))?;
        addrs
            .first()
            .copied()
            .ok_or_else(|| Error::Upstream(format!("no addresses for {host}")))
    }

    async fn read_response<S: AsyncRead + Send + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<ClientResponse> {
        let mut input = BytesMut::new();
        let status_line = crate::conn::read_line(stream, &mut input, 1 << 14).await?;

        // HTTP/1.x CODE PHRASE
        let mut parts = status_line.splitn(3, ' ');
        let (_version, code) = match (parts.next(), parts.next()) {
            (Some(v), Some(c)) if v.starts_with("HTTP/1.") => (v, c),
            _ => return Err(Error::Upstream(format!("invalid status line '{status_line}'"))),
        };
        let status: u16 = code
            .parse()
            .map_err(|_| Error::Upstream(format!("invalid status code '{code}'")))?;

        // Header block
        let mut block = String::new();
        loop {
            let line = crate::conn::read_line(stream, &mut input, 1 << 14).await?;
            if line.is_empty() {
                break;
            }
            block.push_str(&line);
            block.push_str("\r\n");
        }
        let headers = Headers::parse(&block)?;

        // Body
        let chunked = headers
            .get("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);

        let body = if chunked {
            read_chunked_body(stream, &mut input, 0).await?.to_vec()
        } else if let Some(length) = headers.get("Content-Length") {
            let length: usize = length
                .trim()
                .parse()
                .map_err(|_| Error::Upstream("invalid Content-Length".into()))?;
            read_exact_body(stream, &mut input, length).await?.to_vec()
        } else {
            // Read to EOF (we always send Connection: close)
            let mut body = input.to_vec();
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(stream, &mut buf)
                .await
                .map_err(|e| Error::Upstream(format!("reading body: {e}")))?;
            body.extend_from_slice(&buf);
            body
        };

        Ok(ClientResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specgate_dns::ResolverConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            // Read until end of request head
            let mut seen = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        addr
    }

    fn client() -> HttpClient {
        HttpClient::new(Arc::new(Resolver::new(ResolverConfig::default())))
    }

    #[tokio::test]
    async fn get_with_content_length() {
        let addr = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let url = Url::parse(&format!("http://{addr}/x")).unwrap();

        let response = client().get(&url).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn get_with_chunked_body() {
        let addr = serve_once(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
        )
        .await;
        let url = Url::parse(&format!("http://{addr}/x")).unwrap();

        let response = client().get(&url).await.unwrap();
        assert_eq!(response.body, b"abcde");
    }

    #[tokio::test]
    async fn https_without_connector_fails() {
        let url = Url::parse("https://localhost/x").unwrap();
        let err = client().get(&url).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn json_body_decoding() {
        let addr = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 9\r\n\r\n{\"ok\":true}",
        )
        .await;
        let url = Url::parse(&format!("http://{addr}/x")).unwrap();
        let response = client().get(&url).await.unwrap();
        // Content-Length is wrong on purpose: the read honors the header
        assert_eq!(response.body.len(), 9);
        assert!(response.json().is_err());
    }
}
