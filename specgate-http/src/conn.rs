//! One HTTP connection: header and body reading with caps, pipelined
//! request processing, response writing and the persistence decision.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tracing::{debug, trace, warn};

use specgate_core::{Error, Result};

use crate::headers::Headers;
use crate::method::Method;
use crate::request::{Request, ResponseState};
use crate::server::ServerInner;
use crate::status::reason_phrase;
use crate::uri::Uri;
use crate::websocket;

/// Shared handle to the write half of a connection.
///
/// Handlers stream chunked bodies and WebSocket frames through this while
/// the connection task owns the read half.
#[derive(Clone)]
pub struct ConnWriter {
    inner: Arc<tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>,
}

impl ConnWriter {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>) -> ConnWriter {
        ConnWriter { inner: Arc::new(tokio::sync::Mutex::new(Some(writer))) }
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("connection closed")))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("connection write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("connection flush failed: {e}")))
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Connection resource limits.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub max_header_size: usize,
    pub max_body_size: usize,
    /// Hard deadline for one request's dispatch, `None` for unlimited.
    pub request_timeout: Option<std::time::Duration>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            max_header_size: 1 << 14,
            max_body_size: 1 << 22,
            request_timeout: None,
        }
    }
}

enum ReadOutcome {
    Request(Box<Request>),
    /// Connection closed cleanly between requests.
    Eof,
    /// Fatal protocol error: status and message were already sent.
    Failed,
}

pub(crate) struct Conn<S> {
    id: u64,
    peer: SocketAddr,
    secure: bool,
    reader: ReadHalf<S>,
    writer: ConnWriter,
    input: BytesMut,
    server: Arc<ServerInner>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> Conn<S> {
    pub fn new(id: u64, peer: SocketAddr, secure: bool, stream: S, server: Arc<ServerInner>) -> Conn<S> {
        let (reader, writer) = tokio::io::split(stream);
        Conn {
            id,
            peer,
            secure,
            reader,
            writer: ConnWriter::new(Box::new(writer)),
            input: BytesMut::with_capacity(4096),
            server,
        }
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self) {
        loop {
            let request = match self.read_request().await {
                Ok(ReadOutcome::Request(request)) => request,
                Ok(ReadOutcome::Eof) | Ok(ReadOutcome::Failed) => break,
                Err(e) => {
                    debug!("connection {} read error: {e}", self.id);
                    break;
                }
            };

            let mut request = *request;
            trace!("conn {}: {} {}", self.id, request.method(), request.uri());

            let dispatched = match self.server.config.conn.request_timeout {
                Some(ttl) => {
                    match tokio::time::timeout(ttl, self.server.dispatch(&mut request)).await {
                        Ok(()) => true,
                        Err(_) => false,
                    }
                }
                None => {
                    self.server.dispatch(&mut request).await;
                    true
                }
            };

            if !dispatched {
                // Request exceeded its deadline: 504 and drop the connection
                warn!("conn {}: request exceeded deadline", self.id);
                if matches!(request.state(), ResponseState::Pending) {
                    request.out_headers_mut().set("Connection", "close");
                    request.send_error(504, None);
                    let _ = self.write_response(&mut request).await;
                }
                break;
            }

            match request.state() {
                ResponseState::Upgraded => {
                    self.run_websocket(request).await;
                    return;
                }
                ResponseState::Streaming => {
                    // Chunked reply that was never terminated
                    warn!("conn {}: handler left a chunked response open", self.id);
                    break;
                }
                ResponseState::Done => {
                    if !request.is_persistent() {
                        break;
                    }
                }
                ResponseState::Replied | ResponseState::Pending => {
                    if self.write_response(&mut request).await.is_err() {
                        break;
                    }
                    if !request.is_persistent() {
                        break;
                    }
                }
            }
        }

        self.writer.shutdown().await;
        self.server.conn_closed();
        debug!("conn {} closed", self.id);
    }

    async fn run_websocket(self, request: Request) {
        let Conn { id, reader, writer, input, server, .. } = self;
        websocket::drive(id, reader, input, writer, request).await;
        server.conn_closed();
    }

    /// Read one request: header block, request line, headers and body.
    async fn read_request(&mut self) -> Result<ReadOutcome> {
        let max_header = self.server.config.conn.max_header_size;

        // Read until the end of the header block or the size cap
        let header_end = loop {
            if let Some(pos) = find_crlf_crlf(&self.input) {
                if max_header < pos + 4 {
                    return self.fail(400, "Header too large").await;
                }
                break pos;
            }

            if max_header <= self.input.len() {
                return self.fail(400, "Header too large").await;
            }

            let n = self
                .reader
                .read_buf(&mut self.input)
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("read failed: {e}")))?;

            if n == 0 {
                if self.input.is_empty() {
                    return Ok(ReadOutcome::Eof);
                }
                return self.fail(400, "Incomplete request").await;
            }
        };

        let head = self.input.split_to(header_end + 4);
        let head = match std::str::from_utf8(&head) {
            Ok(s) => s,
            Err(_) => return self.fail(400, "Request head is not UTF-8").await,
        };

        let (request_line, header_block) = head.split_once("\r\n").unwrap_or((head, ""));

        // METHOD PATH HTTP/V
        let mut parts = request_line.split(' ');
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(u), Some(v), None) => (m, u, v),
            _ => return self.fail(400, "Invalid request line").await,
        };

        let method = match Method::parse(method) {
            Ok(m) => m,
            Err(_) => return self.fail(400, "Invalid method").await,
        };
        let uri = match Uri::parse(uri) {
            Ok(u) => u,
            Err(_) => return self.fail(400, "Invalid URI").await,
        };
        let version_minor = match version {
            "HTTP/1.1" => 1,
            "HTTP/1.0" => 0,
            _ => return self.fail(400, "Unsupported HTTP version").await,
        };

        let headers = match Headers::parse(header_block) {
            Ok(h) => h,
            Err(e) => return self.fail(400, &e.to_string()).await,
        };

        // Body
        let mut body = Bytes::new();
        if method.may_have_body() {
            if headers.contains("Upgrade") {
                return self.fail(400, "Cannot upgrade a request with a body").await;
            }

            // 100-continue before reading the body
            if version_minor == 1 {
                if let Some(expect) = headers.get("Expect") {
                    if expect.eq_ignore_ascii_case("100-continue") {
                        let line = "HTTP/1.1 100 Continue\r\n\r\n";
                        self.writer.write_all(line.as_bytes()).await?;
                    } else {
                        return self.fail(417, "Cannot continue").await;
                    }
                }
            }

            match self.read_body(&headers).await? {
                Ok(b) => body = b,
                Err(outcome) => return Ok(outcome),
            }
        }

        let request = Request::new(
            self.id,
            self.peer,
            self.secure,
            method,
            uri,
            version_minor,
            headers,
            body,
            self.writer.clone(),
        );

        Ok(ReadOutcome::Request(Box::new(request)))
    }

    /// Read the request body per Transfer-Encoding / Content-Length.
    /// The outer error is fatal I/O; the inner `Err` is a protocol
    /// failure already answered on the wire.
    async fn read_body(&mut self, headers: &Headers) -> Result<std::result::Result<Bytes, ReadOutcome>> {
        let max_body = self.server.config.conn.max_body_size;

        let chunked = headers
            .get("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);

        if chunked {
            match read_chunked_body(&mut self.reader, &mut self.input, max_body).await {
                Ok(body) => return Ok(Ok(body)),
                Err(Error::BodyTooLarge) => {
                    return Ok(Err(self.fail(413, "Body too large").await?))
                }
                Err(e) => return Ok(Err(self.fail(400, &e.to_string()).await?)),
            }
        }

        let content_length = match headers.get("Content-Length") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) => n,
                Err(_) => return Ok(Err(self.fail(400, "Invalid Content-Length").await?)),
            },
            None => 0,
        };

        if content_length == 0 {
            return Ok(Ok(Bytes::new()));
        }
        if max_body < content_length {
            return Ok(Err(self.fail(413, "Body too large").await?));
        }

        match read_exact_body(&mut self.reader, &mut self.input, content_length).await {
            Ok(body) => Ok(Ok(body)),
            Err(_) => Ok(Err(self.fail(400, "Incomplete request body").await?)),
        }
    }

    /// Best-effort error response, then mark the connection failed.
    async fn fail(&mut self, code: u16, message: &str) -> Result<ReadOutcome> {
        debug!("conn {}: {code} {message}", self.id);
        let body = format!("{code} {}", reason_phrase(code));
        let response = format!(
            "HTTP/1.1 {code} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            reason_phrase(code),
            body.len(),
        );
        let _ = self.writer.write_all(response.as_bytes()).await;
        Ok(ReadOutcome::Failed)
    }

    /// Write a buffered (non-chunked) response.
    async fn write_response(&mut self, request: &mut Request) -> Result<()> {
        if matches!(request.state(), ResponseState::Pending) {
            // The dispatcher guarantees a response; this is a backstop
            request.reply(500);
        }

        let head = request.build_head(false);
        let mut out = Vec::with_capacity(head.len() + request.out_body().len());
        out.extend_from_slice(head.as_bytes());
        if request.response_has_body() {
            out.extend_from_slice(request.out_body());
        }

        self.writer.write_all(&out).await?;
        request.mark_done();
        Ok(())
    }
}

/// Locate the `\r\n\r\n` header terminator.
fn find_crlf_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Read exactly `len` body bytes, using `input` first.
pub(crate) async fn read_exact_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    input: &mut BytesMut,
    len: usize,
) -> Result<Bytes> {
    while input.len() < len {
        let n = reader
            .read_buf(input)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("read failed: {e}")))?;
        if n == 0 {
            return Err(Error::Parse("incomplete body".into()));
        }
    }
    Ok(input.split_to(len).freeze())
}

/// Read one `\r\n`-terminated line.
pub(crate) async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut R,
    input: &mut BytesMut,
    max: usize,
) -> Result<String> {
    loop {
        if let Some(pos) = input.windows(2).position(|w| w == b"\r\n") {
            let line = input.split_to(pos + 2);
            let line = &line[..pos];
            return String::from_utf8(line.to_vec())
                .map_err(|_| Error::Parse("line is not UTF-8".into()));
        }

        if max < input.len() {
            return Err(Error::Parse("line too long".into()));
        }

        let n = reader
            .read_buf(input)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("read failed: {e}")))?;
        if n == 0 {
            return Err(Error::Parse("unexpected end of stream".into()));
        }
    }
}

/// Decode a chunked body: hex size lines, chunk data, trailers.
pub(crate) async fn read_chunked_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    input: &mut BytesMut,
    max_body: usize,
) -> Result<Bytes> {
    let mut body = BytesMut::new();

    loop {
        let size_line = read_line(reader, input, 1024).await?;
        let size_token = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| Error::Parse(format!("invalid chunk size '{size_token}'")))?;

        if size == 0 {
            break;
        }

        if max_body != 0 && max_body < body.len() + size {
            return Err(Error::BodyTooLarge);
        }

        let chunk = read_exact_body(reader, input, size).await?;
        body.extend_from_slice(&chunk);

        let sep = read_line(reader, input, 2).await?;
        if !sep.is_empty() {
            return Err(Error::Parse("missing chunk terminator".into()));
        }
    }

    // Trailer headers until the empty line
    loop {
        let line = read_line(reader, input, 1024).await?;
        if line.is_empty() {
            break;
        }
    }

    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunked_round_trip() {
        let chunks: &[&[u8]] = &[b"hel", b"lo\n", b"world"];
        let mut wire = Vec::new();
        for chunk in chunks {
            wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            wire.extend_from_slice(chunk);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"0\r\n\r\n");

        let mut reader = std::io::Cursor::new(wire);
        let mut input = BytesMut::new();
        let body = read_chunked_body(&mut reader, &mut input, 0).await.unwrap();
        assert_eq!(&body[..], b"hello\nworld");
    }

    #[tokio::test]
    async fn chunked_with_trailers() {
        let wire = b"3\r\nabc\r\n0\r\nX-Trailer: 1\r\n\r\n".to_vec();
        let mut reader = std::io::Cursor::new(wire);
        let mut input = BytesMut::new();
        let body = read_chunked_body(&mut reader, &mut input, 0).await.unwrap();
        assert_eq!(&body[..], b"abc");
    }

    #[tokio::test]
    async fn chunked_body_cap() {
        let wire = b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n".to_vec();
        let mut reader = std::io::Cursor::new(wire.clone());
        let mut input = BytesMut::new();
        assert!(matches!(
            read_chunked_body(&mut reader, &mut input, 9).await,
            Err(Error::BodyTooLarge)
        ));

        let mut reader = std::io::Cursor::new(wire);
        let mut input = BytesMut::new();
        let body = read_chunked_body(&mut reader, &mut input, 10).await.unwrap();
        assert_eq!(&body[..], b"helloworld");
    }

    #[tokio::test]
    async fn invalid_chunk_size_rejected() {
        let wire = b"zz\r\n".to_vec();
        let mut reader = std::io::Cursor::new(wire);
        let mut input = BytesMut::new();
        assert!(read_chunked_body(&mut reader, &mut input, 0).await.is_err());
    }

    #[test]
    fn header_terminator_search() {
        assert_eq!(find_crlf_crlf(b"GET / HTTP/1.1\r\n\r\n"), Some(14));
        assert_eq!(find_crlf_crlf(b"partial\r\n"), None);
    }
}
