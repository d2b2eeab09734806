//! Per-request state: inbound message, routing args, session, and the
//! response being assembled.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{Map, Value};

use specgate_core::{Error, Result};

use crate::conn::ConnWriter;
use crate::cookie::{parse_cookie_header, Cookie};
use crate::headers::{content_type_for_extension, Headers};
use crate::method::Method;
use crate::session::Session;
use crate::status::{bodiless_status, reason_phrase};
use crate::uri::Uri;
use crate::websocket::{self, WsMessageHandler};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Where the response stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// No response yet.
    Pending,
    /// A buffered response is ready to write.
    Replied,
    /// A chunked response is being streamed.
    Streaming,
    /// The response is fully on the wire.
    Done,
    /// The connection was upgraded to a WebSocket.
    Upgraded,
}

/// One HTTP request/response exchange.
pub struct Request {
    conn_id: u64,
    peer: SocketAddr,
    secure: bool,
    method: Method,
    uri: Uri,
    version_minor: u8,
    in_headers: Headers,
    body: Bytes,
    json_message: Option<Option<Value>>,
    args: Map<String, Value>,
    session: Option<Session>,

    status: u16,
    status_line: Option<String>,
    out_headers: Headers,
    out_body: Vec<u8>,
    state: ResponseState,
    writer: ConnWriter,
    ws_handler: Option<Arc<dyn WsMessageHandler>>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn_id: u64,
        peer: SocketAddr,
        secure: bool,
        method: Method,
        uri: Uri,
        version_minor: u8,
        in_headers: Headers,
        body: Bytes,
        writer: ConnWriter,
    ) -> Request {
        Request {
            conn_id,
            peer,
            secure,
            method,
            uri,
            version_minor,
            in_headers,
            body,
            json_message: None,
            args: Map::new(),
            session: None,
            status: 0,
            status_line: None,
            out_headers: Headers::new(),
            out_body: Vec::new(),
            state: ResponseState::Pending,
            writer,
            ws_handler: None,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version_minor(&self) -> u8 {
        self.version_minor
    }

    pub fn headers(&self) -> &Headers {
        &self.in_headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn out_headers(&self) -> &Headers {
        &self.out_headers
    }

    pub fn out_headers_mut(&mut self) -> &mut Headers {
        &mut self.out_headers
    }

    pub fn out_body(&self) -> &[u8] {
        &self.out_body
    }

    pub(crate) fn writer(&self) -> ConnWriter {
        self.writer.clone()
    }

    // ------------------------------------------------------------------
    // Arguments

    /// Routing and validation arguments, in insertion order.
    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Insert an argument unless one with that name already exists.
    pub fn insert_arg(&mut self, name: &str, value: Value) {
        if !self.args.contains_key(name) {
            self.args.insert(name.to_string(), value);
        }
    }

    /// Force-set an argument.
    pub fn set_arg(&mut self, name: &str, value: Value) {
        self.args.insert(name.to_string(), value);
    }

    /// The JSON message carried by an `application/json` body, parsed on
    /// first use.
    pub fn json_message(&mut self) -> Result<Option<&Value>> {
        if self.json_message.is_none() {
            let parsed = if self.method.may_have_body()
                && self.in_headers.is_json_content_type()
                && !self.body.is_empty()
            {
                let value = serde_json::from_slice(&self.body)
                    .map_err(|e| Error::Parse(format!("invalid JSON body: {e}")))?;
                Some(value)
            } else {
                None
            };
            self.json_message = Some(parsed);
        }

        Ok(self.json_message.as_ref().unwrap().as_ref())
    }

    // ------------------------------------------------------------------
    // Session and identity

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn clear_session(&mut self) {
        self.session = None;
    }

    /// The authenticated user, if the session carries one.
    pub fn user(&self) -> Option<String> {
        self.session.as_ref().and_then(|s| s.user())
    }

    // ------------------------------------------------------------------
    // Cookies

    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.in_headers.get("Cookie")?;
        parse_cookie_header(header)
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn set_cookie(&mut self, cookie: &Cookie) {
        self.out_headers.insert("Set-Cookie", cookie.to_header_value());
    }

    // ------------------------------------------------------------------
    // Responses

    pub fn reply(&mut self, code: u16) {
        self.reply_bytes(code, Vec::new());
    }

    pub fn reply_text(&mut self, code: u16, body: impl Into<String>) {
        if !self.out_headers.has_content_type() {
            self.out_headers.set("Content-Type", "text/plain");
        }
        self.reply_bytes(code, body.into().into_bytes());
    }

    pub fn reply_json(&mut self, code: u16, value: &Value) {
        self.out_headers.set("Content-Type", "application/json");
        self.reply_bytes(code, serde_json::to_vec(value).unwrap_or_default());
    }

    pub fn reply_bytes(&mut self, code: u16, body: Vec<u8>) {
        if self.state != ResponseState::Pending {
            return;
        }
        self.status = code;
        self.out_body = body;
        self.state = ResponseState::Replied;
    }

    /// Override the full status line, e.g. for nonstandard phrases.
    pub fn set_status_line(&mut self, line: impl Into<String>) {
        self.status_line = Some(line.into());
    }

    pub(crate) fn set_status(&mut self, code: u16) {
        self.status = code;
    }

    /// Whether error bodies should be JSON for this request.
    pub fn wants_json_errors(&self) -> bool {
        self.in_headers.is_json_content_type()
            || (!self.in_headers.has_content_type()
                && matches!(&self.json_message, Some(Some(_))))
    }

    /// Write an error response in the request's preferred format.
    pub fn send_error(&mut self, code: u16, message: Option<&str>) {
        if self.state != ResponseState::Pending {
            return;
        }

        if self.wants_json_errors() {
            let mut body = Map::new();
            body.insert("code".into(), Value::from(code));
            body.insert("error".into(), Value::from(reason_phrase(code)));
            if let Some(message) = message {
                body.insert("message".into(), Value::from(message));
            }
            self.reply_json(code, &Value::Object(body));
        } else {
            let text = match message {
                Some(message) => format!("{code} {message}"),
                None => format!("{code} {}", reason_phrase(code)),
            };
            self.out_headers.set("Connection", "close");
            self.reply_text(code, text);
        }
    }

    pub fn redirect(&mut self, location: &str, code: u16) {
        self.out_headers.set("Location", location);
        self.reply(if code == 0 { 302 } else { code });
    }

    /// Cache-control helper: `max-age=N` with a matching `Expires`, or
    /// no-cache when `secs` is zero.
    pub fn set_cache_period(&mut self, secs: i64) {
        let now = Utc::now();
        if 0 < secs {
            self.out_headers.set("Cache-Control", format!("max-age={secs}"));
            let expires = now + chrono::Duration::seconds(secs);
            self.out_headers.set("Expires", expires.format(HTTP_DATE).to_string());
        } else {
            self.out_headers.set("Cache-Control", "max-age=0, no-cache, no-store");
            self.out_headers.set("Expires", now.format(HTTP_DATE).to_string());
        }
    }

    // ------------------------------------------------------------------
    // Chunked responses

    /// Start a chunked response: writes the header block immediately.
    pub async fn start_chunked(&mut self, code: u16) -> Result<()> {
        if self.state != ResponseState::Pending {
            return Err(Error::Internal(anyhow::anyhow!("response already started")));
        }
        if !self.must_have_body(code) {
            return Err(Error::Internal(anyhow::anyhow!(
                "cannot send a chunked body for {} {code}",
                self.method
            )));
        }

        self.status = code;
        self.state = ResponseState::Streaming;
        let head = self.build_head(true);
        self.writer.write_all(head.as_bytes()).await
    }

    /// Send one chunk.  Empty input is ignored; use [`end_chunked`].
    ///
    /// [`end_chunked`]: Request::end_chunked
    pub async fn send_chunk(&mut self, data: &[u8]) -> Result<()> {
        if self.state != ResponseState::Streaming {
            return Err(Error::Internal(anyhow::anyhow!("chunked response not started")));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut frame = format!("{:x}\r\n", data.len()).into_bytes();
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");
        self.writer.write_all(&frame).await
    }

    /// Terminate a chunked response with the zero-length chunk.
    pub async fn end_chunked(&mut self) -> Result<()> {
        if self.state != ResponseState::Streaming {
            return Err(Error::Internal(anyhow::anyhow!("chunked response not started")));
        }
        self.writer.write_all(b"0\r\n\r\n").await?;
        self.state = ResponseState::Done;
        Ok(())
    }

    // ------------------------------------------------------------------
    // WebSocket upgrade

    /// Validate the RFC 6455 handshake and hand the connection to
    /// `handler` once the dispatcher returns.
    pub fn upgrade_websocket(&mut self, handler: Arc<dyn WsMessageHandler>) -> Result<()> {
        websocket::check_upgrade(self)?;
        self.ws_handler = Some(handler);
        self.state = ResponseState::Upgraded;
        Ok(())
    }

    pub(crate) fn take_ws_handler(&mut self) -> Option<Arc<dyn WsMessageHandler>> {
        self.ws_handler.take()
    }

    // ------------------------------------------------------------------
    // Response assembly

    /// Persistent iff HTTP/1.1 and neither side asked to close.
    pub fn is_persistent(&self) -> bool {
        1 <= self.version_minor
            && !self.in_headers.needs_close()
            && !self.out_headers.needs_close()
            && self.state != ResponseState::Upgraded
    }

    fn must_have_body(&self, code: u16) -> bool {
        !matches!(self.method, Method::Head | Method::Connect | Method::Options)
            && !bodiless_status(code)
    }

    /// Whether the final response carries the buffered body bytes.
    pub(crate) fn response_has_body(&self) -> bool {
        self.must_have_body(self.status) && !self.out_body.is_empty()
    }

    /// Build the status line and header block.
    pub(crate) fn build_head(&mut self, chunked: bool) -> String {
        let code = if self.status == 0 { 200 } else { self.status };

        if self.version_minor == 1 && !self.out_headers.contains("Date") {
            self.out_headers.set("Date", Utc::now().format(HTTP_DATE).to_string());
        }

        if chunked {
            self.out_headers.set("Transfer-Encoding", "chunked");
            self.out_headers.remove("Content-Length");
        } else if self.must_have_body(code) && !self.out_headers.contains("Content-Length") {
            self.out_headers.set("Content-Length", self.out_body.len().to_string());
        }

        if !self.out_body.is_empty() && !self.out_headers.has_content_type() {
            if let Some(ct) = self.uri.extension().and_then(content_type_for_extension) {
                self.out_headers.set("Content-Type", ct);
            }
        }

        if !self.is_persistent()
            && self.state != ResponseState::Upgraded
            && !self.out_headers.needs_close()
        {
            self.out_headers.set("Connection", "close");
        }

        let status_line = match &self.status_line {
            Some(line) => line.clone(),
            None => format!("HTTP/1.{} {code} {}", self.version_minor, reason_phrase(code)),
        };

        format!("{status_line}\r\n{}\r\n", self.out_headers)
    }

    pub(crate) fn mark_done(&mut self) {
        self.state = ResponseState::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request(method: Method, uri: &str, headers: &str, body: &[u8]) -> Request {
        Request::new(
            1,
            "127.0.0.1:1000".parse().unwrap(),
            false,
            method,
            Uri::parse(uri).unwrap(),
            1,
            Headers::parse(headers).unwrap(),
            Bytes::copy_from_slice(body),
            ConnWriter::new(Box::new(tokio::io::sink())),
        )
    }

    #[test]
    fn reply_sets_state_once() {
        let mut req = test_request(Method::Get, "/ping", "", b"");
        req.reply(200);
        assert_eq!(req.state(), ResponseState::Replied);
        req.reply(500);
        assert_eq!(req.status(), 200);
    }

    #[test]
    fn head_includes_content_length_and_date() {
        let mut req = test_request(Method::Get, "/ping", "", b"");
        req.reply_text(200, "pong");
        let head = req.build_head(false);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 4\r\n"));
        assert!(head.contains("Date: "));
    }

    #[test]
    fn bodiless_statuses_have_no_content_length() {
        let mut req = test_request(Method::Get, "/x", "", b"");
        req.reply(204);
        let head = req.build_head(false);
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn content_type_guessed_from_extension() {
        let mut req = test_request(Method::Get, "/report.json", "", b"");
        req.reply_bytes(200, b"{}".to_vec());
        let head = req.build_head(false);
        assert!(head.contains("Content-Type: application/json\r\n"));
    }

    #[test]
    fn json_errors_for_json_requests() {
        let mut req = test_request(
            Method::Post,
            "/x",
            "Content-Type: application/json\r\n",
            b"{}",
        );
        req.send_error(404, Some("user not found"));
        let body: Value = serde_json::from_slice(req.out_body()).unwrap();
        assert_eq!(body["code"], 404);
        assert_eq!(body["error"], "Not Found");
        assert_eq!(body["message"], "user not found");
    }

    #[test]
    fn text_errors_otherwise() {
        let mut req = test_request(Method::Get, "/x", "", b"");
        req.send_error(404, None);
        assert_eq!(std::str::from_utf8(req.out_body()).unwrap(), "404 Not Found");
        assert!(req.out_headers().needs_close());
    }

    #[test]
    fn persistence_rules() {
        let req = test_request(Method::Get, "/x", "", b"");
        assert!(req.is_persistent());

        let req = test_request(Method::Get, "/x", "Connection: close\r\n", b"");
        assert!(!req.is_persistent());

        let mut req = test_request(Method::Get, "/x", "", b"");
        req.out_headers_mut().set("Connection", "close");
        assert!(!req.is_persistent());
    }

    #[test]
    fn json_message_lazy_parse() {
        let mut req = test_request(
            Method::Post,
            "/x",
            "Content-Type: application/json\r\n",
            br#"{"provider":"none"}"#,
        );
        let msg = req.json_message().unwrap().cloned().unwrap();
        assert_eq!(msg["provider"], "none");

        // GET bodies are not parsed
        let mut req = test_request(Method::Get, "/x", "Content-Type: application/json\r\n", b"{}");
        assert!(req.json_message().unwrap().is_none());
    }

    #[test]
    fn first_arg_insertion_wins() {
        let mut req = test_request(Method::Get, "/x", "", b"");
        req.insert_arg("id", Value::from("1"));
        req.insert_arg("id", Value::from("2"));
        assert_eq!(req.arg("id"), Some(&Value::from("1")));
    }

    #[test]
    fn cookies_parsed_from_request() {
        let req = test_request(Method::Get, "/x", "Cookie: sid=abc; theme=dark\r\n", b"");
        assert_eq!(req.cookie("sid"), Some("abc".to_string()));
        assert_eq!(req.cookie("theme"), Some("dark".to_string()));
        assert_eq!(req.cookie("missing"), None);
    }

    #[test]
    fn redirect_sets_location() {
        let mut req = test_request(Method::Get, "/old", "", b"");
        req.redirect("/new", 0);
        assert_eq!(req.status(), 302);
        assert_eq!(req.out_headers().get("Location"), Some("/new"));
    }
}
