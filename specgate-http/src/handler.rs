//! Composable request handlers.
//!
//! A handler inspects a request and either handles it (returns `true`)
//! or defers to the next handler in its group.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::trace;

use specgate_core::{Error, Result};

use crate::headers::content_type_for_extension;
use crate::method::Method;
use crate::pattern::UrlPattern;
use crate::request::Request;

/// A unit of request dispatch.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Inspect `req`; return `true` when the request was handled.
    async fn handle(&self, req: &mut Request) -> Result<bool>;
}

pub type HandlerRc = Arc<dyn RequestHandler>;

/// Dispatches to children in order until one handles the request.
#[derive(Default)]
pub struct HandlerGroup {
    children: Vec<HandlerRc>,
}

impl HandlerGroup {
    pub fn new() -> HandlerGroup {
        HandlerGroup::default()
    }

    pub fn add(&mut self, handler: HandlerRc) {
        self.children.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl RequestHandler for HandlerGroup {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        for child in &self.children {
            if child.handle(req).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Delegates only when the request method is in the mask.
pub struct MethodMatcher {
    mask: u32,
    child: HandlerRc,
}

impl MethodMatcher {
    pub fn new(mask: u32, child: HandlerRc) -> MethodMatcher {
        MethodMatcher { mask, child }
    }
}

#[async_trait]
impl RequestHandler for MethodMatcher {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        if self.mask & req.method().mask() == 0 {
            return Ok(false);
        }
        self.child.handle(req).await
    }
}

/// Matches the URL pattern and captures named groups into the request
/// arguments before delegating.
pub struct PatternMatcher {
    pattern: UrlPattern,
    child: HandlerRc,
}

impl PatternMatcher {
    pub fn new(pattern: UrlPattern, child: HandlerRc) -> PatternMatcher {
        PatternMatcher { pattern, child }
    }

    pub fn compile(pattern: &str, prefix: bool, child: HandlerRc) -> Result<PatternMatcher> {
        Ok(PatternMatcher { pattern: UrlPattern::compile(pattern, prefix)?, child })
    }
}

#[async_trait]
impl RequestHandler for PatternMatcher {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let Some(captures) = self.pattern.matches(req.uri().path()) else {
            trace!("{} did not match {}", req.uri().path(), self.pattern.pattern());
            return Ok(false);
        };

        trace!("{} matched {}", req.uri().path(), self.pattern.pattern());
        for (name, value) in captures {
            req.insert_arg(&name, Value::from(value));
        }

        self.child.handle(req).await
    }
}

/// Reports handled without writing anything.
pub struct PassHandler;

#[async_trait]
impl RequestHandler for PassHandler {
    async fn handle(&self, _req: &mut Request) -> Result<bool> {
        Ok(true)
    }
}

/// Replies with a fixed status code.
pub struct StatusHandler {
    code: u16,
}

impl StatusHandler {
    pub fn new(code: u16) -> StatusHandler {
        StatusHandler { code }
    }
}

#[async_trait]
impl RequestHandler for StatusHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        req.reply(self.code);
        Ok(true)
    }
}

/// Replies with a redirect.
pub struct RedirectHandler {
    location: String,
    code: u16,
}

impl RedirectHandler {
    pub fn new(location: impl Into<String>, code: u16) -> RedirectHandler {
        RedirectHandler { location: location.into(), code }
    }
}

#[async_trait]
impl RequestHandler for RedirectHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        req.redirect(&self.location, self.code);
        Ok(true)
    }
}

/// Sets configured response headers, then defers.
pub struct HeadersHandler {
    headers: Vec<(String, String)>,
}

impl HeadersHandler {
    pub fn new(headers: Vec<(String, String)>) -> HeadersHandler {
        HeadersHandler { headers }
    }
}

#[async_trait]
impl RequestHandler for HeadersHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        for (name, value) in &self.headers {
            req.out_headers_mut().set(name, value.clone());
        }
        Ok(false)
    }
}

/// Cross-origin resource sharing.
///
/// Sets the `Access-Control-*` response headers and answers `OPTIONS`
/// preflights; other methods fall through to the endpoint handler.
pub struct CorsHandler {
    pub origins: Vec<String>,
    pub methods: String,
    pub headers: String,
    pub max_age: Option<u64>,
    pub credentials: bool,
}

impl Default for CorsHandler {
    fn default() -> Self {
        CorsHandler {
            origins: vec!["*".to_string()],
            methods: "GET, POST, PUT, DELETE, PATCH, OPTIONS".to_string(),
            headers: "Content-Type, Authorization".to_string(),
            max_age: Some(86400),
            credentials: false,
        }
    }
}

impl CorsHandler {
    fn origin_allowed(&self, origin: &str) -> bool {
        self.origins.iter().any(|o| o == "*" || o == origin)
    }
}

#[async_trait]
impl RequestHandler for CorsHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let origin = req.headers().get("Origin").map(str::to_string);

        if let Some(origin) = origin {
            if self.origin_allowed(&origin) {
                let reflected =
                    if self.origins.iter().any(|o| o == "*") && !self.credentials {
                        "*".to_string()
                    } else {
                        origin
                    };
                req.out_headers_mut().set("Access-Control-Allow-Origin", reflected);
                if self.credentials {
                    req.out_headers_mut().set("Access-Control-Allow-Credentials", "true");
                }
            }
        }

        if req.method() == Method::Options {
            req.out_headers_mut().set("Access-Control-Allow-Methods", self.methods.clone());
            req.out_headers_mut().set("Access-Control-Allow-Headers", self.headers.clone());
            if let Some(max_age) = self.max_age {
                req.out_headers_mut().set("Access-Control-Max-Age", max_age.to_string());
            }
            req.reply(204);
            return Ok(true);
        }

        Ok(false)
    }
}

/// Serves a file or directory subtree from the filesystem.
pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>) -> FileHandler {
        FileHandler { root: root.into() }
    }
}

#[async_trait]
impl RequestHandler for FileHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let path = if self.root.is_dir() {
            // The `path` arg holds the captured remainder when routed
            // through a `{x:path}` pattern; fall back to the URI path.
            let rest = match req.arg("path").and_then(|v| v.as_str()) {
                Some(rest) => rest.to_string(),
                None => req.uri().path().trim_start_matches('/').to_string(),
            };

            if rest.split('/').any(|seg| seg == "..") {
                return Err(Error::AccessDenied);
            }
            self.root.join(rest)
        } else {
            self.root.clone()
        };

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Key(format!("'{}' not found", path.display())))
            }
            Err(e) => {
                return Err(Error::Internal(anyhow::anyhow!(
                    "reading '{}': {e}",
                    path.display()
                )))
            }
        };

        if let Some(ct) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(content_type_for_extension)
        {
            req.out_headers_mut().set("Content-Type", ct);
        }
        req.reply_bytes(200, data);
        Ok(true)
    }
}

/// Adapter for arbitrary request callbacks.
pub struct CallbackHandler {
    callback: Box<dyn for<'a> Fn(&'a mut Request) -> BoxFuture<'a, Result<bool>> + Send + Sync>,
}

impl CallbackHandler {
    pub fn new(
        callback: impl for<'a> Fn(&'a mut Request) -> BoxFuture<'a, Result<bool>>
            + Send
            + Sync
            + 'static,
    ) -> CallbackHandler {
        CallbackHandler { callback: Box::new(callback) }
    }
}

#[async_trait]
impl RequestHandler for CallbackHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        (self.callback)(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnWriter;
    use crate::headers::Headers;
    use crate::uri::Uri;
    use bytes::Bytes;

    fn get(path: &str) -> Request {
        request(Method::Get, path, "")
    }

    fn request(method: Method, path: &str, headers: &str) -> Request {
        Request::new(
            1,
            "127.0.0.1:1000".parse().unwrap(),
            false,
            method,
            Uri::parse(path).unwrap(),
            1,
            Headers::parse(headers).unwrap(),
            Bytes::new(),
            ConnWriter::new(Box::new(tokio::io::sink())),
        )
    }

    #[tokio::test]
    async fn group_dispatches_in_order() {
        let mut group = HandlerGroup::new();
        group.add(Arc::new(MethodMatcher::new(
            Method::Post.mask(),
            Arc::new(StatusHandler::new(201)),
        )));
        group.add(Arc::new(StatusHandler::new(200)));

        let mut req = get("/x");
        assert!(group.handle(&mut req).await.unwrap());
        assert_eq!(req.status(), 200);

        let mut req = request(Method::Post, "/x", "");
        assert!(group.handle(&mut req).await.unwrap());
        assert_eq!(req.status(), 201);
    }

    #[tokio::test]
    async fn pattern_matcher_captures_args() {
        let matcher = PatternMatcher::compile(
            "/users/{id:uint}",
            false,
            Arc::new(StatusHandler::new(200)),
        )
        .unwrap();

        let mut req = get("/users/42");
        assert!(matcher.handle(&mut req).await.unwrap());
        assert_eq!(req.arg("id"), Some(&Value::from("42")));

        let mut req = get("/users/ann");
        assert!(!matcher.handle(&mut req).await.unwrap());
    }

    #[tokio::test]
    async fn cors_preflight() {
        let cors = CorsHandler::default();

        let mut req = request(Method::Options, "/x", "Origin: https://app.example\r\n");
        assert!(cors.handle(&mut req).await.unwrap());
        assert_eq!(req.status(), 204);
        assert_eq!(req.out_headers().get("Access-Control-Allow-Origin"), Some("*"));
        assert!(req.out_headers().contains("Access-Control-Allow-Methods"));

        let mut req = request(Method::Get, "/x", "Origin: https://app.example\r\n");
        assert!(!cors.handle(&mut req).await.unwrap());
        assert_eq!(req.out_headers().get("Access-Control-Allow-Origin"), Some("*"));
    }

    #[tokio::test]
    async fn headers_handler_defers() {
        let handler = HeadersHandler::new(vec![("X-Frame-Options".into(), "DENY".into())]);
        let mut req = get("/x");
        assert!(!handler.handle(&mut req).await.unwrap());
        assert_eq!(req.out_headers().get("X-Frame-Options"), Some("DENY"));
    }

    #[tokio::test]
    async fn callback_handler() {
        let handler = CallbackHandler::new(|req| {
            Box::pin(async move {
                req.reply_text(200, "from callback");
                Ok(true)
            })
        });

        let mut req = get("/x");
        assert!(handler.handle(&mut req).await.unwrap());
        assert_eq!(req.out_body(), b"from callback");
    }

    #[tokio::test]
    async fn file_handler_traversal_guard() {
        let handler = FileHandler::new(std::env::temp_dir());
        let mut req = get("/x");
        req.set_arg("path", Value::from("../etc/passwd"));
        assert!(matches!(handler.handle(&mut req).await, Err(Error::AccessDenied)));
    }
}
