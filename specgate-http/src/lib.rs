//! Event-driven HTTP server and connection pipeline.
//!
//! Non-blocking request parsing (including chunked transfer), ordered
//! pipelined responses, a composable handler tree, sessions and cookies,
//! RFC 6455 WebSockets and a minimal outbound client. The declarative
//! API layer in `specgate-api` builds on these pieces.

pub mod client;
pub mod conn;
pub mod cookie;
pub mod handler;
pub mod headers;
pub mod method;
pub mod pattern;
pub mod request;
pub mod server;
pub mod session;
pub mod status;
pub mod uri;
pub mod websocket;

pub use client::{ClientResponse, HttpClient, TlsConnector};
pub use conn::{ConnConfig, ConnWriter};
pub use cookie::Cookie;
pub use handler::{
    CallbackHandler, CorsHandler, FileHandler, HandlerGroup, HandlerRc, HeadersHandler,
    MethodMatcher, PassHandler, PatternMatcher, RedirectHandler, RequestHandler, StatusHandler,
};
pub use headers::Headers;
pub use method::{parse_method_mask, Method};
pub use pattern::UrlPattern;
pub use request::{Request, ResponseState};
pub use server::{ListenAddr, Server, ServerConfig, TlsAcceptor};
pub use session::{Session, SessionConfig, SessionManager};
pub use uri::Uri;
pub use websocket::{WsMessageHandler, WsSender};
