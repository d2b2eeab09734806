//! The HTTP server: listeners, connection limits and the dispatch
//! error boundary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use specgate_core::{Error, Result};

use crate::client::ClientStream;
use crate::conn::{Conn, ConnConfig};
use crate::handler::HandlerRc;
use crate::request::{Request, ResponseState};
use crate::session::SessionManager;

/// Accepts inbound TLS on a listener.  Injected by deployments; the
/// gateway core carries no TLS implementation.
#[async_trait]
pub trait TlsAcceptor: Send + Sync {
    async fn accept(&self, stream: TcpStream) -> Result<Box<dyn ClientStream>>;
}

/// One listen address, optionally TLS-terminated.
#[derive(Debug, Clone)]
pub struct ListenAddr {
    pub addr: SocketAddr,
    pub tls: bool,
}

impl ListenAddr {
    pub fn plain(addr: SocketAddr) -> ListenAddr {
        ListenAddr { addr, tls: false }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: Vec<ListenAddr>,
    pub max_connections: usize,
    pub conn: ConnConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: vec![ListenAddr::plain("127.0.0.1:8080".parse().unwrap())],
            max_connections: 1024,
            conn: ConnConfig::default(),
        }
    }
}

pub(crate) struct ServerInner {
    pub config: ServerConfig,
    handlers: Mutex<Vec<HandlerRc>>,
    sessions: Option<Arc<SessionManager>>,
    tls: Option<Arc<dyn TlsAcceptor>>,
    conns: AtomicUsize,
    next_conn_id: AtomicU64,
}

/// The HTTP server.  Itself a handler group with an error boundary
/// around dispatch.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig, sessions: Option<Arc<SessionManager>>) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                config,
                handlers: Mutex::new(Vec::new()),
                sessions,
                tls: None,
                conns: AtomicUsize::new(0),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_tls_acceptor(config: ServerConfig, sessions: Option<Arc<SessionManager>>, tls: Arc<dyn TlsAcceptor>) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                config,
                handlers: Mutex::new(Vec::new()),
                sessions,
                tls: Some(tls),
                conns: AtomicUsize::new(0),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Append a handler to the dispatch chain.
    pub fn add_handler(&self, handler: HandlerRc) {
        self.inner.handlers.lock().push(handler);
    }

    pub fn session_manager(&self) -> Option<Arc<SessionManager>> {
        self.inner.sessions.clone()
    }

    /// Bind all listeners and start accepting.  Returns the bound
    /// addresses (useful with port 0).
    pub async fn listen(&self) -> Result<Vec<SocketAddr>> {
        let mut bound = Vec::new();

        for listen in &self.inner.config.listen {
            if listen.tls && self.inner.tls.is_none() {
                return Err(Error::Internal(anyhow::anyhow!(
                    "TLS listener {} without a TLS acceptor",
                    listen.addr
                )));
            }

            let listener = TcpListener::bind(listen.addr)
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("bind {}: {e}", listen.addr)))?;
            let addr = listener
                .local_addr()
                .map_err(|e| Error::Internal(anyhow::anyhow!("local addr: {e}")))?;
            info!("listening on {addr}{}", if listen.tls { " (tls)" } else { "" });
            bound.push(addr);

            let inner = Arc::clone(&self.inner);
            let tls = listen.tls;
            tokio::spawn(async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };

                    if inner.config.max_connections <= inner.conns.load(Ordering::Relaxed) {
                        debug!("connection limit reached, dropping {peer}");
                        continue;
                    }

                    inner.conns.fetch_add(1, Ordering::Relaxed);
                    let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let inner2 = Arc::clone(&inner);

                    tokio::spawn(async move {
                        if tls {
                            let acceptor = inner2.tls.clone().unwrap();
                            match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    Conn::new(id, peer, true, stream, inner2).run().await
                                }
                                Err(e) => {
                                    debug!("TLS accept from {peer} failed: {e}");
                                    inner2.conn_closed();
                                }
                            }
                        } else {
                            Conn::new(id, peer, false, stream, inner2).run().await;
                        }
                    });
                }
            });
        }

        Ok(bound)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.load(Ordering::Relaxed)
    }
}

impl ServerInner {
    /// Dispatch one request through the handler chain.
    ///
    /// Never lets a handler error escape: errors become responses here.
    pub async fn dispatch(self: &Arc<Self>, req: &mut Request) {
        // Resolve the session cookie
        if let Some(sessions) = &self.sessions {
            if req.session().is_none() {
                if let Some(sid) = req.cookie(sessions.cookie_name()) {
                    if let Ok(session) = sessions.lookup_session(&sid) {
                        req.set_session(session);
                    }
                }
            }
        }

        let handlers: Vec<HandlerRc> = self.handlers.lock().clone();

        let mut outcome = Ok(false);
        for handler in handlers {
            match handler.handle(req).await {
                Ok(false) => continue,
                result => {
                    outcome = result;
                    break;
                }
            }
        }

        match outcome {
            Ok(true) => {
                if req.state() == ResponseState::Pending {
                    req.reply(200);
                }
            }
            Ok(false) => {
                debug!("no handler for {} {}", req.method(), req.uri().path());
                req.send_error(404, None);
            }
            Err(error) => {
                let code = error.status_code();
                if 500 <= code {
                    warn!("{} {} failed: {error:?}", req.method(), req.uri().path());
                } else {
                    debug!("{} {}: {error}", req.method(), req.uri().path());
                }
                if req.state() == ResponseState::Pending {
                    req.send_error(code, Some(&error.public_message()));
                }
            }
        }

        info!(
            "{} \"{} {}\" {}",
            req.peer().ip(),
            req.method(),
            req.uri(),
            req.status()
        );
    }

    pub fn conn_closed(&self) {
        self.conns.fetch_sub(1, Ordering::Relaxed);
    }
}
