//! A single upstream nameserver: one UDP socket, an inflight query map,
//! per-query timeouts and a failure counter.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::DnsError;
use crate::resolver::{Answer, Outcome, ResolverCore};
use crate::wire::{self, RecordType};

struct InflightQuery {
    qtype: RecordType,
    /// Case-randomized name as transmitted.
    sent_name: String,
    /// Lowercase name, the resolver cache key.
    name: String,
}

pub(crate) struct Nameserver {
    addr: SocketAddr,
    system: bool,
    socket: UdpSocket,
    active: DashMap<u16, InflightQuery>,
    failures: AtomicU32,
    resolver: Weak<ResolverCore>,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Nameserver {
    pub async fn start(
        addr: SocketAddr,
        system: bool,
        resolver: Weak<ResolverCore>,
    ) -> Result<Arc<Nameserver>, DnsError> {
        let bind: SocketAddr = if addr.is_ipv6() { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| DnsError::Parse(format!("bind failed: {e}")))?;

        let server = Arc::new(Nameserver {
            addr,
            system,
            socket,
            active: DashMap::new(),
            failures: AtomicU32::new(0),
            resolver,
            recv_task: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(Nameserver::recv_loop(Arc::clone(&server)));
        *server.recv_task.lock() = Some(task);

        debug!("added nameserver {}", server.addr);
        Ok(server)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Send one query.  Returns false when the server did not accept it,
    /// which counts toward the inflight total, not a response.
    pub async fn transmit(
        self: &Arc<Self>,
        qtype: RecordType,
        name: &str,
        max_active: usize,
        query_timeout: std::time::Duration,
    ) -> bool {
        if max_active <= self.active.len() {
            return false;
        }

        // Unused random id
        let id = loop {
            let id: u16 = rand::thread_rng().gen();
            if !self.active.contains_key(&id) {
                break id;
            }
        };

        let sent_name = wire::randomize_case(name, &mut rand::thread_rng());
        let packet = match wire::encode_query(id, qtype, &sent_name) {
            Ok(p) => p,
            Err(e) => {
                warn!("invalid DNS query for '{name}': {e}");
                return false;
            }
        };

        match self.socket.send_to(&packet, self.addr).await {
            Ok(n) if n == packet.len() => {}
            Ok(_) | Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        self.active.insert(
            id,
            InflightQuery { qtype, sent_name, name: name.to_string() },
        );

        // Per-query timeout; a response that already arrived wins.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(query_timeout).await;
            let Some(server) = weak.upgrade() else { return };
            if let Some((_, query)) = server.active.remove(&id) {
                trace!("query {id} to {} timed out", server.addr);
                server.failures.fetch_add(1, Ordering::Relaxed);
                server.respond(query.qtype, &query.name, Err(DnsError::Timeout), 0);
            }
        });

        true
    }

    /// Stop the receive loop and fail all inflight queries.
    pub fn stop(&self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }

        let ids: Vec<u16> = self.active.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, query)) = self.active.remove(&id) {
                self.respond(query.qtype, &query.name, Err(DnsError::Shutdown), 0);
            }
        }
    }

    fn respond(&self, qtype: RecordType, name: &str, outcome: Outcome, ttl: u32) {
        if let Some(resolver) = self.resolver.upgrade() {
            resolver.response(qtype, name, outcome, ttl);
        }
    }

    async fn recv_loop(server: Arc<Nameserver>) {
        let mut buf = [0u8; 1500];

        loop {
            let (len, peer) = match server.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("nameserver {} read error: {e}", server.addr);
                    continue;
                }
            };

            if let Err(e) = server.handle_packet(&buf[..len], peer) {
                debug!("dropped packet from {peer}: {e}");
            }
        }
    }

    fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> Result<(), DnsError> {
        if packet.len() < 2 {
            return Err(DnsError::Parse("short packet".into()));
        }
        let id = u16::from_be_bytes([packet[0], packet[1]]);

        let query = self
            .active
            .get(&id)
            .ok_or_else(|| DnsError::Parse(format!("unknown query id {id}")))?;
        let qtype = query.qtype;
        let expected = query.sent_name.clone();
        let name = query.name.clone();
        drop(query);

        let response = wire::decode_response(packet, qtype, peer, self.addr)?;

        // Case-sensitive compare against the randomized transmitted name
        if response.question != expected {
            return Err(DnsError::Parse(format!(
                "response question '{}' does not match request",
                response.question
            )));
        }

        self.active.remove(&id);

        let outcome = match DnsError::from_rcode(response.rcode) {
            None => {
                self.failures.store(0, Ordering::Relaxed);
                Ok(Answer::from_records(response.records))
            }
            Some(err) => {
                if err.is_server_failure() {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        };

        self.respond(qtype, &name, outcome, response.ttl);
        Ok(())
    }
}
