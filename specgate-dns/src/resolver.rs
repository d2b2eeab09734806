//! The resolver core: cache, pending queue and the pump scheduler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, trace, warn};

use crate::error::DnsError;
use crate::nameserver::Nameserver;
use crate::wire::{self, Record, RecordType};

/// A successful answer: addresses for A/AAAA, names for PTR.
#[derive(Debug, Clone, Default)]
pub struct Answer {
    pub addrs: Vec<IpAddr>,
    pub names: Vec<String>,
}

impl Answer {
    pub(crate) fn from_records(records: Vec<Record>) -> Answer {
        let mut answer = Answer::default();
        for record in records {
            match record {
                Record::Addr(addr) => answer.addrs.push(addr),
                Record::Name(name) => answer.names.push(name),
            }
        }
        answer
    }
}

pub(crate) type Outcome = Result<Answer, DnsError>;

type CacheKey = (RecordType, String);

#[derive(Default)]
struct Entry {
    result: Option<(Outcome, Instant)>,
    waiters: Vec<oneshot::Sender<Outcome>>,
    inflight: isize,
    attempts: u32,
    responded: bool,
}

impl Entry {
    fn is_valid(&self) -> bool {
        matches!(&self.result, Some((_, expires)) if Instant::now() < *expires)
    }
}

/// Resolver tuning knobs.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Per-query timeout before a nameserver is considered unresponsive.
    pub query_timeout: Duration,
    /// Hard deadline for a whole resolve request.
    pub request_timeout: Duration,
    /// Transmission rounds before a request fails with the last error.
    pub max_attempts: u32,
    /// Failure count after which a system nameserver is dropped.
    pub max_failures: u32,
    /// Inflight query cap per nameserver.
    pub max_active: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            query_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(16),
            max_attempts: 3,
            max_failures: 16,
            max_active: 64,
        }
    }
}

pub(crate) struct ResolverCore {
    config: ResolverConfig,
    servers: RwLock<Vec<Arc<Nameserver>>>,
    cache: Mutex<HashMap<CacheKey, Entry>>,
    /// Keys with a transmission round in progress.
    active: Mutex<HashSet<CacheKey>>,
    pending: Mutex<VecDeque<CacheKey>>,
    pump: Notify,
}

/// Asynchronous recursive DNS resolver.
pub struct Resolver {
    core: Arc<ResolverCore>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Resolver {
        let core = Arc::new(ResolverCore {
            config,
            servers: RwLock::new(Vec::new()),
            cache: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            pending: Mutex::new(VecDeque::new()),
            pump: Notify::new(),
        });

        let pump_core = Arc::clone(&core);
        tokio::spawn(async move {
            loop {
                pump_core.pump.notified().await;
                pump_core.pump_once().await;
            }
        });

        Resolver { core }
    }

    /// Add a nameserver.  `addr` is `ip` or `ip:port`, default port 53.
    /// Duplicates are ignored.
    pub async fn add_nameserver(&self, addr: &str, system: bool) -> Result<(), DnsError> {
        let addr = parse_server_addr(addr)?;
        self.core.add_nameserver(addr, system).await
    }

    pub fn nameserver_count(&self) -> usize {
        self.core.servers.read().len()
    }

    pub fn nameserver_failures(&self, addr: SocketAddr) -> Option<u32> {
        self.core
            .servers
            .read()
            .iter()
            .find(|s| s.addr() == addr)
            .map(|s| s.failures())
    }

    /// Resolve a host name to addresses.  Literal addresses of the
    /// requested family complete without network traffic.
    pub async fn resolve(&self, name: &str, ipv6: bool) -> Result<Vec<IpAddr>, DnsError> {
        if ipv6 {
            if let Ok(addr) = name.parse::<Ipv6Addr>() {
                return Ok(vec![IpAddr::V6(addr)]);
            }
        } else if let Ok(addr) = name.parse::<Ipv4Addr>() {
            return Ok(vec![IpAddr::V4(addr)]);
        }

        let qtype = if ipv6 { RecordType::Aaaa } else { RecordType::A };
        let answer = self.core.request(qtype, &name.to_ascii_lowercase()).await?;
        Ok(answer.addrs)
    }

    /// Reverse-resolve an address to names.
    pub async fn reverse(&self, addr: IpAddr) -> Result<Vec<String>, DnsError> {
        let name = wire::reverse_name(addr);
        let answer = self.core.request(RecordType::Ptr, &name).await?;
        Ok(answer.names)
    }
}

fn parse_server_addr(addr: &str) -> Result<SocketAddr, DnsError> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Ok(sock);
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(DnsError::Parse(format!("invalid nameserver address '{addr}'")))
}

impl ResolverCore {
    async fn add_nameserver(
        self: &Arc<Self>,
        addr: SocketAddr,
        system: bool,
    ) -> Result<(), DnsError> {
        if self.servers.read().iter().any(|s| s.addr() == addr) {
            return Ok(());
        }

        let server = Nameserver::start(addr, system, Arc::downgrade(self)).await?;
        self.servers.write().push(server);
        self.pump.notify_one();
        Ok(())
    }

    /// Discover nameservers when none are configured: the `SPECGATE_DNS`
    /// environment variable in debug builds, then the system resolver
    /// configuration.
    async fn init_system_nameservers(self: &Arc<Self>) {
        if cfg!(debug_assertions) {
            if let Ok(value) = std::env::var("SPECGATE_DNS") {
                for server in value.split_whitespace() {
                    match parse_server_addr(server) {
                        Ok(addr) => {
                            if let Err(e) = self.add_nameserver(addr, false).await {
                                warn!("SPECGATE_DNS server {server}: {e}");
                            }
                        }
                        Err(e) => warn!("SPECGATE_DNS server {server}: {e}"),
                    }
                }
            }
        }

        if !self.servers.read().is_empty() {
            return;
        }

        for addr in system_nameservers() {
            if let Err(e) = self.add_nameserver(addr, true).await {
                debug!("system nameserver {addr}: {e}");
            }
        }
    }

    async fn request(self: &Arc<Self>, qtype: RecordType, name: &str) -> Outcome {
        if self.servers.read().is_empty() {
            self.init_system_nameservers().await;
        }

        let key = (qtype, name.to_string());
        let rx = {
            let mut cache = self.cache.lock();
            let entry = cache.entry(key.clone()).or_default();

            if entry.is_valid() {
                trace!("DNS cache hit for {} {name}", qtype.as_str());
                return entry.result.as_ref().unwrap().0.clone();
            }

            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);

            if !self.active.lock().contains(&key) {
                entry.attempts = 0;
                self.pending.lock().push_back(key.clone());
                self.pump.notify_one();
            }

            rx
        };

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DnsError::Shutdown),
            Err(_) => Err(DnsError::Timeout),
        }
    }

    async fn pump_once(self: &Arc<Self>) {
        // Drop system nameservers that failed too often
        {
            let mut servers = self.servers.write();
            servers.retain(|server| {
                let drop = server.is_system() && self.config.max_failures < server.failures();
                if drop {
                    info!("dropping failed nameserver {}", server.addr());
                    server.stop();
                }
                !drop
            });
        }

        loop {
            let Some(key) = self.pending.lock().pop_front() else { break };

            if self.active.lock().contains(&key) {
                continue;
            }

            let servers: Vec<Arc<Nameserver>> = self.servers.read().clone();

            {
                let mut cache = self.cache.lock();
                let Some(entry) = cache.get_mut(&key) else { continue };

                entry.waiters.retain(|waiter| !waiter.is_closed());

                if entry.waiters.is_empty() {
                    continue;
                }
                if servers.is_empty() {
                    Self::finish(entry, Err(DnsError::NoServer), Instant::now());
                    continue;
                }

                entry.responded = false;
                entry.inflight = 0;
                entry.attempts += 1;
                self.active.lock().insert(key.clone());
            }

            let mut accepted = 0isize;
            for server in &servers {
                if server
                    .transmit(key.0, &key.1, self.config.max_active, self.config.query_timeout)
                    .await
                {
                    accepted += 1;
                }
            }

            let mut cache = self.cache.lock();
            let Some(entry) = cache.get_mut(&key) else { continue };
            entry.inflight += accepted;

            if accepted == 0 {
                self.active.lock().remove(&key);
                Self::finish(entry, Err(DnsError::NoServer), Instant::now());
            }
        }
    }

    /// A nameserver finished one query for `(qtype, name)`.
    pub(crate) fn response(&self, qtype: RecordType, name: &str, outcome: Outcome, ttl: u32) {
        let key = (qtype, name.to_string());
        let mut cache = self.cache.lock();
        let Some(entry) = cache.get_mut(&key) else { return };

        entry.inflight -= 1;
        if entry.inflight <= 0 {
            self.active.lock().remove(&key);
        }

        trace!(
            "DNS response for {} {name}: {:?} inflight={} attempts={}",
            qtype.as_str(),
            outcome.as_ref().err(),
            entry.inflight,
            entry.attempts
        );

        if entry.responded {
            return;
        }

        if let Err(err) = &outcome {
            if *err != DnsError::NotExist {
                // Wait for other inflight responses before retrying
                if 0 < entry.inflight {
                    return;
                }

                if entry.attempts < self.config.max_attempts {
                    self.pending.lock().push_front(key.clone());
                    self.pump.notify_one();
                    return;
                }
            }
        }

        let expires = Instant::now() + Duration::from_secs(ttl as u64);
        Self::finish(entry, outcome, expires);
    }

    fn finish(entry: &mut Entry, outcome: Outcome, expires: Instant) {
        entry.responded = true;
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        entry.result = Some((outcome, expires));
    }
}

/// Nameservers from the system resolver configuration.
fn system_nameservers() -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    if let Ok(contents) = std::fs::read_to_string("/etc/resolv.conf") {
        for line in contents.lines() {
            let line = line.trim();
            let mut parts = line.split_whitespace();
            if parts.next() == Some("nameserver") {
                if let Some(server) = parts.next() {
                    if let Ok(addr) = parse_server_addr(server) {
                        addrs.push(addr);
                    }
                }
            }
        }
    }

    addrs
}
