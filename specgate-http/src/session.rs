//! Server-side sessions and the process-wide session store.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::debug;

use specgate_core::digest;
use specgate_core::{Error, Result};

fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// One session: a JSON dict with reserved keys `created`, `last_used`,
/// `user`, `ip` and `group`, plus arbitrary application keys.
#[derive(Clone)]
pub struct Session {
    id: String,
    data: Arc<RwLock<Map<String, Value>>>,
}

impl Session {
    pub fn new(id: String, ip: IpAddr) -> Session {
        let mut data = Map::new();
        let now = now_secs();
        data.insert("created".into(), json!(now));
        data.insert("last_used".into(), json!(now));
        data.insert("ip".into(), json!(ip.to_string()));
        data.insert("group".into(), Value::Object(Map::new()));

        Session { id, data: Arc::new(RwLock::new(data)) }
    }

    pub fn from_json(id: String, value: &Value) -> Result<Session> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::Parse(format!("session '{id}' is not a dict")))?;
        Ok(Session { id, data: Arc::new(RwLock::new(map.clone())) })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> Option<String> {
        self.data.read().get("user").and_then(|v| v.as_str()).map(str::to_string)
    }

    pub fn set_user(&self, user: impl Into<String>) {
        self.data.write().insert("user".into(), json!(user.into()));
    }

    pub fn add_group(&self, name: &str) {
        let mut data = self.data.write();
        let group = data
            .entry("group")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = group {
            map.insert(name.to_string(), json!(true));
        }
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.data
            .read()
            .get("group")
            .and_then(|g| g.get(name))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Group names carried by this session, active ones only.
    pub fn groups(&self) -> Vec<String> {
        match self.data.read().get("group") {
            Some(Value::Object(map)) => map
                .iter()
                .filter(|(_, active)| active.as_bool().unwrap_or(false))
                .map(|(name, _)| name.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.data.write().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) {
        self.data.write().remove(key);
    }

    pub fn created(&self) -> u64 {
        self.u64_field("created")
    }

    pub fn last_used(&self) -> u64 {
        self.u64_field("last_used")
    }

    pub fn touch(&self) {
        self.data.write().insert("last_used".into(), json!(now_secs()));
    }

    fn u64_field(&self, key: &str) -> u64 {
        self.data.read().get(key).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.data.read().get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.data.read().clone())
    }
}

/// Session store configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Seconds since last use before a session expires; zero disables.
    pub timeout: u64,
    /// Maximum session lifetime in seconds; zero disables.
    pub lifetime: u64,
    /// Session cookie name.
    pub cookie: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig { timeout: 86400, lifetime: 0, cookie: "sid".to_string() }
    }
}

/// Process-wide keyed session store.
pub struct SessionManager {
    config: SessionConfig,
    sessions: DashMap<String, Session>,
    last_cleanup: Mutex<u64>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> SessionManager {
        SessionManager { config, sessions: DashMap::new(), last_cleanup: Mutex::new(now_secs()) }
    }

    pub fn cookie_name(&self) -> &str {
        &self.config.cookie
    }

    fn generate_id(peer: IpAddr) -> String {
        let peer = peer.to_string();
        let now = now_secs().to_be_bytes();
        let nonce = rand::thread_rng().gen::<u64>().to_be_bytes();
        digest::sha256_url_base64(&[peer.as_bytes(), now.as_slice(), nonce.as_slice()])
    }

    pub fn is_expired(&self, session: &Session) -> bool {
        let now = now_secs();
        let timeout = session.u64_or("timeout", self.config.timeout);
        let lifetime = session.u64_or("lifetime", self.config.lifetime);

        (timeout != 0 && session.last_used() + timeout < now)
            || (lifetime != 0 && session.created() + lifetime < now)
    }

    /// Create and register a fresh session for `peer`.
    pub fn open_session(&self, peer: IpAddr) -> Session {
        let session = Session::new(Self::generate_id(peer), peer);
        debug!("opened session {}", session.id());
        self.add_session(session.clone());
        session
    }

    /// Look up a live session and touch its `last_used`.
    pub fn lookup_session(&self, sid: &str) -> Result<Session> {
        let session = self
            .sessions
            .get(sid)
            .map(|s| s.clone())
            .ok_or_else(|| Error::Key(format!("session '{sid}' does not exist")))?;

        if self.is_expired(&session) {
            self.sessions.remove(sid);
            return Err(Error::Key(format!("session '{sid}' does not exist")));
        }

        session.touch();
        Ok(session)
    }

    pub fn has_session(&self, sid: &str) -> bool {
        self.lookup_session(sid).is_ok()
    }

    pub fn close_session(&self, sid: &str) {
        self.sessions.remove(sid);
    }

    fn add_session(&self, session: Session) {
        if self.is_expired(&session) {
            return;
        }
        self.sessions.insert(session.id().to_string(), session);

        // Sweep expired sessions at most once an hour
        let now = now_secs();
        let mut last = self.last_cleanup.lock();
        if *last + 3600 < now {
            *last = now;
            drop(last);
            self.cleanup();
        }
    }

    pub fn cleanup(&self) {
        self.sessions.retain(|_, session| !self.is_expired(session));
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Serialize all live sessions keyed by id.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for entry in self.sessions.iter() {
            if !self.is_expired(entry.value()) {
                out.insert(entry.key().clone(), entry.value().to_json());
            }
        }
        Value::Object(out)
    }

    /// Load sessions from a previously serialized store.
    pub fn load_json(&self, value: &Value) -> Result<()> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::Parse("session store is not a dict".into()))?;

        for (sid, data) in map {
            let session = Session::from_json(sid.clone(), data)?;
            self.add_session(session);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn open_lookup_close() {
        let manager = SessionManager::new(SessionConfig::default());
        let session = manager.open_session(peer());

        let found = manager.lookup_session(session.id()).unwrap();
        assert_eq!(found.id(), session.id());

        manager.close_session(session.id());
        assert!(manager.lookup_session(session.id()).is_err());
    }

    #[test]
    fn ids_are_opaque_and_unique() {
        let manager = SessionManager::new(SessionConfig::default());
        let a = manager.open_session(peer());
        let b = manager.open_session(peer());
        assert_ne!(a.id(), b.id());
        assert!(!a.id().contains('='));
    }

    #[test]
    fn timeout_expiry() {
        let manager = SessionManager::new(SessionConfig { timeout: 100, ..Default::default() });
        let session = manager.open_session(peer());

        session.insert("last_used", json!(now_secs() - 101));
        assert!(manager.is_expired(&session));
        assert!(manager.lookup_session(session.id()).is_err());
    }

    #[test]
    fn lifetime_expiry_and_per_session_override() {
        let manager =
            SessionManager::new(SessionConfig { timeout: 0, lifetime: 1000, ..Default::default() });
        let session = manager.open_session(peer());
        session.insert("created", json!(now_secs() - 2000));
        assert!(manager.is_expired(&session));

        let other = manager.open_session(peer());
        other.insert("created", json!(now_secs() - 2000));
        other.insert("lifetime", json!(10_000u64));
        assert!(!manager.is_expired(&other));
    }

    #[test]
    fn lookup_touches_last_used() {
        let manager = SessionManager::new(SessionConfig::default());
        let session = manager.open_session(peer());
        session.insert("last_used", json!(5u64));

        manager.lookup_session(session.id()).unwrap();
        assert!(5 < session.last_used());
    }

    #[test]
    fn groups() {
        let session = Session::new("s1".into(), peer());
        assert!(session.groups().is_empty());
        session.add_group("admin");
        session.add_group("authenticated");
        assert!(session.has_group("admin"));
        let mut groups = session.groups();
        groups.sort();
        assert_eq!(groups, vec!["admin".to_string(), "authenticated".to_string()]);
    }

    #[test]
    fn store_round_trip() {
        let manager = SessionManager::new(SessionConfig::default());
        let session = manager.open_session(peer());
        session.set_user("ann");
        session.add_group("authenticated");

        let saved = manager.to_json();

        let restored = SessionManager::new(SessionConfig::default());
        restored.load_json(&saved).unwrap();
        let session2 = restored.lookup_session(session.id()).unwrap();
        assert_eq!(session2.user(), Some("ann".to_string()));
        assert!(session2.has_group("authenticated"));
    }
}
