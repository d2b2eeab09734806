//! Periodic query time-series: period-aligned sampling into the KV log,
//! change suppression, and WebSocket subscriber fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use specgate_core::{digest, duration, Error, Result};
use specgate_http::{Request, RequestHandler, WsMessageHandler, WsSender};
use specgate_store::{Namespace, Store};

use crate::query::{QueryDef, QuerySource};
use crate::resolver::Resolver;

const TIME_KEY_FMT: &str = "%Y%m%d%H%M%S";

fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

fn time_key(ts: u64) -> String {
    Utc.timestamp_opt(ts as i64, 0)
        .single()
        .map(|t| t.format(TIME_KEY_FMT).to_string())
        .unwrap_or_else(|| "00000000000000".to_string())
}

fn parse_time_key(key: &str) -> Result<u64> {
    let parsed = chrono::NaiveDateTime::parse_from_str(key, TIME_KEY_FMT)
        .map_err(|e| Error::Parse(format!("invalid time key '{key}': {e}")))?;
    Ok(parsed.and_utc().timestamp().max(0) as u64)
}

fn time_string(ts: u64) -> String {
    Utc.timestamp_opt(ts as i64, 0)
        .single()
        .map(|t: DateTime<Utc>| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

/// Parse a `since` value: epoch seconds or an RFC 3339 time.
fn parse_since(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s
            .parse::<u64>()
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp().max(0) as u64)
            })
            .unwrap_or(0),
        _ => 0,
    }
}

struct Subscriber {
    tx: UnboundedSender<Value>,
    pending: Vec<Value>,
    init: bool,
}

struct TsState {
    last_result: Option<Value>,
    last_request: u64,
}

/// One sampled series, keyed by the digest of its resolved SQL.
pub struct Timeseries {
    key: String,
    sql: String,
    period: Duration,
    timeout: Duration,
    automatic: bool,
    query: Arc<QueryDef>,
    source: Arc<dyn QuerySource>,
    db: Namespace,
    state: Mutex<TsState>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    scheduled: AtomicBool,
}

impl Timeseries {
    fn period_secs(&self) -> u64 {
        self.period.as_secs().max(1)
    }

    fn align(&self, ts: u64) -> u64 {
        ts - ts % self.period_secs()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn make_entry(ts: u64, value: Value) -> Value {
        let mut entry = Map::new();
        entry.insert("value".into(), value);
        entry.insert("time".into(), Value::from(time_string(ts)));
        Value::Object(entry)
    }

    /// Entries between `since` and now, newest first.
    ///
    /// Also re-arms the sampling schedule for request-triggered series.
    pub fn get(self: &Arc<Self>, since: u64, max_count: usize) -> Result<Value> {
        let low = if since == 0 { "00000000000000".to_string() } else { time_key(since) };
        let results = self
            .db
            .range_desc("99999999999999", &low, max_count)
            .map_err(|e| Error::Internal(anyhow::anyhow!("timeseries scan: {e}")))?;

        let mut entries = Vec::with_capacity(results.len());
        for (key, value) in results {
            let ts = parse_time_key(&key)?;
            let value = serde_json::from_str(&value)
                .map_err(|e| Error::Parse(format!("bad timeseries entry: {e}")))?;
            entries.push(Self::make_entry(ts, value));
        }

        self.state.lock().last_request = now_secs();
        self.save();
        self.ensure_scheduled();

        Ok(Value::Array(entries))
    }

    /// Register subscriber `id`.  The receiver first gets the initial
    /// result list; broadcasts that raced it are buffered and released
    /// after.
    pub fn subscribe(
        self: &Arc<Self>,
        id: u64,
        since: u64,
        max_count: usize,
    ) -> Result<UnboundedReceiver<Value>> {
        let (tx, rx) = unbounded_channel();

        {
            let mut subscribers = self.subscribers.lock();
            if subscribers.contains_key(&id) {
                return Err(Error::Conflict(format!(
                    "timeseries already has subscriber with id {id}"
                )));
            }
            subscribers.insert(id, Subscriber { tx, pending: Vec::new(), init: false });
        }

        let initial = match self.get(since, max_count) {
            Ok(initial) => initial,
            Err(e) => {
                self.subscribers.lock().remove(&id);
                return Err(e);
            }
        };

        let mut subscribers = self.subscribers.lock();
        if let Some(subscriber) = subscribers.get_mut(&id) {
            let _ = subscriber.tx.send(initial);
            for pending in subscriber.pending.drain(..) {
                let _ = subscriber.tx.send(pending);
            }
            subscriber.init = true;
        }

        Ok(rx)
    }

    pub fn unsubscribe(&self, id: u64) -> Result<()> {
        if self.subscribers.lock().remove(&id).is_none() {
            return Err(Error::Key(format!("timeseries has no subscriber with id {id}")));
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn broadcast(&self, entry: &Value) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|_, subscriber| {
            if subscriber.init {
                subscriber.tx.send(entry.clone()).is_ok()
            } else {
                subscriber.pending.push(entry.clone());
                true
            }
        });
    }

    fn save(&self) {
        let state = self.state.lock();
        let mut doc = Map::new();
        doc.insert("last-request".into(), json!(state.last_request));
        if let Some(last) = &state.last_result {
            doc.insert("last-result".into(), last.clone());
        }
        drop(state);

        if let Err(e) = self.db.set("state", &Value::Object(doc).to_string()) {
            warn!("saving timeseries {} state: {e}", self.key);
        }
    }

    /// Restore `state` from the store.
    fn load(&self) {
        let Ok(Some(raw)) = self.db.get("state") else { return };
        let Ok(doc) = serde_json::from_str::<Value>(&raw) else { return };

        let mut state = self.state.lock();
        state.last_request = doc.get("last-request").and_then(|v| v.as_u64()).unwrap_or(0);
        state.last_result = doc.get("last-result").cloned();
    }

    fn should_run(&self) -> bool {
        if self.automatic {
            return true;
        }

        let last_request = self.state.lock().last_request;
        last_request != 0
            && (self.timeout.is_zero()
                || now_secs() < last_request + self.timeout.as_secs())
    }

    /// Arm the periodic sampling task if it is not already running.
    fn ensure_scheduled(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let ts = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // Sleep to the next period boundary
                let now = now_secs();
                let next = ts.align(now) + ts.period_secs();
                tokio::time::sleep(Duration::from_secs(next - now)).await;

                if !ts.should_run() {
                    ts.scheduled.store(false, Ordering::SeqCst);
                    break;
                }

                ts.run_query(next).await;
            }
        });
    }

    /// Run the query for the period at `ts`; store and broadcast only
    /// when the result changed.
    async fn run_query(&self, ts: u64) {
        let result = self.query.exec(&self.source, &self.sql).await;

        let value = match result {
            Ok((200, Some(value))) => value,
            Ok((code, _)) => {
                debug!("timeseries {} query returned {code}", self.key);
                return;
            }
            Err(e) => {
                warn!("timeseries {} query failed: {e}", self.key);
                return;
            }
        };

        let aligned = self.align(ts);
        let changed = {
            let mut state = self.state.lock();
            if state.last_result.as_ref() == Some(&value) {
                false
            } else {
                state.last_result = Some(value.clone());
                true
            }
        };

        if changed {
            if let Err(e) = self.db.set(&time_key(aligned), &value.to_string()) {
                warn!("storing timeseries {} entry: {e}", self.key);
            }
            self.broadcast(&Self::make_entry(aligned, value));
        }

        if !self.subscribers.lock().is_empty() {
            self.state.lock().last_request = now_secs();
        }
        self.save();
    }
}

/// A configured time-series definition.
///
/// Each distinct resolved SQL string gets its own [`Timeseries`]
/// instance, keyed by the base64 SHA-256 of the SQL and persisted in the
/// def's key registry.
pub struct TimeseriesDef {
    pub name: String,
    period: Duration,
    timeout: Duration,
    automatic: bool,
    query: Arc<QueryDef>,
    source: Arc<dyn QuerySource>,
    db: Namespace,
    keys: Namespace,
    series: Mutex<HashMap<String, Arc<Timeseries>>>,
}

impl TimeseriesDef {
    pub fn new(
        name: impl Into<String>,
        config: &Value,
        query: Arc<QueryDef>,
        source: Arc<dyn QuerySource>,
        store: &Store,
    ) -> Result<Arc<TimeseriesDef>> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Validation("timeseries requires a name".into()));
        }

        let period = duration::parse_duration(
            config.get("period").ok_or_else(|| {
                Error::Validation(format!("timeseries '{name}' requires a period"))
            })?,
        )?;
        if period.is_zero() {
            return Err(Error::Validation(format!("timeseries '{name}' period cannot be zero")));
        }

        let timeout = duration::parse_duration_or(config, "timeout", Duration::ZERO)?;

        let automatic = match config.get("trigger").and_then(|v| v.as_str()).unwrap_or("request") {
            "auto" => true,
            "request" => false,
            other => {
                return Err(Error::Validation(format!(
                    "invalid timeseries trigger '{other}', must be 'auto' or 'request'"
                )))
            }
        };

        if automatic && !timeout.is_zero() {
            return Err(Error::Validation(
                "an automatic timeseries cannot also have a timeout".into(),
            ));
        }

        let db = store.ns(format!(":{name}:"));
        let keys = db.ns("keys:");

        Ok(Arc::new(TimeseriesDef {
            name,
            period,
            timeout,
            automatic,
            query,
            source,
            db,
            keys,
            series: Mutex::new(HashMap::new()),
        }))
    }

    pub fn query(&self) -> &Arc<QueryDef> {
        &self.query
    }

    fn make_series(&self, key: String, sql: String) -> Arc<Timeseries> {
        Arc::new(Timeseries {
            db: self.db.ns(&format!(":{key}:")),
            key,
            sql,
            period: self.period,
            timeout: self.timeout,
            automatic: self.automatic,
            query: Arc::clone(&self.query),
            source: Arc::clone(&self.source),
            state: Mutex::new(TsState { last_result: None, last_request: 0 }),
            subscribers: Mutex::new(HashMap::new()),
            scheduled: AtomicBool::new(false),
        })
    }

    /// The series for the resolver's SQL, created on demand.
    pub fn get(&self, resolver: &Resolver, create: bool) -> Result<Option<Arc<Timeseries>>> {
        let sql = resolver.resolve_str(&self.query.sql, true);
        let key = digest::sha256_base64(sql.as_bytes());

        {
            let series = self.series.lock();
            if let Some(existing) = series.get(&key) {
                return Ok(Some(Arc::clone(existing)));
            }
        }
        if !create {
            return Ok(None);
        }

        debug!("adding '{}' timeseries with key '{key}'", self.name);
        let ts = self.make_series(key.clone(), sql.clone());
        self.keys
            .set(&key, &sql)
            .map_err(|e| Error::Internal(anyhow::anyhow!("registering series key: {e}")))?;
        ts.load();
        if ts.should_run() {
            ts.ensure_scheduled();
        }

        self.series.lock().insert(key, Arc::clone(&ts));
        Ok(Some(ts))
    }

    /// Rebuild persisted series from the key registry.
    pub fn load_persisted(&self) -> Result<()> {
        let entries = self
            .keys
            .entries()
            .map_err(|e| Error::Internal(anyhow::anyhow!("loading series keys: {e}")))?;

        for (key, sql) in entries {
            let ts = self.make_series(key.clone(), sql);
            ts.load();
            if ts.should_run() {
                ts.ensure_scheduled();
            }
            self.series.lock().insert(key, ts);
        }
        Ok(())
    }
}

/// How an endpoint names its time-series: an inline def or a reference
/// to a registered one.
pub struct TimeseriesRef {
    def: Arc<TimeseriesDef>,
    since_arg: String,
    max_count_arg: String,
}

impl TimeseriesRef {
    pub fn new(def: Arc<TimeseriesDef>, config: &Value) -> TimeseriesRef {
        TimeseriesRef {
            def,
            since_arg: config
                .get("since_arg")
                .and_then(|v| v.as_str())
                .unwrap_or("args.since")
                .to_string(),
            max_count_arg: config
                .get("max_count_arg")
                .and_then(|v| v.as_str())
                .unwrap_or("args.max_count")
                .to_string(),
        }
    }

    fn since(&self, resolver: &Resolver) -> u64 {
        resolver.select(&self.since_arg).map(|v| parse_since(&v)).unwrap_or(0)
    }

    fn max_count(&self, resolver: &Resolver) -> usize {
        resolver
            .select(&self.max_count_arg)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize
    }

    pub fn query(&self, resolver: &Resolver) -> Result<Value> {
        let ts = self
            .def
            .get(resolver, true)?
            .ok_or_else(|| Error::Key("timeseries not found".into()))?;
        ts.get(self.since(resolver), self.max_count(resolver))
    }

    pub fn subscribe(
        &self,
        resolver: &Resolver,
        id: u64,
    ) -> Result<(Arc<Timeseries>, UnboundedReceiver<Value>)> {
        let ts = self
            .def
            .get(resolver, true)?
            .ok_or_else(|| Error::Key("timeseries not found".into()))?;
        let rx = ts.subscribe(id, self.since(resolver), self.max_count(resolver))?;
        Ok((ts, rx))
    }
}

/// HTTP endpoint: replies with the series entries.
pub struct TimeseriesHandler {
    options: Value,
    ts_ref: Arc<TimeseriesRef>,
}

impl TimeseriesHandler {
    pub fn new(options: Value, ts_ref: Arc<TimeseriesRef>) -> TimeseriesHandler {
        TimeseriesHandler { options, ts_ref }
    }
}

#[async_trait]
impl RequestHandler for TimeseriesHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let resolver = Resolver::for_request(&self.options, req);
        let entries = self.ts_ref.query(&resolver)?;
        req.reply_json(200, &entries);
        Ok(true)
    }
}

/// WebSocket endpoint: subscribes the connection to the series and
/// forwards the initial payload plus each change entry as JSON frames.
pub struct TimeseriesWsHandler {
    ts_ref: Arc<TimeseriesRef>,
    resolver: Resolver,
    subscription: Mutex<Option<Arc<Timeseries>>>,
}

impl TimeseriesWsHandler {
    pub fn new(ts_ref: Arc<TimeseriesRef>, resolver: Resolver) -> TimeseriesWsHandler {
        TimeseriesWsHandler { ts_ref, resolver, subscription: Mutex::new(None) }
    }
}

#[async_trait]
impl WsMessageHandler for TimeseriesWsHandler {
    async fn on_open(&self, ws: &WsSender) -> Result<()> {
        let (ts, mut rx) = self.ts_ref.subscribe(&self.resolver, ws.id())?;
        debug!("ws {} subscribed to timeseries {}", ws.id(), ts.key());
        *self.subscription.lock() = Some(ts);

        let ws = ws.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if ws.send_json(&entry).await.is_err() {
                    break;
                }
            }
        });

        Ok(())
    }

    async fn on_message(&self, _ws: &WsSender, msg: Value) -> Result<()> {
        debug!("timeseries websocket ignoring message: {msg}");
        Ok(())
    }

    async fn on_close(&self, conn_id: u64) {
        if let Some(ts) = self.subscription.lock().take() {
            let _ = ts.unsubscribe(conn_id);
        }
    }
}
