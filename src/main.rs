//! specgate - declarative JSON-configured HTTP API gateway
//!
//! Main entry point: loads the gateway config and the API spec document,
//! wires the DNS resolver, session store, time-series store and OAuth2
//! providers together, and runs the HTTP server until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::signal;
use tracing::{error, info, warn};

use specgate_api::{Api, ApiContext, OAuth2Providers};
use specgate_core::duration::parse_duration;
use specgate_dns::{Resolver, ResolverConfig};
use specgate_http::{
    ConnConfig, HttpClient, ListenAddr, Server, ServerConfig, SessionConfig, SessionManager,
};
use specgate_store::Store;

/// Gateway configuration, read from one JSON file.
struct GatewayConfig {
    server: ServerConfig,
    sessions: SessionConfig,
    nameservers: Vec<String>,
    store_path: Option<String>,
    options: Value,
    oauth2: Value,
    api: Value,
}

fn parse_config(doc: &Value, dir: &std::path::Path) -> Result<GatewayConfig> {
    let mut server = ServerConfig::default();
    let mut conn = ConnConfig::default();

    if let Some(listen) = doc.get("listen").and_then(|v| v.as_array()) {
        server.listen = listen
            .iter()
            .filter_map(|v| v.as_str())
            .map(|addr| {
                addr.parse()
                    .map(ListenAddr::plain)
                    .with_context(|| format!("invalid listen address '{addr}'"))
            })
            .collect::<Result<Vec<_>>>()?;
    }
    if let Some(max) = doc.get("max-connections").and_then(|v| v.as_u64()) {
        server.max_connections = max as usize;
    }
    if let Some(max) = doc.get("max-header-size").and_then(|v| v.as_u64()) {
        conn.max_header_size = max as usize;
    }
    if let Some(max) = doc.get("max-body-size").and_then(|v| v.as_u64()) {
        conn.max_body_size = max as usize;
    }
    if let Some(ttl) = doc.get("request-timeout") {
        let ttl = parse_duration(ttl).map_err(|e| anyhow::anyhow!("{e}"))?;
        conn.request_timeout = (ttl != Duration::ZERO).then_some(ttl);
    }
    server.conn = conn;

    let mut sessions = SessionConfig::default();
    if let Some(session) = doc.get("session") {
        if let Some(timeout) = session.get("timeout").and_then(|v| v.as_u64()) {
            sessions.timeout = timeout;
        }
        if let Some(lifetime) = session.get("lifetime").and_then(|v| v.as_u64()) {
            sessions.lifetime = lifetime;
        }
        if let Some(cookie) = session.get("cookie").and_then(|v| v.as_str()) {
            sessions.cookie = cookie.to_string();
        }
    }

    let nameservers = doc
        .get("dns")
        .and_then(|dns| dns.get("nameservers"))
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    // The API spec is inline or a sibling file
    let api = match doc.get("api-spec") {
        Some(inline) => inline.clone(),
        None => {
            let path = doc
                .get("api")
                .and_then(|v| v.as_str())
                .context("config has neither 'api-spec' nor an 'api' file path")?;
            let raw = std::fs::read_to_string(dir.join(path))
                .with_context(|| format!("reading API spec '{path}'"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing API spec '{path}'"))?
        }
    };

    Ok(GatewayConfig {
        server,
        sessions,
        nameservers,
        store_path: doc.get("store").and_then(|v| v.as_str()).map(str::to_string),
        options: doc.get("options").cloned().unwrap_or(Value::Null),
        oauth2: doc.get("oauth2").cloned().unwrap_or(Value::Null),
        api,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("specgate=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "specgate.json".to_string());
    info!("loading config from {config_path}");

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading config '{config_path}'"))?;
    let doc: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config '{config_path}'"))?;
    let dir = std::path::Path::new(&config_path)
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_default();

    let config = parse_config(&doc, &dir)?;

    // DNS resolver backing the outbound client
    let resolver = Arc::new(Resolver::new(ResolverConfig::default()));
    for nameserver in &config.nameservers {
        if let Err(e) = resolver.add_nameserver(nameserver, false).await {
            warn!("nameserver {nameserver}: {e}");
        }
    }

    let sessions = Arc::new(SessionManager::new(config.sessions));
    let client = Arc::new(HttpClient::new(Arc::clone(&resolver)));
    let providers = Arc::new(
        OAuth2Providers::from_config(&config.oauth2).map_err(|e| anyhow::anyhow!("{e}"))?,
    );

    let store = match &config.store_path {
        Some(path) => Some(Store::open(path).with_context(|| format!("opening store '{path}'"))?),
        None => {
            info!("no 'store' configured, timeseries endpoints unavailable");
            None
        }
    };

    // The DB connector is deployment-specific; without one, query
    // endpoints are rejected at load time
    let api = Api::new(ApiContext {
        options: config.options,
        sessions: Arc::clone(&sessions),
        connector: None,
        store,
        client: Some(client),
        providers,
    });

    let root = match api.load(&config.api) {
        Ok(root) => root,
        Err(e) => {
            error!("loading API spec failed: {e}");
            return Err(anyhow::anyhow!("{e}"));
        }
    };

    let server = Server::new(config.server, Some(sessions));
    server.add_handler(root);
    let bound = server.listen().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("specgate serving on {bound:?}");

    match signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping"),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    Ok(())
}
