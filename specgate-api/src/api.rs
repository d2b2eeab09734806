//! The declarative API loader.
//!
//! Consumes the JSON API config, registers named args, prepared queries
//! and time-series, builds the endpoint handler tree and emits the
//! OpenAPI document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info};

use specgate_core::{Error, Result};
use specgate_http::{
    parse_method_mask, CorsHandler, FileHandler, HandlerGroup, HandlerRc, HeadersHandler,
    HttpClient, MethodMatcher, PassHandler, PatternMatcher, Request, RequestHandler,
    SessionManager, StatusHandler,
};
use specgate_store::Store;

use crate::args::{ArgFilter, ArgFilterHandler};
use crate::config::EndpointConfig;
use crate::login::{LoginContext, LoginHandler, LogoutHandler, SessionEndpoint};
use crate::oauth2::OAuth2Providers;
use crate::query::{QueryDef, QuerySource};
use crate::resolver::Resolver;
use crate::spec::{ApiSpec, SpecHandler};
use crate::timeseries::{TimeseriesDef, TimeseriesHandler, TimeseriesRef, TimeseriesWsHandler};

/// Services the API layer consumes.
pub struct ApiContext {
    pub options: Value,
    pub sessions: Arc<SessionManager>,
    pub connector: Option<Arc<dyn QuerySource>>,
    pub store: Option<Store>,
    pub client: Option<Arc<HttpClient>>,
    pub providers: Arc<OAuth2Providers>,
}

/// The API: registries plus the loader.
pub struct Api {
    ctx: ApiContext,
    login_ctx: Arc<LoginContext>,
    spec: ApiSpec,
    callbacks: RwLock<HashMap<String, HandlerRc>>,
    arg_filters: RwLock<HashMap<String, Arc<dyn ArgFilter>>>,
    named_args: RwLock<HashMap<String, Value>>,
    query_defs: RwLock<HashMap<String, Arc<QueryDef>>>,
    query_handlers: RwLock<HashMap<String, HandlerRc>>,
    ts_defs: RwLock<HashMap<String, Arc<TimeseriesDef>>>,
    ts_handlers: RwLock<HashMap<String, HandlerRc>>,
    loaded: AtomicBool,
}

impl Api {
    pub fn new(ctx: ApiContext) -> Api {
        let login_ctx = Arc::new(LoginContext {
            options: ctx.options.clone(),
            sessions: Arc::clone(&ctx.sessions),
            source: ctx.connector.clone(),
            client: ctx.client.clone(),
            providers: Arc::clone(&ctx.providers),
        });

        Api {
            spec: ApiSpec::new(&Value::Null),
            login_ctx,
            ctx,
            callbacks: RwLock::new(HashMap::new()),
            arg_filters: RwLock::new(HashMap::new()),
            named_args: RwLock::new(HashMap::new()),
            query_defs: RwLock::new(HashMap::new()),
            query_handlers: RwLock::new(HashMap::new()),
            ts_defs: RwLock::new(HashMap::new()),
            ts_handlers: RwLock::new(HashMap::new()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Register a `bind` callback.  Binding the same key twice is an
    /// error.
    pub fn bind(&self, key: &str, handler: HandlerRc) -> Result<()> {
        let mut callbacks = self.callbacks.write();
        if callbacks.contains_key(key) {
            return Err(Error::Conflict(format!("API binding for '{key}' already exists")));
        }
        callbacks.insert(key.to_string(), handler);
        Ok(())
    }

    /// Register an `arg-filter` by name.
    pub fn bind_arg_filter(&self, name: &str, filter: Arc<dyn ArgFilter>) -> Result<()> {
        let mut filters = self.arg_filters.write();
        if filters.contains_key(name) {
            return Err(Error::Conflict(format!("arg filter '{name}' already exists")));
        }
        filters.insert(name.to_string(), filter);
        Ok(())
    }

    pub fn spec(&self) -> &ApiSpec {
        &self.spec
    }

    fn resolve_name(category: &str, name: &str) -> String {
        if category.is_empty() || name.contains('.') {
            name.to_string()
        } else {
            format!("{category}.{name}")
        }
    }

    fn named_args_config(&self, category: &str, name: &str) -> Result<Value> {
        let qualified = Self::resolve_name(category, name);
        self.named_args
            .read()
            .get(&qualified)
            .cloned()
            .ok_or_else(|| Error::Key(format!("args '{qualified}' not found")))
    }

    fn query_def(&self, category: &str, name: &str) -> Result<Arc<QueryDef>> {
        let qualified = Self::resolve_name(category, name);
        self.query_defs
            .read()
            .get(&qualified)
            .cloned()
            .ok_or_else(|| Error::Key(format!("query '{qualified}' not found")))
    }

    fn connector(&self) -> Result<Arc<dyn QuerySource>> {
        self.ctx
            .connector
            .clone()
            .ok_or_else(|| Error::Validation("API has no DB connector".into()))
    }

    fn store(&self) -> Result<&Store> {
        self.ctx
            .store
            .as_ref()
            .ok_or_else(|| Error::Validation("API has no timeseries store".into()))
    }

    /// Load the API config and build the dispatch tree.
    pub fn load(&self, config: &Value) -> Result<HandlerRc> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict("API already loaded".into()));
        }

        // Build-time variable resolution over the whole document
        let mut config = config.clone();
        Resolver::new(&self.ctx.options).resolve_value(&mut config, false);

        check_version(&config)?;
        self.spec.reset(&config);

        let apis = collect_apis(&config)?;

        // Pass 1: named args
        for (category, api) in &apis {
            if let Some(args) = api.get("args").and_then(|v| v.as_object()) {
                for (name, args_config) in args {
                    let qualified = Self::resolve_name(category, name);
                    debug!("adding args {qualified}");
                    if self
                        .named_args
                        .write()
                        .insert(qualified.clone(), args_config.clone())
                        .is_some()
                    {
                        return Err(Error::Conflict(format!("args '{qualified}' already exists")));
                    }
                }
            }
        }

        // Pass 2: prepared queries
        for (category, api) in &apis {
            if let Some(queries) = api.get("queries").and_then(|v| v.as_object()) {
                for (name, query_config) in queries {
                    let qualified = Self::resolve_name(category, name);
                    debug!("adding query {qualified}");

                    if query_config.get("query").is_some() {
                        return Err(Error::Validation(format!(
                            "prepared query '{qualified}' cannot reference another query"
                        )));
                    }
                    let def = Arc::new(QueryDef::from_config(query_config)?);

                    let cfg = self.endpoint_config(query_config.clone(), String::new(), None, category)?;
                    let handler = Arc::new(QueryEndpoint {
                        options: self.ctx.options.clone(),
                        source: self.connector()?,
                        def: Arc::clone(&def),
                    });
                    let wrapped = self.wrap_endpoint(handler, &cfg)?;

                    if self.query_defs.write().insert(qualified.clone(), def).is_some() {
                        return Err(Error::Conflict(format!(
                            "query '{qualified}' already exists"
                        )));
                    }
                    self.query_handlers.write().insert(qualified, wrapped);
                }
            }
        }

        // Pass 3: time-series
        for (category, api) in &apis {
            if let Some(series) = api.get("timeseries").and_then(|v| v.as_object()) {
                for (name, ts_config) in series {
                    let qualified = Self::resolve_name(category, name);
                    debug!("adding timeseries {qualified}");

                    let def = self.make_timeseries_def(&qualified, ts_config, category)?;
                    def.load_persisted()?;

                    let cfg =
                        self.endpoint_config(ts_config.clone(), String::new(), None, category)?;
                    let handler = Arc::new(TimeseriesHandler::new(
                        self.ctx.options.clone(),
                        Arc::new(TimeseriesRef::new(Arc::clone(&def), ts_config)),
                    ));
                    let wrapped = self.wrap_endpoint(handler, &cfg)?;

                    if self.ts_defs.write().insert(qualified.clone(), def).is_some() {
                        return Err(Error::Conflict(format!(
                            "timeseries '{qualified}' already exists"
                        )));
                    }
                    self.ts_handlers.write().insert(qualified, wrapped);
                }
            }
        }

        // Pass 4: endpoints and the spec document
        let mut root = HandlerGroup::new();
        for (category, api) in &apis {
            let hidden = api.get("hide").and_then(|v| v.as_bool()).unwrap_or(false);
            if !hidden {
                self.spec.add_tag(category, api);
            }

            if let Some(endpoints) = api.get("endpoints") {
                let cfg =
                    self.endpoint_config(endpoints.clone(), String::new(), None, category)?;
                root.add(self.create_api_handler(&cfg, category, hidden)?);
            }
        }

        Ok(Arc::new(ApiRootHandler { group: root }))
    }

    fn endpoint_config(
        &self,
        config: Value,
        pattern: String,
        parent: Option<&EndpointConfig>,
        category: &str,
    ) -> Result<EndpointConfig> {
        let lookup = |name: &str| self.named_args_config(category, name);
        EndpointConfig::new(config, pattern, parent, &lookup)
    }

    /// Walk one endpoints subtree: `/`-keys become sub-routers, method
    /// keys become method dispatchers.
    fn create_api_handler(
        &self,
        cfg: &EndpointConfig,
        category: &str,
        hidden: bool,
    ) -> Result<HandlerRc> {
        let entries = cfg
            .config()
            .as_object()
            .ok_or_else(|| {
                Error::Validation(format!("endpoints config is not a dict: {}", cfg.config()))
            })?
            .clone();

        let mut children = HandlerGroup::new();
        let mut methods = HandlerGroup::new();

        for (key, value) in entries {
            // A bare string is shorthand for a bind callback
            let value = match value {
                Value::String(bind) => {
                    let mut map = Map::new();
                    map.insert("bind".into(), Value::from(bind));
                    Value::Object(map)
                }
                other => other,
            };

            if key.starts_with('/') {
                let lookup = |name: &str| self.named_args_config(category, name);
                let child_cfg = cfg.create_child(value, &key, &lookup)?;
                children.add(self.create_api_handler(&child_cfg, category, hidden)?);
                continue;
            }

            let mask = parse_method_mask(&key);
            if mask != 0 {
                let lookup = |name: &str| self.named_args_config(category, name);
                let child_cfg = cfg.create_child(value, "", &lookup)?;
                let handler = self.create_methods_handler(&key, &child_cfg, category, hidden)?;
                methods.add(Arc::new(MethodMatcher::new(mask, handler)));
            }
        }

        let pattern = cfg.pattern().to_string();
        let mut group = HandlerGroup::new();

        if !methods.is_empty() {
            if pattern.is_empty() {
                group.add(Arc::new(methods));
            } else {
                group.add(Arc::new(PatternMatcher::compile(
                    &pattern,
                    false,
                    Arc::new(methods),
                )?));
            }
        }

        if !children.is_empty() {
            if pattern.is_empty() {
                group.add(Arc::new(children));
            } else {
                group.add(Arc::new(PatternMatcher::compile(
                    &pattern,
                    true,
                    Arc::new(children),
                )?));
            }
        }

        Ok(Arc::new(group))
    }

    fn create_methods_handler(
        &self,
        methods_key: &str,
        cfg: &EndpointConfig,
        category: &str,
        category_hidden: bool,
    ) -> Result<HandlerRc> {
        let types = endpoint_types(cfg.config())?;
        info!(
            "adding endpoint {methods_key} {} ({})",
            cfg.pattern(),
            types.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>().join(",")
        );

        let endpoint_hidden =
            cfg.config().get("hide").and_then(|v| v.as_bool()).unwrap_or(false);
        if !category_hidden && !endpoint_hidden {
            self.spec.add_endpoint(
                methods_key,
                category,
                cfg.pattern(),
                cfg.config(),
                cfg.args(),
            );
        }

        let handler = self.create_endpoint_handler(&types, cfg, category)?;
        self.wrap_endpoint(handler, cfg)
    }

    fn create_endpoint_handler(
        &self,
        types: &[(String, Value)],
        cfg: &EndpointConfig,
        category: &str,
    ) -> Result<HandlerRc> {
        if types.len() == 1 {
            let (ty, config) = &types[0];
            let lookup = |name: &str| self.named_args_config(category, name);
            let child_cfg = cfg.create_child(config.clone(), "", &lookup)?;
            return self.create_single_handler(ty, &child_cfg, category);
        }

        let mut group = HandlerGroup::new();
        for (ty, config) in types {
            let lookup = |name: &str| self.named_args_config(category, name);
            let child_cfg = cfg.create_child(config.clone(), "", &lookup)?;
            group.add(self.create_single_handler(ty, &child_cfg, category)?);
        }
        Ok(Arc::new(group))
    }

    fn create_single_handler(
        &self,
        ty: &str,
        cfg: &EndpointConfig,
        category: &str,
    ) -> Result<HandlerRc> {
        match ty {
            "pass" => Ok(Arc::new(PassHandler)),

            "status" => {
                let code = cfg
                    .get_u16("status")?
                    .or(cfg.get_u16("code")?)
                    .unwrap_or(200);
                Ok(Arc::new(StatusHandler::new(code)))
            }

            "redirect" => {
                let location = cfg
                    .get_str("redirect")
                    .ok_or_else(|| Error::Validation("redirect endpoint requires 'redirect'".into()))?
                    .to_string();
                let code = cfg.get_u16("code")?.unwrap_or(302);
                Ok(Arc::new(ResolvedRedirectHandler {
                    options: self.ctx.options.clone(),
                    location,
                    code,
                }))
            }

            "cors" => Ok(Arc::new(cors_from_config(cfg.config()))),

            "spec" => Ok(Arc::new(SpecHandler::new(self.spec.clone()))),

            "bind" => {
                let key = cfg.get_str("bind").unwrap_or("<default>");
                self.callbacks
                    .read()
                    .get(key)
                    .cloned()
                    .ok_or_else(|| Error::Key(format!("bind callback '{key}' not found")))
            }

            "file" => {
                let path = cfg
                    .get_str("path")
                    .ok_or_else(|| Error::Validation("file endpoint requires 'path'".into()))?;
                Ok(Arc::new(FileHandler::new(path)))
            }

            "resource" => {
                let resource = cfg
                    .get_str("resource")
                    .ok_or_else(|| {
                        Error::Validation("resource endpoint requires 'resource'".into())
                    })?;
                let base = self
                    .ctx
                    .options
                    .get("resources")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        Error::Validation(
                            "resource endpoints require a 'resources' base directory".into(),
                        )
                    })?;
                Ok(Arc::new(FileHandler::new(
                    std::path::Path::new(base).join(resource),
                )))
            }

            "login" => {
                let query = self.login_query(cfg, category)?;
                Ok(Arc::new(LoginHandler::new(Arc::clone(&self.login_ctx), query)))
            }

            "logout" => Ok(Arc::new(LogoutHandler::new(Arc::clone(&self.login_ctx)))),

            "session" => Ok(Arc::new(SessionEndpoint)),

            "query" => {
                if let Some(name) = cfg.get_str("query") {
                    if cfg.config().get("sql").is_some() {
                        return Err(Error::Validation(
                            "cannot define both 'query' and 'sql'".into(),
                        ));
                    }
                    let qualified = Self::resolve_name(category, name);
                    return self
                        .query_handlers
                        .read()
                        .get(&qualified)
                        .cloned()
                        .ok_or_else(|| Error::Key(format!("query '{qualified}' not found")));
                }

                let def = Arc::new(QueryDef::from_config(cfg.config())?);
                Ok(Arc::new(QueryEndpoint {
                    options: self.ctx.options.clone(),
                    source: self.connector()?,
                    def,
                }))
            }

            "timeseries" => {
                if let Some(name) = cfg.get_str("timeseries") {
                    if cfg.config().get("query").is_some() || cfg.config().get("sql").is_some() {
                        return Err(Error::Validation(
                            "cannot define both 'timeseries' and 'query' or 'sql'".into(),
                        ));
                    }
                    let qualified = Self::resolve_name(category, name);
                    return self
                        .ts_handlers
                        .read()
                        .get(&qualified)
                        .cloned()
                        .ok_or_else(|| {
                            Error::Key(format!("timeseries '{qualified}' not found"))
                        });
                }

                let name = format!("{category}{}", cfg.pattern().replace('/', "."));
                let def = self.make_timeseries_def(&name, cfg.config(), category)?;
                Ok(Arc::new(TimeseriesHandler::new(
                    self.ctx.options.clone(),
                    Arc::new(TimeseriesRef::new(def, cfg.config())),
                )))
            }

            "websocket" => {
                let ts_ref = self.timeseries_ref(cfg, category)?;
                Ok(Arc::new(WebsocketEndpoint {
                    options: self.ctx.options.clone(),
                    ts_ref,
                }))
            }

            other => Err(Error::Validation(format!("unsupported handler '{other}'"))),
        }
    }

    /// The optional SQL query attached to a login endpoint.
    fn login_query(&self, cfg: &EndpointConfig, category: &str) -> Result<Option<Arc<QueryDef>>> {
        if let Some(name) = cfg.get_str("query") {
            if cfg.config().get("sql").is_some() {
                return Err(Error::Validation("cannot define both 'query' and 'sql'".into()));
            }
            return Ok(Some(self.query_def(category, name)?));
        }
        if cfg.config().get("sql").is_some() {
            self.connector()?; // login SQL needs a DB
            return Ok(Some(Arc::new(QueryDef::from_config(cfg.config())?)));
        }
        Ok(None)
    }

    fn make_timeseries_def(
        &self,
        name: &str,
        config: &Value,
        category: &str,
    ) -> Result<Arc<TimeseriesDef>> {
        let query = if let Some(query_name) = config.get("query").and_then(|v| v.as_str()) {
            if config.get("sql").is_some() {
                return Err(Error::Validation(
                    "timeseries cannot define both 'query' and 'sql'".into(),
                ));
            }
            self.query_def(category, query_name)?
        } else {
            Arc::new(QueryDef::from_config(config)?)
        };

        TimeseriesDef::new(name, config, query, self.connector()?, self.store()?)
    }

    fn timeseries_ref(&self, cfg: &EndpointConfig, category: &str) -> Result<Arc<TimeseriesRef>> {
        if let Some(name) = cfg.get_str("timeseries") {
            let qualified = Self::resolve_name(category, name);
            let def = self
                .ts_defs
                .read()
                .get(&qualified)
                .cloned()
                .ok_or_else(|| Error::Key(format!("timeseries '{qualified}' not found")))?;
            return Ok(Arc::new(TimeseriesRef::new(def, cfg.config())));
        }

        let name = format!("{category}{}", cfg.pattern().replace('/', "."));
        let def = self.make_timeseries_def(&name, cfg.config(), category)?;
        Ok(Arc::new(TimeseriesRef::new(def, cfg.config())))
    }

    /// Wrap an endpoint with headers, arg filtering and validation.
    fn wrap_endpoint(&self, handler: HandlerRc, cfg: &EndpointConfig) -> Result<HandlerRc> {
        let mut group = HandlerGroup::new();

        if let Some(headers) = cfg.config().get("headers").and_then(|v| v.as_object()) {
            let pairs: Vec<(String, String)> = headers
                .iter()
                .filter_map(|(name, value)| {
                    value.as_str().map(|v| (name.clone(), v.to_string()))
                })
                .collect();
            group.add(Arc::new(HeadersHandler::new(pairs)));
        }

        if let Some(filter) = cfg.config().get("arg-filter") {
            let name = filter.as_str().ok_or_else(|| {
                Error::Validation(format!("invalid arg-filter: {filter}"))
            })?;
            let filter = self
                .arg_filters
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Key(format!("arg filter '{name}' not found")))?;
            group.add(Arc::new(ArgFilterHandler::new(filter, handler)));
        } else {
            group.add(handler);
        }

        Ok(cfg.add_validation(Arc::new(group)))
    }
}

/// The handler returned by [`Api::load`]: merges query and JSON-body
/// values into the request args, then dispatches into the tree.
struct ApiRootHandler {
    group: HandlerGroup,
}

#[async_trait]
impl RequestHandler for ApiRootHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let pairs: Vec<(String, String)> = req.uri().query().to_vec();
        for (name, value) in pairs {
            req.insert_arg(&name, Value::from(value));
        }

        let body: Option<Map<String, Value>> =
            req.json_message()?.and_then(|m| m.as_object().cloned());
        if let Some(body) = body {
            for (name, value) in body {
                req.insert_arg(&name, value);
            }
        }

        self.group.handle(req).await
    }
}

/// Query endpoint: resolve the SQL against the request and stream the
/// projection back.
struct QueryEndpoint {
    options: Value,
    source: Arc<dyn QuerySource>,
    def: Arc<QueryDef>,
}

#[async_trait]
impl RequestHandler for QueryEndpoint {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let resolver = Resolver::for_request(&self.options, req);
        let sql = resolver.resolve_str(&self.def.sql, true);
        let (code, body) = self.def.exec(&self.source, &sql).await?;

        match body {
            Some(body) => req.reply_json(code, &body),
            None => req.reply(code),
        }
        Ok(true)
    }
}

/// Redirect endpoint with request-time `{var}` resolution.
struct ResolvedRedirectHandler {
    options: Value,
    location: String,
    code: u16,
}

#[async_trait]
impl RequestHandler for ResolvedRedirectHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let location = if self.location.contains('{') {
            Resolver::for_request(&self.options, req).resolve_str(&self.location, false)
        } else {
            self.location.clone()
        };
        req.redirect(&location, self.code);
        Ok(true)
    }
}

/// WebSocket endpoint: upgrades and subscribes to its time-series.
struct WebsocketEndpoint {
    options: Value,
    ts_ref: Arc<TimeseriesRef>,
}

#[async_trait]
impl RequestHandler for WebsocketEndpoint {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let resolver = Resolver::for_request(&self.options, req);
        let handler = TimeseriesWsHandler::new(Arc::clone(&self.ts_ref), resolver);
        req.upgrade_websocket(Arc::new(handler))?;
        Ok(true)
    }
}

/// Require `jmpapi` to be at least 1.1.0.
fn check_version(config: &Value) -> Result<()> {
    let raw = config
        .get("jmpapi")
        .and_then(|v| v.as_str())
        .unwrap_or("0.0.0");

    // Pad to major.minor.patch
    let mut padded = raw.to_string();
    while padded.split('.').count() < 3 {
        padded.push_str(".0");
    }

    let version = semver::Version::parse(&padded)
        .map_err(|e| Error::Validation(format!("invalid jmpapi version '{raw}': {e}")))?;
    let min = semver::Version::new(1, 1, 0);
    if version < min {
        return Err(Error::Validation(format!("API version must be at least {min}")));
    }
    Ok(())
}

/// The named APIs in the config: `apis`, a single `api`, or a bare
/// top-level `endpoints` dict.
fn collect_apis(config: &Value) -> Result<Vec<(String, Value)>> {
    if let Some(apis) = config.get("apis") {
        let map = apis
            .as_object()
            .ok_or_else(|| Error::Validation("'apis' is not a dict".into()))?;
        return Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    }

    if let Some(api) = config.get("api") {
        return Ok(vec![(String::new(), api.clone())]);
    }

    if config.get("endpoints").is_some() {
        return Ok(vec![(String::new(), config.clone())]);
    }

    Err(Error::Validation("API config has no 'api', 'apis' or 'endpoints'".into()))
}

/// The endpoint type tag for one config node.
fn endpoint_type(config: &Value) -> Result<String> {
    if config.get("handlers").is_some() {
        return Err(Error::Validation("nested handlers not allowed".into()));
    }

    if let Some(ty) = config.get("handler").and_then(|v| v.as_str()) {
        if !ty.is_empty() {
            return Ok(ty.to_string());
        }
    }

    for (key, ty) in [
        ("bind", "bind"),
        ("timeseries", "timeseries"),
        ("sql", "query"),
        ("query", "query"),
        ("path", "file"),
        ("resource", "resource"),
    ] {
        if config.get(key).is_some() {
            return Ok(ty.to_string());
        }
    }

    Ok("pass".to_string())
}

/// Endpoint types with their configs; a `handlers` list composes in
/// order.
fn endpoint_types(config: &Value) -> Result<Vec<(String, Value)>> {
    if let Some(handlers) = config.get("handlers") {
        if config.get("handler").is_some() {
            return Err(Error::Validation("cannot define both 'handler' and 'handlers'".into()));
        }
        let list = handlers
            .as_array()
            .ok_or_else(|| Error::Validation("'handlers' is not a list".into()))?;

        let mut types = Vec::with_capacity(list.len());
        for handler in list {
            let handler = match handler {
                Value::String(bind) => {
                    let mut map = Map::new();
                    map.insert("bind".into(), Value::from(bind.clone()));
                    Value::Object(map)
                }
                other => other.clone(),
            };
            types.push((endpoint_type(&handler)?, handler));
        }
        return Ok(types);
    }

    Ok(vec![(endpoint_type(config)?, config.clone())])
}

fn cors_from_config(config: &Value) -> CorsHandler {
    let mut cors = CorsHandler::default();

    match config.get("origins") {
        Some(Value::String(origin)) => cors.origins = vec![origin.clone()],
        Some(Value::Array(origins)) => {
            cors.origins = origins
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        _ => {}
    }
    if let Some(methods) = config.get("methods").and_then(|v| v.as_str()) {
        cors.methods = methods.to_string();
    }
    if let Some(headers) = config.get("headers").and_then(|v| v.as_str()) {
        cors.headers = headers.to_string();
    }
    if let Some(max_age) = config.get("max-age").and_then(|v| v.as_u64()) {
        cors.max_age = Some(max_age);
    }
    if let Some(credentials) = config.get("credentials").and_then(|v| v.as_bool()) {
        cors.credentials = credentials;
    }

    cors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use specgate_http::SessionConfig;

    fn api() -> Api {
        Api::new(ApiContext {
            options: json!({}),
            sessions: Arc::new(SessionManager::new(SessionConfig::default())),
            connector: None,
            store: None,
            client: None,
            providers: Arc::new(OAuth2Providers::default()),
        })
    }

    #[test]
    fn version_gate() {
        assert!(check_version(&json!({"jmpapi": "1.1.0"})).is_ok());
        assert!(check_version(&json!({"jmpapi": "2.0.0"})).is_ok());
        assert!(check_version(&json!({"jmpapi": "1.1"})).is_ok());
        assert!(check_version(&json!({"jmpapi": "1.0.0"})).is_err());
        assert!(check_version(&json!({})).is_err());
        assert!(check_version(&json!({"jmpapi": "banana"})).is_err());
    }

    #[test]
    fn endpoint_type_inference() {
        assert_eq!(endpoint_type(&json!({"handler": "login"})).unwrap(), "login");
        assert_eq!(endpoint_type(&json!({"bind": "x"})).unwrap(), "bind");
        assert_eq!(endpoint_type(&json!({"sql": "SELECT 1"})).unwrap(), "query");
        assert_eq!(endpoint_type(&json!({"query": "getUser"})).unwrap(), "query");
        assert_eq!(endpoint_type(&json!({"timeseries": "load"})).unwrap(), "timeseries");
        assert_eq!(endpoint_type(&json!({"path": "/srv/www"})).unwrap(), "file");
        assert_eq!(endpoint_type(&json!({"resource": "index.html"})).unwrap(), "resource");
        assert_eq!(endpoint_type(&json!({})).unwrap(), "pass");

        // Inference order: bind wins over sql
        assert_eq!(endpoint_type(&json!({"bind": "x", "sql": "y"})).unwrap(), "bind");
    }

    #[test]
    fn handlers_list_composition() {
        let types = endpoint_types(&json!({
            "handlers": [
                {"handler": "cors"},
                "myBind",
                {"sql": "SELECT 1"},
            ]
        }))
        .unwrap();
        let names: Vec<&str> = types.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(names, vec!["cors", "bind", "query"]);

        assert!(endpoint_types(&json!({"handler": "pass", "handlers": []})).is_err());
        assert!(endpoint_type(&json!({"handlers": [{"handlers": []}]})).is_err());
    }

    #[test]
    fn double_bind_conflicts() {
        let api = api();
        api.bind("cb", Arc::new(PassHandler)).unwrap();
        assert!(api.bind("cb", Arc::new(PassHandler)).is_err());
    }

    #[test]
    fn load_requires_version() {
        let api = api();
        let err = api.load(&json!({"endpoints": {}})).err().expect("expected error");
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn load_twice_fails() {
        let api = api();
        api.load(&json!({"jmpapi": "1.1.0", "endpoints": {}})).unwrap();
        assert!(api.load(&json!({"jmpapi": "1.1.0", "endpoints": {}})).is_err());
    }

    #[test]
    fn query_endpoints_require_connector() {
        let api = api();
        let err = api
            .load(&json!({
                "jmpapi": "1.1.0",
                "endpoints": {"/x": {"GET": {"sql": "SELECT 1"}}}
            }))
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("connector"));
    }

    #[test]
    fn unknown_handler_rejected() {
        let api = api();
        let err = api
            .load(&json!({
                "jmpapi": "1.1.0",
                "endpoints": {"/x": {"GET": {"handler": "teleport"}}}
            }))
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("teleport"));
    }
}
