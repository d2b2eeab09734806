//! Login, logout and session endpoints.
//!
//! `provider=none` authenticates the session directly; any other
//! provider goes through the OAuth2 redirect/callback dance. An optional
//! login query augments the session from the database.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use specgate_core::{Error, Result};
use specgate_http::{Cookie, HttpClient, Request, RequestHandler, Session, SessionManager};

use crate::oauth2::OAuth2Providers;
use crate::query::{QueryDef, QueryEvent, QuerySource};
use crate::resolver::Resolver;

/// Shared dependencies of the login-family endpoints.
pub struct LoginContext {
    pub options: Value,
    pub sessions: Arc<SessionManager>,
    pub source: Option<Arc<dyn QuerySource>>,
    pub client: Option<Arc<HttpClient>>,
    pub providers: Arc<OAuth2Providers>,
}

impl LoginContext {
    fn session_cookie(&self, req: &Request, sid: &str) -> Cookie {
        let mut cookie = Cookie::new(self.sessions.cookie_name(), sid);
        cookie.path = Some("/".to_string());
        cookie.http_only = true;
        cookie.secure = req.is_secure();
        cookie.same_site = Some("Lax".to_string());
        cookie
    }

    /// The request's session, or a fresh one with its cookie set.
    fn get_or_open_session(&self, req: &mut Request) -> Session {
        if let Some(session) = req.session() {
            return session.clone();
        }

        let session = self.sessions.open_session(req.peer().ip());
        req.set_cookie(&self.session_cookie(req, session.id()));
        req.set_session(session.clone());
        session
    }
}

/// Run the login query and fold its results into the session.
///
/// Rows of the first result set set session keys (name, value); rows of
/// later result sets add the session to the group named by their first
/// column.
async fn run_login_query(
    source: &Arc<dyn QuerySource>,
    query: &QueryDef,
    resolver: &Resolver,
    session: &Session,
) -> Result<()> {
    let sql = resolver.resolve_str(&query.sql, true);
    debug!("login query: {sql}");
    let mut events = source.query(&sql).await?;
    let mut result_index = 0usize;

    while let Some(event) = events.recv().await {
        match event {
            QueryEvent::Row(values) => {
                if result_index == 0 {
                    let name = values
                        .first()
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            Error::Validation("login query returned a non-string key".into())
                        })?
                        .to_string();
                    let value = values.get(1).cloned().unwrap_or(Value::Null);
                    session.insert(name, value);
                } else if let Some(group) = values.first().and_then(|v| v.as_str()) {
                    session.add_group(group);
                }
            }
            QueryEvent::EndResult => result_index += 1,
            QueryEvent::Done => return Ok(()),
            QueryEvent::Error(db_error) => {
                return Err(Error::Upstream(format!("login query failed: {}", db_error.message)))
            }
            QueryEvent::BeginResult { .. } => {}
        }
    }

    Ok(())
}

/// `handler: login`.
pub struct LoginHandler {
    ctx: Arc<LoginContext>,
    query: Option<Arc<QueryDef>>,
}

impl LoginHandler {
    pub fn new(ctx: Arc<LoginContext>, query: Option<Arc<QueryDef>>) -> LoginHandler {
        LoginHandler { ctx, query }
    }

    fn provider_name(&self, req: &mut Request, session: &Session) -> String {
        if let Some(name) = req.arg("provider").and_then(|v| v.as_str()) {
            return name.to_string();
        }
        if let Some(name) = req.uri().get("provider") {
            return name.to_string();
        }
        if let Ok(Some(msg)) = req.json_message() {
            if let Some(name) = msg.get("provider").and_then(|v| v.as_str()) {
                return name.to_string();
            }
        }
        // A callback leg carries no provider argument; it was recorded
        // when the flow started
        session
            .get("login_provider")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "none".to_string())
    }

    async fn login_complete(&self, req: &mut Request, session: Session) -> Result<bool> {
        session.add_group("authenticated");
        session.remove("login_provider");

        if let Some(query) = &self.query {
            let source = self.ctx.source.as_ref().ok_or_else(|| {
                Error::NotImplemented("login query without a DB connector".into())
            })?;
            let resolver = Resolver::for_request(&self.ctx.options, req);
            run_login_query(source, query, &resolver, &session).await?;
        }

        req.reply_json(200, &session.to_json());
        Ok(true)
    }

    fn normalize_profile(profile: &mut Value) {
        let Some(map) = profile.as_object_mut() else { return };

        // Facebook profiles carry no avatar URL
        if map.get("provider").and_then(|v| v.as_str()) == Some("facebook") {
            if let Some(id) = map.get("id").and_then(|v| v.as_str()) {
                map.insert(
                    "avatar".into(),
                    Value::from(format!("http://graph.facebook.com/{id}/picture?type=small")),
                );
            }
        }

        // GitHub omits the display name for some accounts
        let name_missing = map
            .get("name")
            .and_then(|v| v.as_str())
            .map(|n| n.trim().is_empty())
            .unwrap_or(true);
        if name_missing {
            if let Some(login) = map.get("login").and_then(|v| v.as_str()) {
                map.insert("name".into(), Value::from(login.to_string()));
            }
        }
    }

    fn fill_session(session: &Session, profile: &Value) -> Result<()> {
        let email = profile
            .get("email")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::AccessDenied)?;

        session.set_user(email);
        for key in ["provider", "name", "avatar"] {
            if let Some(value) = profile.get(key) {
                session.insert(key, value.clone());
            }
        }
        if let Some(id) = profile.get("id") {
            session.insert("provider_id", id.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for LoginHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let session = self.ctx.get_or_open_session(req);
        let provider_name = self.provider_name(req, &session);

        if provider_name == "none" {
            return self.login_complete(req, session).await;
        }

        let provider = self
            .ctx
            .providers
            .get(&provider_name)
            .filter(|p| p.is_configured())
            .ok_or_else(|| {
                Error::Validation(format!("unsupported login provider: {provider_name}"))
            })?;

        let client = self.ctx.client.as_ref().ok_or_else(|| {
            Error::NotImplemented("OAuth2 login without an HTTP client".into())
        })?;

        // Provider callback leg
        if let Some(state) = req.uri().get("state") {
            if state != session.id() {
                warn!("OAuth2 state mismatch for session {}", session.id());
                return Err(Error::AccessDenied);
            }
            let code = req
                .uri()
                .get("code")
                .ok_or_else(|| Error::Validation("missing OAuth2 code".into()))?
                .to_string();

            let mut profile =
                provider.verify(client, &code, req.uri().path()).await?;
            Self::normalize_profile(&mut profile);
            debug!("login profile: {profile}");
            Self::fill_session(&session, &profile)?;
            return self.login_complete(req, session).await;
        }

        // First leg: reply with the session id and the provider URL
        let redirect = provider.authorize_url(req.uri().path(), session.id());
        session.insert("login_provider", Value::from(provider_name));
        if let Some(redirect_uri) = req.uri().get("redirect_uri") {
            session.insert("redirect_uri", Value::from(redirect_uri.to_string()));
        }

        let mut body = Map::new();
        body.insert("id".into(), Value::from(session.id().to_string()));
        body.insert("redirect".into(), Value::from(redirect.to_string()));
        req.reply_json(200, &Value::Object(body));
        Ok(true)
    }
}

/// `handler: logout`: closes the session and clears its cookie.
pub struct LogoutHandler {
    ctx: Arc<LoginContext>,
}

impl LogoutHandler {
    pub fn new(ctx: Arc<LoginContext>) -> LogoutHandler {
        LogoutHandler { ctx }
    }
}

#[async_trait]
impl RequestHandler for LogoutHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        if let Some(sid) = req.cookie(self.ctx.sessions.cookie_name()) {
            self.ctx.sessions.close_session(&sid);
        }
        req.clear_session();
        req.set_cookie(&Cookie::clear(self.ctx.sessions.cookie_name()));
        req.reply(200);
        Ok(true)
    }
}

/// `handler: session`: replies with the current session.
pub struct SessionEndpoint;

#[async_trait]
impl RequestHandler for SessionEndpoint {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        match req.session() {
            Some(session) => {
                let json = session.to_json();
                req.reply_json(200, &json);
                Ok(true)
            }
            None => Err(Error::AccessDenied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FakeQuerySource, ResultSet};
    use bytes::Bytes;
    use serde_json::json;
    use specgate_http::{ConnWriter, Headers, Method, SessionConfig, Uri};

    fn request(method: Method, uri: &str, headers: &str, body: &[u8]) -> Request {
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

    fn ctx(source: Option<Arc<dyn QuerySource>>) -> Arc<LoginContext> {
        Arc::new(LoginContext {
            options: json!({}),
            sessions: Arc::new(SessionManager::new(SessionConfig::default())),
            source,
            client: None,
            providers: Arc::new(OAuth2Providers::default()),
        })
    }

    #[tokio::test]
    async fn provider_none_authenticates_and_sets_cookie() {
        let ctx = ctx(None);
        let handler = LoginHandler::new(Arc::clone(&ctx), None);

        let mut req = request(
            Method::Post,
            "/login",
            "Content-Type: application/json\r\n",
            br#"{"provider":"none"}"#,
        );
        assert!(handler.handle(&mut req).await.unwrap());

        assert_eq!(req.status(), 200);
        assert!(req.out_headers().get("Set-Cookie").unwrap().starts_with("sid="));

        let body: Value = serde_json::from_slice(req.out_body()).unwrap();
        assert_eq!(body["group"]["authenticated"], json!(true));

        // The session is live in the store
        let session = req.session().unwrap();
        assert!(ctx.sessions.has_session(session.id()));
    }

    #[tokio::test]
    async fn login_query_augments_session() {
        let source: Arc<dyn QuerySource> = Arc::new(FakeQuerySource::new(|_| {
            Ok(vec![
                ResultSet {
                    columns: vec!["name".into(), "value".into()],
                    rows: vec![
                        vec![json!("team"), json!("search")],
                        vec![json!("level"), json!(3)],
                    ],
                },
                ResultSet {
                    columns: vec!["group".into()],
                    rows: vec![vec![json!("ops")], vec![json!("oncall")]],
                },
            ])
        }));

        let ctx = ctx(Some(source));
        let query = Arc::new(QueryDef {
            sql: "CALL login({session.user:S})".into(),
            ret: crate::query::ReturnShape::Ok,
            fields: None,
        });
        let handler = LoginHandler::new(ctx, Some(query));

        let mut req = request(
            Method::Post,
            "/login",
            "Content-Type: application/json\r\n",
            br#"{"provider":"none"}"#,
        );
        handler.handle(&mut req).await.unwrap();

        let session = req.session().unwrap();
        assert_eq!(session.get("team"), Some(json!("search")));
        assert_eq!(session.get("level"), Some(json!(3)));
        assert!(session.has_group("ops"));
        assert!(session.has_group("oncall"));
        assert!(session.has_group("authenticated"));
    }

    #[tokio::test]
    async fn unknown_provider_rejected() {
        let handler = LoginHandler::new(ctx(None), None);
        let mut req = request(
            Method::Post,
            "/login",
            "Content-Type: application/json\r\n",
            br#"{"provider":"aol"}"#,
        );
        let err = handler.handle(&mut req).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn logout_clears_session() {
        let ctx = ctx(None);
        let login = LoginHandler::new(Arc::clone(&ctx), None);

        let mut req = request(
            Method::Post,
            "/login",
            "Content-Type: application/json\r\n",
            br#"{"provider":"none"}"#,
        );
        login.handle(&mut req).await.unwrap();
        let sid = req.session().unwrap().id().to_string();

        let logout = LogoutHandler::new(Arc::clone(&ctx));
        let mut req = request(Method::Post, "/logout", &format!("Cookie: sid={sid}\r\n"), b"");
        logout.handle(&mut req).await.unwrap();

        assert!(!ctx.sessions.has_session(&sid));
        let cookie = req.out_headers().get("Set-Cookie").unwrap();
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn session_endpoint() {
        let mut req = request(Method::Get, "/session", "", b"");
        assert_eq!(
            SessionEndpoint.handle(&mut req).await.unwrap_err().status_code(),
            401
        );

        let session = Session::new("s1".into(), "10.0.0.1".parse().unwrap());
        session.set_user("ann");
        let mut req = request(Method::Get, "/session", "", b"");
        req.set_session(session);
        assert!(SessionEndpoint.handle(&mut req).await.unwrap());
        let body: Value = serde_json::from_slice(req.out_body()).unwrap();
        assert_eq!(body["user"], "ann");
    }

    #[test]
    fn profile_normalization() {
        let mut profile = json!({"provider": "facebook", "id": "99", "email": "a@b.c", "name": "Ann"});
        LoginHandler::normalize_profile(&mut profile);
        assert_eq!(
            profile["avatar"],
            json!("http://graph.facebook.com/99/picture?type=small")
        );

        let mut profile = json!({"provider": "github", "login": "anndev", "email": "a@b.c", "name": "  "});
        LoginHandler::normalize_profile(&mut profile);
        assert_eq!(profile["name"], json!("anndev"));
    }
}
