//! Access control: allow/deny sets over users and group tags.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use specgate_core::{Error, Result};
use specgate_http::{Request, RequestHandler};

/// Accumulated allow/deny rules.
///
/// Names are users; `$`- or `@`-prefixed names are group tags; `*` is
/// the wildcard. `authenticated` and `unauthenticated` are synthesized
/// from whether the request has a session with a user.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    user_allowed: HashSet<String>,
    user_denied: HashSet<String>,
    group_allowed: HashSet<String>,
    group_denied: HashSet<String>,
}

impl AccessControl {
    pub fn new() -> AccessControl {
        AccessControl::default()
    }

    /// Read `allow` and `deny` keys from an endpoint config.
    pub fn read(&mut self, config: &Value) {
        if let Some(allow) = config.get("allow") {
            self.read_names(allow, true);
        }
        if let Some(deny) = config.get("deny") {
            self.read_names(deny, false);
        }
    }

    fn read_names(&mut self, config: &Value, allow: bool) {
        match config {
            Value::Array(items) => {
                for item in items {
                    self.read_names(item, allow);
                }
            }
            Value::String(name) => self.add(name, allow),
            other => {
                if let Some(name) = other.as_str() {
                    self.add(name, allow);
                }
            }
        }
    }

    fn add(&mut self, name: &str, allow: bool) {
        if name.is_empty() {
            return;
        }

        if name == "*" {
            self.set_group("*", allow);
        } else if let Some(group) = name.strip_prefix('$').or_else(|| name.strip_prefix('@')) {
            self.set_group(group, allow);
        } else {
            self.set_user(name, allow);
        }
    }

    fn set_user(&mut self, name: &str, allow: bool) {
        if allow {
            self.user_allowed.insert(name.to_string());
        } else {
            self.user_denied.insert(name.to_string());
        }
    }

    fn set_group(&mut self, name: &str, allow: bool) {
        if allow {
            self.group_allowed.insert(name.to_string());
        } else {
            self.group_denied.insert(name.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user_allowed.is_empty()
            && self.user_denied.is_empty()
            && self.group_allowed.is_empty()
            && self.group_denied.is_empty()
    }

    fn check_group(&self, name: &str, allow: &mut bool, deny: &mut bool) -> bool {
        let mut matched = false;

        if !*allow && self.group_allowed.contains(name) {
            *allow = true;
            matched = true;
        }
        if !*deny && self.group_denied.contains(name) {
            *deny = true;
            matched = true;
        }

        matched
    }

    /// Evaluate the rules against a request's identity.
    pub fn check(&self, req: &Request) -> bool {
        let mut allow = false;
        let mut deny = false;
        let mut group = String::new();

        if self.check_group("*", &mut allow, &mut deny) {
            group = "@*".to_string();
        }

        let user = req.user().filter(|u| !u.is_empty());

        match (req.session(), &user) {
            (Some(session), Some(user)) => {
                if self.user_allowed.contains(user) {
                    allow = true;
                }
                if self.user_denied.contains(user) {
                    deny = true;
                }

                for name in session.groups() {
                    if self.check_group(&name, &mut allow, &mut deny) {
                        group = format!("@{name}");
                    }
                }

                if self.check_group("authenticated", &mut allow, &mut deny) {
                    group = "@authenticated".to_string();
                }
            }
            _ => {
                if self.check_group("unauthenticated", &mut allow, &mut deny) {
                    group = "@unauthenticated".to_string();
                }
            }
        }

        let granted = allow && !deny;
        let user = user.unwrap_or_else(|| "anonymous".to_string());
        let line = format!(
            "allow({}, {user}, {group}, {}) = {granted}",
            req.uri().path(),
            req.peer().ip()
        );
        if granted {
            debug!("{line}");
        } else {
            info!("{line}");
        }

        granted
    }
}

/// Rejects requests the rules do not grant; defers otherwise.
pub struct AccessHandler {
    acl: Arc<AccessControl>,
}

impl AccessHandler {
    pub fn new(acl: Arc<AccessControl>) -> AccessHandler {
        AccessHandler { acl }
    }
}

#[async_trait]
impl RequestHandler for AccessHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        if !self.acl.check(req) {
            return Err(Error::AccessDenied);
        }
        Ok(false)
    }
}
