//! Endpoint configuration chain.
//!
//! As the loader walks the endpoint tree, patterns accumulate and each
//! node inherits (and may extend) its parent's declared args and access
//! rules. `add_validation` wraps an endpoint handler with the resulting
//! checks.

use std::sync::Arc;

use serde_json::Value;

use specgate_core::{Error, Result};
use specgate_http::{HandlerGroup, HandlerRc};

use crate::access::{AccessControl, AccessHandler};
use crate::args::{ArgDict, ArgsHandler};

/// Config state for one node of the endpoint tree.
#[derive(Clone)]
pub struct EndpointConfig {
    config: Value,
    pattern: String,
    args: Option<Arc<ArgDict>>,
    access: Option<Arc<AccessControl>>,
}

impl EndpointConfig {
    /// Build a node, inheriting from `parent` and applying this node's
    /// `args` / `allow` / `deny` keys. `lookup_args` resolves a string
    /// `args` reference to a registered args config.
    pub fn new(
        config: Value,
        pattern: String,
        parent: Option<&EndpointConfig>,
        lookup_args: &dyn Fn(&str) -> Result<Value>,
    ) -> Result<EndpointConfig> {
        let mut node = EndpointConfig {
            args: parent.and_then(|p| p.args.clone()),
            access: parent.and_then(|p| p.access.clone()),
            config,
            pattern,
        };

        if !node.config.is_object() {
            return Ok(node);
        }

        if let Some(args_config) = node.config.get("args") {
            let args_config = match args_config {
                Value::String(name) => lookup_args(name)?,
                other => other.clone(),
            };

            let mut dict = match &node.args {
                Some(parent_args) => (**parent_args).clone(),
                None => ArgDict::new(),
            };
            dict.load(&args_config)?;
            node.args = Some(Arc::new(dict));
        }

        if node.config.get("allow").is_some() || node.config.get("deny").is_some() {
            let mut acl = match &node.access {
                Some(parent_acl) => (**parent_acl).clone(),
                None => AccessControl::new(),
            };
            acl.read(&node.config);
            node.access = Some(Arc::new(acl));
        }

        Ok(node)
    }

    pub fn create_child(
        &self,
        config: Value,
        pattern_suffix: &str,
        lookup_args: &dyn Fn(&str) -> Result<Value>,
    ) -> Result<EndpointConfig> {
        EndpointConfig::new(
            config,
            format!("{}{}", self.pattern, pattern_suffix),
            Some(self),
            lookup_args,
        )
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn args(&self) -> Option<&Arc<ArgDict>> {
        self.args.as_ref()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u16(&self, key: &str) -> Result<Option<u16>> {
        match self.config.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| Error::Validation(format!("invalid '{key}': {value}"))),
        }
    }

    /// Wrap `handler` with arg validation and access control.
    ///
    /// At request time access is checked first, then args validate, then
    /// the handler runs.
    pub fn add_validation(&self, handler: HandlerRc) -> HandlerRc {
        let mut wrapped = handler;

        if let Some(args) = &self.args {
            wrapped = Arc::new(ArgsHandler::new(Arc::clone(args), wrapped));
        }

        if let Some(access) = &self.access {
            let mut group = HandlerGroup::new();
            group.add(Arc::new(AccessHandler::new(Arc::clone(access))));
            group.add(wrapped);
            wrapped = Arc::new(group);
        }

        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_lookup(name: &str) -> Result<Value> {
        Err(Error::Key(format!("args '{name}' not found")))
    }

    #[test]
    fn patterns_accumulate() {
        let root =
            EndpointConfig::new(json!({}), String::new(), None, &no_lookup).unwrap();
        let users = root.create_child(json!({}), "/users", &no_lookup).unwrap();
        let user = users.create_child(json!({}), "/{id:uint}", &no_lookup).unwrap();
        assert_eq!(user.pattern(), "/users/{id:uint}");
    }

    #[test]
    fn args_inherit_and_extend() {
        let root = EndpointConfig::new(
            json!({"args": {"limit": {"type": "uint", "optional": true}}}),
            String::new(),
            None,
            &no_lookup,
        )
        .unwrap();
        let child = root
            .create_child(
                json!({"args": {"id": {"type": "uint"}}}),
                "/x",
                &no_lookup,
            )
            .unwrap();

        let names: Vec<&str> = child.args().unwrap().iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["limit", "id"]);

        // Parent unchanged
        let names: Vec<&str> = root.args().unwrap().iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["limit"]);
    }

    #[test]
    fn named_args_reference() {
        let lookup = |name: &str| -> Result<Value> {
            if name == "pagination" {
                Ok(json!({"limit": {"type": "uint", "default": 10}}))
            } else {
                Err(Error::Key(format!("args '{name}' not found")))
            }
        };

        let node = EndpointConfig::new(
            json!({"args": "pagination"}),
            String::new(),
            None,
            &lookup,
        )
        .unwrap();
        assert!(!node.args().unwrap().is_empty());

        assert!(EndpointConfig::new(json!({"args": "nope"}), String::new(), None, &lookup)
            .is_err());
    }

    #[test]
    fn access_inherits() {
        let root = EndpointConfig::new(
            json!({"allow": "$admin"}),
            String::new(),
            None,
            &no_lookup,
        )
        .unwrap();
        let child = root.create_child(json!({}), "/x", &no_lookup).unwrap();
        assert!(child.access.is_some());
    }
}
