//! OpenAPI 3.1 document emission.
//!
//! The loader feeds each endpoint into the builder as it walks the
//! config; `handler: spec` endpoints serve the result.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};

use specgate_core::Result;
use specgate_http::{Request, RequestHandler, UrlPattern};

use crate::args::ArgDict;

/// The document under construction, shared with spec endpoints.
#[derive(Clone)]
pub struct ApiSpec {
    doc: Arc<RwLock<Value>>,
}

impl ApiSpec {
    pub fn new(config: &Value) -> ApiSpec {
        let mut doc = Map::new();
        doc.insert("openapi".into(), json!("3.1.0"));
        if let Some(info) = config.get("info") {
            if info.is_object() {
                doc.insert("info".into(), info.clone());
            }
        }
        doc.insert("tags".into(), json!([]));
        doc.insert("paths".into(), json!({}));

        ApiSpec { doc: Arc::new(RwLock::new(Value::Object(doc))) }
    }

    /// Reinitialize the document from a loaded config, in place, so
    /// handlers already holding this spec see the update.
    pub fn reset(&self, config: &Value) {
        *self.doc.write() = ApiSpec::new(config).doc.read().clone();
    }

    /// Add a category tag unless the category is hidden.
    pub fn add_tag(&self, tag: &str, config: &Value) {
        if tag.is_empty() {
            return;
        }

        let mut tag_spec = Map::new();
        tag_spec.insert("name".into(), json!(tag));
        if let Some(help) = config.get("help").and_then(|v| v.as_str()) {
            tag_spec.insert("description".into(), json!(help));
        }

        let mut doc = self.doc.write();
        if let Some(tags) = doc.get_mut("tags").and_then(|v| v.as_array_mut()) {
            tags.push(Value::Object(tag_spec));
        }
    }

    /// Add one endpoint's methods under its URL pattern.
    pub fn add_endpoint(
        &self,
        methods_key: &str,
        category: &str,
        pattern: &str,
        config: &Value,
        args: Option<&Arc<ArgDict>>,
    ) {
        let url_args: HashSet<String> = UrlPattern::compile(pattern, false)
            .map(|p| p.group_names().iter().cloned().collect())
            .unwrap_or_default();

        let mut doc = self.doc.write();
        let Some(paths) = doc.get_mut("paths").and_then(|v| v.as_object_mut()) else { return };
        let path_spec = paths
            .entry(pattern.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(path_spec) = path_spec.as_object_mut() else { return };

        for method in methods_key.split('|').filter(|m| !m.is_empty()) {
            let mut method_spec = Map::new();

            if !category.is_empty() {
                method_spec.insert("tags".into(), json!([category]));
            }
            if let Some(help) = config.get("help").and_then(|v| v.as_str()) {
                method_spec.insert("description".into(), json!(help));
            }

            let mut parameters = Vec::new();
            let mut found: HashSet<String> = HashSet::new();

            if let Some(args) = args {
                for (name, spec) in args.iter() {
                    let mut param = Map::new();
                    param.insert("name".into(), json!(name));
                    param.insert(
                        "in".into(),
                        json!(if url_args.contains(name) { "path" } else { "query" }),
                    );
                    param.insert(
                        "required".into(),
                        json!(url_args.contains(name) || (!spec.optional && spec.default.is_none())),
                    );
                    if let Some(help) = &spec.help {
                        param.insert("description".into(), json!(help));
                    }
                    param.insert("schema".into(), json!({"type": spec.ty.schema_type()}));
                    parameters.push(Value::Object(param));
                    found.insert(name.to_string());
                }
            }

            // URL captures without a declared arg still document as path
            // parameters
            for name in UrlPattern::compile(pattern, false)
                .map(|p| p.group_names().to_vec())
                .unwrap_or_default()
            {
                if !found.contains(&name) {
                    parameters.push(json!({
                        "name": name,
                        "in": "path",
                        "required": true,
                        "schema": {"type": "string"},
                    }));
                }
            }

            method_spec.insert("parameters".into(), Value::Array(parameters));
            path_spec.insert(method.to_ascii_lowercase(), Value::Object(method_spec));
        }
    }

    pub fn to_value(&self) -> Value {
        self.doc.read().clone()
    }
}

/// `handler: spec`: serves the OpenAPI document.
pub struct SpecHandler {
    spec: ApiSpec,
}

impl SpecHandler {
    pub fn new(spec: ApiSpec) -> SpecHandler {
        SpecHandler { spec }
    }
}

#[async_trait]
impl RequestHandler for SpecHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        let doc = self.spec.to_value();
        req.reply_json(200, &doc);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skeleton() {
        let spec = ApiSpec::new(&json!({"info": {"title": "t", "version": "1.0"}}));
        let doc = spec.to_value();
        assert_eq!(doc["openapi"], "3.1.0");
        assert_eq!(doc["info"]["title"], "t");
        assert_eq!(doc["tags"], json!([]));
    }

    #[test]
    fn endpoint_parameters() {
        let spec = ApiSpec::new(&json!({}));
        let args = Arc::new(
            ArgDict::from_config(&json!({
                "id": {"type": "uint"},
                "limit": {"type": "uint", "default": 10},
            }))
            .unwrap(),
        );

        spec.add_endpoint(
            "GET|POST",
            "users",
            "/users/{id:uint}",
            &json!({"help": "Fetch a user"}),
            Some(&args),
        );

        let doc = spec.to_value();
        let get = &doc["paths"]["/users/{id:uint}"]["get"];
        assert_eq!(get["tags"], json!(["users"]));
        assert_eq!(get["description"], "Fetch a user");

        let params = get["parameters"].as_array().unwrap();
        let id = params.iter().find(|p| p["name"] == "id").unwrap();
        assert_eq!(id["in"], "path");
        assert_eq!(id["required"], json!(true));

        let limit = params.iter().find(|p| p["name"] == "limit").unwrap();
        assert_eq!(limit["in"], "query");
        assert_eq!(limit["required"], json!(false));

        assert!(doc["paths"]["/users/{id:uint}"]["post"].is_object());
    }

    #[test]
    fn undeclared_url_captures_documented() {
        let spec = ApiSpec::new(&json!({}));
        spec.add_endpoint("GET", "", "/files/{name}", &json!({}), None);

        let doc = spec.to_value();
        let params = doc["paths"]["/files/{name}"]["get"]["parameters"].as_array().unwrap();
        assert_eq!(params[0]["name"], "name");
        assert_eq!(params[0]["in"], "path");
    }
}
