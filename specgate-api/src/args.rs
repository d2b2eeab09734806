//! Declared endpoint arguments: typed validation from path, query, body,
//! header, cookie and session sources.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use specgate_core::{Error, Result};
use specgate_http::{HandlerRc, Request, RequestHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Int,
    Uint,
    Number,
    Bool,
    List,
    Dict,
}

impl ArgType {
    pub fn parse(name: &str) -> Result<ArgType> {
        match name {
            "string" => Ok(ArgType::String),
            "int" => Ok(ArgType::Int),
            "uint" => Ok(ArgType::Uint),
            "number" => Ok(ArgType::Number),
            "bool" => Ok(ArgType::Bool),
            "list" => Ok(ArgType::List),
            "dict" => Ok(ArgType::Dict),
            other => Err(Error::Validation(format!("unknown arg type '{other}'"))),
        }
    }

    /// The matching OpenAPI schema type.
    pub fn schema_type(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Int | ArgType::Uint => "integer",
            ArgType::Number => "number",
            ArgType::Bool => "boolean",
            ArgType::List => "array",
            ArgType::Dict => "object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSource {
    /// Routing args, then query, then the JSON body.
    Auto,
    Path,
    Query,
    Body,
    Header,
    Cookie,
    Session,
}

impl ArgSource {
    pub fn parse(name: &str) -> Result<ArgSource> {
        match name {
            "path" => Ok(ArgSource::Path),
            "query" => Ok(ArgSource::Query),
            "body" => Ok(ArgSource::Body),
            "header" => Ok(ArgSource::Header),
            "cookie" => Ok(ArgSource::Cookie),
            "session" => Ok(ArgSource::Session),
            other => Err(Error::Validation(format!("unknown arg source '{other}'"))),
        }
    }
}

/// One declared argument.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub ty: ArgType,
    pub default: Option<Value>,
    pub source: ArgSource,
    pub optional: bool,
    pub help: Option<String>,
}

impl ArgSpec {
    fn from_config(config: &Value) -> Result<ArgSpec> {
        let map = config
            .as_object()
            .ok_or_else(|| Error::Validation(format!("arg spec is not a dict: {config}")))?;

        let ty = match map.get("type").and_then(|v| v.as_str()) {
            Some(name) => ArgType::parse(name)?,
            None => ArgType::String,
        };
        let source = match map.get("source").and_then(|v| v.as_str()) {
            Some(name) => ArgSource::parse(name)?,
            None => ArgSource::Auto,
        };

        Ok(ArgSpec {
            ty,
            default: map.get("default").cloned(),
            source,
            optional: map.get("optional").and_then(|v| v.as_bool()).unwrap_or(false),
            help: map.get("help").and_then(|v| v.as_str()).map(str::to_string),
        })
    }
}

/// Ordered dictionary of declared arguments.
#[derive(Debug, Clone, Default)]
pub struct ArgDict {
    entries: Vec<(String, ArgSpec)>,
}

impl ArgDict {
    pub fn new() -> ArgDict {
        ArgDict::default()
    }

    /// Merge arg specs from a config dict; later entries replace earlier
    /// ones of the same name.
    pub fn load(&mut self, config: &Value) -> Result<()> {
        let map = config
            .as_object()
            .ok_or_else(|| Error::Validation(format!("args def is not a dict: {config}")))?;

        for (name, spec) in map {
            let spec = ArgSpec::from_config(spec)?;
            if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
                entry.1 = spec;
            } else {
                self.entries.push((name.clone(), spec));
            }
        }
        Ok(())
    }

    pub fn from_config(config: &Value) -> Result<ArgDict> {
        let mut dict = ArgDict::new();
        dict.load(config)?;
        Ok(dict)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgSpec)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate the request, inserting typed values into its args.
    pub fn validate(&self, req: &mut Request) -> Result<()> {
        for (name, spec) in &self.entries {
            let raw = lookup(req, name, spec.source)?;

            let value = match raw {
                Some(raw) => Some(coerce(name, raw, spec.ty)?),
                None => spec.default.clone(),
            };

            match value {
                Some(value) => req.set_arg(name, value),
                None if spec.optional => {}
                None => {
                    return Err(Error::Validation(format!("missing argument '{name}'")));
                }
            }
        }
        Ok(())
    }
}

fn lookup(req: &mut Request, name: &str, source: ArgSource) -> Result<Option<Value>> {
    let found = match source {
        ArgSource::Auto | ArgSource::Path => req.arg(name).cloned(),
        ArgSource::Query => req.uri().get(name).map(Value::from),
        ArgSource::Body => req.json_message()?.and_then(|m| m.get(name)).cloned(),
        ArgSource::Header => req.headers().get(name).map(Value::from),
        ArgSource::Cookie => req.cookie(name).map(Value::from),
        ArgSource::Session => req.session().and_then(|s| s.get(name)),
    };
    Ok(found)
}

fn coerce(name: &str, value: Value, ty: ArgType) -> Result<Value> {
    let fail = || Error::Validation(format!("argument '{name}' is not a valid {ty:?}"));

    match ty {
        ArgType::String => match value {
            Value::String(_) => Ok(value),
            other => Ok(Value::from(other.to_string())),
        },
        ArgType::Int => match &value {
            Value::Number(n) if n.as_i64().is_some() => Ok(value),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| fail()),
            _ => Err(fail()),
        },
        ArgType::Uint => match &value {
            Value::Number(n) if n.as_u64().is_some() => Ok(value),
            Value::String(s) => s.trim().parse::<u64>().map(Value::from).map_err(|_| fail()),
            _ => Err(fail()),
        },
        ArgType::Number => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s.trim().parse::<f64>().map(Value::from).map_err(|_| fail()),
            _ => Err(fail()),
        },
        ArgType::Bool => match &value {
            Value::Bool(_) => Ok(value),
            Value::Number(n) => Ok(Value::from(n.as_f64() != Some(0.0))),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::from(true)),
                "false" | "0" | "no" => Ok(Value::from(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        ArgType::List => match &value {
            Value::Array(_) => Ok(value),
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(Value::is_array)
                .ok_or_else(fail),
            _ => Err(fail()),
        },
        ArgType::Dict => match &value {
            Value::Object(_) => Ok(value),
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(Value::is_object)
                .ok_or_else(fail),
            _ => Err(fail()),
        },
    }
}

/// Validates declared args, then delegates.
pub struct ArgsHandler {
    dict: Arc<ArgDict>,
    child: HandlerRc,
}

impl ArgsHandler {
    pub fn new(dict: Arc<ArgDict>, child: HandlerRc) -> ArgsHandler {
        ArgsHandler { dict, child }
    }
}

#[async_trait]
impl RequestHandler for ArgsHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        self.dict.validate(req)?;
        self.child.handle(req).await
    }
}

/// Rewrites or vets arguments before the endpoint runs.
#[async_trait]
pub trait ArgFilter: Send + Sync {
    async fn filter(&self, req: &mut Request) -> Result<()>;
}

/// Applies a registered [`ArgFilter`], then delegates.
pub struct ArgFilterHandler {
    filter: Arc<dyn ArgFilter>,
    child: HandlerRc,
}

impl ArgFilterHandler {
    pub fn new(filter: Arc<dyn ArgFilter>, child: HandlerRc) -> ArgFilterHandler {
        ArgFilterHandler { filter, child }
    }
}

#[async_trait]
impl RequestHandler for ArgFilterHandler {
    async fn handle(&self, req: &mut Request) -> Result<bool> {
        self.filter.filter(req).await?;
        self.child.handle(req).await
    }
}
