//! `{path}` variable resolution.
//!
//! Strings in the API config and in SQL templates may reference a scope
//! of `args`, `options` and, at request time, `session` and `group`.
//! `{path:fmt}` applies a printf-like format; `:S` SQL-quotes; a leading
//! `~` resolves missing paths to JSON null instead of leaving the
//! reference in place.

use serde_json::{Map, Value};

use specgate_http::{Request, Session};

/// Variable scope for one resolution pass.
#[derive(Clone, Default)]
pub struct Resolver {
    vars: Map<String, Value>,
}

impl Resolver {
    /// Build-time scope: empty `args` plus the configured options.
    pub fn new(options: &Value) -> Resolver {
        let mut vars = Map::new();
        vars.insert("args".into(), Value::Object(Map::new()));
        vars.insert("options".into(), options.clone());
        Resolver { vars }
    }

    /// Request-time scope: the request's args and session.
    pub fn for_request(options: &Value, req: &Request) -> Resolver {
        let mut resolver = Resolver::new(options);
        resolver.set("args", Value::Object(req.args().clone()));
        if let Some(session) = req.session() {
            resolver.set_session(session);
        }
        resolver
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    pub fn set_session(&mut self, session: &Session) {
        let json = session.to_json();
        if let Some(group) = json.get("group") {
            self.vars.insert("group".into(), group.clone());
        }
        self.vars.insert("session".into(), json);
    }

    /// Look up a dotted path.  A leading `~` turns a miss into JSON null.
    pub fn select(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix('~') {
            return Some(self.select(rest).unwrap_or(Value::Null));
        }

        let mut current = None;
        for (i, part) in path.split('.').enumerate() {
            current = match i {
                0 => self.vars.get(part),
                _ => current.and_then(|value: &Value| value.get(part)),
            };
            current?;
        }
        current.cloned()
    }

    /// Substitute `{path}` / `{path:fmt}` references in `s`.
    ///
    /// In SQL context, unresolved references become `NULL` and bare
    /// string values are quoted; outside SQL the reference is left as
    /// written.
    pub fn resolve_str(&self, s: &str, sql: bool) -> String {
        let mut out = String::with_capacity(s.len());
        let mut chars = s.char_indices().peekable();

        while let Some((start, c)) = chars.next() {
            if c != '{' {
                out.push(c);
                continue;
            }

            let end = s[start..].find('}').map(|i| start + i);
            let Some(end) = end else {
                out.push_str(&s[start..]);
                break;
            };

            let reference = &s[start + 1..end];
            let (id, spec) = match reference.split_once(':') {
                Some((id, spec)) => (id, spec),
                None => (reference, ""),
            };

            if id.is_empty() || !is_reference(id) {
                out.push_str(&s[start..=end]);
            } else {
                match self.select(id) {
                    Some(value) => out.push_str(&format_value(&value, spec, sql)),
                    None if sql => out.push_str("NULL"),
                    None => out.push_str(&s[start..=end]),
                }
            }

            // Skip to the closing brace
            while let Some(&(i, _)) = chars.peek() {
                if end < i {
                    break;
                }
                chars.next();
            }
        }

        out
    }

    /// Resolve every string in a JSON tree, in place.
    pub fn resolve_value(&self, value: &mut Value, sql: bool) {
        match value {
            Value::String(s) => {
                if s.contains('{') {
                    *s = self.resolve_str(s, sql);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.resolve_value(item, sql);
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.resolve_value(item, sql);
                }
            }
            _ => {}
        }
    }
}

fn is_reference(id: &str) -> bool {
    id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '~' | '-'))
}

/// Quote a string for interpolation into SQL.
pub fn sql_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Render a value per an optional printf-like format spec.
fn format_value(value: &Value, spec: &str, sql: bool) -> String {
    if spec == "S" {
        return sql_quote(value_to_string(value).as_str());
    }

    if spec.is_empty() {
        return match value {
            Value::String(s) if sql => sql_quote(s),
            Value::Null if sql => "NULL".to_string(),
            other => value_to_string(other),
        };
    }

    // <width>[.<precision>]<conversion>
    let conversion = spec.chars().last().unwrap_or('s');
    let body = &spec[..spec.len() - conversion.len_utf8()];
    let (width, precision) = match body.split_once('.') {
        Some((w, p)) => (w.parse::<usize>().ok(), p.parse::<usize>().ok()),
        None => (body.parse::<usize>().ok(), None),
    };

    let rendered = match conversion {
        'd' | 'i' => format!("{}", value.as_i64().unwrap_or_default()),
        'u' => format!("{}", value.as_u64().unwrap_or_default()),
        'x' => format!("{:x}", value.as_u64().unwrap_or_default()),
        'f' => match precision {
            Some(p) => format!("{:.*}", p, value.as_f64().unwrap_or_default()),
            None => format!("{}", value.as_f64().unwrap_or_default()),
        },
        _ => value_to_string(value),
    };

    match width {
        Some(w) if rendered.len() < w => format!("{rendered:>w$}"),
        _ => rendered,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> Resolver {
        let mut r = Resolver::new(&json!({"db": {"name": "prod"}}));
        r.set("args", json!({"id": 42, "name": "ann", "note": null}));
        r
    }

    #[test]
    fn selects_dotted_paths() {
        let r = resolver();
        assert_eq!(r.select("args.id"), Some(json!(42)));
        assert_eq!(r.select("options.db.name"), Some(json!("prod")));
        assert_eq!(r.select("args.missing"), None);
        assert_eq!(r.select("~args.missing"), Some(Value::Null));
    }

    #[test]
    fn plain_substitution() {
        let r = resolver();
        assert_eq!(r.resolve_str("id={args.id}", false), "id=42");
        assert_eq!(r.resolve_str("hello {args.name}!", false), "hello ann!");
    }

    #[test]
    fn unknown_paths_stay_literal_outside_sql() {
        let r = resolver();
        assert_eq!(r.resolve_str("x={args.nope}", false), "x={args.nope}");
        assert_eq!(r.resolve_str("x={args.nope:d}", false), "x={args.nope:d}");
    }

    #[test]
    fn sql_context() {
        let r = resolver();
        assert_eq!(
            r.resolve_str("SELECT * FROM t WHERE name={args.name}", true),
            "SELECT * FROM t WHERE name='ann'"
        );
        assert_eq!(r.resolve_str("WHERE id={args.nope}", true), "WHERE id=NULL");
        assert_eq!(r.resolve_str("WHERE id={args.id}", true), "WHERE id=42");
    }

    #[test]
    fn explicit_sql_quote_spec() {
        let r = resolver();
        assert_eq!(r.resolve_str("{args.id:S}", false), "'42'");
        assert_eq!(r.resolve_str("{args.name:S}", true), "'ann'");
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(sql_quote("o'brien"), "'o''brien'");
        assert_eq!(sql_quote("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn printf_specs() {
        let r = resolver();
        assert_eq!(r.resolve_str("{args.id:x}", false), "2a");
        assert_eq!(r.resolve_str("{args.id:5d}", false), "   42");
    }

    #[test]
    fn deep_resolution() {
        let r = resolver();
        let mut value = json!({"a": "{args.id}", "b": ["{args.name}", 7]});
        r.resolve_value(&mut value, false);
        assert_eq!(value, json!({"a": "42", "b": ["ann", 7]}));
    }

    #[test]
    fn braces_without_reference_left_alone() {
        let r = resolver();
        assert_eq!(r.resolve_str("fn() { return; }", false), "fn() { return; }");
    }
}
