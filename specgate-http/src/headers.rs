//! Ordered case-insensitive header multimap.

use std::fmt;

use specgate_core::{Error, Result};

/// HTTP headers: an ordered multimap with case-insensitive names.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace any existing values for `name` with one value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    /// Append a value without replacing existing ones.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a header block: `Name: value` lines, with obs-fold
    /// continuation lines appended to the previous value.
    pub fn parse(block: &str) -> Result<Headers> {
        let mut headers = Headers::new();

        for line in block.split("\r\n") {
            if line.is_empty() {
                continue;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                match headers.entries.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                        continue;
                    }
                    None => return Err(Error::Parse("header continuation without header".into())),
                }
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("invalid header line '{line}'")))?;

            if name.is_empty() || name.contains(' ') {
                return Err(Error::Parse(format!("invalid header name '{name}'")));
            }

            headers.entries.push((name.to_string(), value.trim().to_string()));
        }

        Ok(headers)
    }

    /// True when `Connection` carries the `keep-alive` token.
    pub fn connection_keep_alive(&self) -> bool {
        self.connection_has("keep-alive")
    }

    /// True when `Connection` carries the `close` token.
    pub fn needs_close(&self) -> bool {
        self.connection_has("close")
    }

    fn connection_has(&self, token: &str) -> bool {
        self.get_all("Connection").iter().any(|value| {
            value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }

    /// True when `Connection` carries the `upgrade` token.
    pub fn connection_upgrade(&self) -> bool {
        self.connection_has("upgrade")
    }

    pub fn has_content_type(&self) -> bool {
        self.contains("Content-Type")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type").map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    pub fn is_json_content_type(&self) -> bool {
        matches!(self.content_type(), Some(t) if t.eq_ignore_ascii_case("application/json"))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

/// Content types guessed from a URI extension.
pub fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "html" | "htm" => Some("text/html"),
        "txt" => Some("text/plain"),
        "css" => Some("text/css"),
        "js" => Some("text/javascript"),
        "json" => Some("application/json"),
        "xml" => Some("application/xml"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        "ico" => Some("image/x-icon"),
        "pdf" => Some("application/pdf"),
        "wasm" => Some("application/wasm"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_lookup() {
        let headers =
            Headers::parse("Host: example.com\r\nContent-Type: application/json\r\nX-Tag: a\r\nX-Tag: b\r\n")
                .unwrap();

        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.get_all("x-tag"), vec!["a", "b"]);
        assert!(headers.is_json_content_type());
    }

    #[test]
    fn obs_fold_continuation() {
        let headers = Headers::parse("X-Long: part one\r\n part two\r\n").unwrap();
        assert_eq!(headers.get("X-Long"), Some("part one part two"));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Headers::parse("no colon here\r\n").is_err());
        assert!(Headers::parse(": empty name\r\n").is_err());
        assert!(Headers::parse(" leading fold\r\n").is_err());
    }

    #[test]
    fn connection_tokens() {
        let headers = Headers::parse("Connection: keep-alive, Upgrade\r\n").unwrap();
        assert!(headers.connection_keep_alive());
        assert!(headers.connection_upgrade());
        assert!(!headers.needs_close());

        let headers = Headers::parse("Connection: close\r\n").unwrap();
        assert!(headers.needs_close());
    }

    #[test]
    fn serialize_parse_round_trip() {
        let mut headers = Headers::new();
        headers.set("Host", "example.com");
        headers.insert("X-Tag", "one");
        headers.insert("X-Tag", "two");
        headers.set("Content-Length", "0");

        let parsed = Headers::parse(&headers.to_string()).unwrap();
        let original: Vec<_> = headers.iter().collect();
        let round: Vec<_> = parsed.iter().collect();
        assert_eq!(original, round);
    }

    #[test]
    fn content_type_parameters_ignored() {
        let headers = Headers::parse("Content-Type: application/json; charset=utf-8\r\n").unwrap();
        assert!(headers.is_json_content_type());
        assert_eq!(headers.content_type(), Some("application/json"));
    }
}
