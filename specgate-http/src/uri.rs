//! Origin-form request URIs: path, query string and extension.

use std::fmt;

use specgate_core::{Error, Result};

/// A parsed origin-form URI (`/path?name=value&flag`).
#[derive(Debug, Clone, PartialEq)]
pub struct Uri {
    path: String,
    raw_query: String,
    query: Vec<(String, String)>,
}

impl Uri {
    pub fn parse(raw: &str) -> Result<Uri> {
        if raw.is_empty() {
            return Err(Error::Parse("empty URI".into()));
        }
        if !raw.starts_with('/') && raw != "*" {
            return Err(Error::Parse(format!("URI must be origin-form: '{raw}'")));
        }

        let (path, raw_query) = match raw.split_once('?') {
            Some((p, q)) => (p, q),
            None => (raw, ""),
        };

        let path = percent_decode(path)?;
        let query = url::form_urlencoded::parse(raw_query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Uri { path, raw_query: raw_query.to_string(), query })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    /// Query parameters in order of appearance.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// First query value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// File extension of the last path segment, without the dot.
    pub fn extension(&self) -> Option<&str> {
        let segment = self.path.rsplit('/').next()?;
        match segment.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
            _ => None,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw_query.is_empty() {
            f.write_str(&self.path)
        } else {
            write!(f, "{}?{}", self.path, self.raw_query)
        }
    }
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| Error::Parse(format!("invalid percent escape in '{s}'")))?;
                out.push(hex);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|_| Error::Parse(format!("URI is not UTF-8: '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_and_query() {
        let uri = Uri::parse("/users/42?fields=name&limit=10").unwrap();
        assert_eq!(uri.path(), "/users/42");
        assert_eq!(uri.get("fields"), Some("name"));
        assert_eq!(uri.get("limit"), Some("10"));
        assert_eq!(uri.get("missing"), None);
    }

    #[test]
    fn extension_detection() {
        assert_eq!(Uri::parse("/data.json").unwrap().extension(), Some("json"));
        assert_eq!(Uri::parse("/a/b.tar.gz").unwrap().extension(), Some("gz"));
        assert_eq!(Uri::parse("/users/42").unwrap().extension(), None);
        assert_eq!(Uri::parse("/.hidden").unwrap().extension(), None);
    }

    #[test]
    fn percent_decoding() {
        let uri = Uri::parse("/files/a%20b?q=x%2By").unwrap();
        assert_eq!(uri.path(), "/files/a b");
        assert_eq!(uri.get("q"), Some("x+y"));
    }

    #[test]
    fn plus_means_space_in_query_only() {
        let uri = Uri::parse("/p?q=a+b").unwrap();
        assert_eq!(uri.get("q"), Some("a b"));
    }

    #[test]
    fn rejects_non_origin_form() {
        assert!(Uri::parse("http://example.com/x").is_err());
        assert!(Uri::parse("").is_err());
        assert!(Uri::parse("/bad%zz").is_err());
    }
}
