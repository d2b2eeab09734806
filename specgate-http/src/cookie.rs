//! RFC 6265 cookies: the request `Cookie` header and `Set-Cookie`
//! responses with the attributes the gateway uses.

use chrono::{DateTime, TimeZone, Utc};

use specgate_core::{Error, Result};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// A cookie to be sent with `Set-Cookie`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Cookie {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            max_age: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    /// An expired empty cookie, used to clear `name` on the client.
    pub fn clear(name: impl Into<String>) -> Cookie {
        let mut cookie = Cookie::new(name, "");
        cookie.expires = Some(Utc.timestamp_opt(0, 0).unwrap());
        cookie.max_age = Some(0);
        cookie
    }

    /// The `Set-Cookie` header value.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);

        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(expires) = &self.expires {
            out.push_str("; Expires=");
            out.push_str(&expires.format(HTTP_DATE).to_string());
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if let Some(same_site) = &self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site);
        }

        out
    }

    /// Parse a `Set-Cookie` header value.
    pub fn parse(header: &str) -> Result<Cookie> {
        let mut parts = header.split(';');
        let pair = parts.next().unwrap_or("").trim();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Parse(format!("invalid cookie '{header}'")))?;
        if name.is_empty() {
            return Err(Error::Parse(format!("invalid cookie name in '{header}'")));
        }

        let mut cookie = Cookie::new(name.trim(), value.trim());

        for part in parts {
            let part = part.trim();
            let (attr, attr_value) = match part.split_once('=') {
                Some((a, v)) => (a.trim(), Some(v.trim())),
                None => (part, None),
            };

            match attr.to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = attr_value.map(str::to_string),
                "path" => cookie.path = attr_value.map(str::to_string),
                "expires" => {
                    let raw = attr_value
                        .ok_or_else(|| Error::Parse("Expires without value".into()))?;
                    let parsed = DateTime::parse_from_str(&format!("{raw} +0000"), "%a, %d %b %Y %H:%M:%S GMT %z")
                        .map_err(|e| Error::Parse(format!("invalid Expires '{raw}': {e}")))?;
                    cookie.expires = Some(parsed.with_timezone(&Utc));
                }
                "max-age" => {
                    let raw = attr_value
                        .ok_or_else(|| Error::Parse("Max-Age without value".into()))?;
                    cookie.max_age = Some(
                        raw.parse()
                            .map_err(|e| Error::Parse(format!("invalid Max-Age '{raw}': {e}")))?,
                    );
                }
                "httponly" => cookie.http_only = true,
                "secure" => cookie.secure = true,
                "samesite" => cookie.same_site = attr_value.map(str::to_string),
                _ => {}
            }
        }

        Ok(cookie)
    }
}

/// Parse a request `Cookie` header into name/value pairs.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_parse_round_trip() {
        let mut cookie = Cookie::new("sid", "abc123");
        cookie.domain = Some("example.com".to_string());
        cookie.path = Some("/".to_string());
        cookie.expires = Some(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap());
        cookie.max_age = Some(3600);
        cookie.http_only = true;
        cookie.secure = true;
        cookie.same_site = Some("Lax".to_string());

        let parsed = Cookie::parse(&cookie.to_header_value()).unwrap();
        assert_eq!(parsed, cookie);
    }

    #[test]
    fn minimal_cookie() {
        let cookie = Cookie::parse("sid=xyz").unwrap();
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "xyz");
        assert!(!cookie.http_only);
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let header = Cookie::clear("sid").to_header_value();
        assert!(header.starts_with("sid="));
        assert!(header.contains("Max-Age=0"));
        assert!(header.contains("Expires=Thu, 01 Jan 1970"));
    }

    #[test]
    fn request_header_pairs() {
        let pairs = parse_cookie_header("a=1; b=2; malformed; c=3");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }
}
