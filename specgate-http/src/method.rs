//! HTTP methods and method masks.

use std::fmt;

use specgate_core::{Error, Result};

/// An HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Connect,
    Trace,
}

impl Method {
    pub fn parse(s: &str) -> Result<Method> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "OPTIONS" => Ok(Method::Options),
            "CONNECT" => Ok(Method::Connect),
            "TRACE" => Ok(Method::Trace),
            other => Err(Error::Parse(format!("invalid HTTP method '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
        }
    }

    /// Bit for method-mask matching.
    pub fn mask(&self) -> u32 {
        1 << (*self as u32)
    }

    /// Whether a request with this method may carry a body.
    pub fn may_have_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Delete | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a `|`-separated method list into a mask.  Unknown tokens are
/// ignored; a zero result means no token named a method.
pub fn parse_method_mask(s: &str) -> u32 {
    let mut mask = 0;
    for token in s.split('|') {
        if let Ok(method) = Method::parse(token.trim()) {
            mask |= method.mask();
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_combinations() {
        let mask = parse_method_mask("GET|POST");
        assert_ne!(mask & Method::Get.mask(), 0);
        assert_ne!(mask & Method::Post.mask(), 0);
        assert_eq!(mask & Method::Delete.mask(), 0);
    }

    #[test]
    fn non_method_keys_have_empty_mask() {
        assert_eq!(parse_method_mask("args"), 0);
        assert_eq!(parse_method_mask("/users"), 0);
    }

    #[test]
    fn body_rules() {
        assert!(!Method::Get.may_have_body());
        assert!(!Method::Head.may_have_body());
        assert!(Method::Post.may_have_body());
        assert!(Method::Delete.may_have_body());
    }
}
