//! URL pattern compiler.
//!
//! `{name}` captures one path segment, `{name:int|uint|hex}` constrains
//! the segment, `{name:path}` captures the rest of the path, and a fixed
//! trailing `.ext` is optional in the URI.

use regex::Regex;

use specgate_core::{Error, Result};

/// A compiled URL pattern with named captures.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    pattern: String,
    re: Regex,
    groups: Vec<String>,
}

impl UrlPattern {
    /// Compile a pattern.  `prefix` patterns also match any continuation
    /// of the path, for subtree routing.
    pub fn compile(pattern: &str, prefix: bool) -> Result<UrlPattern> {
        let (source, groups) = to_regex(pattern, prefix)?;
        let re = Regex::new(&source)
            .map_err(|e| Error::Parse(format!("invalid URL pattern '{pattern}': {e}")))?;

        Ok(UrlPattern { pattern: pattern.to_string(), re, groups })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Names captured by this pattern, in order of appearance.
    pub fn group_names(&self) -> &[String] {
        &self.groups
    }

    /// Match `path`, returning captures in group order.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let caps = self.re.captures(path)?;
        Some(
            self.groups
                .iter()
                .filter_map(|name| {
                    caps.name(name).map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }

    /// Substitute captured values back into the pattern.
    pub fn substitute(&self, args: &[(String, String)]) -> String {
        let mut out = self.pattern.clone();
        for (name, value) in args {
            for candidate in
                [format!("{{{name}}}"), format!("{{{name}:int}}"), format!("{{{name}:uint}}"),
                 format!("{{{name}:hex}}"), format!("{{{name}:path}}")]
            {
                if out.contains(&candidate) {
                    out = out.replace(&candidate, value);
                }
            }
        }
        out
    }
}

fn to_regex(pattern: &str, prefix: bool) -> Result<(String, Vec<String>)> {
    let mut source = String::from("^");
    let mut groups = Vec::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut spec = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    spec.push(c);
                }

                let (name, kind) = match spec.split_once(':') {
                    Some((n, k)) => (n, k),
                    None => (spec.as_str(), ""),
                };

                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(Error::Parse(format!(
                        "invalid capture name '{name}' in pattern '{pattern}'"
                    )));
                }

                let sub = match kind {
                    "" => "[^/]+",
                    "int" => "[-+]?[0-9]+",
                    "uint" => "[0-9]+",
                    "hex" => "[0-9a-fA-F]+",
                    "path" => ".+",
                    other => {
                        return Err(Error::Parse(format!(
                            "unknown capture type '{other}' in pattern '{pattern}'"
                        )))
                    }
                };

                source.push_str(&format!("(?P<{name}>{sub})"));
                groups.push(name.to_string());
            }

            '.' => {
                // A literal trailing extension is optional in the URI
                let rest: String = chars.clone().collect();
                if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()) {
                    let ext: String = chars.by_ref().collect();
                    source.push_str(&format!("(?:\\.{})?", regex::escape(&ext)));
                } else {
                    source.push_str("\\.");
                }
            }

            _ => source.push_str(&regex::escape(&c.to_string())),
        }
    }

    if prefix {
        source.push_str(".*");
    }
    source.push('$');

    Ok((source, groups))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_segment_capture() {
        let pattern = UrlPattern::compile("/users/{id}", false).unwrap();
        let caps = pattern.matches("/users/42").unwrap();
        assert_eq!(caps, vec![("id".to_string(), "42".to_string())]);
        assert!(pattern.matches("/users/42/files").is_none());
        assert!(pattern.matches("/users/").is_none());
    }

    #[test]
    fn typed_captures() {
        let pattern = UrlPattern::compile("/users/{id:uint}", false).unwrap();
        assert!(pattern.matches("/users/42").is_some());
        assert!(pattern.matches("/users/-42").is_none());
        assert!(pattern.matches("/users/ann").is_none());

        let pattern = UrlPattern::compile("/blobs/{hash:hex}", false).unwrap();
        assert!(pattern.matches("/blobs/deadBEEF09").is_some());
        assert!(pattern.matches("/blobs/xyz").is_none());

        let pattern = UrlPattern::compile("/offsets/{n:int}", false).unwrap();
        assert!(pattern.matches("/offsets/-7").is_some());
    }

    #[test]
    fn path_capture_takes_remainder() {
        let pattern = UrlPattern::compile("/files/{rest:path}", false).unwrap();
        let caps = pattern.matches("/files/a/b/c.txt").unwrap();
        assert_eq!(caps[0].1, "a/b/c.txt");
    }

    #[test]
    fn optional_extension() {
        let pattern = UrlPattern::compile("/report.json", false).unwrap();
        assert!(pattern.matches("/report.json").is_some());
        assert!(pattern.matches("/report").is_some());
        assert!(pattern.matches("/report.xml").is_none());
    }

    #[test]
    fn prefix_matches_subtree() {
        let pattern = UrlPattern::compile("/api", true).unwrap();
        assert!(pattern.matches("/api/users").is_some());
        assert!(pattern.matches("/api").is_some());
        assert!(pattern.matches("/apix").is_some());
    }

    #[test]
    fn substitution_rebuilds_matching_string() {
        let pattern = UrlPattern::compile("/users/{id:uint}/files/{rest:path}", false).unwrap();
        let caps = pattern.matches("/users/7/files/docs/readme.md").unwrap();
        let rebuilt = pattern.substitute(&caps);
        assert_eq!(rebuilt, "/users/7/files/docs/readme.md");
        assert!(pattern.matches(&rebuilt).is_some());
    }

    #[test]
    fn multiple_captures_ordered() {
        let pattern = UrlPattern::compile("/a/{x}/b/{y}", false).unwrap();
        let caps = pattern.matches("/a/1/b/2").unwrap();
        assert_eq!(caps[0].0, "x");
        assert_eq!(caps[1].0, "y");
    }
}
