//! Round-trip laws for the wire value types.

use proptest::prelude::*;

use specgate_http::{Cookie, Headers, UrlPattern};

fn header_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9-]{0,20}"
}

fn header_value() -> impl Strategy<Value = String> {
    // Visible ASCII with interior spaces, no leading/trailing whitespace
    "[!-~]([ -~]{0,30}[!-~])?"
}

proptest! {
    #[test]
    fn headers_parse_serialize_round_trip(
        entries in proptest::collection::vec((header_name(), header_value()), 0..8)
    ) {
        let mut headers = Headers::new();
        for (name, value) in &entries {
            headers.insert(name, value.clone());
        }

        let parsed = Headers::parse(&headers.to_string()).unwrap();
        let original: Vec<(String, String)> =
            headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect();
        let round: Vec<(String, String)> =
            parsed.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect();
        prop_assert_eq!(original, round);
    }

    #[test]
    fn cookie_round_trip(
        value in "[A-Za-z0-9_-]{0,32}",
        path in proptest::option::of("/[a-z0-9/]{0,10}"),
        max_age in proptest::option::of(0i64..1_000_000),
        http_only in any::<bool>(),
        secure in any::<bool>(),
    ) {
        let mut cookie = Cookie::new("sid", value);
        cookie.path = path;
        cookie.max_age = max_age;
        cookie.http_only = http_only;
        cookie.secure = secure;

        let parsed = Cookie::parse(&cookie.to_header_value()).unwrap();
        prop_assert_eq!(parsed, cookie);
    }

    #[test]
    fn pattern_substitution_rebuilds_match(
        id in 0u64..1_000_000,
        rest in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,3}",
    ) {
        let pattern = UrlPattern::compile("/users/{id:uint}/files/{rest:path}", false).unwrap();
        let path = format!("/users/{id}/files/{rest}");

        let captures = pattern.matches(&path).unwrap();
        let rebuilt = pattern.substitute(&captures);
        prop_assert_eq!(&rebuilt, &path);
        prop_assert!(pattern.matches(&rebuilt).is_some());
    }
}
