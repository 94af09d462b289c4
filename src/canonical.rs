//! Deterministic request canonicalization and hashing.
//!
//! The client and the gateway independently reduce an HTTP request to the same
//! canonical string and hash it with SHA-256. The resulting `requestHash` binds
//! a payment intent to exactly one request and anchors replay detection, so the
//! rules here must match byte-for-byte on both sides:
//!
//! - Method uppercased.
//! - Path with repeated `/` collapsed, one trailing `/` stripped (unless the
//!   path is `/`), leading `/` ensured.
//! - Query keys and values percent-encoded, pairs sorted by key, joined with `&`.
//! - JSON bodies (content type `application/json` or `*+json`, parameters
//!   stripped) re-serialized with recursively key-sorted [`stable_stringify`];
//!   anything else passes through as UTF-8 text.
//! - Final form: `METHOD\nPATH\nQUERY\nBODY\nCONTENT-TYPE` — five fields, four
//!   separators, empty fields stay empty.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Inputs of the canonical request string.
///
/// `query` carries decoded key/value pairs; `body` is the raw request body as
/// UTF-8 text (binary bodies are lossily decoded by the transport adapters
/// before they reach the protocol core).
#[derive(Debug, Clone, Default)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a [(String, String)],
    pub body: Option<&'a str>,
    pub content_type: Option<&'a str>,
}

/// SHA-256 of the input bytes, lowercase hex.
pub fn sha256_hex(input: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_ref());
    hex::encode(hasher.finalize())
}

/// Request hash used in the `V402-Request-Hash` header: SHA-256 of the UTF-8
/// canonical request string, lowercase hex.
pub fn request_hash(canonical: &str) -> String {
    sha256_hex(canonical)
}

/// Builds the canonical request string. Pure: equal inputs produce equal bytes.
pub fn canonicalize(input: &CanonicalRequest<'_>) -> String {
    let method = input.method.to_uppercase();
    let path = normalize_path(input.path);
    let query = sorted_query(input.query);
    // "application/json; charset=utf-8" and "application/json" must hash the same.
    let content_type = input
        .content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim())
        .unwrap_or("");

    let body = match input.body {
        None | Some("") => String::new(),
        Some(raw) if is_json_content_type(content_type) => {
            match serde_json::from_str::<Value>(raw) {
                Ok(parsed) => stable_stringify(&parsed),
                // Unparseable "JSON" falls back to the raw text.
                Err(_) => raw.to_string(),
            }
        }
        Some(raw) => raw.to_string(),
    };

    format!("{method}\n{path}\n{query}\n{body}\n{content_type}")
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type.starts_with("application/json") || content_type.contains("+json")
}

/// Path normalization shared by hashing and tool lookup.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn sorted_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<&(String, String)> = query.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Percent-encoding matched to JS `encodeURIComponent`, which leaves
/// `!`, `'`, `(`, `)` and `*` literal.
fn encode_component(input: &str) -> String {
    let mut out = urlencoding::encode(input).into_owned();
    for (escaped, literal) in [
        ("%21", "!"),
        ("%27", "'"),
        ("%28", "("),
        ("%29", ")"),
        ("%2A", "*"),
    ] {
        if out.contains(escaped) {
            out = out.replace(escaped, literal);
        }
    }
    out
}

/// JSON serialization with recursively sorted object keys.
///
/// Output is independent of the key order of the input value, so two parties
/// parsing the same document always serialize it identically. Numbers render
/// in standard JSON decimal form (non-finite values cannot be represented in
/// [`serde_json::Value`] and arrive as `null` already).
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json string escaping is deterministic.
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_stable(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_get_without_body() {
        let q = query(&[("b", "2"), ("a", "1")]);
        let canonical = canonicalize(&CanonicalRequest {
            method: "get",
            path: "/api/tool",
            query: &q,
            body: None,
            content_type: None,
        });
        assert_eq!(canonical, "GET\n/api/tool\na=1&b=2\n\n");
    }

    #[test]
    fn test_canonical_is_deterministic() {
        let q1 = query(&[("b", "2"), ("a", "1")]);
        let q2 = query(&[("a", "1"), ("b", "2")]);
        let left = canonicalize(&CanonicalRequest {
            method: "GET",
            path: "/api/tool/",
            query: &q1,
            body: None,
            content_type: None,
        });
        let right = canonicalize(&CanonicalRequest {
            method: "get",
            path: "//api//tool",
            query: &q2,
            body: None,
            content_type: None,
        });
        assert_eq!(left, right);
        assert_eq!(request_hash(&left), request_hash(&right));
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("api/tool"), "/api/tool");
        assert_eq!(normalize_path("/api//tool/"), "/api/tool");
        assert_eq!(normalize_path("///"), "/");
    }

    #[test]
    fn test_query_encoding_and_order() {
        let q = query(&[("key b", "v 2"), ("a", "1")]);
        let canonical = canonicalize(&CanonicalRequest {
            method: "GET",
            path: "/x",
            query: &q,
            body: None,
            content_type: None,
        });
        assert_eq!(canonical, "GET\n/x\na=1&key%20b=v%202\n\n");
    }

    #[test]
    fn test_query_encoding_keeps_uri_component_literals() {
        // encodeURIComponent leaves !'()* literal; the canonical form must
        // agree across implementations.
        let q = query(&[("q", "it's (a) test!*"), ("p&q", "50%")]);
        let canonical = canonicalize(&CanonicalRequest {
            method: "GET",
            path: "/x",
            query: &q,
            body: None,
            content_type: None,
        });
        assert_eq!(canonical, "GET\n/x\np%26q=50%25&q=it's%20(a)%20test!*\n\n");
    }

    #[test]
    fn test_json_body_key_order_irrelevant() {
        let left = canonicalize(&CanonicalRequest {
            method: "POST",
            path: "/api/tool",
            query: &[],
            body: Some(r#"{"b":1,"a":2}"#),
            content_type: Some("application/json"),
        });
        let right = canonicalize(&CanonicalRequest {
            method: "POST",
            path: "/api/tool",
            query: &[],
            body: Some(r#"{"a":2,"b":1}"#),
            content_type: Some("application/json; charset=utf-8"),
        });
        // Same body part, but the content-type segment keeps its stripped value.
        assert!(left.contains("{\"a\":2,\"b\":1}"));
        assert!(right.contains("{\"a\":2,\"b\":1}"));
        assert_eq!(left, right);
    }

    #[test]
    fn test_malformed_json_body_falls_back_to_raw() {
        let canonical = canonicalize(&CanonicalRequest {
            method: "POST",
            path: "/x",
            query: &[],
            body: Some("{not json"),
            content_type: Some("application/json"),
        });
        assert_eq!(canonical, "POST\n/x\n\n{not json\napplication/json");
    }

    #[test]
    fn test_non_json_body_passes_through() {
        let canonical = canonicalize(&CanonicalRequest {
            method: "POST",
            path: "/x",
            query: &[],
            body: Some("hello world"),
            content_type: Some("text/plain"),
        });
        assert_eq!(canonical, "POST\n/x\n\nhello world\ntext/plain");
    }

    #[test]
    fn test_plus_json_content_type_is_json() {
        let canonical = canonicalize(&CanonicalRequest {
            method: "POST",
            path: "/x",
            query: &[],
            body: Some(r#"{"z":1,"a":[3,{"y":0,"x":1}]}"#),
            content_type: Some("application/vnd.api+json"),
        });
        assert!(canonical.contains(r#"{"a":[3,{"x":1,"y":0}],"z":1}"#));
    }

    #[test]
    fn test_stable_stringify_idempotent() {
        let raw = r#"{"b":1,"a":{"d":[1,2,{"z":true,"g":null}],"c":"x"}}"#;
        let parsed: Value = serde_json::from_str(raw).unwrap();
        let once = stable_stringify(&parsed);
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        let twice = stable_stringify(&reparsed);
        assert_eq!(once, twice);
        assert_eq!(once, r#"{"a":{"c":"x","d":[1,2,{"g":null,"z":true}]},"b":1}"#);
    }

    #[test]
    fn test_stable_stringify_scalars() {
        assert_eq!(stable_stringify(&Value::Null), "null");
        assert_eq!(stable_stringify(&serde_json::json!(true)), "true");
        assert_eq!(stable_stringify(&serde_json::json!(1.5)), "1.5");
        assert_eq!(stable_stringify(&serde_json::json!("a\"b")), r#""a\"b""#);
    }

    #[test]
    fn test_known_hash_shape() {
        let hash = request_hash("GET\n/api/tool\na=1&b=2\n\n");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
