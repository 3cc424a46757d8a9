//! `WWW-Authenticate` challenge parsing

use std::collections::HashMap;

/// Split `Digest realm="x", ...` into the scheme token and its parameter text
pub fn split_scheme(header: &str) -> (&str, &str) {
    let header = header.trim();
    match header.find(char::is_whitespace) {
        Some(idx) => (&header[..idx], header[idx..].trim_start()),
        None => (header, ""),
    }
}

/// Parse comma-separated `key=value` / `key="quoted, value"` parameters.
///
/// Keys are lower-cased; quotes around values are removed.
pub fn parse_auth_params(params: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escape_next = false;

    for ch in params.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escape_next = true,
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                insert_param(&mut out, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    insert_param(&mut out, &current);

    out
}

fn insert_param(out: &mut HashMap<String, String>, raw: &str) {
    let Some((key, value)) = raw.split_once('=') else {
        return;
    };
    let key = key.trim().to_ascii_lowercase();
    if key.is_empty() {
        return;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    out.insert(key, value.to_string());
}

/// Pick `auth` out of a qop list such as `"auth,auth-int"`
pub fn select_qop(offered: &str) -> Option<&'static str> {
    offered
        .split(',')
        .map(str::trim)
        .any(|q| q.eq_ignore_ascii_case("auth"))
        .then_some("auth")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("Digest realm=\"a\""), ("Digest", "realm=\"a\""));
        assert_eq!(split_scheme("  Basic   realm=\"b\" "), ("Basic", "realm=\"b\""));
        assert_eq!(split_scheme("Negotiate"), ("Negotiate", ""));
    }

    #[test]
    fn test_parse_params_with_quoted_commas() {
        let params = parse_auth_params(
            r#"realm="IP Camera(12345)", qop="auth,auth-int", nonce="4e5a", stale=FALSE"#,
        );
        assert_eq!(params.get("realm").map(String::as_str), Some("IP Camera(12345)"));
        assert_eq!(params.get("qop").map(String::as_str), Some("auth,auth-int"));
        assert_eq!(params.get("nonce").map(String::as_str), Some("4e5a"));
        assert_eq!(params.get("stale").map(String::as_str), Some("FALSE"));
    }

    #[test]
    fn test_select_qop() {
        assert_eq!(select_qop("auth,auth-int"), Some("auth"));
        assert_eq!(select_qop("auth-int"), None);
    }
}
