//! Canonical relay identifiers.
//!
//! Relays are listed by users and other relays in many spellings:
//! `"wss://nos.lol/"`, `nos.lol`, `https://nos.lol`, `[wss://nos.lol],`. All of
//! them must collapse to one pool key, `wss://nos.lol`.

use url::Url;

/// Characters that commonly wrap URLs pasted from JSON, markdown or lists.
const PRESENTATIONAL: &[char] = &['"', '\'', '`', ',', ';', '[', ']', '(', ')', '<', '>', '{', '}'];

/// Normalize a relay URL. Idempotent: `normalize(&normalize(x)) == normalize(x)`.
pub fn normalize(input: &str) -> String {
    let mut current = normalize_once(input);
    // Stripping a trailing slash can expose characters the first pass would
    // have trimmed, so run to a fixed point. Every pass after the first keeps
    // or shrinks the length, so this settles quickly.
    for _ in 0..8 {
        let next = normalize_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn normalize_once(input: &str) -> String {
    let (scheme, rest) = split_scheme(trim_presentational(input));
    let rest = trim_presentational(rest);
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let path = if path == "/" { "" } else { path };
    format!("{scheme}{}{path}", authority.to_ascii_lowercase())
}

/// Trim wrapping characters from both ends. Brackets around an IPv6 literal
/// (`[::1]:7777`) belong to the host and stay.
fn trim_presentational(s: &str) -> &str {
    let wrapping = |c: char| c.is_whitespace() || (PRESENTATIONAL.contains(&c) && c != '[' && c != ']');
    let mut s = s;
    loop {
        let before = s.len();
        s = s.trim_matches(wrapping);
        if let Some(inner) = s.strip_prefix('[') {
            if !opens_ip_literal(s) {
                s = inner;
            }
        }
        if let Some(inner) = s.strip_suffix(']') {
            if !closes_ip_literal(s) {
                s = inner;
            }
        }
        if s.len() == before {
            return s;
        }
    }
}

fn opens_ip_literal(s: &str) -> bool {
    s.find(']').is_some_and(|end| is_ip_literal(&s[1..end]))
}

fn closes_ip_literal(s: &str) -> bool {
    s.rfind('[')
        .is_some_and(|start| is_ip_literal(&s[start + 1..s.len() - 1]))
}

fn is_ip_literal(inner: &str) -> bool {
    inner.contains(':') && inner.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
}

/// Split off the scheme, mapping web schemes onto `wss://` and defaulting to it.
fn split_scheme(s: &str) -> (&'static str, &str) {
    for (prefix, scheme) in [
        ("wss://", "wss://"),
        ("ws://", "ws://"),
        ("https://", "wss://"),
        ("http://", "wss://"),
    ] {
        if let Some(head) = s.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                return (scheme, &s[prefix.len()..]);
            }
        }
    }
    ("wss://", s)
}

/// Whether `s` is already canonical and names a reachable WebSocket endpoint.
pub fn is_valid_normalized(s: &str) -> bool {
    if s.is_empty() || normalize(s) != s {
        return false;
    }
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Ok(url) = Url::parse(s) else {
        return false;
    };
    matches!(url.scheme(), "ws" | "wss")
        && url.host_str().map_or(false, |h| !h.is_empty() && !h.starts_with('.'))
        && url.username().is_empty()
        && url.password().is_none()
        && url.query().is_none()
        && url.fragment().is_none()
}
