//! Proxy environment for target processes.

use std::collections::HashSet;

/// Hosts that must always bypass the proxy.
const LOOPBACK_NO_PROXY: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Proxy variables to apply on top of `base` for a proxy at `proxy_url`.
///
/// Returns only the variables to set: both spellings of `HTTP_PROXY`,
/// `HTTPS_PROXY` and `NO_PROXY`. The no-proxy list starts from the first
/// non-empty of `NO_PROXY` / `no_proxy` in `base` and always includes the
/// loopback hosts.
pub fn proxy_vars<K, V>(base: &[(K, V)], proxy_url: &str) -> Vec<(String, String)>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let lookup = |key: &str| {
        base.iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_ref())
            .unwrap_or("")
    };
    let upper = lookup("NO_PROXY");
    let existing = if upper.trim().is_empty() {
        lookup("no_proxy")
    } else {
        upper
    };
    let no_proxy = merge_no_proxy(existing, LOOPBACK_NO_PROXY);

    let mut vars = Vec::with_capacity(6);
    for (key, value) in [
        ("HTTP_PROXY", proxy_url),
        ("HTTPS_PROXY", proxy_url),
        ("NO_PROXY", no_proxy.as_str()),
    ] {
        vars.push((key.to_string(), value.to_string()));
        vars.push((key.to_ascii_lowercase(), value.to_string()));
    }
    vars
}

/// Proxy variables for the current process environment.
pub fn proxy_vars_from_env(proxy_url: &str) -> Vec<(String, String)> {
    let base: Vec<(String, String)> = std::env::vars().collect();
    proxy_vars(&base, proxy_url)
}

/// Merge a comma-separated no-proxy list with `required` entries.
///
/// Entries are trimmed, empty ones dropped, and duplicates removed
/// case-insensitively keeping the first spelling.
pub fn merge_no_proxy(existing: &str, required: &[&str]) -> String {
    let mut seen = HashSet::new();
    let mut out: Vec<&str> = Vec::new();
    for entry in existing.split(',').chain(required.iter().copied()) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if seen.insert(entry.to_ascii_lowercase()) {
            out.push(entry);
        }
    }
    out.join(",")
}
