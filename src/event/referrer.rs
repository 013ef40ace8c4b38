use url::Url;

const SLASH: char = '/';

/// Splits a referrer into (host, path).
///
/// Absolute URLs with a host yield the host and the path, or no path when
/// the input has none after the authority. Anything else is treated as a bare `host/path` string and split on
/// the first slash. Blank input yields `(None, None)`.
pub fn split_referrer(referrer: &str) -> (Option<String>, Option<String>) {
    let referrer = referrer.trim();
    if referrer.is_empty() {
        return (None, None);
    }

    if let Ok(url) = Url::parse(referrer) {
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            let path = Some(url.path())
                .filter(|p| !p.is_empty() && (*p != "/" || has_explicit_path(referrer)));
            return (Some(host.to_string()), path.map(str::to_string));
        }
    }

    match referrer.split_once(SLASH) {
        Some((first, rest)) => (non_empty(first), Some(format!("{SLASH}{rest}"))),
        None => (non_empty(referrer), None),
    }
}

/// Url turns an empty path into "/"; this tells the two apart.
fn has_explicit_path(raw: &str) -> bool {
    let rest = raw.split_once("://").map_or(raw, |(_, rest)| rest);
    rest.find(['/', '?', '#'])
        .is_some_and(|i| rest[i..].starts_with(SLASH))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
