//! Canonical keys derived from navigation URLs.
//!
//! Parse failures never surface as errors: every helper returns `None` (or
//! `false`) so callers fall through to the next precedence level.

use url::Url;

const INTERNAL_SCHEMES: &[&str] = &[
    "chrome",
    "chrome-extension",
    "about",
    "devtools",
    "edge",
    "brave",
    "view-source",
];

fn parse(url: &str) -> Option<Url> {
    Url::parse(url.trim()).ok()
}

/// Hostname of `url`, or `None` when it cannot be parsed or has no host.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = parse(url)?;
    parsed.host_str().map(str::to_string)
}

/// `hostname + pathname` with one trailing slash removed.
///
/// Query and fragment are discarded, so `https://a.com/docs/?q=1#top`
/// yields `a.com/docs` and `https://a.com/` yields `a.com`.
pub fn path_key_of(url: &str) -> Option<String> {
    let parsed = parse(url)?;
    let host = parsed.host_str()?;
    let path = parsed.path();
    let path = path.strip_suffix('/').unwrap_or(path);
    Some(format!("{host}{path}"))
}

/// Whether a freshly opened URL is a candidate for routing at all.
pub fn is_routable(url: &str) -> bool {
    let Some(parsed) = parse(url) else {
        return false;
    };
    if INTERNAL_SCHEMES.contains(&parsed.scheme()) {
        return false;
    }
    parsed.host_str().is_some()
}
