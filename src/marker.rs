//! Re-entrancy marker carried in the URL fragment.
//!
//! Launching a URL in another profile re-opens it in a fresh tab, which the
//! router observes again. The marker lets the router recognise that second
//! delivery and let it through instead of prompting twice.

use url::Url;

/// Fragment token identifying a URL the router already dispatched.
pub const ROUTE_MARKER: &str = "__prouted";

const SEPARATOR: char = ':';

/// Stamp `url` with the marker, keeping any existing fragment after a colon.
///
/// The rest of the URL is left byte-for-byte as given. Unparseable input is
/// returned unchanged.
pub fn mark(url: &str) -> String {
    if Url::parse(url).is_err() {
        return url.to_string();
    }
    match split_fragment(url) {
        (base, Some(existing)) => format!("{base}#{ROUTE_MARKER}{SEPARATOR}{existing}"),
        (base, None) => format!("{base}#{ROUTE_MARKER}"),
    }
}

/// True when the fragment is the marker or starts with `marker:`.
pub fn is_marked(url: &str) -> bool {
    if Url::parse(url).is_err() {
        return false;
    }
    split_fragment(url).1.is_some_and(is_marker_fragment)
}

/// Remove one layer of marker, restoring whatever fragment followed it.
pub fn strip(url: &str) -> String {
    if Url::parse(url).is_err() {
        return url.to_string();
    }
    let (base, Some(fragment)) = split_fragment(url) else {
        return url.to_string();
    };
    if fragment == ROUTE_MARKER {
        return base.to_string();
    }
    match fragment
        .strip_prefix(ROUTE_MARKER)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
    {
        Some(rest) => format!("{base}#{rest}"),
        None => url.to_string(),
    }
}

// The first `#` starts the fragment; it cannot appear unescaped earlier.
fn split_fragment(url: &str) -> (&str, Option<&str>) {
    match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    }
}

fn is_marker_fragment(fragment: &str) -> bool {
    fragment == ROUTE_MARKER
        || fragment
            .strip_prefix(ROUTE_MARKER)
            .is_some_and(|rest| rest.starts_with(SEPARATOR))
}
