//! Response and error classification for the proxy loop.
//!
//! The literal upstream signals live here so operators can adjust them in
//! one place.

/// Body substrings an overloaded or rate-limited origin is known to emit.
const CAPACITY_NEEDLES: [&[u8]; 2] = ["负载已经达到上限".as_bytes(), b"rate limit"];

/// Error substrings that indicate the headless browser process died and a
/// restart-and-retry is worthwhile.
const BROWSER_DISCONNECT_NEEDLES: [&[u8]; 4] = [
    b"browser has been closed",
    b"disconnected",
    b"connection refused",
    b"channel closed",
];

/// How many body bytes the 5xx classifier looks at.
pub(crate) const BODY_PREFIX_LIMIT: usize = 2048;

/// Classification of one upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseClass {
    /// 2xx/3xx/4xx (other than 401/403), returned to the client as-is.
    Success,
    /// HTML content type on an API path: the WAF interstitial.
    WafChallenge,
    /// 401/403, the credential was rejected.
    AccountError,
    /// Any 5xx; the body prefix decides the retry policy.
    ServerError { capacity: bool, empty_body: bool },
}

/// Classify an upstream response from its status, content type, and a small
/// body prefix.
#[must_use]
pub(crate) fn classify_response(
    status: u16,
    content_type: Option<&str>,
    body_prefix: &[u8],
) -> ResponseClass {
    if content_type.is_some_and(is_html_content_type) {
        return ResponseClass::WafChallenge;
    }
    match status {
        401 | 403 => ResponseClass::AccountError,
        500.. => ResponseClass::ServerError {
            capacity: is_capacity_signal(body_prefix),
            empty_body: body_prefix.is_empty(),
        },
        _ => ResponseClass::Success,
    }
}

#[inline]
#[must_use]
pub(crate) fn is_html_content_type(content_type: &str) -> bool {
    contains_ascii_case_insensitive(content_type.as_bytes(), b"text/html")
}

#[inline]
#[must_use]
pub(crate) fn is_capacity_signal(body: &[u8]) -> bool {
    CAPACITY_NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(body, needle))
}

/// Whether a cookie-refresh error message indicates a dead browser.
#[inline]
#[must_use]
pub(crate) fn is_browser_disconnect(message: &str) -> bool {
    let haystack = message.as_bytes();
    BROWSER_DISCONNECT_NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }

    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}
