use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::RelayError;

/// Generic browser User-Agent presented to every origin.
pub(crate) const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Timeout profile for an upstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Profile {
    /// Non-streaming proxy requests: connect 30 s, read 60 s.
    Request,
    /// Streaming proxy requests: connect 30 s, read 300 s, no total budget.
    Stream,
    /// Primary-site probe: connect 5 s, read 10 s.
    Probe,
    /// API-key validation against the internal user-db: 10 s total, never
    /// through the forward proxy.
    Validation,
}

impl Profile {
    fn connect_timeout(self) -> Duration {
        match self {
            Profile::Request | Profile::Stream => Duration::from_secs(30),
            Profile::Probe | Profile::Validation => Duration::from_secs(5),
        }
    }

    fn read_timeout(self) -> Duration {
        match self {
            Profile::Request => Duration::from_secs(60),
            Profile::Stream => Duration::from_secs(300),
            Profile::Probe => Duration::from_secs(10),
            Profile::Validation => Duration::from_secs(10),
        }
    }
}

/// HTTP client pool for upstream requests.
///
/// Clients are built lazily per (profile, proxied) pair and cached; a
/// `reqwest::Client` is internally reference-counted, so handing out clones
/// is cheap and a streaming response keeps its connection alive for as long
/// as the response body is held.
pub struct HttpTransport {
    proxy_url: String,
    clients: RwLock<FxHashMap<(Profile, bool), reqwest::Client>>,
}

impl HttpTransport {
    #[must_use]
    pub fn new(proxy_url: &str) -> Self {
        Self {
            proxy_url: proxy_url.to_string(),
            clients: RwLock::new(FxHashMap::default()),
        }
    }

    pub(crate) fn client(
        &self,
        profile: Profile,
        use_proxy: bool,
    ) -> Result<reqwest::Client, RelayError> {
        // Validation traffic targets an internal service and never goes
        // through the forward proxy.
        let use_proxy = use_proxy && profile != Profile::Validation;
        if let Some(existing) = self.clients.read().get(&(profile, use_proxy)) {
            return Ok(existing.clone());
        }

        let proxy = use_proxy.then_some(self.proxy_url.as_str());
        let client = build_client(profile, proxy)?;

        let mut cache = self.clients.write();
        if let Some(existing) = cache.get(&(profile, use_proxy)) {
            return Ok(existing.clone());
        }
        cache.insert((profile, use_proxy), client.clone());
        Ok(client)
    }

    /// Issue one upstream request. The caller decides the profile; the
    /// response is returned unread so streaming bodies can be forwarded.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] when the client cannot be built or
    /// the request fails before a response head arrives.
    pub(crate) async fn execute(
        &self,
        profile: Profile,
        use_proxy: bool,
        method: http::Method,
        url: &str,
        headers: http::HeaderMap,
        body: bytes::Bytes,
    ) -> Result<reqwest::Response, RelayError> {
        let client = self.client(profile, use_proxy)?;
        client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    /// HEAD used by the primary-site probe.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] on connect/read failures.
    pub(crate) async fn probe_head(
        &self,
        url: &str,
        use_proxy: bool,
        cookies: &HashMap<String, String>,
    ) -> Result<reqwest::Response, RelayError> {
        let client = self.client(Profile::Probe, use_proxy)?;
        let mut request = client
            .head(url)
            .header(http::header::USER_AGENT, BROWSER_USER_AGENT);
        if let Some(value) = cookie_header(cookies) {
            request = request.header(http::header::COOKIE, value);
        }
        request
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }
}

fn build_client(profile: Profile, proxy: Option<&str>) -> Result<reqwest::Client, RelayError> {
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(profile.connect_timeout())
        .read_timeout(profile.read_timeout())
        .no_proxy();

    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| RelayError::Transport(format!("Invalid proxy URL: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| RelayError::Transport(format!("Failed to build HTTP client: {e}")))
}

/// Render a cookie map as a `Cookie` header value. Returns `None` for an
/// empty map or values that are not valid header material.
pub(crate) fn cookie_header(cookies: &HashMap<String, String>) -> Option<http::HeaderValue> {
    if cookies.is_empty() {
        return None;
    }
    let joined = cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ");
    http::HeaderValue::from_str(&joined).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_are_cached_per_profile() {
        let transport = HttpTransport::new("http://127.0.0.1:7890");
        let _ = transport.client(Profile::Request, false).unwrap();
        let _ = transport.client(Profile::Request, false).unwrap();
        let _ = transport.client(Profile::Stream, false).unwrap();
        let _ = transport.client(Profile::Request, true).unwrap();
        assert_eq!(transport.clients.read().len(), 3);
    }

    #[test]
    fn test_validation_profile_ignores_proxy_flag() {
        let transport = HttpTransport::new("http://127.0.0.1:7890");
        let _ = transport.client(Profile::Validation, true).unwrap();
        assert!(transport
            .clients
            .read()
            .contains_key(&(Profile::Validation, false)));
    }

    #[test]
    fn test_invalid_proxy_url_is_transport_error() {
        let transport = HttpTransport::new("definitely not a proxy url\u{0000}");
        let err = transport.client(Profile::Request, true).unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[test]
    fn test_cookie_header_formatting() {
        let mut cookies = HashMap::new();
        assert!(cookie_header(&cookies).is_none());
        cookies.insert("acw_tc".to_string(), "abc123".to_string());
        let value = cookie_header(&cookies).unwrap();
        assert_eq!(value.to_str().unwrap(), "acw_tc=abc123");

        cookies.insert("cdn_sec_tc".to_string(), "xyz".to_string());
        let value = cookie_header(&cookies).unwrap();
        let rendered = value.to_str().unwrap();
        assert!(rendered.contains("acw_tc=abc123"));
        assert!(rendered.contains("cdn_sec_tc=xyz"));
        assert!(rendered.contains("; "));
    }
}
