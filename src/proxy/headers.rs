use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};

use crate::transport::BROWSER_USER_AGENT;

const X_API_KEY: http::HeaderName = http::HeaderName::from_static("x-api-key");
const ANTHROPIC_VERSION: http::HeaderName = http::HeaderName::from_static("anthropic-version");
const DEFAULT_ANTHROPIC_VERSION: HeaderValue = HeaderValue::from_static("2023-06-01");

/// Build the header set for one upstream request: propagate `Content-Type`,
/// `anthropic-version`, and every `anthropic-*` header, inject the account
/// credential as both `Authorization` and `x-api-key`, and fix a generic
/// browser User-Agent.
pub(crate) fn build_upstream_headers(client_headers: &HeaderMap, api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let content_type = client_headers
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, content_type);

    let version = client_headers
        .get(&ANTHROPIC_VERSION)
        .cloned()
        .unwrap_or(DEFAULT_ANTHROPIC_VERSION);
    headers.insert(ANTHROPIC_VERSION, version);

    for (name, value) in client_headers {
        if name.as_str().starts_with("anthropic-") && !headers.contains_key(name) {
            headers.insert(name.clone(), value.clone());
        }
    }

    match HeaderValue::from_str(&format!("Bearer {api_key}")) {
        Ok(bearer) => {
            headers.insert(AUTHORIZATION, bearer);
        }
        Err(_) => tracing::warn!("account api_key is not a valid header value"),
    }
    if let Ok(raw) = HeaderValue::from_str(api_key) {
        headers.insert(X_API_KEY, raw);
    }
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));

    headers
}

/// Sniff `"stream": true` out of the request body. Non-JSON and malformed
/// bodies are treated as non-streaming.
#[must_use]
pub(crate) fn is_stream_request(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("stream").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

/// Model name for log lines.
#[must_use]
pub(crate) fn request_model(body: &[u8]) -> String {
    if body.is_empty() {
        return "unknown".to_string();
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("model")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Join the site base URL, the `/v1/` path suffix, and the query string.
#[must_use]
pub(crate) fn build_target_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}/v1/{}", base.trim_end_matches('/'), path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_construction() {
        let mut client = HeaderMap::new();
        client.insert("content-type", "application/json".parse().unwrap());
        client.insert("anthropic-version", "2024-01-01".parse().unwrap());
        client.insert("anthropic-beta", "tools-2024".parse().unwrap());
        client.insert("x-forwarded-for", "10.0.0.1".parse().unwrap());
        client.insert("authorization", "Bearer client-key".parse().unwrap());

        let headers = build_upstream_headers(&client, "sk-account");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2024-01-01");
        assert_eq!(headers.get("anthropic-beta").unwrap(), "tools-2024");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-account");
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-account");
        assert_eq!(headers.get("user-agent").unwrap(), BROWSER_USER_AGENT);
        // Unrelated client headers are not forwarded.
        assert!(headers.get("x-forwarded-for").is_none());
    }

    #[test]
    fn test_header_defaults() {
        let headers = build_upstream_headers(&HeaderMap::new(), "sk-a");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn test_stream_sniffing() {
        assert!(is_stream_request(br#"{"stream": true, "model": "m"}"#));
        assert!(!is_stream_request(br#"{"stream": false}"#));
        assert!(!is_stream_request(br#"{"model": "m"}"#));
        assert!(!is_stream_request(b"not json at all"));
        assert!(!is_stream_request(b""));
        assert!(!is_stream_request(br#"{"stream": "yes"}"#));
    }

    #[test]
    fn test_request_model() {
        assert_eq!(
            request_model(br#"{"model": "claude-3-5-sonnet-20241022"}"#),
            "claude-3-5-sonnet-20241022"
        );
        assert_eq!(request_model(b"{}"), "unknown");
        assert_eq!(request_model(b"garbage"), "unknown");
    }

    #[test]
    fn test_target_url() {
        assert_eq!(
            build_target_url("https://origin.example/", "messages", None),
            "https://origin.example/v1/messages"
        );
        assert_eq!(
            build_target_url("https://origin.example", "models", Some("limit=5")),
            "https://origin.example/v1/models?limit=5"
        );
    }
}
