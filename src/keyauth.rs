use http::header::AUTHORIZATION;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::config::KeyValidationConfig;
use crate::error::RelayError;
use crate::transport::{HttpTransport, Profile};
use crate::util::unix_now_secs;

const X_API_KEY: http::HeaderName = http::HeaderName::from_static("x-api-key");

/// Extract the client's API key from request headers: `x-api-key` first,
/// then `Authorization: Bearer <key>`.
#[must_use]
pub fn extract_api_key(headers: &http::HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(X_API_KEY).and_then(|v| v.to_str().ok()) {
        return Some(value);
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Validates client keys against the external user-database service with a
/// short-TTL positive/negative cache keyed by the raw key.
pub struct KeyValidator {
    config: KeyValidationConfig,
    cache: RwLock<FxHashMap<String, (bool, u64)>>,
}

impl KeyValidator {
    #[must_use]
    pub fn new(config: KeyValidationConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Validate one key, hitting the user-database only on cache misses.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Auth`] when the key is missing, rejected, or
    /// the validation service is unreachable. Connection failures are not
    /// cached so the next request retries.
    pub async fn validate(&self, transport: &HttpTransport, key: &str) -> Result<(), RelayError> {
        if key.is_empty() {
            return Err(RelayError::Auth("API key is required".to_string()));
        }

        if let Some(valid) = self.cached_verdict_at(key, unix_now_secs()) {
            tracing::debug!(valid, "API key validation cache hit");
            return if valid {
                Ok(())
            } else {
                Err(RelayError::Auth("Invalid API key (cached)".to_string()))
            };
        }

        let url = format!(
            "{}/api/user/self",
            self.config.user_db_url.trim_end_matches('/')
        );
        let client = transport.client(Profile::Validation, false)?;
        let response = client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {key}"))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    tracing::error!(error = %e, "failed to reach user database for key validation");
                    RelayError::Auth("Authentication service unavailable".to_string())
                } else {
                    RelayError::Auth(format!("Validation error: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let body_bytes = response.bytes().await.unwrap_or_default();
            let body: Value = serde_json::from_slice(&body_bytes).unwrap_or(Value::Null);
            let accepted = body.get("success").and_then(Value::as_bool) == Some(true)
                && body.get("data").is_some_and(|data| !data.is_null());
            if accepted {
                let username = body
                    .get("data")
                    .and_then(|data| data.get("username"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                tracing::info!(username, "API key validated");
                self.insert_at(key, true, unix_now_secs());
                return Ok(());
            }
        }
        tracing::warn!(status = status.as_u16(), "API key validation failed");
        self.insert_at(key, false, unix_now_secs());
        Err(RelayError::Auth("Invalid API key".to_string()))
    }

    pub fn clear(&self) {
        self.cache.write().clear();
        tracing::info!("API key validation cache cleared");
    }

    fn cached_verdict_at(&self, key: &str, now: u64) -> Option<bool> {
        let cache = self.cache.read();
        let (valid, expire_at) = cache.get(key)?;
        (now < *expire_at).then_some(*valid)
    }

    fn insert_at(&self, key: &str, valid: bool, now: u64) {
        self.cache
            .write()
            .insert(key.to_string(), (valid, now + self.config.cache_ttl_secs));
    }

    #[must_use]
    pub fn stats(&self) -> Value {
        self.stats_at(unix_now_secs())
    }

    fn stats_at(&self, now: u64) -> Value {
        let cache = self.cache.read();
        let valid = cache.values().filter(|(v, e)| *v && *e > now).count();
        let invalid = cache.values().filter(|(v, e)| !*v && *e > now).count();
        let expired = cache.values().filter(|(_, e)| *e <= now).count();
        json!({
            "enabled": self.config.enabled,
            "cache_size": cache.len(),
            "valid_keys_cached": valid,
            "invalid_keys_cached": invalid,
            "expired_entries": expired,
            "cache_ttl_seconds": self.config.cache_ttl_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> KeyValidator {
        KeyValidator::new(KeyValidationConfig {
            enabled: true,
            user_db_url: "http://127.0.0.1:3000".to_string(),
            cache_ttl_secs: 300,
        })
    }

    #[test]
    fn test_extract_prefers_x_api_key() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-api-key", "sk-direct".parse().unwrap());
        headers.insert("authorization", "Bearer sk-bearer".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("sk-direct"));
    }

    #[test]
    fn test_extract_falls_back_to_bearer() {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", "Bearer sk-bearer ".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("sk-bearer"));
    }

    #[test]
    fn test_extract_missing() {
        let headers = http::HeaderMap::new();
        assert_eq!(extract_api_key(&headers), None);
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(extract_api_key(&headers), None);
    }

    #[test]
    fn test_cache_verdicts_expire() {
        let v = validator();
        v.insert_at("sk-a", true, 1000);
        v.insert_at("sk-b", false, 1000);
        assert_eq!(v.cached_verdict_at("sk-a", 1001), Some(true));
        assert_eq!(v.cached_verdict_at("sk-b", 1001), Some(false));
        assert_eq!(v.cached_verdict_at("sk-a", 1300), None);
        assert_eq!(v.cached_verdict_at("sk-missing", 1001), None);
    }

    #[test]
    fn test_stats_buckets() {
        let v = validator();
        v.insert_at("sk-a", true, 1000);
        v.insert_at("sk-b", false, 1000);
        v.insert_at("sk-c", true, 0);
        let stats = v.stats_at(1001);
        assert_eq!(stats["cache_size"], 3);
        assert_eq!(stats["valid_keys_cached"], 1);
        assert_eq!(stats["invalid_keys_cached"], 1);
        assert_eq!(stats["expired_entries"], 1);
    }

    #[test]
    fn test_clear_empties_cache() {
        let v = validator();
        v.insert_at("sk-a", true, 1000);
        v.clear();
        assert_eq!(v.cached_verdict_at("sk-a", 1001), None);
    }
}
