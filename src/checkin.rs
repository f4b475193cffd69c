//! Thin client for the origin's daily check-in. The scheduler drives it;
//! anything smarter than "sign in and count" belongs to the external
//! check-in collaborator.

use std::collections::HashMap;

use http::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, ORIGIN, REFERER, USER_AGENT};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::accounts::Account;
use crate::error::RelayError;
use crate::sites::Site;
use crate::state::AppState;
use crate::transport::{Profile, BROWSER_USER_AGENT};
use crate::util::unix_now_secs;

const SIGN_IN_PATH: &str = "/api/user/sign_in";
const API_USER_HEADER: http::HeaderName = http::HeaderName::from_static("new-api-user");

#[derive(Debug, Clone, Default, Serialize)]
struct CheckinState {
    last_run_unix: Option<u64>,
    next_run_unix: Option<u64>,
    last_message: Option<String>,
    run_count: u64,
    last_success: usize,
    last_failed: usize,
}

/// Run bookkeeping shared between the scheduler and the health view.
#[derive(Default)]
pub struct CheckinTracker {
    inner: Mutex<CheckinState>,
}

impl CheckinTracker {
    pub fn note_next_run(&self, unix: u64) {
        self.inner.lock().next_run_unix = Some(unix);
    }

    pub fn note_run(&self, success: usize, failed: usize, message: String) {
        let mut state = self.inner.lock();
        state.last_run_unix = Some(unix_now_secs());
        state.run_count += 1;
        state.last_success = success;
        state.last_failed = failed;
        state.last_message = Some(message);
    }

    #[must_use]
    pub fn view(&self, enabled: bool, hours: &[u32], minute: u32) -> Value {
        let state = self.inner.lock().clone();
        json!({
            "enabled": enabled,
            "cron_hours": hours,
            "cron_minute": minute,
            "last_run_unix": state.last_run_unix,
            "next_run_unix": state.next_run_unix,
            "last_message": state.last_message,
            "run_count": state.run_count,
            "last_success": state.last_success,
            "last_failed": state.last_failed,
        })
    }
}

/// Check in every loaded account against the primary origin. Returns
/// (succeeded, failed) and records the run on the tracker.
pub async fn run_for_all_accounts(state: &AppState) -> (usize, usize) {
    let accounts = state.accounts.snapshot();
    if accounts.is_empty() {
        state
            .checkin
            .note_run(0, 0, "no accounts loaded".to_string());
        return (0, 0);
    }

    let primary = state.sites.site(0).clone();
    let waf_cookies = if primary.need_waf {
        match state.waf.get().await {
            Ok(cookies) => cookies,
            Err(e) => {
                tracing::warn!(error = %e, "check-in proceeding without WAF cookies");
                HashMap::new()
            }
        }
    } else {
        HashMap::new()
    };

    let mut success = 0;
    let mut failed = 0;
    for account in accounts.iter() {
        match checkin_account(state, &primary, account, &waf_cookies).await {
            Ok(true) => {
                tracing::info!(account = %account.name, "check-in succeeded");
                success += 1;
            }
            Ok(false) => {
                tracing::warn!(account = %account.name, "check-in rejected");
                failed += 1;
            }
            Err(e) => {
                tracing::warn!(account = %account.name, error = %e, "check-in failed");
                failed += 1;
            }
        }
    }

    let message = format!("{success} succeeded, {failed} failed");
    tracing::info!(success, failed, "check-in round finished");
    state.checkin.note_run(success, failed, message);
    (success, failed)
}

async fn checkin_account(
    state: &AppState,
    primary: &Site,
    account: &Account,
    waf_cookies: &HashMap<String, String>,
) -> Result<bool, RelayError> {
    let base = primary.url.trim_end_matches('/');
    let url = format!("{base}{SIGN_IN_PATH}");

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    if let Ok(value) = HeaderValue::from_str(&primary.url) {
        headers.insert(REFERER, value.clone());
        headers.insert(ORIGIN, value);
    }
    if let Ok(value) = HeaderValue::from_str(&account.api_user) {
        headers.insert(API_USER_HEADER, value);
    }
    if let Some(value) = merged_cookie_header(&account.session_cookie, waf_cookies) {
        headers.insert(COOKIE, value);
    }

    let response = state
        .transport
        .execute(
            Profile::Request,
            primary.use_proxy,
            http::Method::POST,
            &url,
            headers,
            bytes::Bytes::new(),
        )
        .await?;

    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if crate::proxy::classify::is_html_content_type(content_type) {
        return Err(RelayError::WafChallenge(primary.name.clone()));
    }

    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    if !status.is_success() {
        return Err(RelayError::Upstream {
            status: status.as_u16(),
            message: crate::util::truncate_message(&String::from_utf8_lossy(&body), 200),
        });
    }
    let parsed: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    Ok(parsed.get("success").and_then(Value::as_bool) == Some(true))
}

/// Merge the account's session cookie string with the WAF cookie map into
/// one `Cookie` header value.
fn merged_cookie_header(
    session_cookie: &str,
    waf_cookies: &HashMap<String, String>,
) -> Option<HeaderValue> {
    let mut parts: Vec<String> = waf_cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    let session = session_cookie.trim().trim_end_matches(';').trim();
    if !session.is_empty() {
        parts.push(session.to_string());
    }
    if parts.is_empty() {
        return None;
    }
    HeaderValue::from_str(&parts.join("; ")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_cookie_header() {
        let mut waf = HashMap::new();
        assert!(merged_cookie_header("", &waf).is_none());

        let only_session = merged_cookie_header("session=abc;", &waf).unwrap();
        assert_eq!(only_session.to_str().unwrap(), "session=abc");

        waf.insert("acw_tc".to_string(), "123".to_string());
        let merged = merged_cookie_header("session=abc", &waf).unwrap();
        let rendered = merged.to_str().unwrap();
        assert!(rendered.contains("acw_tc=123"));
        assert!(rendered.ends_with("session=abc"));
    }

    #[test]
    fn test_tracker_view() {
        let tracker = CheckinTracker::default();
        tracker.note_next_run(1234);
        tracker.note_run(3, 1, "3 succeeded, 1 failed".to_string());
        let view = tracker.view(true, &[2, 8], 30);
        assert_eq!(view["enabled"], true);
        assert_eq!(view["next_run_unix"], 1234);
        assert_eq!(view["run_count"], 1);
        assert_eq!(view["last_success"], 3);
        assert_eq!(view["last_failed"], 1);
        assert_eq!(view["cron_minute"], 30);
    }
}
