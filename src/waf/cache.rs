use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Notify};

use crate::config::WafConfig;
use crate::error::RelayError;
use crate::proxy::classify::is_browser_disconnect;
use crate::util::unix_now_secs;

/// Restart-and-retry attempts inside one refresh when the browser looks dead.
const MAX_REFRESH_RETRIES: u32 = 2;

/// Where refreshed cookies come from. Production wires
/// [`super::browser::BrowserCookieSource`]; tests substitute stubs.
pub trait CookieSource: Send + Sync + 'static {
    /// Obtain a fresh cookie jar from the challenge page.
    fn fetch(&self) -> BoxFuture<'_, Result<HashMap<String, String>, RelayError>>;
    /// Recover the underlying browser after a disconnect.
    fn recover(&self) -> BoxFuture<'_, Result<(), RelayError>>;
    /// Whether the browser is due for its periodic restart.
    fn due_for_restart(&self) -> BoxFuture<'_, bool>;
}

/// Cookie entry state, derived purely from the entry's fields and the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieState {
    Empty,
    Valid,
    Expiring,
    Expired,
    Refreshing,
}

#[must_use]
pub(crate) fn cookie_state(
    has_cookies: bool,
    now: u64,
    expire_at: u64,
    refresh_before: u64,
    refresh_in_flight: bool,
) -> CookieState {
    if refresh_in_flight {
        return CookieState::Refreshing;
    }
    if !has_cookies {
        return CookieState::Empty;
    }
    if now >= expire_at {
        return CookieState::Expired;
    }
    if now >= expire_at.saturating_sub(refresh_before) {
        return CookieState::Expiring;
    }
    CookieState::Valid
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WafStats {
    pub total_refreshes: u64,
    pub refresh_failures: u64,
    pub forced_refreshes: u64,
    pub cache_hits: u64,
    pub last_refresh_unix: Option<u64>,
}

#[derive(Default)]
struct CookieEntry {
    cookies: HashMap<String, String>,
    expire_at: u64,
    refresh_in_flight: bool,
    /// Incremented every time a refresh starts; lets force-refresh callers
    /// require a refresh that began after their call.
    refresh_gen: u64,
    last_error: Option<String>,
    stats: WafStats,
}

/// Single-flight TTL cache for the WAF challenge cookies.
///
/// At most one refresh runs at a time; concurrent readers either wait on the
/// notify (EMPTY/EXPIRED) or leave with the current jar while a background
/// refresh is kicked off (EXPIRING). All entry mutations happen under the
/// mutex and completion is broadcast whether the refresh succeeded or not.
pub struct WafCookieCache {
    entry: Mutex<CookieEntry>,
    refreshed: Notify,
    source: Arc<dyn CookieSource>,
    config: WafConfig,
    /// Back-reference for spawning background refreshes from `&self`.
    self_ref: std::sync::Weak<Self>,
}

impl WafCookieCache {
    #[must_use]
    pub fn new(source: Arc<dyn CookieSource>, config: WafConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            entry: Mutex::new(CookieEntry::default()),
            refreshed: Notify::new(),
            source,
            config,
            self_ref: weak.clone(),
        })
    }

    fn state_of(&self, entry: &CookieEntry) -> CookieState {
        cookie_state(
            !entry.cookies.is_empty(),
            unix_now_secs(),
            entry.expire_at,
            self.config.refresh_before_secs,
            entry.refresh_in_flight,
        )
    }

    /// Current cookies without triggering any refresh. Used by the primary
    /// probe, which must never force a refresh.
    pub async fn peek(&self) -> HashMap<String, String> {
        self.entry.lock().await.cookies.clone()
    }

    /// Return currently valid cookies, refreshing synchronously only when
    /// nothing usable exists.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Browser`] when a refresh fails and no stale
    /// cookies are available, or when the waiter timeout elapses with an
    /// empty jar.
    pub async fn get(&self) -> Result<HashMap<String, String>, RelayError> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.refresh_wait_secs);
        loop {
            let mut entry = self.entry.lock().await;
            match self.state_of(&entry) {
                CookieState::Valid => {
                    entry.stats.cache_hits += 1;
                    return Ok(entry.cookies.clone());
                }
                CookieState::Expiring => {
                    entry.stats.cache_hits += 1;
                    let cookies = entry.cookies.clone();
                    if let Some(cache) = self.self_ref.upgrade() {
                        entry.refresh_in_flight = true;
                        entry.refresh_gen += 1;
                        drop(entry);
                        tokio::spawn(async move {
                            if let Err(e) = cache.run_refresh().await {
                                tracing::warn!(error = %e, "background cookie pre-refresh failed");
                            }
                        });
                    }
                    return Ok(cookies);
                }
                CookieState::Empty | CookieState::Expired => {
                    entry.refresh_in_flight = true;
                    entry.refresh_gen += 1;
                    drop(entry);
                    return match self.run_refresh().await {
                        Ok(cookies) => Ok(cookies),
                        Err(e) => self.stale_or(e).await,
                    };
                }
                CookieState::Refreshing => {
                    let notified = self.refreshed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(entry);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::warn!("timed out waiting for cookie refresh");
                        return self
                            .stale_or(RelayError::Browser(
                                "timed out waiting for WAF cookie refresh".to_string(),
                            ))
                            .await;
                    }
                }
            }
        }
    }

    /// Admin-driven refresh: invalidate the entry and require one refresh
    /// that starts after this call. Two concurrent force calls issued while
    /// a refresh is in flight share a single additional fetch.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Browser`] when the refresh fails and no stale
    /// cookies remain.
    pub async fn force_refresh(&self) -> Result<HashMap<String, String>, RelayError> {
        // A refresh satisfies this call only if it starts after it; a
        // refresh already in flight carries the current generation, so the
        // first satisfying generation is always current + 1.
        let need_gen = {
            let mut entry = self.entry.lock().await;
            entry.expire_at = 0;
            entry.stats.forced_refreshes += 1;
            entry.refresh_gen + 1
        };
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.refresh_wait_secs);
        loop {
            let mut entry = self.entry.lock().await;
            if entry.refresh_gen >= need_gen && !entry.refresh_in_flight {
                return if entry.cookies.is_empty() {
                    let message = entry
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "cookie refresh produced nothing".to_string());
                    Err(RelayError::Browser(message))
                } else {
                    Ok(entry.cookies.clone())
                };
            }
            if !entry.refresh_in_flight {
                entry.refresh_in_flight = true;
                entry.refresh_gen += 1;
                drop(entry);
                return match self.run_refresh().await {
                    Ok(cookies) => Ok(cookies),
                    Err(e) => self.stale_or(e).await,
                };
            }
            let notified = self.refreshed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(entry);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!("timed out waiting for forced cookie refresh");
                return self
                    .stale_or(RelayError::Browser(
                        "timed out waiting for WAF cookie refresh".to_string(),
                    ))
                    .await;
            }
        }
    }

    /// Refresh unless one is already in flight. Used by the pre-refresh
    /// loop; an in-flight refresh counts as done.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Browser`] when the refresh itself fails.
    pub async fn refresh_now(&self) -> Result<(), RelayError> {
        {
            let mut entry = self.entry.lock().await;
            if entry.refresh_in_flight {
                return Ok(());
            }
            entry.refresh_in_flight = true;
            entry.refresh_gen += 1;
        }
        self.run_refresh().await.map(|_| ())
    }

    /// Long-running pre-refresh task: wakes before the TTL runs out so
    /// clients keep hitting VALID cookies, and restarts an over-aged browser
    /// before refreshing through it.
    pub fn spawn_refresh_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = self;
        let normal = Duration::from_secs(
            cache
                .config
                .cookie_ttl_secs
                .saturating_sub(cache.config.refresh_before_secs)
                .max(60),
        );
        let retry = Duration::from_secs(cache.config.retry_interval_secs.max(1));
        tokio::spawn(async move {
            let mut delay = normal;
            loop {
                tokio::time::sleep(delay).await;
                if cache.source.due_for_restart().await {
                    tracing::info!("browser uptime limit reached, restarting before refresh");
                    if let Err(e) = cache.source.recover().await {
                        tracing::warn!(error = %e, "scheduled browser restart failed");
                    }
                }
                delay = match cache.refresh_now().await {
                    Ok(()) => normal,
                    Err(e) => {
                        tracing::warn!(error = %e, "scheduled cookie refresh failed");
                        retry
                    }
                };
            }
        })
    }

    /// The refresh body. The caller has already set `refresh_in_flight`;
    /// this either installs a fresh jar or records the failure, and always
    /// broadcasts completion.
    async fn run_refresh(&self) -> Result<HashMap<String, String>, RelayError> {
        let mut attempt = 0;
        loop {
            let outcome = match self.source.fetch().await {
                Ok(cookies) if cookies.is_empty() => Err(RelayError::Browser(
                    "challenge page navigation produced no cookies".to_string(),
                )),
                other => other,
            };
            match outcome {
                Ok(cookies) => {
                    let now = unix_now_secs();
                    let mut entry = self.entry.lock().await;
                    entry.cookies = cookies.clone();
                    entry.expire_at = now + self.config.cookie_ttl_secs;
                    entry.refresh_in_flight = false;
                    entry.last_error = None;
                    entry.stats.total_refreshes += 1;
                    entry.stats.last_refresh_unix = Some(now);
                    drop(entry);
                    self.refreshed.notify_waiters();
                    tracing::info!(count = cookies.len(), "WAF cookies refreshed");
                    return Ok(cookies);
                }
                Err(e) => {
                    let message = e.to_string();
                    if attempt < MAX_REFRESH_RETRIES && is_browser_disconnect(&message) {
                        attempt += 1;
                        tracing::warn!(
                            attempt,
                            error = %message,
                            "browser disconnect during refresh, restarting"
                        );
                        // Waiters stay parked: the flag is still set.
                        if let Err(restart_err) = self.source.recover().await {
                            tracing::warn!(error = %restart_err, "browser restart failed");
                        }
                        continue;
                    }
                    let mut entry = self.entry.lock().await;
                    entry.refresh_in_flight = false;
                    entry.last_error = Some(message.clone());
                    entry.stats.refresh_failures += 1;
                    drop(entry);
                    self.refreshed.notify_waiters();
                    tracing::error!(error = %message, "WAF cookie refresh failed");
                    return Err(e);
                }
            }
        }
    }

    /// Degraded mode: serve whatever stale jar is left, or surface the error.
    async fn stale_or(&self, e: RelayError) -> Result<HashMap<String, String>, RelayError> {
        let entry = self.entry.lock().await;
        if entry.cookies.is_empty() {
            Err(e)
        } else {
            tracing::warn!(error = %e, "serving stale WAF cookies");
            Ok(entry.cookies.clone())
        }
    }

    /// Stats block for the health view.
    pub async fn stats_view(&self) -> serde_json::Value {
        let entry = self.entry.lock().await;
        let now = unix_now_secs();
        json!({
            "state": self.state_of(&entry),
            "cookie_count": entry.cookies.len(),
            "expire_at_unix": entry.expire_at,
            "expires_in_secs": entry.expire_at.saturating_sub(now),
            "last_error": entry.last_error,
            "stats": entry.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_pure_function_of_inputs() {
        // No cookies yet.
        assert_eq!(cookie_state(false, 100, 0, 600, false), CookieState::Empty);
        // In-flight wins over everything else.
        assert_eq!(
            cookie_state(false, 100, 0, 600, true),
            CookieState::Refreshing
        );
        assert_eq!(
            cookie_state(true, 5000, 4000, 600, true),
            CookieState::Refreshing
        );
        // Past the expiry.
        assert_eq!(
            cookie_state(true, 4000, 4000, 600, false),
            CookieState::Expired
        );
        assert_eq!(
            cookie_state(true, 4001, 4000, 600, false),
            CookieState::Expired
        );
        // Inside the pre-refresh window.
        assert_eq!(
            cookie_state(true, 3400, 4000, 600, false),
            CookieState::Expiring
        );
        assert_eq!(
            cookie_state(true, 3999, 4000, 600, false),
            CookieState::Expiring
        );
        // Comfortably fresh.
        assert_eq!(
            cookie_state(true, 3399, 4000, 600, false),
            CookieState::Valid
        );
    }

    #[test]
    fn test_valid_state_implies_unexpired() {
        // Cookie coherence: whenever the derived state is VALID the clock is
        // strictly before expire_at.
        for now in 0..5000u64 {
            if cookie_state(true, now, 4000, 600, false) == CookieState::Valid {
                assert!(now < 4000);
            }
        }
    }

    #[test]
    fn test_refresh_window_saturates_at_zero() {
        // A refresh window larger than the expiry must not underflow.
        assert_eq!(cookie_state(true, 0, 100, 600, false), CookieState::Expiring);
    }
}
