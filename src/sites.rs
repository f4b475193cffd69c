use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::SiteConfig;
use crate::proxy::classify::is_html_content_type;
use crate::transport::HttpTransport;
use crate::util::{truncate_message, unix_now_secs};

/// Consecutive failures on the current site before rotating to the next one.
pub const MAX_SITE_FAILS: u32 = 3;

/// One upstream origin.
#[derive(Debug, Clone, Serialize)]
pub struct Site {
    pub name: String,
    pub url: String,
    pub use_proxy: bool,
    pub need_waf: bool,
}

impl From<SiteConfig> for Site {
    fn from(config: SiteConfig) -> Self {
        Self {
            name: config.name,
            url: config.url,
            use_proxy: config.use_proxy,
            need_waf: config.need_waf,
        }
    }
}

#[derive(Debug)]
struct RouterState {
    current_index: usize,
    fail_count: u32,
}

/// Primary-probe statistics for the health view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeStats {
    pub last_check_unix: Option<u64>,
    pub last_check_result: Option<String>,
    pub last_recovery_unix: Option<u64>,
    pub check_count: u64,
    pub recovery_count: u64,
}

/// Snapshot of the router state for the health view.
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub current_index: usize,
    pub fail_count: u32,
    pub is_primary: bool,
}

/// Ordered origin list with a sticky current index and threshold-based
/// rotation. Index 0 is the designated primary.
pub struct SiteRouter {
    sites: Vec<Site>,
    state: Mutex<RouterState>,
    probe: Mutex<ProbeStats>,
}

impl SiteRouter {
    #[must_use]
    pub fn new(configs: Vec<SiteConfig>) -> Self {
        let sites = configs.into_iter().map(Site::from).collect();
        Self {
            sites,
            state: Mutex::new(RouterState {
                current_index: 0,
                fail_count: 0,
            }),
            probe: Mutex::new(ProbeStats::default()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    #[must_use]
    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    #[must_use]
    pub fn site(&self, index: usize) -> &Site {
        &self.sites[index % self.sites.len()]
    }

    #[must_use]
    pub fn current_index(&self) -> usize {
        self.state.lock().current_index
    }

    /// The site requests should currently prefer.
    #[must_use]
    pub fn current(&self) -> (usize, &Site) {
        let index = self.current_index();
        (index, &self.sites[index])
    }

    #[must_use]
    pub fn snapshot(&self) -> RouterSnapshot {
        let state = self.state.lock();
        RouterSnapshot {
            current_index: state.current_index,
            fail_count: state.fail_count,
            is_primary: state.current_index == 0,
        }
    }

    /// Record one attributed site failure. The third consecutive failure
    /// rotates `current_index` to the next site and resets the counter, so
    /// the observable counter never reaches the threshold.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.fail_count += 1;
        if state.fail_count >= MAX_SITE_FAILS {
            let old = state.current_index;
            state.current_index = (state.current_index + 1) % self.sites.len();
            state.fail_count = 0;
            tracing::warn!(
                from = %self.sites[old].name,
                to = %self.sites[state.current_index].name,
                "site failure threshold reached, rotating"
            );
        }
    }

    /// Record a success on `index`: the counter resets and the winner
    /// becomes the sticky current site.
    pub fn record_success(&self, index: usize) {
        let mut state = self.state.lock();
        state.fail_count = 0;
        if index != state.current_index && index < self.sites.len() {
            state.current_index = index;
            tracing::info!(site = %self.sites[index].name, "switched current site to last winner");
        }
    }

    /// Move straight back to the primary. Returns whether the index actually
    /// moved; a move is counted as a recovery.
    pub fn force_primary(&self) -> bool {
        let moved = {
            let mut state = self.state.lock();
            let moved = state.current_index != 0;
            state.current_index = 0;
            state.fail_count = 0;
            moved
        };
        if moved {
            self.note_recovery();
        }
        moved
    }

    #[must_use]
    pub fn probe_stats(&self) -> ProbeStats {
        self.probe.lock().clone()
    }

    fn note_check(&self, result: &str) {
        let mut probe = self.probe.lock();
        probe.check_count += 1;
        probe.last_check_unix = Some(unix_now_secs());
        probe.last_check_result = Some(result.to_string());
    }

    fn note_recovery(&self) {
        let mut probe = self.probe.lock();
        probe.recovery_count += 1;
        probe.last_recovery_unix = Some(unix_now_secs());
    }

    /// Lightweight HEAD against the primary's `/v1/models`, reusing whatever
    /// WAF cookies are cached without forcing a refresh. Returns whether the
    /// primary looks healthy; stats are updated either way. The index is not
    /// touched here; switching is the caller's decision.
    pub async fn probe_primary(
        &self,
        transport: &HttpTransport,
        cookies: &HashMap<String, String>,
    ) -> bool {
        let primary = &self.sites[0];
        let url = format!("{}/v1/models", primary.url.trim_end_matches('/'));

        match transport.probe_head(&url, primary.use_proxy, cookies).await {
            Ok(response) => {
                let content_type = response
                    .headers()
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                if is_html_content_type(content_type) {
                    tracing::debug!("primary probe hit the WAF interstitial");
                    self.note_check("waf_challenge");
                    false
                } else if response.status().as_u16() >= 500 {
                    self.note_check(&format!("error_{}", response.status().as_u16()));
                    false
                } else {
                    self.note_check("healthy");
                    true
                }
            }
            Err(e) => {
                self.note_check(&format!("error: {}", truncate_message(&e.to_string(), 50)));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(n: usize) -> SiteRouter {
        let configs = (0..n)
            .map(|i| SiteConfig {
                name: if i == 0 {
                    "primary".to_string()
                } else {
                    format!("mirror{i}")
                },
                url: format!("https://site{i}.example"),
                use_proxy: i == 0,
                need_waf: i == 0,
            })
            .collect();
        SiteRouter::new(configs)
    }

    #[test]
    fn test_rotation_after_threshold() {
        let router = router(3);
        router.record_failure();
        router.record_failure();
        assert_eq!(router.current_index(), 0);
        assert_eq!(router.snapshot().fail_count, 2);
        router.record_failure();
        assert_eq!(router.current_index(), 1);
        // Counter is reset together with the rotation.
        assert_eq!(router.snapshot().fail_count, 0);
    }

    #[test]
    fn test_counter_never_reaches_threshold() {
        let router = router(2);
        for _ in 0..20 {
            router.record_failure();
            assert!(router.snapshot().fail_count < MAX_SITE_FAILS);
        }
    }

    #[test]
    fn test_rotation_wraps_modulo() {
        let router = router(2);
        for _ in 0..MAX_SITE_FAILS {
            router.record_failure();
        }
        assert_eq!(router.current_index(), 1);
        for _ in 0..MAX_SITE_FAILS {
            router.record_failure();
        }
        assert_eq!(router.current_index(), 0);
    }

    #[test]
    fn test_sticky_winner() {
        let router = router(3);
        router.record_failure();
        router.record_success(2);
        assert_eq!(router.current_index(), 2);
        assert_eq!(router.snapshot().fail_count, 0);
        // Success on the current site leaves the index alone.
        router.record_success(2);
        assert_eq!(router.current_index(), 2);
    }

    #[test]
    fn test_force_primary_counts_recovery_only_when_moving() {
        let router = router(2);
        assert!(!router.force_primary());
        assert_eq!(router.probe_stats().recovery_count, 0);

        for _ in 0..MAX_SITE_FAILS {
            router.record_failure();
        }
        assert_eq!(router.current_index(), 1);
        assert!(router.force_primary());
        assert_eq!(router.current_index(), 0);
        assert_eq!(router.snapshot().fail_count, 0);
        assert_eq!(router.probe_stats().recovery_count, 1);
    }
}
