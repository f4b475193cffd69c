use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::util::unix_now_secs;

/// Attributed failures before an account is temporarily disabled.
pub const ACCOUNT_MAX_FAILS: u32 = 3;
/// How long a tripped account stays disabled.
pub const ACCOUNT_DISABLE_SECS: u64 = 300;

/// One upstream credential, as stored by the account-management collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    #[serde(default)]
    pub api_user: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub session_cookie: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default)]
struct AccountHealth {
    fail_count: u32,
    last_fail_unix: u64,
    disabled_until_unix: u64,
}

impl AccountHealth {
    #[inline]
    fn disabled_at(&self, now: u64) -> bool {
        now < self.disabled_until_unix
    }

    /// A disablement that has run out is forgotten entirely, so the account
    /// comes back with fresh counters.
    #[inline]
    fn expired_at(&self, now: u64) -> bool {
        self.disabled_until_unix != 0 && now >= self.disabled_until_unix
    }
}

/// Account counters for the health view.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AccountCounts {
    pub total: usize,
    pub eligible: usize,
    pub disabled: usize,
}

/// Hot-reloadable set of credentials with per-account failure tracking.
///
/// The snapshot is replaced atomically on [`AccountPool::load`]; readers
/// always observe a complete account list. Health records live across
/// reloads and are keyed by account name.
pub struct AccountPool {
    path: PathBuf,
    accounts: RwLock<Arc<Vec<Account>>>,
    health: Mutex<FxHashMap<String, AccountHealth>>,
}

impl AccountPool {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            accounts: RwLock::new(Arc::new(Vec::new())),
            health: Mutex::new(FxHashMap::default()),
        }
    }

    /// Re-read the account snapshot from the external store, keeping only
    /// enabled records that carry an API key.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when the file cannot be read or parsed.
    pub fn load(&self) -> Result<usize, RelayError> {
        let contents = std::fs::read(&self.path).map_err(|e| {
            RelayError::Config(format!(
                "failed to read accounts file {}: {e}",
                self.path.display()
            ))
        })?;
        let loaded = parse_accounts(&contents)?;
        let count = loaded.len();
        *self.accounts.write() = Arc::new(loaded);
        tracing::info!(count, "loaded accounts with API keys");
        Ok(count)
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Account>> {
        self.accounts.read().clone()
    }

    /// Pick a random eligible account whose name is not in `excluded`.
    ///
    /// When every non-excluded account is disabled, falls back to any
    /// non-excluded account (degraded mode). Returns `None` only when the
    /// non-excluded set itself is empty.
    #[must_use]
    pub fn pick(&self, excluded: &HashSet<String>) -> Option<Account> {
        self.pick_at(excluded, unix_now_secs())
    }

    fn pick_at(&self, excluded: &HashSet<String>, now: u64) -> Option<Account> {
        let snapshot = self.snapshot();
        let mut health = self.health.lock();
        health.retain(|_, record| !record.expired_at(now));

        let candidates: Vec<&Account> = snapshot
            .iter()
            .filter(|account| !excluded.contains(&account.name))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let eligible: Vec<&&Account> = candidates
            .iter()
            .filter(|account| {
                health
                    .get(&account.name)
                    .is_none_or(|record| !record.disabled_at(now))
            })
            .collect();

        if eligible.is_empty() {
            tracing::warn!(
                candidates = candidates.len(),
                "all non-excluded accounts are disabled, picking a disabled one"
            );
            return Some(candidates[fastrand::usize(..candidates.len())].clone());
        }
        Some((*eligible[fastrand::usize(..eligible.len())]).clone())
    }

    /// A successful proxy through an account zeroes its health record.
    pub fn record_success(&self, name: &str) {
        self.health.lock().remove(name);
    }

    /// Record an attributed failure; the third one disables the account for
    /// [`ACCOUNT_DISABLE_SECS`].
    pub fn record_failure(&self, name: &str) {
        self.record_failure_at(name, unix_now_secs());
    }

    fn record_failure_at(&self, name: &str, now: u64) {
        let mut health = self.health.lock();
        let record = health.entry(name.to_string()).or_default();
        if record.fail_count < ACCOUNT_MAX_FAILS {
            record.fail_count += 1;
        }
        record.last_fail_unix = now;
        if record.fail_count >= ACCOUNT_MAX_FAILS && record.disabled_until_unix == 0 {
            record.disabled_until_unix = now + ACCOUNT_DISABLE_SECS;
            tracing::warn!(
                account = name,
                fails = record.fail_count,
                disable_secs = ACCOUNT_DISABLE_SECS,
                "account disabled after repeated failures"
            );
        }
    }

    #[must_use]
    pub fn counts(&self) -> AccountCounts {
        self.counts_at(unix_now_secs())
    }

    fn counts_at(&self, now: u64) -> AccountCounts {
        let snapshot = self.snapshot();
        let health = self.health.lock();
        let disabled = snapshot
            .iter()
            .filter(|account| {
                health
                    .get(&account.name)
                    .is_some_and(|record| record.disabled_at(now))
            })
            .count();
        AccountCounts {
            total: snapshot.len(),
            eligible: snapshot.len() - disabled,
            disabled,
        }
    }
}

fn parse_accounts(contents: &[u8]) -> Result<Vec<Account>, RelayError> {
    let all: Vec<Account> = serde_json::from_slice(contents)
        .map_err(|e| RelayError::Config(format!("failed to parse accounts file: {e}")))?;
    Ok(all
        .into_iter()
        .filter(|account| account.enabled && !account.api_key.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(names: &[&str]) -> AccountPool {
        let pool = AccountPool::new(PathBuf::from("/nonexistent/accounts.json"));
        let accounts = names
            .iter()
            .map(|name| Account {
                name: (*name).to_string(),
                api_user: String::new(),
                api_key: format!("sk-{name}"),
                session_cookie: String::new(),
                enabled: true,
            })
            .collect();
        *pool.accounts.write() = Arc::new(accounts);
        pool
    }

    #[test]
    fn test_parse_accounts_filters_unusable_records() {
        let raw = br#"[
            {"name": "a", "api_key": "sk-a"},
            {"name": "b", "api_key": ""},
            {"name": "c", "api_key": "sk-c", "enabled": false},
            {"name": "d", "api_key": "sk-d", "session_cookie": "session=x"}
        ]"#;
        let accounts = parse_accounts(raw).unwrap();
        let names: Vec<&str> = accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a", "d"]);
        assert_eq!(accounts[1].session_cookie, "session=x");
    }

    #[test]
    fn test_parse_accounts_rejects_garbage() {
        assert!(matches!(
            parse_accounts(b"not json"),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_pick_respects_exclusion() {
        let pool = pool_with(&["a", "b"]);
        let excluded = HashSet::from(["a".to_string()]);
        for _ in 0..20 {
            let picked = pool.pick_at(&excluded, 1000).unwrap();
            assert_eq!(picked.name, "b");
        }
        let both = HashSet::from(["a".to_string(), "b".to_string()]);
        assert!(pool.pick_at(&both, 1000).is_none());
    }

    #[test]
    fn test_three_failures_disable_account() {
        let pool = pool_with(&["a", "b"]);
        for _ in 0..ACCOUNT_MAX_FAILS {
            pool.record_failure_at("a", 1000);
        }
        let excluded = HashSet::new();
        for _ in 0..20 {
            let picked = pool.pick_at(&excluded, 1001).unwrap();
            assert_eq!(picked.name, "b", "disabled account must not be handed out");
        }
        let counts = pool.counts_at(1001);
        assert_eq!(counts.total, 2);
        assert_eq!(counts.disabled, 1);
        assert_eq!(counts.eligible, 1);
    }

    #[test]
    fn test_disabled_account_returns_with_fresh_counters() {
        let pool = pool_with(&["a"]);
        for _ in 0..ACCOUNT_MAX_FAILS {
            pool.record_failure_at("a", 1000);
        }
        // Disabled for ACCOUNT_DISABLE_SECS, then eligible again.
        assert_eq!(pool.counts_at(1000 + ACCOUNT_DISABLE_SECS - 1).disabled, 1);
        let picked = pool.pick_at(&HashSet::new(), 1000 + ACCOUNT_DISABLE_SECS + 1);
        assert_eq!(picked.unwrap().name, "a");
        // The lazy reset dropped the record, so one new failure does not trip
        // the breaker again.
        pool.record_failure_at("a", 1000 + ACCOUNT_DISABLE_SECS + 2);
        assert_eq!(pool.counts_at(1000 + ACCOUNT_DISABLE_SECS + 3).disabled, 0);
    }

    #[test]
    fn test_success_zeroes_the_record() {
        let pool = pool_with(&["a"]);
        pool.record_failure_at("a", 1000);
        pool.record_failure_at("a", 1001);
        pool.record_success("a");
        pool.record_failure_at("a", 1002);
        assert_eq!(pool.counts_at(1003).disabled, 0);
    }

    #[test]
    fn test_degraded_fallback_when_everyone_is_disabled() {
        let pool = pool_with(&["a"]);
        for _ in 0..ACCOUNT_MAX_FAILS {
            pool.record_failure_at("a", 1000);
        }
        let picked = pool.pick_at(&HashSet::new(), 1001);
        assert_eq!(picked.unwrap().name, "a");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let pool = AccountPool::new(PathBuf::from("/definitely/not/here.json"));
        assert!(matches!(pool.load(), Err(RelayError::Config(_))));
    }
}
