use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::ClearBrowserCookiesParams;
use chromiumoxide::Page;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::RelayError;
use crate::transport::BROWSER_USER_AGENT;
use crate::util::unix_now_secs;

use super::cache::CookieSource;

/// Browser statistics for the health view.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserStats {
    pub running: bool,
    pub started_at_unix: Option<u64>,
    pub uptime_secs: u64,
    pub restart_count: u64,
    pub error_count: u64,
}

#[derive(Default)]
struct BrowserSlot {
    browser: Option<Arc<Browser>>,
    handler_task: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
    started_at_unix: Option<u64>,
}

/// Owns the one persistent headless Chromium process.
///
/// Start, stop, and restart serialize on the slot's write lock. Cookie
/// fetches clone the browser handle out under a brief read lock and
/// navigate without holding anything, so a hung navigation never blocks a
/// restart; a crash surfaces to the fetcher as an error and recovery stays
/// the caller's policy.
pub struct BrowserManager {
    slot: RwLock<BrowserSlot>,
    restart_count: AtomicU64,
    error_count: AtomicU64,
    proxy_url: String,
    chrome_executable: Option<String>,
    restart_after: Duration,
}

impl BrowserManager {
    #[must_use]
    pub fn new(proxy_url: &str, chrome_executable: Option<String>, restart_hours: u64) -> Self {
        Self {
            slot: RwLock::new(BrowserSlot::default()),
            restart_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            proxy_url: proxy_url.to_string(),
            chrome_executable,
            restart_after: Duration::from_secs(restart_hours * 3600),
        }
    }

    /// Start the browser if it is not already running.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Browser`] when Chromium cannot be launched.
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut slot = self.slot.write().await;
        if slot.browser.is_some() {
            tracing::debug!("browser already running");
            return Ok(());
        }
        self.start_locked(&mut slot).await
    }

    /// Stop the browser and release the process.
    pub async fn stop(&self) {
        let mut slot = self.slot.write().await;
        Self::cleanup_locked(&mut slot).await;
        tracing::info!("browser stopped");
    }

    /// Tear the current process down and launch a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Browser`] when the relaunch fails; the slot is
    /// left empty so the next fetch attempts a cold start.
    pub async fn restart(&self) -> Result<(), RelayError> {
        let mut slot = self.slot.write().await;
        tracing::info!("restarting browser");
        Self::cleanup_locked(&mut slot).await;
        self.restart_count.fetch_add(1, Ordering::Relaxed);
        self.start_locked(&mut slot).await
    }

    /// Whether the process has been up long enough for a scheduled restart.
    pub async fn should_restart(&self) -> bool {
        let slot = self.slot.read().await;
        slot.browser.is_some()
            && slot
                .started_at
                .is_some_and(|started| started.elapsed() >= self.restart_after)
    }

    pub async fn stats(&self) -> BrowserStats {
        let slot = self.slot.read().await;
        BrowserStats {
            running: slot.browser.is_some(),
            started_at_unix: slot.started_at_unix,
            uptime_secs: slot
                .started_at
                .map_or(0, |started| started.elapsed().as_secs()),
            restart_count: self.restart_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    /// Navigate a fresh page to `url`, wait `settle_ms` for the challenge
    /// script to install its cookies, and return the visible cookie jar.
    ///
    /// Starts the browser if needed, but does not restart on failure; the
    /// error is surfaced so the cookie cache can classify it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Browser`] on launch, navigation, or CDP
    /// failures.
    pub async fn fetch_cookies(
        &self,
        url: &str,
        settle_ms: u64,
    ) -> Result<HashMap<String, String>, RelayError> {
        self.ensure_running().await?;

        // Clone the handle out so the slot lock is not held across the
        // navigation; a concurrent restart invalidates this process and the
        // page operations below fail fast.
        let browser = {
            let slot = self.slot.read().await;
            match slot.browser.as_ref() {
                Some(browser) => Arc::clone(browser),
                None => return Err(RelayError::Browser("browser is not running".to_string())),
            }
        };

        let page = browser.new_page("about:blank").await.map_err(browser_err)?;
        let result = drive_page(&page, url, settle_ms).await;
        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "failed to close cookie page");
        }
        if result.is_err() {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn ensure_running(&self) -> Result<(), RelayError> {
        {
            let slot = self.slot.read().await;
            if slot.browser.is_some() {
                return Ok(());
            }
        }
        tracing::warn!("browser not running, starting");
        self.start().await
    }

    async fn start_locked(&self, slot: &mut BrowserSlot) -> Result<(), RelayError> {
        tracing::info!(proxy = %self.proxy_url, "launching headless browser");
        match self.launch().await {
            Ok((browser, handler_task)) => {
                slot.browser = Some(Arc::new(browser));
                slot.handler_task = Some(handler_task);
                slot.started_at = Some(Instant::now());
                slot.started_at_unix = Some(unix_now_secs());
                tracing::info!("browser started");
                Ok(())
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Self::cleanup_locked(slot).await;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<(Browser, JoinHandle<()>), RelayError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg(format!("--proxy-server={}", self.proxy_url))
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--no-first-run")
            .arg("--no-zygote");
        if let Some(path) = &self.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| RelayError::Browser(format!("browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(browser_err)?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("browser handler event error, handler loop ending");
                    break;
                }
            }
        });
        Ok((browser, handler_task))
    }

    async fn cleanup_locked(slot: &mut BrowserSlot) {
        if let Some(browser) = slot.browser.take() {
            match Arc::try_unwrap(browser) {
                Ok(mut browser) => match browser.close().await {
                    Ok(_) => {
                        if let Err(e) = browser.wait().await {
                            tracing::debug!(error = %e, "browser did not exit cleanly");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "error closing browser, killing the process");
                        if let Some(Err(kill_err)) = browser.kill().await {
                            tracing::warn!(error = %kill_err, "failed to kill browser process");
                        }
                    }
                },
                // An in-flight fetch still holds a handle; its page calls
                // will fail and the process dies when that handle drops.
                Err(shared) => {
                    tracing::warn!("browser handle still in use, deferring process teardown");
                    drop(shared);
                }
            }
        }
        if let Some(task) = slot.handler_task.take() {
            task.abort();
        }
        slot.started_at = None;
        slot.started_at_unix = None;
    }
}

async fn drive_page(
    page: &Page,
    url: &str,
    settle_ms: u64,
) -> Result<HashMap<String, String>, RelayError> {
    page.execute(SetUserAgentOverrideParams::new(BROWSER_USER_AGENT))
        .await
        .map_err(browser_err)?;
    // Fresh jar per fetch so stale challenge cookies never leak into the
    // result.
    page.execute(ClearBrowserCookiesParams::default())
        .await
        .map_err(browser_err)?;
    page.goto(url).await.map_err(browser_err)?;
    tokio::time::sleep(Duration::from_millis(settle_ms)).await;

    let cookies = page.get_cookies().await.map_err(browser_err)?;
    let jar: HashMap<String, String> = cookies
        .into_iter()
        .map(|cookie| (cookie.name, cookie.value))
        .collect();
    tracing::debug!(count = jar.len(), url, "collected cookies");
    Ok(jar)
}

fn browser_err(e: chromiumoxide::error::CdpError) -> RelayError {
    RelayError::Browser(e.to_string())
}

/// Adapter that lets the cookie cache drive the browser without knowing
/// about pages or CDP.
pub struct BrowserCookieSource {
    pub browser: Arc<BrowserManager>,
    pub login_url: String,
    pub page_wait_ms: u64,
}

impl CookieSource for BrowserCookieSource {
    fn fetch(&self) -> BoxFuture<'_, Result<HashMap<String, String>, RelayError>> {
        self.browser
            .fetch_cookies(&self.login_url, self.page_wait_ms)
            .boxed()
    }

    fn recover(&self) -> BoxFuture<'_, Result<(), RelayError>> {
        self.browser.restart().boxed()
    }

    fn due_for_restart(&self) -> BoxFuture<'_, bool> {
        self.browser.should_restart().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_manager_reports_not_running() {
        let manager = BrowserManager::new("http://127.0.0.1:7890", None, 6);
        let stats = manager.stats().await;
        assert!(!stats.running);
        assert_eq!(stats.uptime_secs, 0);
        assert_eq!(stats.restart_count, 0);
        assert!(stats.started_at_unix.is_none());
    }

    #[tokio::test]
    async fn test_should_restart_requires_running_browser() {
        let manager = BrowserManager::new("http://127.0.0.1:7890", None, 0);
        assert!(!manager.should_restart().await);
    }

    #[tokio::test]
    async fn test_stop_on_idle_manager_is_a_noop() {
        let manager = BrowserManager::new("http://127.0.0.1:7890", None, 6);
        manager.stop().await;
        assert!(!manager.stats().await.running);
    }
}
