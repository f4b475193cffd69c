use std::sync::Arc;

use crate::accounts::AccountPool;
use crate::checkin::CheckinTracker;
use crate::config::AppConfig;
use crate::keyauth::KeyValidator;
use crate::sites::SiteRouter;
use crate::transport::HttpTransport;
use crate::waf::{BrowserCookieSource, BrowserManager, WafCookieCache};

/// Shared application state accessible to all handlers.
///
/// The mutable pieces (cookie cache, account health, site router state) are
/// deliberate process-scoped state owned here and handed to the proxy
/// handler as collaborators.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    pub accounts: AccountPool,
    pub sites: SiteRouter,
    pub browser: Arc<BrowserManager>,
    pub waf: Arc<WafCookieCache>,
    pub key_validator: KeyValidator,
    pub checkin: CheckinTracker,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig) -> Arc<Self> {
        let transport = HttpTransport::new(&config.proxy_url);
        let accounts = AccountPool::new(config.accounts_file.clone());
        let sites = SiteRouter::new(config.sites.clone());
        let browser = Arc::new(BrowserManager::new(
            &config.proxy_url,
            config.browser.chrome_executable.clone(),
            config.browser.restart_hours,
        ));
        let waf = WafCookieCache::new(
            Arc::new(BrowserCookieSource {
                browser: Arc::clone(&browser),
                login_url: config.waf.login_url.clone(),
                page_wait_ms: config.waf.page_wait_ms,
            }),
            config.waf.clone(),
        );
        let key_validator = KeyValidator::new(config.key_validation.clone());

        Arc::new(Self {
            config,
            transport,
            accounts,
            sites,
            browser,
            waf,
            key_validator,
            checkin: CheckinTracker::default(),
        })
    }
}
