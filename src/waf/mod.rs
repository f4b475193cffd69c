pub mod browser;
pub mod cache;

pub use browser::{BrowserCookieSource, BrowserManager};
pub use cache::{CookieSource, CookieState, WafCookieCache};
