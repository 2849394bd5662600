//! Interactive session layer.
//!
//! The processor only sees the [`SessionProvider`] / [`SessionHandle`] pair:
//! - `chrome`: a real Chrome/Edge instance driven over the DevTools Protocol
//! - `scripted` (feature `testing`): an in-memory page whose content is scripted
//!
//! Controls are located either by CSS selector or by approximate label; the
//! label strategy is pluggable through [`TextMatcher`].

pub mod cdp;
pub mod chrome;
pub mod matcher;
#[cfg(any(test, feature = "testing"))]
pub mod scripted;

use aimatch_core::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use chrome::{BrowserEngine, ChromeProvider};
pub use matcher::{BestMatcher, ContainsMatcher, ExactMatcher, TextMatcher};

/// A located element, valid until the next navigation or reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef {
    /// Session-local handle for the element.
    pub ref_id: String,
    /// Visible text at the time it was located, if any.
    pub text: Option<String>,
}

/// One live interactive session. Owned by exactly one caller at a time.
#[async_trait]
pub trait SessionHandle: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    async fn reload(&mut self) -> Result<()>;

    /// Wait until `selector` matches. Fails with `Error::Timeout` when it
    /// does not appear in time.
    async fn wait_for_element(&mut self, selector: &str, timeout: Duration) -> Result<ElementRef>;

    /// Locate the element whose text best matches `text` under `matcher`.
    /// Fails with `Error::UiElementNotFound` when nothing qualifies in time.
    async fn find_by_text(
        &mut self,
        text: &str,
        matcher: &dyn TextMatcher,
        timeout: Duration,
    ) -> Result<ElementRef>;

    async fn click(&mut self, element: &ElementRef) -> Result<()>;

    /// Type `text` into the element. A trailing newline submits.
    async fn send_text(&mut self, element: &ElementRef, text: &str) -> Result<()>;

    /// Visible text of the whole page.
    async fn page_text(&mut self) -> Result<String>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions bound to a persistent profile.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self) -> Result<Box<dyn SessionHandle>>;
}
