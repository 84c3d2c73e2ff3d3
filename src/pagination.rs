use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::source::GalleryPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    MoreAvailable,
    /// Terminal.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct PaginationSettings {
    /// Upper bound on the wait for an actionable "load more" control.
    pub load_more_timeout: Duration,
    /// Pause after each action so new content can materialize.
    pub settle_delay: Duration,
    /// Rounds after which a page is considered exhausted regardless of its signals.
    pub max_rounds: usize,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            load_more_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
            max_rounds: 200,
        }
    }
}

/// Decides, one step at a time, whether a gallery page has more content.
#[async_trait]
pub trait Paginator: Send {
    fn state(&self) -> PaginationState;
    /// Perform one pagination step. Page errors never escape: they exhaust the page.
    async fn advance(&mut self, page: &mut dyn GalleryPage) -> PaginationState;
}

/// Tag-count termination heuristic.
///
/// Each step first waits (bounded) for a "load more" control. If one is triggered the
/// page stays `MoreAvailable`. Otherwise the page is scrolled to the bottom and the
/// rendered tag count re-observed; an unchanged count means `Exhausted`.
///
/// This is a best-effort signal. Slow lazy loading can end a crawl early, and a page
/// that keeps growing is only stopped by the cap or `max_rounds`.
pub struct PaginationController {
    settings: PaginationSettings,
    state: PaginationState,
    rounds: usize,
}

impl PaginationController {
    pub fn new(settings: PaginationSettings) -> Self {
        Self { settings, state: PaginationState::MoreAvailable, rounds: 0 }
    }

    async fn step(&self, page: &mut dyn GalleryPage) -> anyhow::Result<PaginationState> {
        let prior = page.tag_count().await?;
        match tokio::time::timeout(self.settings.load_more_timeout, page.load_more()).await {
            Ok(Ok(true)) => {
                settle(self.settings.settle_delay).await;
                return Ok(PaginationState::MoreAvailable);
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => debug!(error = %e, "load-more control not actionable"),
            Err(_) => debug!(timeout = ?self.settings.load_more_timeout, "no load-more control in time"),
        }
        page.scroll_to_bottom().await?;
        settle(self.settings.settle_delay).await;
        let current = page.tag_count().await?;
        debug!(prior, current, "re-observed tag count after scroll");
        Ok(if current == prior { PaginationState::Exhausted } else { PaginationState::MoreAvailable })
    }
}

#[async_trait]
impl Paginator for PaginationController {
    fn state(&self) -> PaginationState { self.state }

    async fn advance(&mut self, page: &mut dyn GalleryPage) -> PaginationState {
        if self.state == PaginationState::Exhausted { return self.state; }
        self.rounds += 1;
        self.state = match self.step(page).await {
            Ok(s) => s,
            Err(e) => {
                warn!(url = %page.base_url(), error = %e, "render failure during pagination");
                PaginationState::Exhausted
            }
        };
        if self.rounds >= self.settings.max_rounds && self.state == PaginationState::MoreAvailable {
            debug!(rounds = self.rounds, "pagination round limit reached");
            self.state = PaginationState::Exhausted;
        }
        self.state
    }
}

/// Paginator for sources with an explicit next-page signal: more content exists
/// exactly when the "load more" control (e.g. a `rel="next"` link) could be followed.
pub struct NextPageSignal {
    settings: PaginationSettings,
    state: PaginationState,
    rounds: usize,
}

impl NextPageSignal {
    pub fn new(settings: PaginationSettings) -> Self {
        Self { settings, state: PaginationState::MoreAvailable, rounds: 0 }
    }
}

#[async_trait]
impl Paginator for NextPageSignal {
    fn state(&self) -> PaginationState { self.state }

    async fn advance(&mut self, page: &mut dyn GalleryPage) -> PaginationState {
        if self.state == PaginationState::Exhausted { return self.state; }
        self.rounds += 1;
        let followed = match tokio::time::timeout(self.settings.load_more_timeout, page.load_more()).await {
            Ok(Ok(followed)) => followed,
            Ok(Err(e)) => {
                warn!(url = %page.base_url(), error = %e, "next page failed to load");
                false
            }
            Err(_) => false,
        };
        self.state = if followed && self.rounds < self.settings.max_rounds {
            settle(self.settings.settle_delay).await;
            PaginationState::MoreAvailable
        } else {
            PaginationState::Exhausted
        };
        self.state
    }
}

pub(crate) async fn settle(delay: Duration) {
    if !delay.is_zero() { tokio::time::sleep(delay).await; }
}
