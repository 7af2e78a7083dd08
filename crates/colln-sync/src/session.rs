//! Page session adaptor: one browser session per run, turning strategy calls
//! into a [`Collector`] with panic recovery and per-URL body caching.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use colln_adapters::{
    BodyOutcome, ExtractionError, ExtractionStrategy, ListContext, Page, PortalEndpoints,
    SkipReason, TabCapture, ViewPlan,
};
use colln_browser::{BrowserError, PageDriver, PageTarget, RenderedPage, Viewport};
use colln_core::{format_data_time, normalize_timestamp, End, Location, News, Profile};
use colln_storage::{canonical_key, write_atomic, CacheError, DumpDirectory, ResultCache, StorageError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics::CollectorMetrics;

/// Scrolls to the bottom in steps so lazily rendered lists exist before capture.
pub const SCROLL_BOTTOM: &str = r#"(async () => {
  for (let y = 0; y < document.body.scrollHeight; y += window.innerHeight) {
    window.scrollTo(0, y);
    await new Promise((r) => setTimeout(r, 100));
  }
  window.scrollTo(0, 0);
})();"#;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("page session is {state}, cannot {action}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("saving page capture: {0:#}")]
    Capture(anyhow::Error),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    StructuralDrift,
    UnexpectedSkip,
    Extraction,
    Cache,
    Browser,
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl BodyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BodyError::Extraction(err) if err.is_structural() => ErrorClass::StructuralDrift,
            BodyError::Extraction(ExtractionError::UnexpectedShape { .. }) => ErrorClass::UnexpectedSkip,
            BodyError::Extraction(_) => ErrorClass::Extraction,
            BodyError::Cache(_) => ErrorClass::Cache,
            BodyError::Browser(_) => ErrorClass::Browser,
        }
    }
}

/// Successful end fetch. A skip is a known body-less shape, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStatus {
    Cached,
    Extracted,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Open(Location),
    FetchingBody,
    Closed,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Unopened => "unopened",
            SessionState::Open(Location::Top) => "open on top",
            SessionState::Open(Location::Home) => "open on home",
            SessionState::FetchingBody => "fetching a news end",
            SessionState::Closed => "closed",
        }
    }
}

/// Uniform collection capability driven by a run.
#[async_trait]
pub trait Collector: Send {
    async fn open(&mut self, location: Location) -> Result<(), SessionError>;

    async fn list_articles(&mut self, location: Location) -> Result<Vec<News>, SessionError>;

    async fn fetch_body(&mut self, news: &mut News) -> Result<BodyStatus, BodyError>;

    /// Releases the browser session. Safe to call more than once.
    async fn cleanup(&mut self);
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoints: PortalEndpoints,
    pub profile: Profile,
    pub dump_root: PathBuf,
    pub idle_settle: Duration,
    pub utc_offset: FixedOffset,
    pub cache_ttl: Duration,
}

struct Capture {
    location: Location,
    target: PageTarget,
    page: RenderedPage,
}

pub struct PageSession {
    driver: Box<dyn PageDriver>,
    strategy: Arc<dyn ExtractionStrategy>,
    cache: Arc<ResultCache>,
    metrics: Arc<CollectorMetrics>,
    options: SessionOptions,
    state: SessionState,
    capture: Option<Capture>,
}

impl PageSession {
    pub fn new(
        driver: Box<dyn PageDriver>,
        strategy: Arc<dyn ExtractionStrategy>,
        cache: Arc<ResultCache>,
        metrics: Arc<CollectorMetrics>,
        options: SessionOptions,
    ) -> Self {
        Self {
            driver,
            strategy,
            cache,
            metrics,
            options,
            state: SessionState::Unopened,
            capture: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.options.utc_offset)
    }

    fn target(&self, url: &str) -> PageTarget {
        let profile = self.options.profile;
        PageTarget::new(
            url,
            Viewport {
                width: profile.width,
                height: profile.height,
                is_mobile: profile.mobile,
                has_touch: profile.mobile,
            },
        )
        .with_user_agent(profile.user_agent)
        .with_settle(self.options.idle_settle)
    }

    /// Renders `target`; a destroyed context or idle timeout is retried once
    /// with the relaxed `load` wait.
    async fn render_settled(
        &mut self,
        target: PageTarget,
    ) -> Result<(PageTarget, RenderedPage), BrowserError> {
        match self.driver.render(&target).await {
            Ok(page) => Ok((target, page)),
            Err(err) if err.is_context_destroyed() || err.is_timeout() => {
                warn!(url = %target.url, error = %err, "page did not settle, capturing after load only");
                let relaxed = target.relaxed();
                let page = self.driver.render(&relaxed).await?;
                Ok((relaxed, page))
            }
            Err(err) => Err(err),
        }
    }

    fn ensure_open(&self, action: &'static str) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::InvalidState {
                state: self.state.name(),
                action,
            });
        }
        Ok(())
    }

    fn extract_list(
        &self,
        location: Location,
        dump: &DumpDirectory,
        page: &RenderedPage,
    ) -> Result<(Vec<News>, Vec<TabCapture>), ExtractionError> {
        let strategy = Arc::clone(&self.strategy);
        guard(|| {
            let parsed = Page::parse(&page.url, &page.html);
            let mut ctx = ListContext::new(dump);
            let items = match location {
                Location::Top => strategy.list_top(&parsed, &mut ctx)?,
                Location::Home => strategy.list_home(&parsed, &mut ctx)?,
            };
            Ok((items, ctx.into_tab_captures()))
        })
    }

    async fn save_tabs(&mut self, target: &PageTarget, dump: &DumpDirectory, tabs: Vec<TabCapture>) {
        for tab in tabs {
            let path = dump.tab_screenshot(tab.tab);
            let shot = match self.driver.screenshot(target, Some(&tab.selector)).await {
                Ok(shot) => shot,
                Err(err) => {
                    warn!(tab = tab.tab, selector = %tab.selector, error = %err, "tab screenshot failed");
                    continue;
                }
            };
            if let Err(err) = write_atomic(&path, &shot).await {
                warn!(path = %path.display(), error = %format!("{err:#}"), "writing tab screenshot failed");
            }
        }
    }

    fn normalize(&self, url: &str, field: &'static str, raw: &str) -> String {
        match normalize_timestamp(raw, self.options.utc_offset) {
            Some(normalized) => normalized,
            None => {
                if !raw.trim().is_empty() {
                    warn!(url, field, raw, "no accepted timestamp layout matched, keeping raw value");
                }
                raw.to_string()
            }
        }
    }

    async fn fetch_uncached(&mut self, news: &mut News, key: &str) -> Result<BodyStatus, BodyError> {
        let target = self.target(&news.url);
        self.state = SessionState::FetchingBody;
        self.capture = None;
        let (_, rendered) = self.render_settled(target).await?;
        let collected_at = format_data_time(self.now());

        let strategy = Arc::clone(&self.strategy);
        let outcome = guard(|| {
            let parsed = Page::parse(&rendered.url, &rendered.html);
            strategy.extract_body(&parsed, news)
        })?;

        match outcome {
            BodyOutcome::Skipped(reason) => {
                info!(url = %news.url, reason = reason.as_str(), "news end has no extractable body");
                Ok(BodyStatus::Skipped(reason))
            }
            BodyOutcome::Extracted(end) => {
                let mut end: End = *end;
                end.collected_at = collected_at;
                end.posted_at = self.normalize(&news.url, "posted_at", &end.posted_at);
                end.modified_at = self.normalize(&news.url, "modified_at", &end.modified_at);
                let cacheable = End {
                    html: String::new(),
                    ..end.clone()
                };
                match self.cache.set(key, Some(&cacheable), self.options.cache_ttl) {
                    Err(CacheError::RecordTooLarge { size, max, .. }) => {
                        warn!(url = %news.url, size, max, "news end too large to cache");
                    }
                    other => other?,
                }
                news.end = Some(end);
                Ok(BodyStatus::Extracted)
            }
        }
    }
}

#[async_trait]
impl Collector for PageSession {
    async fn open(&mut self, location: Location) -> Result<(), SessionError> {
        self.ensure_open("open a page")?;
        let url = match location {
            Location::Top => self.options.endpoints.top_url.clone(),
            Location::Home => self.options.endpoints.home_url.clone(),
        };

        let mut target = self.target(&url);
        match location {
            Location::Top => target = target.with_script(SCROLL_BOTTOM),
            Location::Home => {
                let mut view = ViewPlan::default();
                self.strategy.prepare_home_view(&mut view);
                for script in view.scripts {
                    target = target.with_script(script);
                }
            }
        }

        let (target, page) = self.render_settled(target).await?;
        debug!(url = %page.url, bytes = page.html.len(), "page opened");
        self.capture = Some(Capture {
            location,
            target,
            page,
        });
        self.state = SessionState::Open(location);
        Ok(())
    }

    async fn list_articles(&mut self, location: Location) -> Result<Vec<News>, SessionError> {
        self.ensure_open("list articles")?;
        let (target, page) = match self.capture.as_ref() {
            Some(capture) if capture.location == location => {
                (capture.target.clone(), capture.page.clone())
            }
            _ => {
                return Err(SessionError::InvalidState {
                    state: self.state.name(),
                    action: "list articles",
                })
            }
        };

        let started = Instant::now();
        let now = self.now();
        let dump = DumpDirectory::allocate(&self.options.dump_root, location.dump_tag(), now);
        dump.init()?;

        let shot = self.driver.screenshot(&target, None).await?;
        write_atomic(&dump.full_screenshot(), &shot)
            .await
            .map_err(SessionError::Capture)?;
        write_atomic(&dump.full_html(), page.html.as_bytes())
            .await
            .map_err(SessionError::Capture)?;

        let (mut items, tabs) = self.extract_list(location, &dump, &page)?;
        items.sort_by_key(News::layout_key);

        let collected_at = format_data_time(now);
        for item in &mut items {
            item.location = Some(location);
            item.collected_at = collected_at.clone();
        }

        self.save_tabs(&target, &dump, tabs).await;
        self.metrics.record_news(location, items.len());
        self.metrics.observe_list(location, started.elapsed());
        info!(%location, count = items.len(), dump = %dump.path().display(), "listed news");
        Ok(items)
    }

    async fn fetch_body(&mut self, news: &mut News) -> Result<BodyStatus, BodyError> {
        if self.state == SessionState::Closed {
            return Err(BodyError::Browser(BrowserError::Closed));
        }

        let started = Instant::now();
        let key = canonical_key(&news.url)?;
        if let Some(end) = self.cache.get::<End>(&key)? {
            debug!(url = %news.url, "news end served from cache");
            news.end = Some(end);
            return Ok(BodyStatus::Cached);
        }

        let result = self.fetch_uncached(news, &key).await;
        self.metrics.observe_end(started.elapsed());
        result
    }

    async fn cleanup(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Err(err) = self.driver.close().await {
            warn!(error = %err, "closing browser session failed");
        }
        self.capture = None;
        self.state = SessionState::Closed;
    }
}

/// Runs strategy code, converting a panic into [`ExtractionError::Invariant`].
pub fn guard<T>(f: impl FnOnce() -> Result<T, ExtractionError>) -> Result<T, ExtractionError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ExtractionError::Invariant {
            message: panic_message(payload.as_ref()),
            backtrace: Backtrace::force_capture().to_string(),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "errorless panic".to_string()
    }
}
