//! One collection run: Top and Home lists with bounded retries, the per-article
//! body loop with its error policy, then the outputs.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use colln_adapters::{strategy_for, ExtractionStrategy, PortalEndpoints};
use colln_browser::{BrowserConfig, BrowserError, BrowserlessDriver, PageDriver};
use colln_core::{DeviceType, Location, News, Source};
use colln_storage::{ensure_writable_dir, ResultCache, StorageError};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::CollectConfig;
use crate::metrics::CollectorMetrics;
use crate::output::{write_outputs, OutputLayout};
use crate::session::{
    panic_message, BodyError, BodyStatus, Collector, ErrorClass, PageSession, SessionError,
    SessionOptions,
};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("collector source {portal} for {device} is not supported")]
    Unsupported { portal: Source, device: DeviceType },
    #[error("getting {location} news list failed after {attempts} attempts: {last}")]
    ListExhausted {
        location: Location,
        attempts: u32,
        #[source]
        last: SessionError,
    },
    #[error("getting news end for {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: BodyError,
    },
    #[error("collection run panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0:#}")]
    Output(anyhow::Error),
}

/// What a body-fetch failure does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyErrorPolicy {
    Strict,
    Ignore,
}

impl From<bool> for BodyErrorPolicy {
    fn from(ignore_body_errors: bool) -> Self {
        if ignore_body_errors {
            BodyErrorPolicy::Ignore
        } else {
            BodyErrorPolicy::Strict
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Abort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BodyTally {
    pub extracted: usize,
    pub cached: usize,
    pub skipped: usize,
    pub ignored_errors: usize,
    pub fatal_errors: usize,
}

impl BodyTally {
    /// Counts one body result. Skips never count as errors.
    pub fn record(
        &mut self,
        result: &Result<BodyStatus, BodyError>,
        policy: BodyErrorPolicy,
    ) -> Disposition {
        match result {
            Ok(BodyStatus::Extracted) => self.extracted += 1,
            Ok(BodyStatus::Cached) => self.cached += 1,
            Ok(BodyStatus::Skipped(_)) => self.skipped += 1,
            Err(_) if policy == BodyErrorPolicy::Ignore => self.ignored_errors += 1,
            Err(_) => {
                self.fatal_errors += 1;
                return Disposition::Abort;
            }
        }
        Disposition::Continue
    }
}

fn end_status(result: &Result<BodyStatus, BodyError>, disposition: Disposition) -> &'static str {
    match (result, disposition) {
        (Ok(BodyStatus::Extracted), _) => "extracted",
        (Ok(BodyStatus::Cached), _) => "cached",
        (Ok(BodyStatus::Skipped(_)), _) => "skipped",
        (Err(_), Disposition::Continue) => "ignored",
        (Err(_), Disposition::Abort) => "failed",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<FixedOffset>,
    pub finished_at: DateTime<FixedOffset>,
    pub top_count: usize,
    pub home_count: usize,
    pub extracted: usize,
    pub cached: usize,
    pub skipped: usize,
    pub ignored_errors: usize,
    pub fatal_errors: usize,
    pub dump_file: PathBuf,
    pub dump_sha256: String,
    pub list_files: Vec<PathBuf>,
}

/// Launches one browser session per run.
pub trait DriverFactory: Send + Sync {
    fn launch(&self) -> Result<Box<dyn PageDriver>, BrowserError>;
}

impl DriverFactory for BrowserConfig {
    fn launch(&self) -> Result<Box<dyn PageDriver>, BrowserError> {
        Ok(Box::new(BrowserlessDriver::new(self.clone())?))
    }
}

pub struct Collection {
    config: CollectConfig,
    strategy: Arc<dyn ExtractionStrategy>,
    endpoints: PortalEndpoints,
    cache: Arc<ResultCache>,
    metrics: Arc<CollectorMetrics>,
    drivers: Arc<dyn DriverFactory>,
}

impl Collection {
    /// Resolves the strategy for the configured pair; unsupported pairs fail here,
    /// before any run starts.
    pub fn new(config: CollectConfig) -> Result<Self, RunError> {
        let strategy: Arc<dyn ExtractionStrategy> = strategy_for(config.source, config.device)
            .ok_or(RunError::Unsupported {
                portal: config.source,
                device: config.device,
            })?
            .into();
        let drivers = Arc::new(config.browser.clone());
        Ok(Self::with_parts(config, strategy, drivers))
    }

    pub fn with_parts(
        config: CollectConfig,
        strategy: Arc<dyn ExtractionStrategy>,
        drivers: Arc<dyn DriverFactory>,
    ) -> Self {
        let endpoints = strategy.endpoints();
        let cache = Arc::new(ResultCache::new(config.cache));
        let metrics = Arc::new(CollectorMetrics::new(config.source, config.device));
        Self {
            config,
            strategy,
            endpoints,
            cache,
            metrics,
            drivers,
        }
    }

    pub fn with_endpoints(mut self, endpoints: PortalEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn config(&self) -> &CollectConfig {
        &self.config
    }

    pub fn cache(&self) -> Arc<ResultCache> {
        Arc::clone(&self.cache)
    }

    pub fn metrics(&self) -> Arc<CollectorMetrics> {
        Arc::clone(&self.metrics)
    }

    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.config.utc_offset)
    }

    pub async fn run_once(&self) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "collect_run",
            %run_id,
            source = %self.config.source,
            device = %self.config.device
        );
        async move {
            let result = self.run_with_session(run_id).await;
            self.metrics.record_run(result.is_ok(), Utc::now());
            match &result {
                Ok(report) => info!(
                    top = report.top_count,
                    home = report.home_count,
                    extracted = report.extracted,
                    cached = report.cached,
                    skipped = report.skipped,
                    ignored = report.ignored_errors,
                    dump = %report.dump_file.display(),
                    "collection run finished"
                ),
                Err(err) => error!(error = %err, "collection run failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_with_session(&self, run_id: Uuid) -> Result<RunReport, RunError> {
        let started_at = self.now();
        let layout = OutputLayout::new(self.config.platform_root(), started_at);
        ensure_writable_dir(&layout.list_dir())?;
        info!(root = %self.config.platform_root().display(), "collecting news");

        let driver = self.drivers.launch()?;
        let mut session = PageSession::new(
            driver,
            Arc::clone(&self.strategy),
            Arc::clone(&self.cache),
            Arc::clone(&self.metrics),
            SessionOptions {
                endpoints: self.endpoints.clone(),
                profile: self.config.device.profile(),
                dump_root: layout.dump_root(),
                idle_settle: self.config.idle_settle,
                utc_offset: self.config.utc_offset,
                cache_ttl: self.cache.ttl(),
            },
        );

        let outcome = AssertUnwindSafe(self.collect(&mut session, run_id, started_at, &layout))
            .catch_unwind()
            .await;
        session.cleanup().await;

        match outcome {
            Ok(result) => result,
            Err(payload) => Err(RunError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// Body of a run against any [`Collector`]. The caller owns cleanup.
    pub async fn collect(
        &self,
        collector: &mut dyn Collector,
        run_id: Uuid,
        started_at: DateTime<FixedOffset>,
        layout: &OutputLayout,
    ) -> Result<RunReport, RunError> {
        let top = fetch_list(collector, Location::Top, &self.config).await?;
        let home = fetch_list(collector, Location::Home, &self.config).await?;
        let (top_count, home_count) = (top.len(), home.len());

        let mut news = top;
        news.extend(home);
        info!(count = news.len(), "getting news ends");

        let tally = fetch_bodies(collector, &mut news, self.config.ignore_body_errors.into(), &self.metrics).await?;

        let written = write_outputs(layout, &news, self.config.list_format)
            .await
            .map_err(RunError::Output)?;

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: self.now(),
            top_count,
            home_count,
            extracted: tally.extracted,
            cached: tally.cached,
            skipped: tally.skipped,
            ignored_errors: tally.ignored_errors,
            fatal_errors: tally.fatal_errors,
            dump_file: written.dump.path,
            dump_sha256: written.dump.sha256,
            list_files: written.lists,
        })
    }
}

/// Opens and lists `location`, retrying `list_retries` times with a fixed
/// delay between attempts.
pub async fn fetch_list(
    collector: &mut dyn Collector,
    location: Location,
    config: &CollectConfig,
) -> Result<Vec<News>, RunError> {
    let attempts = config.list_retries + 1;
    let mut attempt = 0;
    loop {
        attempt += 1;
        info!(%location, attempt, max = attempts, "getting news list");

        let result = match collector.open(location).await {
            Ok(()) => collector.list_articles(location).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(items) => return Ok(items),
            Err(err) if attempt < attempts => {
                warn!(%location, attempt, max = attempts, error = %err, "failed to get news list, retrying");
                tokio::time::sleep(config.list_retry_delay).await;
            }
            Err(err) => {
                return Err(RunError::ListExhausted {
                    location,
                    attempts,
                    last: err,
                })
            }
        }
    }
}

/// Fetches every article body in order, applying `policy` to failures.
pub async fn fetch_bodies(
    collector: &mut dyn Collector,
    news: &mut [News],
    policy: BodyErrorPolicy,
    metrics: &CollectorMetrics,
) -> Result<BodyTally, RunError> {
    let total = news.len();
    let mut tally = BodyTally::default();

    for (idx, item) in news.iter_mut().enumerate() {
        let span = info_span!("fetch_body", url = %item.url);
        let result = collector.fetch_body(item).instrument(span).await;
        let disposition = tally.record(&result, policy);
        metrics.record_end_status(end_status(&result, disposition));

        if let Err(err) = result {
            if disposition == Disposition::Abort {
                return Err(RunError::Body {
                    url: item.url.clone(),
                    source: err,
                });
            }
            match err.class() {
                ErrorClass::UnexpectedSkip => {
                    warn!(url = %item.url, error = %err, "unexpected news end shape, continuing")
                }
                class => {
                    warn!(url = %item.url, ?class, error = %err, "failed to get news end, continuing")
                }
            }
        }

        if let Some(end) = item.end.as_mut() {
            end.html.clear();
        }

        let done = idx + 1;
        if done % 10 == 0 {
            info!(done, total, percent = done * 100 / total, "news end progress");
        }
    }
    Ok(tally)
}
