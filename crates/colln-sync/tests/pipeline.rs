use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use colln_adapters::{
    BodyOutcome, ExtractionError, ExtractionStrategy, Inspect, ListContext, Page, PortalEndpoints,
    SkipReason,
};
use colln_browser::{BrowserError, PageDriver, PageTarget, RenderedPage, WaitUntil};
use colln_core::{DeviceType, End, ListFormat, Location, News, Profile, Source};
use colln_storage::{canonical_key, CacheConfig, CacheError, ResultCache};
use colln_sync::{
    BodyError, CollectConfig, Collection, Collector, CollectorMetrics, DriverFactory, ErrorClass,
    PageSession, RunError, SessionError, SessionOptions,
};
use flate2::read::GzDecoder;

const TOP_URL: &str = "http://portal.test/top";
const HOME_URL: &str = "http://portal.test/home";

const TOP_HTML: &str = r#"<html><body>
<a href="http://portal.test/v/2" data-page="2" data-order="1">두번째</a>
<a href="http://portal.test/v/1" data-page="2" data-order="0">첫번째</a>
</body></html>"#;

const HOME_HTML: &str = r#"<html><body>
<a href="http://portal.test/photo/3" data-page="1" data-order="0">화보</a>
</body></html>"#;

const ARTICLE_HTML: &str = "<html><body><p>본문</p></body></html>";

#[derive(Clone, Default)]
struct Renders(Arc<Mutex<Vec<(String, WaitUntil)>>>);

impl Renders {
    fn count(&self, url: &str) -> usize {
        self.waits(url).len()
    }

    fn waits(&self, url: &str) -> Vec<WaitUntil> {
        self.0
            .lock()
            .expect("renders")
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, wait)| *wait)
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    ContextDestroyed,
    Timeout,
}

impl Fault {
    fn error(self, url: &str) -> BrowserError {
        match self {
            Fault::ContextDestroyed => BrowserError::Api {
                status: 500,
                message: format!("Execution context was destroyed, most likely because of a navigation ({url})"),
            },
            Fault::Timeout => BrowserError::Timeout(format!("{url} never went idle")),
        }
    }
}

/// Renders of a url that fail before the page comes back, shared across drivers.
#[derive(Clone, Default)]
struct Faults(Arc<Mutex<HashMap<String, (Fault, usize)>>>);

impl Faults {
    fn inject(&self, url: &str, fault: Fault, times: usize) {
        self.0.lock().expect("faults").insert(url.to_string(), (fault, times));
    }

    fn take(&self, url: &str) -> Option<Fault> {
        let mut faults = self.0.lock().expect("faults");
        let (fault, remaining) = faults.get_mut(url)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*fault)
    }
}

struct FakeDriver {
    pages: HashMap<String, String>,
    renders: Renders,
    faults: Faults,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl PageDriver for FakeDriver {
    async fn render(&mut self, target: &PageTarget) -> colln_browser::Result<RenderedPage> {
        self.renders
            .0
            .lock()
            .expect("renders")
            .push((target.url.clone(), target.wait_until));
        if let Some(fault) = self.faults.take(&target.url) {
            return Err(fault.error(&target.url));
        }
        match self.pages.get(&target.url) {
            Some(html) => Ok(RenderedPage {
                url: target.url.clone(),
                html: html.clone(),
            }),
            None => Err(BrowserError::Api {
                status: 502,
                message: format!("no page at {}", target.url),
            }),
        }
    }

    async fn screenshot(&mut self, _target: &PageTarget, _selector: Option<&str>) -> colln_browser::Result<Vec<u8>> {
        Ok(vec![0xff, 0xd8, 0xff])
    }

    async fn close(&mut self) -> colln_browser::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
struct FakeBrowser {
    pages: HashMap<String, String>,
    renders: Renders,
    faults: Faults,
    closed: Arc<AtomicUsize>,
}

impl FakeBrowser {
    fn portal() -> Self {
        let mut pages = HashMap::new();
        pages.insert(TOP_URL.to_string(), TOP_HTML.to_string());
        pages.insert(HOME_URL.to_string(), HOME_HTML.to_string());
        for url in ["http://portal.test/v/1", "http://portal.test/v/2", "http://portal.test/photo/3"] {
            pages.insert(url.to_string(), ARTICLE_HTML.to_string());
        }
        Self {
            pages,
            renders: Renders::default(),
            faults: Faults::default(),
            closed: Arc::default(),
        }
    }

    fn driver(&self) -> FakeDriver {
        FakeDriver {
            pages: self.pages.clone(),
            renders: self.renders.clone(),
            faults: self.faults.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl DriverFactory for FakeBrowser {
    fn launch(&self) -> Result<Box<dyn PageDriver>, BrowserError> {
        Ok(Box::new(self.driver()))
    }
}

/// Lists every anchor; bodies under `/photo/` are skipped, `/broken/` ones fail.
#[derive(Default)]
struct AnchorStrategy {
    bodies: AtomicUsize,
    panic_on_home: bool,
}

impl AnchorStrategy {
    fn list(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        let mut items = Vec::new();
        for anchor in page.root().all("a[href]")? {
            let mut news = News::new(anchor.attr_or_empty("href"), anchor.text_trim());
            let page_no = anchor.attr_or_empty("data-page").parse().unwrap_or(0);
            let order = anchor.attr_or_empty("data-order").parse().unwrap_or(0);
            ctx.place(&mut news, page_no, order, 0, false);
            items.push(news);
        }
        Ok(items)
    }
}

impl ExtractionStrategy for AnchorStrategy {
    fn source(&self) -> Source {
        Source::Daum
    }

    fn device(&self) -> DeviceType {
        DeviceType::Pc
    }

    fn endpoints(&self) -> PortalEndpoints {
        PortalEndpoints {
            top_url: TOP_URL.into(),
            home_url: HOME_URL.into(),
        }
    }

    fn list_top(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        self.list(page, ctx)
    }

    fn list_home(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        if self.panic_on_home {
            let blocks: Vec<News> = Vec::new();
            return Ok(vec![blocks[0].clone()]);
        }
        self.list(page, ctx)
    }

    fn extract_body(&self, page: &Page, news: &News) -> Result<BodyOutcome, ExtractionError> {
        self.bodies.fetch_add(1, Ordering::SeqCst);
        if news.url.contains("/photo/") {
            return Ok(BodyOutcome::Skipped(SkipReason::PhotoView));
        }
        if news.url.contains("/broken/") {
            return Err(ExtractionError::UnexpectedShape {
                url: news.url.clone(),
            });
        }
        Ok(BodyOutcome::Extracted(Box::new(End {
            title: news.title.clone(),
            provider: "테스트통신".into(),
            posted_at: "2022. 11. 5. 20:30".into(),
            text: page.root().text_block(),
            html: page.html(),
            ..Default::default()
        })))
    }
}

fn config(save_dir: &Path) -> CollectConfig {
    let mut config = CollectConfig::new(Source::Daum, DeviceType::Pc, save_dir);
    config.list_retry_delay = Duration::from_millis(1);
    config.idle_settle = Duration::ZERO;
    config.utc_offset = chrono::FixedOffset::east_opt(9 * 3600).expect("offset");
    config
}

fn read_dump(path: &Path) -> serde_json::Value {
    let bytes = std::fs::read(path).expect("dump");
    let mut json = String::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_string(&mut json)
        .expect("gunzip");
    serde_json::from_str(&json).expect("json")
}

#[tokio::test]
async fn run_writes_ordered_dump_and_both_lists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let browser = FakeBrowser::portal();
    let strategy = Arc::new(AnchorStrategy::default());
    let collection = Collection::with_parts(config(dir.path()), strategy, Arc::new(browser.clone()));

    let report = collection.run_once().await.expect("run");

    assert_eq!((report.top_count, report.home_count), (2, 1));
    assert_eq!(report.extracted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.list_files.len(), 2);
    assert!(report.list_files.iter().all(|p| p.exists()));
    assert_eq!(browser.closed.load(Ordering::SeqCst), 1);

    let dump = read_dump(&report.dump_file);
    let urls: Vec<&str> = dump
        .as_array()
        .expect("array")
        .iter()
        .map(|n| n["url"].as_str().expect("url"))
        .collect();
    assert_eq!(
        urls,
        vec!["http://portal.test/v/1", "http://portal.test/v/2", "http://portal.test/photo/3"]
    );
    assert_eq!(dump[0]["loc"], "Top");
    assert_eq!(dump[2]["loc"], "Home");
    assert_eq!(dump[0]["end"]["posted_at"], "2022-11-05T20:30:00+09:00");
    assert!(dump[0]["end"].get("html").is_none());
    assert!(dump[0]["collected_at"].as_str().expect("collected").ends_with("+09:00"));
    assert!(report.dump_file.starts_with(dir.path().join("daum/pc/dump")));
}

#[tokio::test]
async fn second_run_serves_bodies_from_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let browser = FakeBrowser::portal();
    let strategy = Arc::new(AnchorStrategy::default());
    let collection = Collection::with_parts(
        config(dir.path()),
        Arc::clone(&strategy) as Arc<dyn ExtractionStrategy>,
        Arc::new(browser.clone()),
    );

    collection.run_once().await.expect("first run");
    let bodies_after_first = strategy.bodies.load(Ordering::SeqCst);
    let report = collection.run_once().await.expect("second run");

    assert_eq!(report.cached, 2);
    assert_eq!(report.extracted, 0);
    // skipped bodies are not cached, so only the photo page is fetched again
    assert_eq!(strategy.bodies.load(Ordering::SeqCst), bodies_after_first + 1);
    assert_eq!(browser.renders.count("http://portal.test/v/1"), 1);
    assert_eq!(browser.renders.count("http://portal.test/photo/3"), 2);
}

#[tokio::test]
async fn list_retries_are_bounded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut browser = FakeBrowser::portal();
    browser.pages.remove(HOME_URL);
    let mut config = config(dir.path());
    config.list_retries = 2;
    let collection = Collection::with_parts(config, Arc::new(AnchorStrategy::default()), Arc::new(browser.clone()));

    let err = collection.run_once().await.expect_err("home never loads");

    let RunError::ListExhausted { location, attempts, last } = &err else {
        panic!("expected list exhaustion, got {err:?}");
    };
    assert_eq!(*location, Location::Home);
    assert_eq!(*attempts, 3);
    assert!(matches!(last, SessionError::Browser(BrowserError::Api { status: 502, .. })));
    assert_eq!(browser.renders.count(HOME_URL), 3);
    assert_eq!(browser.renders.count(TOP_URL), 1);
    assert_eq!(collection.metrics().snapshot().runs_failure, 1);
    assert_eq!(browser.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_list_extraction_becomes_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let strategy = Arc::new(AnchorStrategy {
        panic_on_home: true,
        ..Default::default()
    });
    let collection = Collection::with_parts(config(dir.path()), strategy, Arc::new(FakeBrowser::portal()));

    let err = collection.run_once().await.expect_err("panic");

    let RunError::ListExhausted { last, .. } = &err else {
        panic!("expected list exhaustion, got {err:?}");
    };
    assert!(matches!(
        last,
        SessionError::Extraction(ExtractionError::Invariant { .. })
    ));
    assert!(err.to_string().contains("index out of bounds"));
}

#[tokio::test]
async fn body_errors_follow_the_policy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut browser = FakeBrowser::portal();
    let broken = r#"<html><body>
<a href="http://portal.test/broken/9" data-page="1" data-order="0">깨짐</a>
<a href="http://portal.test/v/1" data-page="1" data-order="1">정상</a>
</body></html>"#;
    browser.pages.insert(HOME_URL.to_string(), broken.to_string());
    browser
        .pages
        .insert("http://portal.test/broken/9".to_string(), ARTICLE_HTML.to_string());

    let strict = Collection::with_parts(config(dir.path()), Arc::new(AnchorStrategy::default()), Arc::new(browser.clone()));
    let err = strict.run_once().await.expect_err("strict");
    let RunError::Body { url, source } = &err else {
        panic!("expected a body error, got {err:?}");
    };
    assert_eq!(url, "http://portal.test/broken/9");
    assert_eq!(source.class(), ErrorClass::UnexpectedSkip);
    assert_eq!(strict.metrics().snapshot().runs_failure, 1);

    let mut lenient_config = config(dir.path());
    lenient_config.ignore_body_errors = true;
    lenient_config.list_format = ListFormat::Tsv;
    let lenient = Collection::with_parts(lenient_config, Arc::new(AnchorStrategy::default()), Arc::new(browser));
    let report = lenient.run_once().await.expect("lenient");
    assert_eq!(report.ignored_errors, 1);
    assert_eq!(report.fatal_errors, 0);
    assert_eq!(report.list_files.len(), 1);
}

#[tokio::test]
async fn closed_session_rejects_further_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let browser = FakeBrowser::portal();
    let strategy: Arc<dyn ExtractionStrategy> = Arc::new(AnchorStrategy::default());
    let mut session = PageSession::new(
        Box::new(browser.driver()),
        Arc::clone(&strategy),
        Arc::new(ResultCache::new(CacheConfig::default())),
        Arc::new(CollectorMetrics::new(Source::Daum, DeviceType::Pc)),
        SessionOptions {
            endpoints: strategy.endpoints(),
            profile: Profile::pc(),
            dump_root: dir.path().join("dump"),
            idle_settle: Duration::ZERO,
            utc_offset: chrono::FixedOffset::east_opt(0).expect("utc"),
            cache_ttl: Duration::from_secs(60),
        },
    );

    session.open(Location::Top).await.expect("open");
    let items = session.list_articles(Location::Top).await.expect("list");
    assert_eq!(items.len(), 2);
    assert!(Path::new(&items[0].full_html).exists());

    session.cleanup().await;
    session.cleanup().await;
    assert_eq!(browser.closed.load(Ordering::SeqCst), 1);

    let err = session.open(Location::Home).await.expect_err("closed");
    assert!(matches!(err, SessionError::InvalidState { state: "closed", .. }));
    let mut news = News::new("http://portal.test/v/1", "첫번째");
    assert!(session.fetch_body(&mut news).await.is_err());
    assert!(news.end.is_none());
}

#[tokio::test]
async fn unsettled_pages_are_retried_once_after_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let browser = FakeBrowser::portal();
    browser.faults.inject(TOP_URL, Fault::ContextDestroyed, 1);
    browser.faults.inject("http://portal.test/v/2", Fault::Timeout, 1);
    let collection = Collection::with_parts(config(dir.path()), Arc::new(AnchorStrategy::default()), Arc::new(browser.clone()));

    let report = collection.run_once().await.expect("run");

    assert_eq!(report.top_count, 2);
    assert_eq!(report.extracted, 2);
    assert_eq!(browser.renders.waits(TOP_URL), vec![WaitUntil::NetworkIdle, WaitUntil::Load]);
    assert_eq!(
        browser.renders.waits("http://portal.test/v/2"),
        vec![WaitUntil::NetworkIdle, WaitUntil::Load]
    );
    assert_eq!(browser.renders.waits(HOME_URL), vec![WaitUntil::NetworkIdle]);
}

#[tokio::test]
async fn failed_relaxed_render_is_not_retried_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let browser = FakeBrowser::portal();
    browser.faults.inject(HOME_URL, Fault::ContextDestroyed, 2);
    let collection = Collection::with_parts(config(dir.path()), Arc::new(AnchorStrategy::default()), Arc::new(browser.clone()));

    let err = collection.run_once().await.expect_err("home never settles");

    let RunError::ListExhausted { location, attempts, last } = &err else {
        panic!("expected list exhaustion, got {err:?}");
    };
    assert_eq!((*location, *attempts), (Location::Home, 1));
    assert!(matches!(last, SessionError::Browser(e) if e.is_context_destroyed()));
    assert_eq!(browser.renders.waits(HOME_URL), vec![WaitUntil::NetworkIdle, WaitUntil::Load]);
    assert_eq!(browser.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_relaxed_body_render_follows_the_policy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let browser = FakeBrowser::portal();
    browser.faults.inject("http://portal.test/v/2", Fault::Timeout, 2);
    let mut lenient_config = config(dir.path());
    lenient_config.ignore_body_errors = true;
    let collection = Collection::with_parts(lenient_config, Arc::new(AnchorStrategy::default()), Arc::new(browser.clone()));

    let report = collection.run_once().await.expect("lenient");

    assert_eq!(report.ignored_errors, 1);
    assert_eq!(report.extracted, 1);
    assert_eq!(browser.renders.count("http://portal.test/v/2"), 2);
    let dump = read_dump(&report.dump_file);
    assert_eq!(dump[1]["url"], "http://portal.test/v/2");
    assert!(dump[1].get("end").map_or(true, serde_json::Value::is_null));
}

#[tokio::test]
async fn unreadable_cache_record_aborts_the_article() {
    let dir = tempfile::tempdir().expect("tempdir");
    let browser = FakeBrowser::portal();
    let collection = Collection::with_parts(config(dir.path()), Arc::new(AnchorStrategy::default()), Arc::new(browser.clone()));
    let key = canonical_key("http://portal.test/v/1").expect("key");
    collection
        .cache()
        .set(&key, Some(&"not a news end"), Duration::from_secs(60))
        .expect("seed");

    let err = collection.run_once().await.expect_err("strict");

    let RunError::Body { url, source } = &err else {
        panic!("expected a body error, got {err:?}");
    };
    assert_eq!(url, "http://portal.test/v/1");
    assert_eq!(source.class(), ErrorClass::Cache);
    assert!(matches!(source, BodyError::Cache(CacheError::Decode { .. })));
    assert_eq!(browser.renders.count("http://portal.test/v/1"), 0);
}

#[tokio::test]
async fn oversized_bodies_are_kept_but_not_cached() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path());
    config.cache.max_record_size = 16;
    let browser = FakeBrowser::portal();
    let collection = Collection::with_parts(config, Arc::new(AnchorStrategy::default()), Arc::new(browser.clone()));

    let report = collection.run_once().await.expect("run");
    assert_eq!(report.extracted, 2);
    assert!(collection.cache().is_empty());
    assert_eq!(read_dump(&report.dump_file)[0]["end"]["provider"], "테스트통신");

    let report = collection.run_once().await.expect("second run");
    assert_eq!((report.cached, report.extracted), (0, 2));
    assert_eq!(browser.renders.count("http://portal.test/v/1"), 2);
}
