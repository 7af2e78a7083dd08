//! Read-only HTTP surface over a collect directory: status page, summary API
//! and the collector's metrics.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use colln_core::DeviceType;
use colln_sync::CollectorMetrics;
use serde::Serialize;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "colln-web";
pub const APP_NAME: &str = "Portal News Collector";

const DUMP_DIR: &str = "dump";
const DUMP_SUFFIX: &str = ".json.gz";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub collect_root: PathBuf,
    pub metrics: Option<Arc<CollectorMetrics>>,
}

impl AppState {
    pub fn new(collect_root: impl Into<PathBuf>) -> Self {
        Self {
            collect_root: collect_root.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CollectorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub platforms: Vec<PlatformSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformSummary {
    pub platform: String,
    pub types: Vec<TypeSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeSummary {
    #[serde(rename = "type")]
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub yearly: Vec<YearlySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearlySummary {
    pub year: String,
    pub daily: Vec<DailySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub day: String,
    pub dumps: usize,
}

#[derive(Debug, Clone)]
struct StatusRow {
    platform: String,
    device: String,
    days: usize,
    dumps: usize,
    latest_day: String,
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    app_name: &'static str,
    version: &'static str,
    collect_root: String,
    collector: String,
    rows: Vec<StatusRow>,
    errors: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/summary", get(summary_handler))
        .with_state(Arc::new(state))
}

/// Serves `router` on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match collect_summary(&state.collect_root).await {
        Ok(summary) => {
            let collector = state
                .metrics
                .as_ref()
                .map(|metrics| {
                    let snap = metrics.snapshot();
                    let last_run = snap
                        .last_run
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "never".into());
                    format!(
                        "{} {}: {} runs succeeded, {} failed, {} news listed, last run {}",
                        snap.source, snap.device, snap.runs_success, snap.runs_failure, snap.news_total, last_run
                    )
                })
                .unwrap_or_default();
            let (rows, errors) = status_rows(&summary);
            render_html(StatusTemplate {
                app_name: APP_NAME,
                version: env!("CARGO_PKG_VERSION"),
                collect_root: state.collect_root.display().to_string(),
                collector,
                rows,
                errors,
            })
        }
        Err(err) => server_error(err),
    }
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let body = match state.metrics.as_ref().map(|metrics| metrics.render_prometheus()) {
        Some(Ok(body)) => body,
        Some(Err(err)) => return server_error(err.into()),
        None => String::new(),
    };
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response()
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    match collect_summary(&state.collect_root).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

fn status_rows(summary: &Summary) -> (Vec<StatusRow>, Vec<String>) {
    let mut rows = Vec::new();
    let mut errors = Vec::new();
    for platform in &summary.platforms {
        for kind in &platform.types {
            if let Some(error) = &kind.error {
                errors.push(error.clone());
            }
            let days: Vec<&DailySummary> = kind.yearly.iter().flat_map(|y| &y.daily).collect();
            if days.is_empty() {
                continue;
            }
            rows.push(StatusRow {
                platform: platform.platform.clone(),
                device: kind.device.clone(),
                days: days.len(),
                dumps: days.iter().map(|d| d.dumps).sum(),
                latest_day: days.last().map(|d| d.day.clone()).unwrap_or_default(),
            });
        }
    }
    (rows, errors)
}

/// Counts `.json.gz` dumps per platform, device type, year and day. A missing
/// type directory is an empty type; other read failures are reported on the
/// type instead of failing the summary.
pub async fn collect_summary(collect_root: &Path) -> anyhow::Result<Summary> {
    let mut platforms = Vec::new();
    for platform in sorted_names(collect_root, EntryKind::Dir).await? {
        let platform_path = collect_root.join(&platform);
        let mut types = Vec::with_capacity(DeviceType::ALL.len());
        for device in DeviceType::ALL {
            types.push(type_summary(&platform_path, device).await);
        }
        platforms.push(PlatformSummary { platform, types });
    }
    Ok(Summary { platforms })
}

async fn type_summary(platform_path: &Path, device: DeviceType) -> TypeSummary {
    let dump_path = platform_path.join(device.as_str()).join(DUMP_DIR);
    let (yearly, error) = match dump_years(&dump_path).await {
        Ok(yearly) => (yearly, None),
        Err(err) if err.kind() == io::ErrorKind::NotFound => (Vec::new(), None),
        Err(err) => (
            Vec::new(),
            Some(format!(
                "failed to get summary of type {device} from {}: {err}",
                platform_path.display()
            )),
        ),
    };
    TypeSummary {
        device: device.to_string(),
        error,
        yearly,
    }
}

async fn dump_years(dump_path: &Path) -> io::Result<Vec<YearlySummary>> {
    let mut yearly = Vec::new();
    for year in sorted_names(dump_path, EntryKind::Dir).await? {
        let year_path = dump_path.join(&year);
        let mut daily = Vec::new();
        for day in sorted_names(&year_path, EntryKind::Dir).await? {
            let dumps = sorted_names(&year_path.join(&day), EntryKind::File)
                .await?
                .iter()
                .filter(|name| name.ends_with(DUMP_SUFFIX))
                .count();
            daily.push(DailySummary { day, dumps });
        }
        yearly.push(YearlySummary { year, daily });
    }
    Ok(yearly)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

async fn sorted_names(path: &Path, kind: EntryKind) -> io::Result<Vec<String>> {
    let mut entries = fs::read_dir(path).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let wanted = match kind {
            EntryKind::Dir => file_type.is_dir(),
            EntryKind::File => file_type.is_file(),
        };
        if !wanted {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            if !name.starts_with('.') {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use colln_core::{Location, Source};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn seed_collect_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let day = dir.path().join("daum/pc/dump/2022/20221105");
        std::fs::create_dir_all(&day).expect("mkdir");
        for name in ["20221105-203015.json.gz", "20221105-204015.json.gz", "notes.txt"] {
            std::fs::write(day.join(name), b"x").expect("write");
        }
        std::fs::create_dir_all(day.join("top")).expect("capture dir");
        std::fs::create_dir_all(dir.path().join("daum/pc/dump/2022/20221106")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("naver/mobile")).expect("mkdir");
        std::fs::write(dir.path().join("naver/mobile/dump"), b"not a directory").expect("blocker");
        std::fs::write(dir.path().join("README"), b"ignored").expect("write");
        dir
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn summary_counts_dumps_per_day() {
        let dir = seed_collect_dir();
        let summary = collect_summary(dir.path()).await.unwrap();

        let platforms: Vec<&str> = summary.platforms.iter().map(|p| p.platform.as_str()).collect();
        assert_eq!(platforms, vec!["daum", "naver"]);

        let daum_pc = &summary.platforms[0].types[0];
        assert_eq!(daum_pc.device, "pc");
        assert_eq!(daum_pc.error, None);
        assert_eq!(daum_pc.yearly[0].year, "2022");
        assert_eq!(
            daum_pc.yearly[0].daily,
            vec![
                DailySummary { day: "20221105".into(), dumps: 2 },
                DailySummary { day: "20221106".into(), dumps: 0 },
            ]
        );

        let daum_mobile = &summary.platforms[0].types[1];
        assert!(daum_mobile.yearly.is_empty());
        assert_eq!(daum_mobile.error, None);

        let naver_mobile = &summary.platforms[1].types[1];
        let error = naver_mobile.error.as_deref().expect("read error");
        assert!(error.starts_with("failed to get summary of type mobile from"));
    }

    #[tokio::test]
    async fn summary_api_serializes_type_field() {
        let dir = seed_collect_dir();
        let (status, content_type, body) = get(app(AppState::new(dir.path())), "/api/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["platforms"][0]["types"][0]["type"], "pc");
        assert_eq!(value["platforms"][0]["types"][0]["yearly"][0]["daily"][0]["dumps"], 2);
        assert!(value["platforms"][0]["types"][0].get("error").is_none());
    }

    #[tokio::test]
    async fn missing_collect_dir_is_a_server_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (status, _, _) = get(app(AppState::new(dir.path().join("absent"))), "/api/summary").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn status_page_lists_dump_rows() {
        let dir = seed_collect_dir();
        let (status, _, text) = get(app(AppState::new(dir.path())), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains(APP_NAME));
        assert!(text.contains("20221106"));
        assert!(text.contains("No collector is running"));
        assert!(text.contains("failed to get summary of type mobile"));
    }

    #[tokio::test]
    async fn metrics_and_health_endpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let metrics = Arc::new(CollectorMetrics::new(Source::Daum, DeviceType::Mobile));
        metrics.record_news(Location::Home, 7);
        let router = app(AppState::new(dir.path()).with_metrics(Arc::clone(&metrics)));

        let (status, content_type, text) = get(router.clone(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(PROMETHEUS_CONTENT_TYPE));
        assert!(text.contains("news_total{type=\"mobile\",source=\"daum\",location=\"Home\"} 7"));

        let (status, _, text) = get(router.clone(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, r#"{"status":"ok"}"#);

        let (_, _, page) = get(router, "/").await;
        assert!(page.contains("daum mobile: 0 runs succeeded"));
    }
}
