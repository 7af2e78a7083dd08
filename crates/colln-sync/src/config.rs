use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Local};
use colln_adapters::PortalEndpoints;
use colln_browser::BrowserConfig;
use colln_core::{DeviceType, ListFormat, Source};
use colln_storage::CacheConfig;
use serde::Deserialize;
use tokio::fs;
use tracing::warn;

/// Everything one collector process needs. Built once and handed to the
/// scheduler; nothing here is read from globals afterwards.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    pub source: Source,
    pub device: DeviceType,
    pub save_dir: PathBuf,
    pub period: Duration,
    pub list_retries: u32,
    pub list_retry_delay: Duration,
    pub ignore_body_errors: bool,
    pub list_format: ListFormat,
    pub idle_settle: Duration,
    pub drain_timeout: Duration,
    pub utc_offset: FixedOffset,
    pub metrics_port: u16,
    pub portals_file: Option<PathBuf>,
    pub browser: BrowserConfig,
    pub cache: CacheConfig,
}

impl CollectConfig {
    pub fn new(source: Source, device: DeviceType, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            device,
            save_dir: save_dir.into(),
            period: Duration::from_secs(10 * 60),
            list_retries: 0,
            list_retry_delay: Duration::from_secs(1),
            ignore_body_errors: false,
            list_format: ListFormat::Both,
            idle_settle: Duration::from_millis(1500),
            drain_timeout: Duration::from_secs(10),
            utc_offset: *Local::now().offset(),
            metrics_port: 3000,
            portals_file: None,
            browser: BrowserConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    /// Defaults overlaid with `COLLN_*` environment variables. Unparseable
    /// values fall back to the default.
    pub fn from_env(source: Source, device: DeviceType, save_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(source, device, save_dir);

        if let Ok(url) = std::env::var("COLLN_BROWSERLESS_URL") {
            config.browser.base_url = url;
        }
        config.browser.token = std::env::var("COLLN_BROWSERLESS_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        if let Some(secs) = env_parse::<u64>("COLLN_NAV_TIMEOUT_SECS") {
            config.browser.navigation_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("COLLN_IDLE_SETTLE_MS") {
            config.idle_settle = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("COLLN_CACHE_TTL_SECS") {
            config.cache.ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("COLLN_LIST_RETRY_DELAY_MS") {
            config.list_retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("COLLN_DRAIN_TIMEOUT_SECS") {
            config.drain_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("COLLN_UTC_OFFSET") {
            match parse_utc_offset(&raw) {
                Some(offset) => config.utc_offset = offset,
                None => warn!(value = %raw, "ignoring invalid COLLN_UTC_OFFSET"),
            }
        }
        if let Some(port) = env_parse::<u16>("COLLN_METRICS_PORT") {
            config.metrics_port = port;
        }
        config.portals_file = std::env::var("COLLN_PORTALS_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        config
    }

    /// `<save>/<source>/<device>`, the root of every artifact this collector writes.
    pub fn platform_root(&self) -> PathBuf {
        self.save_dir
            .join(self.source.as_str())
            .join(self.device.as_str())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Accepts `+09:00`, `-0530` style offsets and `Z`/`UTC`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalRegistry {
    pub portals: Vec<PortalConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub source: Source,
    pub device: DeviceType,
    pub top_url: String,
    pub home_url: String,
}

impl PortalRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn endpoints_for(&self, source: Source, device: DeviceType) -> Option<PortalEndpoints> {
        self.portals
            .iter()
            .find(|p| p.source == source && p.device == device)
            .map(|p| PortalEndpoints {
                top_url: p.top_url.clone(),
                home_url: p.home_url.clone(),
            })
    }
}
