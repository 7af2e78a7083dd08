pub mod error;

pub use error::{BrowserError, Result};

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitUntil {
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle2")]
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub is_mobile: bool,
    pub has_touch: bool,
}

/// Everything needed to bring one page to a stable, capturable state.
#[derive(Debug, Clone, PartialEq)]
pub struct PageTarget {
    pub url: String,
    pub viewport: Viewport,
    pub user_agent: Option<String>,
    /// Scripts run after load and before capture (scrolling, expanding lists).
    pub scripts: Vec<String>,
    pub wait_until: WaitUntil,
    /// Idle settle period after the wait condition is met.
    pub settle: Duration,
}

impl PageTarget {
    pub fn new(url: impl Into<String>, viewport: Viewport) -> Self {
        Self {
            url: url.into(),
            viewport,
            user_agent: None,
            scripts: Vec::new(),
            wait_until: WaitUntil::NetworkIdle,
            settle: Duration::ZERO,
        }
    }

    pub fn with_user_agent(mut self, user_agent: Option<&str>) -> Self {
        self.user_agent = user_agent.map(String::from);
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.scripts.push(script.into());
        self
    }

    /// Same page with the `load` wait condition, for sites that never go idle.
    pub fn relaxed(&self) -> Self {
        Self {
            wait_until: WaitUntil::Load,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
}

/// Page automation capability consumed by the collector. One driver is one
/// browser session; `close` releases it and later calls fail with `Closed`.
#[async_trait]
pub trait PageDriver: Send {
    async fn render(&mut self, target: &PageTarget) -> Result<RenderedPage>;

    /// JPEG capture of the full page, or of the first element matching `selector`.
    async fn screenshot(&mut self, target: &PageTarget, selector: Option<&str>) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub navigation_timeout: Duration,
    pub headless: bool,
    pub chrome_logging: bool,
    pub chrome_log_verbosity: u8,
    pub jpeg_quality: u8,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            token: None,
            navigation_timeout: Duration::from_secs(20),
            headless: true,
            chrome_logging: false,
            chrome_log_verbosity: 0,
            jpeg_quality: 80,
        }
    }
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    config: BrowserConfig,
}

impl BrowserlessClient {
    pub fn new(config: BrowserConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.navigation_timeout + Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            config: BrowserConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    fn launch_options(&self) -> Value {
        let mut args = Vec::new();
        if self.config.chrome_logging {
            args.push("--enable-logging".to_string());
            args.push(format!("--v={}", self.config.chrome_log_verbosity));
        }
        json!({ "headless": self.config.headless, "args": args })
    }

    fn request_body(&self, target: &PageTarget) -> Value {
        let mut body = json!({
            "url": target.url,
            "gotoOptions": {
                "waitUntil": target.wait_until,
                "timeout": self.config.navigation_timeout.as_millis() as u64,
            },
            "viewport": target.viewport,
        });
        if let Some(user_agent) = &target.user_agent {
            body["userAgent"] = json!(user_agent);
        }
        if !target.scripts.is_empty() {
            body["addScriptTag"] = target
                .scripts
                .iter()
                .map(|content| json!({ "content": content }))
                .collect();
        }
        if !target.settle.is_zero() {
            body["waitForTimeout"] = json!(target.settle.as_millis() as u64);
        }
        body
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let endpoint = format!("{}/{}", self.config.base_url, path);
        let mut query = vec![("launch", self.launch_options().to_string())];
        if let Some(token) = &self.config.token {
            query.push(("token", token.clone()));
        }

        let resp = self
            .client
            .post(&endpoint)
            .query(&query)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp)
    }

    /// Fully-rendered HTML via the `/content` endpoint.
    pub async fn content(&self, target: &PageTarget) -> Result<String> {
        let resp = self.post("content", &self.request_body(target)).await?;
        Ok(resp.text().await?)
    }

    pub async fn screenshot(&self, target: &PageTarget, selector: Option<&str>) -> Result<Vec<u8>> {
        let mut body = self.request_body(target);
        body["options"] = json!({
            "type": "jpeg",
            "quality": self.config.jpeg_quality,
            "fullPage": selector.is_none(),
        });
        if let Some(selector) = selector {
            body["selector"] = json!(selector);
        }
        let resp = self.post("screenshot", &body).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// [`PageDriver`] over a Browserless endpoint.
pub struct BrowserlessDriver {
    client: BrowserlessClient,
    closed: bool,
    renders: usize,
}

impl BrowserlessDriver {
    pub fn new(config: BrowserConfig) -> Result<Self> {
        Ok(Self {
            client: BrowserlessClient::new(config)?,
            closed: false,
            renders: 0,
        })
    }
}

#[async_trait]
impl PageDriver for BrowserlessDriver {
    async fn render(&mut self, target: &PageTarget) -> Result<RenderedPage> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        debug!(url = %target.url, wait_until = ?target.wait_until, "rendering page");
        let html = self.client.content(target).await?;
        self.renders += 1;
        Ok(RenderedPage {
            url: target.url.clone(),
            html,
        })
    }

    async fn screenshot(&mut self, target: &PageTarget, selector: Option<&str>) -> Result<Vec<u8>> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        self.client.screenshot(target, selector).await
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            info!(renders = self.renders, "browser session released");
        }
        Ok(())
    }
}
