//! Core data model for the portal news collector: articles, bodies, capture
//! profiles and the timestamp formats shared by every other crate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "colln-core";

pub const FILE_YEAR_FORMAT: &str = "%Y";
pub const FILE_DATE_FORMAT: &str = "%Y%m%d";
pub const FILE_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
pub const FILE_TIME_NANO_FORMAT: &str = "%H%M%S%.9f";

/// Layouts tried in order after [`compact_timestamp`] has removed the spacing
/// variants portals use ("2022. 11. 5. 20:30", "2022. 11.11. 20:30").
pub const ACCEPTED_TIMESTAMP_LAYOUTS: [&str; 4] = [
    "%Y.%m.%d.%H:%M",
    "%Y.%m.%d %H:%M",
    "%Y.%m.%d.%H:%M:%S",
    "%Y.%m.%d %H:%M:%S",
];

pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown news source {0:?}, expected one of daum, naver")]
    UnknownSource(String),
    #[error("unknown collect type {0:?}, expected one of pc, mobile")]
    UnknownDeviceType(String),
    #[error("unknown list output format {0:?}, expected one of t, m, b")]
    UnknownListFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Daum,
    Naver,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Daum, Source::Naver];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Daum => "daum",
            Source::Naver => "naver",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daum" => Ok(Source::Daum),
            "naver" => Ok(Source::Naver),
            _ => Err(CoreError::UnknownSource(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Pc,
    Mobile,
}

impl DeviceType {
    pub const ALL: [DeviceType; 2] = [DeviceType::Pc, DeviceType::Mobile];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Pc => "pc",
            DeviceType::Mobile => "mobile",
        }
    }

    pub fn profile(&self) -> Profile {
        match self {
            DeviceType::Pc => Profile::pc(),
            DeviceType::Mobile => Profile::mobile(),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pc" => Ok(DeviceType::Pc),
            "mobile" => Ok(DeviceType::Mobile),
            _ => Err(CoreError::UnknownDeviceType(s.to_string())),
        }
    }
}

/// Which of the two fixed entry pages produced an article.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Top,
    Home,
}

impl Location {
    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Top => "Top",
            Location::Home => "Home",
        }
    }

    /// Directory tag used for page captures of this location.
    pub fn dump_tag(&self) -> &'static str {
        match self {
            Location::Top => "top",
            Location::Home => "news",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFormat {
    Tsv,
    Markdown,
    #[default]
    Both,
}

impl ListFormat {
    pub fn writes_tsv(&self) -> bool {
        matches!(self, ListFormat::Tsv | ListFormat::Both)
    }

    pub fn writes_markdown(&self) -> bool {
        matches!(self, ListFormat::Markdown | ListFormat::Both)
    }
}

impl FromStr for ListFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t" | "tsv" => Ok(ListFormat::Tsv),
            "m" | "md" | "markdown" => Ok(ListFormat::Markdown),
            "b" | "both" => Ok(ListFormat::Both),
            _ => Err(CoreError::UnknownListFormat(s.to_string())),
        }
    }
}

/// Browser viewport a collection run emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub width: u32,
    pub height: u32,
    pub mobile: bool,
    pub user_agent: Option<&'static str>,
}

impl Profile {
    pub fn pc() -> Self {
        Self {
            width: 1920,
            height: 1080,
            mobile: false,
            user_agent: None,
        }
    }

    pub fn mobile() -> Self {
        Self {
            width: 640,
            height: 1080,
            mobile: true,
            user_agent: Some(MOBILE_USER_AGENT),
        }
    }
}

/// One discovered link on a list page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct News {
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image: String,
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub series_title: String,
    #[serde(rename = "news_page")]
    pub page: u32,
    pub order: u32,
    pub sub_order: u32,
    pub full_html: String,
    #[serde(rename = "full_screen_shot")]
    pub full_screenshot: String,
    #[serde(rename = "tab_screen_shot")]
    pub tab_screenshot: String,
    pub publisher: String,
    #[serde(rename = "loc")]
    pub location: Option<Location>,
    pub collected_at: String,
    pub end: Option<End>,
}

impl News {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn set_layout(&mut self, page: u32, order: u32, sub_order: u32) {
        self.page = page;
        self.order = order;
        self.sub_order = sub_order;
    }

    /// Sort key reproducing page layout order.
    pub fn layout_key(&self) -> (u32, u32, u32) {
        (self.page, self.order, self.sub_order)
    }

    /// Publisher as shown in listings: the body's provider wins once a body exists.
    pub fn display_publisher(&self) -> &str {
        match &self.end {
            Some(end) => &end.provider,
            None => &self.publisher,
        }
    }
}

/// Full-content record extracted from an article page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct End {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider: String,
    pub title: String,
    pub author: String,
    pub collected_at: String,
    pub posted_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub modified_at: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub num_comment: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub emotions: Vec<Emotion>,
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub html: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub program: String,
    pub num_played: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Reaction tally. Portals sometimes print a label ("1만") instead of a number.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Emotion {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "CountString", default)]
    pub count_text: String,
    #[serde(rename = "Count", default)]
    pub count: i64,
}

impl Emotion {
    pub fn parse(name: impl Into<String>, raw_count: &str) -> Self {
        let raw_count = raw_count.trim();
        match raw_count.replace(',', "").parse::<i64>() {
            Ok(count) => Self {
                name: name.into(),
                count_text: String::new(),
                count,
            },
            Err(_) => Self {
                name: name.into(),
                count_text: raw_count.to_string(),
                count: 0,
            },
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count_text.is_empty() {
            write!(f, "{}({})", self.name, self.count)
        } else {
            write!(f, "{}({})", self.name, self.count_text)
        }
    }
}

/// RFC3339 at second precision, the single timestamp format of persisted data.
pub fn format_data_time<Tz>(at: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    at.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Collapses whitespace runs and drops the spaces portals put after dots.
pub fn compact_timestamp(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(". ", ".")
}

/// Normalizes a portal timestamp into RFC3339 in `offset`. Returns `None` when
/// no accepted layout matches; callers keep the raw string in that case.
pub fn normalize_timestamp(raw: &str, offset: FixedOffset) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(format_data_time(at));
    }

    let compact = compact_timestamp(raw);
    ACCEPTED_TIMESTAMP_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(&compact, layout).ok())
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(format_data_time)
}
