//! Extraction strategy contract and the per-portal DOM parsing rules.

use colln_core::{DeviceType, End, News, Source};
use colln_storage::DumpDirectory;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub mod daum;
pub mod naver;

pub const CRATE_NAME: &str = "colln-adapters";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("selector {selector:?} matched nothing")]
    SelectorNotFound { selector: String },
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("content block is missing in {url}")]
    ContentBlockNotFound { url: String },
    #[error("content provider block is missing")]
    ProviderBlockNotFound,
    #[error("{block} is not supported content block")]
    UnsupportedContentBlock { block: String },
    #[error("failed to collect news end for {url}")]
    UnexpectedShape { url: String },
    #[error("{what} is not supported")]
    Unsupported { what: String },
    #[error("expected a number, found {text:?}")]
    InvalidNumber { text: String },
    #[error("panic '{message}' from stack:\n{backtrace}")]
    Invariant { message: String, backtrace: String },
}

impl ExtractionError {
    /// Typed errors mean the page shape drifted away from what the strategy knows.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ExtractionError::ContentBlockNotFound { .. }
                | ExtractionError::ProviderBlockNotFound
                | ExtractionError::UnsupportedContentBlock { .. }
        )
    }
}

/// Known content shapes that carry no extractable body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingArticleBlock,
    PhotoView,
    VodView,
    ContentVod,
    ViewContents,
    Feature,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingArticleBlock => "missing_article_block",
            SkipReason::PhotoView => "photo_view",
            SkipReason::VodView => "view_vod",
            SkipReason::ContentVod => "cont_vod",
            SkipReason::ViewContents => "c_viewcontents",
            SkipReason::Feature => "feature",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BodyOutcome {
    Extracted(Box<End>),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalEndpoints {
    pub top_url: String,
    pub home_url: String,
}

/// Scripts injected before the home page is captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewPlan {
    pub scripts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabCapture {
    pub tab: u32,
    pub selector: String,
}

/// Dump linkage handed to list extraction.
pub struct ListContext<'d> {
    dump: &'d DumpDirectory,
    tab_captures: Vec<TabCapture>,
}

impl<'d> ListContext<'d> {
    pub fn new(dump: &'d DumpDirectory) -> Self {
        Self {
            dump,
            tab_captures: Vec::new(),
        }
    }

    pub fn dump(&self) -> &DumpDirectory {
        self.dump
    }

    pub fn place(&self, news: &mut News, page: u32, order: u32, sub_order: u32, with_tab: bool) {
        news.set_layout(page, order, sub_order);
        news.full_html = self.dump.full_html().display().to_string();
        news.full_screenshot = self.dump.full_screenshot().display().to_string();
        if with_tab {
            news.tab_screenshot = self.dump.tab_screenshot(page).display().to_string();
        }
    }

    /// Requests an element screenshot saved as tab `tab`. First request per tab wins.
    pub fn capture_tab(&mut self, tab: u32, selector: impl Into<String>) {
        if self.tab_captures.iter().all(|c| c.tab != tab) {
            self.tab_captures.push(TabCapture {
                tab,
                selector: selector.into(),
            });
        }
    }

    pub fn into_tab_captures(self) -> Vec<TabCapture> {
        self.tab_captures
    }
}

/// Parsed snapshot of a rendered page.
pub struct Page {
    url: String,
    document: Html,
}

impl Page {
    pub fn parse(url: impl Into<String>, html: &str) -> Self {
        Self {
            url: url.into(),
            document: Html::parse_document(html),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn root(&self) -> ElementRef<'_> {
        self.document.root_element()
    }

    pub fn html(&self) -> String {
        self.document.html()
    }

    pub fn meta_property(&self, property: &str) -> Result<Option<String>, ExtractionError> {
        let css = format!(r#"head > meta[property="{property}"]"#);
        Ok(self
            .root()
            .first(&css)?
            .and_then(|meta| text_or_none(meta.attr_or_empty("content"))))
    }
}

/// Per (source, device) DOM parsing rules.
///
/// Strategies assume the happy path and propagate with `?`; the session
/// boundary turns anything that escapes into an [`ExtractionError`].
pub trait ExtractionStrategy: Send + Sync {
    fn source(&self) -> Source;
    fn device(&self) -> DeviceType;
    fn endpoints(&self) -> PortalEndpoints;

    fn list_top(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError>;

    fn list_home(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError>;

    fn prepare_home_view(&self, _view: &mut ViewPlan) {}

    fn extract_body(&self, page: &Page, news: &News) -> Result<BodyOutcome, ExtractionError>;
}

pub fn strategy_for(source: Source, device: DeviceType) -> Option<Box<dyn ExtractionStrategy>> {
    match (source, device) {
        (Source::Daum, DeviceType::Pc) => Some(Box::new(daum::pc::DaumPc)),
        (Source::Daum, DeviceType::Mobile) => Some(Box::new(daum::mobile::DaumMobile)),
        (Source::Naver, DeviceType::Pc) => Some(Box::new(naver::NaverPc)),
        (Source::Naver, DeviceType::Mobile) => None,
    }
}

fn parse_selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::InvalidSelector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Selector helpers over scraper elements.
pub trait Inspect<'a> {
    fn has(&self, css: &str) -> Result<bool, ExtractionError>;
    fn first(&self, css: &str) -> Result<Option<ElementRef<'a>>, ExtractionError>;
    /// Like `first`, but a missing match is an error.
    fn require(&self, css: &str) -> Result<ElementRef<'a>, ExtractionError>;
    fn all(&self, css: &str) -> Result<Vec<ElementRef<'a>>, ExtractionError>;
    fn text_trim(&self) -> String;
    /// Text nodes as trimmed, non-empty lines.
    fn text_block(&self) -> String;
    fn text_u64(&self) -> Result<u64, ExtractionError>;
    fn attr_or_empty(&self, name: &str) -> String;
    fn has_class(&self, class: &str) -> bool;
    fn children_named(&self, tag: &str) -> Vec<ElementRef<'a>>;
    fn descendant_attr(&self, css: &str, name: &str) -> Result<String, ExtractionError>;

    fn anchor_href(&self) -> Result<String, ExtractionError> {
        self.descendant_attr("a", "href")
    }

    fn img_src(&self) -> Result<String, ExtractionError> {
        self.descendant_attr("img", "src")
    }

    fn img_alt(&self) -> Result<String, ExtractionError> {
        self.descendant_attr("img", "alt")
    }
}

impl<'a> Inspect<'a> for ElementRef<'a> {
    fn has(&self, css: &str) -> Result<bool, ExtractionError> {
        Ok(self.first(css)?.is_some())
    }

    fn first(&self, css: &str) -> Result<Option<ElementRef<'a>>, ExtractionError> {
        let sel = parse_selector(css)?;
        Ok(self.select(&sel).next())
    }

    fn require(&self, css: &str) -> Result<ElementRef<'a>, ExtractionError> {
        self.first(css)?
            .ok_or_else(|| ExtractionError::SelectorNotFound {
                selector: css.to_string(),
            })
    }

    fn all(&self, css: &str) -> Result<Vec<ElementRef<'a>>, ExtractionError> {
        let sel = parse_selector(css)?;
        Ok(self.select(&sel).collect())
    }

    fn text_trim(&self) -> String {
        self.text()
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn text_block(&self) -> String {
        self.text()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn text_u64(&self) -> Result<u64, ExtractionError> {
        let text = self.text_trim();
        let digits: String = text.chars().filter(|c| *c != ',').collect();
        if digits.is_empty() {
            return Ok(0);
        }
        digits
            .parse()
            .map_err(|_| ExtractionError::InvalidNumber { text })
    }

    fn attr_or_empty(&self, name: &str) -> String {
        self.value().attr(name).unwrap_or_default().to_string()
    }

    fn has_class(&self, class: &str) -> bool {
        self.value().classes().any(|c| c == class)
    }

    fn children_named(&self, tag: &str) -> Vec<ElementRef<'a>> {
        self.children()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == tag)
            .collect()
    }

    fn descendant_attr(&self, css: &str, name: &str) -> Result<String, ExtractionError> {
        Ok(self
            .first(css)?
            .map(|el| el.attr_or_empty(name))
            .unwrap_or_default())
    }
}

/// First selector in `candidates` present under `scope`, with its match.
pub(crate) fn first_present<'a>(
    scope: ElementRef<'a>,
    candidates: &[&'static str],
) -> Result<Option<(&'static str, ElementRef<'a>)>, ExtractionError> {
    for css in candidates {
        if let Some(el) = scope.first(css)? {
            return Ok(Some((css, el)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    const HTML: &str = r#"<html><head><meta property="og:article:author" content=" 연합뉴스 "></head>
        <body><div id="box"><ul class="list"><li class="item_bnr x">ad</li><li><a href="/a">  first
        title </a><span class="num">1,234</span></li></ul></div></body></html>"#;

    #[test]
    fn inspect_helpers_find_and_require() {
        let page = Page::parse("https://news.daum.net/", HTML);
        let root = page.root();
        assert!(root.has("div[id=box]").expect("has"));
        assert_eq!(root.all("ul.list > li").expect("all").len(), 2);
        assert!(root.all("ul.list > li").expect("all")[0].has_class("item_bnr"));
        assert_eq!(root.anchor_href().expect("href"), "/a");
        assert_eq!(root.require("li > a").expect("a").text_trim(), "first title");
        assert_eq!(root.require("span.num").expect("num").text_u64().expect("u64"), 1234);
        assert_eq!(root.img_src().expect("img"), "");
        assert!(matches!(
            root.require("div.missing"),
            Err(ExtractionError::SelectorNotFound { .. })
        ));
        assert!(matches!(
            root.first("div[[["),
            Err(ExtractionError::InvalidSelector { .. })
        ));
    }

    #[test]
    fn meta_properties_are_trimmed() {
        let page = Page::parse("https://v.daum.net/v/1", HTML);
        assert_eq!(
            page.meta_property("og:article:author").expect("meta").as_deref(),
            Some("연합뉴스")
        );
        assert_eq!(page.meta_property("og:title").expect("meta"), None);
    }

    #[test]
    fn list_context_links_dump_artifacts() {
        let instant = DateTime::parse_from_rfc3339("2022-11-05T20:30:15+09:00").expect("ts");
        let dump = DumpDirectory::allocate("/d", "top", instant);
        let mut ctx = ListContext::new(&dump);
        let mut news = News::new("u", "t");
        ctx.place(&mut news, 2, 1, 0, true);
        ctx.capture_tab(2, "div#a");
        ctx.capture_tab(2, "div#b");

        assert_eq!(news.layout_key(), (2, 1, 0));
        assert_eq!(news.full_html, "/d/20221105/top/203015.000000000.00.html");
        assert_eq!(news.tab_screenshot, "/d/20221105/top/203015.000000000.tab.02.jpg");
        assert_eq!(
            ctx.into_tab_captures(),
            vec![TabCapture {
                tab: 2,
                selector: "div#a".into()
            }]
        );
    }

    #[test]
    fn registry_covers_supported_pairs() {
        let daum_pc = strategy_for(Source::Daum, DeviceType::Pc).expect("daum pc");
        assert_eq!(daum_pc.source(), Source::Daum);
        assert_eq!(daum_pc.device(), DeviceType::Pc);
        assert!(strategy_for(Source::Daum, DeviceType::Mobile).is_some());
        assert!(strategy_for(Source::Naver, DeviceType::Pc).is_some());
        assert!(strategy_for(Source::Naver, DeviceType::Mobile).is_none());
    }
}
