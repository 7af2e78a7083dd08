//! Daum news portal, desktop and mobile layouts.

use colln_core::{Emotion, End};
use scraper::ElementRef;
use tracing::debug;

use crate::{ExtractionError, Inspect, PortalEndpoints};

pub mod mobile;
pub mod pc;

pub const TOP_URL: &str = "https://www.daum.net/";
pub const HOME_URL: &str = "https://news.daum.net/";

pub(crate) fn endpoints() -> PortalEndpoints {
    PortalEndpoints {
        top_url: TOP_URL.to_string(),
        home_url: HOME_URL.to_string(),
    }
}

pub(crate) const ARTICLE_IMAGES: &str = "img[class=thumb_g_article]";

pub(crate) fn article_images(article: ElementRef<'_>) -> Result<Vec<String>, ExtractionError> {
    Ok(article
        .all(ARTICLE_IMAGES)?
        .into_iter()
        .map(|img| img.attr_or_empty("src"))
        .collect())
}

/// Body of a TV clip page (`div#videoWrap`), shared by both layouts.
pub(crate) fn video_end(
    content: ElementRef<'_>,
    video: ElementRef<'_>,
) -> Result<End, ExtractionError> {
    let inner = video.require("div[class=inner_view]")?;
    let program_block = inner.require("h3[class=tit_program]")?;

    let mut end = End {
        program: program_block.require("span[class=wrap_thumb]")?.img_alt()?,
        provider: program_block
            .require("a[class=btn_allview]")?
            .require("span")?
            .text_trim(),
        ..Default::default()
    };

    let cont = inner
        .require("div[class=box_vod]")?
        .require("div[class=cont_vod]")?;
    end.title = cont
        .require("h4[class=tit_vod]")?
        .require("span[class=inner_tit]")?
        .require("span[class=inner_tit2]")?
        .text_trim();

    let info = content.require("div[class=info_vod]")?;
    for (idx, span) in info.all("span")?.into_iter().enumerate() {
        match idx {
            1 => end.num_played = span.text_u64()?,
            3 => end.posted_at = span.text_trim().replace("등록", "").trim().to_string(),
            _ => {}
        }
    }
    Ok(end)
}

/// Reaction buttons. `items` and `count` differ between layouts.
pub(crate) fn parse_emotions(
    article: ElementRef<'_>,
    box_selector: &str,
    items: &str,
    count: &str,
) -> Result<Vec<Emotion>, ExtractionError> {
    let Some(emotion_box) = article.first(box_selector)? else {
        return Ok(Vec::new());
    };

    let mut emotions = Vec::new();
    for item in emotion_box.all(items)? {
        let name = item
            .attr_or_empty("data-tiara-action-name")
            .replacen("액션_", "", 1);
        let raw_count = item
            .first(count)?
            .map(|el| el.text_trim())
            .unwrap_or_default();
        if raw_count.is_empty() {
            debug!(emotion = %name, "empty emotion count");
        }
        emotions.push(Emotion::parse(name, &raw_count));
    }
    Ok(emotions)
}

/// Removes a label such as `입력` from a timestamp span.
pub(crate) fn strip_label(text: &str, label: &str) -> String {
    text.replace(label, "").trim().to_string()
}
