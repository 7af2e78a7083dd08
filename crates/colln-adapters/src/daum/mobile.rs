use colln_core::{DeviceType, End, News, Source};
use scraper::ElementRef;
use tracing::{debug, warn};

use super::{article_images, endpoints, parse_emotions, strip_label, video_end};
use crate::{
    first_present, BodyOutcome, ExtractionError, ExtractionStrategy, Inspect, ListContext, Page,
    PortalEndpoints, SkipReason, ViewPlan,
};

const TOP_NEWS_TAB: &str = "div[id=channel_news1_top]";
const FEED_BLOCKS: &str = "div._box_feed_news1";
const HOME_MAIN: &str = "main[id=kakaoContent]";
const SUB_SECTIONS: [&str; 3] = [
    "div[data-tiara-layer=POPULAR]",
    "div[data-tiara-layer=DRI]",
    "div.box_cmtrank",
];
const CONTENT_BLOCKS: [&str; 3] = [
    "div[id=daumContent]",
    "main[id=kakaoContent]",
    "main[id=daumContent]",
];
const UNSUPPORTED_CONTENT_BLOCK: &str = "main[class=doc-main]";

/// Expands the main news block by clicking "more" until it disappears.
const EXPAND_MAIN_NEWS: &str = r#"(() => {
  const block = document.querySelector('main#kakaoContent div.section_main div[data-tiara-layer=MAIN_NEWS]');
  if (!block) return;
  block.scrollIntoView();
  for (let i = 0; i < 20; i++) {
    const more = block.querySelector('a.link_more');
    if (!more || more.offsetParent === null) break;
    more.click();
  }
})();"#;

pub struct DaumMobile;

#[derive(Clone, Copy)]
enum FeedShape {
    Text,
    Horizon,
    Thumb,
    Theme,
}

impl ExtractionStrategy for DaumMobile {
    fn source(&self) -> Source {
        Source::Daum
    }

    fn device(&self) -> DeviceType {
        DeviceType::Mobile
    }

    fn endpoints(&self) -> PortalEndpoints {
        endpoints()
    }

    fn prepare_home_view(&self, view: &mut ViewPlan) {
        view.scripts.push(EXPAND_MAIN_NEWS.to_string());
    }

    fn list_top(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        let root = page.root();
        let mut out = Vec::new();
        if !root.has(TOP_NEWS_TAB)? {
            return Ok(out);
        }

        let mut page_num = 1;
        for block in root.all(FEED_BLOCKS)? {
            let (shape, items) = if let Some(list) = block.first("ul.list_txt")? {
                (FeedShape::Text, list.all("li")?)
            } else if let Some(list) = block.first("ul.list_horizon")? {
                (FeedShape::Horizon, list.all("li")?)
            } else if let Some(list) = block.first("ul.list_thumb")? {
                (FeedShape::Thumb, list.all("li")?)
            } else if block.has("ul.list_theme")? {
                (FeedShape::Theme, block.all("ul.list_theme li")?)
            } else {
                warn!(html = %block.html(), "failed to get news items from news block");
                continue;
            };

            for (idx, item) in items.into_iter().enumerate() {
                let mut news = match shape {
                    FeedShape::Text => text_item(item)?,
                    FeedShape::Horizon => horizon_item(item)?,
                    FeedShape::Thumb => thumb_item(item)?,
                    FeedShape::Theme => theme_item(item)?,
                };
                ctx.place(&mut news, page_num, idx as u32, 0, false);
                out.push(news);
            }
            page_num += 1;
        }

        Ok(out)
    }

    fn list_home(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        let mut out: Vec<News> = Vec::new();
        let Some(main) = page.root().first(HOME_MAIN)? else {
            return Ok(out);
        };

        let mut page_num = 1;
        let section_main = main.require("div.section_main")?;
        let section_sub = main.require("div.section_sub")?;

        if let Some(issue) = section_main.first("div.box_homeissue")? {
            for (idx, item) in issue.all("ul.list_homeissue > li")?.into_iter().enumerate() {
                let cont = item.require("div.cont_thumb")?;
                let cont_main = cont.require("span.inner_link")?;
                let image = match item.first("div.wrap_thumb")? {
                    Some(thumb) => thumb.img_src()?,
                    None => String::new(),
                };
                let mut lead = News::new(
                    cont.anchor_href()?,
                    cont_main.require("strong.tit_thumb")?.text_trim(),
                )
                .with_publisher(cont_main.require("span.txt_cp")?.text_trim())
                .with_image(image);
                ctx.place(&mut lead, page_num, idx as u32, 0, false);
                out.push(lead);

                let sub = item.require("div.cont_sub")?;
                let cont_sub = sub.require("span.inner_link")?;
                let mut follow = News::new(
                    sub.anchor_href()?,
                    cont_sub.require("span.tit_sub")?.text_trim(),
                )
                .with_publisher(cont_sub.require("span.txt_cp")?.text_trim());
                ctx.place(&mut follow, page_num, idx as u32, 1, false);
                out.push(follow);
            }
        }

        page_num += 1;
        if let Some(main_news) = section_main.first("div[data-tiara-layer=MAIN_NEWS]")? {
            let order = next_order(&out);
            out.extend(news_list(ctx, main_news, page_num, order)?);
        }

        for selector in SUB_SECTIONS {
            page_num += 1;
            if let Some(block) = section_sub.first(selector)? {
                let order = next_order(&out);
                out.extend(news_list(ctx, block, page_num, order)?);
            }
        }

        Ok(out)
    }

    fn extract_body(&self, page: &Page, news: &News) -> Result<BodyOutcome, ExtractionError> {
        let root = page.root();
        let Some((_, content)) = first_present(root, &CONTENT_BLOCKS)? else {
            if root.has(UNSUPPORTED_CONTENT_BLOCK)? {
                return Err(ExtractionError::UnsupportedContentBlock {
                    block: UNSUPPORTED_CONTENT_BLOCK.to_string(),
                });
            }
            return Err(ExtractionError::ContentBlockNotFound {
                url: news.url.clone(),
            });
        };

        let Some(m_article) = content.first("article[id=mArticle]")? else {
            warn!(url = %news.url, "article block is missing");
            return Ok(BodyOutcome::Skipped(SkipReason::MissingArticleBlock));
        };

        if let Some(article) = m_article.first("div[data-cloud-area=article]")? {
            let end = article_end(page, content, article)?;
            return Ok(BodyOutcome::Extracted(Box::new(end)));
        }
        if let Some(video) = m_article.first("div[id=videoWrap]")? {
            return Ok(BodyOutcome::Extracted(Box::new(video_end(content, video)?)));
        }
        if m_article.has("div[class=photo_view]")? {
            return Ok(BodyOutcome::Skipped(SkipReason::PhotoView));
        }
        if content.has("div[class=view_vod]")? {
            return Ok(BodyOutcome::Skipped(SkipReason::VodView));
        }
        if content.has("div[class=cont_vod]")? {
            return Ok(BodyOutcome::Skipped(SkipReason::ContentVod));
        }
        if content.has("div[data-tiara-layer=c_viewcontents]")? {
            return Ok(BodyOutcome::Skipped(SkipReason::ViewContents));
        }

        Err(ExtractionError::UnexpectedShape {
            url: news.url.clone(),
        })
    }
}

fn article_end(
    page: &Page,
    content: ElementRef<'_>,
    article: ElementRef<'_>,
) -> Result<End, ExtractionError> {
    let mut end = End {
        category: content.require("h2[class=screen_out]")?.text_trim(),
        ..Default::default()
    };

    let head = content.require("div[class=head_view]")?;
    let cp = head
        .first("em[class=info_cp] > a[class=link_cp] > picture")?
        .ok_or(ExtractionError::ProviderBlockNotFound)?;
    end.provider = cp.img_alt()?;
    if end.provider.is_empty() {
        end.provider = cp.descendant_attr("[alt]", "alt")?;
    }
    end.title = head.require("h3[class=tit_view]")?.text_trim();

    let info = head.require("div[class=info_view]")?;
    for (idx, span) in info.all("span[class=txt_info]")?.into_iter().enumerate() {
        match idx {
            0 => end.posted_at = strip_label(&span.text_trim(), "입력"),
            1 => end.modified_at = strip_label(&span.text_trim(), "수정"),
            _ => {}
        }
    }
    end.author = match info.first("span[class=txt_author]")? {
        Some(author) => author.text_trim(),
        None => "NotFound".to_string(),
    };

    if let Some(counter) = head.first("button[id=alexCounter]")? {
        end.num_comment = counter.require("span.alex-count-area")?.text_u64()?;
    }

    let body = article.require("div[data-cloud=article_body]")?;
    end.text = body.require("div[class=article_view]")?.text_block();
    if let Some(figure) = body.first("figure")? {
        let caption = figure.text_block();
        if !caption.is_empty() && end.text.starts_with(&caption) {
            end.text = end.text.replacen(&caption, "", 1).trim_start().to_string();
        }
    }

    end.html = page.html();
    end.images = article_images(article)?;
    end.emotions = parse_emotions(
        article,
        "div.emotion_wrap > div.emotion_list > div.alex-action > div > div.list-wrapper",
        "div.selectionbox",
        "span.count",
    )?;
    Ok(end)
}

fn next_order(items: &[News]) -> u32 {
    items.last().map(|n| n.order + 1).unwrap_or(0)
}

/// Ranked lists of the home page. Banner and correction rows do not count
/// towards the sub order.
fn news_list(
    ctx: &ListContext<'_>,
    block: ElementRef<'_>,
    page_num: u32,
    order: u32,
) -> Result<Vec<News>, ExtractionError> {
    let mut out = Vec::new();
    let mut skipped = 0u32;
    for (idx, item) in block.all("ul > li")?.into_iter().enumerate() {
        if item.has_class("item_bnr") {
            skipped += 1;
            continue;
        }

        let cont = if let Some(el) = item.first("div.cont_thumb > strong.tit_thumb")? {
            el
        } else if let Some(el) = item.first("div.cont_thumb > strong.tit_news")? {
            el
        } else if let Some(el) = item.first("div.item_cmtrank > strong.tit_cmtrank")? {
            el
        } else if item.has("a.link_correction")? {
            debug!("skip link correction item");
            skipped += 1;
            continue;
        } else {
            return Err(ExtractionError::SelectorNotFound {
                selector: "div.cont_thumb > strong.tit_thumb".to_string(),
            });
        };

        let publisher = match cont.first("span.txt_cp")? {
            Some(cp) => cp.text_trim(),
            None => String::new(),
        };
        let title = match cont.first("span.txt_g")? {
            Some(title) => title.text_trim(),
            None => cont.text_trim(),
        };
        let image = match item.first("div.wrap_thumb")? {
            Some(thumb) => thumb.img_src()?,
            None => String::new(),
        };

        let mut news = News::new(item.anchor_href()?, title)
            .with_publisher(publisher)
            .with_image(image);
        ctx.place(&mut news, page_num, order, idx as u32 - skipped, false);
        out.push(news);
    }
    Ok(out)
}

fn text_item(item: ElementRef<'_>) -> Result<News, ExtractionError> {
    let a = item.require("a")?;
    Ok(News::new(a.attr_or_empty("href"), a.text_trim()))
}

fn thumb_item(item: ElementRef<'_>) -> Result<News, ExtractionError> {
    let title = item
        .require("div[class=cont_item] > strong[class=tit_item]")?
        .text_trim();
    Ok(News::new(item.anchor_href()?, title).with_image(item.img_src()?))
}

fn horizon_item(item: ElementRef<'_>) -> Result<News, ExtractionError> {
    let a = item.require("a")?;
    let (title, image) = if let Some(thumb) = a.first("div.wrap_thumb")? {
        (a.require("strong.tit_item")?.text_trim(), thumb.img_src()?)
    } else if a.has("span.link_txt")? {
        (a.require("span.tit_news")?.text_trim(), String::new())
    } else {
        (String::new(), String::new())
    };
    Ok(News::new(a.attr_or_empty("href"), title).with_image(image))
}

/// Theme items prefix the title with a series name in `<em>`.
fn theme_item(item: ElementRef<'_>) -> Result<News, ExtractionError> {
    let content = item.require("div[class=cont_item]")?;
    let title_block = content.require("strong[class=tit_item]")?;

    let mut news = match title_block.first("em")? {
        Some(series) => {
            let series_title = series.text_trim();
            let title = title_block.text_trim().replace(&series_title, "");
            let mut news = News::new(item.anchor_href()?, title.trim());
            news.series_title = series_title;
            news
        }
        None => News::new(item.anchor_href()?, title_block.text_trim()),
    };
    news.publisher = content.require("span")?.text_trim();
    Ok(news)
}
