use colln_core::{DeviceType, End, News, Source};
use scraper::ElementRef;
use tracing::{debug, warn};

use super::{article_images, endpoints, strip_label, video_end};
use crate::{
    first_present, BodyOutcome, ExtractionError, ExtractionStrategy, Inspect, ListContext, Page,
    PortalEndpoints, SkipReason,
};

const MEDIA_TAB: &str = "div[id=mediaTab]";
const ISSUE_LIST: &str = "#cSub ul[class=list_issue]";
const POP_COMMENT: &str = "#mArticle div[class=box_peruse] > div[class='pop_news pop_cmt']";
const POP_NEWS: &str = "#mArticle div[class='box_g box_popnews'] > div[class='pop_news pop_cmt']";
const POP_AGE: &str = "#mArticle div[class='pop_news pop_age']";
const HEADLINE: &str = "#mArticle div[class=box_headline]";

const CONTENT_BLOCKS: [&str; 4] = [
    "div[id=daumContent]",
    "main[id=daumContent]",
    "div[id=kakaoContent]",
    "main[id=kakaoContent]",
];
const MAIN_BLOCKS: [&str; 3] = [
    "div[class=main-content]",
    "div[class=feature_vodview]",
    "div[id=cMain]",
];

pub struct DaumPc;

impl ExtractionStrategy for DaumPc {
    fn source(&self) -> Source {
        Source::Daum
    }

    fn device(&self) -> DeviceType {
        DeviceType::Pc
    }

    fn endpoints(&self) -> PortalEndpoints {
        endpoints()
    }

    fn list_top(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        let mut out = Vec::new();
        let Some(media) = page.root().first(MEDIA_TAB)? else {
            return Ok(out);
        };

        let page_num = match media.first("strong[id=mediaPageNum]")? {
            Some(el) => {
                let text = el.text_trim();
                text.parse()
                    .map_err(|_| ExtractionError::InvalidNumber { text })?
            }
            None => 1,
        };
        ctx.capture_tab(page_num, MEDIA_TAB);

        let group = media.require("div[class=group_news]")?;
        let thumbs = group.all("ul[class=list_thumb] > li")?;
        let thumb_count = thumbs.len() as u32;
        for (idx, item) in thumbs.into_iter().enumerate() {
            let title = item
                .require("div[class=cont_item] > strong[class=tit_item]")?
                .text_trim();
            let mut news = News::new(item.anchor_href()?, title).with_image(item.img_src()?);
            ctx.place(&mut news, page_num, idx as u32, 0, true);
            out.push(news);
        }

        for (idx, item) in group.all("ul[class=list_txt] > li")?.into_iter().enumerate() {
            let a = item.require("a")?;
            let mut news = News::new(a.attr_or_empty("href"), a.text_trim());
            ctx.place(&mut news, page_num, thumb_count + idx as u32, 0, true);
            out.push(news);
        }

        Ok(out)
    }

    fn list_home(&self, page: &Page, ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        let root = page.root();
        let mut out = Vec::new();
        let mut page_num = 1;

        if let Some(issues) = root.first(ISSUE_LIST)? {
            ctx.capture_tab(page_num, ISSUE_LIST);
            for (idx, li) in issues.children_named("li").into_iter().enumerate() {
                let mut news = issue(li)?;
                ctx.place(&mut news, page_num, idx as u32, 0, true);
                out.push(news);

                let related = li.all("div[class=relate_thumb] div[class=thumb_relate]")?;
                for (jdx, div) in related.into_iter().enumerate() {
                    let mut news = issue_related(div)?;
                    ctx.place(&mut news, page_num, idx as u32, jdx as u32 + 1, true);
                    out.push(news);
                }
            }
        }
        page_num += 1;

        let article = root.require("#cMain")?.require("#mArticle")?;
        page_num += 1;

        if let Some(block) = root.first(POP_COMMENT)? {
            ctx.capture_tab(page_num, POP_COMMENT);
            out.extend(pop_news(ctx, block, "ol[class=list_popcmt]", page_num, 0)?);
            page_num += 1;
        }
        if let Some(block) = root.first(POP_NEWS)? {
            ctx.capture_tab(page_num, POP_NEWS);
            out.extend(pop_news(ctx, block, "ol[class=list_popcmt]", page_num, 1)?);
            page_num += 1;
        }
        if let Some(block) = root.first(POP_AGE)? {
            ctx.capture_tab(page_num, POP_AGE);
            for (idx, group) in block.children_named("div").into_iter().enumerate() {
                out.extend(pop_news(ctx, group, "ul", page_num, 2 + idx as u32)?);
            }
            page_num += 1;
        }

        if article.has("div[class=box_headline]")? {
            ctx.capture_tab(page_num, HEADLINE);
        }
        let headlines = article.all("div[class=box_headline] ul[class=list_headline]")?;
        for (idx, ul) in headlines.into_iter().enumerate() {
            for (jdx, li) in ul.children_named("li").into_iter().enumerate() {
                let mut news = headline(li)?;
                ctx.place(&mut news, page_num, idx as u32, jdx as u32, true);
                out.push(news);
            }
        }

        Ok(out)
    }

    fn extract_body(&self, page: &Page, news: &News) -> Result<BodyOutcome, ExtractionError> {
        let root = page.root();
        let (_, content) =
            first_present(root, &CONTENT_BLOCKS)?.ok_or_else(|| ExtractionError::ContentBlockNotFound {
                url: news.url.clone(),
            })?;

        let Some((main_selector, main)) = first_present(content, &MAIN_BLOCKS)? else {
            warn!(url = %news.url, "main block is missing");
            return Ok(BodyOutcome::Skipped(SkipReason::MissingArticleBlock));
        };
        debug!(url = %news.url, main_selector, "main block");

        if let Some(article) = main.first("article[data-cloud-area=article]")? {
            let end = article_end(page, content, article)?;
            return Ok(BodyOutcome::Extracted(Box::new(end)));
        }
        if let Some(video) = main.first("div[id=videoWrap]")? {
            return Ok(BodyOutcome::Extracted(Box::new(video_end(content, video)?)));
        }
        if main.has("div[class=photo_view]")? {
            return Ok(BodyOutcome::Skipped(SkipReason::PhotoView));
        }
        if main.has("div[class=view_vod]")? {
            return Ok(BodyOutcome::Skipped(SkipReason::VodView));
        }
        if content.has("div[id=cFeature]")? {
            return Ok(BodyOutcome::Skipped(SkipReason::Feature));
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
        provider: page.meta_property("og:article:author")?.unwrap_or_default(),
        ..Default::default()
    };

    let head = content.require("div[class=head_view]")?;
    if end.provider.is_empty() {
        if let Some(cp) = head.first("em[class=info_cp] > a[class=link_cp]")? {
            end.provider = cp.img_alt()?;
        } else if let Some(issue) = head.first("a.link_issue > strong.tit_thumb")? {
            end.provider = issue.text_trim();
        }
    }
    end.title = head.require("h3[class=tit_view]")?.text_trim();

    let info = head.require("div[class=info_view]")?;
    for span in info.all("span[class=txt_info]")? {
        let text = span.text_trim();
        if text.contains("입력 ") {
            end.posted_at = strip_label(&text, "입력 ");
        } else if text.contains("수정 ") {
            end.modified_at = strip_label(&text, "수정 ");
        } else {
            end.author = text;
        }
    }

    let util = head.require("div[class=util_wrap]")?;
    if let Some(counter) = util.first("button.btn_cmt")? {
        end.num_comment = counter.require("span.num_cmt")?.text_u64()?;
    }

    end.text = article.text_block();
    end.html = page.html();
    end.images = article_images(article)?;
    Ok(end)
}

fn issue(li: ElementRef<'_>) -> Result<News, ExtractionError> {
    let image = match li.first("div[class=item_issue]")? {
        Some(item) => item.img_src()?,
        None => String::new(),
    };
    let cont = li.require("div[class=cont_thumb]")?;
    let a = cont.require("strong > a")?;
    let publisher = cont.require("span[class=info_thumb]")?.text_trim();
    Ok(News::new(a.attr_or_empty("href"), a.text_trim())
        .with_image(image)
        .with_publisher(publisher))
}

fn issue_related(div: ElementRef<'_>) -> Result<News, ExtractionError> {
    let a = div.require("a")?;
    let publisher = div.require("span[class=info_news]")?.text_trim();
    Ok(News::new(a.attr_or_empty("href"), a.text_trim()).with_publisher(publisher))
}

fn headline(li: ElementRef<'_>) -> Result<News, ExtractionError> {
    if li.has_class("item_main") {
        let title = li.require("strong[class=tit_g]")?.text_trim();
        return Ok(News::new(li.anchor_href()?, title).with_image(li.img_src()?));
    }
    let a = li.require("a")?;
    let publisher = li.require("span[class=info_news]")?.text_trim();
    Ok(News::new(a.attr_or_empty("href"), a.text_trim()).with_publisher(publisher))
}

fn pop_news(
    ctx: &ListContext<'_>,
    block: ElementRef<'_>,
    list_selector: &str,
    page_num: u32,
    order: u32,
) -> Result<Vec<News>, ExtractionError> {
    let list = block.require(list_selector)?;
    let mut out = Vec::new();
    for (jdx, li) in list.children_named("li").into_iter().enumerate() {
        let a = li.require("a")?;
        let publisher = match li.first("span[class=info_news]")? {
            Some(span) => span.text_trim(),
            None => String::new(),
        };
        let mut news = News::new(a.attr_or_empty("href"), a.text_trim()).with_publisher(publisher);
        ctx.place(&mut news, page_num, order, jdx as u32, true);
        out.push(news);
    }
    Ok(out)
}
