//! Naver news portal. Only the desktop entry points are registered; list and
//! body parsing are not implemented yet.

use colln_core::{DeviceType, News, Source};
use tracing::debug;

use crate::{
    BodyOutcome, ExtractionError, ExtractionStrategy, ListContext, Page, PortalEndpoints,
};

pub const TOP_URL: &str = "https://www.naver.com/";
pub const HOME_URL: &str = "https://news.naver.com/";

pub struct NaverPc;

impl ExtractionStrategy for NaverPc {
    fn source(&self) -> Source {
        Source::Naver
    }

    fn device(&self) -> DeviceType {
        DeviceType::Pc
    }

    fn endpoints(&self) -> PortalEndpoints {
        PortalEndpoints {
            top_url: TOP_URL.to_string(),
            home_url: HOME_URL.to_string(),
        }
    }

    fn list_top(&self, page: &Page, _ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        debug!(url = page.url(), "naver top list has no parser");
        Ok(Vec::new())
    }

    fn list_home(&self, page: &Page, _ctx: &mut ListContext<'_>) -> Result<Vec<News>, ExtractionError> {
        debug!(url = page.url(), "naver home list has no parser");
        Ok(Vec::new())
    }

    fn extract_body(&self, _page: &Page, _news: &News) -> Result<BodyOutcome, ExtractionError> {
        Err(ExtractionError::Unsupported {
            what: "naver pc news end".to_string(),
        })
    }
}
