//! Applitrack/Frontline district boards: one server-rendered page lists every opening.

use async_trait::async_trait;
use harvest_core::{ListingDraft, Source};
use harvest_storage::FetchRequest;
use scraper::Html;
use serde_json::json;
use tracing::info;
use url::Url;

use crate::{
    element_text, required_str, selector, AdapterContext, AdapterError, RawListing, SourceAdapter,
    BROWSER_USER_AGENT,
};

pub(crate) const PLATFORM: &str = "applitrack";

const DEFAULT_HOST: &str = "https://www.applitrack.com";

#[derive(Debug, Clone)]
pub struct ApplitrackAdapter {
    host: String,
    slug: Option<String>,
}

impl ApplitrackAdapter {
    pub fn from_source(source: &Source) -> Self {
        let host = source
            .config_str("host")
            .unwrap_or(DEFAULT_HOST)
            .trim_end_matches('/')
            .to_string();
        let slug = source.slug.clone().or_else(|| slug_from_base_url(&source.base_url));
        Self { host, slug }
    }

    fn slug(&self) -> Result<&str, AdapterError> {
        self.slug
            .as_deref()
            .ok_or_else(|| AdapterError::Misconfigured("applitrack source needs a slug".into()))
    }

    pub fn output_url(&self, slug: &str) -> String {
        format!("{}/{slug}/onlineapp/jobpostings/Output.asp", self.host)
    }

    pub fn detail_url(&self, slug: &str, job_id: Option<&str>) -> String {
        match job_id {
            Some(id) => format!(
                "{}/{slug}/onlineapp/default.aspx?AppliTrackJobId={id}&AppliTrackLayoutMode=detail&AppliTrackViewPosting=1",
                self.host
            ),
            None => format!("{}/{slug}/onlineapp/default.aspx", self.host),
        }
    }

    /// Each opening is a `table` whose class mentions `title`: first cell is the
    /// title, second reads `JobID: 12345`.
    pub fn parse_output_page(&self, slug: &str, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let tables = selector("table")?;
        let rows = selector("tr")?;
        let cells = selector("td")?;

        let mut listings = Vec::new();
        for table in document.select(&tables) {
            let is_title_table = table
                .value()
                .attr("class")
                .is_some_and(|class| class.to_ascii_lowercase().contains("title"));
            if !is_title_table {
                continue;
            }
            let Some(first_row) = table.select(&rows).next() else {
                continue;
            };
            let mut row_cells = first_row.select(&cells);
            let Some(title) = row_cells.next().and_then(element_text) else {
                continue;
            };
            let job_id = row_cells
                .next()
                .and_then(element_text)
                .and_then(|text| parse_job_id(&text));

            listings.push(RawListing::new(json!({
                "title": title,
                "job_id": job_id,
                "url": self.detail_url(slug, job_id.as_deref()),
            })));
        }
        Ok(listings)
    }
}

fn slug_from_base_url(base_url: &str) -> Option<String> {
    let url = Url::parse(base_url).ok()?;
    if !url.host_str()?.contains("applitrack.com") {
        return None;
    }
    url.path_segments()?
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Digits following `JobID:`.
fn parse_job_id(text: &str) -> Option<String> {
    let (_, rest) = text.split_once("JobID:")?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    (!digits.is_empty()).then_some(digits)
}

#[async_trait]
impl SourceAdapter for ApplitrackAdapter {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawListing>, AdapterError> {
        let slug = self.slug()?;
        let request = FetchRequest::get(self.output_url(slug))
            .query("all", 1)
            .header("user-agent", BROWSER_USER_AGENT);
        let html = ctx
            .http
            .get_text(ctx.run_id, ctx.source.id, &request)
            .await?;
        let listings = self.parse_output_page(slug, &html)?;
        info!(source = %ctx.source.label(), count = listings.len(), "parsed applitrack output page");
        Ok(listings)
    }

    fn normalize(&self, raw: &RawListing) -> Result<ListingDraft, AdapterError> {
        let mut draft = ListingDraft::new(required_str(raw, "title")?, required_str(raw, "url")?);
        draft.external_id = raw.str_field("job_id").map(str::to_string);
        draft.raw_category = raw.str_field("raw_category").map(str::to_string);
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::Query;
    use axum::response::Html as HtmlResponse;
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::collections::HashMap;

    use super::*;
    use crate::test_support;

    const OUTPUT_PAGE: &str = r#"
        <html><body>
          <h2>Fine Arts</h2>
          <table class="'title'"><tr><td> Band Director </td><td>JobID: 4411</td></tr></table>
          <table class="'title'"><tr><td>Campus Nurse</td><td>JobID:9001</td></tr></table>
          <table class="'title'"><tr><td>Substitute Pool</td></tr></table>
          <table class="'title'"><tr><td>   </td><td>JobID: 1</td></tr></table>
          <table class="footer"><tr><td>Not a job</td><td>JobID: 2</td></tr></table>
        </body></html>
    "#;

    fn adapter(host: &str) -> ApplitrackAdapter {
        ApplitrackAdapter::from_source(&test_support::source(
            PLATFORM,
            "https://www.applitrack.com/springisd/onlineapp",
            Some("springisd"),
            json!({ "host": host }),
        ))
    }

    #[test]
    fn parses_title_tables_and_job_ids() {
        let adapter = adapter("https://www.applitrack.com");
        let listings = adapter.parse_output_page("springisd", OUTPUT_PAGE).unwrap();
        assert_eq!(listings.len(), 3);

        assert_eq!(listings[0].str_field("title"), Some("Band Director"));
        assert_eq!(listings[0].str_field("job_id"), Some("4411"));
        assert_eq!(
            listings[0].str_field("url"),
            Some("https://www.applitrack.com/springisd/onlineapp/default.aspx?AppliTrackJobId=4411&AppliTrackLayoutMode=detail&AppliTrackViewPosting=1")
        );
        assert_eq!(listings[1].str_field("job_id"), Some("9001"));
        assert_eq!(listings[2].str_field("job_id"), None);
        assert_eq!(
            listings[2].str_field("url"),
            Some("https://www.applitrack.com/springisd/onlineapp/default.aspx")
        );
    }

    #[test]
    fn normalize_maps_identity_fields() {
        let adapter = adapter("https://www.applitrack.com");
        let listings = adapter.parse_output_page("springisd", OUTPUT_PAGE).unwrap();
        let draft = adapter.normalize(&listings[0]).unwrap();
        assert_eq!(draft.title, "Band Director");
        assert_eq!(draft.external_id.as_deref(), Some("4411"));
        assert!(draft.location.is_none());
        assert!(adapter.normalize(&RawListing::new(json!({"title": "x"}))).is_err());
    }

    #[test]
    fn slug_falls_back_to_base_url_path() {
        let source = test_support::source(
            PLATFORM,
            "https://www.applitrack.com/cfisd/onlineapp/",
            None,
            json!({}),
        );
        let adapter = ApplitrackAdapter::from_source(&source);
        assert_eq!(adapter.slug().unwrap(), "cfisd");
        assert_eq!(parse_job_id("JobID:  77 (posted)"), Some("77".into()));
        assert_eq!(parse_job_id("no id"), None);
    }

    #[tokio::test]
    async fn fetch_reads_the_output_page() {
        let app = Router::new().route(
            "/springisd/onlineapp/jobpostings/Output.asp",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("all").map(String::as_str), Some("1"));
                HtmlResponse(OUTPUT_PAGE)
            }),
        );
        let host = test_support::serve(app).await;
        let adapter = adapter(&host);
        let ctx = test_support::context(test_support::source(
            PLATFORM,
            "https://www.applitrack.com/springisd/onlineapp",
            Some("springisd"),
            json!({ "host": host }),
        ));

        let listings = adapter.fetch(&ctx).await.unwrap();
        assert_eq!(listings.len(), 3);
        assert!(listings[0]
            .str_field("url")
            .unwrap()
            .starts_with(&format!("{host}/springisd/onlineapp/default.aspx")));
    }

    #[tokio::test]
    async fn unreachable_host_is_an_error_not_an_empty_scan() {
        let adapter = adapter("http://127.0.0.1:9");
        let ctx = test_support::context(test_support::source(
            PLATFORM,
            "https://www.applitrack.com/springisd/onlineapp",
            Some("springisd"),
            json!({}),
        ));
        let err = adapter.fetch(&ctx).await.unwrap_err();
        assert!(err.is_transport());
    }
}
