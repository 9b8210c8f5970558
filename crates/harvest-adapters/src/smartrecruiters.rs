//! SmartRecruiters public postings API, paged 100 at a time and filtered to one region.

use async_trait::async_trait;
use chrono::DateTime;
use harvest_core::{ListingDraft, Source};
use harvest_storage::FetchRequest;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info};
use url::Url;

use crate::{AdapterContext, AdapterError, RawListing, SourceAdapter};

pub(crate) const PLATFORM: &str = "smartrecruiters";

const DEFAULT_API_BASE: &str = "https://api.smartrecruiters.com";
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 200;

#[derive(Debug, Clone)]
pub struct SmartRecruitersAdapter {
    api_base: String,
    company: Option<String>,
    base_url: String,
    /// Accepted region spellings; the first is the state code written on postings.
    regions: Vec<String>,
}

impl SmartRecruitersAdapter {
    pub fn from_source(source: &Source) -> Self {
        let api_base = source
            .config_str("api_base")
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let company = company_from_base_url(&source.base_url).or_else(|| source.slug.clone());
        let regions = source
            .config
            .get("regions")
            .and_then(JsonValue::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|values| !values.is_empty())
            .unwrap_or_else(|| vec!["TX".to_string(), "Texas".to_string()]);
        Self {
            api_base,
            company,
            base_url: source.base_url.clone(),
            regions,
        }
    }

    pub fn postings_url(&self, company: &str) -> String {
        format!("{}/v1/companies/{company}/postings", self.api_base)
    }

    fn state_code(&self) -> String {
        self.regions
            .first()
            .map(|r| r.to_ascii_uppercase())
            .unwrap_or_default()
    }

    fn accepts_region(&self, region: &str) -> bool {
        region.is_empty() || self.regions.iter().any(|r| r.eq_ignore_ascii_case(region))
    }

    /// Postings without a region are kept: the sources configured here only hire in-region.
    pub fn in_region(&self, posting: &JsonValue) -> bool {
        match posting.get("location") {
            Some(JsonValue::Object(location)) => self.accepts_region(
                location
                    .get("region")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default(),
            ),
            _ => false,
        }
    }
}

/// `careers.smartrecruiters.com/KIPP/texas-ads` -> `KIPP`.
fn company_from_base_url(base_url: &str) -> Option<String> {
    let url = Url::parse(base_url).ok()?;
    if !url.host_str()?.contains("smartrecruiters.com") {
        return None;
    }
    url.path_segments()?
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn label<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.get("label")?.as_str()
}

#[async_trait]
impl SourceAdapter for SmartRecruitersAdapter {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawListing>, AdapterError> {
        let company = self.company.as_deref().ok_or_else(|| {
            AdapterError::Misconfigured("smartrecruiters source needs a company in its url or slug".into())
        })?;
        let url = self.postings_url(company);

        let mut all = Vec::new();
        let mut offset = 0usize;
        for _ in 0..MAX_PAGES {
            debug!(%url, offset, "fetching smartrecruiters page");
            let request = FetchRequest::get(&url)
                .query("offset", offset)
                .query("limit", PAGE_SIZE)
                .header("accept", "application/json");
            let page: JsonValue = ctx.http.get_json(ctx.run_id, ctx.source.id, &request).await?;
            let postings = match page.get("content") {
                Some(JsonValue::Array(items)) => items.clone(),
                // A page without `content` (rate limit, error body) is a
                // truncated scan, never the last page.
                _ => {
                    return Err(AdapterError::Transport(format!(
                        "unexpected postings payload at offset {offset}"
                    )))
                }
            };
            let page_len = postings.len();
            all.extend(postings);
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        let total = all.len();
        let kept: Vec<RawListing> = all
            .into_iter()
            .filter(|posting| self.in_region(posting))
            .map(RawListing::new)
            .collect();
        info!(source = %ctx.source.label(), total, kept = kept.len(), "fetched smartrecruiters postings");
        Ok(kept)
    }

    fn normalize(&self, raw: &RawListing) -> Result<ListingDraft, AdapterError> {
        let posting = &raw.payload;
        if !posting.is_object() {
            return Err(AdapterError::Parse("posting is not an object".into()));
        }
        let title = posting
            .get("name")
            .and_then(JsonValue::as_str)
            .unwrap_or("Unknown Position");
        let application_url = raw
            .str_field("ref")
            .or_else(|| raw.str_field("applyUrl"))
            .unwrap_or(self.base_url.as_str());
        let mut draft = ListingDraft::new(title, application_url);

        let location = posting.get("location").filter(|l| l.is_object());
        let city = location
            .and_then(|l| l.get("city"))
            .and_then(JsonValue::as_str)
            .filter(|c| !c.is_empty());
        let region = location
            .and_then(|l| l.get("region"))
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        draft.city = city.map(str::to_string);
        draft.location = city.map(|city| format!("{city}, {region}"));
        draft.state = if self.accepts_region(region) {
            Some(self.state_code())
        } else {
            Some(region.chars().take(2).collect::<String>().to_ascii_uppercase())
        };

        draft.department = label(posting, "department").map(str::to_string);
        draft.employment_type = label(posting, "typeOfEmployment").map(str::to_string);
        draft.external_id = posting.get("id").and_then(|id| match id {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        });
        draft.posting_date = raw
            .str_field("releasedDate")
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.date_naive());

        let mut extra = JsonMap::new();
        if let Some(experience) = label(posting, "experienceLevel") {
            extra.insert("experience".into(), JsonValue::String(experience.to_string()));
        }
        draft.extra_data = extra;
        Ok(draft)
    }
}
