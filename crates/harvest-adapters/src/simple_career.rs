//! Generic HTML careers page for organizations without an applicant-tracking platform.

use std::collections::HashSet;

use async_trait::async_trait;
use harvest_core::{canonical_url, ListingDraft, Source};
use harvest_storage::FetchRequest;
use scraper::Html;
use serde_json::json;
use tracing::info;
use url::Url;

use crate::{
    element_text, required_str, selector, AdapterContext, AdapterError, RawListing, SourceAdapter,
    BROWSER_USER_AGENT,
};

pub(crate) const PLATFORM: &str = "simple_career";

const LISTING_SELECTORS: &str =
    ".job-listing, .career-listing, .position, .opening, [class*='job-item']";

/// Words that make link text look like a job title.
const JOB_KEYWORDS: [&str; 19] = [
    "apply",
    "position",
    "opening",
    "career",
    "job",
    "opportunity",
    "coordinator",
    "director",
    "manager",
    "specialist",
    "analyst",
    "teacher",
    "instructor",
    "associate",
    "assistant",
    "officer",
    "developer",
    "engineer",
    "administrator",
];

const SKIPPED_HREF_FRAGMENTS: [&str; 5] = ["#", "mailto:", "javascript:", "facebook.", "twitter."];

/// Link text this short is navigation, not a posting.
const MIN_LINK_TEXT_CHARS: usize = 10;

#[derive(Debug, Clone)]
pub struct SimpleCareerAdapter {
    page_url: String,
}

impl SimpleCareerAdapter {
    pub fn from_source(source: &Source) -> Self {
        Self {
            page_url: source.base_url.clone(),
        }
    }

    /// Structured listing blocks first; if the page has none, fall back to
    /// job-like links anywhere on it. Results are unique by URL, in page order.
    pub fn parse_page(&self, page_url: &str, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let base = Url::parse(page_url)
            .map_err(|e| AdapterError::Misconfigured(format!("career page url {page_url}: {e}")))?;
        let document = Html::parse_document(html);

        let mut found: Vec<(String, String)> = Vec::new();
        let heading_or_link = selector("h2, h3, h4, a")?;
        let link = selector("a")?;
        for block in document.select(&selector(LISTING_SELECTORS)?) {
            let Some(title_el) = block.select(&heading_or_link).next() else {
                continue;
            };
            let Some(title) = element_text(title_el) else {
                continue;
            };
            if !looks_like_job(&title) {
                continue;
            }
            let own_href = match title_el.value().name() {
                "a" => title_el.value().attr("href"),
                _ => None,
            };
            let href = own_href
                .or_else(|| block.select(&link).next().and_then(|a| a.value().attr("href")));
            let url = match href {
                Some(href) => resolve(&base, href),
                None => Some(base.to_string()),
            };
            if let Some(url) = url {
                found.push((title, url));
            }
        }

        if found.is_empty() {
            for anchor in document.select(&selector("a[href]")?) {
                let Some(text) = element_text(anchor) else {
                    continue;
                };
                if text.chars().count() <= MIN_LINK_TEXT_CHARS || !looks_like_job(&text) {
                    continue;
                }
                let Some(href) = anchor.value().attr("href") else {
                    continue;
                };
                let lowered = href.to_ascii_lowercase();
                if SKIPPED_HREF_FRAGMENTS.iter().any(|skip| lowered.contains(skip)) {
                    continue;
                }
                if let Some(url) = resolve(&base, href) {
                    found.push((text, url));
                }
            }
        }

        // Same key the store dedups on, so fragment variants collapse here.
        let mut seen = HashSet::new();
        Ok(found
            .into_iter()
            .filter(|(_, url)| seen.insert(canonical_url(url).unwrap_or_else(|_| url.clone())))
            .map(|(title, url)| RawListing::new(json!({ "title": title, "url": url })))
            .collect())
    }
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(|url| url.to_string())
}

fn looks_like_job(text: &str) -> bool {
    text.split_whitespace()
        .map(str::to_lowercase)
        .any(|word| JOB_KEYWORDS.contains(&word.as_str()))
}

#[async_trait]
impl SourceAdapter for SimpleCareerAdapter {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawListing>, AdapterError> {
        let request = FetchRequest::get(&self.page_url).header("user-agent", BROWSER_USER_AGENT);
        let response = ctx.http.fetch(ctx.run_id, ctx.source.id, &request).await?;
        // Relative links resolve against where redirects landed.
        let listings = self.parse_page(&response.final_url, &response.text())?;
        info!(source = %ctx.source.label(), count = listings.len(), "parsed career page");
        Ok(listings)
    }

    fn normalize(&self, raw: &RawListing) -> Result<ListingDraft, AdapterError> {
        Ok(ListingDraft::new(
            required_str(raw, "title")?,
            required_str(raw, "url")?,
        ))
    }
}
