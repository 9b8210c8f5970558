//! In-process fake platform plus a wired memory-backed pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use harvest_adapters::{AdapterContext, AdapterError, AdapterRegistry, RawListing, SourceAdapter};
use harvest_core::{
    canonical_url, dedup_key, Clock, ListingDraft, ManualClock, NewSource, Posting, Run, Source,
};
use harvest_storage::{HttpClientConfig, HttpFetcher, MemoryRecordStore, RecordStore, RunFilter};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::{Dispatcher, IngestionPipeline};

pub const FAKE_PLATFORM: &str = "fake";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap()
}

pub fn listing(title: &str, url: &str) -> JsonValue {
    json!({ "title": title, "url": url })
}

/// What the fake platform serves for one base URL.
#[derive(Debug, Clone)]
pub enum FakeFeed {
    Listings(Vec<JsonValue>),
    Fail(String),
    Hang,
}

#[derive(Debug, Clone, Default)]
pub struct FakeUpstream {
    feeds: Arc<Mutex<HashMap<String, FakeFeed>>>,
}

impl FakeUpstream {
    pub fn set(&self, base_url: &str, feed: FakeFeed) {
        self.feeds.lock().unwrap().insert(base_url.to_string(), feed);
    }

    fn feed(&self, base_url: &str) -> FakeFeed {
        self.feeds
            .lock()
            .unwrap()
            .get(base_url)
            .cloned()
            .unwrap_or(FakeFeed::Listings(Vec::new()))
    }

    pub fn registry(&self) -> AdapterRegistry {
        let upstream = self.clone();
        let mut registry = AdapterRegistry::new();
        registry.register(FAKE_PLATFORM, move |source: &Source| {
            Box::new(FakeAdapter {
                upstream: upstream.clone(),
                base_url: source.base_url.clone(),
            })
        });
        registry
    }
}

struct FakeAdapter {
    upstream: FakeUpstream,
    base_url: String,
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn platform(&self) -> &'static str {
        FAKE_PLATFORM
    }

    async fn fetch(&self, _ctx: &AdapterContext) -> Result<Vec<RawListing>, AdapterError> {
        match self.upstream.feed(&self.base_url) {
            FakeFeed::Listings(items) => Ok(items.into_iter().map(RawListing::new).collect()),
            FakeFeed::Fail(reason) => Err(AdapterError::Transport(reason)),
            FakeFeed::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }

    fn normalize(&self, raw: &RawListing) -> Result<ListingDraft, AdapterError> {
        let title = raw
            .str_field("title")
            .ok_or_else(|| AdapterError::Parse("no title".into()))?;
        let url = raw
            .str_field("url")
            .ok_or_else(|| AdapterError::Parse("no url".into()))?;
        let mut draft = ListingDraft::new(title, url);
        draft.description = raw.str_field("description").map(str::to_string);
        draft.city = raw.str_field("city").map(str::to_string);
        draft.location = raw.str_field("location").map(str::to_string);
        Ok(draft)
    }
}

pub struct Harness {
    pub store: Arc<MemoryRecordStore>,
    pub clock: Arc<ManualClock>,
    pub upstream: FakeUpstream,
    pub pipeline: Arc<IngestionPipeline>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let upstream = FakeUpstream::default();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            Arc::new(upstream.registry()),
            Arc::new(http),
            clock.clone(),
            Duration::from_millis(200),
        ));
        let dispatcher = Dispatcher::new(
            store.clone(),
            pipeline.clone(),
            clock.clone(),
            chrono::Duration::minutes(10),
        );
        Self {
            store,
            clock,
            upstream,
            pipeline,
            dispatcher,
        }
    }

    pub async fn add_source(&self, base_url: &str, interval_minutes: i32) -> Source {
        self.add_source_on(FAKE_PLATFORM, base_url, interval_minutes).await
    }

    pub async fn add_source_on(
        &self,
        platform: &str,
        base_url: &str,
        interval_minutes: i32,
    ) -> Source {
        self.store
            .insert_source(
                NewSource {
                    platform: platform.into(),
                    base_url: base_url.into(),
                    slug: None,
                    active: true,
                    refresh_interval_minutes: interval_minutes,
                    organization_id: None,
                    config: JsonMap::new(),
                    discovered_by: "test".into(),
                },
                self.clock.now(),
            )
            .await
            .unwrap()
    }

    pub async fn source(&self, id: Uuid) -> Source {
        self.store.get_source(id).await.unwrap().unwrap()
    }

    pub async fn posting(&self, url: &str) -> Posting {
        let key = dedup_key(&canonical_url(url).unwrap());
        self.store.get_posting_by_key(&key).await.unwrap().unwrap()
    }

    /// Newest first.
    pub async fn runs(&self, source_id: Uuid) -> Vec<Run> {
        self.store
            .list_runs(&RunFilter::for_source(source_id, 100))
            .await
            .unwrap()
    }
}
