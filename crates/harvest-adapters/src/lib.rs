//! Source adapter contract, the platform registry, and the built-in adapters.

mod applitrack;
mod simple_career;
mod smartrecruiters;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{ListingDraft, Source};
use harvest_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use applitrack::ApplitrackAdapter;
pub use simple_career::SimpleCareerAdapter;
pub use smartrecruiters::SmartRecruitersAdapter;

pub const CRATE_NAME: &str = "harvest-adapters";

/// Browser-like agent for platforms that turn away obvious bots.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// One listing exactly as the platform delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub payload: JsonValue,
}

impl RawListing {
    pub fn new(payload: JsonValue) -> Self {
        Self { payload }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(JsonValue::as_str)
    }
}

/// Everything an adapter may touch during one fetch.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub source: Source,
    pub http: Arc<HttpFetcher>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source unreachable: {0}")]
    Transport(String),
    #[error("blocked by upstream: {0}")]
    Blocked(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("unparseable listing: {0}")]
    Parse(String),
    #[error("source misconfigured: {0}")]
    Misconfigured(String),
    #[error(transparent)]
    Http(FetchError),
}

impl AdapterError {
    /// Whole-source failures; only `Parse` is scoped to a single listing.
    pub fn is_transport(&self) -> bool {
        !matches!(self, AdapterError::Parse(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout(_) | AdapterError::Http(FetchError::Timeout { .. })
        )
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        if err.is_blocked() {
            return AdapterError::Blocked(err.to_string());
        }
        match err {
            FetchError::Timeout { url } => AdapterError::Timeout(url),
            FetchError::Request(inner) if inner.is_connect() => {
                AdapterError::Transport(inner.to_string())
            }
            other => AdapterError::Http(other),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Current listing set. An empty vector means the source really lists
    /// nothing; an unreachable source must be an error.
    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawListing>, AdapterError>;

    /// Map one raw listing onto the canonical fields, leaving what the
    /// platform does not expose as `None`.
    fn normalize(&self, raw: &RawListing) -> Result<ListingDraft, AdapterError>;
}

pub type AdapterFactory = Arc<dyn Fn(&Source) -> Box<dyn SourceAdapter> + Send + Sync>;

/// Platform name to adapter factory. Adapters are built fresh for every
/// invocation, so nothing an adapter holds outlives its run.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(applitrack::PLATFORM, |source| {
                Box::new(ApplitrackAdapter::from_source(source))
            })
            .register(smartrecruiters::PLATFORM, |source| {
                Box::new(SmartRecruitersAdapter::from_source(source))
            })
            .register(simple_career::PLATFORM, |source| {
                Box::new(SimpleCareerAdapter::from_source(source))
            });
        registry
    }

    pub fn register<F>(&mut self, platform: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Source) -> Box<dyn SourceAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(platform.into(), Arc::new(factory));
        self
    }

    pub fn build(&self, source: &Source) -> Option<Box<dyn SourceAdapter>> {
        self.factories
            .get(&source.platform)
            .map(|factory| factory(source))
    }

    pub fn contains(&self, platform: &str) -> bool {
        self.factories.contains_key(platform)
    }

    pub fn platforms(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("selector {css}: {e}")))
}

/// Element text with whitespace runs collapsed, `None` when blank.
pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn required_str<'a>(raw: &'a RawListing, key: &str) -> Result<&'a str, AdapterError> {
    raw.str_field(key)
        .ok_or_else(|| AdapterError::Parse(format!("raw listing has no {key}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use chrono::Utc;
    use harvest_core::{NewSource, Source};
    use harvest_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
    use serde_json::{Map as JsonMap, Value as JsonValue};
    use uuid::Uuid;

    use crate::AdapterContext;

    pub fn source(platform: &str, base_url: &str, slug: Option<&str>, config: JsonValue) -> Source {
        let config = match config {
            JsonValue::Object(map) => map,
            _ => JsonMap::new(),
        };
        Source::from_new(
            NewSource {
                platform: platform.into(),
                base_url: base_url.into(),
                slug: slug.map(str::to_string),
                active: true,
                refresh_interval_minutes: 360,
                organization_id: None,
                config,
                discovered_by: "test".into(),
            },
            Utc::now(),
        )
    }

    pub fn context(source: Source) -> AdapterContext {
        let http = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })
        .unwrap();
        AdapterContext {
            run_id: Uuid::new_v4(),
            source,
            http: Arc::new(http),
        }
    }

    pub async fn serve(app: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}
