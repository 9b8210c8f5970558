//! Core domain model for the posting harvester: sources, runs, postings and
//! the observation rules that keep one canonical row per listing.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Upper bound for error text persisted on runs and sources.
pub const MAX_ERROR_CHARS: usize = 2000;

/// Fields whose change invalidates a posting's geocode.
pub const LOCATION_FIELDS: [&str; 4] = ["location", "city", "state", "campus"];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Dedup key: hash of the canonical application URL.
pub fn dedup_key(canonical_url: &str) -> String {
    sha256_hex(canonical_url.as_bytes())
}

/// Hash over the mutable text of a listing, used to tell real edits from re-observation.
pub fn content_hash(title: &str, description: Option<&str>) -> String {
    sha256_hex(format!("{}|{}", title, description.unwrap_or_default()).as_bytes())
}

/// Trim, require an absolute http(s) URL and drop the fragment.
pub fn canonical_url(raw: &str) -> Result<String, DraftError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DraftError::MissingUrl);
    }
    let mut url = Url::parse(trimmed).map_err(|e| DraftError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DraftError::InvalidUrl {
            url: trimmed.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    url.set_fragment(None);
    Ok(url.to_string())
}

pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_CHARS {
        return message.to_string();
    }
    message.chars().take(MAX_ERROR_CHARS).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DraftError {
    #[error("listing has no title")]
    MissingTitle,
    #[error("listing has no application url")]
    MissingUrl,
    #[error("invalid application url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Canonical field set every adapter produces; the de facto ingestion schema.
///
/// Optional fields an adapter cannot derive stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ListingDraft {
    pub title: String,
    pub application_url: String,
    pub location: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub campus: Option<String>,
    pub category: Option<String>,
    pub raw_category: Option<String>,
    pub department: Option<String>,
    pub employment_type: Option<String>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_text: Option<String>,
    pub posting_date: Option<NaiveDate>,
    pub closing_date: Option<NaiveDate>,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub external_id: Option<String>,
    #[serde(default)]
    pub extra_data: JsonMap<String, JsonValue>,
}

impl ListingDraft {
    pub fn new(title: impl Into<String>, application_url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            application_url: application_url.into(),
            ..Default::default()
        }
    }

    /// Returns the draft with a trimmed title and canonical URL, or why it cannot be stored.
    pub fn validated(mut self) -> Result<Self, DraftError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(DraftError::MissingTitle);
        }
        self.title = title.to_string();
        self.application_url = canonical_url(&self.application_url)?;
        Ok(self)
    }

    pub fn dedup_key(&self) -> String {
        dedup_key(&self.application_url)
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.title, self.description.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown value {value:?} for {kind}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "timeout" => Ok(RunStatus::Timeout),
            other => Err(UnknownVariant {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// Geocoding state owned by the external geocoder; the ingestion core only resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Skipped,
}

impl GeocodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodeStatus::Pending => "pending",
            GeocodeStatus::Success => "success",
            GeocodeStatus::Failed => "failed",
            GeocodeStatus::Skipped => "skipped",
        }
    }

    /// Location input changed: the geocoder must look at this row again.
    pub fn mark_stale(self) -> Self {
        GeocodeStatus::Pending
    }
}

impl FromStr for GeocodeStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GeocodeStatus::Pending),
            "success" => Ok(GeocodeStatus::Success),
            "failed" => Ok(GeocodeStatus::Failed),
            "skipped" => Ok(GeocodeStatus::Skipped),
            other => Err(UnknownVariant {
                kind: "geocode status",
                value: other.to_string(),
            }),
        }
    }
}

/// Source definition as onboarded (seed file or operator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    pub platform: String,
    pub base_url: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_refresh_interval_minutes")]
    pub refresh_interval_minutes: i32,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    #[serde(default)]
    pub config: JsonMap<String, JsonValue>,
    #[serde(default = "default_discovered_by")]
    pub discovered_by: String,
}

fn default_true() -> bool {
    true
}

pub fn default_refresh_interval_minutes() -> i32 {
    360
}

fn default_discovered_by() -> String {
    "manual".to_string()
}

/// One configured upstream feed plus its scheduling health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub platform: String,
    pub base_url: String,
    pub slug: Option<String>,
    pub active: bool,
    pub refresh_interval_minutes: i32,
    pub config: JsonMap<String, JsonValue>,
    pub discovered_by: String,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_listing_count: i32,
    pub consecutive_failures: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn from_new(new: NewSource, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            platform: new.platform,
            base_url: new.base_url,
            slug: new.slug,
            active: new.active,
            refresh_interval_minutes: new.refresh_interval_minutes,
            config: new.config,
            discovered_by: new.discovered_by,
            last_attempted_at: None,
            last_success_at: None,
            last_listing_count: 0,
            consecutive_failures: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::minutes(i64::from(self.refresh_interval_minutes.max(0)))
    }

    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.last_attempted_at.map(|at| at + self.refresh_interval())
    }

    /// Never attempted, or the refresh interval has elapsed since the last attempt.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_due_at() {
            Some(due_at) => now >= due_at,
            None => true,
        }
    }

    /// Short label for logs, e.g. `applitrack/springisd`.
    pub fn label(&self) -> String {
        format!(
            "{}/{}",
            self.platform,
            self.slug.as_deref().unwrap_or(self.base_url.as_str())
        )
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(JsonValue::as_str)
    }

    /// Apply a finished cycle's outcome. Never touches `active`.
    pub fn record_outcome(&mut self, outcome: &SourceOutcome, at: DateTime<Utc>) {
        self.last_attempted_at = Some(at);
        self.updated_at = at;
        match outcome {
            SourceOutcome::Success { listing_count } => {
                self.last_success_at = Some(at);
                self.last_listing_count = *listing_count;
                self.consecutive_failures = 0;
                self.last_error = None;
            }
            SourceOutcome::Failure { error } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(truncate_error(error));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Success { listing_count: i32 },
    Failure { error: String },
}

/// One execution of the ingestion pipeline against one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub source_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub listings_found: i32,
    pub listings_new: i32,
    pub listings_updated: i32,
    pub listings_removed: i32,
    pub error_message: Option<String>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn start(source_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            listings_found: 0,
            listings_new: 0,
            listings_updated: 0,
            listings_removed: 0,
            error_message: None,
            reconciled_at: None,
        }
    }

    /// Only a confirmed-complete scan may be used to infer removals.
    pub fn allows_reconciliation(&self) -> bool {
        self.status == RunStatus::Success && self.reconciled_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub found: i32,
    pub new: i32,
    pub updated: i32,
}

/// Terminal state written exactly once onto a running run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub counts: RunCounts,
    pub error_message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl RunFinalization {
    pub fn success(counts: RunCounts, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Success,
            counts,
            error_message: None,
            finished_at,
        }
    }

    pub fn failure(
        status: RunStatus,
        counts: RunCounts,
        error: &str,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            counts,
            error_message: Some(truncate_error(error)),
            finished_at,
        }
    }

    pub fn apply_to(&self, run: &mut Run) {
        run.status = self.status;
        run.finished_at = Some(self.finished_at);
        run.listings_found = self.counts.found;
        run.listings_new = self.counts.new;
        run.listings_updated = self.counts.updated;
        run.error_message = self.error_message.clone();
    }
}

/// Canonical persisted listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: Uuid,
    pub source_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub dedup_key: String,
    pub content_hash: String,
    pub platform: String,
    pub listing: ListingDraft,
    pub geocode_status: GeocodeStatus,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub active: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_run_id: Option<Uuid>,
    pub removed_at: Option<DateTime<Utc>>,
    pub reactivation_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    /// First observation: a new row was inserted.
    Inserted,
    /// Re-observation with the same content hash (possibly with backfill).
    Unchanged,
    /// Re-observation with a different content hash.
    ContentChanged,
}

/// What a single observation did to the stored posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservationEffect {
    pub kind: UpsertKind,
    pub reactivated: bool,
    pub changed_fields: Vec<&'static str>,
    pub geocode_marked_stale: bool,
}

impl ObservationEffect {
    pub fn inserted() -> Self {
        Self {
            kind: UpsertKind::Inserted,
            reactivated: false,
            changed_fields: Vec::new(),
            geocode_marked_stale: false,
        }
    }
}

fn backfill_slot<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    if slot.is_none() && incoming.is_some() {
        *slot = incoming.clone();
        true
    } else {
        false
    }
}

fn overwrite_slot<T: Clone + PartialEq>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    match incoming {
        Some(value) if slot.as_ref() != Some(value) => {
            *slot = Some(value.clone());
            true
        }
        _ => false,
    }
}

macro_rules! merge_optional_fields {
    (@each $merge:ident, $dst:expr, $src:expr, $changed:ident; $($field:ident),+) => {
        $(
            if $merge(&mut $dst.$field, &$src.$field) {
                $changed.push(stringify!($field));
            }
        )+
    };
    ($merge:ident, $dst:expr, $src:expr, $changed:ident) => {
        merge_optional_fields!(@each $merge, $dst, $src, $changed;
            location, city, state, campus, category, raw_category, department,
            employment_type, salary_min, salary_max, salary_text, posting_date,
            closing_date, description, requirements, external_id)
    };
}

impl Posting {
    /// Row for a listing never seen before. `draft` must already be validated.
    pub fn first_observation(
        source: &Source,
        draft: ListingDraft,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source.id,
            organization_id: source.organization_id,
            dedup_key: draft.dedup_key(),
            content_hash: draft.content_hash(),
            platform: source.platform.clone(),
            listing: draft,
            geocode_status: GeocodeStatus::Pending,
            latitude: None,
            longitude: None,
            active: true,
            first_seen_at: now,
            last_seen_at: now,
            last_run_id: Some(run_id),
            removed_at: None,
            reactivation_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a re-observation into this row.
    ///
    /// Unchanged content only fills fields that are still null; changed content
    /// overwrites with every non-null incoming value. Any re-observation of an
    /// inactive row reactivates it.
    pub fn observe(
        &mut self,
        draft: &ListingDraft,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> ObservationEffect {
        // A null incoming description keeps the stored one, so compare against
        // the content this observation would leave behind.
        let incoming_hash = content_hash(
            &draft.title,
            draft
                .description
                .as_deref()
                .or(self.listing.description.as_deref()),
        );
        let mut changed_fields: Vec<&'static str> = Vec::new();

        let kind = if incoming_hash == self.content_hash {
            merge_optional_fields!(backfill_slot, self.listing, draft, changed_fields);
            let mut extra_added = false;
            for (key, value) in &draft.extra_data {
                if !self.listing.extra_data.contains_key(key) {
                    self.listing.extra_data.insert(key.clone(), value.clone());
                    extra_added = true;
                }
            }
            if extra_added {
                changed_fields.push("extra_data");
            }
            UpsertKind::Unchanged
        } else {
            if self.listing.title != draft.title {
                self.listing.title = draft.title.clone();
                changed_fields.push("title");
            }
            merge_optional_fields!(overwrite_slot, self.listing, draft, changed_fields);
            let mut extra_changed = false;
            for (key, value) in &draft.extra_data {
                if self.listing.extra_data.get(key) != Some(value) {
                    self.listing.extra_data.insert(key.clone(), value.clone());
                    extra_changed = true;
                }
            }
            if extra_changed {
                changed_fields.push("extra_data");
            }
            self.content_hash = self.listing.content_hash();
            UpsertKind::ContentChanged
        };

        let geocode_marked_stale = changed_fields
            .iter()
            .any(|field| LOCATION_FIELDS.contains(field));
        if geocode_marked_stale {
            self.geocode_status = self.geocode_status.mark_stale();
        }

        let reactivated = !self.active;
        if reactivated {
            self.active = true;
            self.removed_at = None;
            self.reactivation_count += 1;
        }

        self.last_seen_at = now;
        self.last_run_id = Some(run_id);
        if reactivated || !changed_fields.is_empty() || kind == UpsertKind::ContentChanged {
            self.updated_at = now;
        }

        ObservationEffect {
            kind,
            reactivated,
            changed_fields,
            geocode_marked_stale,
        }
    }

    /// Inferred removal: absent from a confirmed-complete run.
    pub fn demote(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.removed_at = Some(now);
        self.updated_at = now;
    }

    /// Demotion predicate for a successful run that started at `run_started_at`.
    pub fn is_unseen_by(&self, run_id: Uuid, run_started_at: DateTime<Utc>) -> bool {
        self.active && self.last_run_id != Some(run_id) && self.last_seen_at < run_started_at
    }
}

/// Time source, injectable so scheduling and lifecycle tests are deterministic.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
