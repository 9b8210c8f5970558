//! Canonical record store (Postgres + in-memory) and the shared HTTP fetcher.
//!
//! Everything that mutates sources, runs or postings goes through
//! [`RecordStore`]. Both backends keep the same guarantees: one posting per
//! dedup key, runs finalized exactly once, and a single reconciliation stamp
//! per successful run.

mod http;
mod memory;
mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    ListingDraft, NewSource, ObservationEffect, Posting, Run, RunFinalization, RunStatus, Source,
    SourceOutcome, UnknownVariant,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchRequest,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

pub const CRATE_NAME: &str = "harvest-storage";

/// Attempts for one posting upsert before a conflict is surfaced.
pub const MAX_UPSERT_ATTEMPTS: usize = 4;

/// Largest page any listing query will return.
pub const MAX_PAGE: i64 = 100;

/// Buckets kept for the category and city breakdowns in [`PostingStats`].
pub const STATS_TOP_N: usize = 20;

pub const ABANDONED_RUN_MESSAGE: &str = "run abandoned: still running past the stale-run limit";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },
    #[error("run {run_id} is already {status}")]
    RunNotRunning { run_id: Uuid, status: RunStatus },
    #[error("upsert of {dedup_key} still conflicting after {attempts} attempts")]
    Conflict { dedup_key: String, attempts: usize },
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl From<UnknownVariant> for StoreError {
    fn from(value: UnknownVariant) -> Self {
        StoreError::InvalidData(value.to_string())
    }
}

fn clamp_page(skip: i64, limit: i64) -> (usize, usize) {
    (skip.max(0) as usize, limit.clamp(0, MAX_PAGE) as usize)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    pub platform: Option<String>,
    pub active: Option<bool>,
    pub skip: i64,
    /// `None` returns every match; the scheduler scan relies on that.
    pub limit: Option<i64>,
}

impl SourceFilter {
    pub fn active_only() -> Self {
        Self {
            active: Some(true),
            ..Self::default()
        }
    }

    pub fn page(&self) -> (usize, Option<usize>) {
        match self.limit {
            Some(limit) => {
                let (skip, limit) = clamp_page(self.skip, limit);
                (skip, Some(limit))
            }
            None => (self.skip.max(0) as usize, None),
        }
    }

    pub fn matches(&self, source: &Source) -> bool {
        self.platform
            .as_deref()
            .map_or(true, |platform| source.platform == platform)
            && self.active.map_or(true, |active| source.active == active)
    }
}

/// Run listing filter, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    pub source_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub skip: i64,
    pub limit: i64,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            source_id: None,
            status: None,
            skip: 0,
            limit: 50,
        }
    }
}

impl RunFilter {
    pub fn for_source(source_id: Uuid, limit: i64) -> Self {
        Self {
            source_id: Some(source_id),
            limit,
            ..Self::default()
        }
    }

    pub fn page(&self) -> (usize, usize) {
        clamp_page(self.skip, self.limit)
    }

    pub fn matches(&self, run: &Run) -> bool {
        self.source_id.map_or(true, |id| run.source_id == id)
            && self.status.map_or(true, |status| run.status == status)
    }
}

/// Posting listing filter, most recently posted first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingFilter {
    pub source_id: Option<Uuid>,
    pub platform: Option<String>,
    /// Two-letter code, matched case-insensitively.
    pub state: Option<String>,
    /// Case-insensitive substring of the city.
    pub city: Option<String>,
    /// Case-insensitive substring of the title.
    pub search: Option<String>,
    pub active: Option<bool>,
    pub skip: i64,
    pub limit: i64,
}

impl Default for PostingFilter {
    fn default() -> Self {
        Self {
            source_id: None,
            platform: None,
            state: None,
            city: None,
            search: None,
            active: Some(true),
            skip: 0,
            limit: 50,
        }
    }
}

fn contains_ignore_case(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(&needle.to_lowercase()))
}

impl PostingFilter {
    pub fn page(&self) -> (usize, usize) {
        clamp_page(self.skip, self.limit)
    }

    pub fn matches(&self, posting: &Posting) -> bool {
        let listing = &posting.listing;
        self.source_id.map_or(true, |id| posting.source_id == id)
            && self
                .platform
                .as_deref()
                .map_or(true, |platform| posting.platform == platform)
            && self.state.as_deref().map_or(true, |state| {
                listing
                    .state
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(state))
            })
            && self
                .city
                .as_deref()
                .map_or(true, |city| contains_ignore_case(listing.city.as_deref(), city))
            && self
                .search
                .as_deref()
                .map_or(true, |term| contains_ignore_case(Some(&listing.title), term))
            && self.active.map_or(true, |active| posting.active == active)
    }
}

/// Aggregate counts over stored postings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PostingStats {
    /// Postings in scope (active only, unless asked for all).
    pub total: i64,
    /// Active postings, regardless of scope.
    pub active: i64,
    pub by_platform: BTreeMap<String, i64>,
    /// The [`STATS_TOP_N`] largest categories.
    pub by_category: BTreeMap<String, i64>,
    /// The [`STATS_TOP_N`] largest cities.
    pub by_city: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub posting_id: Uuid,
    pub effect: ObservationEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Demotion pass ran; number of postings marked inactive.
    Demoted(u64),
    /// The run did not succeed, nothing may be inferred from it.
    NotSuccessful(RunStatus),
    AlreadyReconciled,
}

impl ReconcileOutcome {
    /// Why `run` may not be reconciled, or `None` when it may.
    pub(crate) fn refusal(run: &Run) -> Option<Self> {
        if run.allows_reconciliation() {
            None
        } else if run.status != RunStatus::Success {
            Some(Self::NotSuccessful(run.status))
        } else {
            Some(Self::AlreadyReconciled)
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_source(&self, new: NewSource, now: DateTime<Utc>)
        -> Result<Source, StoreError>;

    async fn find_source_by_endpoint(
        &self,
        platform: &str,
        base_url: &str,
    ) -> Result<Option<Source>, StoreError>;

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, StoreError>;

    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<Source>, StoreError>;

    async fn set_source_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Source, StoreError>;

    /// Scheduling health after a finished cycle. Never changes `active`.
    async fn record_source_outcome(
        &self,
        id: Uuid,
        outcome: &SourceOutcome,
        at: DateTime<Utc>,
    ) -> Result<Source, StoreError>;

    async fn start_run(&self, source_id: Uuid, started_at: DateTime<Utc>)
        -> Result<Run, StoreError>;

    /// Writes the terminal state. Rejected with `RunNotRunning` unless the run
    /// is still `running`.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        finalization: &RunFinalization,
    ) -> Result<Run, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError>;

    /// Finalizes as `timeout` every run still `running` that started before `started_before`.
    async fn expire_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Run>, StoreError>;

    /// Atomic insert-or-merge keyed on the draft's dedup key. `draft` must be validated.
    async fn upsert_posting(
        &self,
        source: &Source,
        run_id: Uuid,
        draft: &ListingDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Demotes the source's postings not seen by a successful run and stamps
    /// `listings_removed`/`reconciled_at` in the same transaction.
    async fn reconcile_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError>;

    async fn get_posting_by_key(&self, dedup_key: &str) -> Result<Option<Posting>, StoreError>;

    async fn get_posting(&self, id: Uuid) -> Result<Option<Posting>, StoreError>;

    async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<Posting>, StoreError>;

    async fn posting_stats(&self, active_only: bool) -> Result<PostingStats, StoreError>;

    /// Cheap round trip used by the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
