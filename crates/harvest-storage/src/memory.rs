use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    ListingDraft, NewSource, ObservationEffect, Posting, Run, RunFinalization, RunStatus, Source,
    SourceOutcome,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    PostingFilter, PostingStats, ReconcileOutcome, RecordStore, RunFilter, SourceFilter,
    StoreError, UpsertOutcome, ABANDONED_RUN_MESSAGE, STATS_TOP_N,
};

/// In-process backend for tests and `--ephemeral` runs.
///
/// All state sits behind one mutex, so every upsert is a read-merge-write with
/// no interleaving and the dedup index can never hold two rows for a key.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: Vec<Source>,
    runs: Vec<Run>,
    postings: HashMap<Uuid, Posting>,
    by_dedup_key: HashMap<String, Uuid>,
}

impl MemoryState {
    fn source_mut(&mut self, id: Uuid) -> Result<&mut Source, StoreError> {
        self.sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::NotFound { kind: "source", id })
    }

    fn run_mut(&mut self, id: Uuid) -> Result<&mut Run, StoreError> {
        self.runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound { kind: "run", id })
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn posting_count(&self) -> usize {
        self.state.lock().await.postings.len()
    }

    /// Direct row edit, standing in for an external collaborator (geocoder, normalizer).
    pub async fn edit_posting<F>(&self, dedup_key: &str, edit: F) -> Result<Posting, StoreError>
    where
        F: FnOnce(&mut Posting) + Send,
    {
        let mut state = self.state.lock().await;
        let id = state
            .by_dedup_key
            .get(dedup_key)
            .copied()
            .ok_or_else(|| StoreError::InvalidData(format!("no posting for key {dedup_key}")))?;
        let posting = state
            .postings
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "posting", id })?;
        edit(posting);
        Ok(posting.clone())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert_source(
        &self,
        new: NewSource,
        now: DateTime<Utc>,
    ) -> Result<Source, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .sources
            .iter()
            .any(|s| s.platform == new.platform && s.base_url == new.base_url)
        {
            return Err(StoreError::InvalidData(format!(
                "source {}/{} already exists",
                new.platform, new.base_url
            )));
        }
        let source = Source::from_new(new, now);
        state.sources.push(source.clone());
        Ok(source)
    }

    async fn find_source_by_endpoint(
        &self,
        platform: &str,
        base_url: &str,
    ) -> Result<Option<Source>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sources
            .iter()
            .find(|s| s.platform == platform && s.base_url == base_url)
            .cloned())
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.sources.iter().find(|s| s.id == id).cloned())
    }

    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<Source>, StoreError> {
        let state = self.state.lock().await;
        let (skip, limit) = filter.page();
        let matching = state.sources.iter().filter(|s| filter.matches(s)).skip(skip);
        Ok(match limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }

    async fn set_source_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Source, StoreError> {
        let mut state = self.state.lock().await;
        let source = state.source_mut(id)?;
        source.active = active;
        source.updated_at = now;
        Ok(source.clone())
    }

    async fn record_source_outcome(
        &self,
        id: Uuid,
        outcome: &SourceOutcome,
        at: DateTime<Utc>,
    ) -> Result<Source, StoreError> {
        let mut state = self.state.lock().await;
        let source = state.source_mut(id)?;
        source.record_outcome(outcome, at);
        Ok(source.clone())
    }

    async fn start_run(
        &self,
        source_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Run, StoreError> {
        let mut state = self.state.lock().await;
        state.source_mut(source_id)?;
        let run = Run::start(source_id, started_at);
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn finalize_run(
        &self,
        run_id: Uuid,
        finalization: &RunFinalization,
    ) -> Result<Run, StoreError> {
        if !finalization.status.is_terminal() {
            return Err(StoreError::InvalidData(format!(
                "cannot finalize run {run_id} as {}",
                finalization.status
            )));
        }
        let mut state = self.state.lock().await;
        let run = state.run_mut(run_id)?;
        if run.status != RunStatus::Running {
            return Err(StoreError::RunNotRunning {
                run_id,
                status: run.status,
            });
        }
        finalization.apply_to(run);
        Ok(run.clone())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<Run> = state
            .runs
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let (skip, limit) = filter.page();
        Ok(runs.into_iter().skip(skip).take(limit).collect())
    }

    async fn expire_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Run>, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = Vec::new();
        for run in state
            .runs
            .iter_mut()
            .filter(|r| r.status == RunStatus::Running && r.started_at < started_before)
        {
            run.status = RunStatus::Timeout;
            run.finished_at = Some(now);
            run.error_message = Some(ABANDONED_RUN_MESSAGE.to_string());
            expired.push(run.clone());
        }
        Ok(expired)
    }

    async fn upsert_posting(
        &self,
        source: &Source,
        run_id: Uuid,
        draft: &ListingDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let dedup_key = draft.dedup_key();

        if let Some(id) = state.by_dedup_key.get(&dedup_key).copied() {
            let posting = state
                .postings
                .get_mut(&id)
                .ok_or(StoreError::NotFound { kind: "posting", id })?;
            let effect = posting.observe(draft, run_id, now);
            return Ok(UpsertOutcome {
                posting_id: id,
                effect,
            });
        }

        if !state.sources.iter().any(|s| s.id == source.id) {
            return Err(StoreError::NotFound {
                kind: "source",
                id: source.id,
            });
        }
        let posting = Posting::first_observation(source, draft.clone(), run_id, now);
        let posting_id = posting.id;
        state.by_dedup_key.insert(dedup_key, posting_id);
        state.postings.insert(posting_id, posting);
        Ok(UpsertOutcome {
            posting_id,
            effect: ObservationEffect::inserted(),
        })
    }

    async fn reconcile_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(run_id)?;
        if let Some(refusal) = ReconcileOutcome::refusal(run) {
            return Ok(refusal);
        }
        let (source_id, started_at) = (run.source_id, run.started_at);

        let mut demoted: u64 = 0;
        for posting in state
            .postings
            .values_mut()
            .filter(|p| p.source_id == source_id && p.is_unseen_by(run_id, started_at))
        {
            posting.demote(now);
            demoted += 1;
        }

        let run = state.run_mut(run_id)?;
        run.listings_removed = i32::try_from(demoted).unwrap_or(i32::MAX);
        run.reconciled_at = Some(now);
        Ok(ReconcileOutcome::Demoted(demoted))
    }

    async fn get_posting_by_key(&self, dedup_key: &str) -> Result<Option<Posting>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .by_dedup_key
            .get(dedup_key)
            .and_then(|id| state.postings.get(id))
            .cloned())
    }

    async fn get_posting(&self, id: Uuid) -> Result<Option<Posting>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.postings.get(&id).cloned())
    }

    async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<Posting>, StoreError> {
        let state = self.state.lock().await;
        let mut postings: Vec<Posting> = state
            .postings
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        // Newest posting date first, undated last.
        postings.sort_by(|a, b| {
            b.listing
                .posting_date
                .is_some()
                .cmp(&a.listing.posting_date.is_some())
                .then_with(|| b.listing.posting_date.cmp(&a.listing.posting_date))
                .then_with(|| b.first_seen_at.cmp(&a.first_seen_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let (skip, limit) = filter.page();
        Ok(postings.into_iter().skip(skip).take(limit).collect())
    }

    async fn posting_stats(&self, active_only: bool) -> Result<PostingStats, StoreError> {
        let state = self.state.lock().await;
        let in_scope: Vec<&Posting> = state
            .postings
            .values()
            .filter(|p| !active_only || p.active)
            .collect();
        Ok(PostingStats {
            total: in_scope.len() as i64,
            active: state.postings.values().filter(|p| p.active).count() as i64,
            by_platform: count_by(&in_scope, |p| Some(p.platform.as_str()), None),
            by_category: count_by(&in_scope, |p| p.listing.category.as_deref(), Some(STATS_TOP_N)),
            by_city: count_by(&in_scope, |p| p.listing.city.as_deref(), Some(STATS_TOP_N)),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn count_by<'a, F>(postings: &[&'a Posting], key: F, top: Option<usize>) -> BTreeMap<String, i64>
where
    F: Fn(&'a Posting) -> Option<&'a str>,
{
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for posting in postings {
        if let Some(key) = key(*posting) {
            *counts.entry(key).or_default() += 1;
        }
    }
    let mut ranked: Vec<(&str, i64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(top.unwrap_or(usize::MAX))
        .map(|(key, count)| (key.to_string(), count))
        .collect()
}
