use std::sync::Arc;
use std::time::Duration;

use harvest_adapters::{AdapterContext, AdapterError, AdapterRegistry, RawListing, SourceAdapter};
use harvest_core::{
    Clock, ListingDraft, ObservationEffect, Run, RunCounts, RunFinalization, Source, UpsertKind,
};
use harvest_storage::{HttpFetcher, ReconcileOutcome, RecordStore};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::reconciler::LifecycleReconciler;
use crate::IngestError;

/// Result of one successful ingestion cycle.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub run: Run,
    pub parse_failures: usize,
    pub reactivated: usize,
    /// `None` when reconciliation itself failed; the run stays unreconciled.
    pub reconcile: Option<ReconcileOutcome>,
}

#[derive(Debug, Default)]
struct Tally {
    counts: RunCounts,
    parse_failures: usize,
    store_failures: usize,
    reactivated: usize,
}

impl Tally {
    fn record(&mut self, effect: &ObservationEffect) {
        match effect.kind {
            UpsertKind::Inserted => self.counts.new += 1,
            UpsertKind::ContentChanged => self.counts.updated += 1,
            UpsertKind::Unchanged => {}
        }
        if effect.reactivated {
            self.reactivated += 1;
        }
    }
}

/// Fetch, normalize and upsert for one source, then reconcile on success.
pub struct IngestionPipeline {
    store: Arc<dyn RecordStore>,
    registry: Arc<AdapterRegistry>,
    http: Arc<HttpFetcher>,
    clock: Arc<dyn Clock>,
    reconciler: LifecycleReconciler,
    fetch_timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<AdapterRegistry>,
        http: Arc<HttpFetcher>,
        clock: Arc<dyn Clock>,
        fetch_timeout: Duration,
    ) -> Self {
        let reconciler = LifecycleReconciler::new(store.clone(), clock.clone());
        Self {
            store,
            registry,
            http,
            clock,
            reconciler,
            fetch_timeout,
        }
    }

    /// Runs one cycle. The run is always finalized before this returns, except
    /// when it was already expired by the dispatcher.
    pub async fn run_source(&self, source: &Source) -> Result<IngestReport, IngestError> {
        let run = self.store.start_run(source.id, self.clock.now()).await?;
        let span = info_span!(
            "ingest",
            source_id = %source.id,
            platform = %source.platform,
            run_id = %run.id
        );
        self.run_cycle(source, run).instrument(span).await
    }

    async fn run_cycle(&self, source: &Source, run: Run) -> Result<IngestReport, IngestError> {
        info!(source = %source.label(), "ingestion started");
        let mut tally = Tally::default();
        let collected = self.collect(source, &run, &mut tally).await;

        let finished_at = self.clock.now();
        let finalization = match &collected {
            Ok(()) => RunFinalization::success(tally.counts, finished_at),
            Err(err) => RunFinalization::failure(
                err.run_status(),
                tally.counts,
                &err.to_string(),
                finished_at,
            ),
        };
        if let Err(err) = &collected {
            warn!(error = %err, status = %finalization.status, "ingestion failed");
        }
        let finished = self.store.finalize_run(run.id, &finalization).await?;
        collected?;

        let reconcile = match self.reconciler.reconcile(finished.id).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(error = %err, "reconciliation failed; run left unreconciled");
                None
            }
        };
        let run = match self.store.get_run(finished.id).await {
            Ok(Some(run)) => run,
            _ => finished,
        };
        info!(
            found = run.listings_found,
            new = run.listings_new,
            updated = run.listings_updated,
            removed = run.listings_removed,
            parse_failures = tally.parse_failures,
            "ingestion finished"
        );
        Ok(IngestReport {
            run,
            parse_failures: tally.parse_failures,
            reactivated: tally.reactivated,
            reconcile,
        })
    }

    async fn collect(&self, source: &Source, run: &Run, tally: &mut Tally) -> Result<(), IngestError> {
        let adapter = self
            .registry
            .build(source)
            .ok_or_else(|| IngestError::UnknownPlatform {
                platform: source.platform.clone(),
            })?;
        let ctx = AdapterContext {
            run_id: run.id,
            source: source.clone(),
            http: self.http.clone(),
        };

        let raw = match tokio::time::timeout(self.fetch_timeout, adapter.fetch(&ctx)).await {
            Ok(fetched) => fetched?,
            Err(_) => {
                return Err(IngestError::FetchTimeout {
                    after: self.fetch_timeout,
                })
            }
        };
        tally.counts.found = i32::try_from(raw.len()).unwrap_or(i32::MAX);
        debug!(found = raw.len(), "fetched raw listings");

        for listing in &raw {
            let draft = match normalize(adapter.as_ref(), listing) {
                Ok(draft) => draft,
                Err(err) => {
                    tally.parse_failures += 1;
                    warn!(error = %err, "skipping unparseable listing");
                    continue;
                }
            };
            match self
                .store
                .upsert_posting(source, run.id, &draft, self.clock.now())
                .await
            {
                Ok(outcome) => {
                    if outcome.effect.reactivated {
                        info!(posting_id = %outcome.posting_id, "posting reactivated");
                    }
                    tally.record(&outcome.effect);
                }
                Err(err) => {
                    tally.store_failures += 1;
                    warn!(url = %draft.application_url, error = %err, "could not persist listing");
                }
            }
        }

        if tally.store_failures > 0 {
            return Err(IngestError::Persist {
                failed: tally.store_failures,
                found: raw.len(),
            });
        }
        Ok(())
    }
}

fn normalize(
    adapter: &dyn SourceAdapter,
    raw: &RawListing,
) -> Result<ListingDraft, AdapterError> {
    adapter
        .normalize(raw)?
        .validated()
        .map_err(|err| AdapterError::Parse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use harvest_core::{GeocodeStatus, RunStatus};
    use serde_json::json;

    use super::*;
    use crate::testing::{listing, FakeFeed, Harness};

    const FEED: &str = "https://district.example.org/jobs";
    const A: &str = "https://district.example.org/jobs/a";
    const B: &str = "https://district.example.org/jobs/b";

    #[tokio::test]
    async fn repeated_observations_keep_one_row() {
        let h = Harness::new();
        let source = h.add_source(FEED, 60).await;
        h.upstream.set(
            FEED,
            FakeFeed::Listings(vec![
                listing("Math Teacher", A),
                listing("Math Teacher", &format!("{A}#apply")),
            ]),
        );

        let first = h.pipeline.run_source(&source).await.unwrap();
        assert_eq!(first.run.status, RunStatus::Success);
        assert_eq!(first.run.listings_found, 2);
        assert_eq!(first.run.listings_new, 1);

        h.clock.advance(ChronoDuration::minutes(61));
        let second = h.pipeline.run_source(&source).await.unwrap();
        assert_eq!(second.run.listings_new, 0);
        assert_eq!(second.run.listings_updated, 0);
        assert_eq!(h.store.posting_count().await, 1);

        let posting = h.posting(A).await;
        assert_eq!(posting.last_run_id, Some(second.run.id));
        assert_eq!(posting.last_seen_at, h.clock.now());
        assert_eq!(posting.first_seen_at, first.run.started_at);
    }

    #[tokio::test]
    async fn changed_content_overwrites_without_clearing() {
        let h = Harness::new();
        let source = h.add_source(FEED, 60).await;
        let mut original = listing("Band Director", A);
        original["city"] = json!("Spring");
        original["description"] = json!("Lead the marching band.");
        h.upstream.set(FEED, FakeFeed::Listings(vec![original]));
        h.pipeline.run_source(&source).await.unwrap();
        let before = h.posting(A).await;

        let mut revised = listing("Band Director (Head)", A);
        revised["description"] = json!("Lead the marching and concert bands.");
        h.upstream.set(FEED, FakeFeed::Listings(vec![revised]));
        h.clock.advance(ChronoDuration::minutes(61));
        let report = h.pipeline.run_source(&source).await.unwrap();

        assert_eq!(report.run.listings_updated, 1);
        let after = h.posting(A).await;
        assert_ne!(after.content_hash, before.content_hash);
        assert_eq!(after.listing.title, "Band Director (Head)");
        assert_eq!(after.listing.city.as_deref(), Some("Spring"));
        assert_eq!(after.id, before.id);
    }

    #[tokio::test]
    async fn unchanged_content_only_backfills() {
        let h = Harness::new();
        let source = h.add_source(FEED, 60).await;
        h.upstream
            .set(FEED, FakeFeed::Listings(vec![listing("Campus Nurse", A)]));
        h.pipeline.run_source(&source).await.unwrap();
        h.store
            .edit_posting(&h.posting(A).await.dedup_key, |p| {
                p.geocode_status = GeocodeStatus::Success;
            })
            .await
            .unwrap();

        let mut richer = listing("Campus Nurse", A);
        richer["city"] = json!("Humble");
        h.upstream.set(FEED, FakeFeed::Listings(vec![richer]));
        h.clock.advance(ChronoDuration::minutes(61));
        let report = h.pipeline.run_source(&source).await.unwrap();
        assert_eq!(report.run.listings_updated, 0);
        let posting = h.posting(A).await;
        assert_eq!(posting.listing.city.as_deref(), Some("Humble"));
        assert_eq!(posting.geocode_status, GeocodeStatus::Pending);

        let mut conflicting = listing("Campus Nurse", A);
        conflicting["city"] = json!("Kingwood");
        h.upstream.set(FEED, FakeFeed::Listings(vec![conflicting]));
        h.clock.advance(ChronoDuration::minutes(61));
        h.pipeline.run_source(&source).await.unwrap();
        assert_eq!(h.posting(A).await.listing.city.as_deref(), Some("Humble"));
    }

    #[tokio::test]
    async fn unseen_postings_are_demoted_after_a_successful_run() {
        let h = Harness::new();
        let source = h.add_source(FEED, 60).await;
        h.upstream.set(
            FEED,
            FakeFeed::Listings(vec![listing("Librarian", A), listing("Registrar", B)]),
        );
        h.pipeline.run_source(&source).await.unwrap();

        h.upstream
            .set(FEED, FakeFeed::Listings(vec![listing("Librarian", A)]));
        h.clock.advance(ChronoDuration::minutes(61));
        let report = h.pipeline.run_source(&source).await.unwrap();

        assert_eq!(report.reconcile, Some(ReconcileOutcome::Demoted(1)));
        assert_eq!(report.run.listings_removed, 1);
        assert!(report.run.reconciled_at.is_some());
        let removed = h.posting(B).await;
        assert!(!removed.active);
        assert_eq!(removed.removed_at, Some(h.clock.now()));
        assert!(h.posting(A).await.active);
    }

    #[tokio::test]
    async fn failed_and_timed_out_runs_remove_nothing() {
        let h = Harness::new();
        let source = h.add_source(FEED, 60).await;
        h.upstream.set(
            FEED,
            FakeFeed::Listings(vec![listing("Librarian", A), listing("Registrar", B)]),
        );
        h.pipeline.run_source(&source).await.unwrap();

        h.upstream
            .set(FEED, FakeFeed::Fail("connection reset".into()));
        h.clock.advance(ChronoDuration::minutes(61));
        let err = h.pipeline.run_source(&source).await.unwrap_err();
        assert_eq!(err.run_status(), RunStatus::Failed);

        h.upstream.set(FEED, FakeFeed::Hang);
        h.clock.advance(ChronoDuration::minutes(61));
        let err = h.pipeline.run_source(&source).await.unwrap_err();
        assert!(matches!(err, IngestError::FetchTimeout { .. }));

        let runs = h.runs(source.id).await;
        let statuses: Vec<RunStatus> = runs.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![RunStatus::Timeout, RunStatus::Failed, RunStatus::Success]
        );
        assert!(runs[0].reconciled_at.is_none());
        assert_eq!(
            runs[1].error_message.as_deref(),
            Some("fetch failed: source unreachable: connection reset")
        );
        assert!(h.posting(A).await.active);
        assert!(h.posting(B).await.active);
    }

    #[tokio::test]
    async fn unparseable_listings_are_skipped_without_failing_the_run() {
        let h = Harness::new();
        let source = h.add_source(FEED, 60).await;
        h.upstream.set(
            FEED,
            FakeFeed::Listings(vec![
                listing("Librarian", A),
                listing("   ", B),
                listing("Registrar", "/jobs/relative"),
                json!({ "url": B }),
            ]),
        );

        let report = h.pipeline.run_source(&source).await.unwrap();
        assert_eq!(report.run.status, RunStatus::Success);
        assert_eq!(report.run.listings_found, 4);
        assert_eq!(report.run.listings_new, 1);
        assert_eq!(report.parse_failures, 3);
    }

    #[tokio::test]
    async fn reactivation_is_counted_once_per_return() {
        let h = Harness::new();
        let source = h.add_source(FEED, 60).await;
        h.upstream
            .set(FEED, FakeFeed::Listings(vec![listing("Librarian", A)]));
        h.pipeline.run_source(&source).await.unwrap();

        h.upstream.set(FEED, FakeFeed::Listings(Vec::new()));
        h.clock.advance(ChronoDuration::minutes(61));
        h.pipeline.run_source(&source).await.unwrap();
        assert!(!h.posting(A).await.active);

        h.upstream
            .set(FEED, FakeFeed::Listings(vec![listing("Librarian", A)]));
        h.clock.advance(ChronoDuration::minutes(61));
        let back = h.pipeline.run_source(&source).await.unwrap();
        assert_eq!(back.reactivated, 1);

        h.clock.advance(ChronoDuration::minutes(61));
        let again = h.pipeline.run_source(&source).await.unwrap();
        assert_eq!(again.reactivated, 0);

        let posting = h.posting(A).await;
        assert!(posting.active);
        assert!(posting.removed_at.is_none());
        assert_eq!(posting.reactivation_count, 1);
    }

    #[tokio::test]
    async fn unknown_platform_fails_only_that_run() {
        let h = Harness::new();
        let source = h.add_source_on("workday", FEED, 60).await;

        let err = h.pipeline.run_source(&source).await.unwrap_err();
        assert!(matches!(err, IngestError::UnknownPlatform { .. }));
        let runs = h.runs(source.id).await;
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(h.store.get_source(source.id).await.unwrap().unwrap().active);
    }
}
