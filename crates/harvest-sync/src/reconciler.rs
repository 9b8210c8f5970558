use std::sync::Arc;

use harvest_core::Clock;
use harvest_storage::{ReconcileOutcome, RecordStore, StoreError};
use tracing::{debug, info};
use uuid::Uuid;

/// Infers removals from a confirmed-complete run.
#[derive(Clone)]
pub struct LifecycleReconciler {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl LifecycleReconciler {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Demotes the source's active postings the run neither saw nor that were
    /// seen after it started. Non-successful or already reconciled runs are
    /// left alone.
    pub async fn reconcile(&self, run_id: Uuid) -> Result<ReconcileOutcome, StoreError> {
        let outcome = self.store.reconcile_run(run_id, self.clock.now()).await?;
        match outcome {
            ReconcileOutcome::Demoted(demoted) => {
                info!(%run_id, demoted, "reconciled run");
            }
            ReconcileOutcome::NotSuccessful(status) => {
                debug!(%run_id, %status, "run did not succeed; no removals inferred");
            }
            ReconcileOutcome::AlreadyReconciled => {
                debug!(%run_id, "run already reconciled");
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use harvest_core::{ListingDraft, RunCounts, RunFinalization, RunStatus};

    use super::*;
    use crate::testing::{t0, Harness};

    fn draft(url: &str) -> ListingDraft {
        ListingDraft::new("Counselor", url).validated().unwrap()
    }

    #[tokio::test]
    async fn postings_seen_after_the_run_started_survive() {
        let h = Harness::new();
        let source = h.add_source("https://jobs.example.org/feed", 60).await;
        let store = h.store.clone();

        let earlier = store.start_run(source.id, t0()).await.unwrap();
        store
            .upsert_posting(&source, earlier.id, &draft("https://jobs.example.org/old"), t0())
            .await
            .unwrap();

        let started = t0() + Duration::minutes(10);
        let run = store.start_run(source.id, started).await.unwrap();
        // A concurrent run observes this posting after `run` began.
        let concurrent = store.start_run(source.id, started).await.unwrap();
        store
            .upsert_posting(
                &source,
                concurrent.id,
                &draft("https://jobs.example.org/fresh"),
                started + Duration::seconds(5),
            )
            .await
            .unwrap();
        store
            .finalize_run(
                run.id,
                &RunFinalization::success(RunCounts::default(), started + Duration::minutes(1)),
            )
            .await
            .unwrap();

        let reconciler = LifecycleReconciler::new(store.clone(), h.clock.clone());
        assert_eq!(
            reconciler.reconcile(run.id).await.unwrap(),
            ReconcileOutcome::Demoted(1)
        );
        assert!(!h.posting("https://jobs.example.org/old").await.active);
        assert!(h.posting("https://jobs.example.org/fresh").await.active);

        assert_eq!(
            reconciler.reconcile(run.id).await.unwrap(),
            ReconcileOutcome::AlreadyReconciled
        );
        assert_eq!(store.get_run(run.id).await.unwrap().unwrap().listings_removed, 1);
    }

    #[tokio::test]
    async fn failed_runs_demote_nothing() {
        let h = Harness::new();
        let source = h.add_source("https://jobs.example.org/feed", 60).await;
        let store = h.store.clone();

        let first = store.start_run(source.id, t0()).await.unwrap();
        store
            .upsert_posting(&source, first.id, &draft("https://jobs.example.org/a"), t0())
            .await
            .unwrap();

        let failed = store
            .start_run(source.id, t0() + Duration::hours(1))
            .await
            .unwrap();
        store
            .finalize_run(
                failed.id,
                &RunFinalization::failure(
                    RunStatus::Failed,
                    RunCounts::default(),
                    "connection refused",
                    t0() + Duration::hours(1),
                ),
            )
            .await
            .unwrap();

        let reconciler = LifecycleReconciler::new(store.clone(), h.clock.clone());
        assert_eq!(
            reconciler.reconcile(failed.id).await.unwrap(),
            ReconcileOutcome::NotSuccessful(RunStatus::Failed)
        );
        assert!(h.posting("https://jobs.example.org/a").await.active);
    }
}
