use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use harvest_core::{Clock, Source, SourceOutcome};
use harvest_storage::{RecordStore, SourceFilter, StoreError, ABANDONED_RUN_MESSAGE};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pipeline::IngestionPipeline;
use crate::TriggerError;

/// Identifies one spawned ingestion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub source_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Active sources considered.
    pub scanned: usize,
    pub dispatched: Vec<TaskHandle>,
    /// Due, but a previous task for the source had not finished.
    pub skipped_in_flight: Vec<Uuid>,
    pub not_due: usize,
    pub expired_runs: usize,
}

type InFlight = Arc<Mutex<HashMap<Uuid, usize>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counts a running task against its source until dropped, panics included.
struct InFlightGuard {
    in_flight: InFlight,
    source_id: Uuid,
}

impl InFlightGuard {
    /// Periodic claim: refused while any task for the source is running.
    fn try_claim(in_flight: &InFlight, source_id: Uuid) -> Option<Self> {
        let mut tasks = lock(in_flight);
        if tasks.get(&source_id).is_some_and(|count| *count > 0) {
            return None;
        }
        tasks.insert(source_id, 1);
        Some(Self {
            in_flight: in_flight.clone(),
            source_id,
        })
    }

    fn force(in_flight: &InFlight, source_id: Uuid) -> Self {
        *lock(in_flight).entry(source_id).or_insert(0) += 1;
        Self {
            in_flight: in_flight.clone(),
            source_id,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut tasks = lock(&self.in_flight);
        if let Some(count) = tasks.get_mut(&self.source_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                tasks.remove(&self.source_id);
            }
        }
    }
}

/// Finds due sources and runs each in its own task.
pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    pipeline: Arc<IngestionPipeline>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
    in_flight: InFlight,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pipeline: Arc<IngestionPipeline>,
        clock: Arc<dyn Clock>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            clock,
            stale_after,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn in_flight_sources(&self) -> Vec<Uuid> {
        lock(&self.in_flight).keys().copied().collect()
    }

    /// One scan: expire abandoned runs, then spawn a task per due, idle source.
    /// Does not wait for the spawned tasks.
    pub async fn dispatch_due(&self) -> Result<DispatchReport, StoreError> {
        let now = self.clock.now();
        let mut report = DispatchReport::default();

        let expired = self
            .store
            .expire_stale_runs(now - self.stale_after, now)
            .await?;
        report.expired_runs = expired.len();
        for run in expired {
            warn!(
                run_id = %run.id,
                source_id = %run.source_id,
                started_at = %run.started_at,
                "expired abandoned run"
            );
            // The worker may have reported a failure already (finalize
            // itself failed); count the run once.
            match self.store.get_source(run.source_id).await {
                Ok(Some(source))
                    if source
                        .last_attempted_at
                        .is_some_and(|at| at >= run.started_at) =>
                {
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(source_id = %run.source_id, error = %err, "could not load source of expired run");
                    continue;
                }
            }
            let outcome = SourceOutcome::Failure {
                error: ABANDONED_RUN_MESSAGE.to_string(),
            };
            if let Err(err) = self
                .store
                .record_source_outcome(run.source_id, &outcome, now)
                .await
            {
                warn!(source_id = %run.source_id, error = %err, "could not record expiry on source");
            }
        }

        let sources = self.store.list_sources(&SourceFilter::active_only()).await?;
        report.scanned = sources.len();
        for source in sources {
            if !source.is_due(now) {
                report.not_due += 1;
                continue;
            }
            match InFlightGuard::try_claim(&self.in_flight, source.id) {
                Some(guard) => report.dispatched.push(self.spawn(source, guard)),
                None => {
                    info!(source = %source.label(), "previous task still running; skipped");
                    report.skipped_in_flight.push(source.id);
                }
            }
        }
        Ok(report)
    }

    /// Operator-requested run: skips the due check and the in-flight guard,
    /// but never runs an inactive source.
    pub async fn trigger(&self, source_id: Uuid) -> Result<TaskHandle, TriggerError> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or(TriggerError::NotFound(source_id))?;
        if !source.active {
            return Err(TriggerError::Inactive(source_id));
        }
        let guard = InFlightGuard::force(&self.in_flight, source.id);
        let handle = self.spawn(source, guard);
        info!(task_id = %handle.task_id, source_id = %source_id, "manual scrape queued");
        Ok(handle)
    }

    /// Waits for every task spawned so far, including ones spawned while waiting.
    pub async fn drain(&self) {
        loop {
            let pending = std::mem::take(&mut *lock(&self.tasks));
            if pending.is_empty() {
                return;
            }
            for task in pending {
                if let Err(err) = task.await {
                    error!(error = %err, "ingestion task panicked");
                }
            }
        }
    }

    fn spawn(&self, source: Source, guard: InFlightGuard) -> TaskHandle {
        let handle = TaskHandle {
            task_id: Uuid::new_v4(),
            source_id: source.id,
        };
        let store = self.store.clone();
        let pipeline = self.pipeline.clone();
        let clock = self.clock.clone();
        let span = info_span!(
            "source_task",
            task_id = %handle.task_id,
            source_id = %source.id,
            platform = %source.platform
        );

        let task = tokio::spawn(
            async move {
                let _guard = guard;
                let outcome = match pipeline.run_source(&source).await {
                    Ok(report) => Some(SourceOutcome::Success {
                        listing_count: report.run.listings_found,
                    }),
                    Err(err) if err.run_was_expired() => {
                        warn!(error = %err, "run was expired before it finished");
                        None
                    }
                    Err(err) => Some(SourceOutcome::Failure {
                        error: err.to_string(),
                    }),
                };
                if let Some(outcome) = outcome {
                    if let Err(err) = store
                        .record_source_outcome(source.id, &outcome, clock.now())
                        .await
                    {
                        error!(error = %err, "could not record source outcome");
                    }
                }
            }
            .instrument(span),
        );

        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
        handle
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use harvest_core::RunStatus;

    use super::*;
    use crate::testing::{listing, t0, FakeFeed, Harness};

    const X: &str = "https://broken.example.org/jobs";
    const Y: &str = "https://healthy.example.org/jobs";

    #[tokio::test]
    async fn failing_source_does_not_affect_its_neighbour() {
        let h = Harness::new();
        let x = h.add_source(X, 60).await;
        let y = h.add_source(Y, 60).await;
        h.upstream.set(X, FakeFeed::Fail("503 from upstream".into()));
        h.upstream.set(
            Y,
            FakeFeed::Listings(vec![listing("Teacher Aide", &format!("{Y}/1"))]),
        );

        for cycle in 1..=3 {
            let report = h.dispatcher.dispatch_due().await.unwrap();
            assert_eq!(report.dispatched.len(), 2);
            h.dispatcher.drain().await;

            let x_now = h.source(x.id).await;
            assert!(x_now.active);
            assert_eq!(x_now.consecutive_failures, cycle);
            assert!(x_now.last_error.as_deref().unwrap().contains("503 from upstream"));
            assert!(x_now.last_success_at.is_none());

            let y_now = h.source(y.id).await;
            assert_eq!(y_now.consecutive_failures, 0);
            assert_eq!(y_now.last_success_at, Some(h.clock.now()));
            assert_eq!(y_now.last_listing_count, 1);
            assert!(h.posting(&format!("{Y}/1")).await.active);

            h.clock.advance(Duration::minutes(61));
        }
    }

    #[tokio::test]
    async fn four_cycle_lifecycle() {
        let h = Harness::new();
        let source = h.add_source(X, 60).await;
        let a = format!("{X}/a");
        let b = format!("{X}/b");

        fn with_body(title: &str, url: &str, body: &str) -> serde_json::Value {
            let mut item = listing(title, url);
            item["description"] = serde_json::json!(body);
            item
        }
        let a1 = with_body("Counselor", &a, "hash one");
        let b2 = with_body("Registrar", &b, "hash two");
        let b3 = with_body("Registrar", &b, "hash three");

        // Cycle 1: never attempted, so due.
        h.upstream.set(X, FakeFeed::Listings(vec![a1.clone(), b2]));
        let report = h.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.dispatched.len(), 1);
        h.dispatcher.drain().await;
        let runs = h.runs(source.id).await;
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].listings_new, 2);

        // Cycle 2: 30 minutes later, not due.
        h.clock.advance(Duration::minutes(30));
        let report = h.dispatcher.dispatch_due().await.unwrap();
        assert!(report.dispatched.is_empty());
        assert_eq!(report.not_due, 1);
        assert_eq!(h.runs(source.id).await.len(), 1);

        // Cycle 3: due again; B is gone upstream.
        h.clock.set(t0() + Duration::minutes(61));
        h.upstream.set(X, FakeFeed::Listings(vec![a1.clone()]));
        h.dispatcher.dispatch_due().await.unwrap();
        h.dispatcher.drain().await;
        let run3 = h.runs(source.id).await.remove(0);
        assert_eq!(run3.status, RunStatus::Success);
        assert_eq!(run3.listings_removed, 1);
        let posting_a = h.posting(&a).await;
        assert_eq!(posting_a.last_run_id, Some(run3.id));
        assert_eq!(posting_a.last_seen_at, h.clock.now());
        let posting_b = h.posting(&b).await;
        assert!(!posting_b.active);
        assert!(posting_b.removed_at.is_some());

        // Cycle 4: B returns with new content.
        h.clock.set(t0() + Duration::minutes(122));
        h.upstream.set(X, FakeFeed::Listings(vec![a1, b3]));
        h.dispatcher.dispatch_due().await.unwrap();
        h.dispatcher.drain().await;
        let run4 = h.runs(source.id).await.remove(0);
        assert_eq!(run4.listings_updated, 1);
        assert_eq!(run4.listings_removed, 0);
        let posting_b = h.posting(&b).await;
        assert!(posting_b.active);
        assert!(posting_b.removed_at.is_none());
        assert_eq!(posting_b.reactivation_count, 1);
        assert_eq!(posting_b.listing.description.as_deref(), Some("hash three"));
    }

    #[tokio::test]
    async fn trigger_refuses_unknown_and_inactive_sources() {
        let h = Harness::new();
        let source = h.add_source(Y, 60).await;

        let missing = Uuid::new_v4();
        assert!(matches!(
            h.dispatcher.trigger(missing).await,
            Err(TriggerError::NotFound(id)) if id == missing
        ));

        h.store
            .set_source_active(source.id, false, h.clock.now())
            .await
            .unwrap();
        assert!(matches!(
            h.dispatcher.trigger(source.id).await,
            Err(TriggerError::Inactive(_))
        ));
        h.dispatcher.drain().await;
        assert!(h.runs(source.id).await.is_empty());
    }

    #[tokio::test]
    async fn trigger_ignores_the_refresh_interval() {
        let h = Harness::new();
        let source = h.add_source(Y, 60).await;
        h.upstream.set(
            Y,
            FakeFeed::Listings(vec![listing("Teacher Aide", &format!("{Y}/1"))]),
        );
        h.dispatcher.dispatch_due().await.unwrap();
        h.dispatcher.drain().await;
        assert!(!h.source(source.id).await.is_due(h.clock.now()));

        let handle = h.dispatcher.trigger(source.id).await.unwrap();
        assert_eq!(handle.source_id, source.id);
        h.dispatcher.drain().await;
        assert_eq!(h.runs(source.id).await.len(), 2);
    }

    #[tokio::test]
    async fn busy_source_is_not_dispatched_twice() {
        let h = Harness::new();
        let source = h.add_source(X, 60).await;
        h.upstream.set(X, FakeFeed::Hang);

        let first = h.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(first.dispatched.len(), 1);
        let second = h.dispatcher.dispatch_due().await.unwrap();
        assert!(second.dispatched.is_empty());
        assert_eq!(second.skipped_in_flight, vec![source.id]);
        assert_eq!(h.dispatcher.in_flight_sources(), vec![source.id]);

        h.dispatcher.drain().await;
        assert!(h.dispatcher.in_flight_sources().is_empty());
        let runs = h.runs(source.id).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Timeout);
        assert_eq!(h.source(source.id).await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn abandoned_runs_are_expired_on_the_next_scan() {
        let h = Harness::new();
        let source = h.add_source(X, 60).await;
        let abandoned = h.store.start_run(source.id, h.clock.now()).await.unwrap();

        h.clock.advance(Duration::minutes(11));
        let report = h.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.expired_runs, 1);
        // Expiry counts as an attempt, so the source is not due right away.
        assert!(report.dispatched.is_empty());

        let run = h.store.get_run(abandoned.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Timeout);
        let source = h.source(source.id).await;
        assert_eq!(source.consecutive_failures, 1);
        assert_eq!(source.last_error.as_deref(), Some(ABANDONED_RUN_MESSAGE));
    }

    #[tokio::test]
    async fn expiry_does_not_count_a_failure_the_worker_already_reported() {
        let h = Harness::new();
        let source = h.add_source(X, 60).await;
        // Worker whose finalize failed: run left open, failure already recorded.
        let stuck = h.store.start_run(source.id, h.clock.now()).await.unwrap();
        h.clock.advance(Duration::minutes(1));
        h.store
            .record_source_outcome(
                source.id,
                &SourceOutcome::Failure {
                    error: "finalize failed: connection reset".into(),
                },
                h.clock.now(),
            )
            .await
            .unwrap();

        h.clock.advance(Duration::minutes(10));
        let report = h.dispatcher.dispatch_due().await.unwrap();
        assert_eq!(report.expired_runs, 1);

        let run = h.store.get_run(stuck.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Timeout);
        let source = h.source(source.id).await;
        assert_eq!(source.consecutive_failures, 1);
        assert_eq!(
            source.last_error.as_deref(),
            Some("finalize failed: connection reset")
        );
    }
}
