use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    GeocodeStatus, ListingDraft, NewSource, ObservationEffect, Posting, Run, RunFinalization,
    RunStatus, Source, SourceOutcome,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    BackoffPolicy, PostingFilter, PostingStats, ReconcileOutcome, RecordStore, RunFilter,
    SourceFilter, StoreError, UpsertOutcome, ABANDONED_RUN_MESSAGE, MAX_UPSERT_ATTEMPTS,
    STATS_TOP_N,
};

const SOURCE_COLUMNS: &str = "id, organization_id, platform, base_url, slug, active, \
    refresh_interval_minutes, config, discovered_by, last_attempted_at, last_success_at, \
    last_listing_count, consecutive_failures, last_error, created_at, updated_at";

const RUN_COLUMNS: &str = "id, source_id, started_at, finished_at, status, listings_found, \
    listings_new, listings_updated, listings_removed, error_message, reconciled_at";

const POSTING_COLUMNS: &str = "id, source_id, organization_id, dedup_key, content_hash, platform, \
    title, application_url, location, city, state, campus, category, raw_category, department, \
    employment_type, salary_min, salary_max, salary_text, posting_date, closing_date, description, \
    requirements, external_id, extra_data, geocode_status, latitude, longitude, active, \
    first_seen_at, last_seen_at, last_run_id, removed_at, reactivation_count, created_at, updated_at";

/// Postgres backend. Same-key upserts serialize on the `dedup_key` unique
/// constraint plus a row lock; conflicts are retried here and never reach callers
/// unless every attempt fails.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    conflict_backoff: BackoffPolicy,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            conflict_backoff: BackoffPolicy {
                max_retries: MAX_UPSERT_ATTEMPTS - 1,
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(200),
            },
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Posting counts grouped by `column`, largest first. `column` is always a
    /// fixed column name, never caller input.
    async fn count_by(
        &self,
        column: &'static str,
        active_only: bool,
        top: Option<usize>,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {column} AS key, count(*) AS n FROM postings \
             WHERE {column} IS NOT NULL AND (active OR NOT $1) \
             GROUP BY {column} ORDER BY n DESC, key LIMIT $2"
        ))
        .bind(active_only)
        .bind(top.map(|top| top as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(String, i64), StoreError> {
                Ok((row.try_get("key")?, row.try_get("n")?))
            })
            .collect()
    }

    async fn upsert_once(
        &self,
        source: &Source,
        run_id: Uuid,
        draft: &ListingDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let candidate = Posting::first_observation(source, draft.clone(), run_id, now);

        let insert = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO postings (id, source_id, organization_id, dedup_key, content_hash, platform, \
             title, application_url, location, city, state, campus, category, raw_category, \
             department, employment_type, salary_min, salary_max, salary_text, posting_date, \
             closing_date, description, requirements, external_id, extra_data, \
             geocode_status, active, first_seen_at, last_seen_at, last_run_id, reactivation_count, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32, $33) \
             ON CONFLICT (dedup_key) DO NOTHING \
             RETURNING id",
        )
        .bind(candidate.id)
        .bind(candidate.source_id)
        .bind(candidate.organization_id)
        .bind(&candidate.dedup_key)
        .bind(&candidate.content_hash)
        .bind(&candidate.platform);
        let inserted = bind_listing_scalar(insert, &candidate.listing)
            .bind(candidate.geocode_status.as_str())
            .bind(candidate.active)
            .bind(candidate.first_seen_at)
            .bind(candidate.last_seen_at)
            .bind(candidate.last_run_id)
            .bind(candidate.reactivation_count)
            .bind(candidate.created_at)
            .bind(candidate.updated_at)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(posting_id) = inserted {
            tx.commit().await?;
            return Ok(UpsertOutcome {
                posting_id,
                effect: ObservationEffect::inserted(),
            });
        }

        let row = sqlx::query(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE dedup_key = $1 FOR UPDATE"
        ))
        .bind(&candidate.dedup_key)
        .fetch_one(&mut *tx)
        .await?;
        let mut posting = posting_from_row(&row)?;
        let effect = posting.observe(draft, run_id, now);

        let update = sqlx::query(
            "UPDATE postings SET title = $2, application_url = $3, location = $4, city = $5, \
             state = $6, campus = $7, category = $8, raw_category = $9, department = $10, \
             employment_type = $11, salary_min = $12, salary_max = $13, salary_text = $14, \
             posting_date = $15, closing_date = $16, description = $17, requirements = $18, \
             external_id = $19, extra_data = $20, content_hash = $21, active = $22, \
             removed_at = $23, reactivation_count = $24, last_seen_at = $25, last_run_id = $26, \
             updated_at = $27, \
             geocode_status = CASE WHEN $28 THEN 'pending' ELSE geocode_status END \
             WHERE id = $1",
        )
        .bind(posting.id);
        bind_listing(update, &posting.listing)
            .bind(&posting.content_hash)
            .bind(posting.active)
            .bind(posting.removed_at)
            .bind(posting.reactivation_count)
            .bind(posting.last_seen_at)
            .bind(posting.last_run_id)
            .bind(posting.updated_at)
            .bind(effect.geocode_marked_stale)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(UpsertOutcome {
            posting_id: posting.id,
            effect,
        })
    }
}

macro_rules! bind_listing_fields {
    ($query:expr, $listing:expr) => {
        $query
            .bind($listing.title.clone())
            .bind($listing.application_url.clone())
            .bind($listing.location.clone())
            .bind($listing.city.clone())
            .bind($listing.state.clone())
            .bind($listing.campus.clone())
            .bind($listing.category.clone())
            .bind($listing.raw_category.clone())
            .bind($listing.department.clone())
            .bind($listing.employment_type.clone())
            .bind($listing.salary_min)
            .bind($listing.salary_max)
            .bind($listing.salary_text.clone())
            .bind($listing.posting_date)
            .bind($listing.closing_date)
            .bind($listing.description.clone())
            .bind($listing.requirements.clone())
            .bind($listing.external_id.clone())
            .bind(Json($listing.extra_data.clone()))
    };
}

fn bind_listing<'q>(
    query: Query<'q, Postgres, PgArguments>,
    listing: &ListingDraft,
) -> Query<'q, Postgres, PgArguments> {
    bind_listing_fields!(query, listing)
}

fn bind_listing_scalar<'q>(
    query: sqlx::query::QueryScalar<'q, Postgres, Uuid, PgArguments>,
    listing: &ListingDraft,
) -> sqlx::query::QueryScalar<'q, Postgres, Uuid, PgArguments> {
    bind_listing_fields!(query, listing)
}

/// Serialization failure, deadlock, or a unique violation racing the insert.
fn is_retryable_conflict(err: &StoreError) -> bool {
    match err {
        StoreError::Database(sqlx::Error::Database(db)) => {
            matches!(db.code().as_deref(), Some("40001" | "40P01" | "23505"))
        }
        _ => false,
    }
}

fn source_from_row(row: &PgRow) -> Result<Source, StoreError> {
    let config: Json<JsonMap<String, JsonValue>> = row.try_get("config")?;
    Ok(Source {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        platform: row.try_get("platform")?,
        base_url: row.try_get("base_url")?,
        slug: row.try_get("slug")?,
        active: row.try_get("active")?,
        refresh_interval_minutes: row.try_get("refresh_interval_minutes")?,
        config: config.0,
        discovered_by: row.try_get("discovered_by")?,
        last_attempted_at: row.try_get("last_attempted_at")?,
        last_success_at: row.try_get("last_success_at")?,
        last_listing_count: row.try_get("last_listing_count")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: status.parse()?,
        listings_found: row.try_get("listings_found")?,
        listings_new: row.try_get("listings_new")?,
        listings_updated: row.try_get("listings_updated")?,
        listings_removed: row.try_get("listings_removed")?,
        error_message: row.try_get("error_message")?,
        reconciled_at: row.try_get("reconciled_at")?,
    })
}

fn posting_from_row(row: &PgRow) -> Result<Posting, StoreError> {
    let extra_data: Json<JsonMap<String, JsonValue>> = row.try_get("extra_data")?;
    let geocode_status: String = row.try_get("geocode_status")?;
    let listing = ListingDraft {
        title: row.try_get("title")?,
        application_url: row.try_get("application_url")?,
        location: row.try_get("location")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        campus: row.try_get("campus")?,
        category: row.try_get("category")?,
        raw_category: row.try_get("raw_category")?,
        department: row.try_get("department")?,
        employment_type: row.try_get("employment_type")?,
        salary_min: row.try_get("salary_min")?,
        salary_max: row.try_get("salary_max")?,
        salary_text: row.try_get("salary_text")?,
        posting_date: row.try_get("posting_date")?,
        closing_date: row.try_get("closing_date")?,
        description: row.try_get("description")?,
        requirements: row.try_get("requirements")?,
        external_id: row.try_get("external_id")?,
        extra_data: extra_data.0,
    };
    Ok(Posting {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        organization_id: row.try_get("organization_id")?,
        dedup_key: row.try_get("dedup_key")?,
        content_hash: row.try_get("content_hash")?,
        platform: row.try_get("platform")?,
        listing,
        geocode_status: geocode_status.parse::<GeocodeStatus>()?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        active: row.try_get("active")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        last_run_id: row.try_get("last_run_id")?,
        removed_at: row.try_get("removed_at")?,
        reactivation_count: row.try_get("reactivation_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert_source(
        &self,
        new: NewSource,
        now: DateTime<Utc>,
    ) -> Result<Source, StoreError> {
        let source = Source::from_new(new, now);
        let row = sqlx::query(&format!(
            "INSERT INTO sources (id, organization_id, platform, base_url, slug, active, \
             refresh_interval_minutes, config, discovered_by, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) \
             RETURNING {SOURCE_COLUMNS}"
        ))
        .bind(source.id)
        .bind(source.organization_id)
        .bind(&source.platform)
        .bind(&source.base_url)
        .bind(&source.slug)
        .bind(source.active)
        .bind(source.refresh_interval_minutes)
        .bind(Json(&source.config))
        .bind(&source.discovered_by)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        source_from_row(&row)
    }

    async fn find_source_by_endpoint(
        &self,
        platform: &str,
        base_url: &str,
    ) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE platform = $1 AND base_url = $2"
        ))
        .bind(platform)
        .bind(base_url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self, filter: &SourceFilter) -> Result<Vec<Source>, StoreError> {
        let (skip, limit) = filter.page();
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources \
             WHERE ($1::text IS NULL OR platform = $1) AND ($2::bool IS NULL OR active = $2) \
             ORDER BY created_at, id OFFSET $3 LIMIT $4"
        ))
        .bind(filter.platform.as_deref())
        .bind(filter.active)
        .bind(skip as i64)
        .bind(limit.map(|limit| limit as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn set_source_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Source, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE sources SET active = $2, updated_at = $3 WHERE id = $1 RETURNING {SOURCE_COLUMNS}"
        ))
        .bind(id)
        .bind(active)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound { kind: "source", id })?;
        source_from_row(&row)
    }

    async fn record_source_outcome(
        &self,
        id: Uuid,
        outcome: &SourceOutcome,
        at: DateTime<Utc>,
    ) -> Result<Source, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound { kind: "source", id })?;
        let mut source = source_from_row(&row)?;
        source.record_outcome(outcome, at);

        sqlx::query(
            "UPDATE sources SET last_attempted_at = $2, last_success_at = $3, \
             last_listing_count = $4, consecutive_failures = $5, last_error = $6, updated_at = $7 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(source.last_attempted_at)
        .bind(source.last_success_at)
        .bind(source.last_listing_count)
        .bind(source.consecutive_failures)
        .bind(&source.last_error)
        .bind(source.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(source)
    }

    async fn start_run(
        &self,
        source_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Run, StoreError> {
        let run = Run::start(source_id, started_at);
        let row = sqlx::query(&format!(
            "INSERT INTO runs (id, source_id, started_at, status) VALUES ($1, $2, $3, $4) \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run.id)
        .bind(source_id)
        .bind(started_at)
        .bind(run.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        run_from_row(&row)
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
        let row = sqlx::query(&format!(
            "UPDATE runs SET status = $2, finished_at = $3, listings_found = $4, \
             listings_new = $5, listings_updated = $6, error_message = $7 \
             WHERE id = $1 AND status = 'running' RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .bind(finalization.status.as_str())
        .bind(finalization.finished_at)
        .bind(finalization.counts.found)
        .bind(finalization.counts.new)
        .bind(finalization.counts.updated)
        .bind(&finalization.error_message)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => run_from_row(&row),
            None => match self.get_run(run_id).await? {
                Some(existing) => Err(StoreError::RunNotRunning {
                    run_id,
                    status: existing.status,
                }),
                None => Err(StoreError::NotFound {
                    kind: "run",
                    id: run_id,
                }),
            },
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let (skip, limit) = filter.page();
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE ($1::uuid IS NULL OR source_id = $1) AND ($2::text IS NULL OR status = $2) \
             ORDER BY started_at DESC, id OFFSET $3 LIMIT $4"
        ))
        .bind(filter.source_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn expire_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(&format!(
            "UPDATE runs SET status = 'timeout', finished_at = $2, error_message = $3 \
             WHERE status = 'running' AND started_at < $1 RETURNING {RUN_COLUMNS}"
        ))
        .bind(started_before)
        .bind(now)
        .bind(ABANDONED_RUN_MESSAGE)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn upsert_posting(
        &self,
        source: &Source,
        run_id: Uuid,
        draft: &ListingDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.upsert_once(source, run_id, draft, now).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_retryable_conflict(&err) => {
                    if attempt >= MAX_UPSERT_ATTEMPTS {
                        warn!(%run_id, url = %draft.application_url, error = %err, "upsert conflict retries exhausted");
                        return Err(StoreError::Conflict {
                            dedup_key: draft.dedup_key(),
                            attempts: attempt,
                        });
                    }
                    debug!(%run_id, attempt, error = %err, "retrying conflicting upsert");
                    tokio::time::sleep(self.conflict_backoff.delay_for_attempt(attempt - 1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn reconcile_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1 FOR UPDATE"))
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound {
                kind: "run",
                id: run_id,
            })?;
        let run = run_from_row(&row)?;
        if let Some(refusal) = ReconcileOutcome::refusal(&run) {
            return Ok(refusal);
        }

        let demoted = sqlx::query(
            "UPDATE postings SET active = FALSE, removed_at = $4, updated_at = $4 \
             WHERE source_id = $1 AND active \
             AND last_run_id IS DISTINCT FROM $2 AND last_seen_at < $3",
        )
        .bind(run.source_id)
        .bind(run_id)
        .bind(run.started_at)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("UPDATE runs SET listings_removed = $2, reconciled_at = $3 WHERE id = $1")
            .bind(run_id)
            .bind(i32::try_from(demoted).unwrap_or(i32::MAX))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ReconcileOutcome::Demoted(demoted))
    }

    async fn get_posting_by_key(&self, dedup_key: &str) -> Result<Option<Posting>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE dedup_key = $1"
        ))
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(posting_from_row).transpose()
    }

    async fn get_posting(&self, id: Uuid) -> Result<Option<Posting>, StoreError> {
        let row = sqlx::query(&format!("SELECT {POSTING_COLUMNS} FROM postings WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(posting_from_row).transpose()
    }

    async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<Posting>, StoreError> {
        let (skip, limit) = filter.page();
        let rows = sqlx::query(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings \
             WHERE ($1::uuid IS NULL OR source_id = $1) AND ($2::text IS NULL OR platform = $2) \
             AND ($3::text IS NULL OR upper(state) = upper($3)) \
             AND ($4::text IS NULL OR city ILIKE '%' || $4 || '%') \
             AND ($5::text IS NULL OR title ILIKE '%' || $5 || '%') \
             AND ($6::bool IS NULL OR active = $6) \
             ORDER BY posting_date DESC NULLS LAST, first_seen_at DESC, id OFFSET $7 LIMIT $8"
        ))
        .bind(filter.source_id)
        .bind(filter.platform.as_deref())
        .bind(filter.state.as_deref())
        .bind(filter.city.as_deref())
        .bind(filter.search.as_deref())
        .bind(filter.active)
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(posting_from_row).collect()
    }

    async fn posting_stats(&self, active_only: bool) -> Result<PostingStats, StoreError> {
        let row = sqlx::query(
            "SELECT count(*) FILTER (WHERE active OR NOT $1) AS total, \
             count(*) FILTER (WHERE active) AS active FROM postings",
        )
        .bind(active_only)
        .fetch_one(&self.pool)
        .await?;
        Ok(PostingStats {
            total: row.try_get("total")?,
            active: row.try_get("active")?,
            by_platform: self.count_by("platform", active_only, None).await?,
            by_category: self
                .count_by("category", active_only, Some(STATS_TOP_N))
                .await?,
            by_city: self.count_by("city", active_only, Some(STATS_TOP_N)).await?,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
