//! Record store contracts, PostgreSQL + in-memory backends and reporting reads.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use donorstats_core::{
    merge_region_totals, rolling_average, rolling_window, DailyDonorStat, DedupKey,
    ProductTotal, RecordFragment, RegionTotal, StoredAgreement,
};
use serde::Serialize;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

pub const CRATE_NAME: &str = "donorstats-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("agreement {0} does not exist")]
    NotFound(i64),
    #[error("no open savepoint")]
    NoSavepoint,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read side and session factory of the donor database.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Opens a write session. Nothing written through it is visible to other
    /// readers until [`StoreSession::commit`].
    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>>;

    async fn daily_stat(&self, date: NaiveDate) -> StoreResult<Option<DailyDonorStat>>;

    /// Inserts the stat or overwrites the existing row for the same date.
    async fn upsert_daily_stat(&self, stat: &DailyDonorStat) -> StoreResult<DailyDonorStat>;

    /// `n_new_donors` of every stored day in `[from, to]`, oldest first.
    async fn new_donor_counts(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<i64>>;

    /// Count and amount sum per raw county value (blank for missing).
    async fn totals_by_county(&self) -> StoreResult<Vec<RegionTotal>>;

    async fn totals_by_product(&self) -> StoreResult<Vec<ProductTotal>>;

    /// Agreements starting on `date`, in insertion order.
    async fn agreements_starting_on(&self, date: NaiveDate) -> StoreResult<Vec<StoredAgreement>>;

    /// Deletes every agreement row. Administrative reset only.
    async fn clear_agreements(&self) -> StoreResult<u64>;
}

/// A write transaction with a single nestable row savepoint.
#[async_trait]
pub trait StoreSession: Send {
    async fn find_by_key(&mut self, key: &DedupKey) -> StoreResult<Option<StoredAgreement>>;

    async fn insert(&mut self, fields: &RecordFragment) -> StoreResult<StoredAgreement>;

    /// Overwrites every field present in `fields`; other columns keep their value.
    async fn update(&mut self, id: i64, fields: &RecordFragment) -> StoreResult<StoredAgreement>;

    async fn savepoint(&mut self) -> StoreResult<()>;

    async fn release_savepoint(&mut self) -> StoreResult<()>;

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()>;

    /// Makes everything written so far durable. The session stays usable and
    /// the next write starts a fresh transaction. On failure the pending
    /// writes are discarded.
    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Single-record write used by the push API: update the agreement matching
/// `key`, or create it.
pub async fn upsert_agreement(
    store: &dyn RecordStore,
    key: &DedupKey,
    fields: &RecordFragment,
) -> StoreResult<(StoredAgreement, UpsertOutcome)> {
    let mut session = store.begin().await?;
    let result = match session.find_by_key(key).await? {
        Some(existing) => session
            .update(existing.id, fields)
            .await
            .map(|stored| (stored, UpsertOutcome::Updated)),
        None => session
            .insert(fields)
            .await
            .map(|stored| (stored, UpsertOutcome::Created)),
    };
    match result {
        Ok(written) => {
            session.commit().await?;
            Ok(written)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback after failed upsert failed");
            }
            Err(err)
        }
    }
}

/// One day's stat together with the rolling new-donor average around it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySummary {
    pub stat: DailyDonorStat,
    pub average_new_donors: f64,
}

pub async fn day_summary(
    store: &dyn RecordStore,
    date: NaiveDate,
    window_days: i64,
) -> StoreResult<Option<DaySummary>> {
    let Some(stat) = store.daily_stat(date).await? else {
        return Ok(None);
    };
    let average_new_donors = rolling_new_donor_average(store, date, window_days).await?;
    Ok(Some(DaySummary {
        stat,
        average_new_donors,
    }))
}

pub async fn rolling_new_donor_average(
    store: &dyn RecordStore,
    date: NaiveDate,
    window_days: i64,
) -> StoreResult<f64> {
    let (from, to) = rolling_window(date, window_days);
    let counts = store.new_donor_counts(from, to).await?;
    Ok(rolling_average(&counts))
}

/// Totals per normalized county, largest first.
pub async fn region_breakdown(store: &dyn RecordStore) -> StoreResult<Vec<RegionTotal>> {
    Ok(merge_region_totals(store.totals_by_county().await?))
}

/// Totals per product type, largest first.
pub async fn product_breakdown(store: &dyn RecordStore) -> StoreResult<Vec<ProductTotal>> {
    let mut rows = store.totals_by_product().await?;
    rows.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.product_type.cmp(&b.product_type))
    });
    Ok(rows)
}

/// Agreements starting on `date`, keeping the first row per person id.
/// Rows without a person id cannot be matched and are all kept.
pub async fn new_donors_on(
    store: &dyn RecordStore,
    date: NaiveDate,
) -> StoreResult<Vec<StoredAgreement>> {
    let rows = store.agreements_starting_on(date).await?;
    let mut seen = HashSet::new();
    Ok(rows
        .into_iter()
        .filter(|row| match row.fields.person_id() {
            Some(person_id) => seen.insert(person_id),
            None => true,
        })
        .collect())
}
