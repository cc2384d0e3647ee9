//! Applies normalized rows to the record store in committed batches.

use std::collections::BTreeSet;
use std::sync::Arc;

use donorstats_core::RecordFragment;
use donorstats_storage::{RecordStore, StoreError, StoreSession, UpsertOutcome};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    /// Rows written per commit.
    pub batch_size: usize,
    /// Maximum number of per-row messages kept in the summary.
    pub detail_limit: usize,
    pub allowed_product_types: BTreeSet<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            detail_limit: 20,
            allowed_product_types: ["FG", "MI"].into_iter().map(String::from).collect(),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: std::env::var("DONORSTATS_IMPORT_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(defaults.batch_size),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub details: Vec<String>,
}

impl ImportSummary {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            added: 0,
            updated: 0,
            skipped: 0,
            details: Vec::new(),
        }
    }

    fn note(&mut self, limit: usize, detail: String) {
        if self.details.len() < limit {
            self.details.push(detail);
        }
    }
}

/// A normalized row together with its line in the source file.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub number: usize,
    pub fields: RecordFragment,
}

struct PendingRow {
    number: usize,
    outcome: UpsertOutcome,
}

pub struct ImportReconciler {
    store: Arc<dyn RecordStore>,
    config: ImportConfig,
}

impl ImportReconciler {
    pub fn new(store: Arc<dyn RecordStore>, config: ImportConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Creates or updates one agreement per eligible row. Row failures are
    /// counted as skipped; only failing to open a session is an error.
    pub async fn reconcile(&self, run_id: Uuid, rows: Vec<ImportRow>) -> Result<ImportSummary, StoreError> {
        let mut summary = ImportSummary::new(run_id);
        let mut session = self.store.begin().await?;
        let mut pending = Vec::new();

        for row in rows {
            match self.apply_row(session.as_mut(), &row.fields).await {
                Ok(outcome) => {
                    pending.push(PendingRow {
                        number: row.number,
                        outcome,
                    });
                    if pending.len() >= self.config.batch_size {
                        self.flush(session.as_mut(), &mut summary, &mut pending).await;
                    }
                }
                Err(reason) => {
                    debug!(row = row.number, %reason, "row skipped");
                    summary.skipped += 1;
                    summary.note(self.config.detail_limit, format!("row {}: skipped, {reason}", row.number));
                }
            }
        }
        self.flush(session.as_mut(), &mut summary, &mut pending).await;

        info!(
            added = summary.added,
            updated = summary.updated,
            skipped = summary.skipped,
            "import reconciled"
        );
        Ok(summary)
    }

    async fn apply_row(
        &self,
        session: &mut dyn StoreSession,
        fields: &RecordFragment,
    ) -> Result<UpsertOutcome, String> {
        match fields.product_type().map(str::trim) {
            None => return Err("missing product type".to_string()),
            Some(product) if !self.config.allowed_product_types.contains(product) => {
                return Err(format!("product type {product} is not imported"));
            }
            Some(_) => {}
        }
        let key = fields
            .dedup_key()
            .ok_or_else(|| "missing person id or agreement id".to_string())?;

        session
            .savepoint()
            .await
            .map_err(|err| format!("write failed: {err}"))?;
        let written = match session.find_by_key(&key).await {
            Ok(Some(existing)) => session
                .update(existing.id, fields)
                .await
                .map(|_| UpsertOutcome::Updated),
            Ok(None) => session.insert(fields).await.map(|_| UpsertOutcome::Created),
            Err(err) => Err(err),
        };

        match written {
            Ok(outcome) => {
                session
                    .release_savepoint()
                    .await
                    .map_err(|err| format!("write failed: {err}"))?;
                Ok(outcome)
            }
            Err(err) => {
                warn!(person_id = key.person_id, agreement_id = %key.agreement_id, error = %err, "row write failed");
                if let Err(rollback_err) = session.rollback_to_savepoint().await {
                    warn!(error = %rollback_err, "savepoint rollback failed");
                }
                Err(format!("write failed: {err}"))
            }
        }
    }

    /// Commits the pending rows. A failed commit loses the whole batch; its
    /// rows are reported as skipped and not retried.
    async fn flush(
        &self,
        session: &mut dyn StoreSession,
        summary: &mut ImportSummary,
        pending: &mut Vec<PendingRow>,
    ) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        match session.commit().await {
            Ok(()) => {
                for row in &batch {
                    match row.outcome {
                        UpsertOutcome::Created => summary.added += 1,
                        UpsertOutcome::Updated => summary.updated += 1,
                    }
                }
                info!(rows = batch.len(), "import batch committed");
            }
            Err(err) => {
                error!(rows = batch.len(), error = %err, "import batch commit failed");
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed commit failed");
                }
                let first = batch.first().map(|r| r.number).unwrap_or_default();
                let last = batch.last().map(|r| r.number).unwrap_or_default();
                summary.skipped += batch.len();
                summary.note(
                    self.config.detail_limit,
                    format!("rows {first}-{last}: batch of {} rows rolled back, {err}", batch.len()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use donorstats_core::{AgreementField, FieldValue};
    use donorstats_storage::MemoryRecordStore;

    fn row(number: usize, person_id: Option<i64>, agreement_id: Option<&str>, product: &str, amount: f64) -> ImportRow {
        let mut fields = RecordFragment::new()
            .with(AgreementField::ProductType, FieldValue::Text(product.into()))
            .with(AgreementField::Amount, FieldValue::Float(amount))
            .with(
                AgreementField::StartDate,
                FieldValue::Date(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()),
            );
        fields.set(AgreementField::PersonId, person_id.map(FieldValue::Integer));
        fields.set(
            AgreementField::AgreementId,
            agreement_id.map(|id| FieldValue::Text(id.to_string())),
        );
        ImportRow { number, fields }
    }

    fn reconciler(store: &MemoryRecordStore, config: ImportConfig) -> ImportReconciler {
        ImportReconciler::new(Arc::new(store.clone()), config)
    }

    #[tokio::test]
    async fn three_row_batch_adds_skips_and_updates() {
        let store = MemoryRecordStore::new();
        let rows = vec![
            row(2, Some(42), Some("900100"), "FG", 200.0),
            row(3, Some(43), Some("900101"), "XX", 100.0),
            row(4, Some(42), Some("900100"), "FG", 350.0),
        ];

        let summary = reconciler(&store, ImportConfig::default())
            .reconcile(Uuid::new_v4(), rows)
            .await
            .unwrap();

        assert_eq!((summary.added, summary.updated, summary.skipped), (1, 1, 1));
        assert_eq!(summary.details, vec!["row 3: skipped, product type XX is not imported"]);
        let stored = store.agreements().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].fields.amount(), Some(350.0));
    }

    #[tokio::test]
    async fn reimporting_the_same_row_updates_instead_of_duplicating() {
        let store = MemoryRecordStore::new();
        let reconciler = reconciler(&store, ImportConfig::default());

        let first = reconciler
            .reconcile(Uuid::new_v4(), vec![row(2, Some(1), Some("A"), "MI", 50.0)])
            .await
            .unwrap();
        let second = reconciler
            .reconcile(Uuid::new_v4(), vec![row(2, Some(1), Some("A"), "MI", 50.0)])
            .await
            .unwrap();

        assert_eq!((first.added, first.updated), (1, 0));
        assert_eq!((second.added, second.updated), (0, 1));
        assert_eq!(store.agreements().await.len(), 1);
    }

    #[tokio::test]
    async fn rows_without_both_keys_are_skipped() {
        let store = MemoryRecordStore::new();
        let summary = reconciler(&store, ImportConfig::default())
            .reconcile(
                Uuid::new_v4(),
                vec![
                    row(2, None, Some("A"), "FG", 10.0),
                    row(3, Some(5), None, "FG", 10.0),
                    row(4, None, None, "MI", 10.0),
                ],
            )
            .await
            .unwrap();

        assert_eq!((summary.added, summary.updated, summary.skipped), (0, 0, 3));
        assert!(summary.details.iter().all(|d| d.ends_with("missing person id or agreement id")));
        assert!(store.agreements().await.is_empty());
    }

    #[tokio::test]
    async fn a_failing_row_does_not_abort_its_neighbours() {
        let store = MemoryRecordStore::new();
        store.reject_agreement("BAD").await;

        let summary = reconciler(&store, ImportConfig::default())
            .reconcile(
                Uuid::new_v4(),
                vec![
                    row(2, Some(1), Some("A"), "FG", 10.0),
                    row(3, Some(2), Some("BAD"), "FG", 10.0),
                    row(4, Some(3), Some("C"), "FG", 10.0),
                ],
            )
            .await
            .unwrap();

        assert_eq!((summary.added, summary.skipped), (2, 1));
        assert!(summary.details[0].starts_with("row 3: skipped, write failed: constraint violation"));
        let ids: Vec<_> = store
            .agreements()
            .await
            .iter()
            .filter_map(|a| a.fields.agreement_id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn rows_are_committed_in_batches() {
        let store = MemoryRecordStore::new();
        let config = ImportConfig {
            batch_size: 2,
            ..ImportConfig::default()
        };
        let rows = (1..=5)
            .map(|i| row(i + 1, Some(i as i64), Some(&format!("AG{i}")), "FG", 10.0))
            .collect();

        let summary = reconciler(&store, config).reconcile(Uuid::new_v4(), rows).await.unwrap();

        assert_eq!(summary.added, 5);
        assert_eq!(store.commit_count().await, 3);
    }

    #[tokio::test]
    async fn a_failed_commit_loses_only_its_batch() {
        let store = MemoryRecordStore::new();
        store.fail_next_commits(1).await;
        let config = ImportConfig {
            batch_size: 2,
            ..ImportConfig::default()
        };
        let rows = (1..=3)
            .map(|i| row(i + 1, Some(i as i64), Some(&format!("AG{i}")), "FG", 10.0))
            .collect();

        let summary = reconciler(&store, config).reconcile(Uuid::new_v4(), rows).await.unwrap();

        assert_eq!((summary.added, summary.skipped), (1, 2));
        assert_eq!(summary.details, vec!["rows 2-3: batch of 2 rows rolled back, store unavailable: injected commit failure"]);
        let stored = store.agreements().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].fields.agreement_id(), Some("AG3"));
    }

    #[tokio::test]
    async fn details_are_capped() {
        let store = MemoryRecordStore::new();
        let rows = (0..30).map(|i| row(i + 2, None, None, "FG", 1.0)).collect();

        let summary = reconciler(&store, ImportConfig::default())
            .reconcile(Uuid::new_v4(), rows)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 30);
        assert_eq!(summary.details.len(), 20);
    }
}
