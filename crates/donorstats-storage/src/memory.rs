use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use donorstats_core::{
    AgreementField, DailyDonorStat, DedupKey, ProductTotal, RecordFragment, RegionTotal,
    StoredAgreement,
};
use tokio::sync::Mutex;

use crate::{RecordStore, StoreError, StoreResult, StoreSession};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    agreements: Vec<StoredAgreement>,
    next_id: i64,
    stats: BTreeMap<NaiveDate, DailyDonorStat>,
}

#[derive(Debug, Default)]
struct Faults {
    rejected_agreements: HashSet<String>,
    failing_commits: usize,
    commits: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    faults: Mutex<Faults>,
}

/// In-process record store. Sessions buffer their writes until commit, like
/// transactions on the PostgreSQL backend. Writes can be made to fail on demand.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    shared: Arc<Shared>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every insert or update carrying this agreement id fails with a
    /// constraint violation.
    pub async fn reject_agreement(&self, agreement_id: impl Into<String>) {
        self.shared
            .faults
            .lock()
            .await
            .rejected_agreements
            .insert(agreement_id.into());
    }

    /// The next `count` commits fail and discard their pending writes.
    pub async fn fail_next_commits(&self, count: usize) {
        self.shared.faults.lock().await.failing_commits = count;
    }

    /// Number of commits that went through.
    pub async fn commit_count(&self) -> usize {
        self.shared.faults.lock().await.commits
    }

    pub async fn agreements(&self) -> Vec<StoredAgreement> {
        self.shared.state.lock().await.agreements.clone()
    }

    pub async fn daily_stats(&self) -> Vec<DailyDonorStat> {
        self.shared.state.lock().await.stats.values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreSession>> {
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            active: false,
            pending: BTreeMap::new(),
            savepoint: None,
        }))
    }

    async fn daily_stat(&self, date: NaiveDate) -> StoreResult<Option<DailyDonorStat>> {
        Ok(self.shared.state.lock().await.stats.get(&date).cloned())
    }

    async fn upsert_daily_stat(&self, stat: &DailyDonorStat) -> StoreResult<DailyDonorStat> {
        self.shared
            .state
            .lock()
            .await
            .stats
            .insert(stat.date, stat.clone());
        Ok(stat.clone())
    }

    async fn new_donor_counts(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<i64>> {
        let state = self.shared.state.lock().await;
        Ok(state
            .stats
            .range(from..=to)
            .map(|(_, stat)| stat.n_new_donors)
            .collect())
    }

    async fn totals_by_county(&self) -> StoreResult<Vec<RegionTotal>> {
        let state = self.shared.state.lock().await;
        let mut totals: BTreeMap<String, (i64, f64)> = BTreeMap::new();
        for agreement in &state.agreements {
            let county = agreement.fields.text(AgreementField::County).unwrap_or_default();
            let entry = totals.entry(county.to_string()).or_default();
            entry.0 += 1;
            entry.1 += agreement.fields.amount().unwrap_or(0.0);
        }
        Ok(totals
            .into_iter()
            .map(|(region, (count, sum))| RegionTotal { region, count, sum })
            .collect())
    }

    async fn totals_by_product(&self) -> StoreResult<Vec<ProductTotal>> {
        let state = self.shared.state.lock().await;
        let mut totals: BTreeMap<Option<String>, (i64, f64)> = BTreeMap::new();
        for agreement in &state.agreements {
            let product = agreement.fields.product_type().map(str::to_string);
            let entry = totals.entry(product).or_default();
            entry.0 += 1;
            entry.1 += agreement.fields.amount().unwrap_or(0.0);
        }
        Ok(totals
            .into_iter()
            .map(|(product_type, (count, sum))| ProductTotal {
                product_type,
                count,
                sum,
            })
            .collect())
    }

    async fn agreements_starting_on(&self, date: NaiveDate) -> StoreResult<Vec<StoredAgreement>> {
        let state = self.shared.state.lock().await;
        Ok(state
            .agreements
            .iter()
            .filter(|a| a.fields.start_date() == Some(date))
            .cloned()
            .collect())
    }

    async fn clear_agreements(&self) -> StoreResult<u64> {
        let mut state = self.shared.state.lock().await;
        let removed = state.agreements.len() as u64;
        state.agreements.clear();
        Ok(removed)
    }
}

/// Buffers inserted and updated rows by id; commit applies only those rows
/// onto whatever the shared state holds at that point.
pub struct MemorySession {
    shared: Arc<Shared>,
    active: bool,
    pending: BTreeMap<i64, StoredAgreement>,
    savepoint: Option<BTreeMap<i64, StoredAgreement>>,
}

impl MemorySession {
    /// Committed rows with this session's pending writes laid over them, by id.
    async fn visible(&mut self) -> BTreeMap<i64, StoredAgreement> {
        self.active = true;
        let state = self.shared.state.lock().await;
        let mut rows: BTreeMap<i64, StoredAgreement> = state
            .agreements
            .iter()
            .map(|a| (a.id, a.clone()))
            .collect();
        rows.extend(self.pending.iter().map(|(id, a)| (*id, a.clone())));
        rows
    }

    async fn check_constraints(&self, fields: &RecordFragment) -> StoreResult<()> {
        if let Some(agreement_id) = fields.agreement_id() {
            let faults = self.shared.faults.lock().await;
            if faults.rejected_agreements.contains(agreement_id) {
                return Err(StoreError::Constraint(format!(
                    "agreement {agreement_id} rejected"
                )));
            }
        }
        if matches!(fields.person_id(), Some(id) if id <= 0) {
            return Err(StoreError::Constraint("person_id must be positive".into()));
        }
        if matches!(fields.amount(), Some(amount) if amount < 0.0) {
            return Err(StoreError::Constraint("amount must not be negative".into()));
        }
        Ok(())
    }
}

fn full_row(fields: &RecordFragment) -> RecordFragment {
    let mut row = RecordFragment::new();
    for field in AgreementField::ALL {
        row.set(field, None);
    }
    row.overwrite_from(fields);
    row
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn find_by_key(&mut self, key: &DedupKey) -> StoreResult<Option<StoredAgreement>> {
        Ok(self
            .visible()
            .await
            .into_values()
            .find(|a| a.dedup_key().as_ref() == Some(key)))
    }

    async fn insert(&mut self, fields: &RecordFragment) -> StoreResult<StoredAgreement> {
        self.active = true;
        self.check_constraints(fields).await?;
        // Ids are handed out from the shared counter and never reused.
        let id = {
            let mut state = self.shared.state.lock().await;
            state.next_id += 1;
            state.next_id
        };
        let now = Utc::now();
        let stored = StoredAgreement {
            id,
            created_at: now,
            updated_at: now,
            fields: full_row(fields),
        };
        self.pending.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(&mut self, id: i64, fields: &RecordFragment) -> StoreResult<StoredAgreement> {
        let Some(mut existing) = self.visible().await.remove(&id) else {
            return Err(StoreError::NotFound(id));
        };
        existing.fields.overwrite_from(fields);
        self.check_constraints(&existing.fields).await?;
        existing.updated_at = Utc::now();
        self.pending.insert(id, existing.clone());
        Ok(existing)
    }

    async fn savepoint(&mut self) -> StoreResult<()> {
        self.active = true;
        self.savepoint = Some(self.pending.clone());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> StoreResult<()> {
        self.savepoint.take().map(|_| ()).ok_or(StoreError::NoSavepoint)
    }

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()> {
        self.pending = self.savepoint.take().ok_or(StoreError::NoSavepoint)?;
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.savepoint = None;
        if !std::mem::take(&mut self.active) {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        {
            let mut faults = self.shared.faults.lock().await;
            if faults.failing_commits > 0 {
                faults.failing_commits -= 1;
                return Err(StoreError::Unavailable("injected commit failure".into()));
            }
            faults.commits += 1;
        }
        let mut state = self.shared.state.lock().await;
        for (id, row) in pending {
            match state.agreements.iter_mut().find(|a| a.id == id) {
                Some(existing) => *existing = row,
                None => state.agreements.push(row),
            }
        }
        state.agreements.sort_by_key(|a| a.id);
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.active = false;
        self.savepoint = None;
        self.pending.clear();
        Ok(())
    }
}
