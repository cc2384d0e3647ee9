//! Synthetic daily stats and recurring donors for local development.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use donorstats_core::{AgreementField, DailyDonorStat, FieldValue, RecordFragment};
use donorstats_storage::RecordStore;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::info;

pub const DEFAULT_SEED_START: (i32, u32, u32) = (2025, 1, 1);

const YEARLY_SUM_PER_DONOR: f64 = 720.0;
const TOTAL_NEW_DONORS: i64 = 48_000;
const YEARLY_SUM_ALL_DONORS: f64 = 67_680_000.0;

const PAYMENT_METHODS: [&str; 2] = ["vippsrecurring", "striprecurring"];
const PRODUCT_TYPES: [&str; 2] = ["FG", "MI"];
const INTERVALS: [&str; 3] = ["Monthly", "Quarterly", "Yearly"];
const COUNTRIES: [&str; 4] = ["NO", "SE", "DK", "FI"];
const NAME_TYPES: [&str; 3] = ["P", "D", "C"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub days: usize,
    pub stats_written: usize,
    pub agreements_cleared: u64,
    pub agreements_written: usize,
}

pub fn default_seed_start() -> Option<NaiveDate> {
    let (y, m, d) = DEFAULT_SEED_START;
    NaiveDate::from_ymd_opt(y, m, d)
}

pub fn sample_stat<R: Rng + ?Sized>(rng: &mut R, date: NaiveDate) -> DailyDonorStat {
    let n_new_donors = rng.gen_range(18..=47);
    DailyDonorStat {
        date,
        n_new_donors,
        yearly_sum_new_donors: n_new_donors as f64 * YEARLY_SUM_PER_DONOR,
        n_total_new_donors: TOTAL_NEW_DONORS,
        yearly_sum_all_donors: YEARLY_SUM_ALL_DONORS,
    }
}

fn pick<R: Rng + ?Sized>(rng: &mut R, options: &[&str]) -> FieldValue {
    FieldValue::Text(options.choose(rng).copied().unwrap_or_default().to_string())
}

fn digits<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

pub fn sample_agreement<R: Rng + ?Sized>(rng: &mut R, start_date: NaiveDate) -> RecordFragment {
    RecordFragment::new()
        .with(AgreementField::PersonId, FieldValue::Integer(rng.gen_range(1000..=9999)))
        .with(AgreementField::AgreementId, FieldValue::Text(digits(rng, 6)))
        .with(AgreementField::PaymentMethod, pick(rng, &PAYMENT_METHODS))
        .with(AgreementField::Amount, FieldValue::Float(rng.gen_range(40..=240) as f64))
        .with(AgreementField::PaymentInterval, pick(rng, &INTERVALS))
        .with(AgreementField::StartDate, FieldValue::Date(start_date))
        .with(AgreementField::ProductType, pick(rng, &PRODUCT_TYPES))
        .with(AgreementField::ProjectId, FieldValue::Integer(rng.gen_range(0..=10)))
        .with(AgreementField::CampaignId, FieldValue::Integer(rng.gen_range(100..=200)))
        .with(AgreementField::SuccessClassification, FieldValue::Text("BG".into()))
        .with(AgreementField::PostalCode, FieldValue::Text(digits(rng, 4)))
        .with(AgreementField::CountryCode, pick(rng, &COUNTRIES))
        .with(AgreementField::NameType, pick(rng, &NAME_TYPES))
}

/// Replaces all agreements with 5 to 20 random donors per day and upserts a
/// random stat for every day in `[from, to]`. Each day is committed on its own.
pub async fn seed_sample_data<R: Rng + Send>(
    store: &dyn RecordStore,
    rng: &mut R,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<SeedReport> {
    let mut report = SeedReport {
        agreements_cleared: store
            .clear_agreements()
            .await
            .context("failed to clear existing agreements")?,
        ..SeedReport::default()
    };

    let mut session = store.begin().await.context("failed to open store session")?;
    for date in from.iter_days().take_while(|d| *d <= to) {
        let stat = sample_stat(rng, date);
        store
            .upsert_daily_stat(&stat)
            .await
            .with_context(|| format!("failed to upsert stat for {date}"))?;
        report.stats_written += 1;

        let donors = rng.gen_range(5..=20);
        for _ in 0..donors {
            let fields = sample_agreement(rng, date);
            session
                .insert(&fields)
                .await
                .with_context(|| format!("failed to insert sample donor for {date}"))?;
        }
        session
            .commit()
            .await
            .with_context(|| format!("failed to commit sample donors for {date}"))?;
        report.agreements_written += donors;
        report.days += 1;
    }

    info!(
        days = report.days,
        agreements = report.agreements_written,
        "sample data seeded"
    );
    Ok(report)
}
