//! Core domain model for donor agreements and daily donor statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

mod region;

pub use region::{merge_region_totals, normalize_county, KNOWN_COUNTIES, UNKNOWN_REGION};

pub const CRATE_NAME: &str = "donorstats-core";

/// Storage representation of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Float,
    Date,
    Text,
}

/// Every attribute a donor agreement can carry.
///
/// Each field has exactly one storage column (its canonical name). Older
/// consumers read some of them under a legacy name; that alias is applied
/// when a record is serialized and never stored separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgreementField {
    PersonId,
    Register,
    Register1,
    AgreementId,
    PostalCode,
    PostalPlace,
    Municipality,
    County,
    CountryCode,
    Country,
    NameType,
    BirthOrStartYear,
    ProductCode,
    ProductType,
    ProjectId,
    ProductName,
    ProjectName,
    StartDate,
    PaymentMethod,
    GiroInterval,
    PaymentInterval,
    Amount,
    ActionType,
    ActionTypeDescription,
    ActionNumber,
    ActionName,
    AgreementType,
    PeriodAmount,
    CreatedDate,
    CampaignId,
    SuccessClassification,
    ProductVariantId,
}

impl AgreementField {
    pub const ALL: [AgreementField; 32] = [
        AgreementField::PersonId,
        AgreementField::Register,
        AgreementField::Register1,
        AgreementField::AgreementId,
        AgreementField::PostalCode,
        AgreementField::PostalPlace,
        AgreementField::Municipality,
        AgreementField::County,
        AgreementField::CountryCode,
        AgreementField::Country,
        AgreementField::NameType,
        AgreementField::BirthOrStartYear,
        AgreementField::ProductCode,
        AgreementField::ProductType,
        AgreementField::ProjectId,
        AgreementField::ProductName,
        AgreementField::ProjectName,
        AgreementField::StartDate,
        AgreementField::PaymentMethod,
        AgreementField::GiroInterval,
        AgreementField::PaymentInterval,
        AgreementField::Amount,
        AgreementField::ActionType,
        AgreementField::ActionTypeDescription,
        AgreementField::ActionNumber,
        AgreementField::ActionName,
        AgreementField::AgreementType,
        AgreementField::PeriodAmount,
        AgreementField::CreatedDate,
        AgreementField::CampaignId,
        AgreementField::SuccessClassification,
        AgreementField::ProductVariantId,
    ];

    /// Canonical name, used as the storage column and the primary JSON key.
    pub const fn column(self) -> &'static str {
        match self {
            AgreementField::PersonId => "person_id",
            AgreementField::Register => "register",
            AgreementField::Register1 => "register_1",
            AgreementField::AgreementId => "agreement_id",
            AgreementField::PostalCode => "postal_code",
            AgreementField::PostalPlace => "postal_place",
            AgreementField::Municipality => "municipality",
            AgreementField::County => "county",
            AgreementField::CountryCode => "country_code",
            AgreementField::Country => "country",
            AgreementField::NameType => "name_type",
            AgreementField::BirthOrStartYear => "birth_or_start_year",
            AgreementField::ProductCode => "product_code",
            AgreementField::ProductType => "product_type",
            AgreementField::ProjectId => "project_id",
            AgreementField::ProductName => "product_name",
            AgreementField::ProjectName => "project_name",
            AgreementField::StartDate => "start_date",
            AgreementField::PaymentMethod => "payment_method",
            AgreementField::GiroInterval => "giro_interval",
            AgreementField::PaymentInterval => "payment_interval",
            AgreementField::Amount => "amount",
            AgreementField::ActionType => "action_type",
            AgreementField::ActionTypeDescription => "action_type_description",
            AgreementField::ActionNumber => "action_number",
            AgreementField::ActionName => "action_name",
            AgreementField::AgreementType => "agreement_type",
            AgreementField::PeriodAmount => "period_amount",
            AgreementField::CreatedDate => "created_date",
            AgreementField::CampaignId => "campaign_id",
            AgreementField::SuccessClassification => "success_classification",
            AgreementField::ProductVariantId => "product_variant_id",
        }
    }

    pub const fn kind(self) -> FieldKind {
        match self {
            AgreementField::PersonId
            | AgreementField::ProjectId
            | AgreementField::GiroInterval
            | AgreementField::CampaignId
            | AgreementField::ProductVariantId => FieldKind::Integer,
            AgreementField::Amount | AgreementField::PeriodAmount => FieldKind::Float,
            AgreementField::StartDate => FieldKind::Date,
            _ => FieldKind::Text,
        }
    }

    /// Name the field had in the previous schema, if older consumers read it.
    pub const fn legacy_name(self) -> Option<&'static str> {
        match self {
            AgreementField::PersonId => Some("name_id"),
            AgreementField::AgreementId => Some("agreement_number"),
            AgreementField::PostalCode => Some("zip_code"),
            AgreementField::CountryCode => Some("country_id"),
            AgreementField::NameType => Some("nametype_id"),
            AgreementField::ProductType => Some("producttype_id"),
            AgreementField::ProjectId => Some("project_id"),
            AgreementField::Amount => Some("amount"),
            AgreementField::PaymentInterval => Some("interval"),
            AgreementField::StartDate => Some("startdate"),
            AgreementField::PaymentMethod => Some("payment_method"),
            AgreementField::CampaignId => Some("campaign_id"),
            AgreementField::SuccessClassification => Some("classification_id_success"),
            AgreementField::ProductVariantId => Some("productvariant_id"),
            _ => None,
        }
    }

    pub fn from_column(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.column() == name)
    }

    pub fn from_legacy_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.legacy_name() == Some(name))
    }
}

/// A typed field value. Serializes as the bare JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::Date(_) => FieldKind::Date,
            FieldValue::Text(_) => FieldKind::Text,
        }
    }
}

/// Person id + agreement number, the natural identity of an agreement row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub person_id: i64,
    pub agreement_id: String,
}

/// A set of field assignments.
///
/// A key mapped to `None` is an explicit null (the source had the column but
/// no usable value); a missing key means the source never mentioned the field.
/// Applying a fragment onto a record only touches the keys it contains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFragment {
    values: BTreeMap<AgreementField, Option<FieldValue>>,
}

impl RecordFragment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a value. A value whose kind does not match the field is stored as null.
    pub fn set(&mut self, field: AgreementField, value: Option<FieldValue>) {
        let value = value.filter(|v| v.kind() == field.kind());
        self.values.insert(field, value);
    }

    pub fn with(mut self, field: AgreementField, value: FieldValue) -> Self {
        self.set(field, Some(value));
        self
    }

    pub fn get(&self, field: AgreementField) -> Option<&FieldValue> {
        self.values.get(&field).and_then(Option::as_ref)
    }

    pub fn contains(&self, field: AgreementField) -> bool {
        self.values.contains_key(&field)
    }

    pub fn remove(&mut self, field: AgreementField) -> Option<Option<FieldValue>> {
        self.values.remove(&field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AgreementField, Option<&FieldValue>)> + '_ {
        self.values.iter().map(|(field, value)| (*field, value.as_ref()))
    }

    pub fn integer(&self, field: AgreementField) -> Option<i64> {
        self.get(field).and_then(FieldValue::as_integer)
    }

    pub fn float(&self, field: AgreementField) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_float)
    }

    pub fn date(&self, field: AgreementField) -> Option<NaiveDate> {
        self.get(field).and_then(FieldValue::as_date)
    }

    pub fn text(&self, field: AgreementField) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn person_id(&self) -> Option<i64> {
        self.integer(AgreementField::PersonId)
    }

    pub fn agreement_id(&self) -> Option<&str> {
        self.text(AgreementField::AgreementId)
    }

    pub fn product_type(&self) -> Option<&str> {
        self.text(AgreementField::ProductType)
    }

    pub fn amount(&self) -> Option<f64> {
        self.float(AgreementField::Amount)
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.date(AgreementField::StartDate)
    }

    pub fn dedup_key(&self) -> Option<DedupKey> {
        Some(DedupKey {
            person_id: self.person_id()?,
            agreement_id: self.agreement_id()?.to_string(),
        })
    }

    /// Overwrites every field named in `other`, nulls included.
    pub fn overwrite_from(&mut self, other: &RecordFragment) {
        for (field, value) in other.iter() {
            self.set(field, value.cloned());
        }
    }
}

/// A persisted donor agreement row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAgreement {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: RecordFragment,
}

impl StoredAgreement {
    pub fn dedup_key(&self) -> Option<DedupKey> {
        self.fields.dedup_key()
    }
}

impl Serialize for StoredAgreement {
    /// Writes every canonical field, then each legacy alias that differs from
    /// its canonical name, so old and new consumers read the same record.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("id", &self.id)?;
        for field in AgreementField::ALL {
            map.serialize_entry(field.column(), &self.fields.get(field))?;
        }
        for field in AgreementField::ALL {
            if let Some(legacy) = field.legacy_name() {
                if legacy != field.column() {
                    map.serialize_entry(legacy, &self.fields.get(field))?;
                }
            }
        }
        map.serialize_entry("created_at", &self.created_at)?;
        map.serialize_entry("updated_at", &self.updated_at)?;
        map.end()
    }
}

/// Aggregate figures for one calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDonorStat {
    pub date: NaiveDate,
    pub n_new_donors: i64,
    pub yearly_sum_new_donors: f64,
    pub n_total_new_donors: i64,
    pub yearly_sum_all_donors: f64,
}

/// Count and amount sum for one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionTotal {
    pub region: String,
    pub count: i64,
    pub sum: f64,
}

/// Count and amount sum for one product type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductTotal {
    pub product_type: Option<String>,
    pub count: i64,
    pub sum: f64,
}

pub const ROLLING_WINDOW_DAYS: i64 = 30;

/// Inclusive date range `[date - days, date]`, clamped at the earliest
/// representable date.
pub fn rolling_window(date: NaiveDate, days: i64) -> (NaiveDate, NaiveDate) {
    let start = date
        .checked_sub_signed(Duration::days(days))
        .unwrap_or(NaiveDate::MIN);
    (start, date)
}

/// Mean of the daily values; an empty window averages to zero.
pub fn rolling_average(daily_counts: &[i64]) -> f64 {
    if daily_counts.is_empty() {
        return 0.0;
    }
    let total: i64 = daily_counts.iter().sum();
    total as f64 / daily_counts.len() as f64
}

pub const DATE_FORMATS: [&str; 2] = ["%d.%m.%Y", "%Y-%m-%d"];

/// Parses `DD.MM.YYYY`, falling back to `YYYY-MM-DD`.
pub fn parse_calendar_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
}

/// Monetary amounts must be finite and not negative.
pub fn checked_amount(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Parses an amount written with `.` or a single decimal `,` (`199,50`).
/// A comma followed by three digits reads as a thousands separator and is
/// rejected.
pub fn parse_amount(input: &str) -> Option<f64> {
    let input = input.trim();
    let normalized = match input.split_once(',') {
        None => input.to_string(),
        Some((whole, decimals))
            if !input.contains('.')
                && !decimals.contains(',')
                && (1..=2).contains(&decimals.len())
                && decimals.bytes().all(|b| b.is_ascii_digit()) =>
        {
            format!("{whole}.{decimals}")
        }
        Some(_) => return None,
    };
    normalized.parse::<f64>().ok().and_then(checked_amount)
}
