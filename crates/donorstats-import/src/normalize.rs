//! Type coercion of mapped spreadsheet cells into record fragments.

use std::collections::BTreeMap;

use donorstats_core::{
    checked_amount, parse_amount, parse_calendar_date, AgreementField, FieldKind, FieldValue,
    RecordFragment,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::spreadsheet::SheetCell;

pub const DEFAULT_SUCCESS_CLASSIFICATION: &str = "S1";

/// Placeholder campaign ids are drawn from this range.
pub const PLACEHOLDER_CAMPAIGNS: std::ops::RangeInclusive<i64> = 1..=10;

pub struct RowNormalizer {
    rng: StdRng,
}

impl Default for RowNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RowNormalizer {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic placeholder campaign ids.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn normalize(&mut self, row: &BTreeMap<AgreementField, SheetCell>) -> RecordFragment {
        let mut fragment = RecordFragment::new();
        for (field, cell) in row {
            fragment.set(*field, coerce(*field, cell));
        }
        self.apply_defaults(&mut fragment);
        fragment
    }

    pub fn apply_defaults(&mut self, fragment: &mut RecordFragment) {
        if fragment.integer(AgreementField::CampaignId).is_none() {
            let campaign = self.rng.gen_range(PLACEHOLDER_CAMPAIGNS);
            fragment.set(AgreementField::CampaignId, Some(FieldValue::Integer(campaign)));
        }
        if fragment.text(AgreementField::SuccessClassification).is_none() {
            fragment.set(
                AgreementField::SuccessClassification,
                Some(FieldValue::Text(DEFAULT_SUCCESS_CLASSIFICATION.to_string())),
            );
        }
    }
}

/// Converts one cell to the field's kind. Anything that does not convert
/// cleanly is `None`.
pub fn coerce(field: AgreementField, cell: &SheetCell) -> Option<FieldValue> {
    if cell.is_empty() {
        return None;
    }
    match field.kind() {
        FieldKind::Integer => {
            let value = coerce_integer(cell)?;
            if field == AgreementField::PersonId && value <= 0 {
                return None;
            }
            Some(FieldValue::Integer(value))
        }
        FieldKind::Float => coerce_amount(cell).map(FieldValue::Float),
        FieldKind::Date => coerce_date(cell).map(FieldValue::Date),
        FieldKind::Text => Some(FieldValue::Text(stringify(cell))),
    }
}

fn coerce_integer(cell: &SheetCell) -> Option<i64> {
    match cell {
        SheetCell::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
            Some(*n as i64)
        }
        SheetCell::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_amount(cell: &SheetCell) -> Option<f64> {
    match cell {
        SheetCell::Number(n) => checked_amount(*n),
        SheetCell::Text(text) => parse_amount(text),
        _ => None,
    }
}

fn coerce_date(cell: &SheetCell) -> Option<chrono::NaiveDate> {
    match cell {
        SheetCell::Date(date) => Some(*date),
        SheetCell::Text(text) => parse_calendar_date(text),
        _ => None,
    }
}

fn stringify(cell: &SheetCell) -> String {
    match cell {
        SheetCell::Empty => String::new(),
        SheetCell::Text(text) => text.clone(),
        SheetCell::Number(n) if n.fract() == 0.0 => format!("{n:.0}"),
        SheetCell::Number(n) => n.to_string(),
        SheetCell::Bool(true) => "TRUE".to_string(),
        SheetCell::Bool(false) => "FALSE".to_string(),
        SheetCell::Date(date) => date.format("%Y-%m-%d").to_string(),
    }
}
