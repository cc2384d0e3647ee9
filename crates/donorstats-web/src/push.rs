//! Validation of single-agreement push payloads.
//!
//! Payloads use the legacy field names (`name_id`, `agreement_number`, ...)
//! grouped into `name` and `agreement` objects.

use donorstats_core::{
    checked_amount, parse_amount, parse_calendar_date, AgreementField, FieldValue, RecordFragment,
};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("Request body must be a JSON object")]
    NotAnObject,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for field: {0}")]
    InvalidField(&'static str),
}

type Object = Map<String, Value>;

fn object<'a>(parent: &'a Object, key: &str, path: &'static str) -> Result<&'a Object, PushError> {
    match parent.get(key) {
        None | Some(Value::Null) => Err(PushError::MissingField(path)),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(PushError::InvalidField(path)),
    }
}

fn present<'a>(parent: &'a Object, key: &str) -> Option<&'a Value> {
    match parent.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(value) => Some(value),
    }
}

fn required<'a>(parent: &'a Object, key: &str, path: &'static str) -> Result<&'a Value, PushError> {
    present(parent, key).ok_or(PushError::MissingField(path))
}

fn as_text(value: &Value, path: &'static str) -> Result<String, PushError> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(PushError::InvalidField(path)),
    }
}

fn as_integer(value: &Value, path: &'static str) -> Result<i64, PushError> {
    let parsed = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or(PushError::InvalidField(path))
}

fn as_amount(value: &Value, path: &'static str) -> Result<f64, PushError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64().and_then(checked_amount),
        Value::String(s) => parse_amount(s),
        _ => None,
    };
    parsed.ok_or(PushError::InvalidField(path))
}

/// Turns a push payload into a record fragment. Every required field must be
/// present and well-formed; an unparseable start date is rejected here rather
/// than stored as absent.
pub fn parse_push(payload: &Value) -> Result<RecordFragment, PushError> {
    let root = payload.as_object().ok_or(PushError::NotAnObject)?;
    let name = object(root, "name", "name")?;
    let agreement = object(root, "agreement", "agreement")?;

    let campaign_id = as_integer(required(root, "campaign_id", "campaign_id")?, "campaign_id")?;
    let payment_method = as_text(required(root, "payment_method", "payment_method")?, "payment_method")?;
    let classification = as_text(
        required(root, "classification_id_success", "classification_id_success")?,
        "classification_id_success",
    )?;

    let person_id = as_integer(required(name, "name_id", "name.name_id")?, "name.name_id")?;
    if person_id <= 0 {
        return Err(PushError::InvalidField("name.name_id"));
    }
    let zip_code = as_text(required(name, "zip_code", "name.zip_code")?, "name.zip_code")?;
    let country = as_text(required(name, "country_id", "name.country_id")?, "name.country_id")?;
    let name_type = as_text(required(name, "nametype_id", "name.nametype_id")?, "name.nametype_id")?;

    let agreement_number = as_text(
        required(agreement, "agreement_number", "agreement.agreement_number")?,
        "agreement.agreement_number",
    )?;
    let product_type = as_text(
        required(agreement, "producttype_id", "agreement.producttype_id")?,
        "agreement.producttype_id",
    )?;
    let project_id = as_integer(
        required(agreement, "project_id", "agreement.project_id")?,
        "agreement.project_id",
    )?;
    let amount = as_amount(required(agreement, "amount", "agreement.amount")?, "agreement.amount")?;
    let interval = as_text(required(agreement, "interval", "agreement.interval")?, "agreement.interval")?;
    let start_date = required(agreement, "startdate", "agreement.startdate")?
        .as_str()
        .and_then(parse_calendar_date)
        .ok_or(PushError::InvalidField("agreement.startdate"))?;

    let mut fragment = RecordFragment::new()
        .with(AgreementField::CampaignId, FieldValue::Integer(campaign_id))
        .with(AgreementField::PaymentMethod, FieldValue::Text(payment_method))
        .with(AgreementField::SuccessClassification, FieldValue::Text(classification))
        .with(AgreementField::PersonId, FieldValue::Integer(person_id))
        .with(AgreementField::PostalCode, FieldValue::Text(zip_code))
        .with(AgreementField::CountryCode, FieldValue::Text(country))
        .with(AgreementField::NameType, FieldValue::Text(name_type))
        .with(AgreementField::AgreementId, FieldValue::Text(agreement_number))
        .with(AgreementField::ProductType, FieldValue::Text(product_type))
        .with(AgreementField::ProjectId, FieldValue::Integer(project_id))
        .with(AgreementField::Amount, FieldValue::Float(amount))
        .with(AgreementField::PaymentInterval, FieldValue::Text(interval))
        .with(AgreementField::StartDate, FieldValue::Date(start_date));

    if agreement.contains_key("productvariant_id") {
        let variant = present(agreement, "productvariant_id")
            .map(|value| as_integer(value, "agreement.productvariant_id"))
            .transpose()?;
        fragment.set(AgreementField::ProductVariantId, variant.map(FieldValue::Integer));
    }
    Ok(fragment)
}
