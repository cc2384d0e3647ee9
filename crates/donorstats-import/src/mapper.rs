//! Header allow-list: maps spreadsheet columns onto agreement fields.

use std::collections::BTreeMap;

use donorstats_core::AgreementField;
use tracing::debug;

use crate::spreadsheet::SheetCell;

/// One recognized column: the Norwegian export header and its English alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSpec {
    pub header: &'static str,
    pub alias: &'static str,
    pub field: AgreementField,
}

impl HeaderSpec {
    /// Trimmed, case-insensitive match that also folds Æ/Ø/Å.
    fn matches(&self, header: &str) -> bool {
        let header = header.trim().to_lowercase();
        header == self.header.to_lowercase() || header == self.alias.to_lowercase()
    }
}

const fn recognized(header: &'static str, alias: &'static str, field: AgreementField) -> HeaderSpec {
    HeaderSpec {
        header,
        alias,
        field,
    }
}

pub const RECOGNIZED_HEADERS: [HeaderSpec; 29] = [
    recognized("Navnenr", "Name number", AgreementField::PersonId),
    recognized("Register", "Register", AgreementField::Register),
    recognized("Register.1", "Register.1", AgreementField::Register1),
    recognized("Avtalenummer", "Agreement number", AgreementField::AgreementId),
    recognized("Postnummer", "Postal code", AgreementField::PostalCode),
    recognized("Poststed", "Postal place", AgreementField::PostalPlace),
    recognized("Kommune", "Municipality", AgreementField::Municipality),
    recognized("Fylke", "County", AgreementField::County),
    recognized("Landkode", "Country code", AgreementField::CountryCode),
    recognized("Land", "Country", AgreementField::Country),
    recognized("Navnetype", "Name type", AgreementField::NameType),
    recognized("Fødselsår/startår", "Birth or start year", AgreementField::BirthOrStartYear),
    recognized("Produktkode", "Product code", AgreementField::ProductCode),
    recognized("Produkttype", "Product type", AgreementField::ProductType),
    recognized("Prosjektnummer", "Project number", AgreementField::ProjectId),
    recognized("Produkt", "Product", AgreementField::ProductName),
    recognized("Prosjektnavn", "Project name", AgreementField::ProjectName),
    recognized("Startdato", "Start date", AgreementField::StartDate),
    recognized("Betalingsmåte", "Payment method", AgreementField::PaymentMethod),
    recognized("Girorytme", "Giro rhythm", AgreementField::GiroInterval),
    recognized("Betalingsrytme", "Payment rhythm", AgreementField::PaymentInterval),
    recognized("Beløp", "Amount", AgreementField::Amount),
    recognized("Aksjonstype", "Action type", AgreementField::ActionType),
    recognized("Aksjonstype beskrivelse", "Action type description", AgreementField::ActionTypeDescription),
    recognized("Aksjonsnummer", "Action number", AgreementField::ActionNumber),
    recognized("Aksjonsnavn", "Action name", AgreementField::ActionName),
    recognized("Avtaletype", "Agreement type", AgreementField::AgreementType),
    recognized("Periode beløp", "Period amount", AgreementField::PeriodAmount),
    recognized("Opprettet dato", "Created date", AgreementField::CreatedDate),
];

pub fn lookup_header(header: &str) -> Option<&'static HeaderSpec> {
    RECOGNIZED_HEADERS.iter().find(|known| known.matches(header))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedColumn {
    pub index: usize,
    pub header: String,
    pub field: AgreementField,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    pub columns: Vec<MappedColumn>,
    pub dropped: Vec<String>,
}

/// Keeps the recognized headers; everything else is dropped. When two
/// headers resolve to the same field the leftmost wins.
pub fn map_headers(headers: &[String]) -> ColumnMapping {
    let mut mapping = ColumnMapping::default();
    for (index, header) in headers.iter().enumerate() {
        let field = lookup_header(header)
            .map(|known| known.field)
            .filter(|field| !mapping.columns.iter().any(|c| c.field == *field));
        match field {
            Some(field) => mapping.columns.push(MappedColumn {
                index,
                header: header.clone(),
                field,
            }),
            None => {
                debug!(header = %header, "dropping unrecognized column");
                mapping.dropped.push(header.clone());
            }
        }
    }
    mapping
}

impl ColumnMapping {
    pub fn fields(&self) -> impl Iterator<Item = AgreementField> + '_ {
        self.columns.iter().map(|c| c.field)
    }

    /// Header to legacy field name, for the mapped columns that have one.
    pub fn legacy_columns(&self) -> Vec<(&str, &'static str)> {
        self.columns
            .iter()
            .filter_map(|c| c.field.legacy_name().map(|legacy| (c.header.as_str(), legacy)))
            .collect()
    }

    /// Picks the mapped cells out of a row. Short rows yield empty cells.
    pub fn map_row(&self, cells: &[SheetCell]) -> BTreeMap<AgreementField, SheetCell> {
        self.columns
            .iter()
            .map(|column| {
                let cell = cells.get(column.index).cloned().unwrap_or(SheetCell::Empty);
                (column.field, cell)
            })
            .collect()
    }
}
