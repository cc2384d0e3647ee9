//! Reads the first sheet of an uploaded workbook or CSV file into header and
//! data rows.

use std::collections::HashMap;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;

use crate::ImportError;

pub const ACCEPTED_EXTENSIONS: [&str; 6] = ["xlsx", "xlsm", "xlsb", "xls", "ods", "csv"];

/// A single cell as it came out of the source file.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetCell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl SheetCell {
    pub fn is_empty(&self) -> bool {
        match self {
            SheetCell::Empty => true,
            SheetCell::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    fn header_text(&self) -> String {
        match self {
            SheetCell::Empty => String::new(),
            SheetCell::Text(text) => text.trim().to_string(),
            SheetCell::Number(n) if n.fract() == 0.0 => format!("{n:.0}"),
            SheetCell::Number(n) => n.to_string(),
            SheetCell::Bool(b) => b.to_string(),
            SheetCell::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    /// 1-based line in the source file.
    pub number: usize,
    pub cells: Vec<SheetCell>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<SheetRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetFormat {
    Csv,
    Workbook,
}

impl SheetFormat {
    /// Picks the reader from the file extension, rejecting anything that is
    /// not a spreadsheet before a byte is parsed.
    pub fn from_file_name(file_name: &str) -> Result<Self, ImportError> {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(SheetFormat::Csv),
            ext if ACCEPTED_EXTENSIONS.contains(&ext) => Ok(SheetFormat::Workbook),
            _ => Err(ImportError::UnsupportedFileType(file_name.to_string())),
        }
    }
}

pub fn read_sheet(file_name: &str, bytes: Vec<u8>) -> Result<Sheet, ImportError> {
    let rows = match SheetFormat::from_file_name(file_name)? {
        SheetFormat::Csv => read_csv_rows(&bytes)?,
        SheetFormat::Workbook => read_workbook_rows(bytes)?,
    };
    into_sheet(rows)
}

fn into_sheet(rows: Vec<Vec<SheetCell>>) -> Result<Sheet, ImportError> {
    let mut numbered = rows
        .into_iter()
        .enumerate()
        .filter(|(_, cells)| !cells.iter().all(SheetCell::is_empty))
        .map(|(idx, cells)| SheetRow {
            number: idx + 1,
            cells,
        });

    let header_row = numbered.next().ok_or(ImportError::EmptyWorkbook)?;
    let headers = dedupe_headers(header_row.cells.iter().map(SheetCell::header_text).collect());
    Ok(Sheet {
        headers,
        rows: numbered.collect(),
    })
}

/// Renames repeated headers to `Name.1`, `Name.2`, ... in order of appearance.
pub fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .into_iter()
        .map(|header| {
            let count = seen.entry(header.clone()).or_insert(0);
            let name = if *count == 0 || header.is_empty() {
                header.clone()
            } else {
                format!("{header}.{count}")
            };
            *count += 1;
            name
        })
        .collect()
}

fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text.lines().next().unwrap_or_default();
    let semicolons = first_line.matches(';').count();
    let commas = first_line.matches(',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn read_csv_rows(bytes: &[u8]) -> Result<Vec<Vec<SheetCell>>, ImportError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let delimiter = sniff_delimiter(&String::from_utf8_lossy(bytes));
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|value| {
                    if value.trim().is_empty() {
                        SheetCell::Empty
                    } else {
                        SheetCell::Text(value.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(rows)
}

fn read_workbook_rows(bytes: Vec<u8>) -> Result<Vec<Vec<SheetCell>>, ImportError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(ImportError::EmptyWorkbook)??;
    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_from_data).collect())
        .collect())
}

fn cell_from_data(cell: &Data) -> SheetCell {
    match cell {
        Data::Empty | Data::Error(_) => SheetCell::Empty,
        Data::String(s) if s.trim().is_empty() => SheetCell::Empty,
        Data::String(s) => SheetCell::Text(s.clone()),
        Data::Float(f) => SheetCell::Number(*f),
        Data::Int(i) => SheetCell::Number(*i as f64),
        Data::Bool(b) => SheetCell::Bool(*b),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|value| SheetCell::Date(value.date()))
            .unwrap_or(SheetCell::Empty),
        Data::DateTimeIso(s) => s
            .get(..10)
            .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
            .map(SheetCell::Date)
            .unwrap_or_else(|| SheetCell::Text(s.clone())),
        Data::DurationIso(s) => SheetCell::Text(s.clone()),
    }
}
