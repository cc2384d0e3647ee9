//! Spreadsheet import pipeline: read, map headers, normalize rows, reconcile
//! against the record store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use donorstats_storage::{RecordStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub mod mapper;
pub mod normalize;
pub mod reconcile;
pub mod sample;
pub mod spreadsheet;

pub use mapper::{map_headers, ColumnMapping, HeaderSpec, MappedColumn, RECOGNIZED_HEADERS};
pub use normalize::RowNormalizer;
pub use reconcile::{ImportConfig, ImportReconciler, ImportRow, ImportSummary};
pub use sample::{seed_sample_data, SeedReport};
pub use spreadsheet::{read_sheet, Sheet, SheetCell, SheetFormat, ACCEPTED_EXTENSIONS};

pub const CRATE_NAME: &str = "donorstats-import";

/// Failures that stop an import before any row is reconciled.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unsupported file type: {0} (expected one of xlsx, xlsm, xlsb, xls, ods, csv)")]
    UnsupportedFileType(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("failed to parse csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("the file contains no header row")]
    EmptyWorkbook,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ImportError {
    /// True when the uploaded file itself is at fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ImportError::Store(_) | ImportError::Io { .. })
    }
}

/// Runs the whole pipeline for one file.
pub struct Importer {
    reconciler: ImportReconciler,
}

impl Importer {
    pub fn new(store: Arc<dyn RecordStore>, config: ImportConfig) -> Self {
        Self {
            reconciler: ImportReconciler::new(store, config),
        }
    }

    pub async fn import_file(&self, path: &Path) -> Result<ImportSummary, ImportError> {
        let file_name = path.to_string_lossy().to_string();
        SheetFormat::from_file_name(&file_name)?;
        let bytes = tokio::fs::read(path).await.map_err(|source| ImportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.import_bytes(&file_name, bytes).await
    }

    pub async fn import_bytes(&self, file_name: &str, bytes: Vec<u8>) -> Result<ImportSummary, ImportError> {
        self.import_bytes_with(file_name, bytes, RowNormalizer::new()).await
    }

    /// Same as [`Importer::import_bytes`] with a caller-supplied normalizer.
    pub async fn import_bytes_with(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        mut normalizer: RowNormalizer,
    ) -> Result<ImportSummary, ImportError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import", %run_id, source = %file_name);
        async move {
            let sheet = read_sheet(file_name, bytes)?;
            let mapping = map_headers(&sheet.headers);
            info!(
                rows = sheet.rows.len(),
                mapped = mapping.columns.len(),
                dropped = mapping.dropped.len(),
                "spreadsheet read"
            );
            debug!(legacy = ?mapping.legacy_columns(), "legacy field names");

            let rows = sheet
                .rows
                .iter()
                .map(|row| ImportRow {
                    number: row.number,
                    fields: normalizer.normalize(&mapping.map_row(&row.cells)),
                })
                .collect();
            let summary = self.reconciler.reconcile(run_id, rows).await?;
            Ok::<_, ImportError>(summary)
        }
        .instrument(span)
        .await
    }
}
