use std::sync::Arc;

use chrono::NaiveDate;
use donorstats_core::AgreementField;
use donorstats_import::{ImportConfig, ImportError, Importer};
use donorstats_storage::{new_donors_on, region_breakdown, MemoryRecordStore};

const EXPORT: &str = "\
Navnenr,Register,Register,Avtalenummer,Postnummer,Fylke,Produkttype,Beløp,Startdato,Betalingsrytme,Notat
1001,A,B,500001,0150,Oslo,FG,200,01.03.2025,Monthly,call back
1002,A,B,500002,4006,rogaland,MI,N/A,2025-03-01,Monthly,
1003,A,B,500003,5003,Hordaland,FG,150,2025/03/01,Yearly,
,A,B,500004,0150,Oslo,FG,100,01.03.2025,Monthly,
1005,A,B,500005,0150,Oslo,GAVE,100,01.03.2025,Monthly,
";

fn write_fixture(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn csv_export_is_imported_and_queryable() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(&dir, "export.csv", EXPORT);
    let store = MemoryRecordStore::new();
    let importer = Importer::new(Arc::new(store.clone()), ImportConfig::default());

    let summary = importer.import_file(&path).await.unwrap();

    assert_eq!((summary.added, summary.updated, summary.skipped), (3, 0, 2));
    assert_eq!(summary.details.len(), 2);

    let stored = store.agreements().await;
    let by_agreement = |id: &str| {
        stored
            .iter()
            .find(|a| a.fields.agreement_id() == Some(id))
            .unwrap()
    };
    let first = by_agreement("500001");
    assert_eq!(first.fields.text(AgreementField::Register), Some("A"));
    assert_eq!(first.fields.text(AgreementField::Register1), Some("B"));
    assert_eq!(first.fields.text(AgreementField::PostalCode), Some("0150"));
    assert_eq!(by_agreement("500002").fields.amount(), None);
    assert_eq!(by_agreement("500003").fields.start_date(), None);

    let march_first = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
    assert_eq!(new_donors_on(&store, march_first).await.unwrap().len(), 2);

    let regions = region_breakdown(&store).await.unwrap();
    let names: Vec<_> = regions.iter().map(|r| r.region.as_str()).collect();
    assert_eq!(names, vec!["Oslo", "Rogaland", "Vestland"]);
}

#[tokio::test]
async fn importing_the_same_file_twice_only_updates() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(&dir, "export.csv", EXPORT);
    let store = MemoryRecordStore::new();
    let importer = Importer::new(Arc::new(store.clone()), ImportConfig::default());

    importer.import_file(&path).await.unwrap();
    let again = importer.import_file(&path).await.unwrap();

    assert_eq!((again.added, again.updated, again.skipped), (0, 3, 2));
    assert_eq!(store.agreements().await.len(), 3);
}

#[tokio::test]
async fn non_spreadsheet_files_fail_the_whole_import() {
    let dir = tempfile::tempdir().unwrap();
    let importer = Importer::new(Arc::new(MemoryRecordStore::new()), ImportConfig::default());

    let text = write_fixture(&dir, "export.txt", EXPORT);
    assert!(matches!(
        importer.import_file(&text).await,
        Err(ImportError::UnsupportedFileType(_))
    ));

    let broken = write_fixture(&dir, "export.xlsx", "definitely not a workbook");
    assert!(matches!(
        importer.import_file(&broken).await,
        Err(ImportError::Workbook(_))
    ));

    let missing = dir.path().join("missing.csv");
    assert!(matches!(
        importer.import_file(&missing).await,
        Err(ImportError::Io { .. })
    ));
}
