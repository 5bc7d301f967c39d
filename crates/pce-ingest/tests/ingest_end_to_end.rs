//! End-to-end ingest → enrich → commit → export flow against a file-backed
//! store, using the offline enricher.

use pce_core::{ProductRecord, SHORT_DESCRIPTION_FIELD};
use pce_enrich::TemplateEnricher;
use pce_ingest::{export_csv, IngestConfig, IngestPipeline};
use pce_store::{CatalogStore, FailClosedStore, SqliteCatalogStore};

fn config() -> IngestConfig {
    IngestConfig {
        batch_limit: 0,
        ..IngestConfig::default()
    }
}

#[tokio::test]
async fn upload_commit_reupload_and_export() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("catalog.db");
    let input = dir.path().join("upload.csv");
    std::fs::write(
        &input,
        "Item Description,Price,Category\nRed Mug,12,kitchen\nBlue Plate,8,kitchen\n",
    )
    .expect("write upload");

    let mut pipeline = IngestPipeline::new(
        Box::new(FailClosedStore::open(&db_path)),
        Box::new(TemplateEnricher),
        config(),
    );
    let first = pipeline.run(&input).await.expect("first run");
    assert_eq!(first.inserted, 2);
    assert_eq!(first.duplicates_at_filter, 0);
    assert!(!first.store_degraded);

    // Committed records carry the generated fields.
    let store = SqliteCatalogStore::open(&db_path).expect("reopen store");
    let all = store.get_all().expect("scan");
    assert_eq!(all.len(), 2);
    assert!(all
        .iter()
        .all(|record| record.fields.contains_key(SHORT_DESCRIPTION_FIELD)));

    // Re-uploading the same file inserts nothing.
    let mut pipeline = IngestPipeline::new(
        Box::new(FailClosedStore::open(&db_path)),
        Box::new(TemplateEnricher),
        config(),
    );
    let second = pipeline.run(&input).await.expect("second run");
    assert_eq!(second.inserted, 0);
    assert_eq!(second.duplicates_at_filter, 2);

    let out = dir.path().join("snapshot.csv");
    let report = export_csv(&store, "Item Description", &out).expect("export");
    assert_eq!(report.rows, 2);
    let snapshot = std::fs::read_to_string(&out).expect("read snapshot");
    assert!(snapshot.lines().next().unwrap().starts_with("Item Description,"));
    assert!(snapshot.contains("Red Mug"));
}

#[tokio::test]
async fn column_rename_is_visible_in_the_next_export() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("catalog.db");

    let mut store = SqliteCatalogStore::open(&db_path).expect("store");
    store
        .insert(&ProductRecord::new("red mug").with_field("Price", 12))
        .expect("insert");
    store.rename_field("Price", "unit_price").expect("rename");

    let out = dir.path().join("snapshot.csv");
    export_csv(&store, "Item Description", &out).expect("export");
    let snapshot = std::fs::read_to_string(&out).expect("read snapshot");
    assert_eq!(
        snapshot.lines().next(),
        Some("Item Description,unit_price")
    );
    assert!(!snapshot.contains("Price,"));
}
