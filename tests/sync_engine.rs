//! End-to-end coverage of the receiver -> parser -> catalog pipeline
//! through a real `SyncEngine::run` pass against seeded SQLite fixtures.
//! No network access; everything lives on temp files cleaned up on drop.

use catalog_sync::catalog::CatalogWriter;
use catalog_sync::parsers::text::RussianTextNormalizer;
use catalog_sync::parsers::ParserRegistry;
use catalog_sync::receiver::ReceiverReader;
use catalog_sync::sync::SyncEngine;
use rusqlite::Connection;
use tempfile::NamedTempFile;

fn seed_receiver(path: &str) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE run_artifacts (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            source TEXT,
            parser_name TEXT NOT NULL,
            ingested_at TEXT NOT NULL
        );
        CREATE TABLE run_artifact_products (
            id INTEGER PRIMARY KEY,
            artifact_id INTEGER NOT NULL,
            sku TEXT,
            plu TEXT,
            title TEXT,
            composition TEXT,
            brand TEXT,
            unit TEXT,
            available_count REAL,
            package_quantity REAL,
            package_unit TEXT,
            categories_uid_json TEXT,
            main_image TEXT,
            sort_order INTEGER
        );
        CREATE TABLE run_artifact_categories (
            id INTEGER PRIMARY KEY,
            artifact_id INTEGER,
            uid TEXT,
            title TEXT,
            parent_uid TEXT,
            depth INTEGER,
            sort_order INTEGER
        );
        CREATE TABLE run_artifact_administrative_units (
            id INTEGER PRIMARY KEY,
            artifact_id INTEGER,
            name TEXT,
            region TEXT,
            country TEXT,
            latitude REAL,
            longitude REAL
        );
        CREATE TABLE run_artifact_product_images (
            id INTEGER PRIMARY KEY,
            product_id INTEGER,
            url TEXT,
            sort_order INTEGER,
            is_main INTEGER
        );

        INSERT INTO run_artifacts (id, run_id, source, parser_name, ingested_at) VALUES
            (1, 'run-1', 'receiver', 'fixprice', '2024-01-01T00:00:00+00:00'),
            (2, 'run-2', 'receiver', 'fixprice', '2024-01-02T00:00:00+00:00'),
            (3, 'run-3', 'receiver', 'fixprice', '2024-01-03T00:00:00+00:00');

        INSERT INTO run_artifact_administrative_units (artifact_id, name, region, country, latitude, longitude)
        VALUES (1, 'Moscow', 'Moscow Oblast', 'Russia', 55.75, 37.62);

        INSERT INTO run_artifact_products
            (id, artifact_id, sku, plu, title, composition, brand, unit, available_count,
             package_quantity, package_unit, categories_uid_json, main_image)
        VALUES
            (10, 1, 'SKU-1', 'PLU-1', 'Молоко 3.2% 1л', 'молоко', 'Братья Чебурашкины', 'pcs', 12,
             1, 'l', '[]', 'https://img.example.com/api/images/milk-1.jpg'),
            (11, 2, 'SKU-1', 'PLU-1', 'Молоко 3.2% 1л', NULL, NULL, 'pcs', 8,
             NULL, NULL, '[]', 'https://img.example.com/api/images/milk-1.jpg'),
            (12, 3, 'SKU-2', 'PLU-2', 'Хлеб бородинский', 'рожь, вода, соль', 'Каравай', 'pcs', 20,
             1, 'pcs', '[]', 'https://img.example.com/api/images/bread-1.jpg');

        INSERT INTO run_artifact_product_images (product_id, url, sort_order, is_main)
        VALUES (10, 'https://img.example.com/api/images/milk-1.jpg', 0, 1),
               (10, 'https://img.example.com/api/images/milk-1.jpg', 1, 0);
        "#,
    )
    .unwrap();
}

#[tokio::test]
async fn full_batch_resolves_identity_backfills_and_dedupes_images() {
    let receiver_file = NamedTempFile::new().unwrap();
    let receiver_path = receiver_file.path().to_str().unwrap().to_string();
    seed_receiver(&receiver_path);

    let catalog_file = NamedTempFile::new().unwrap();
    let catalog_path = catalog_file.path().to_str().unwrap().to_string();

    let receiver = ReceiverReader::open(&receiver_path).unwrap();
    let mut catalog = CatalogWriter::open(&catalog_path).unwrap();
    let registry = ParserRegistry::with_default_handlers();
    let normalizer = RussianTextNormalizer::new();

    let mut engine = SyncEngine::new(&receiver, &mut catalog, &registry, &normalizer, None, "fixprice");
    let outcome = engine.run(10, 0, None).await.unwrap();

    assert_eq!(outcome.batches, 1);
    assert_eq!(outcome.records, 3);
    assert!(outcome.wm_ingested_at.is_some());

    let inner = catalog.connection();

    // The two observations sharing sku/plu 'SKU-1'/'PLU-1' resolve to one
    // canonical product row, not two.
    let distinct_canonical: i64 = inner
        .query_row(
            "SELECT COUNT(DISTINCT canonical_product_id) FROM catalog_products WHERE source_id IN ('10', '11')",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(distinct_canonical, 1);

    // observed_at on the merged projection should reflect the later batch.
    let rows: i64 = inner.query_row("SELECT COUNT(*) FROM catalog_products", [], |row| row.get(0)).unwrap();
    assert_eq!(rows, 3);

    // The duplicate image URL within product 10's own record collapses to
    // one fingerprint row.
    let fingerprint_rows: i64 =
        inner.query_row("SELECT COUNT(*) FROM catalog_image_fingerprints", [], |row| row.get(0)).unwrap();
    assert_eq!(fingerprint_rows, 2);

    // The settlement row from the administrative unit on artifact 1 is present.
    let settlements: i64 = inner.query_row("SELECT COUNT(*) FROM catalog_settlements", [], |row| row.get(0)).unwrap();
    assert_eq!(settlements, 1);
}

#[tokio::test]
async fn second_run_with_no_new_rows_is_a_single_empty_batch() {
    let receiver_file = NamedTempFile::new().unwrap();
    let receiver_path = receiver_file.path().to_str().unwrap().to_string();
    seed_receiver(&receiver_path);

    let catalog_file = NamedTempFile::new().unwrap();
    let catalog_path = catalog_file.path().to_str().unwrap().to_string();

    let receiver = ReceiverReader::open(&receiver_path).unwrap();
    let mut catalog = CatalogWriter::open(&catalog_path).unwrap();
    let registry = ParserRegistry::with_default_handlers();
    let normalizer = RussianTextNormalizer::new();

    {
        let mut engine = SyncEngine::new(&receiver, &mut catalog, &registry, &normalizer, None, "fixprice");
        let first = engine.run(10, 0, None).await.unwrap();
        assert_eq!(first.records, 3);
    }

    let mut engine = SyncEngine::new(&receiver, &mut catalog, &registry, &normalizer, None, "fixprice");
    let second = engine.run(10, 0, None).await.unwrap();
    assert_eq!(second.batches, 0);
    assert_eq!(second.records, 0);
}

#[tokio::test]
async fn batch_size_one_pages_through_in_multiple_batches() {
    let receiver_file = NamedTempFile::new().unwrap();
    let receiver_path = receiver_file.path().to_str().unwrap().to_string();
    seed_receiver(&receiver_path);

    let catalog_file = NamedTempFile::new().unwrap();
    let catalog_path = catalog_file.path().to_str().unwrap().to_string();

    let receiver = ReceiverReader::open(&receiver_path).unwrap();
    let mut catalog = CatalogWriter::open(&catalog_path).unwrap();
    let registry = ParserRegistry::with_default_handlers();
    let normalizer = RussianTextNormalizer::new();

    let mut engine = SyncEngine::new(&receiver, &mut catalog, &registry, &normalizer, None, "fixprice");
    let outcome = engine.run(1, 0, None).await.unwrap();

    assert_eq!(outcome.batches, 3);
    assert_eq!(outcome.records, 3);
}
