//! `CatalogWriter`: schema ownership, the per-batch upsert transaction and
//! the receiver cursor.
//!
//! Identity resolution, image-fingerprint dedup, back-fill and the
//! non-destructive merge-on-conflict projection update all run inside one
//! transaction per batch (see DESIGN.md for the grounding notes).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::{is_missing_str, non_blank, NormalizedRecord, PackageUnit, Unit};
use crate::error::{Result, SchemaError};

pub struct CatalogWriter {
    conn: Connection,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    pub duplicate_image_urls: Vec<String>,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn stable_id(namespace: &str, key: &str) -> String {
    format!("{namespace}:{}", &sha256_hex(key)[..24])
}

fn category_id(parser_name: &str, uid: Option<&str>, title: &str) -> String {
    match uid.map(str::trim).filter(|u| !u.is_empty()) {
        Some(u) => format!("{parser_name}:uid:{u}"),
        None => {
            let normalized = title.trim().to_lowercase();
            let hash = sha256_hex(&normalized);
            format!("{parser_name}:title:{}", &hash[..40.min(hash.len())])
        }
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name.eq_ignore_ascii_case(column) {
            return Ok(true);
        }
    }
    Ok(false)
}

impl CatalogWriter {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let writer = Self { conn };
        writer.ensure_schema()?;
        Ok(writer)
    }

    #[cfg(test)]
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let writer = Self { conn };
        writer.ensure_schema()?;
        Ok(writer)
    }

    /// Raw connection access for diagnostics and test assertions.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Creates every contractual catalog table if absent, then verifies
    /// the two columns a pre-existing (older) catalog DB might lack.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_product_id TEXT NOT NULL,
                parser_name TEXT NOT NULL,
                source_id TEXT NOT NULL,
                title_original TEXT,
                title_normalized TEXT,
                title_original_no_stopwords TEXT,
                title_normalized_no_stopwords TEXT,
                brand TEXT,
                unit TEXT,
                available_count REAL,
                package_quantity REAL,
                package_unit TEXT,
                category_raw TEXT,
                category_normalized TEXT,
                primary_category_id TEXT,
                geo_raw TEXT,
                geo_normalized TEXT,
                settlement_id TEXT,
                composition_raw TEXT,
                composition_normalized TEXT,
                image_urls TEXT,
                duplicate_image_urls TEXT,
                image_fingerprints TEXT,
                observed_at TEXT NOT NULL,
                raw_payload TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(parser_name, source_id)
            );
            CREATE TABLE IF NOT EXISTS catalog_product_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_product_id TEXT NOT NULL,
                parser_name TEXT NOT NULL,
                source_id TEXT NOT NULL,
                title_original TEXT,
                title_normalized TEXT,
                title_original_no_stopwords TEXT,
                title_normalized_no_stopwords TEXT,
                brand TEXT,
                unit TEXT,
                available_count REAL,
                package_quantity REAL,
                package_unit TEXT,
                category_raw TEXT,
                category_normalized TEXT,
                geo_raw TEXT,
                geo_normalized TEXT,
                settlement_id TEXT,
                composition_raw TEXT,
                composition_normalized TEXT,
                image_urls TEXT,
                duplicate_image_urls TEXT,
                image_fingerprints TEXT,
                observed_at TEXT NOT NULL,
                raw_payload TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS catalog_product_sources (
                parser_name TEXT NOT NULL,
                source_id TEXT NOT NULL,
                canonical_product_id TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                latest_snapshot_id INTEGER,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (parser_name, source_id)
            );
            CREATE TABLE IF NOT EXISTS catalog_identity_map (
                parser_name TEXT NOT NULL,
                identity_type TEXT NOT NULL,
                identity_value TEXT NOT NULL,
                canonical_product_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (parser_name, identity_type, identity_value)
            );
            CREATE TABLE IF NOT EXISTS catalog_image_fingerprints (
                fingerprint TEXT PRIMARY KEY,
                canonical_url TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS catalog_settlements (
                id TEXT PRIMARY KEY,
                geo_key TEXT NOT NULL UNIQUE,
                name TEXT,
                region TEXT,
                country TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS catalog_settlement_geodata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                settlement_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(settlement_id, latitude, longitude)
            );
            CREATE TABLE IF NOT EXISTS catalog_categories (
                id TEXT PRIMARY KEY,
                parser_name TEXT NOT NULL,
                uid TEXT,
                title TEXT NOT NULL,
                parent_uid TEXT,
                depth INTEGER,
                sort_order INTEGER,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS catalog_product_category_links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_id INTEGER NOT NULL,
                category_id TEXT NOT NULL,
                sort_order INTEGER NOT NULL,
                is_primary INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS converter_sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        for column in ["primary_category_id", "settlement_id"] {
            if !has_column(&self.conn, "catalog_products", column)? {
                return Err(SchemaError::MissingColumn {
                    table: "catalog_products".to_string(),
                    column: column.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn upsert_many(&mut self, mut records: Vec<NormalizedRecord>) -> Result<UpsertOutcome> {
        let now = now_iso();
        let tx = self.conn.transaction()?;
        let mut duplicate_image_urls = Vec::new();

        for record in records.iter_mut() {
            let canonical_id = resolve_canonical_id(&tx, record)?;
            write_identity_candidates(&tx, record, &canonical_id, &now)?;
            record.canonical_product_id = Some(canonical_id.clone());

            duplicate_image_urls.extend(dedup_images(&tx, record, &now)?);

            backfill(&tx, &canonical_id, record)?;

            let settlement_id = upsert_settlement(&tx, record, &now)?;
            if let Some(sid) = &settlement_id {
                maybe_insert_geodata(&tx, sid, record, &now)?;
            }

            let category_ids = upsert_categories(&tx, &record.parser_name, record, &now)?;

            let snapshot_id = insert_snapshot(&tx, &canonical_id, record, settlement_id.as_deref(), &now)?;
            link_categories(&tx, snapshot_id, &category_ids)?;

            let adopted_canonical = upsert_source_row(&tx, &canonical_id, record, snapshot_id, &now)?;
            record.canonical_product_id = Some(adopted_canonical.clone());

            upsert_projection(&tx, &adopted_canonical, record, settlement_id.as_deref(), category_ids.first().cloned(), &now)?;
        }

        tx.commit()?;
        Ok(UpsertOutcome { duplicate_image_urls })
    }

    pub fn get_receiver_cursor(&self, parser: &str) -> Result<(Option<DateTime<Utc>>, Option<i64>)> {
        let key = format!("receiver_cursor:{}", parser.trim().to_lowercase());
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM converter_sync_state WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        let Some(raw) = raw else {
            return Ok((None, None));
        };
        let parsed: Option<Value> = serde_json::from_str(&raw).ok();
        let Some(Value::Object(obj)) = parsed else {
            return Ok((None, None));
        };
        let ingested_at = obj
            .get("ingested_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let product_id = obj.get("product_id").and_then(Value::as_i64);
        Ok((ingested_at, product_id))
    }

    pub fn set_receiver_cursor(&self, parser: &str, ingested_at: DateTime<Utc>, product_id: i64) -> Result<()> {
        let key = format!("receiver_cursor:{}", parser.trim().to_lowercase());
        let mut value = Map::new();
        value.insert("ingested_at".to_string(), Value::from(ingested_at.to_rfc3339()));
        value.insert("product_id".to_string(), Value::from(product_id));
        let payload = serde_json::to_string(&Value::Object(value))?;
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO converter_sync_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, payload, now],
        )?;
        Ok(())
    }
}

fn resolve_canonical_id(tx: &Transaction, record: &NormalizedRecord) -> Result<String> {
    for (identity_type, value) in record.identity_candidates() {
        if let Some(id) = tx
            .query_row(
                "SELECT canonical_product_id FROM catalog_identity_map
                 WHERE parser_name = ?1 AND identity_type = ?2 AND identity_value = ?3",
                params![record.parser_name, identity_type, value],
                |r| r.get::<_, String>(0),
            )
            .optional()?
        {
            return Ok(id);
        }
    }

    for candidate in [&record.title_normalized_no_stopwords, &record.title_normalized] {
        if candidate.trim().is_empty() {
            continue;
        }
        if let Some(id) = tx
            .query_row(
                "SELECT canonical_product_id FROM catalog_identity_map
                 WHERE parser_name = ?1 AND identity_type = 'normalized_name' AND identity_value = ?2",
                params![record.parser_name, candidate],
                |r| r.get::<_, String>(0),
            )
            .optional()?
        {
            return Ok(id);
        }
    }

    Ok(Uuid::new_v4().to_string())
}

fn write_identity_candidates(tx: &Transaction, record: &NormalizedRecord, canonical_id: &str, now: &str) -> Result<()> {
    let mut candidates = record.identity_candidates();
    for name_key in [&record.title_normalized_no_stopwords, &record.title_normalized] {
        if !name_key.trim().is_empty() {
            candidates.push(("normalized_name", name_key.clone()));
        }
    }
    for (identity_type, value) in candidates {
        tx.execute(
            "INSERT INTO catalog_identity_map (parser_name, identity_type, identity_value, canonical_product_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(parser_name, identity_type, identity_value) DO UPDATE SET
                canonical_product_id = excluded.canonical_product_id, updated_at = excluded.updated_at",
            params![record.parser_name, identity_type, value, canonical_id, now],
        )?;
    }
    Ok(())
}

/// Returns the URLs discarded as duplicates (candidates for storage
/// deletion); mutates `record.image_urls`/`image_fingerprints` to the
/// canonical, first-seen-order set.
fn dedup_images(tx: &Transaction, record: &mut NormalizedRecord, now: &str) -> Result<Vec<String>> {
    let mut canonical_urls = Vec::new();
    let mut fingerprints = Vec::new();
    let mut duplicates = Vec::new();
    let mut seen_this_record: HashSet<String> = HashSet::new();

    for url in &record.image_urls {
        if url.trim().is_empty() {
            continue;
        }
        let fingerprint = sha256_hex(url);
        if seen_this_record.contains(&fingerprint) {
            duplicates.push(url.clone());
            continue;
        }
        seen_this_record.insert(fingerprint.clone());

        let existing: Option<String> = tx
            .query_row(
                "SELECT canonical_url FROM catalog_image_fingerprints WHERE fingerprint = ?1",
                params![fingerprint],
                |r| r.get(0),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO catalog_image_fingerprints (fingerprint, canonical_url, updated_at) VALUES (?1, ?2, ?3)",
                    params![fingerprint, url, now],
                )?;
                canonical_urls.push(url.clone());
                fingerprints.push(fingerprint);
            }
            Some(canonical_url) => {
                tx.execute(
                    "UPDATE catalog_image_fingerprints SET updated_at = ?1 WHERE fingerprint = ?2",
                    params![now, fingerprint],
                )?;
                if &canonical_url != url {
                    duplicates.push(url.clone());
                }
                canonical_urls.push(canonical_url);
                fingerprints.push(fingerprint);
            }
        }
    }

    record.image_urls = canonical_urls;
    record.image_fingerprints = fingerprints;
    record.duplicate_image_urls = duplicates.clone();
    Ok(duplicates)
}

fn nearest_text_field(tx: &Transaction, canonical_id: &str, column: &str, target_observed_at: &DateTime<Utc>) -> Result<Option<String>> {
    let target = target_observed_at.to_rfc3339();
    let from_snapshots = tx
        .query_row(
            &format!(
                "SELECT {column} FROM catalog_product_snapshots
                 WHERE canonical_product_id = ?1 AND {column} IS NOT NULL AND TRIM({column}) != ''
                 ORDER BY ABS(julianday(observed_at) - julianday(?2)) LIMIT 1"
            ),
            params![canonical_id, target],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    if from_snapshots.is_some() {
        return Ok(from_snapshots);
    }
    tx.query_row(
        &format!(
            "SELECT {column} FROM catalog_products
             WHERE canonical_product_id = ?1 AND {column} IS NOT NULL AND TRIM({column}) != ''
             ORDER BY ABS(julianday(observed_at) - julianday(?2)) LIMIT 1"
        ),
        params![canonical_id, target],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

fn nearest_package(
    tx: &Transaction,
    canonical_id: &str,
    target_observed_at: &DateTime<Utc>,
) -> Result<Option<(f64, Option<String>)>> {
    let target = target_observed_at.to_rfc3339();
    let from_snapshots = tx
        .query_row(
            "SELECT package_quantity, package_unit FROM catalog_product_snapshots
             WHERE canonical_product_id = ?1 AND package_quantity IS NOT NULL
             ORDER BY ABS(julianday(observed_at) - julianday(?2)) LIMIT 1",
            params![canonical_id, target],
            |r| Ok((r.get::<_, f64>(0)?, r.get::<_, Option<String>>(1)?)),
        )
        .optional()?;
    if from_snapshots.is_some() {
        return Ok(from_snapshots);
    }
    tx.query_row(
        "SELECT package_quantity, package_unit FROM catalog_products
         WHERE canonical_product_id = ?1 AND package_quantity IS NOT NULL
         ORDER BY ABS(julianday(observed_at) - julianday(?2)) LIMIT 1",
        params![canonical_id, target],
        |r| Ok((r.get::<_, f64>(0)?, r.get::<_, Option<String>>(1)?)),
    )
    .optional()
    .map_err(Into::into)
}

/// Fills `brand`, `category_normalized`, `geo_normalized`,
/// `composition_normalized` and the `(package_quantity, package_unit)`
/// pair from the temporally nearest prior observation of the same
/// canonical product, when the incoming value is missing.
fn backfill(tx: &Transaction, canonical_id: &str, record: &mut NormalizedRecord) -> Result<()> {
    if is_missing_str(&record.brand) {
        if let Some(v) = nearest_text_field(tx, canonical_id, "brand", &record.observed_at)? {
            record.brand = Some(v);
        }
    }
    if record.category_normalized.is_none() {
        record.category_normalized = nearest_text_field(tx, canonical_id, "category_normalized", &record.observed_at)?;
    }
    if record.geo_normalized.is_none() {
        record.geo_normalized = nearest_text_field(tx, canonical_id, "geo_normalized", &record.observed_at)?;
    }
    if record.composition_normalized.is_none() {
        record.composition_normalized = nearest_text_field(tx, canonical_id, "composition_normalized", &record.observed_at)?;
    }
    if record.package_quantity.is_none() {
        if let Some((quantity, unit)) = nearest_package(tx, canonical_id, &record.observed_at)? {
            record.package_quantity = Some(quantity);
            record.package_unit = unit.as_deref().and_then(PackageUnit::parse);
        }
    }
    Ok(())
}

fn payload_f64(record: &NormalizedRecord, key: &str) -> Option<f64> {
    record.payload.get(key).and_then(Value::as_f64)
}

fn upsert_settlement(tx: &Transaction, record: &NormalizedRecord, now: &str) -> Result<Option<String>> {
    let geo_key = match record.geo_normalized.clone().or_else(|| record.geo_raw.clone()) {
        Some(g) if !g.trim().is_empty() => g,
        _ => return Ok(None),
    };
    let settlement_id = stable_id("settlement", &geo_key);
    tx.execute(
        "INSERT INTO catalog_settlements (id, geo_key, name, region, country, updated_at)
         VALUES (?1, ?2, ?3, NULL, NULL, ?4)
         ON CONFLICT(geo_key) DO UPDATE SET
            name = COALESCE(catalog_settlements.name, excluded.name),
            updated_at = excluded.updated_at",
        params![settlement_id, geo_key, record.geo_raw, now],
    )?;
    Ok(Some(settlement_id))
}

fn maybe_insert_geodata(tx: &Transaction, settlement_id: &str, record: &NormalizedRecord, now: &str) -> Result<()> {
    if let (Some(lat), Some(lon)) = (payload_f64(record, "receiver_geo_lat"), payload_f64(record, "receiver_geo_lon")) {
        tx.execute(
            "INSERT OR IGNORE INTO catalog_settlement_geodata (settlement_id, latitude, longitude, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![settlement_id, lat, lon, now],
        )?;
    }
    Ok(())
}

fn upsert_categories(tx: &Transaction, parser_name: &str, record: &NormalizedRecord, now: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();

    if let Some(Value::Array(categories)) = record.payload.get("receiver_categories") {
        for (idx, entry) in categories.iter().enumerate() {
            let uid = entry.get("uid").and_then(Value::as_str);
            let title = entry.get("title").and_then(Value::as_str).unwrap_or_default();
            if title.trim().is_empty() {
                continue;
            }
            let parent_uid = entry.get("parent_uid").and_then(Value::as_str);
            let depth = entry.get("depth").and_then(Value::as_i64);
            let sort_order = entry.get("sort_order").and_then(Value::as_i64).unwrap_or(idx as i64);
            let id = category_id(parser_name, uid, title);
            tx.execute(
                "INSERT INTO catalog_categories (id, parser_name, uid, title, parent_uid, depth, sort_order, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    parent_uid = COALESCE(catalog_categories.parent_uid, excluded.parent_uid),
                    depth = COALESCE(catalog_categories.depth, excluded.depth),
                    sort_order = excluded.sort_order,
                    updated_at = excluded.updated_at",
                params![id, parser_name, uid, title, parent_uid, depth, sort_order, now],
            )?;
            ids.push(id);
        }
        return Ok(ids);
    }

    if let Some(raw) = &record.category_raw {
        for (idx, part) in raw.split('/').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
            let id = category_id(parser_name, None, part);
            tx.execute(
                "INSERT INTO catalog_categories (id, parser_name, uid, title, parent_uid, depth, sort_order, updated_at)
                 VALUES (?1, ?2, NULL, ?3, NULL, NULL, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET sort_order = excluded.sort_order, updated_at = excluded.updated_at",
                params![id, parser_name, part, idx as i64, now],
            )?;
            ids.push(id);
        }
    }
    Ok(ids)
}

fn insert_snapshot(
    tx: &Transaction,
    canonical_id: &str,
    record: &NormalizedRecord,
    settlement_id: Option<&str>,
    now: &str,
) -> Result<i64> {
    let image_urls = serde_json::to_string(&record.image_urls)?;
    let duplicate_image_urls = serde_json::to_string(&record.duplicate_image_urls)?;
    let image_fingerprints = serde_json::to_string(&record.image_fingerprints)?;
    let raw_payload = serde_json::to_string(&record.payload)?;

    tx.execute(
        "INSERT INTO catalog_product_snapshots (
            canonical_product_id, parser_name, source_id,
            title_original, title_normalized, title_original_no_stopwords, title_normalized_no_stopwords,
            brand, unit, available_count, package_quantity, package_unit,
            category_raw, category_normalized, geo_raw, geo_normalized, settlement_id,
            composition_raw, composition_normalized,
            image_urls, duplicate_image_urls, image_fingerprints,
            observed_at, raw_payload, created_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)",
        params![
            canonical_id,
            record.parser_name,
            record.source_id.clone().unwrap_or_default(),
            record.title_original,
            record.title_normalized,
            record.title_original_no_stopwords,
            record.title_normalized_no_stopwords,
            record.brand,
            record.unit.as_str(),
            record.available_count,
            record.package_quantity,
            record.package_unit.map(|u| u.as_str()),
            record.category_raw,
            record.category_normalized,
            record.geo_raw,
            record.geo_normalized,
            settlement_id,
            record.composition_raw,
            record.composition_normalized,
            image_urls,
            duplicate_image_urls,
            image_fingerprints,
            record.observed_at.to_rfc3339(),
            raw_payload,
            now,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn link_categories(tx: &Transaction, snapshot_id: i64, category_ids: &[String]) -> Result<()> {
    for (idx, category_id) in category_ids.iter().enumerate() {
        tx.execute(
            "INSERT INTO catalog_product_category_links (snapshot_id, category_id, sort_order, is_primary)
             VALUES (?1, ?2, ?3, ?4)",
            params![snapshot_id, category_id, idx as i64, idx == 0],
        )?;
    }
    Ok(())
}

/// Upserts `catalog_product_sources`; returns the canonical id the record
/// should proceed with, which may differ from `canonical_id` if an
/// existing source row already anchors this `(parser_name, source_id)` to
/// a different one.
fn upsert_source_row(tx: &Transaction, canonical_id: &str, record: &NormalizedRecord, snapshot_id: i64, now: &str) -> Result<String> {
    let source_id = record.source_id.clone().unwrap_or_default();
    let observed_at = record.observed_at.to_rfc3339();

    let existing: Option<(String, String)> = tx
        .query_row(
            "SELECT canonical_product_id, last_seen_at FROM catalog_product_sources
             WHERE parser_name = ?1 AND source_id = ?2",
            params![record.parser_name, source_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    match existing {
        None => {
            tx.execute(
                "INSERT INTO catalog_product_sources
                    (parser_name, source_id, canonical_product_id, first_seen_at, last_seen_at, latest_snapshot_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)",
                params![record.parser_name, source_id, canonical_id, observed_at, snapshot_id, now],
            )?;
            Ok(canonical_id.to_string())
        }
        Some((existing_canonical, existing_last_seen)) => {
            let last_seen = if existing_last_seen.as_str() >= observed_at.as_str() {
                existing_last_seen
            } else {
                observed_at
            };
            tx.execute(
                "UPDATE catalog_product_sources
                 SET last_seen_at = ?1, latest_snapshot_id = ?2, updated_at = ?3
                 WHERE parser_name = ?4 AND source_id = ?5",
                params![last_seen, snapshot_id, now, record.parser_name, source_id],
            )?;
            Ok(existing_canonical)
        }
    }
}

fn upsert_projection(
    tx: &Transaction,
    canonical_id: &str,
    record: &NormalizedRecord,
    settlement_id: Option<&str>,
    primary_category_id: Option<String>,
    now: &str,
) -> Result<()> {
    let source_id = record.source_id.clone().unwrap_or_default();
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM catalog_products WHERE parser_name = ?1 AND source_id = ?2",
            params![record.parser_name, source_id],
            |r| r.get(0),
        )
        .optional()?;

    let image_urls = serde_json::to_string(&record.image_urls)?;
    let duplicate_image_urls = serde_json::to_string(&record.duplicate_image_urls)?;
    let image_fingerprints = serde_json::to_string(&record.image_fingerprints)?;
    let incoming_payload = serde_json::to_string(&record.payload)?;

    match existing {
        None => {
            tx.execute(
                "INSERT INTO catalog_products (
                    canonical_product_id, parser_name, source_id,
                    title_original, title_normalized, title_original_no_stopwords, title_normalized_no_stopwords,
                    brand, unit, available_count, package_quantity, package_unit,
                    category_raw, category_normalized, primary_category_id,
                    geo_raw, geo_normalized, settlement_id,
                    composition_raw, composition_normalized,
                    image_urls, duplicate_image_urls, image_fingerprints,
                    observed_at, raw_payload, created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?26)",
                params![
                    canonical_id,
                    record.parser_name,
                    source_id,
                    record.title_original,
                    record.title_normalized,
                    record.title_original_no_stopwords,
                    record.title_normalized_no_stopwords,
                    record.brand,
                    record.unit.as_str(),
                    record.available_count,
                    record.package_quantity,
                    record.package_unit.map(|u| u.as_str()),
                    record.category_raw,
                    record.category_normalized,
                    primary_category_id,
                    record.geo_raw,
                    record.geo_normalized,
                    settlement_id,
                    record.composition_raw,
                    record.composition_normalized,
                    image_urls,
                    duplicate_image_urls,
                    image_fingerprints,
                    record.observed_at.to_rfc3339(),
                    incoming_payload,
                    now,
                ],
            )?;
        }
        Some(row_id) => {
            let existing_payload: Option<String> =
                tx.query_row("SELECT raw_payload FROM catalog_products WHERE id = ?1", params![row_id], |r| r.get(0))?;
            let merged_payload = merge_payload(existing_payload.as_deref(), &record.payload)?;
            let has_images = !record.image_urls.is_empty();

            tx.execute(
                "UPDATE catalog_products SET
                    title_original = ?1,
                    title_normalized = ?2,
                    title_original_no_stopwords = ?3,
                    title_normalized_no_stopwords = ?4,
                    brand = COALESCE(?5, brand),
                    unit = COALESCE(?6, unit),
                    available_count = COALESCE(?7, available_count),
                    package_quantity = COALESCE(?8, package_quantity),
                    package_unit = COALESCE(?9, package_unit),
                    category_raw = COALESCE(?10, category_raw),
                    category_normalized = COALESCE(?11, category_normalized),
                    primary_category_id = COALESCE(?12, primary_category_id),
                    geo_raw = COALESCE(?13, geo_raw),
                    geo_normalized = COALESCE(?14, geo_normalized),
                    settlement_id = COALESCE(?15, settlement_id),
                    composition_raw = COALESCE(?16, composition_raw),
                    composition_normalized = COALESCE(?17, composition_normalized),
                    image_urls = CASE WHEN ?18 THEN ?19 ELSE image_urls END,
                    duplicate_image_urls = CASE WHEN ?18 THEN ?20 ELSE duplicate_image_urls END,
                    image_fingerprints = CASE WHEN ?18 THEN ?21 ELSE image_fingerprints END,
                    observed_at = CASE WHEN ?22 > observed_at THEN ?22 ELSE observed_at END,
                    raw_payload = ?23,
                    updated_at = ?24
                 WHERE id = ?25",
                params![
                    record.title_original,
                    record.title_normalized,
                    record.title_original_no_stopwords,
                    record.title_normalized_no_stopwords,
                    non_blank(&record.brand),
                    if record.available_count.is_some() || record.package_quantity.is_some() {
                        Some(record.unit.as_str())
                    } else {
                        None
                    },
                    record.available_count,
                    record.package_quantity,
                    record.package_unit.map(|u| u.as_str()),
                    non_blank(&record.category_raw),
                    non_blank(&record.category_normalized),
                    primary_category_id,
                    non_blank(&record.geo_raw),
                    non_blank(&record.geo_normalized),
                    settlement_id,
                    non_blank(&record.composition_raw),
                    non_blank(&record.composition_normalized),
                    has_images,
                    image_urls,
                    duplicate_image_urls,
                    image_fingerprints,
                    record.observed_at.to_rfc3339(),
                    merged_payload,
                    now,
                    row_id,
                ],
            )?;
        }
    }
    Ok(())
}

fn merge_payload(existing_raw: Option<&str>, incoming: &Map<String, Value>) -> Result<String> {
    let mut merged = existing_raw
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|v| if let Value::Object(m) = v { Some(m) } else { None })
        .unwrap_or_default();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    Ok(serde_json::to_string(&merged)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Unit;
    use chrono::TimeZone;
    use serde_json::Map as JsonMap;

    fn sample_record(parser: &str, plu: &str, observed_at: DateTime<Utc>) -> NormalizedRecord {
        NormalizedRecord {
            parser_name: parser.to_string(),
            source_id: Some(format!("src-{plu}")),
            plu: Some(plu.to_string()),
            sku: None,
            title_original: "Шоколад".to_string(),
            title_normalized: "шоколад".to_string(),
            title_original_no_stopwords: "шоколад".to_string(),
            title_normalized_no_stopwords: "шоколад".to_string(),
            brand: None,
            unit: Unit::Piece,
            available_count: None,
            package_quantity: None,
            package_unit: None,
            category_raw: None,
            category_normalized: None,
            geo_raw: None,
            geo_normalized: None,
            composition_raw: None,
            composition_normalized: None,
            image_urls: Vec::new(),
            duplicate_image_urls: Vec::new(),
            image_fingerprints: Vec::new(),
            canonical_product_id: None,
            observed_at,
            payload: JsonMap::new(),
        }
    }

    fn writer() -> CatalogWriter {
        CatalogWriter::from_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn same_plu_resolves_to_same_canonical_id_across_batches() {
        let mut writer = writer();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        writer.upsert_many(vec![sample_record("fixprice", "10002", t0)]).unwrap();
        let outcome_records = vec![sample_record("fixprice", "10002", t1)];
        writer.upsert_many(outcome_records).unwrap();

        let count: i64 = writer
            .conn
            .query_row("SELECT COUNT(DISTINCT canonical_product_id) FROM catalog_product_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let snapshot_count: i64 =
            writer.conn.query_row("SELECT COUNT(*) FROM catalog_product_snapshots", [], |r| r.get(0)).unwrap();
        assert_eq!(snapshot_count, 2);
    }

    #[test]
    fn backfill_copies_nearest_prior_value() {
        let mut writer = writer();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let mut first = sample_record("fixprice", "10002", t0);
        first.category_normalized = Some("продукты".to_string());
        writer.upsert_many(vec![first]).unwrap();

        let second = sample_record("fixprice", "10002", t1);
        writer.upsert_many(vec![second]).unwrap();

        let value: String = writer
            .conn
            .query_row("SELECT category_normalized FROM catalog_products WHERE source_id = 'src-10002'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(value, "продукты");
    }

    #[test]
    fn duplicate_image_url_within_one_record_is_reported() {
        let mut writer = writer();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut record = sample_record("fixprice", "10002", t0);
        record.image_urls = vec!["https://img/a.jpg".to_string(), "https://img/a.jpg".to_string()];

        let outcome = writer.upsert_many(vec![record]).unwrap();
        assert_eq!(outcome.duplicate_image_urls, vec!["https://img/a.jpg".to_string()]);

        let fingerprint_count: i64 =
            writer.conn.query_row("SELECT COUNT(*) FROM catalog_image_fingerprints", [], |r| r.get(0)).unwrap();
        assert_eq!(fingerprint_count, 1);
    }

    #[test]
    fn all_null_upsert_does_not_erase_prior_fields() {
        let mut writer = writer();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let mut first = sample_record("fixprice", "10002", t0);
        first.brand = Some("With Love".to_string());
        writer.upsert_many(vec![first]).unwrap();

        writer.upsert_many(vec![sample_record("fixprice", "10002", t1)]).unwrap();

        let brand: Option<String> = writer
            .conn
            .query_row("SELECT brand FROM catalog_products WHERE source_id = 'src-10002'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(brand.as_deref(), Some("With Love"));
    }

    #[test]
    fn cursor_round_trips() {
        let writer = writer();
        assert_eq!(writer.get_receiver_cursor("fixprice").unwrap(), (None, None));
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        writer.set_receiver_cursor("fixprice", ts, 42).unwrap();
        let (cursor_ts, cursor_id) = writer.get_receiver_cursor("fixprice").unwrap();
        assert_eq!(cursor_ts.unwrap(), ts);
        assert_eq!(cursor_id, Some(42));
    }
}
