//! `ReceiverReader`: paged, watermark-ordered reads from the upstream
//! receiver store.
//!
//! A single indexed join across products / run artifacts / administrative
//! units, followed by two lookup passes for category titles and product
//! images.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection};
use serde_json::{Map, Value};

use crate::domain::{PackageUnit, RawObservation, Unit};
use crate::error::{Result, SchemaError};

pub struct ReceiverReader {
    conn: Connection,
    supplemental_columns: Vec<(&'static str, SupplementalKind)>,
}

/// How a supplemental commerce column should be coerced into JSON once read.
#[derive(Debug, Clone, Copy)]
enum SupplementalKind {
    Text,
    Float,
    Int,
    Bool,
}

/// Commerce fields the receiver carries alongside the identity/title/unit
/// fields the catalog treats as authoritative. None of these participate in
/// identity resolution, image dedup or merge decisions — they are read when
/// the column exists on `run_artifact_products`, carried through the payload
/// map untouched, and surfaced downstream as non-authoritative JSON.
const SUPPLEMENTAL_COLUMNS: &[(&str, SupplementalKind)] = &[
    ("price", SupplementalKind::Float),
    ("discount_price", SupplementalKind::Float),
    ("loyal_price", SupplementalKind::Float),
    ("price_unit", SupplementalKind::Text),
    ("producer_name", SupplementalKind::Text),
    ("producer_country", SupplementalKind::Text),
    ("expiration_date_in_days", SupplementalKind::Int),
    ("rating", SupplementalKind::Float),
    ("reviews_count", SupplementalKind::Int),
    ("adult", SupplementalKind::Bool),
    ("is_new", SupplementalKind::Bool),
    ("promo", SupplementalKind::Bool),
    ("season", SupplementalKind::Bool),
    ("hit", SupplementalKind::Bool),
    ("data_matrix", SupplementalKind::Bool),
    ("source_page_url", SupplementalKind::Text),
    ("description", SupplementalKind::Text),
];

fn sql_value_to_json(kind: SupplementalKind, value: SqlValue) -> Option<Value> {
    match (kind, value) {
        (_, SqlValue::Null) => None,
        (SupplementalKind::Text, SqlValue::Text(s)) => Some(Value::from(s)),
        (SupplementalKind::Float, SqlValue::Real(f)) => Some(Value::from(f)),
        (SupplementalKind::Float, SqlValue::Integer(i)) => Some(Value::from(i as f64)),
        (SupplementalKind::Int, SqlValue::Integer(i)) => Some(Value::from(i)),
        (SupplementalKind::Int, SqlValue::Real(f)) => Some(Value::from(f as i64)),
        (SupplementalKind::Bool, SqlValue::Integer(i)) => Some(Value::from(i != 0)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct CategoryEntry {
    uid: String,
    title: String,
    parent_uid: Option<String>,
    depth: Option<i64>,
    sort_order: Option<i64>,
}

struct FetchedRow {
    product_id: i64,
    run_id: String,
    parser_name: String,
    sku: Option<String>,
    plu: Option<String>,
    title: Option<String>,
    composition: Option<String>,
    brand: Option<String>,
    unit: Option<String>,
    available_count: Option<f64>,
    package_quantity: Option<f64>,
    package_unit: Option<String>,
    category_uids: Vec<String>,
    main_image: Option<String>,
    ingested_at: DateTime<Utc>,
    geo_name: Option<String>,
    geo_region: Option<String>,
    geo_country: Option<String>,
    geo_lat: Option<f64>,
    geo_lon: Option<f64>,
    supplemental: Map<String, Value>,
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

fn parse_ingested_at(raw: &str) -> DateTime<Utc> {
    let rewritten = raw.replacen('Z', "+00:00", 1);
    DateTime::parse_from_rfc3339(&rewritten)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl ReceiverReader {
    pub fn open(path: &str) -> Result<Self> {
        if path != ":memory:" && !std::path::Path::new(path).exists() {
            return Err(SchemaError::ReceiverNotFound(path.to_string()).into());
        }
        let conn = Connection::open(path)?;
        Self::from_connection_checked(conn)
    }

    fn from_connection_checked(conn: Connection) -> Result<Self> {
        if !has_column(&conn, "run_artifacts", "parser_name")? {
            return Err(SchemaError::MissingColumn {
                table: "run_artifacts".to_string(),
                column: "parser_name".to_string(),
            }
            .into());
        }
        let mut supplemental_columns = Vec::new();
        for &(name, kind) in SUPPLEMENTAL_COLUMNS {
            if has_column(&conn, "run_artifact_products", name)? {
                supplemental_columns.push((name, kind));
            }
        }
        Ok(Self { conn, supplemental_columns })
    }

    #[cfg(test)]
    pub fn from_connection(conn: Connection) -> Self {
        Self::from_connection_checked(conn).expect("test schema must carry run_artifacts.parser_name")
    }

    /// Watermark-ordered, joined read. `after_ingested_at`/`after_product_id`
    /// together form the strict-tuple cursor; both `None` means "from the
    /// beginning".
    pub fn fetch_batch(
        &self,
        limit: u32,
        parser_name: Option<&str>,
        after_ingested_at: Option<DateTime<Utc>>,
        after_product_id: Option<i64>,
    ) -> Result<Vec<RawObservation>> {
        let effective_limit = limit.max(1);
        let buffered = self.query_rows(effective_limit, parser_name, after_ingested_at, after_product_id)?;
        if buffered.is_empty() {
            return Ok(Vec::new());
        }

        let product_ids: Vec<i64> = buffered.iter().map(|r| r.product_id).collect();
        let category_titles = self.resolve_category_titles(&buffered)?;
        let images_by_product = self.resolve_images(&product_ids)?;

        Ok(buffered
            .into_iter()
            .map(|row| self.assemble(row, &category_titles, &images_by_product))
            .collect())
    }

    fn query_rows(
        &self,
        effective_limit: u32,
        parser_name: Option<&str>,
        after_ingested_at: Option<DateTime<Utc>>,
        after_product_id: Option<i64>,
    ) -> Result<Vec<FetchedRow>> {
        let mut sql = String::from(
            "SELECT p.id, p.sku, p.plu, p.title, p.composition, p.brand, \
             p.unit, p.available_count, p.package_quantity, p.package_unit, \
             p.categories_uid_json, p.main_image, \
             a.run_id, a.parser_name, a.ingested_at, \
             au.name, au.region, au.country, au.latitude, au.longitude",
        );
        for (name, _) in &self.supplemental_columns {
            sql.push_str(&format!(", p.{name}"));
        }
        sql.push_str(
            " FROM run_artifact_products p \
             JOIN run_artifacts a ON a.id = p.artifact_id \
             LEFT JOIN run_artifact_administrative_units au ON au.artifact_id = a.id \
             WHERE 1 = 1",
        );
        let mut bound: Vec<SqlValue> = Vec::new();

        if let Some(name) = parser_name {
            sql.push_str(" AND lower(a.parser_name) = lower(?)");
            bound.push(SqlValue::Text(name.to_string()));
        }
        match (after_ingested_at, after_product_id) {
            (Some(wm_ts), Some(wm_id)) => {
                sql.push_str(" AND (a.ingested_at > ? OR (a.ingested_at = ? AND p.id > ?))");
                let wm_ts_str = wm_ts.to_rfc3339();
                bound.push(SqlValue::Text(wm_ts_str.clone()));
                bound.push(SqlValue::Text(wm_ts_str));
                bound.push(SqlValue::Integer(wm_id));
            }
            (Some(wm_ts), None) => {
                sql.push_str(" AND a.ingested_at > ?");
                bound.push(SqlValue::Text(wm_ts.to_rfc3339()));
            }
            _ => {}
        }

        sql.push_str(" ORDER BY a.ingested_at ASC, p.id ASC LIMIT ?");
        bound.push(SqlValue::Integer(effective_limit as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bound.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let categories_uid_json: Option<String> = row.get(10)?;
            let category_uids: Vec<String> = categories_uid_json
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
                .unwrap_or_default();
            let ingested_at_raw: String = row.get(14)?;

            let mut supplemental = Map::new();
            for (offset, (name, kind)) in self.supplemental_columns.iter().enumerate() {
                let raw: SqlValue = row.get(20 + offset)?;
                if let Some(value) = sql_value_to_json(*kind, raw) {
                    supplemental.insert((*name).to_string(), value);
                }
            }

            out.push(FetchedRow {
                product_id: row.get(0)?,
                sku: row.get(1)?,
                plu: row.get(2)?,
                title: row.get(3)?,
                composition: row.get(4)?,
                brand: row.get(5)?,
                unit: row.get(6)?,
                available_count: row.get(7)?,
                package_quantity: row.get(8)?,
                package_unit: row.get(9)?,
                category_uids,
                main_image: row.get(11)?,
                run_id: row.get(12)?,
                parser_name: row.get(13)?,
                ingested_at: parse_ingested_at(&ingested_at_raw),
                geo_name: row.get(15)?,
                geo_region: row.get(16)?,
                geo_country: row.get(17)?,
                geo_lat: row.get(18)?,
                geo_lon: row.get(19)?,
                supplemental,
            });
        }
        Ok(out)
    }

    fn resolve_category_titles(&self, rows: &[FetchedRow]) -> Result<HashMap<String, CategoryEntry>> {
        let mut uids: Vec<String> = Vec::new();
        for row in rows {
            for uid in &row.category_uids {
                if !uids.contains(uid) {
                    uids.push(uid.clone());
                }
            }
        }
        let mut out = HashMap::new();
        if uids.is_empty() {
            return Ok(out);
        }
        let placeholders = uids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT uid, title, parent_uid, depth, sort_order FROM run_artifact_categories WHERE uid IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let bound: Vec<SqlValue> = uids.iter().map(|u| SqlValue::Text(u.clone())).collect();
        let mut result = stmt.query(params_from_iter(bound.iter()))?;
        while let Some(row) = result.next()? {
            let uid: String = row.get(0)?;
            out.insert(
                uid.clone(),
                CategoryEntry {
                    uid,
                    title: row.get(1)?,
                    parent_uid: row.get(2)?,
                    depth: row.get(3)?,
                    sort_order: row.get(4)?,
                },
            );
        }
        Ok(out)
    }

    fn resolve_images(&self, product_ids: &[i64]) -> Result<HashMap<i64, Vec<String>>> {
        let mut out: HashMap<i64, Vec<String>> = HashMap::new();
        if product_ids.is_empty() {
            return Ok(out);
        }
        let placeholders = product_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT product_id, url FROM run_artifact_product_images WHERE product_id IN ({placeholders}) ORDER BY product_id, sort_order ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let bound: Vec<SqlValue> = product_ids.iter().map(|id| SqlValue::Integer(*id)).collect();
        let mut rows = stmt.query(params_from_iter(bound.iter()))?;
        while let Some(row) = rows.next()? {
            let product_id: i64 = row.get(0)?;
            let url: String = row.get(1)?;
            out.entry(product_id).or_default().push(url);
        }
        Ok(out)
    }

    fn assemble(
        &self,
        row: FetchedRow,
        category_titles: &HashMap<String, CategoryEntry>,
        images_by_product: &HashMap<i64, Vec<String>>,
    ) -> RawObservation {
        let category_entries: Vec<CategoryEntry> =
            row.category_uids.iter().filter_map(|uid| category_titles.get(uid).cloned()).collect();
        let category = if category_entries.is_empty() {
            None
        } else {
            Some(category_entries.iter().map(|c| c.title.as_str()).collect::<Vec<_>>().join(" / "))
        };

        let mut geo_parts: Vec<String> = Vec::new();
        for part in [&row.geo_country, &row.geo_region, &row.geo_name] {
            if let Some(p) = part {
                let trimmed = p.trim();
                if !trimmed.is_empty() && !geo_parts.iter().any(|g| g == trimmed) {
                    geo_parts.push(trimmed.to_string());
                }
            }
        }
        let geo = if geo_parts.is_empty() { None } else { Some(geo_parts.join(", ")) };

        let mut image_urls: Vec<String> = Vec::new();
        if let Some(main) = &row.main_image {
            if !main.trim().is_empty() {
                image_urls.push(main.clone());
            }
        }
        if let Some(images) = images_by_product.get(&row.product_id) {
            for url in images {
                if !image_urls.contains(url) {
                    image_urls.push(url.clone());
                }
            }
        }

        let mut payload = Map::new();
        payload.insert("receiver_product_id".to_string(), Value::from(row.product_id));
        payload.insert("receiver_run_id".to_string(), Value::from(row.run_id.clone()));
        if !category_entries.is_empty() {
            let cats: Vec<Value> = category_entries
                .iter()
                .map(|c| {
                    let mut m = Map::new();
                    m.insert("uid".to_string(), Value::from(c.uid.clone()));
                    m.insert("title".to_string(), Value::from(c.title.clone()));
                    m.insert("parent_uid".to_string(), c.parent_uid.clone().map(Value::from).unwrap_or(Value::Null));
                    m.insert("depth".to_string(), c.depth.map(Value::from).unwrap_or(Value::Null));
                    m.insert("sort_order".to_string(), c.sort_order.map(Value::from).unwrap_or(Value::Null));
                    Value::Object(m)
                })
                .collect();
            payload.insert("receiver_categories".to_string(), Value::Array(cats));
        }
        if let Some(lat) = row.geo_lat {
            payload.insert("receiver_geo_lat".to_string(), Value::from(lat));
        }
        if let Some(lon) = row.geo_lon {
            payload.insert("receiver_geo_lon".to_string(), Value::from(lon));
        }
        payload.extend(row.supplemental);

        RawObservation {
            parser_name: row.parser_name.to_lowercase(),
            source_id: Some(format!("receiver:{}:{}", row.run_id, row.product_id)),
            plu: row.plu,
            sku: row.sku,
            title: row.title.unwrap_or_default(),
            brand: row.brand,
            available_count: row.available_count,
            package_quantity: row.package_quantity,
            unit: row.unit.as_deref().and_then(Unit::parse),
            package_unit: row.package_unit.as_deref().and_then(PackageUnit::parse),
            category,
            geo,
            composition: row.composition,
            image_urls,
            observed_at: row.ingested_at,
            payload,
        }
        .with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_schema(conn: &Connection) {
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
            "#,
        )
        .unwrap();
    }

    #[test]
    fn fetch_batch_respects_watermark_and_orders_strictly() {
        let conn = Connection::open_in_memory().unwrap();
        seed_schema(&conn);
        conn.execute(
            "INSERT INTO run_artifacts (id, run_id, source, parser_name, ingested_at) VALUES
             (1, 'r1', 'receiver', 'fixprice', '2024-01-01T00:00:00+00:00'),
             (2, 'r2', 'receiver', 'fixprice', '2024-01-02T00:00:00+00:00')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO run_artifact_products (id, artifact_id, title) VALUES (10, 1, 'first'), (11, 2, 'second')",
            [],
        )
        .unwrap();

        let reader = ReceiverReader::from_connection(conn);
        let batch = reader.fetch_batch(10, Some("fixprice"), None, None).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].title, "first");

        let after_first = reader
            .fetch_batch(10, Some("fixprice"), Some(batch[0].observed_at), Some(10))
            .unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].title, "second");
    }

    #[test]
    fn missing_parser_name_column_is_a_fatal_schema_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE run_artifacts (id INTEGER PRIMARY KEY);").unwrap();
        assert!(!has_column(&conn, "run_artifacts", "parser_name").unwrap());
    }

    #[test]
    fn supplemental_commerce_columns_pass_through_payload_when_present() {
        let conn = Connection::open_in_memory().unwrap();
        seed_schema(&conn);
        conn.execute_batch(
            "ALTER TABLE run_artifact_products ADD COLUMN price REAL;
             ALTER TABLE run_artifact_products ADD COLUMN discount_price REAL;
             ALTER TABLE run_artifact_products ADD COLUMN loyal_price REAL;
             ALTER TABLE run_artifact_products ADD COLUMN price_unit TEXT;
             ALTER TABLE run_artifact_products ADD COLUMN producer_name TEXT;
             ALTER TABLE run_artifact_products ADD COLUMN producer_country TEXT;
             ALTER TABLE run_artifact_products ADD COLUMN expiration_date_in_days INTEGER;
             ALTER TABLE run_artifact_products ADD COLUMN rating REAL;
             ALTER TABLE run_artifact_products ADD COLUMN reviews_count INTEGER;
             ALTER TABLE run_artifact_products ADD COLUMN adult INTEGER;
             ALTER TABLE run_artifact_products ADD COLUMN is_new INTEGER;
             ALTER TABLE run_artifact_products ADD COLUMN promo INTEGER;
             ALTER TABLE run_artifact_products ADD COLUMN season INTEGER;
             ALTER TABLE run_artifact_products ADD COLUMN hit INTEGER;
             ALTER TABLE run_artifact_products ADD COLUMN data_matrix INTEGER;
             ALTER TABLE run_artifact_products ADD COLUMN source_page_url TEXT;
             ALTER TABLE run_artifact_products ADD COLUMN description TEXT;",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO run_artifacts (id, run_id, source, parser_name, ingested_at) VALUES
             (1, 'r1', 'receiver', 'fixprice', '2024-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO run_artifact_products (
                 id, artifact_id, title, price, discount_price, loyal_price, price_unit,
                 producer_name, producer_country, expiration_date_in_days, rating, reviews_count,
                 adult, is_new, promo, season, hit, data_matrix, source_page_url, description
             ) VALUES (
                 10, 1, 'first', 199.9, 149.9, 129.9, 'RUB',
                 'Producer', 'RU', 90, 4.7, 11,
                 0, 1, 1, 0, 1, 0, 'https://example.local/p/10', 'a description'
             )",
            [],
        )
        .unwrap();

        let reader = ReceiverReader::from_connection(conn);
        let batch = reader.fetch_batch(10, Some("fixprice"), None, None).unwrap();
        assert_eq!(batch.len(), 1);
        let payload = &batch[0].payload;
        assert_eq!(payload.get("price"), Some(&Value::from(199.9)));
        assert_eq!(payload.get("discount_price"), Some(&Value::from(149.9)));
        assert_eq!(payload.get("loyal_price"), Some(&Value::from(129.9)));
        assert_eq!(payload.get("price_unit"), Some(&Value::from("RUB")));
        assert_eq!(payload.get("producer_name"), Some(&Value::from("Producer")));
        assert_eq!(payload.get("producer_country"), Some(&Value::from("RU")));
        assert_eq!(payload.get("expiration_date_in_days"), Some(&Value::from(90)));
        assert_eq!(payload.get("rating"), Some(&Value::from(4.7)));
        assert_eq!(payload.get("reviews_count"), Some(&Value::from(11)));
        assert_eq!(payload.get("adult"), Some(&Value::from(false)));
        assert_eq!(payload.get("is_new"), Some(&Value::from(true)));
        assert_eq!(payload.get("promo"), Some(&Value::from(true)));
        assert_eq!(payload.get("season"), Some(&Value::from(false)));
        assert_eq!(payload.get("hit"), Some(&Value::from(true)));
        assert_eq!(payload.get("data_matrix"), Some(&Value::from(false)));
        assert_eq!(payload.get("source_page_url"), Some(&Value::from("https://example.local/p/10")));
        assert_eq!(payload.get("description"), Some(&Value::from("a description")));
    }

    #[test]
    fn supplemental_commerce_columns_absent_from_payload_when_schema_lacks_them() {
        let conn = Connection::open_in_memory().unwrap();
        seed_schema(&conn);
        conn.execute(
            "INSERT INTO run_artifacts (id, run_id, source, parser_name, ingested_at) VALUES
             (1, 'r1', 'receiver', 'fixprice', '2024-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO run_artifact_products (id, artifact_id, title) VALUES (10, 1, 'first')",
            [],
        )
        .unwrap();

        let reader = ReceiverReader::from_connection(conn);
        let batch = reader.fetch_batch(10, Some("fixprice"), None, None).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(!batch[0].payload.contains_key("price"));
        assert!(!batch[0].payload.contains_key("description"));
    }
}
