//! Core data model shared by every component of the sync pipeline.
//!
//! Kept free of I/O: parsers, the sync engine and the catalog writer all
//! operate on these types, never on raw rows or HTTP bodies directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `unit` enumerant carried on both raw observations and normalized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "PCE")]
    Piece,
    #[serde(rename = "KGM")]
    Kilogram,
    #[serde(rename = "LTR")]
    Litre,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Piece => "PCE",
            Unit::Kilogram => "KGM",
            Unit::Litre => "LTR",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_uppercase().as_str() {
            "PCE" => Some(Unit::Piece),
            "KGM" => Some(Unit::Kilogram),
            "LTR" => Some(Unit::Litre),
            _ => None,
        }
    }
}

/// `package_unit` enumerant; a strict subset of [`Unit`] (pieces cannot be packaged).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageUnit {
    #[serde(rename = "KGM")]
    Kilogram,
    #[serde(rename = "LTR")]
    Litre,
}

impl PackageUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageUnit::Kilogram => "KGM",
            PackageUnit::Litre => "LTR",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_uppercase().as_str() {
            "KGM" => Some(PackageUnit::Kilogram),
            "LTR" => Some(PackageUnit::Litre),
            _ => None,
        }
    }
}

/// An observation as produced by the upstream receiver store, before any
/// source-specific normalization has been applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawObservation {
    pub parser_name: String,
    pub source_id: Option<String>,
    pub plu: Option<String>,
    pub sku: Option<String>,
    pub title: String,
    pub brand: Option<String>,

    pub available_count: Option<f64>,
    pub package_quantity: Option<f64>,
    pub unit: Option<Unit>,
    pub package_unit: Option<PackageUnit>,

    pub category: Option<String>,
    pub geo: Option<String>,
    pub composition: Option<String>,

    pub image_urls: Vec<String>,
    pub observed_at: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl RawObservation {
    /// Fills in the two defaults the receiver contract guarantees regardless
    /// of how sparse the upstream row was: a non-empty title and a UTC
    /// timestamp.
    pub fn with_defaults(mut self) -> Self {
        if self.title.trim().is_empty() {
            self.title = "Unnamed product".to_string();
        }
        self
    }
}

/// The result of running a title through a parser's title-normalization
/// rules, prior to merging with the raw observation's own fields.
#[derive(Debug, Clone, Default)]
pub struct TitleNormalizationResult {
    pub name_original: String,
    pub brand: Option<String>,
    pub name_normalized: String,
    pub original_name_no_stopwords: String,
    pub normalized_name_no_stopwords: String,
    pub unit: Unit,
    pub available_count: Option<f64>,
    pub package_quantity: Option<f64>,
    pub package_unit: Option<PackageUnit>,
}

impl Default for Unit {
    fn default() -> Self {
        Unit::Piece
    }
}

/// A raw observation after per-source normalization, carrying the fields
/// the catalog writer needs to resolve identity, dedup images and persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub parser_name: String,
    pub source_id: Option<String>,
    pub plu: Option<String>,
    pub sku: Option<String>,

    pub title_original: String,
    pub title_normalized: String,
    pub title_original_no_stopwords: String,
    pub title_normalized_no_stopwords: String,
    pub brand: Option<String>,

    pub unit: Unit,
    pub available_count: Option<f64>,
    pub package_quantity: Option<f64>,
    pub package_unit: Option<PackageUnit>,

    pub category_raw: Option<String>,
    pub category_normalized: Option<String>,
    pub geo_raw: Option<String>,
    pub geo_normalized: Option<String>,
    pub composition_raw: Option<String>,
    pub composition_normalized: Option<String>,

    pub image_urls: Vec<String>,
    pub duplicate_image_urls: Vec<String>,
    pub image_fingerprints: Vec<String>,

    pub canonical_product_id: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl NormalizedRecord {
    /// Identity candidates in priority order: plu, then sku, then source_id.
    pub fn identity_candidates(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(3);
        if let Some(value) = non_blank(&self.plu) {
            out.push(("plu", value));
        }
        if let Some(value) = non_blank(&self.sku) {
            out.push(("sku", value));
        }
        if let Some(value) = non_blank(&self.source_id) {
            out.push(("source_id", value));
        }
        out
    }
}

pub fn non_blank(value: &Option<String>) -> Option<String> {
    value.as_ref().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub fn is_missing_str(value: &Option<String>) -> bool {
    non_blank(value).is_none()
}

/// One entry of `payload.receiver_categories`, used to build
/// [`crate::catalog`] category rows when present.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverCategory {
    pub uid: Option<String>,
    pub title: String,
    pub parent_uid: Option<String>,
    pub depth: Option<i64>,
    pub sort_order: Option<i64>,
}
