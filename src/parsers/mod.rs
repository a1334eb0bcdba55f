//! Title parsing and the per-source handler registry.
//!
//! Each upstream source (fixprice, chizhik, perekrestok) ships its own
//! title-parsing quirks but shares the same normalization primitives
//! ([`text`], [`title`]) and the same raw-to-normalized merge rules.

pub mod chizhik;
pub mod fixprice;
pub mod perekrestok;
pub mod text;
pub mod title;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{NormalizedRecord, RawObservation, TitleNormalizationResult};
use crate::error::{ParserError, Result};
use text::TextNormalizer;

/// A per-source title-parsing strategy. The merge with the raw
/// observation's own fields is identical across sources, so only
/// `parse_title` varies between handlers; `normalize_category` and
/// `normalize_composition` have a shared default but may be overridden
/// (fixprice does, for both — see below).
pub trait ParserHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse_title(&self, normalizer: &dyn TextNormalizer, title: &str) -> TitleNormalizationResult;

    fn normalize_category(&self, _normalizer: &dyn TextNormalizer, raw: &str) -> Option<String> {
        simple_normalize_string(raw)
    }

    fn normalize_geo(&self, _normalizer: &dyn TextNormalizer, raw: &str) -> Option<String> {
        simple_normalize_string(raw)
    }

    fn normalize_composition(&self, _normalizer: &dyn TextNormalizer, raw: &str) -> Option<String> {
        simple_normalize_string(raw)
    }
}

static MULTISPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static CATEGORY_SEPARATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[/,]+").unwrap());

/// The default normalization every descriptive field (`category`, `geo`,
/// `composition`) gets when a handler doesn't override it: lowercase,
/// `ё`->`е`, whitespace-collapse. No lemmatization, no stop-word removal.
pub fn simple_normalize_string(raw: &str) -> Option<String> {
    let cleaned = MULTISPACE_RE.replace_all(&raw.trim().to_lowercase().replace('ё', "е"), " ").into_owned();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Collapses `/`- and `,`-separated text into a lemmatized, stopword-free
/// canonical form, falling back to the lemmatized form when stopword
/// removal would otherwise empty it out. Used by fixprice's category
/// normalization, which goes further than the shared default.
pub fn normalize_descriptive_text(normalizer: &dyn TextNormalizer, raw: &str) -> Option<String> {
    if raw.trim().is_empty() {
        return None;
    }
    let collapsed = CATEGORY_SEPARATOR_RE.replace_all(raw, " ");
    let lemmatized = normalizer.lemmatize(&collapsed);
    if lemmatized.trim().is_empty() {
        return None;
    }
    let without_stopwords = normalizer.remove_stopwords(&lemmatized);
    let result = if without_stopwords.trim().is_empty() {
        lemmatized
    } else {
        without_stopwords
    };
    if result.trim().is_empty() {
        None
    } else {
        Some(result)
    }
}

/// Runs a raw observation through `handler`'s title parser and merges the
/// result with the observation's own fields.
///
/// `brand` takes the title parser's guess first, falling back to the raw
/// observation's own value; `unit` and `available_count` do the reverse
/// (raw first, title parser as fallback). `(package_quantity, package_unit)`
/// is all-or-nothing: it is taken from the raw observation only when BOTH
/// are present there, and replaced by the title parser's pair otherwise —
/// including when exactly one of the two arrived alone, which is itself
/// treated as "absent" rather than trusted half-filled.
pub fn normalize(handler: &dyn ParserHandler, normalizer: &dyn TextNormalizer, raw: RawObservation) -> NormalizedRecord {
    let raw = raw.with_defaults();
    let parsed = handler.parse_title(normalizer, &raw.title);

    let brand = parsed.brand.clone().or_else(|| crate::domain::non_blank(&raw.brand));
    let unit = raw.unit.unwrap_or(parsed.unit);
    let available_count = raw.available_count.or(parsed.available_count);
    let (package_quantity, package_unit) = match (raw.package_quantity, raw.package_unit) {
        (Some(q), Some(u)) => (Some(q), Some(u)),
        _ => (parsed.package_quantity, parsed.package_unit),
    };

    let category_raw = crate::domain::non_blank(&raw.category);
    let category_normalized = category_raw.as_deref().and_then(|c| handler.normalize_category(normalizer, c));
    let geo_raw = crate::domain::non_blank(&raw.geo);
    let geo_normalized = geo_raw.as_deref().and_then(|g| handler.normalize_geo(normalizer, g));
    let composition_raw = crate::domain::non_blank(&raw.composition);
    let composition_normalized = composition_raw.as_deref().and_then(|c| handler.normalize_composition(normalizer, c));

    NormalizedRecord {
        parser_name: handler.name().to_string(),
        source_id: raw.source_id,
        plu: raw.plu,
        sku: raw.sku,

        title_original: parsed.name_original,
        title_normalized: parsed.name_normalized,
        title_original_no_stopwords: parsed.original_name_no_stopwords,
        title_normalized_no_stopwords: parsed.normalized_name_no_stopwords,
        brand,

        unit,
        available_count,
        package_quantity,
        package_unit,

        category_raw,
        category_normalized,
        geo_raw,
        geo_normalized,
        composition_raw,
        composition_normalized,

        image_urls: raw.image_urls,
        duplicate_image_urls: Vec::new(),
        image_fingerprints: Vec::new(),

        canonical_product_id: None,
        observed_at: raw.observed_at,
        payload: raw.payload,
    }
}

/// Registry of parser handlers keyed by lowercased, trimmed name.
#[derive(Default)]
pub struct ParserRegistry {
    handlers: HashMap<String, Arc<dyn ParserHandler>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Registry pre-populated with the three known production handlers.
    pub fn with_default_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(fixprice::FixpriceHandler::new())).expect("builtin handlers are unique");
        registry.register(Arc::new(chizhik::ChizhikHandler::new())).expect("builtin handlers are unique");
        registry
            .register(Arc::new(perekrestok::PerekrestokHandler::new()))
            .expect("builtin handlers are unique");
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ParserHandler>) -> Result<()> {
        let key = handler.name().trim().to_lowercase();
        if key.is_empty() {
            return Err(ParserError::UnknownParser {
                name: String::new(),
                known: self.known_names(),
            }
            .into());
        }
        if self.handlers.contains_key(&key) {
            return Err(ParserError::DuplicateHandler(key).into());
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ParserHandler>> {
        let key = name.trim().to_lowercase();
        self.handlers.get(&key).cloned().ok_or_else(|| {
            ParserError::UnknownParser {
                name: name.to_string(),
                known: self.known_names(),
            }
            .into()
        })
    }

    fn known_names(&self) -> String {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }
}
