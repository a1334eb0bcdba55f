//! Chizhik title parsing: multipack/package/piece-count tokens are taken
//! as the *last* match in the untouched title, and the brand is read
//! forward from the token right after the head noun — up to three
//! consecutive tokens that are Latin, ALL-UPPERCASE or Title-Cased,
//! stopping at the first digit or the first token that qualifies as
//! none of those.

use crate::domain::{PackageUnit, TitleNormalizationResult, Unit};
use crate::parsers::text::TextNormalizer;
use crate::parsers::title::*;
use crate::parsers::ParserHandler;

/// Strips multipack/package/piece-count tokens out of `raw` to produce the
/// head name used for both display and brand extraction; falls back to the
/// untouched, trimmed title if stripping would leave nothing at all.
fn strip_pack_tokens(raw: &str) -> String {
    let mut value = MULTIPACK_RE.replace_all(raw, " ").into_owned();
    value = PACKAGE_RE.replace_all(&value, " ").into_owned();
    value = PIECE_COUNT_RE.replace_all(&value, " ").into_owned();
    let collapsed = MULTISPACE_RE.replace_all(value.trim(), " ").into_owned();
    let trimmed = collapsed.trim_matches(|c: char| " ,.;:-".contains(c)).to_string();
    if trimmed.is_empty() {
        raw.trim().to_string()
    } else {
        trimmed
    }
}

/// Brand candidates walk forward from the second word (the head noun is
/// `words[0]`), collecting up to three consecutive qualifying tokens.
fn extract_brand(name_part: &str) -> Option<String> {
    let words: Vec<&str> = name_part.split_whitespace().map(trim_word_punctuation).filter(|w| !w.is_empty()).collect();
    if words.len() < 2 {
        return None;
    }

    let mut candidates: Vec<&str> = Vec::new();
    for token in &words[1..] {
        if token.chars().any(|c| c.is_ascii_digit()) {
            break;
        }
        if LATIN_RE.is_match(token) {
            candidates.push(token);
            continue;
        }
        if is_uppercase_word(token) || is_title_case_word(token) {
            candidates.push(token);
            continue;
        }
        break;
    }

    if candidates.is_empty() {
        return None;
    }
    candidates.truncate(3);
    Some(candidates.join(" "))
}

/// Shared by [`ChizhikHandler`] and [`super::perekrestok::PerekrestokHandler`]
/// — Perekrestok's title format follows the same extraction rules, so both
/// call into this one routine while remaining distinct registry entries.
pub(crate) fn parse_chizhik_style(normalizer: &dyn TextNormalizer, title: &str) -> TitleNormalizationResult {
    let raw = title.trim().to_string();
    let name_original = strip_pack_tokens(&raw);
    let brand = extract_brand(&name_original);

    let mut available_count = None;
    let mut package_quantity = None;
    let mut package_unit = None;

    if let Some(caps) = MULTIPACK_RE.captures_iter(&raw).last() {
        available_count = to_float(&caps["count"]);
        let (q, u) = to_package_quantity(&caps["q"], &caps["u"]);
        package_quantity = q;
        package_unit = u;
    }
    if available_count.is_none() {
        if let Some(caps) = PIECE_COUNT_RE.captures_iter(&raw).last() {
            available_count = to_float(&caps["count"]);
        }
    }
    if package_quantity.is_none() && package_unit.is_none() {
        if let Some(caps) = PACKAGE_RE.captures_iter(&raw).last() {
            let (q, u) = to_package_quantity(&caps["q"], &caps["u"]);
            package_quantity = q;
            package_unit = u;
        }
    }

    let mut unit = Unit::Piece;
    if BY_WEIGHT_RE.is_match(&raw) {
        unit = Unit::Kilogram;
        available_count = None;
        package_quantity = None;
        package_unit = None;
    } else if BY_VOLUME_RE.is_match(&raw) {
        unit = Unit::Litre;
        available_count = None;
        package_quantity = None;
        package_unit = None;
    }

    let name_for_normalization = match &brand {
        Some(b) if name_original.to_lowercase().contains(&b.to_lowercase()) => name_original.clone(),
        Some(b) => format!("{name_original} {b}"),
        None => name_original.clone(),
    };
    let name_normalized = normalizer.lemmatize(&name_for_normalization);
    let original_name_no_stopwords = normalizer.remove_stopwords(&name_original);
    let normalized_name_no_stopwords = normalizer.remove_stopwords(&name_normalized);

    TitleNormalizationResult {
        name_original,
        brand,
        name_normalized,
        original_name_no_stopwords,
        normalized_name_no_stopwords,
        unit,
        available_count,
        package_quantity,
        package_unit,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChizhikHandler;

impl ChizhikHandler {
    pub fn new() -> Self {
        Self
    }
}

impl ParserHandler for ChizhikHandler {
    fn name(&self) -> &'static str {
        "chizhik"
    }

    fn parse_title(&self, normalizer: &dyn TextNormalizer, title: &str) -> TitleNormalizationResult {
        parse_chizhik_style(normalizer, title)
    }
}
