//! FixPrice title parsing: the title is split on commas (after stripping
//! the assortment phrase), the first segment is the product name and the
//! second — if it carries no digit/dimension/weight token — is the brand
//! guess. Package size and piece count are both read from the whole title
//! (minus the assortment phrase), not just the head segment.

use crate::domain::{PackageUnit, TitleNormalizationResult, Unit};
use crate::parsers::text::TextNormalizer;
use crate::parsers::title::*;
use crate::parsers::{normalize_descriptive_text, simple_normalize_string, ParserHandler};

#[derive(Debug, Clone, Default)]
pub struct FixpriceHandler;

impl FixpriceHandler {
    pub fn new() -> Self {
        Self
    }

    /// Splits `title` into comma segments after stripping the assortment
    /// phrase and surrounding comma/space noise; empty segments are dropped.
    fn split_by_commas(&self, title: &str) -> Vec<String> {
        let no_assort = ASSORT_RE.replace_all(title, "");
        let trimmed = no_assort.trim_matches(|c: char| c == ',' || c.is_whitespace());
        trimmed.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
    }

    /// The second comma segment is the brand guess unless it carries a
    /// dimension token, a weight/volume token, a bare digit, or is too
    /// short once cleaned.
    fn guess_brand(&self, parts: &[String]) -> Option<String> {
        let candidate = parts.get(1)?;
        if DIM_CM_RE.is_match(candidate) || WVL_RE.is_match(candidate) || DIGIT_WORD_RE.is_match(candidate) {
            return None;
        }
        let cleaned_len = candidate.trim().to_lowercase().chars().filter(|c| !c.is_whitespace()).count();
        if cleaned_len < 2 {
            return None;
        }
        Some(candidate.clone())
    }

    /// Scrubs dimension/weight/assortment tokens out before counting
    /// plausible piece counts: prefers the last number in 2..=200, falling
    /// back to a single lone number in 1..=200 when nothing else qualifies.
    fn extract_count_heuristic(&self, title: &str) -> Option<f64> {
        let scrubbed = ASSORT_RE.replace_all(&WVL_RE.replace_all(&DIM_CM_RE.replace_all(title, " "), " "), " ").into_owned();
        let numbers: Vec<i64> = DIGIT_WORD_RE.find_iter(&scrubbed).filter_map(|m| m.as_str().parse::<i64>().ok()).collect();
        if numbers.is_empty() {
            return None;
        }
        if let Some(&last_plausible) = numbers.iter().filter(|&&n| (2..=200).contains(&n)).last() {
            return Some(last_plausible as f64);
        }
        if numbers.len() == 1 && (1..=200).contains(&numbers[0]) {
            return Some(numbers[0] as f64);
        }
        None
    }
}

impl ParserHandler for FixpriceHandler {
    fn name(&self) -> &'static str {
        "fixprice"
    }

    fn parse_title(&self, normalizer: &dyn TextNormalizer, title: &str) -> TitleNormalizationResult {
        let raw = title.trim().to_string();
        let parts = self.split_by_commas(&raw);

        let name_original = parts.first().cloned().unwrap_or_else(|| raw.clone());
        let brand = self.guess_brand(&parts);

        let no_assort = ASSORT_RE.replace_all(&raw, "");
        let title_wo_assort = no_assort.trim_matches(|c: char| c == ',' || c.is_whitespace()).to_string();

        let mut package_quantity = None;
        let mut package_unit = None;
        if let Some(caps) = WVL_RE.captures(&title_wo_assort) {
            let (q, u) = to_package_quantity(&caps["q"], &caps["u"]);
            package_quantity = q;
            package_unit = u;
        }
        let count = self.extract_count_heuristic(&title_wo_assort);

        let mut unit = Unit::Piece;
        let mut available_count = count;
        if BY_WEIGHT_RE.is_match(&title_wo_assort) {
            unit = Unit::Kilogram;
            available_count = None;
            package_quantity = None;
            package_unit = None;
        } else if BY_VOLUME_RE.is_match(&title_wo_assort) {
            unit = Unit::Litre;
            available_count = None;
            package_quantity = None;
            package_unit = None;
        }

        let name_for_normalization = match &brand {
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

    /// FixPrice is the one handler that goes beyond the shared lowercase
    /// + whitespace-collapse default for categories: it also lemmatizes
    /// and strips stop-words, falling back to the lemmatized form alone
    /// when stop-word removal would empty it out.
    fn normalize_category(&self, normalizer: &dyn TextNormalizer, raw: &str) -> Option<String> {
        let collapsed = simple_normalize_string(raw)?;
        normalize_descriptive_text(normalizer, &collapsed)
    }

    /// FixPrice additionally tidies comma spacing in the composition list
    /// after the shared lowercase + whitespace-collapse normalization.
    fn normalize_composition(&self, _normalizer: &dyn TextNormalizer, raw: &str) -> Option<String> {
        let collapsed = simple_normalize_string(raw)?;
        Some(COMMA_SPACES_RE.replace_all(&collapsed, ", ").into_owned())
    }
}

static COMMA_SPACES_RE: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"\s*,\s*").unwrap());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::text::RussianTextNormalizer;

    #[test]
    fn gel_pen_scenario_splits_head_segment_and_brand() {
        let handler = FixpriceHandler::new();
        let normalizer = RussianTextNormalizer::new();
        let result = handler.parse_title(&normalizer, "Ручка гелевая \"Помада\", With Love, 10х1,5 см, в ассортименте");
        assert_eq!(result.name_original, "Ручка гелевая \"Помада\"");
        assert_eq!(result.brand.as_deref(), Some("With Love"));
        assert_eq!(result.unit, Unit::Piece);
        assert_eq!(result.original_name_no_stopwords, "ручка гелевая помада");
        assert_eq!(result.available_count, None);
    }

    #[test]
    fn package_and_explicit_count_scenario() {
        let handler = FixpriceHandler::new();
        let normalizer = RussianTextNormalizer::new();
        let result = handler.parse_title(&normalizer, "Шоколад молочный, 200 г, 15 шт, в ассортименте");
        assert_eq!(result.unit, Unit::Piece);
        assert_eq!(result.available_count, Some(15.0));
        assert_eq!(result.package_unit, Some(PackageUnit::Kilogram));
        assert_eq!(result.package_quantity, Some(0.2));
    }

    #[test]
    fn by_weight_phrase_overrides_any_package_token() {
        let handler = FixpriceHandler::new();
        let normalizer = RussianTextNormalizer::new();
        let result = handler.parse_title(&normalizer, "Сыр весовой, 200 г");
        assert_eq!(result.unit, Unit::Kilogram);
        assert_eq!(result.package_quantity, None);
    }

    #[test]
    fn no_second_segment_means_no_brand() {
        let handler = FixpriceHandler::new();
        let normalizer = RussianTextNormalizer::new();
        let result = handler.parse_title(&normalizer, "Печенье овсяное 300 г");
        assert_eq!(result.brand, None);
    }

    #[test]
    fn second_segment_with_dimension_is_not_treated_as_brand() {
        let handler = FixpriceHandler::new();
        let normalizer = RussianTextNormalizer::new();
        let result = handler.parse_title(&normalizer, "Вода питьевая, 0,5 л, 6 бутылок, в ассортименте");
        assert_eq!(result.brand, None);
        assert_eq!(result.package_unit, Some(PackageUnit::Litre));
        assert_eq!(result.available_count, Some(6.0));
    }
}
