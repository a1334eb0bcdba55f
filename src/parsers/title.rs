//! Regex tables shared by every per-source title parser.
//!
//! Centralized here (rather than duplicated per parser file) since
//! fixprice/chizhik/perekrestok draw from the same small set of
//! weight/volume/multipack/assortment patterns.

use once_cell::sync::Lazy;
use regex::Regex;

pub static ASSORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bв\s+ассортименте\b").unwrap());

pub static DIM_CM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?P<a>\d+(?:[.,]\d+)?)\s*[xх×]\s*(?P<b>\d+(?:[.,]\d+)?)(?:\s*[xх×]\s*(?P<c>\d+(?:[.,]\d+)?))?\s*см\b").unwrap()
});

pub static WVL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?P<q>\d+(?:[.,]\d+)?)\s*(?P<u>г|кг|мл|л|l)\b").unwrap());

pub static MULTIPACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?P<count>\d+)\s*[xх×]\s*(?P<q>\d+(?:[.,]\d+)?)\s*(?P<u>г|кг|мл|л|l)\b").unwrap()
});

pub static PACKAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?P<q>\d+(?:[.,]\d+)?)\s*(?P<u>г|кг|мл|л|l)\b").unwrap());

pub static PIECE_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?P<count>\d+)\s*(?:шт|штук)\b").unwrap());

pub static BY_WEIGHT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(весов(?:ой|ая|ые)?|на\s+вес)\b").unwrap());

pub static BY_VOLUME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(на\s+розлив|розлив|разлив)\b").unwrap());

pub static MULTISPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
pub static LATIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[a-z]").unwrap());
pub static DIGIT_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+\b").unwrap());

/// Parses a `q`/`u` capture pair (weight or volume token) into
/// `(package_quantity, package_unit)`, converting grams/millilitres down to
/// kilograms/litres.
pub fn to_package_quantity(quantity_raw: &str, unit_raw: &str) -> (Option<f64>, Option<crate::domain::PackageUnit>) {
    use crate::domain::PackageUnit;

    let quantity = match to_float(quantity_raw) {
        Some(q) => q,
        None => return (None, None),
    };
    match unit_raw.to_lowercase().as_str() {
        "г" => (Some(quantity / 1000.0), Some(PackageUnit::Kilogram)),
        "кг" => (Some(quantity), Some(PackageUnit::Kilogram)),
        "мл" => (Some(quantity / 1000.0), Some(PackageUnit::Litre)),
        "л" | "l" => (Some(quantity), Some(PackageUnit::Litre)),
        _ => (None, None),
    }
}

pub fn to_float(value: &str) -> Option<f64> {
    value.replace(',', ".").trim().parse::<f64>().ok()
}

pub fn is_uppercase_word(word: &str) -> bool {
    let letters: Vec<char> = word.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return false;
    }
    letters.iter().all(|c| c.to_uppercase().next() == Some(*c))
}

pub fn is_title_case_word(word: &str) -> bool {
    for ch in word.chars() {
        if ch.is_alphabetic() {
            return ch.to_uppercase().next() == Some(ch);
        }
    }
    false
}

/// Strips the non-word wrapping characters a token is trimmed of before
/// being classified as a brand candidate.
pub fn trim_word_punctuation(word: &str) -> &str {
    word.trim_matches(|c: char| ".,;:()[]{}\"'«»".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assort_strips_phrase() {
        let out = ASSORT_RE.replace_all("шоколад в ассортименте", "");
        assert_eq!(out.trim(), "шоколад");
    }

    #[test]
    fn wvl_matches_grams() {
        let caps = WVL_RE.captures("шоколад 200 г").unwrap();
        assert_eq!(&caps["q"], "200");
        assert_eq!(&caps["u"], "г");
    }

    #[test]
    fn to_package_quantity_converts_grams_to_kg() {
        let (q, u) = to_package_quantity("200", "г");
        assert_eq!(q, Some(0.2));
        assert_eq!(u, Some(crate::domain::PackageUnit::Kilogram));
    }

    #[test]
    fn uppercase_and_title_case_detection() {
        assert!(is_uppercase_word("ABC"));
        assert!(!is_uppercase_word("Abc1"));
        assert!(is_title_case_word("Abc"));
        assert!(!is_title_case_word("abc"));
    }
}
