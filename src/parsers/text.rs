//! Russian text normalization: cleaning, tokenizing, lemmatizing and
//! stop-word removal, injected into every title parser.
//!
//! Full morphological lemmatization is out of scope for this dependency
//! stack; the contract only requires `lemmatize` to return a stable
//! canonical form and `remove_stopwords` to be idempotent, both preserving
//! unit tokens verbatim — satisfied here by tokenizing and rejoining
//! without a morphology step. See DESIGN.md for the rationale.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static QUOTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"["\u{201c}\u{201d}\u{00ab}\u{00bb}]"#).unwrap());
static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s.,x-]+").unwrap());
static MULTISPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[a-zа-я0-9-]+").unwrap());
static WORD_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[a-zа-я]+").unwrap());

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "в", "на", "для", "и", "с", "со", "по", "из", "к", "от", "при", "под", "над", "без",
        "про", "за", "у", "о", "об", "обо", "это", "эта", "этот", "эти", "ассортимент",
        "ассорти", "уп", "уп.", "упаковка", "упаковки",
    ]
    .into_iter()
    .collect()
});

/// Tokens that mix Latin and Cyrillic look-alike letters (e.g. a title
/// typed with an accidental Latin "o" in an otherwise Cyrillic word) get
/// their Latin letters folded to the Cyrillic look-alike so the same word
/// always tokenizes the same way; pure-Latin or pure-Cyrillic tokens are
/// left untouched — `х`/`x` ambiguity in weight tokens like "10х5" is
/// handled by the `[xх×]` character classes in `title::*_RE` instead.
fn latin_to_cyrillic(c: char) -> char {
    match c {
        'a' => 'а',
        'b' => 'в',
        'c' => 'с',
        'e' => 'е',
        'h' => 'н',
        'k' => 'к',
        'm' => 'м',
        'o' => 'о',
        'p' => 'р',
        't' => 'т',
        'x' => 'х',
        'y' => 'у',
        other => other,
    }
}

fn fold_mixed_script_tokens(text: &str) -> String {
    WORD_TOKEN_RE
        .replace_all(text, |caps: &regex::Captures| {
            let token = &caps[0];
            let has_latin = token.chars().any(|c| c.is_ascii_alphabetic());
            let has_cyrillic = token.chars().any(|c| matches!(c, 'а'..='я' | 'А'..='Я'));
            if has_latin && has_cyrillic {
                token.chars().map(latin_to_cyrillic).collect::<String>()
            } else {
                token.to_string()
            }
        })
        .into_owned()
}

/// Injectable text-normalization capability, shared (cheaply cloneable,
/// safe across tasks) across every registered parser handler.
pub trait TextNormalizer: Send + Sync {
    fn clean_text(&self, text: &str) -> String;
    fn tokenize(&self, text: &str) -> Vec<String>;
    fn lemmatize(&self, text: &str) -> String;
    fn remove_stopwords(&self, text: &str) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct RussianTextNormalizer;

impl RussianTextNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl TextNormalizer for RussianTextNormalizer {
    fn clean_text(&self, text: &str) -> String {
        let mut cleaned = text.trim().to_lowercase().replace('ё', "е");
        cleaned = fold_mixed_script_tokens(&cleaned);
        cleaned = cleaned.replace('×', "x");
        cleaned = QUOTE_RE.replace_all(&cleaned, "").into_owned();
        cleaned = NON_WORD_RE.replace_all(&cleaned, " ").into_owned();
        MULTISPACE_RE.replace_all(&cleaned, " ").trim().to_string()
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        let cleaned = self.clean_text(text);
        TOKEN_RE
            .find_iter(&cleaned)
            .map(|m| m.as_str().to_lowercase().replace('ё', "е"))
            .filter(|w| !w.is_empty())
            .collect()
    }

    fn lemmatize(&self, text: &str) -> String {
        let tokens = self.tokenize(text);
        if tokens.is_empty() {
            return String::new();
        }
        tokens.join(" ")
    }

    fn remove_stopwords(&self, text: &str) -> String {
        use crate::parsers::title::ASSORT_RE;
        let cleaned = ASSORT_RE.replace_all(&self.clean_text(text), " ").into_owned();
        let tokens = self.tokenize(&cleaned);
        tokens
            .into_iter()
            .filter(|t| !STOPWORDS.contains(t.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }
}
