//! Perekrestok is a distinct registry entry but shares 100% of its title
//! parsing behavior with [`super::chizhik::ChizhikHandler`] — upstream it's
//! a subclass with no overrides, so here it calls the same routine rather
//! than duplicating it.

use crate::domain::TitleNormalizationResult;
use crate::parsers::chizhik::parse_chizhik_style;
use crate::parsers::text::TextNormalizer;
use crate::parsers::ParserHandler;

#[derive(Debug, Clone, Default)]
pub struct PerekrestokHandler;

impl PerekrestokHandler {
    pub fn new() -> Self {
        Self
    }
}

impl ParserHandler for PerekrestokHandler {
    fn name(&self) -> &'static str {
        "perekrestok"
    }

    fn parse_title(&self, normalizer: &dyn TextNormalizer, title: &str) -> TitleNormalizationResult {
        parse_chizhik_style(normalizer, title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::text::RussianTextNormalizer;

    #[test]
    fn behaves_identically_to_chizhik_but_reports_its_own_name() {
        let handler = PerekrestokHandler::new();
        let normalizer = RussianTextNormalizer::new();
        let result = handler.parse_title(&normalizer, "Вода 6x1.5 л Aqua Minerale");
        assert_eq!(handler.name(), "perekrestok");
        assert_eq!(result.package_quantity, Some(1.5));
        assert_eq!(result.available_count, Some(6.0));
    }
}
