// ── Airborne Engine: Model Pricing ─────────────────────────────────────────
// Per-million-token prices. Lookup resolves by exact model name first, then
// by longest matching prefix; a miss marks the cost unknown and charges 0.

use std::collections::HashMap;

use crate::atoms::types::ModelPrice;

/// The pricing table plus the computed cost of one call.
pub struct PricingTable {
    exact: HashMap<String, ModelPrice>,
    /// Prefix entries, sorted longest-first at construction.
    prefixes: Vec<(String, ModelPrice)>,
}

/// Computed cost for one generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost {
    pub usd: f64,
    /// Set when the model was absent from the table.
    pub unknown: bool,
}

impl PricingTable {
    pub fn new(
        exact: HashMap<String, ModelPrice>,
        mut prefixes: Vec<(String, ModelPrice)>,
    ) -> Self {
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        PricingTable { exact, prefixes }
    }

    /// The built-in table for the providers the gateway fronts.
    /// (input_per_mtok, output_per_mtok), USD.
    pub fn builtin() -> Self {
        let p = |input: f64, output: f64| ModelPrice { input, output };
        let prefixes = vec![
            // Anthropic
            ("claude-3-haiku".to_string(), p(0.25, 1.25)),
            ("claude-haiku-4".to_string(), p(1.00, 5.00)),
            ("claude-3-5-sonnet".to_string(), p(3.00, 15.00)),
            ("claude-sonnet-4".to_string(), p(3.00, 15.00)),
            ("claude-3-opus".to_string(), p(15.00, 75.00)),
            ("claude-opus-4".to_string(), p(15.00, 75.00)),
            // Google
            ("gemini-2.5-flash-lite".to_string(), p(0.05, 0.20)),
            ("gemini-2.5-flash".to_string(), p(0.15, 0.60)),
            ("gemini-2.0-flash".to_string(), p(0.15, 0.60)),
            ("gemini-2.5-pro".to_string(), p(1.25, 10.00)),
            ("gemini-1.5-pro".to_string(), p(1.25, 10.00)),
            // OpenAI
            ("gpt-4o-mini".to_string(), p(0.15, 0.60)),
            ("gpt-4.1-mini".to_string(), p(0.40, 1.60)),
            ("gpt-4.1-nano".to_string(), p(0.10, 0.40)),
            ("gpt-4o".to_string(), p(2.50, 10.00)),
            ("gpt-4.1".to_string(), p(2.00, 8.00)),
            ("o4-mini".to_string(), p(1.10, 4.40)),
            ("o3-mini".to_string(), p(1.10, 4.40)),
            ("o3".to_string(), p(10.00, 40.00)),
            ("o1".to_string(), p(10.00, 40.00)),
            // DeepSeek
            ("deepseek-chat".to_string(), p(0.27, 1.10)),
            ("deepseek-reasoner".to_string(), p(0.55, 2.19)),
            // Grok
            ("grok-3".to_string(), p(3.00, 15.00)),
            // Mistral
            ("mistral-large".to_string(), p(2.00, 6.00)),
            ("mistral-small".to_string(), p(0.20, 0.60)),
            // Perplexity
            ("sonar-pro".to_string(), p(3.00, 15.00)),
            ("sonar".to_string(), p(1.00, 1.00)),
        ];
        PricingTable::new(HashMap::new(), prefixes)
    }

    /// Exact match first, then longest matching prefix.
    pub fn price(&self, model: &str) -> Option<ModelPrice> {
        // Normalize: strip routing prefixes like "anthropic/".
        let m = model.split('/').next_back().unwrap_or(model);
        if let Some(p) = self.exact.get(m) {
            return Some(*p);
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| m.starts_with(prefix.as_str()))
            .map(|(_, p)| *p)
    }

    /// USD cost for one call. Unknown model → 0, flagged.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Cost {
        match self.price(model) {
            Some(p) => Cost {
                usd: input_tokens as f64 * p.input / 1_000_000.0
                    + output_tokens as f64 * p.output / 1_000_000.0,
                unknown: false,
            },
            None => Cost { usd: 0.0, unknown: true },
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_over_prefix() {
        let mut exact = HashMap::new();
        exact.insert("gpt-4o-2024-08-06".to_string(), ModelPrice { input: 9.0, output: 9.0 });
        let table = PricingTable::new(
            exact,
            vec![("gpt-4o".to_string(), ModelPrice { input: 2.5, output: 10.0 })],
        );
        assert_eq!(table.price("gpt-4o-2024-08-06").unwrap().input, 9.0);
        assert_eq!(table.price("gpt-4o-mini-x").unwrap().input, 2.5);
    }

    #[test]
    fn longest_prefix_wins() {
        let table = PricingTable::new(
            HashMap::new(),
            vec![
                ("gpt-4o".to_string(), ModelPrice { input: 2.5, output: 10.0 }),
                ("gpt-4o-mini".to_string(), ModelPrice { input: 0.15, output: 0.6 }),
            ],
        );
        assert_eq!(table.price("gpt-4o-mini-2024").unwrap().input, 0.15);
        assert_eq!(table.price("gpt-4o-2024").unwrap().input, 2.5);
    }

    #[test]
    fn cost_arithmetic_matches_per_million_rates() {
        let table = PricingTable::new(
            HashMap::new(),
            vec![("m".to_string(), ModelPrice { input: 5.0, output: 15.0 })],
        );
        let cost = table.cost("m-large", 1000, 2000);
        assert!(!cost.unknown);
        assert!((cost.usd - 0.035).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_is_zero_and_flagged() {
        let table = PricingTable::builtin();
        let cost = table.cost("totally-unknown-model", 1000, 1000);
        assert_eq!(cost.usd, 0.0);
        assert!(cost.unknown);
    }

    #[test]
    fn routing_prefixes_are_stripped() {
        let table = PricingTable::builtin();
        let direct = table.price("claude-sonnet-4-20250514").unwrap();
        let routed = table.price("anthropic/claude-sonnet-4-20250514").unwrap();
        assert_eq!(direct, routed);
    }
}
