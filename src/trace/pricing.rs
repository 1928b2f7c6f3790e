use serde::{Deserialize, Serialize};

/// Price of one model, in cents per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

impl ModelPrice {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    pub fn cost_cents(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input + (output_tokens as f64 / 1000.0) * self.output
    }
}

pub const DEFAULT_PRICE: ModelPrice = ModelPrice::new(0.1, 0.1);

const KNOWN_PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4", ModelPrice::new(3.0, 6.0)),
    ("gpt-4-turbo", ModelPrice::new(1.0, 3.0)),
    ("gpt-4o", ModelPrice::new(0.5, 1.5)),
    ("gpt-4o-mini", ModelPrice::new(0.015, 0.06)),
    ("gpt-3.5-turbo", ModelPrice::new(0.05, 0.15)),
    ("text-embedding-3-small", ModelPrice::new(0.002, 0.0)),
    ("text-embedding-3-large", ModelPrice::new(0.013, 0.0)),
    ("claude-3-opus", ModelPrice::new(1.5, 7.5)),
    ("claude-3-sonnet", ModelPrice::new(0.3, 1.5)),
    ("claude-3-haiku", ModelPrice::new(0.025, 0.125)),
    ("claude-3.5-sonnet", ModelPrice::new(0.3, 1.5)),
    ("gemini-1.5-pro", ModelPrice::new(0.125, 0.375)),
    ("gemini-1.5-flash", ModelPrice::new(0.0375, 0.15)),
    ("gemini-2.0-flash", ModelPrice::new(0.1, 0.4)),
    ("llama-3.1-70b", ModelPrice::new(0.059, 0.079)),
    ("llama-3.1-8b", ModelPrice::new(0.005, 0.008)),
    ("mixtral-8x7b", ModelPrice::new(0.024, 0.024)),
];

/// Model id patterns mapped to prices. A model id uses the longest pattern it contains,
/// so `gpt-4o-mini-2024-07-18` prices as `gpt-4o-mini` rather than `gpt-4`.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    entries: Vec<(String, ModelPrice)>,
    fallback: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            entries: KNOWN_PRICES
                .iter()
                .map(|(pattern, price)| (pattern.to_string(), *price))
                .collect(),
            fallback: DEFAULT_PRICE,
        }
    }
}

impl PriceTable {
    pub fn empty(fallback: ModelPrice) -> Self {
        Self {
            entries: Vec::new(),
            fallback,
        }
    }

    /// Add or replace the price for a pattern.
    pub fn with_price(mut self, pattern: &str, price: ModelPrice) -> Self {
        let pattern = pattern.to_lowercase();
        match self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = price,
            None => self.entries.push((pattern, price)),
        }
        self
    }

    pub fn price_for(&self, model_id: &str) -> ModelPrice {
        let model_id = model_id.to_lowercase();
        self.entries
            .iter()
            .filter(|(pattern, _)| model_id.contains(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
            .map_or(self.fallback, |(_, price)| *price)
    }

    /// Unknown models are charged the fallback price; this never fails.
    pub fn cost_cents(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.price_for(model_id).cost_cents(input_tokens, output_tokens)
    }
}

/// Cost in cents under the built-in price table.
pub fn calculate_cost(model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    PriceTable::default().cost_cents(model_id, input_tokens, output_tokens)
}

