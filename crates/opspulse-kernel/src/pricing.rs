//! LLM pricing table

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Model used when a table does not name one.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Per-model pricing (USD per 1,000 tokens)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

impl ModelPricing {
    pub fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    pub fn free() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1000.0) * self.input;
        let output_cost = (output_tokens as f64 / 1000.0) * self.output;
        input_cost + output_cost
    }
}

/// Where a resolved price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingSource {
    /// The model has its own entry.
    Configured,
    /// The model is unknown and the default model's price was used.
    DefaultTier,
    /// Neither the model nor the default model is priced; cost is zero.
    Unpriced,
}

/// The full pricing table. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingTable {
    pub default_model: String,
    pub models: BTreeMap<String, ModelPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PricingTable {
    /// Built-in prices for the two reference tiers.
    pub fn with_defaults() -> Self {
        let mut models = BTreeMap::new();
        models.insert("gpt-3.5-turbo".to_string(), ModelPricing::new(0.0015, 0.002));
        models.insert("gpt-4".to_string(), ModelPricing::new(0.03, 0.06));

        Self {
            default_model: DEFAULT_MODEL.to_string(),
            models,
        }
    }

    pub fn empty() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            models: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    /// Configured pricing for `model`, without any fallback.
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Price for `model`, falling back to the default model's tier.
    pub fn resolve(&self, model: &str) -> (ModelPricing, PricingSource) {
        if let Some(pricing) = self.models.get(model) {
            return (*pricing, PricingSource::Configured);
        }
        match self.models.get(&self.default_model) {
            Some(pricing) => (*pricing, PricingSource::DefaultTier),
            None => (ModelPricing::free(), PricingSource::Unpriced),
        }
    }

    /// Rejects negative or non-finite prices.
    pub fn validate(&self) -> KernelResult<()> {
        for (model, pricing) in &self.models {
            for (side, value) in [("input", pricing.input), ("output", pricing.output)] {
                if !value.is_finite() || value < 0.0 {
                    return Err(KernelError::InvalidPricing {
                        model: model.clone(),
                        reason: format!("{side} price must be a non-negative number, got {value}"),
                    });
                }
            }
        }
        if self.default_model.trim().is_empty() {
            return Err(KernelError::InvalidPricing {
                model: String::new(),
                reason: "default_model must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
