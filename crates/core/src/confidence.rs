use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub stats_provider: f32,
    pub obb_found: f32,
    pub external_data_found: f32,
    pub content_index: f32,
    pub limitation_penalty: f32,
    pub basic_baseline: f32,
    pub fallback: f32,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            stats_provider: 0.6,
            obb_found: 0.1,
            external_data_found: 0.15,
            content_index: 0.15,
            limitation_penalty: 0.05,
            basic_baseline: 0.7,
            fallback: 0.3,
        }
    }
}

impl ConfidenceWeights {
    pub(crate) fn fields(&self) -> [(&'static str, f32); 7] {
        [
            ("weights.stats_provider", self.stats_provider),
            ("weights.obb_found", self.obb_found),
            ("weights.external_data_found", self.external_data_found),
            ("weights.content_index", self.content_index),
            ("weights.limitation_penalty", self.limitation_penalty),
            ("weights.basic_baseline", self.basic_baseline),
            ("weights.fallback", self.fallback),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfidenceInputs {
    pub stats_ok: bool,
    pub obb_found: bool,
    pub external_data_found: bool,
    pub content_index_ok: bool,
    pub limitations: usize,
}

pub fn score(weights: &ConfidenceWeights, inputs: &ConfidenceInputs) -> f32 {
    let mut score = 0.0_f32;
    if inputs.stats_ok {
        score += weights.stats_provider;
    }
    if inputs.obb_found {
        score += weights.obb_found;
    }
    if inputs.external_data_found {
        score += weights.external_data_found;
    }
    if inputs.content_index_ok {
        score += weights.content_index;
    }
    score -= weights.limitation_penalty * inputs.limitations as f32;
    score.clamp(0.0, 1.0)
}
