// ABOUTME: Cumulative token usage, model and last error written by the owning agent session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub truncation_count: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, response_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            response_tokens,
            total_tokens: prompt_tokens + response_tokens,
            truncation_count: 0,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.response_tokens += other.response_tokens;
        self.total_tokens += other.total_tokens;
        self.truncation_count += other.truncation_count;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AgentState {
    pub fn cost(&self) -> f64 {
        estimate_cost(&self.model, &self.token_usage)
    }
}

/// USD per million tokens as (prompt, response), matched by model prefix.
const PRICING: &[(&str, f64, f64)] = &[
    ("claude-3-haiku", 0.25, 1.25),
    ("claude-3-5-haiku", 0.80, 4.0),
    ("claude-opus", 15.0, 75.0),
    ("claude", 3.0, 15.0),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.0),
    ("gemini-1.5-flash", 0.075, 0.30),
    ("gemini", 1.25, 5.0),
];

const DEFAULT_PRICING: (f64, f64) = (3.0, 15.0);

pub fn estimate_cost(model: &str, usage: &TokenUsage) -> f64 {
    let model = model.to_lowercase();
    let (prompt_rate, response_rate) = PRICING
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map_or(DEFAULT_PRICING, |(_, p, r)| (*p, *r));

    (usage.prompt_tokens as f64 * prompt_rate + usage.response_tokens as f64 * response_rate)
        / 1_000_000.0
}

/// Rough token estimate, about four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }
    (trimmed.chars().count() / 4 + 1) as u64
}
