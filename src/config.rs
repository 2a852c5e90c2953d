use crate::markov::GenerateRequest;
use anyhow::{anyhow, bail};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub chat_id: i64,
    pub author_id: i64,
    pub reply_probability: f64,
    pub min_tokens_for_model: i64,
    pub max_reply_chars: usize,
    pub normalize_lower: bool,

    // Generation settings
    pub randomness_strength: f64,
    pub markov_order: usize,
    pub enable_backoff: bool,
    pub backoff_min_order: usize,
    pub generation_attempts: usize,
    pub transition_cache_capacity: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let config = Config {
            database_url: env::var("DB_PATH").unwrap_or_else(|_| "markov.db".to_string()),
            chat_id: parse_var("CHAT_ID", 0)?,
            author_id: parse_var("AUTHOR_ID", 0)?,
            reply_probability: parse_var("REPLY_PROBABILITY", 0.08)?,
            min_tokens_for_model: parse_var("MIN_TOKENS_FOR_MODEL", 200)?,
            max_reply_chars: parse_var("MAX_REPLY_CHARS", 280)?,
            normalize_lower: bool_var("NORMALIZE_LOWER", false)?,
            randomness_strength: parse_var("RANDOMNESS_STRENGTH", 1.0)?,
            markov_order: parse_var("MARKOV_ORDER", 3)?,
            enable_backoff: bool_var("ENABLE_BACKOFF", true)?,
            backoff_min_order: parse_var("BACKOFF_MIN_ORDER", 1)?,
            generation_attempts: parse_var("GENERATION_ATTEMPTS", 4)?,
            transition_cache_capacity: parse_var("TRANSITION_CACHE_CAPACITY", 768)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.reply_probability) {
            bail!("REPLY_PROBABILITY must be in range [0..1]");
        }
        if self.min_tokens_for_model < 0 {
            bail!("MIN_TOKENS_FOR_MODEL must not be negative");
        }
        if !(20..=4000).contains(&self.max_reply_chars) {
            bail!("MAX_REPLY_CHARS must be in range [20..4000]");
        }
        if !(0.0..=3.0).contains(&self.randomness_strength) {
            bail!("RANDOMNESS_STRENGTH must be in range [0..3]");
        }
        if !matches!(self.markov_order, 2 | 3) {
            bail!("MARKOV_ORDER must be 2 or 3");
        }
        if !matches!(self.backoff_min_order, 1 | 2) || self.backoff_min_order >= self.markov_order {
            bail!("BACKOFF_MIN_ORDER must be 1 or 2 and below MARKOV_ORDER");
        }
        if self.generation_attempts == 0 {
            bail!("GENERATION_ATTEMPTS must be at least 1");
        }
        if self.transition_cache_capacity == 0 {
            bail!("TRANSITION_CACHE_CAPACITY must be at least 1");
        }
        Ok(())
    }

    /// Generation parameters for a reply, with an optional one-shot seed.
    pub fn generate_request(&self, seed: Option<Vec<String>>) -> GenerateRequest {
        GenerateRequest::default()
            .with_max_chars(self.max_reply_chars)
            .with_seed(seed)
            .with_randomness(self.randomness_strength)
            .with_order(self.markov_order)
            .with_backoff(self.enable_backoff, self.backoff_min_order)
            .with_normalize_lower(self.normalize_lower)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

fn bool_var(name: &str, default: bool) -> anyhow::Result<bool> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            parse_bool(&raw).ok_or_else(|| anyhow!("{} must be a boolean, got {}", name, raw))
        }
        _ => Ok(default),
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
