//! Sampling knobs derived from a single randomness strength.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;

pub const MAX_STRENGTH: f64 = 3.0;

/// Probabilities and exponents used while sampling.
///
/// Strength 0 means plain count-weighted sampling with no exploration and no
/// context jumps. Raising it flattens the weights, adds uniform picks and
/// makes the generator restart from a fresh opening more often.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub next_explore: f64,
    pub start_explore: f64,
    pub next_power: f64,
    pub start_power: f64,
    pub jump_probability: f64,
}

impl Tuning {
    pub fn from_strength(strength: f64) -> Self {
        let s = if strength.is_nan() {
            0.0
        } else {
            strength.clamp(0.0, MAX_STRENGTH)
        };
        Self {
            next_explore: (0.12 * s).min(0.35),
            start_explore: (0.2 * s).min(0.55),
            next_power: (1.0 - 0.22 * s).max(0.35),
            start_power: (1.0 - 0.25 * s).max(0.25),
            jump_probability: (0.05 * s).min(0.15),
        }
    }
}

/// Picks an index into `counts`: uniformly with probability `explore`,
/// otherwise weighted by `max(count, 1) ^ power`. `None` for an empty slice.
pub fn choose_index<R: Rng + ?Sized>(
    rng: &mut R,
    counts: &[i64],
    explore: f64,
    power: f64,
) -> Option<usize> {
    if counts.is_empty() {
        return None;
    }
    if explore > 0.0 && rng.random_bool(explore.clamp(0.0, 1.0)) {
        return Some(rng.random_range(0..counts.len()));
    }
    let weights = counts.iter().map(|&c| (c.max(1) as f64).powf(power));
    match WeightedIndex::<f64>::new(weights) {
        Ok(dist) => Some(dist.sample(rng)),
        Err(_) => Some(rng.random_range(0..counts.len())),
    }
}
