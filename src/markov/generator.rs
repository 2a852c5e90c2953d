use crate::cache::TransitionCache;
use crate::db::{NgramStore, Start, StoreResult, Successor};
use crate::markov::tokenize::detokenize;
use crate::markov::tuning::{choose_index, Tuning};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Hard ceiling on extension steps per generation.
pub const DEFAULT_MAX_STEPS: usize = 85;
/// Shorter outputs are discarded.
pub const MIN_OUTPUT_CHARS: usize = 5;
/// Context jumps are only considered once the output is longer than this.
const JUMP_AFTER_TOKENS: usize = 6;
const GUARD_STRENGTH: f64 = 1.5;
const GUARD_TOKENS: usize = 10;

/// Parameters of a single generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub max_chars: usize,
    pub seed: Option<Vec<String>>,
    pub randomness_strength: f64,
    /// Primary order, 2 or 3.
    pub order: usize,
    pub enable_backoff: bool,
    /// Lowest order backoff may fall to, 1 or 2.
    pub backoff_min_order: usize,
    /// Tokens were learned lower-cased; stored messages are matched ignoring case.
    pub normalize_lower: bool,
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            max_chars: 280,
            seed: None,
            randomness_strength: 1.0,
            order: 3,
            enable_backoff: true,
            backoff_min_order: 1,
            normalize_lower: false,
        }
    }
}

impl GenerateRequest {
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn with_seed(mut self, seed: Option<Vec<String>>) -> Self {
        self.seed = seed.filter(|s| !s.is_empty());
        self
    }

    pub fn with_randomness(mut self, strength: f64) -> Self {
        self.randomness_strength = strength;
        self
    }

    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    pub fn with_backoff(mut self, enabled: bool, min_order: usize) -> Self {
        self.enable_backoff = enabled;
        self.backoff_min_order = min_order;
        self
    }

    pub fn with_normalize_lower(mut self, normalize_lower: bool) -> Self {
        self.normalize_lower = normalize_lower;
        self
    }

    fn primary_order(&self) -> usize {
        if self.order <= 2 {
            2
        } else {
            3
        }
    }

    fn lowest_order(&self) -> usize {
        let order = self.primary_order();
        if self.enable_backoff {
            self.backoff_min_order.clamp(1, order)
        } else {
            order
        }
    }
}

/// Samples new messages from a chat's stored n-gram counts.
///
/// Transition lookups are served through a [`TransitionCache`]; callers must
/// invalidate a chat after changing its counters (see
/// [`Generator::invalidate_chat_cache`]).
#[derive(Clone)]
pub struct Generator {
    store: NgramStore,
    cache: TransitionCache,
    max_steps: usize,
}

impl Generator {
    pub fn new(store: NgramStore, cache: TransitionCache) -> Self {
        Self {
            store,
            cache,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn store(&self) -> &NgramStore {
        &self.store
    }

    pub fn cache(&self) -> &TransitionCache {
        &self.cache
    }

    pub fn invalidate_chat_cache(&self, chat_id: i64) {
        let removed = self.cache.invalidate_chat(chat_id);
        if removed > 0 {
            debug!("Generator: dropped {} cached lookups for chat {}", removed, chat_id);
        }
    }

    fn transitions(
        &self,
        order: usize,
        chat_id: i64,
        prefix: &[String],
    ) -> StoreResult<Arc<Vec<Successor>>> {
        self.cache.get_or_load(order, chat_id, prefix, || {
            self.store.get_transitions(order, chat_id, prefix)
        })
    }

    /// Produces one message, or an empty string when no acceptable candidate
    /// came out. Only storage faults are errors.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        chat_id: i64,
        request: &GenerateRequest,
    ) -> StoreResult<String> {
        let order = request.primary_order();
        let lowest = request.lowest_order();
        let tuning = Tuning::from_strength(request.randomness_strength);
        let starts = self.store.get_starts(order, chat_id)?;

        let Some(mut generated) =
            self.resolve_start(rng, chat_id, order, request.seed.as_deref(), &starts, &tuning)?
        else {
            debug!("Generator: chat {} has no usable start", chat_id);
            return Ok(String::new());
        };

        let mut visited: HashSet<Vec<String>> = HashSet::new();
        visited.insert(tail(&generated, order).to_vec());
        let mut jumps = 0usize;

        for _ in 0..self.max_steps {
            if detokenize(&generated, usize::MAX).chars().count() >= request.max_chars {
                break;
            }

            if generated.len() > JUMP_AFTER_TOKENS
                && !starts.is_empty()
                && tuning.jump_probability > 0.0
                && rng.random_bool(tuning.jump_probability)
            {
                if let Some(start) = pick_start(rng, &starts, &tuning) {
                    generated.extend(start.tokens.iter().cloned());
                    visited.insert(tail(&generated, order).to_vec());
                    jumps += 1;
                    continue;
                }
            }

            let Some(token) =
                self.next_token(rng, chat_id, &generated, order, lowest, &visited, &tuning)?
            else {
                break;
            };
            generated.push(token);
            visited.insert(tail(&generated, order).to_vec());
        }

        let text = detokenize(&generated, request.max_chars);
        let rejection = match check_shape(&text, generated.len(), jumps, request.randomness_strength) {
            Some(reason) => Some(reason),
            None if self.is_stored(chat_id, &text, request.normalize_lower)? => {
                Some(Rejection::Verbatim)
            }
            None => None,
        };
        if let Some(reason) = rejection {
            debug!(
                "Generator: rejected candidate for chat {} ({:?}, {} tokens, {} jumps)",
                chat_id,
                reason,
                generated.len(),
                jumps
            );
            return Ok(String::new());
        }
        Ok(text)
    }

    fn is_stored(&self, chat_id: i64, text: &str, ignore_case: bool) -> StoreResult<bool> {
        if ignore_case {
            self.store.message_exists_ignore_case(chat_id, text)
        } else {
            self.store.message_exists(chat_id, text)
        }
    }

    /// Seed lookup first, then weighted openings. Always yields `order` tokens.
    fn resolve_start<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        chat_id: i64,
        order: usize,
        seed: Option<&[String]>,
        starts: &[Start],
        tuning: &Tuning,
    ) -> StoreResult<Option<Vec<String>>> {
        if let Some(seed) = seed {
            if order == 3 && seed.len() >= 3 {
                if let Some(start) = self.store.get_start_if_exists(3, chat_id, &seed[..3])? {
                    return Ok(Some(start.tokens));
                }
            }
            if seed.len() >= 2 {
                if let Some(start) = self.store.get_start_if_exists(2, chat_id, &seed[..2])? {
                    if let Some(tokens) = self.grow_start(rng, chat_id, start.tokens, order, tuning)? {
                        return Ok(Some(tokens));
                    }
                }
            }
        }

        if order == 3 {
            if let Some(start) = pick_start(rng, starts, tuning) {
                return Ok(Some(start.tokens.clone()));
            }
            let pairs = self.store.get_starts(2, chat_id)?;
            return match pick_start(rng, &pairs, tuning) {
                Some(start) => self.grow_start(rng, chat_id, start.tokens.clone(), order, tuning),
                None => Ok(None),
            };
        }

        Ok(pick_start(rng, starts, tuning).map(|s| s.tokens.clone()))
    }

    /// Extends a two-token opening by one sampled successor when the primary order is 3.
    fn grow_start<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        chat_id: i64,
        mut tokens: Vec<String>,
        order: usize,
        tuning: &Tuning,
    ) -> StoreResult<Option<Vec<String>>> {
        if tokens.len() >= order {
            return Ok(Some(tokens));
        }
        let rows = self.transitions(2, chat_id, &tokens)?;
        let candidates: Vec<&Successor> = rows.iter().collect();
        Ok(pick_successor(rng, &candidates, tuning).map(|next| {
            tokens.push(next);
            tokens
        }))
    }

    /// Samples the next token, backing off to lower orders when the primary
    /// context has no recorded continuation.
    #[allow(clippy::too_many_arguments)]
    fn next_token<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        chat_id: i64,
        generated: &[String],
        order: usize,
        lowest: usize,
        visited: &HashSet<Vec<String>>,
        tuning: &Tuning,
    ) -> StoreResult<Option<String>> {
        let context = tail(generated, order);
        let rows = self.transitions(order, chat_id, context)?;
        if !rows.is_empty() {
            let fresh: Vec<&Successor> = rows
                .iter()
                .filter(|s| !visited.contains(&shifted(context, &s.token)))
                .collect();
            let candidates = if fresh.is_empty() {
                rows.iter().collect()
            } else {
                fresh
            };
            return Ok(pick_successor(rng, &candidates, tuning));
        }

        for lower in (lowest..order).rev() {
            let rows = self.transitions(lower, chat_id, tail(generated, lower))?;
            if !rows.is_empty() {
                let candidates: Vec<&Successor> = rows.iter().collect();
                return Ok(pick_successor(rng, &candidates, tuning));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    TooShort,
    Verbatim,
    NoJumps,
}

/// Filters that need no storage access.
fn check_shape(text: &str, tokens: usize, jumps: usize, strength: f64) -> Option<Rejection> {
    if text.chars().count() < MIN_OUTPUT_CHARS {
        return Some(Rejection::TooShort);
    }
    // A long run with no restarts under high randomness is most likely a near copy.
    if strength >= GUARD_STRENGTH && tokens > GUARD_TOKENS && jumps == 0 {
        return Some(Rejection::NoJumps);
    }
    None
}

fn tail(tokens: &[String], n: usize) -> &[String] {
    &tokens[tokens.len().saturating_sub(n)..]
}

/// The window that results from appending `next` to `context`.
fn shifted(context: &[String], next: &str) -> Vec<String> {
    let mut window: Vec<String> = context.iter().skip(1).cloned().collect();
    window.push(next.to_string());
    window
}

fn pick_start<'a, R: Rng + ?Sized>(
    rng: &mut R,
    starts: &'a [Start],
    tuning: &Tuning,
) -> Option<&'a Start> {
    let counts: Vec<i64> = starts.iter().map(|s| s.count).collect();
    choose_index(rng, &counts, tuning.start_explore, tuning.start_power).map(|i| &starts[i])
}

fn pick_successor<R: Rng + ?Sized>(
    rng: &mut R,
    candidates: &[&Successor],
    tuning: &Tuning,
) -> Option<String> {
    let counts: Vec<i64> = candidates.iter().map(|s| s.count).collect();
    choose_index(rng, &counts, tuning.next_explore, tuning.next_power)
        .map(|i| candidates[i].token.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markov::tokenize::tokenize;
    use crate::markov::tuning::MAX_STRENGTH;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn generator() -> Generator {
        let store = NgramStore::open(":memory:").unwrap();
        Generator::new(store, TransitionCache::new(64))
    }

    fn learn(generator: &Generator, chat_id: i64, text: &str) {
        let tokens = tokenize(text, false);
        generator.store().ingest(chat_id, 1, text, &tokens).unwrap();
        generator.invalidate_chat_cache(chat_id);
    }

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_empty_chat_yields_nothing() {
        let generator = generator();
        let mut rng = StdRng::seed_from_u64(1);
        let text = generator
            .generate(&mut rng, 1, &GenerateRequest::default())
            .unwrap();
        assert_eq!(text, "");
    }

    #[test]
    fn test_seeded_generation_keeps_prefix_and_budget() {
        let generator = generator();
        learn(&generator, 4444, "Я очень люблю питон");
        learn(&generator, 4444, "Я очень люблю кофе");

        let request = GenerateRequest::default()
            .with_max_chars(12)
            .with_seed(Some(toks(&["Я", "очень", "люблю"])))
            .with_randomness(0.0);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let text = generator.generate(&mut rng, 4444, &request).unwrap();
            assert_eq!(text, "Я очень любл");
        }
    }

    #[test]
    fn test_never_returns_a_stored_message() {
        let generator = generator();
        learn(&generator, 1, "мы идём в кино сегодня вечером");

        let request = GenerateRequest::default().with_randomness(0.0);
        let mut rng = StdRng::seed_from_u64(5);
        // The only path through the model reproduces the message verbatim.
        assert_eq!(generator.generate(&mut rng, 1, &request).unwrap(), "");

        let mut rng = StdRng::seed_from_u64(5);
        let short = generator
            .generate(&mut rng, 1, &request.clone().with_max_chars(10))
            .unwrap();
        assert_eq!(short, "мы идём в");
    }

    fn chain(prefix: &str, len: usize) -> String {
        (1..=len)
            .map(|i| format!("{}{}", prefix, i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_lowercased_replay_is_rejected() {
        let generator = generator();
        let text = "Мы идём в кино сегодня вечером";
        generator
            .store()
            .ingest(11, 1, text, &tokenize(text, true))
            .unwrap();

        let request = GenerateRequest::default().with_randomness(0.0);
        let mut rng = StdRng::seed_from_u64(5);
        // An exact lookup misses the case-only difference.
        assert_eq!(
            generator.generate(&mut rng, 11, &request).unwrap(),
            "мы идём в кино сегодня вечером"
        );

        let mut rng = StdRng::seed_from_u64(5);
        let folded = request.with_normalize_lower(true);
        assert_eq!(generator.generate(&mut rng, 11, &folded).unwrap(), "");
    }

    #[test]
    fn test_context_jump_splices_a_fresh_opening() {
        let generator = generator();
        // Two disjoint chains: without a jump every walk replays a stored message.
        learn(&generator, 8, &chain("a", 9));
        learn(&generator, 8, &chain("b", 9));
        let openings = [toks(&["a1", "a2", "a3"]), toks(&["b1", "b2", "b3"])];

        let request = GenerateRequest::default().with_randomness(MAX_STRENGTH);
        let mut accepted = 0;
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let text = generator.generate(&mut rng, 8, &request).unwrap();
            if text.is_empty() {
                continue;
            }
            accepted += 1;
            let tokens: Vec<String> = text.split(' ').map(str::to_string).collect();
            assert!(tokens.len() > GUARD_TOKENS, "got {:?}", text);
            let spliced = tokens[JUMP_AFTER_TOKENS + 1..]
                .windows(3)
                .any(|w| openings.iter().any(|o| o.as_slice() == w));
            assert!(spliced, "no opening after the first {} tokens: {:?}", JUMP_AFTER_TOKENS, text);
        }
        assert!(accepted > 0);
    }

    #[test]
    fn test_no_jump_in_short_or_openless_output() {
        let generator = generator();
        // Six tokens never exceed the jump threshold, so every walk is a replay.
        learn(&generator, 9, &chain("c", JUMP_AFTER_TOKENS));
        learn(&generator, 9, &chain("d", JUMP_AFTER_TOKENS));
        // Two-token messages record no order-3 openings at all.
        learn(&generator, 10, "e1 e2");
        learn(&generator, 10, "f1 f2");

        let request = GenerateRequest::default().with_randomness(MAX_STRENGTH);
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert_eq!(generator.generate(&mut rng, 9, &request).unwrap(), "");
            assert_eq!(generator.generate(&mut rng, 10, &request).unwrap(), "");
        }
    }

    #[test]
    fn test_output_respects_budget_and_minimum() {
        let generator = generator();
        let corpus = [
            "кот сидит на окне и смотрит на птиц.",
            "пёс сидит на полу и смотрит в окно!",
            "кот спит на диване, а пёс гуляет.",
            "птицы сидят на ветке и поют песни.",
            "мы сидим на кухне и пьём чай.",
        ];
        for line in corpus {
            learn(&generator, 2, line);
        }

        for (i, max_chars) in [0usize, 3, 7, 15, 40, 120].into_iter().enumerate() {
            for strength in [0.0, 1.0, 2.0, 3.0] {
                let request = GenerateRequest::default()
                    .with_max_chars(max_chars)
                    .with_randomness(strength);
                let mut rng = StdRng::seed_from_u64(i as u64 * 31 + strength as u64);
                let text = generator.generate(&mut rng, 2, &request).unwrap();
                let len = text.chars().count();
                assert!(len <= max_chars, "{:?} exceeds {}", text, max_chars);
                assert!(text.is_empty() || len >= MIN_OUTPUT_CHARS);
            }
        }
    }

    #[test]
    fn test_backoff_extends_past_unseen_context() {
        let generator = generator();
        learn(&generator, 3, "a b c d");
        learn(&generator, 3, "x d e f");

        let mut rng = StdRng::seed_from_u64(9);
        let with_backoff = GenerateRequest::default()
            .with_randomness(0.0)
            .with_backoff(true, 1);
        let text = generator.generate(&mut rng, 3, &with_backoff).unwrap();
        // "x d e" can only reproduce its own message, which is rejected.
        assert!(text == "a b c d e f" || text.is_empty(), "got {:?}", text);

        let no_backoff = with_backoff.clone().with_backoff(false, 1);
        let mut rng = StdRng::seed_from_u64(9);
        let seeded = no_backoff.with_seed(Some(toks(&["a", "b", "c"])));
        // Without backoff the run stops at "a b c d", which is a stored message.
        assert_eq!(generator.generate(&mut rng, 3, &seeded).unwrap(), "");

        let mut rng = StdRng::seed_from_u64(9);
        let seeded = with_backoff.with_seed(Some(toks(&["a", "b", "c"])));
        assert_eq!(generator.generate(&mut rng, 3, &seeded).unwrap(), "a b c d e f");
    }

    #[test]
    fn test_two_token_seed_is_extended() {
        let generator = generator();
        learn(&generator, 4, "hello there general kenobi");
        learn(&generator, 4, "good morning everyone here");

        let request = GenerateRequest::default()
            .with_randomness(0.0)
            .with_max_chars(14)
            .with_seed(Some(toks(&["hello", "there"])));
        let mut rng = StdRng::seed_from_u64(2);
        assert_eq!(
            generator.generate(&mut rng, 4, &request).unwrap(),
            "hello there ge"
        );
    }

    #[test]
    fn test_order_two_start_fallback() {
        let generator = generator();
        // Two-token messages produce order-2 starts but no order-3 data.
        learn(&generator, 5, "good morning");
        learn(&generator, 5, "morning sunshine");

        let mut rng = StdRng::seed_from_u64(4);
        let request = GenerateRequest::default().with_randomness(0.0);
        // An opening pair with no order-2 continuation cannot form a three-token start.
        assert_eq!(generator.generate(&mut rng, 5, &request).unwrap(), "");
    }

    #[test]
    fn test_primary_order_two() {
        let generator = generator();
        learn(&generator, 6, "one two three four five");

        let request = GenerateRequest::default()
            .with_order(2)
            .with_randomness(0.0)
            .with_max_chars(13);
        let mut rng = StdRng::seed_from_u64(8);
        assert_eq!(generator.generate(&mut rng, 6, &request).unwrap(), "one two three");
    }

    #[test]
    fn test_loop_avoidance_prefers_unvisited_windows() {
        let generator = generator();
        learn(&generator, 7, "a b c a b c d e");
        learn(&generator, 7, "a b c a b c d e");

        let request = GenerateRequest::default()
            .with_randomness(0.0)
            .with_max_chars(200);
        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let text = generator.generate(&mut rng, 7, &request).unwrap();
            // Revisiting "a b c" steers towards "d" instead of cycling; the
            // only other outcome is the stored message, which is rejected.
            assert!(text == "a b c d e" || text.is_empty(), "got {:?}", text);
        }
        assert!(!generator.cache().is_empty());
    }

    #[test]
    fn test_step_budget_bounds_runaway_loops() {
        let generator = generator().with_max_steps(3);
        learn(&generator, 8, "la la la la la la la la");

        let request = GenerateRequest::default()
            .with_randomness(0.0)
            .with_max_chars(500);
        let mut rng = StdRng::seed_from_u64(1);
        let text = generator.generate(&mut rng, 8, &request).unwrap();
        assert_eq!(text, "la la la la la la");
    }

    #[test]
    fn test_shape_checks() {
        assert_eq!(check_shape("abcd", 2, 0, 0.0), Some(Rejection::TooShort));
        assert_eq!(check_shape("абвгд", 2, 0, 0.0), None);
        assert_eq!(check_shape("long enough", 11, 0, 1.5), Some(Rejection::NoJumps));
        assert_eq!(check_shape("long enough", 11, 1, 1.5), None);
        assert_eq!(check_shape("long enough", 10, 0, 3.0), None);
        assert_eq!(check_shape("long enough", 40, 0, 1.4), None);
    }

    #[test]
    fn test_cache_is_dropped_after_learning() {
        let generator = generator();
        learn(&generator, 10, "a b c d");
        learn(&generator, 11, "a b c d");

        let mut rng = StdRng::seed_from_u64(1);
        let request = GenerateRequest::default().with_randomness(0.0);
        generator.generate(&mut rng, 10, &request).unwrap();
        generator.generate(&mut rng, 11, &request).unwrap();
        let prefix = toks(&["a", "b", "c"]);
        assert!(generator.cache().get(3, 10, &prefix).is_some());

        learn(&generator, 10, "a b c e");
        assert!(generator.cache().get(3, 10, &prefix).is_none());
        assert!(generator.cache().get(3, 11, &prefix).is_some());
    }
}
