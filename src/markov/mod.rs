//! Variable-order word model: tokenization, sampling knobs and the generator.

pub mod generator;
pub mod tokenize;
pub mod tuning;

pub use generator::{GenerateRequest, Generator, DEFAULT_MAX_STEPS, MIN_OUTPUT_CHARS};
pub use tokenize::{detokenize, tokenize};
pub use tuning::Tuning;
