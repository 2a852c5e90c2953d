pub mod markov;

pub use markov::MarkovService;
