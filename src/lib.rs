pub mod cache;
pub mod config;
pub mod db;
pub mod markov;
pub mod reply;
pub mod services;
pub mod text;

/// Shared state handed to the message driver.
pub struct Data {
    pub config: config::Config,
    pub service: services::MarkovService,
}
