use anyhow::Context;
use chat_markov::config::Config;
use chat_markov::db::NgramStore;
use chat_markov::reply::{handle_line, Outcome, ReplyState};
use chat_markov::services::MarkovService;
use chat_markov::Data;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: {:?}", config);

    let store = NgramStore::open(&config.database_url)
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    info!("Opened n-gram store at {}", store.path().display());
    let data = Data {
        service: MarkovService::new(store.clone(), config.transition_cache_capacity),
        config,
    };

    info!("Reading messages for chat {} from stdin", data.config.chat_id);
    let mut state = ReplyState::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match handle_line(&data, &mut state, &line, rand::random::<f64>()).await {
            Ok(Outcome::Replied { text, .. }) => println!("{}", text),
            Ok(_) => {}
            Err(e) => error!("Failed to handle message: {}", e),
        }
    }

    let stats = data.service.stats(data.config.chat_id).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    store.close();
    Ok(())
}
