use crate::cache::TransitionCache;
use crate::db::{ChatStats, NgramStore, StoreResult};
use crate::markov::{GenerateRequest, Generator};
use tracing::{debug, info};

/// Async entry point for learning from and replying to chats.
///
/// Every mutation of a chat's counters drops that chat's cached transitions.
#[derive(Clone)]
pub struct MarkovService {
    store: NgramStore,
    generator: Generator,
}

impl MarkovService {
    pub fn new(store: NgramStore, cache_capacity: usize) -> Self {
        let generator = Generator::new(store.clone(), TransitionCache::new(cache_capacity));
        Self { store, generator }
    }

    pub fn store(&self) -> &NgramStore {
        &self.store
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Learns one tokenized message and returns the chat's effective volume.
    pub async fn ingest(
        &self,
        chat_id: i64,
        author_id: i64,
        raw_text: &str,
        tokens: Vec<String>,
    ) -> StoreResult<i64> {
        let raw_text = raw_text.to_string();
        let volume = self
            .store
            .run_blocking(move |db| db.ingest(chat_id, author_id, &raw_text, &tokens))
            .await?;
        self.generator.invalidate_chat_cache(chat_id);
        Ok(volume)
    }

    /// One generation attempt; empty when nothing acceptable came out.
    pub async fn generate(&self, chat_id: i64, request: GenerateRequest) -> StoreResult<String> {
        let generator = self.generator.clone();
        self.store
            .run_blocking(move |_| generator.generate(&mut rand::rng(), chat_id, &request))
            .await
    }

    /// Retries generation up to `attempts` times. The seed is only honoured
    /// on the first attempt.
    pub async fn generate_reply(
        &self,
        chat_id: i64,
        request: GenerateRequest,
        attempts: usize,
    ) -> StoreResult<String> {
        let mut request = request;
        for attempt in 1..=attempts.max(1) {
            let text = self.generate(chat_id, request.clone()).await?;
            if !text.is_empty() {
                debug!("MarkovService: chat {} reply on attempt {}", chat_id, attempt);
                return Ok(text);
            }
            request.seed = None;
        }
        debug!("MarkovService: chat {} gave no reply after {} attempts", chat_id, attempts);
        Ok(String::new())
    }

    pub async fn clear_chat(&self, chat_id: i64) -> StoreResult<()> {
        self.store
            .run_blocking(move |db| db.clear_chat(chat_id))
            .await?;
        self.generator.invalidate_chat_cache(chat_id);
        info!("MarkovService: chat {} cleared", chat_id);
        Ok(())
    }

    pub async fn stats(&self, chat_id: i64) -> StoreResult<ChatStats> {
        self.store.run_blocking(move |db| db.get_stats(chat_id)).await
    }
}
