//! Durable per-chat n-gram counters backed by SQLite.
//!
//! Writes go through a single writer connection inside an immediate
//! transaction, so concurrent ingestion never loses an increment. File-backed
//! stores also open a read-only connection which, under WAL, sees only
//! committed ingestions.

mod schema;

use chrono::Utc;
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Row, ToSql, TransactionBehavior,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub use schema::{SCHEMA, START_ORDERS, TRANSITION_ORDERS};
use schema::{placeholders, token_columns, token_filter};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database is not initialized, call init() first")]
    NotInitialized,
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("storage failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("no counter table for order {0}")]
    UnsupportedOrder(usize),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A recorded opening sequence and how often it was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Start {
    pub tokens: Vec<String>,
    pub count: i64,
}

/// A token observed after some prefix, with its count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Successor {
    pub token: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatStats {
    pub messages: i64,
    pub starts2: i64,
    pub starts3: i64,
    pub transitions1: i64,
    pub transitions2: i64,
    pub transitions3: i64,
    pub volume1: i64,
    pub volume2: i64,
    pub volume3: i64,
    /// `volume3` when positive, otherwise `volume2`.
    pub volume: i64,
}

struct Handles {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
}

impl Handles {
    fn write(&self) -> MutexGuard<'_, Connection> {
        lock(&self.writer)
    }

    fn read(&self) -> MutexGuard<'_, Connection> {
        lock(self.reader.as_ref().unwrap_or(&self.writer))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // An aborted transaction rolls back on drop, so the connection is still usable.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct NgramStore {
    path: PathBuf,
    handles: Arc<RwLock<Option<Arc<Handles>>>>,
}

impl NgramStore {
    /// Creates an unopened store. Call [`NgramStore::init`] before use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handles: Arc::new(RwLock::new(None)),
        }
    }

    /// Creates and initializes a store in one step.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self::new(path);
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn init(&self) -> StoreResult<()> {
        let mut slot = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        info!("NgramStore: opening {}", self.path.display());
        let in_memory = is_memory_path(&self.path);
        if !in_memory {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let writer = Connection::open(&self.path)?;
        writer.busy_timeout(Duration::from_secs(5))?;
        if !in_memory {
            writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
        }
        writer.execute_batch(SCHEMA)?;

        let reader = if in_memory {
            None
        } else {
            let conn = Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(Duration::from_secs(5))?;
            Some(Mutex::new(conn))
        };

        *slot = Some(Arc::new(Handles {
            writer: Mutex::new(writer),
            reader,
        }));
        debug!("NgramStore: schema initialized");
        Ok(())
    }

    /// Drops the connections. Later calls fail with `NotInitialized` until `init` runs again.
    pub fn close(&self) {
        let mut slot = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        if slot.take().is_some() {
            info!("NgramStore: closed {}", self.path.display());
        }
    }

    /// Runs a store call on the blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&NgramStore) -> StoreResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    fn handles(&self) -> StoreResult<Arc<Handles>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::NotInitialized)
    }

    fn with_reader<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let handles = self.handles()?;
        let conn = handles.read();
        Ok(f(&conn)?)
    }

    /// Stores the message and bumps every start and transition counter it
    /// contains, in one transaction. Returns the chat's effective volume.
    pub fn ingest(
        &self,
        chat_id: i64,
        author_id: i64,
        raw_text: &str,
        tokens: &[String],
    ) -> StoreResult<i64> {
        let handles = self.handles()?;
        let mut conn = handles.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO messages (chat_id, author_id, text, folded_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                chat_id,
                author_id,
                raw_text,
                raw_text.to_lowercase(),
                Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
        )?;

        for order in START_ORDERS {
            if tokens.len() >= order {
                let opening = HashMap::from([(&tokens[..order], 1)]);
                upsert_counts(&tx, &format!("starts{}", order), order, chat_id, &opening)?;
            }
        }
        for order in TRANSITION_ORDERS {
            let counts = count_windows(tokens, order + 1);
            upsert_counts(&tx, &format!("transitions{}", order), order + 1, chat_id, &counts)?;
        }

        let volume = effective_volume(&tx, chat_id)?;
        tx.commit()?;

        debug!(
            "NgramStore: ingested {} tokens from user {} in chat {} (volume {})",
            tokens.len(),
            author_id,
            chat_id,
            volume
        );
        Ok(volume)
    }

    pub fn get_starts(&self, order: usize, chat_id: i64) -> StoreResult<Vec<Start>> {
        let table = start_table(order)?;
        let sql = format!(
            "SELECT {}, cnt FROM {} WHERE chat_id = ?1 ORDER BY rowid",
            token_columns(order),
            table
        );
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([chat_id], |row| read_start(row, order))?;
            let starts = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(starts)
        })
    }

    /// Point lookup for a user-supplied seed. `None` when it was never recorded.
    pub fn get_start_if_exists(
        &self,
        order: usize,
        chat_id: i64,
        tokens: &[String],
    ) -> StoreResult<Option<Start>> {
        let table = start_table(order)?;
        if tokens.len() != order {
            return Ok(None);
        }
        let sql = format!(
            "SELECT {}, cnt FROM {} WHERE chat_id = ?1 AND {}",
            token_columns(order),
            table,
            token_filter(order)
        );
        self.with_reader(|conn| {
            let params = key_params(&chat_id, tokens);
            let mut stmt = conn.prepare_cached(&sql)?;
            let start = stmt
                .query_row(&params[..], |row| read_start(row, order))
                .optional()?;
            Ok(start)
        })
    }

    /// All successors recorded after `prefix` (which must hold `order` tokens).
    pub fn get_transitions(
        &self,
        order: usize,
        chat_id: i64,
        prefix: &[String],
    ) -> StoreResult<Vec<Successor>> {
        let table = transition_table(order)?;
        if prefix.len() != order {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT w{}, cnt FROM {} WHERE chat_id = ?1 AND {} ORDER BY rowid",
            order + 1,
            table,
            token_filter(order)
        );
        self.with_reader(|conn| {
            let params = key_params(&chat_id, prefix);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(&params[..], |row| {
                Ok(Successor {
                    token: row.get(0)?,
                    count: row.get(1)?,
                })
            })?;
            let successors = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(successors)
        })
    }

    pub fn get_effective_volume(&self, chat_id: i64) -> StoreResult<i64> {
        self.with_reader(|conn| effective_volume(conn, chat_id))
    }

    pub fn get_stats(&self, chat_id: i64) -> StoreResult<ChatStats> {
        self.with_reader(|conn| {
            let volume2 = volume(conn, 2, chat_id)?;
            let volume3 = volume(conn, 3, chat_id)?;
            Ok(ChatStats {
                messages: row_count(conn, "messages", chat_id)?,
                starts2: row_count(conn, "starts2", chat_id)?,
                starts3: row_count(conn, "starts3", chat_id)?,
                transitions1: row_count(conn, "transitions1", chat_id)?,
                transitions2: row_count(conn, "transitions2", chat_id)?,
                transitions3: row_count(conn, "transitions3", chat_id)?,
                volume1: volume(conn, 1, chat_id)?,
                volume2,
                volume3,
                volume: if volume3 > 0 { volume3 } else { volume2 },
            })
        })
    }

    /// Deletes the message log and every counter of the chat.
    pub fn clear_chat(&self, chat_id: i64) -> StoreResult<()> {
        let handles = self.handles()?;
        let mut conn = handles.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut deleted = tx.execute("DELETE FROM messages WHERE chat_id = ?1", [chat_id])?;
        for order in START_ORDERS {
            deleted += tx.execute(
                &format!("DELETE FROM starts{} WHERE chat_id = ?1", order),
                [chat_id],
            )?;
        }
        for order in TRANSITION_ORDERS {
            deleted += tx.execute(
                &format!("DELETE FROM transitions{} WHERE chat_id = ?1", order),
                [chat_id],
            )?;
        }
        tx.commit()?;
        info!("NgramStore: cleared chat {} ({} rows)", chat_id, deleted);
        Ok(())
    }

    pub fn message_exists(&self, chat_id: i64, text: &str) -> StoreResult<bool> {
        self.with_reader(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT 1 FROM messages WHERE chat_id = ?1 AND text = ?2 LIMIT 1")?;
            stmt.exists((chat_id, text))
        })
    }

    /// Like [`NgramStore::message_exists`] but ignores letter case. Folding is
    /// done with Unicode rules on both sides, so it covers non-ASCII scripts.
    pub fn message_exists_ignore_case(&self, chat_id: i64, text: &str) -> StoreResult<bool> {
        let folded = text.to_lowercase();
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT 1 FROM messages WHERE chat_id = ?1 AND folded_text = ?2 LIMIT 1",
            )?;
            stmt.exists((chat_id, &folded))
        })
    }
}

fn is_memory_path(path: &Path) -> bool {
    path.as_os_str() == ":memory:"
}

fn start_table(order: usize) -> StoreResult<String> {
    if START_ORDERS.contains(&order) {
        Ok(format!("starts{}", order))
    } else {
        Err(StoreError::UnsupportedOrder(order))
    }
}

fn transition_table(order: usize) -> StoreResult<String> {
    if TRANSITION_ORDERS.contains(&order) {
        Ok(format!("transitions{}", order))
    } else {
        Err(StoreError::UnsupportedOrder(order))
    }
}

fn key_params<'a>(chat_id: &'a i64, tokens: &'a [String]) -> Vec<&'a dyn ToSql> {
    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(tokens.len() + 1);
    params.push(chat_id);
    params.extend(tokens.iter().map(|t| t as &dyn ToSql));
    params
}

fn read_start(row: &Row<'_>, order: usize) -> rusqlite::Result<Start> {
    let tokens = (0..order)
        .map(|i| row.get(i))
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(Start {
        tokens,
        count: row.get(order)?,
    })
}

/// Occurrences of every `width`-token window; repeats within one message add up.
fn count_windows(tokens: &[String], width: usize) -> HashMap<&[String], i64> {
    let mut counts = HashMap::new();
    for window in tokens.windows(width) {
        *counts.entry(window).or_insert(0) += 1;
    }
    counts
}

fn upsert_counts(
    conn: &Connection,
    table: &str,
    width: usize,
    chat_id: i64,
    counts: &HashMap<&[String], i64>,
) -> rusqlite::Result<()> {
    if counts.is_empty() {
        return Ok(());
    }
    let columns = token_columns(width);
    let sql = format!(
        "INSERT INTO {table} (chat_id, {columns}, cnt) VALUES ({})
         ON CONFLICT(chat_id, {columns}) DO UPDATE SET cnt = cnt + excluded.cnt",
        placeholders(width + 2)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    for (key, cnt) in counts {
        let mut params = key_params(&chat_id, key);
        params.push(cnt);
        stmt.execute(&params[..])?;
    }
    Ok(())
}

fn volume(conn: &Connection, order: usize, chat_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!(
            "SELECT COALESCE(SUM(cnt), 0) FROM transitions{} WHERE chat_id = ?1",
            order
        ),
        [chat_id],
        |row| row.get(0),
    )
}

fn effective_volume(conn: &Connection, chat_id: i64) -> rusqlite::Result<i64> {
    let volume3 = volume(conn, 3, chat_id)?;
    if volume3 > 0 {
        return Ok(volume3);
    }
    volume(conn, 2, chat_id)
}

fn row_count(conn: &Connection, table: &str, chat_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE chat_id = ?1", table),
        [chat_id],
        |row| row.get(0),
    )
}
