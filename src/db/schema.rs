/// Raw message log plus one counter table per start order (2, 3) and per
/// transition order (1, 2, 3). Every counter row is keyed by chat and tokens.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id INTEGER NOT NULL,
        author_id INTEGER NOT NULL,
        text TEXT NOT NULL,
        folded_text TEXT NOT NULL,
        created_at DATETIME NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_chat_text ON messages (chat_id, text);
    CREATE INDEX IF NOT EXISTS idx_messages_chat_folded ON messages (chat_id, folded_text);

    CREATE TABLE IF NOT EXISTS starts2 (
        chat_id INTEGER NOT NULL,
        w1 TEXT NOT NULL,
        w2 TEXT NOT NULL,
        cnt INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (chat_id, w1, w2)
    );

    CREATE TABLE IF NOT EXISTS starts3 (
        chat_id INTEGER NOT NULL,
        w1 TEXT NOT NULL,
        w2 TEXT NOT NULL,
        w3 TEXT NOT NULL,
        cnt INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (chat_id, w1, w2, w3)
    );

    CREATE TABLE IF NOT EXISTS transitions1 (
        chat_id INTEGER NOT NULL,
        w1 TEXT NOT NULL,
        w2 TEXT NOT NULL,
        cnt INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (chat_id, w1, w2)
    );

    CREATE TABLE IF NOT EXISTS transitions2 (
        chat_id INTEGER NOT NULL,
        w1 TEXT NOT NULL,
        w2 TEXT NOT NULL,
        w3 TEXT NOT NULL,
        cnt INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (chat_id, w1, w2, w3)
    );

    CREATE TABLE IF NOT EXISTS transitions3 (
        chat_id INTEGER NOT NULL,
        w1 TEXT NOT NULL,
        w2 TEXT NOT NULL,
        w3 TEXT NOT NULL,
        w4 TEXT NOT NULL,
        cnt INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (chat_id, w1, w2, w3, w4)
    );
";

/// Orders that have a `starts{n}` table.
pub const START_ORDERS: [usize; 2] = [2, 3];
/// Orders that have a `transitions{n}` table.
pub const TRANSITION_ORDERS: [usize; 3] = [1, 2, 3];

const COLUMNS: [&str; 4] = ["w1", "w2", "w3", "w4"];

/// Comma-separated token columns `w1..wn`.
pub fn token_columns(n: usize) -> String {
    COLUMNS[..n].join(", ")
}

/// `w1 = ?2 AND w2 = ?3 ...`, numbering placeholders after `?1` (chat id).
pub fn token_filter(n: usize) -> String {
    COLUMNS[..n]
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = ?{}", col, i + 2))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `?1, ?2, ... ?n`
pub fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}
