use rusqlite::Connection;

use crate::Result;

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_messages(conn)?;
    create_profiles(conn)?;
    create_facts(conn)?;
    create_windows(conn)?;
    create_episodes(conn)?;
    create_proactive_events(conn)?;
    create_embedding_cache(conn)?;
    create_quality_metrics(conn)?;
    Ok(())
}

fn create_messages(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id             INTEGER NOT NULL,
            thread_id           INTEGER,
            message_id          INTEGER NOT NULL,
            user_id             INTEGER NOT NULL,
            author_name         TEXT NOT NULL,
            text                TEXT NOT NULL,
            media               TEXT NOT NULL DEFAULT '[]',
            reply_to_message_id INTEGER,
            text_sha256         TEXT NOT NULL,
            retention_flag      INTEGER NOT NULL DEFAULT 0,
            is_from_self        INTEGER NOT NULL DEFAULT 0,
            timestamp           TEXT NOT NULL,
            UNIQUE(chat_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
            ON messages(chat_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_user
            ON messages(user_id, chat_id);",
    )?;
    // FTS5 external-content table — synced manually on write.
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
            USING fts5(text, content='messages', content_rowid='id');",
    )?;
    Ok(())
}

fn create_profiles(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS profiles (
            user_id            INTEGER NOT NULL,
            chat_id            INTEGER NOT NULL,
            display_name       TEXT NOT NULL,
            aliases            TEXT NOT NULL DEFAULT '[]',
            first_seen         TEXT NOT NULL,
            last_seen          TEXT NOT NULL,
            interaction_count  INTEGER NOT NULL DEFAULT 0,
            summary_text       TEXT,
            summary_version    INTEGER NOT NULL DEFAULT 0,
            summary_updated_at TEXT,
            is_active          INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (user_id, chat_id)
        );",
    )?;
    Ok(())
}

fn create_facts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS facts (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id             INTEGER NOT NULL,
            chat_id             INTEGER NOT NULL,
            fact_type           TEXT NOT NULL,
            key                 TEXT NOT NULL,
            value_canonical     TEXT NOT NULL,
            confidence          REAL NOT NULL,
            is_active           INTEGER NOT NULL DEFAULT 1,
            evidence_message_id INTEGER,
            source              TEXT NOT NULL,
            embedding           BLOB,
            superseded_by       INTEGER REFERENCES facts(id),
            created_at          TEXT NOT NULL,
            last_reinforced_at  TEXT NOT NULL,
            last_decayed_at     TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS ux_facts_active
            ON facts(user_id, chat_id, fact_type, key, value_canonical)
            WHERE is_active = 1;
        CREATE INDEX IF NOT EXISTS idx_facts_user
            ON facts(user_id, chat_id);

        CREATE TABLE IF NOT EXISTS fact_versions (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            fact_id          INTEGER NOT NULL REFERENCES facts(id),
            version_number   INTEGER NOT NULL,
            change_type      TEXT NOT NULL,
            old_value        TEXT,
            new_value        TEXT NOT NULL,
            old_confidence   REAL,
            new_confidence   REAL NOT NULL,
            delta_confidence REAL NOT NULL,
            reason           TEXT,
            created_at       TEXT NOT NULL,
            UNIQUE(fact_id, version_number)
        );
        CREATE INDEX IF NOT EXISTS idx_versions_fact
            ON fact_versions(fact_id, version_number);",
    )?;
    Ok(())
}

fn create_windows(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS windows (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id          INTEGER NOT NULL,
            thread_id        INTEGER,
            first_message_id INTEGER NOT NULL,
            last_message_id  INTEGER NOT NULL,
            message_count    INTEGER NOT NULL,
            participants     TEXT NOT NULL DEFAULT '[]',
            opened_at        TEXT NOT NULL,
            closed_at        TEXT,
            closure_reason   TEXT NOT NULL,
            dominant_value   TEXT NOT NULL,
            processed        INTEGER NOT NULL DEFAULT 0,
            skipped          INTEGER NOT NULL DEFAULT 0,
            failed           INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_windows_chat
            ON windows(chat_id, closed_at);",
    )?;
    Ok(())
}

fn create_episodes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS episodes (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id           INTEGER NOT NULL,
            thread_id         INTEGER,
            topic             TEXT NOT NULL,
            summary           TEXT NOT NULL,
            message_ids       TEXT NOT NULL DEFAULT '[]',
            participants      TEXT NOT NULL DEFAULT '[]',
            importance        REAL NOT NULL DEFAULT 0.5,
            emotional_valence TEXT NOT NULL DEFAULT 'neutral',
            tags              TEXT NOT NULL DEFAULT '[]',
            created_at        TEXT NOT NULL,
            last_accessed_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_episodes_chat
            ON episodes(chat_id, last_accessed_at DESC);",
    )?;
    Ok(())
}

fn create_proactive_events(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS proactive_events (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id             INTEGER NOT NULL,
            window_id           INTEGER NOT NULL,
            user_id             INTEGER,
            intent_type         TEXT NOT NULL,
            intent_confidence   REAL NOT NULL,
            adjusted_confidence REAL NOT NULL,
            decision            TEXT NOT NULL,
            block_reason        TEXT,
            response_message_id INTEGER,
            user_reaction       TEXT,
            reaction_delay_ms   INTEGER,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_proactive_chat
            ON proactive_events(chat_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_proactive_user
            ON proactive_events(user_id, chat_id, created_at DESC);",
    )?;
    Ok(())
}

fn create_embedding_cache(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS embedding_cache (
            text_sha256      TEXT NOT NULL,
            model_id         TEXT NOT NULL,
            vector           BLOB NOT NULL,
            created_at       TEXT NOT NULL,
            last_accessed_at TEXT NOT NULL,
            access_count     INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (text_sha256, model_id)
        );",
    )?;
    Ok(())
}

fn create_quality_metrics(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS fact_quality_metrics (
            window_id          INTEGER PRIMARY KEY,
            candidates_seen    INTEGER NOT NULL DEFAULT 0,
            facts_created      INTEGER NOT NULL DEFAULT 0,
            facts_reinforced   INTEGER NOT NULL DEFAULT 0,
            conflicts_resolved INTEGER NOT NULL DEFAULT 0,
            facts_decayed      INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT NOT NULL
        );",
    )?;
    Ok(())
}
