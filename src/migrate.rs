//! Schema migrations for the answer log.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Apply the schema. Statements are idempotent so this can run on
/// every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS answer_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            source_url TEXT NOT NULL,
            source_limit INTEGER NOT NULL,
            status TEXT NOT NULL,
            completion_plugin_id TEXT NOT NULL,
            embedding_plugin_id TEXT NOT NULL,
            duration REAL NOT NULL,
            uid TEXT NOT NULL DEFAULT '',
            passages_json TEXT NOT NULL DEFAULT '[]',
            stats_json TEXT NOT NULL DEFAULT '{}',
            warnings_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create answer_logs table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_answer_logs_timestamp ON answer_logs (timestamp)",
    )
    .execute(pool)
    .await
    .context("Failed to create answer_logs timestamp index")?;

    Ok(())
}
