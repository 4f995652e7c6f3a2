//! Persistence and querying of answer records.
//!
//! Passages are stored without their embeddings; stats, passages and
//! warnings are kept as JSON columns.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::models::AnswerRecord;

/// Store one answer record, returning its row id.
pub async fn record_answer(pool: &SqlitePool, record: &AnswerRecord) -> Result<i64> {
    let passages_json =
        serde_json::to_string(&record.passages).context("Failed to serialize passages")?;
    let stats_json = serde_json::to_string(&record.stats).context("Failed to serialize stats")?;
    let warnings_json =
        serde_json::to_string(&record.warnings).context("Failed to serialize warnings")?;

    let result = sqlx::query(
        r#"
        INSERT INTO answer_logs (
            timestamp, question, answer, source_url, source_limit, status,
            completion_plugin_id, embedding_plugin_id, duration, uid,
            passages_json, stats_json, warnings_json
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.timestamp.to_rfc3339())
    .bind(&record.question)
    .bind(&record.answer)
    .bind(&record.source_url)
    .bind(record.source_limit as i64)
    .bind(record.status.as_str())
    .bind(&record.completion_plugin_id)
    .bind(&record.embedding_plugin_id)
    .bind(record.duration)
    .bind(&record.uid)
    .bind(passages_json)
    .bind(stats_json)
    .bind(warnings_json)
    .execute(pool)
    .await
    .context("Failed to insert answer log")?;

    Ok(result.last_insert_rowid())
}

/// Filters for [`query_logs`]. Text filters match as substrings.
#[derive(Debug, Default)]
pub struct LogFilter {
    pub question: Option<String>,
    pub answer: Option<String>,
    pub uid: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, sqlx::FromRow)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: String,
    pub question: String,
    pub answer: String,
    pub source_url: String,
    pub source_limit: i64,
    pub status: String,
    pub completion_plugin_id: String,
    pub embedding_plugin_id: String,
    pub duration: f64,
    pub uid: String,
    pub passages_json: String,
    pub stats_json: String,
    pub warnings_json: String,
}

/// Fetch stored answers, most recent first.
pub async fn query_logs(pool: &SqlitePool, filter: &LogFilter) -> Result<Vec<LogEntry>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, timestamp, question, answer, source_url, source_limit, status, \
         completion_plugin_id, embedding_plugin_id, duration, uid, \
         passages_json, stats_json, warnings_json FROM answer_logs WHERE 1 = 1",
    );

    if let Some(question) = &filter.question {
        builder.push(" AND question LIKE ");
        builder.push_bind(format!("%{question}%"));
    }
    if let Some(answer) = &filter.answer {
        builder.push(" AND answer LIKE ");
        builder.push_bind(format!("%{answer}%"));
    }
    if let Some(uid) = &filter.uid {
        builder.push(" AND uid = ");
        builder.push_bind(uid.clone());
    }

    builder.push(" ORDER BY timestamp DESC, id DESC LIMIT ");
    builder.push_bind(filter.limit.max(1) as i64);
    builder.push(" OFFSET ");
    builder.push_bind(filter.offset as i64);

    let entries = builder
        .build_query_as::<LogEntry>()
        .fetch_all(pool)
        .await
        .context("Failed to query answer logs")?;

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::run_migrations;
    use crate::models::{
        AnswerStatus, PassageSource, RelevantPassage,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn record(question: &str, uid: &str) -> AnswerRecord {
        AnswerRecord {
            question: question.to_string(),
            source_url: "https://example.org/updates".to_string(),
            source_limit: 10,
            answer: "It flooded.".to_string(),
            passages: vec![RelevantPassage {
                text: "Heavy rains caused flooding.".to_string(),
                score: 1.8,
                source: PassageSource {
                    id: "doc-1".to_string(),
                    title: "Report".to_string(),
                    url: "https://example.org/report/doc-1".to_string(),
                    page: None,
                },
                embedding: vec![0.1, 0.2],
            }],
            status: AnswerStatus::Success,
            timestamp: Utc::now(),
            duration: 1.25,
            uid: uid.to_string(),
            completion_plugin_id: "openai".to_string(),
            embedding_plugin_id: "openai".to_string(),
            stats: BTreeMap::from([("Get answer".to_string(), 0.5)]),
            warnings: vec!["Skipped attachment".to_string()],
        }
    }

    #[tokio::test]
    async fn test_record_and_query_roundtrip() {
        let pool = test_pool().await;

        let id = record_answer(&pool, &record("What happened?", "cli"))
            .await
            .unwrap();
        assert!(id > 0);

        let entries = query_logs(
            &pool,
            &LogFilter {
                limit: 20,
                ..LogFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].question, "What happened?");
        assert_eq!(entries[0].status, "success");
        // Embeddings are not persisted.
        assert!(!entries[0].passages_json.contains("embedding"));
        assert!(entries[0].passages_json.contains("Heavy rains"));
        assert!(entries[0].stats_json.contains("Get answer"));
    }

    #[tokio::test]
    async fn test_query_filters() {
        let pool = test_pool().await;
        record_answer(&pool, &record("What happened in Chad?", "alice"))
            .await
            .unwrap();
        record_answer(&pool, &record("How many were displaced?", "bob"))
            .await
            .unwrap();

        let by_question = query_logs(
            &pool,
            &LogFilter {
                question: Some("Chad".to_string()),
                limit: 20,
                ..LogFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_question.len(), 1);
        assert_eq!(by_question[0].uid, "alice");

        let by_uid = query_logs(
            &pool,
            &LogFilter {
                uid: Some("bob".to_string()),
                limit: 20,
                ..LogFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_uid.len(), 1);
        assert_eq!(by_uid[0].question, "How many were displaced?");

        let none = query_logs(
            &pool,
            &LogFilter {
                question: Some("volcano".to_string()),
                limit: 20,
                ..LogFilter::default()
            },
        )
        .await
        .unwrap();
        assert!(none.is_empty());
    }
}
