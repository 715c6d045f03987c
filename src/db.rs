// src/db.rs
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Poll, PollRecord, Role, Tally};
use crate::store::PollStore;

pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<Pool<Postgres>, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn init_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS polls (
            id UUID PRIMARY KEY,
            question TEXT NOT NULL,
            options JSONB NOT NULL,
            time_limit BIGINT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            votes JSONB NOT NULL DEFAULT '{}'::jsonb,
            ended_at TIMESTAMPTZ,
            total_answers INTEGER NOT NULL DEFAULT 0,
            total_students INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS participants (
            name TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            polls_participated JSONB NOT NULL DEFAULT '[]'::jsonb
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct PollRow {
    id: Uuid,
    question: String,
    options: Json<Vec<String>>,
    time_limit: i64,
    created_by: String,
    created_at: DateTime<Utc>,
    is_active: bool,
    votes: Json<HashMap<String, u64>>,
    ended_at: Option<DateTime<Utc>>,
    total_answers: i32,
    total_students: i32,
}

impl From<PollRow> for PollRecord {
    fn from(row: PollRow) -> Self {
        let options = row.options.0;
        PollRecord {
            results: Tally::from_counts(&options, &row.votes.0),
            poll: Poll {
                id: row.id,
                question: row.question,
                options,
                time_limit: u64::try_from(row.time_limit).unwrap_or(0),
                created_at: row.created_at,
                created_by: row.created_by,
                is_active: row.is_active,
            },
            ended_at: row.ended_at,
            total_answers: usize::try_from(row.total_answers).unwrap_or(0),
            total_students: usize::try_from(row.total_students).unwrap_or(0),
        }
    }
}

/// Postgres-backed store. Poll votes and participant history are JSONB documents.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PollStore for PgStore {
    fn backend(&self) -> &'static str {
        "Postgres"
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn create_poll(&self, poll: &Poll) -> Result<Uuid, StoreError> {
        let votes = serde_json::to_value(Tally::for_options(&poll.options))?;

        sqlx::query(
            r#"
            INSERT INTO polls
                (id, question, options, time_limit, created_by, created_at, is_active, votes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(poll.id)
        .bind(&poll.question)
        .bind(Json(&poll.options))
        .bind(i64::try_from(poll.time_limit).unwrap_or(i64::MAX))
        .bind(&poll.created_by)
        .bind(poll.created_at)
        .bind(poll.is_active)
        .bind(Json(votes))
        .execute(&self.pool)
        .await?;

        Ok(poll.id)
    }

    async fn increment_vote(&self, poll_id: Uuid, option: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE polls
            SET votes = jsonb_set(votes, ARRAY[$2], to_jsonb(COALESCE((votes->>$2)::bigint, 0) + 1))
            WHERE id = $1
            "#,
        )
        .bind(poll_id)
        .bind(option)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::PollNotFound(poll_id.to_string()));
        }
        Ok(())
    }

    async fn update_poll_on_close(&self, record: &PollRecord) -> Result<(), StoreError> {
        let votes = serde_json::to_value(&record.results)?;

        let updated = sqlx::query(
            r#"
            UPDATE polls
            SET is_active = FALSE, ended_at = $2, votes = $3,
                total_answers = $4, total_students = $5
            WHERE id = $1
            "#,
        )
        .bind(record.poll.id)
        .bind(record.ended_at)
        .bind(Json(votes))
        .bind(i32::try_from(record.total_answers).unwrap_or(i32::MAX))
        .bind(i32::try_from(record.total_students).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::PollNotFound(record.poll.id.to_string()));
        }
        Ok(())
    }

    async fn upsert_participant_history(
        &self,
        name: &str,
        role: Role,
        poll_id: Uuid,
        answer: &str,
    ) -> Result<(), StoreError> {
        let entry = json!({
            "pollId": poll_id,
            "answer": answer,
            "timestamp": Utc::now(),
        });

        sqlx::query(
            r#"
            INSERT INTO participants (name, role, polls_participated)
            VALUES ($1, $2, jsonb_build_array($3::jsonb))
            ON CONFLICT (name) DO UPDATE
            SET role = EXCLUDED.role,
                polls_participated = participants.polls_participated || EXCLUDED.polls_participated
            "#,
        )
        .bind(name)
        .bind(role.as_str())
        .bind(Json(entry))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_polls(&self, limit: usize) -> Result<Vec<PollRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PollRow>(
            r#"
            SELECT id, question, options, time_limit, created_by, created_at, is_active,
                   votes, ended_at, total_answers, total_students
            FROM polls
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PollRecord::from).collect())
    }
}
