use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        CallId, CallStatus, CallType, ConversationId, EndReason, ParticipantState, UserId,
    },
    protocol::{CallParticipant, CallRecord},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct NewCall {
    pub conversation_id: ConversationId,
    pub channel_name: String,
    pub call_type: CallType,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub initiator_id: UserId,
    pub participant_ids: Vec<UserId>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct IdempotentCall {
    pub call_id: CallId,
    pub created_at: DateTime<Utc>,
}

const CALL_COLUMNS: &str = "id, conversation_id, channel_name, call_type, is_group, group_name,
    initiator_id, initiator_left, status, created_at, started_at, ended_at, duration_seconds,
    end_reason";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert user")?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn insert_call(&self, call: &NewCall) -> Result<CallId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO calls (conversation_id, channel_name, call_type, is_group, group_name,
                                initiator_id, status, created_at, idempotency_key)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(call.conversation_id.0)
        .bind(&call.channel_name)
        .bind(call.call_type.as_str())
        .bind(call.is_group)
        .bind(call.group_name.as_deref())
        .bind(call.initiator_id.0)
        .bind(CallStatus::Ringing.as_str())
        .bind(call.created_at)
        .bind(call.idempotency_key.as_deref())
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert call")?;
        let call_id = CallId(rec.get::<i64, _>(0));

        for (position, user_id) in call.participant_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO call_participants (call_id, user_id, position, state)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(call_id.0)
            .bind(user_id.0)
            .bind(position as i64)
            .bind(ParticipantState::Pending.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert participant {user_id} for call {call_id}"))?;
        }

        tx.commit().await?;
        Ok(call_id)
    }

    pub async fn find_call_by_idempotency_key(
        &self,
        initiator_id: UserId,
        idempotency_key: &str,
    ) -> Result<Option<IdempotentCall>> {
        let row = sqlx::query(
            "SELECT id, created_at FROM calls WHERE initiator_id = ? AND idempotency_key = ?",
        )
        .bind(initiator_id.0)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up idempotency key")?;
        row.map(|row| -> Result<IdempotentCall> {
            Ok(IdempotentCall {
                call_id: CallId(row.try_get("id")?),
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    pub async fn load_call(&self, call_id: CallId) -> Result<Option<CallRecord>> {
        let row = sqlx::query(&format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?"))
            .bind(call_id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load call {call_id}"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let participants = self.load_participants(call_id).await?;
        Ok(Some(call_from_row(&row, participants)?))
    }

    /// Writes the mutable parts of a call record and all participant rows.
    pub async fn save_call_state(&self, record: &CallRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE calls
             SET status = ?, started_at = ?, ended_at = ?, duration_seconds = ?,
                 end_reason = ?, initiator_left = ?
             WHERE id = ?",
        )
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.duration_seconds)
        .bind(record.end_reason.map(EndReason::as_str))
        .bind(record.initiator_left)
        .bind(record.call_id.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to update call {}", record.call_id))?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("call {} does not exist", record.call_id));
        }

        for participant in &record.participants {
            sqlx::query(
                "UPDATE call_participants SET state = ?, answered_at = ?
                 WHERE call_id = ? AND user_id = ?",
            )
            .bind(participant.state.as_str())
            .bind(participant.answered_at)
            .bind(record.call_id.0)
            .bind(participant.user_id.0)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "failed to update participant {} of call {}",
                    participant.user_id, record.call_id
                )
            })?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Newest first. `before` pages on call id.
    pub async fn list_calls_for_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<CallId>,
    ) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CALL_COLUMNS} FROM calls
             WHERE conversation_id = ? AND (? IS NULL OR id < ?)
             ORDER BY id DESC
             LIMIT ?"
        ))
        .bind(conversation_id.0)
        .bind(before.map(|id| id.0))
        .bind(before.map(|id| id.0))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to list conversation calls")?;
        self.records_from_rows(rows).await
    }

    pub async fn list_recent_calls(&self, limit: u32) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CALL_COLUMNS} FROM calls ORDER BY id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to list recent calls")?;
        self.records_from_rows(rows).await
    }

    async fn records_from_rows(&self, rows: Vec<SqliteRow>) -> Result<Vec<CallRecord>> {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let call_id = CallId(row.try_get("id")?);
            let participants = self.load_participants(call_id).await?;
            records.push(call_from_row(&row, participants)?);
        }
        Ok(records)
    }

    async fn load_participants(&self, call_id: CallId) -> Result<Vec<CallParticipant>> {
        let rows = sqlx::query(
            "SELECT user_id, state, answered_at FROM call_participants
             WHERE call_id = ? ORDER BY position ASC",
        )
        .bind(call_id.0)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load participants of call {call_id}"))?;

        rows.into_iter()
            .map(|row| -> Result<CallParticipant> {
                let state: String = row.try_get("state")?;
                Ok(CallParticipant {
                    user_id: UserId(row.try_get("user_id")?),
                    state: ParticipantState::parse(&state)
                        .ok_or_else(|| anyhow!("unknown participant state '{state}'"))?,
                    answered_at: row.try_get("answered_at")?,
                })
            })
            .collect()
    }
}

fn call_from_row(row: &SqliteRow, participants: Vec<CallParticipant>) -> Result<CallRecord> {
    let call_type: String = row.try_get("call_type")?;
    let status: String = row.try_get("status")?;
    let end_reason: Option<String> = row.try_get("end_reason")?;
    Ok(CallRecord {
        call_id: CallId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        channel_name: row.try_get("channel_name")?,
        call_type: CallType::parse(&call_type)
            .ok_or_else(|| anyhow!("unknown call type '{call_type}'"))?,
        is_group: row.try_get("is_group")?,
        group_name: row.try_get("group_name")?,
        initiator_id: UserId(row.try_get("initiator_id")?),
        participants,
        status: CallStatus::parse(&status).ok_or_else(|| anyhow!("unknown status '{status}'"))?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        end_reason: end_reason
            .map(|raw| EndReason::parse(&raw).ok_or_else(|| anyhow!("unknown end reason '{raw}'")))
            .transpose()?,
        initiator_left: row.try_get("initiator_left")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_file_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
