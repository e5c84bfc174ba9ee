use chrono::{DateTime, Duration, SecondsFormat, Utc};
use grok_core::mention_contracts::{Mention, MentionContext, NewMention, StatusCounts};
use grok_core::MentionStatus;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const MENTION_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const MENTION_COLUMNS: &str = "
    id,
    author,
    author_id,
    content,
    context_json,
    source_ts,
    status,
    attempt_count,
    claimed_at,
    lease_expires_at,
    reply_text,
    last_error,
    created_at,
    updated_at
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("mention not found: {0}")]
    NotFound(String),
    #[error("mention {id} cannot move from {from} to {to}")]
    InvalidState {
        id: String,
        from: MentionStatus,
        to: MentionStatus,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store connection lock poisoned")]
    LockPoisoned,
    #[error("time window out of range: {0}")]
    WindowOutOfRange(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Stuck claims returned to `pending`.
    pub requeued: usize,
    /// Stuck claims that had no attempts left and were closed as `failed`.
    pub exhausted: usize,
}

impl ReclaimReport {
    pub fn total(&self) -> usize {
        self.requeued + self.exhausted
    }
}

/// Durable table of mentions. Every mutation runs in its own IMMEDIATE
/// transaction, so several stores opened on the same file (threads or
/// processes) never act on the same row's pre-transition state.
pub struct MentionStore {
    conn: Mutex<Connection>,
    max_retries: u32,
}

impl MentionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
            max_retries: DEFAULT_MAX_RETRIES,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Zero is treated as one: every claim is an attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > MENTION_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MENTION_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_mentions.sql");
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(sql)?;
            tx.execute_batch("PRAGMA user_version = 1")?;
            tx.commit()?;
        }

        Ok(())
    }

    pub fn insert_if_absent(
        &self,
        mention: &NewMention,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let context_json = serde_json::to_string(&mention.context)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let now = format_timestamp(now);

        let conn = self.lock()?;
        let changes = conn.execute(
            "
            INSERT OR IGNORE INTO mentions (
                id,
                author,
                author_id,
                content,
                context_json,
                source_ts,
                status,
                attempt_count,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?7)
            ",
            params![
                mention.id,
                mention.author,
                mention.author_id,
                mention.content,
                context_json,
                format_timestamp(mention.source_ts),
                now,
            ],
        )?;

        Ok(changes > 0)
    }

    /// Moves up to `limit` of the oldest pending mentions to `processing` in one
    /// guarded UPDATE and returns them. `timeout_window` stamps the lease the
    /// claimer is expected to finish within.
    pub fn claim_batch(
        &self,
        limit: usize,
        timeout_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Mention>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let claimed_at = format_timestamp(now);
        let lease_expires_at = now.checked_add_signed(timeout_window).ok_or_else(|| {
            StorageError::WindowOutOfRange(format!(
                "claim window of {} minutes",
                timeout_window.num_minutes()
            ))
        })?;
        let lease_expires_at = format_timestamp(lease_expires_at);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = {
            let mut stmt = tx.prepare(&format!(
                "
                UPDATE mentions
                SET status = 'processing',
                    attempt_count = attempt_count + 1,
                    claimed_at = ?1,
                    lease_expires_at = ?2,
                    updated_at = ?1
                WHERE status = 'pending'
                  AND id IN (
                    SELECT id FROM mentions
                    WHERE status = 'pending'
                    ORDER BY source_ts ASC, created_at ASC, id ASC
                    LIMIT ?3
                  )
                RETURNING {MENTION_COLUMNS}
                "
            ))?;
            let rows = stmt.query_map(params![claimed_at, lease_expires_at, limit], MentionRow::read)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;

        let mut claimed = rows
            .into_iter()
            .map(MentionRow::into_mention)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|left, right| {
            left.source_ts
                .cmp(&right.source_ts)
                .then_with(|| left.created_at.cmp(&right.created_at))
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(claimed)
    }

    pub fn mark_replied(
        &self,
        id: &str,
        reply_text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (status, _) = require_status(&tx, id)?;
        if status != MentionStatus::Processing {
            return Err(StorageError::InvalidState {
                id: id.to_string(),
                from: status,
                to: MentionStatus::Replied,
            });
        }

        tx.execute(
            "
            UPDATE mentions
            SET status = 'replied',
                reply_text = ?2,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?3
            WHERE id = ?1 AND status = 'processing'
            ",
            params![id, reply_text, format_timestamp(now)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Releases a failed attempt: back to `pending` while attempts remain,
    /// otherwise `failed`. Returns the status the mention ended up in.
    pub fn mark_retry(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<MentionStatus, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (status, attempt_count) = require_status(&tx, id)?;
        let next = if attempt_count < self.max_retries {
            MentionStatus::Pending
        } else {
            MentionStatus::Failed
        };
        if status != MentionStatus::Processing {
            return Err(StorageError::InvalidState {
                id: id.to_string(),
                from: status,
                to: next,
            });
        }

        tx.execute(
            "
            UPDATE mentions
            SET status = ?2,
                last_error = ?3,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?4
            WHERE id = ?1 AND status = 'processing'
            ",
            params![id, next.as_str(), error, format_timestamp(now)],
        )?;
        tx.commit()?;
        Ok(next)
    }

    pub fn mark_skipped(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (status, _) = require_status(&tx, id)?;
        if status.is_terminal() {
            return Err(StorageError::InvalidState {
                id: id.to_string(),
                from: status,
                to: MentionStatus::Skipped,
            });
        }

        tx.execute(
            "
            UPDATE mentions
            SET status = 'skipped',
                last_error = ?2,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?3
            WHERE id = ?1
            ",
            params![id, reason, format_timestamp(now)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns claims older than `timeout` to `pending`. The stuck attempt was
    /// already counted at claim time, so `attempt_count` is left alone; a claim
    /// that used the last attempt is closed as `failed` instead.
    pub fn reclaim_timed_out(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReclaimReport, StorageError> {
        let cutoff = now.checked_sub_signed(timeout).ok_or_else(|| {
            StorageError::WindowOutOfRange(format!(
                "processing timeout of {} minutes",
                timeout.num_minutes()
            ))
        })?;
        let cutoff = format_timestamp(cutoff);
        let updated_at = format_timestamp(now);
        let reason = format!(
            "processing timed out after {} minutes",
            timeout.num_minutes()
        );

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exhausted = tx.execute(
            "
            UPDATE mentions
            SET status = 'failed',
                last_error = ?3,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?2
            WHERE status = 'processing'
              AND claimed_at < ?1
              AND attempt_count >= ?4
            ",
            params![cutoff, updated_at, reason, self.max_retries],
        )?;
        let requeued = tx.execute(
            "
            UPDATE mentions
            SET status = 'pending',
                last_error = ?3,
                claimed_at = NULL,
                lease_expires_at = NULL,
                updated_at = ?2
            WHERE status = 'processing'
              AND claimed_at < ?1
            ",
            params![cutoff, updated_at, reason],
        )?;
        tx.commit()?;

        Ok(ReclaimReport {
            requeued,
            exhausted,
        })
    }

    pub fn counts_by_status(&self) -> Result<StatusCounts, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT status, COUNT(*)
            FROM mentions
            GROUP BY status
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            counts.set(parse_status(&status)?, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Claims whose lease has lapsed but which no reaper pass has picked up yet.
    pub fn overdue_claims(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "
            SELECT COUNT(*)
            FROM mentions
            WHERE status = 'processing' AND lease_expires_at < ?1
            ",
            [format_timestamp(now)],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn mention(&self, id: &str) -> Result<Option<Mention>, StorageError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {MENTION_COLUMNS} FROM mentions WHERE id = ?1"),
                [id],
                MentionRow::read,
            )
            .optional()?;
        row.map(MentionRow::into_mention).transpose()
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }
}

struct MentionRow {
    id: String,
    author: String,
    author_id: String,
    content: String,
    context_json: String,
    source_ts: String,
    status: String,
    attempt_count: i64,
    claimed_at: Option<String>,
    lease_expires_at: Option<String>,
    reply_text: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl MentionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            author: row.get(1)?,
            author_id: row.get(2)?,
            content: row.get(3)?,
            context_json: row.get(4)?,
            source_ts: row.get(5)?,
            status: row.get(6)?,
            attempt_count: row.get(7)?,
            claimed_at: row.get(8)?,
            lease_expires_at: row.get(9)?,
            reply_text: row.get(10)?,
            last_error: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_mention(self) -> Result<Mention, StorageError> {
        let context: MentionContext = serde_json::from_str(&self.context_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        Ok(Mention {
            id: self.id,
            author: self.author,
            author_id: self.author_id,
            content: self.content,
            context,
            source_ts: parse_timestamp(self.source_ts)?,
            status: parse_status(&self.status)?,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(0),
            claimed_at: self.claimed_at.map(parse_timestamp).transpose()?,
            lease_expires_at: self.lease_expires_at.map(parse_timestamp).transpose()?,
            reply_text: self.reply_text,
            last_error: self.last_error,
            created_at: parse_timestamp(self.created_at)?,
            updated_at: parse_timestamp(self.updated_at)?,
        })
    }
}

fn require_status(tx: &Transaction<'_>, id: &str) -> Result<(MentionStatus, u32), StorageError> {
    let row = tx
        .query_row(
            "SELECT status, attempt_count FROM mentions WHERE id = ?1",
            [id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    let Some((status, attempt_count)) = row else {
        return Err(StorageError::NotFound(id.to_string()));
    };
    Ok((
        parse_status(&status)?,
        u32::try_from(attempt_count).unwrap_or(0),
    ))
}

fn parse_status(value: &str) -> Result<MentionStatus, StorageError> {
    value.parse().map_err(StorageError::Serialization)
}

/// Fixed-width UTC text so stored timestamps compare correctly as strings.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
