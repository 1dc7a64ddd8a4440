#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use leaderboard_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AggregateStore, LeaderboardError, ParticipantId,
    RankedEntry, RecordedScore, ScoreEntry, ScoreEvent, ScoreSubmission,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;
use ulid::Ulid;

const SCHEMA_MIGRATION_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS participants (
  participant_id INTEGER PRIMARY KEY CHECK (participant_id >= 1),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS score_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  participant_id INTEGER NOT NULL,
  delta INTEGER NOT NULL CHECK (delta >= 0),
  category TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (participant_id) REFERENCES participants(participant_id)
);

CREATE TRIGGER IF NOT EXISTS trg_score_events_no_update
BEFORE UPDATE ON score_events
BEGIN
  SELECT RAISE(FAIL, 'score_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_score_events_no_delete
BEFORE DELETE ON score_events
BEGIN
  SELECT RAISE(FAIL, 'score_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_score_events_participant_seq
  ON score_events(participant_id, event_seq);

CREATE TABLE IF NOT EXISTS leaderboard_aggregates (
  participant_id INTEGER PRIMARY KEY,
  total_score INTEGER NOT NULL CHECK (total_score >= 0),
  updated_at TEXT NOT NULL,
  FOREIGN KEY (participant_id) REFERENCES participants(participant_id)
);

CREATE INDEX IF NOT EXISTS idx_leaderboard_aggregates_total
  ON leaderboard_aggregates(total_score DESC, participant_id ASC);
";

/// `SQLite`-backed durable aggregate store.
///
/// Holds only the database path: every operation opens its own connection and
/// drops it before returning, so the store can be shared across threads.
/// `:memory:` is therefore not supported; each call would see a fresh database.
#[derive(Debug, Clone)]
pub struct SqliteAggregateStore {
    path: PathBuf,
    busy_timeout: Duration,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TotalsMismatch {
    pub participant_id: ParticipantId,
    pub total_score: i64,
    pub event_sum: i64,
    pub event_count: usize,
}

impl SqliteAggregateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };

        let conn = store.connect()?;
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))
            .context("failed to enable WAL journal mode")?;

        Ok(store)
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply leaderboard schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_MIGRATION_VERSION, now],
        )
        .context("failed to register leaderboard schema migration")?;

        Ok(())
    }

    /// Appends the event and bumps the aggregate inside one `IMMEDIATE`
    /// transaction.
    pub fn record(&self, submission: &ScoreSubmission) -> Result<RecordedScore> {
        submission
            .validate()
            .map_err(|err| anyhow!("submission validation failed: {err}"))?;

        let event_id = Ulid::new();
        let recorded_at = now_utc();
        let occurred_at_raw =
            format_rfc3339(submission.occurred_at).map_err(|err| anyhow!(err.to_string()))?;
        let recorded_at_raw = format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?;

        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start score transaction")?;

        ensure_participant(&tx, submission.participant_id, &recorded_at_raw)?;

        tx.execute(
            "INSERT INTO score_events(
                event_id, participant_id, delta, category, occurred_at, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event_id.to_string(),
                submission.participant_id.0,
                submission.delta,
                submission.category,
                occurred_at_raw,
                recorded_at_raw,
            ],
        )
        .context("failed to append score event")?;
        let event_seq = tx.last_insert_rowid();

        let total_score = increment_aggregate(
            &tx,
            submission.participant_id,
            submission.delta,
            &recorded_at_raw,
        )?;

        tx.commit().context("failed to commit score transaction")?;
        debug!(
            participant_id = %submission.participant_id,
            event_seq,
            total_score,
            "score transaction committed"
        );

        Ok(RecordedScore {
            event: ScoreEvent {
                event_seq,
                event_id,
                participant_id: submission.participant_id,
                delta: submission.delta,
                category: submission.category.clone(),
                occurred_at: submission.occurred_at,
                recorded_at,
            },
            total_score,
        })
    }

    pub fn rank(&self, participant_id: ParticipantId) -> Result<Option<RankedEntry>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT
                    mine.total_score,
                    (SELECT COUNT(*) FROM leaderboard_aggregates other
                      WHERE other.total_score > mine.total_score) + 1
                 FROM leaderboard_aggregates mine
                 WHERE mine.participant_id = ?1",
                params![participant_id.0],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .context("failed to query participant rank")?;

        row.map(|(score, rank)| -> Result<RankedEntry> {
            let rank = u64::try_from(rank).with_context(|| format!("invalid rank: {rank}"))?;
            Ok(RankedEntry {
                participant_id,
                score,
                rank,
            })
        })
        .transpose()
    }

    pub fn top(&self, limit: Option<usize>) -> Result<Vec<ScoreEntry>> {
        let query = "SELECT participant_id, total_score
             FROM leaderboard_aggregates
             ORDER BY total_score DESC, participant_id ASC
             LIMIT ?1";

        let conn = self.connect()?;
        let mut stmt = conn.prepare(query)?;
        let rows = stmt.query_map(params![sql_limit(limit)], |row| {
            Ok(ScoreEntry {
                participant_id: ParticipantId(row.get(0)?),
                score: row.get(1)?,
            })
        })?;

        collect_rows(rows)
    }

    pub fn list_events_for_participant(
        &self,
        participant_id: ParticipantId,
        limit: Option<usize>,
    ) -> Result<Vec<ScoreEvent>> {
        let query = "SELECT
                event_seq, event_id, participant_id, delta, category, occurred_at, recorded_at
             FROM score_events
             WHERE participant_id = ?1
             ORDER BY event_seq ASC
             LIMIT ?2";

        let conn = self.connect()?;
        let mut stmt = conn.prepare(query)?;
        let rows = stmt.query_map(params![participant_id.0, sql_limit(limit)], parse_event_row)?;
        collect_rows(rows)
    }

    /// Participants whose aggregate differs from the sum of their events.
    pub fn audit_totals(&self) -> Result<Vec<TotalsMismatch>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT
                agg.participant_id,
                agg.total_score,
                COALESCE(SUM(events.delta), 0) AS event_sum,
                COUNT(events.event_seq) AS event_count
             FROM leaderboard_aggregates agg
             LEFT JOIN score_events events
               ON events.participant_id = agg.participant_id
             GROUP BY agg.participant_id, agg.total_score
             HAVING agg.total_score != COALESCE(SUM(events.delta), 0)
             ORDER BY agg.participant_id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            let event_count: i64 = row.get(3)?;
            Ok(TotalsMismatch {
                participant_id: ParticipantId(row.get(0)?),
                total_score: row.get(1)?,
                event_sum: row.get(2)?,
                event_count: usize::try_from(event_count).unwrap_or(0),
            })
        })?;

        collect_rows(rows)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).with_context(|| {
            format!("failed to open sqlite database at {}", self.path.display())
        })?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(self.busy_timeout)
            .context("failed to configure sqlite busy timeout")?;

        Ok(conn)
    }
}

impl AggregateStore for SqliteAggregateStore {
    fn record_score(
        &self,
        submission: &ScoreSubmission,
    ) -> Result<RecordedScore, LeaderboardError> {
        self.record(submission).map_err(unavailable)
    }

    fn rank_of(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Option<RankedEntry>, LeaderboardError> {
        self.rank(participant_id).map_err(unavailable)
    }

    fn top_k(&self, k: usize) -> Result<Vec<ScoreEntry>, LeaderboardError> {
        self.top(Some(k)).map_err(unavailable)
    }

    fn all_aggregates(&self) -> Result<Vec<ScoreEntry>, LeaderboardError> {
        self.top(None).map_err(unavailable)
    }

    fn events_for(
        &self,
        participant_id: ParticipantId,
        limit: Option<usize>,
    ) -> Result<Vec<ScoreEvent>, LeaderboardError> {
        self.list_events_for_participant(participant_id, limit)
            .map_err(unavailable)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(err: anyhow::Error) -> LeaderboardError {
    LeaderboardError::StoreUnavailable(format!("{err:#}"))
}

/// `LIMIT` operand: a negative value means no limit, and oversized requests
/// saturate at `i64::MAX`.
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(-1, |value| i64::try_from(value).unwrap_or(i64::MAX))
}

fn ensure_participant(conn: &Connection, participant_id: ParticipantId, now: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO participants(participant_id, created_at) VALUES (?1, ?2)",
        params![participant_id.0, now],
    )
    .context("failed to register participant")?;
    Ok(())
}

fn increment_aggregate(
    conn: &Connection,
    participant_id: ParticipantId,
    delta: i64,
    now: &str,
) -> Result<i64> {
    conn.query_row(
        "INSERT INTO leaderboard_aggregates(participant_id, total_score, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(participant_id) DO UPDATE SET
           total_score = leaderboard_aggregates.total_score + excluded.total_score,
           updated_at = excluded.updated_at
         RETURNING total_score",
        params![participant_id.0, delta, now],
        |row| row.get(0),
    )
    .context("failed to upsert leaderboard aggregate")
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoreEvent> {
    let event_id_raw: String = row.get(1)?;
    let occurred_at_raw: String = row.get(5)?;
    let recorded_at_raw: String = row.get(6)?;

    let event_id = Ulid::from_string(&event_id_raw).map_err(|err| {
        conversion_error(1, rusqlite::types::Type::Text, format!("invalid event_id: {err}"))
    })?;
    let occurred_at = parse_rfc3339_utc(&occurred_at_raw)
        .map_err(|err| conversion_error(5, rusqlite::types::Type::Text, err.to_string()))?;
    let recorded_at = parse_rfc3339_utc(&recorded_at_raw)
        .map_err(|err| conversion_error(6, rusqlite::types::Type::Text, err.to_string()))?;

    Ok(ScoreEvent {
        event_seq: row.get(0)?,
        event_id,
        participant_id: ParticipantId(row.get(2)?),
        delta: row.get(3)?,
        category: row.get(4)?,
        occurred_at,
        recorded_at,
    })
}

fn conversion_error(
    column: usize,
    kind: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
