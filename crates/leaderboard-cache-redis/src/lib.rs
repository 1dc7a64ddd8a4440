//! # Redis
//!
//! Ordered cache backed by a single sorted set.
//!
//! - One key (default `leaderboard_scores`), member = participant id as a
//!   decimal string, score = cumulative score
//! - `ZINCRBY` for submissions, `ZADD` for backfill, `ZREVRANK` / `ZSCORE` /
//!   `ZCOUNT` for rank reads, `ZREVRANGE .. WITHSCORES` for top-K
//! - A missing key reads as an empty set, so a flushed or restarted Redis is
//!   just a cold cache
//! - Equal scores are ordered by member bytes, descending. That order has no
//!   business meaning, which is why rank reads also ask `ZCOUNT`
//! - Scores are doubles on the wire; integers are exact up to 2^53

#![allow(clippy::missing_errors_doc)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use leaderboard_core::{LeaderboardError, OrderedCache, ParticipantId, ScoreEntry};
use redis::{Client, Commands, Connection};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2_500);
const MAX_EXACT_SCORE: f64 = 9_007_199_254_740_992.0;

pub struct RedisOrderedCache {
    client: Client,
    key: String,
    timeout: Duration,
}

impl RedisOrderedCache {
    /// Parses the connection URL; no connection is made until the first call.
    pub fn open(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)
            .with_context(|| format!("invalid redis url: {redis_url}"))?;
        let key = key.into();
        if key.trim().is_empty() {
            return Err(anyhow!("cache key MUST be provided"));
        }

        Ok(Self {
            client,
            key,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connect(&self) -> Result<Connection> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .context("failed to connect to redis")?;
        conn.set_read_timeout(Some(self.timeout))
            .context("failed to set redis read timeout")?;
        conn.set_write_timeout(Some(self.timeout))
            .context("failed to set redis write timeout")?;
        Ok(conn)
    }

    fn rebuild_key(&self) -> String {
        format!("{}:rebuild", self.key)
    }

    pub fn zincrby(&self, participant_id: ParticipantId, delta: i64) -> Result<i64> {
        let mut conn = self.connect()?;
        let score: f64 = conn
            .zincr(&self.key, member(participant_id), to_wire(delta))
            .context("ZINCRBY failed")?;
        from_wire(score)
    }

    pub fn zrevrank(&self, participant_id: ParticipantId) -> Result<Option<u64>> {
        let mut conn = self.connect()?;
        conn.zrevrank(&self.key, member(participant_id))
            .context("ZREVRANK failed")
    }

    pub fn zcount_above(&self, score: i64) -> Result<u64> {
        let mut conn = self.connect()?;
        conn.zcount(&self.key, format!("({score}"), "+inf")
            .context("ZCOUNT failed")
    }

    pub fn zrevrange(&self, k: usize) -> Result<Vec<ScoreEntry>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(k - 1).context("top-k limit out of range")?;

        let mut conn = self.connect()?;
        let rows: Vec<(String, f64)> = conn
            .zrevrange_withscores(&self.key, 0, stop)
            .context("ZREVRANGE failed")?;

        rows.into_iter()
            .map(|(raw_member, score)| -> Result<ScoreEntry> {
                Ok(ScoreEntry {
                    participant_id: parse_member(&raw_member)?,
                    score: from_wire(score)?,
                })
            })
            .collect()
    }

    pub fn zscore(&self, participant_id: ParticipantId) -> Result<Option<i64>> {
        let mut conn = self.connect()?;
        let score: Option<f64> = conn
            .zscore(&self.key, member(participant_id))
            .context("ZSCORE failed")?;
        score.map(from_wire).transpose()
    }

    pub fn zadd(&self, participant_id: ParticipantId, score: i64) -> Result<()> {
        let mut conn = self.connect()?;
        let _: i64 = conn
            .zadd(&self.key, member(participant_id), to_wire(score))
            .context("ZADD failed")?;
        Ok(())
    }

    /// Fills a scratch key and renames it over the live key in one
    /// `MULTI`/`EXEC`, so readers see either the old or the new set.
    pub fn swap(&self, entries: &[ScoreEntry]) -> Result<()> {
        let scratch = self.rebuild_key();
        let mut conn = self.connect()?;

        if entries.is_empty() {
            let _: i64 = conn.del(&self.key).context("DEL failed")?;
            return Ok(());
        }

        let members: Vec<(f64, String)> = entries
            .iter()
            .map(|entry| (to_wire(entry.score), member(entry.participant_id)))
            .collect();

        redis::pipe()
            .atomic()
            .del(&scratch)
            .ignore()
            .zadd_multiple(&scratch, &members)
            .ignore()
            .rename(&scratch, &self.key)
            .ignore()
            .query::<()>(&mut conn)
            .context("cache swap failed")?;

        debug!(key = %self.key, entries = entries.len(), "cache swapped");
        Ok(())
    }

    pub fn zcard(&self) -> Result<u64> {
        let mut conn = self.connect()?;
        conn.zcard(&self.key).context("ZCARD failed")
    }
}

impl OrderedCache for RedisOrderedCache {
    fn increment(
        &self,
        participant_id: ParticipantId,
        delta: i64,
    ) -> Result<i64, LeaderboardError> {
        self.zincrby(participant_id, delta).map_err(unavailable)
    }

    fn rank_descending(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Option<u64>, LeaderboardError> {
        self.zrevrank(participant_id).map_err(unavailable)
    }

    fn count_above(&self, score: i64) -> Result<u64, LeaderboardError> {
        self.zcount_above(score).map_err(unavailable)
    }

    fn top_k(&self, k: usize) -> Result<Vec<ScoreEntry>, LeaderboardError> {
        self.zrevrange(k).map_err(unavailable)
    }

    fn score_of(&self, participant_id: ParticipantId) -> Result<Option<i64>, LeaderboardError> {
        self.zscore(participant_id).map_err(unavailable)
    }

    fn set(&self, participant_id: ParticipantId, score: i64) -> Result<(), LeaderboardError> {
        self.zadd(participant_id, score).map_err(unavailable)
    }

    fn replace_all(&self, entries: &[ScoreEntry]) -> Result<(), LeaderboardError> {
        self.swap(entries).map_err(unavailable)
    }

    fn cardinality(&self) -> Result<u64, LeaderboardError> {
        self.zcard().map_err(unavailable)
    }
}

#[allow(clippy::needless_pass_by_value)]
fn unavailable(err: anyhow::Error) -> LeaderboardError {
    LeaderboardError::CacheUnavailable(format!("{err:#}"))
}

fn member(participant_id: ParticipantId) -> String {
    participant_id.0.to_string()
}

fn parse_member(raw: &str) -> Result<ParticipantId> {
    raw.parse::<i64>()
        .map(ParticipantId)
        .with_context(|| format!("sorted set member is not a participant id: {raw:?}"))
}

#[allow(clippy::cast_precision_loss)]
fn to_wire(score: i64) -> f64 {
    score as f64
}

#[allow(clippy::cast_possible_truncation)]
fn from_wire(score: f64) -> Result<i64> {
    if !score.is_finite() || score.abs() > MAX_EXACT_SCORE {
        return Err(anyhow!("cached score out of exact integer range: {score}"));
    }
    Ok(score.round() as i64)
}
