//! Dual-store leaderboard engine.
//!
//! The durable [`AggregateStore`] is the source of truth for cumulative
//! scores. The [`OrderedCache`] is a disposable projection of it that serves
//! top-K and rank reads; it may be cold, partial, or briefly stale, and is
//! repaired by read-path backfill or by [`Leaderboard::rebuild_cache`].

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod cache;
pub mod engine;
pub mod memory;
pub mod store;

pub use cache::OrderedCache;
pub use engine::{DriftReport, Leaderboard, RebuildReport, StaleEntry};
pub use memory::{MemoryAggregateStore, MemoryOrderedCache};
pub use store::AggregateStore;

pub const DEFAULT_CATEGORY: &str = "default";
pub const MAX_CATEGORY_LEN: usize = 64;
pub const DEFAULT_CACHE_KEY: &str = "leaderboard_scores";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LeaderboardError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
    #[error("participant {0} not found")]
    NotFound(ParticipantId),
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ParticipantId(pub i64);

impl ParticipantId {
    /// Checks that the identifier is usable as a participant key.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::Validation`] for zero or negative ids.
    pub fn validate(self) -> Result<Self, LeaderboardError> {
        if self.0 <= 0 {
            return Err(LeaderboardError::Validation(format!(
                "participant_id MUST be >= 1, got {}",
                self.0
            )));
        }
        Ok(self)
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = LeaderboardError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value: i64 = raw.trim().parse().map_err(|err| {
            LeaderboardError::Validation(format!("invalid participant_id {raw:?}: {err}"))
        })?;
        Self(value).validate()
    }
}

/// One score delta as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreSubmission {
    pub participant_id: ParticipantId,
    pub delta: i64,
    pub category: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl ScoreSubmission {
    #[must_use]
    pub fn new(participant_id: ParticipantId, delta: i64) -> Self {
        Self {
            participant_id,
            delta,
            category: DEFAULT_CATEGORY.to_string(),
            occurred_at: now_utc(),
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn with_occurred_at(mut self, occurred_at: OffsetDateTime) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Validates a submission before it reaches either store.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::Validation`] when the participant id, delta,
    /// category or timestamp is out of range.
    pub fn validate(&self) -> Result<(), LeaderboardError> {
        self.participant_id.validate()?;

        if self.delta < 0 {
            return Err(LeaderboardError::Validation(format!(
                "delta MUST be >= 0, got {}",
                self.delta
            )));
        }

        if self.category.trim().is_empty() {
            return Err(LeaderboardError::Validation(
                "category MUST be provided".to_string(),
            ));
        }

        if self.category.chars().count() > MAX_CATEGORY_LEN {
            return Err(LeaderboardError::Validation(format!(
                "category MUST be at most {MAX_CATEGORY_LEN} characters"
            )));
        }

        if self.occurred_at.offset() != UtcOffset::UTC {
            return Err(LeaderboardError::Validation(
                "occurred_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Append-only audit record of one accepted submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub participant_id: ParticipantId,
    pub delta: i64,
    pub category: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Result of the durable half of a submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedScore {
    pub event: ScoreEvent,
    pub total_score: i64,
}

/// Acknowledgement returned to the caller of [`Leaderboard::submit`].
///
/// `cache_synced` is false when the durable commit succeeded but the cache
/// increment did not land.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub event: ScoreEvent,
    pub total_score: i64,
    pub cache_synced: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreEntry {
    pub participant_id: ParticipantId,
    pub score: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RankedEntry {
    pub participant_id: ParticipantId,
    pub score: i64,
    pub rank: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub cache_key: String,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 100,
            cache_key: DEFAULT_CACHE_KEY.to_string(),
        }
    }
}

impl LeaderboardConfig {
    /// # Errors
    /// Returns [`LeaderboardError::Configuration`] when limits are inconsistent
    /// or the cache key is empty.
    pub fn validate(&self) -> Result<(), LeaderboardError> {
        if self.default_top_k == 0 {
            return Err(LeaderboardError::Configuration(
                "default_top_k MUST be >= 1".to_string(),
            ));
        }

        if self.default_top_k > self.max_top_k {
            return Err(LeaderboardError::Configuration(format!(
                "default_top_k ({}) MUST NOT exceed max_top_k ({})",
                self.default_top_k, self.max_top_k
            )));
        }

        if self.cache_key.trim().is_empty() {
            return Err(LeaderboardError::Configuration(
                "cache_key MUST be provided".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn clamp_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_top_k)
            .min(self.max_top_k)
    }
}

/// Assigns competition ranks to entries already sorted by score descending.
///
/// Tied scores share the rank of the first entry carrying that score, and the
/// next distinct score skips the ranks the tie consumed.
#[must_use]
pub fn competition_ranks(entries: &[ScoreEntry]) -> Vec<RankedEntry> {
    let mut ranked: Vec<RankedEntry> = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let rank = match ranked.last() {
            Some(previous) if previous.score == entry.score => previous.rank,
            _ => index as u64 + 1,
        };
        ranked.push(RankedEntry {
            participant_id: entry.participant_id,
            score: entry.score,
            rank,
        });
    }
    ranked
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`LeaderboardError::Validation`] for malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LeaderboardError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LeaderboardError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LeaderboardError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LeaderboardError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LeaderboardError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LeaderboardError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
