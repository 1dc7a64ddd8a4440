use crate::{LeaderboardError, ParticipantId, ScoreEntry};

/// Ordered participant -> score projection used as a read accelerator.
///
/// A structure that does not exist yet behaves as an empty one: reads return
/// `None` or an empty page, never an error. Failures to reach the backing
/// cache are reported as [`LeaderboardError::CacheUnavailable`].
pub trait OrderedCache: Send + Sync {
    /// Adds `delta` to the member's score, creating it at `delta` if absent.
    /// Submissions must go through this, never through [`OrderedCache::set`].
    #[allow(clippy::missing_errors_doc)]
    fn increment(&self, participant_id: ParticipantId, delta: i64)
        -> Result<i64, LeaderboardError>;

    /// 0-indexed position by score descending. Ties are ordered by the
    /// backend's own secondary key.
    #[allow(clippy::missing_errors_doc)]
    fn rank_descending(&self, participant_id: ParticipantId)
        -> Result<Option<u64>, LeaderboardError>;

    /// Number of cached members with a score strictly greater than `score`.
    #[allow(clippy::missing_errors_doc)]
    fn count_above(&self, score: i64) -> Result<u64, LeaderboardError>;

    #[allow(clippy::missing_errors_doc)]
    fn top_k(&self, k: usize) -> Result<Vec<ScoreEntry>, LeaderboardError>;

    #[allow(clippy::missing_errors_doc)]
    fn score_of(&self, participant_id: ParticipantId) -> Result<Option<i64>, LeaderboardError>;

    /// Idempotent overwrite for backfill.
    #[allow(clippy::missing_errors_doc)]
    fn set(&self, participant_id: ParticipantId, score: i64) -> Result<(), LeaderboardError>;

    /// Swaps the whole structure for `entries` in one step.
    #[allow(clippy::missing_errors_doc)]
    fn replace_all(&self, entries: &[ScoreEntry]) -> Result<(), LeaderboardError>;

    /// Number of cached members.
    #[allow(clippy::missing_errors_doc)]
    fn cardinality(&self) -> Result<u64, LeaderboardError>;
}
