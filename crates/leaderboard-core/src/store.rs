use crate::{
    LeaderboardError, ParticipantId, RankedEntry, RecordedScore, ScoreEntry, ScoreEvent,
    ScoreSubmission,
};

/// Durable per-participant aggregate store; the source of truth.
///
/// Every failure to reach the backing store is reported as
/// [`LeaderboardError::StoreUnavailable`]. Implementations never retry.
pub trait AggregateStore: Send + Sync {
    /// Appends the score event and increments the participant's aggregate in
    /// one transaction. Either both are committed or neither is.
    #[allow(clippy::missing_errors_doc)]
    fn record_score(&self, submission: &ScoreSubmission) -> Result<RecordedScore, LeaderboardError>;

    /// Competition rank: `1 + count(total > this total)`.
    #[allow(clippy::missing_errors_doc)]
    fn rank_of(&self, participant_id: ParticipantId)
        -> Result<Option<RankedEntry>, LeaderboardError>;

    /// Highest totals first; ties ordered by participant id ascending.
    #[allow(clippy::missing_errors_doc)]
    fn top_k(&self, k: usize) -> Result<Vec<ScoreEntry>, LeaderboardError>;

    /// Every aggregate, in the same order as [`AggregateStore::top_k`].
    #[allow(clippy::missing_errors_doc)]
    fn all_aggregates(&self) -> Result<Vec<ScoreEntry>, LeaderboardError>;

    #[allow(clippy::missing_errors_doc)]
    fn events_for(
        &self,
        participant_id: ParticipantId,
        limit: Option<usize>,
    ) -> Result<Vec<ScoreEvent>, LeaderboardError>;
}
