//! Submission pipeline and cache-aside query services.
//!
//! Writes go to the durable store first and to the cache second, outside the
//! durable transaction. A cache failure after a durable commit is logged and
//! swallowed; the submission is still acknowledged. Reads go to the cache
//! first and fall back to the durable store, writing what they read back into
//! the cache.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    competition_ranks, AggregateStore, LeaderboardConfig, LeaderboardError, OrderedCache,
    ParticipantId, RankedEntry, ScoreEvent, ScoreSubmission, SubmitReceipt,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebuildReport {
    pub entries: usize,
    pub top_score: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaleEntry {
    pub participant_id: ParticipantId,
    pub durable_score: i64,
    pub cached_score: i64,
}

/// Cache state relative to the durable top of the board.
///
/// Missing entries are normal under lazy warming; stale entries are not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriftReport {
    pub healthy: bool,
    pub checked: usize,
    pub cached_members: u64,
    pub missing: Vec<ParticipantId>,
    pub stale: Vec<StaleEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachedRank {
    Hit(RankedEntry),
    Miss,
    Tied { position: u64, above: u64 },
}

pub struct Leaderboard<S, C> {
    store: S,
    cache: C,
    config: LeaderboardConfig,
}

impl<S, C> Leaderboard<S, C>
where
    S: AggregateStore,
    C: OrderedCache,
{
    /// # Errors
    /// Returns [`LeaderboardError::Configuration`] when `config` is invalid.
    pub fn new(store: S, cache: C, config: LeaderboardConfig) -> Result<Self, LeaderboardError> {
        config.validate()?;
        Ok(Self {
            store,
            cache,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn config(&self) -> &LeaderboardConfig {
        &self.config
    }

    /// Applies one score delta: event + aggregate in one durable transaction,
    /// then a cache increment.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::Validation`] for malformed input and
    /// [`LeaderboardError::SubmissionFailed`] when the durable write fails, in
    /// which case the cache is not touched.
    pub fn submit(&self, submission: &ScoreSubmission) -> Result<SubmitReceipt, LeaderboardError> {
        submission.validate()?;

        let recorded = self.store.record_score(submission).map_err(|err| {
            LeaderboardError::SubmissionFailed(format!(
                "participant {}: {err}",
                submission.participant_id
            ))
        })?;

        let cache_synced = match self
            .cache
            .increment(submission.participant_id, submission.delta)
        {
            Ok(cached_score) => {
                debug!(
                    participant_id = %submission.participant_id,
                    cached_score,
                    "cache increment applied"
                );
                true
            }
            Err(err) => {
                warn!(
                    participant_id = %submission.participant_id,
                    delta = submission.delta,
                    total_score = recorded.total_score,
                    error = %err,
                    "cache increment failed after durable commit; cache entry now stale"
                );
                false
            }
        };

        info!(
            participant_id = %submission.participant_id,
            delta = submission.delta,
            category = %submission.category,
            event_seq = recorded.event.event_seq,
            total_score = recorded.total_score,
            cache_synced,
            "score submitted"
        );

        Ok(SubmitReceipt {
            event: recorded.event,
            total_score: recorded.total_score,
            cache_synced,
        })
    }

    /// Top `k` participants (config default when `None`, clamped to
    /// `max_top_k`) with competition ranks.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::StoreUnavailable`] when the cache is cold or
    /// unreachable and the durable store cannot be read either.
    pub fn top(&self, requested: Option<usize>) -> Result<Vec<RankedEntry>, LeaderboardError> {
        let k = self.config.clamp_k(requested);
        if k == 0 {
            return Ok(Vec::new());
        }

        match self.cache.top_k(k) {
            Ok(mut entries) if !entries.is_empty() => {
                entries.truncate(k);
                debug!(k, returned = entries.len(), "top-k served from cache");
                return Ok(competition_ranks(&entries));
            }
            Ok(_) => debug!(k, "cache empty; reading top-k from durable store"),
            Err(err) => warn!(
                k,
                error = %err,
                "cache read failed; reading top-k from durable store"
            ),
        }

        let entries = self.store.top_k(k)?;
        let mut warmed = 0_usize;
        for entry in &entries {
            if let Err(err) = self.cache.set(entry.participant_id, entry.score) {
                warn!(
                    participant_id = %entry.participant_id,
                    error = %err,
                    "cache backfill failed; remaining top-k entries left cold"
                );
                break;
            }
            warmed += 1;
        }
        if !entries.is_empty() {
            info!(k, returned = entries.len(), warmed, "backfilled cache from durable top-k");
        }

        Ok(competition_ranks(&entries))
    }

    /// Rank and score of one participant.
    ///
    /// A cached rank is trusted only when no tied member is ordered ahead of
    /// the participant; otherwise the durable competition rank is used. A
    /// member whose cache increment was swallowed keeps its pre-failure cached
    /// score until [`Leaderboard::rebuild_cache`].
    ///
    /// # Errors
    /// Returns [`LeaderboardError::NotFound`] when the participant has no
    /// aggregate, and [`LeaderboardError::StoreUnavailable`] when the fallback
    /// read fails.
    pub fn rank(&self, participant_id: ParticipantId) -> Result<RankedEntry, LeaderboardError> {
        participant_id.validate()?;

        match self.cached_rank(participant_id) {
            Ok(CachedRank::Hit(entry)) => {
                debug!(
                    participant_id = %participant_id,
                    rank = entry.rank,
                    "rank served from cache"
                );
                return Ok(entry);
            }
            Ok(CachedRank::Miss) => {
                debug!(
                    participant_id = %participant_id,
                    "cache miss; reading rank from durable store"
                );
            }
            Ok(CachedRank::Tied { position, above }) => {
                debug!(
                    participant_id = %participant_id,
                    position,
                    above,
                    "cached score is tied; reading rank from durable store"
                );
            }
            Err(err) => {
                warn!(
                    participant_id = %participant_id,
                    error = %err,
                    "cache read failed; reading rank from durable store"
                );
            }
        }

        let entry = self
            .store
            .rank_of(participant_id)?
            .ok_or(LeaderboardError::NotFound(participant_id))?;

        if let Err(err) = self.cache.set(participant_id, entry.score) {
            warn!(participant_id = %participant_id, error = %err, "cache backfill failed");
        }

        Ok(entry)
    }

    /// Replaces the cache contents with every durable aggregate.
    ///
    /// # Errors
    /// Propagates store and cache failures; nothing is swallowed here.
    pub fn rebuild_cache(&self) -> Result<RebuildReport, LeaderboardError> {
        let entries = self.store.all_aggregates()?;
        self.cache.replace_all(&entries)?;
        info!(entries = entries.len(), "rebuilt cache from durable store");

        Ok(RebuildReport {
            entries: entries.len(),
            top_score: entries.first().map(|entry| entry.score),
        })
    }

    /// Compares the durable top `limit` aggregates against the cache.
    ///
    /// # Errors
    /// Propagates store and cache failures.
    pub fn check_cache(&self, limit: usize) -> Result<DriftReport, LeaderboardError> {
        let durable = self.store.top_k(limit)?;
        let mut missing = Vec::new();
        let mut stale = Vec::new();

        for entry in &durable {
            match self.cache.score_of(entry.participant_id)? {
                None => missing.push(entry.participant_id),
                Some(cached_score) if cached_score != entry.score => stale.push(StaleEntry {
                    participant_id: entry.participant_id,
                    durable_score: entry.score,
                    cached_score,
                }),
                Some(_) => {}
            }
        }

        Ok(DriftReport {
            healthy: stale.is_empty(),
            checked: durable.len(),
            cached_members: self.cache.cardinality()?,
            missing,
            stale,
        })
    }

    /// Audit trail for one participant, oldest first.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::StoreUnavailable`] when the event log
    /// cannot be read.
    pub fn history(
        &self,
        participant_id: ParticipantId,
        limit: Option<usize>,
    ) -> Result<Vec<ScoreEvent>, LeaderboardError> {
        participant_id.validate()?;
        self.store.events_for(participant_id, limit)
    }

    fn cached_rank(&self, participant_id: ParticipantId) -> Result<CachedRank, LeaderboardError> {
        let position = self.cache.rank_descending(participant_id)?;
        let score = self.cache.score_of(participant_id)?;
        let (Some(position), Some(score)) = (position, score) else {
            return Ok(CachedRank::Miss);
        };

        let above = self.cache.count_above(score)?;
        if above != position {
            return Ok(CachedRank::Tied { position, above });
        }

        Ok(CachedRank::Hit(RankedEntry {
            participant_id,
            score,
            rank: position + 1,
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::{MemoryAggregateStore, MemoryOrderedCache, ScoreEntry};

    type MemoryBoard = Leaderboard<MemoryAggregateStore, MemoryOrderedCache>;

    fn must<T>(result: Result<T, LeaderboardError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn board() -> MemoryBoard {
        must(Leaderboard::new(
            MemoryAggregateStore::new(),
            MemoryOrderedCache::new(),
            LeaderboardConfig::default(),
        ))
    }

    fn board_with_totals(totals: &[(i64, i64)]) -> MemoryBoard {
        let store = must(MemoryAggregateStore::new().with_totals(totals.iter().copied()));
        must(Leaderboard::new(
            store,
            MemoryOrderedCache::new(),
            LeaderboardConfig::default(),
        ))
    }

    fn submit(board: &MemoryBoard, participant: i64, delta: i64) -> SubmitReceipt {
        must(board.submit(&ScoreSubmission::new(ParticipantId(participant), delta)))
    }

    #[test]
    fn repeated_submissions_accumulate_into_rank_total() {
        let board = board();
        submit(&board, 7, 50);
        let receipt = submit(&board, 7, 30);
        assert_eq!(receipt.total_score, 80);
        assert!(receipt.cache_synced);

        let entry = must(board.rank(ParticipantId(7)));
        assert_eq!(entry.score, 80);
        assert_eq!(entry.rank, 1);
        assert_eq!(must(board.history(ParticipantId(7), None)).len(), 2);
    }

    #[test]
    fn cold_cache_top_falls_back_and_warms_cache() {
        let board = board_with_totals(&[(1, 100), (2, 90), (3, 80)]);

        let top = must(board.top(Some(2)));
        assert_eq!(
            top,
            vec![
                RankedEntry {
                    participant_id: ParticipantId(1),
                    score: 100,
                    rank: 1
                },
                RankedEntry {
                    participant_id: ParticipantId(2),
                    score: 90,
                    rank: 2
                },
            ]
        );
        assert_eq!(must(board.cache().score_of(ParticipantId(1))), Some(100));
        assert_eq!(must(board.cache().score_of(ParticipantId(2))), Some(90));
        assert_eq!(must(board.cache().score_of(ParticipantId(3))), None);

        board.store().set_available(false);
        let cached = must(board.top(Some(2)));
        assert_eq!(cached, top);
    }

    #[test]
    fn tied_participants_share_durable_rank_on_every_path() {
        let board = board_with_totals(&[(5, 100), (6, 100)]);

        let five = must(board.rank(ParticipantId(5)));
        assert_eq!(five.rank, 1);
        assert_eq!(must(board.cache().score_of(ParticipantId(6))), None);

        let six = must(board.rank(ParticipantId(6)));
        assert_eq!(six.rank, 1);

        // both cached now; the cache orders 6 ahead of 5 by its secondary key
        assert_eq!(must(board.cache().rank_descending(ParticipantId(5))), Some(1));
        assert_eq!(must(board.rank(ParticipantId(5))).rank, 1);
        assert_eq!(must(board.rank(ParticipantId(6))).rank, 1);

        let top = must(board.top(None));
        assert!(top.iter().all(|entry| entry.rank == 1));
    }

    #[test]
    fn tied_cache_rank_is_not_trusted_without_durable_store() {
        let board = board_with_totals(&[(5, 100), (6, 100)]);
        must(board.rank(ParticipantId(5)));
        must(board.rank(ParticipantId(6)));

        board.store().set_available(false);
        assert_eq!(must(board.rank(ParticipantId(6))).rank, 1);
        assert!(matches!(
            board.rank(ParticipantId(5)),
            Err(LeaderboardError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn durable_failure_rejects_submission_without_cache_mutation() {
        let board = board();
        submit(&board, 3, 10);

        board.store().set_available(false);
        let result = board.submit(&ScoreSubmission::new(ParticipantId(3), 25));
        assert!(matches!(result, Err(LeaderboardError::SubmissionFailed(_))));
        assert_eq!(must(board.cache().score_of(ParticipantId(3))), Some(10));

        let fresh = board.submit(&ScoreSubmission::new(ParticipantId(4), 25));
        assert!(matches!(fresh, Err(LeaderboardError::SubmissionFailed(_))));
        assert_eq!(must(board.cache().score_of(ParticipantId(4))), None);
    }

    #[test]
    fn swallowed_increment_on_cached_member_stays_stale_until_rebuild() {
        let board = board();
        submit(&board, 9, 40);

        board.cache().set_available(false);
        let receipt = submit(&board, 9, 60);
        assert!(!receipt.cache_synced);
        assert_eq!(receipt.total_score, 100);
        board.cache().set_available(true);

        // cache hits keep serving the pre-failure score; only a rebuild repairs it
        assert_eq!(must(board.cache().score_of(ParticipantId(9))), Some(40));
        for _ in 0..3 {
            assert_eq!(must(board.rank(ParticipantId(9))).score, 40);
        }
        let drift = must(board.check_cache(10));
        assert!(!drift.healthy);
        assert_eq!(
            drift.stale,
            vec![StaleEntry {
                participant_id: ParticipantId(9),
                durable_score: 100,
                cached_score: 40,
            }]
        );

        must(board.rebuild_cache());
        assert_eq!(must(board.rank(ParticipantId(9))).score, 100);
        assert!(must(board.check_cache(10)).healthy);
    }

    #[test]
    fn swallowed_increment_on_cold_member_converges_through_rank_backfill() {
        let board = board();
        submit(&board, 1, 30);

        board.cache().set_available(false);
        let receipt = submit(&board, 9, 100);
        assert!(!receipt.cache_synced);
        board.cache().set_available(true);
        assert_eq!(must(board.cache().score_of(ParticipantId(9))), None);

        let entry = must(board.rank(ParticipantId(9)));
        assert_eq!((entry.score, entry.rank), (100, 1));
        assert_eq!(must(board.cache().score_of(ParticipantId(9))), Some(100));

        let again = must(board.rank(ParticipantId(9)));
        assert_eq!((again.score, again.rank), (100, 1));
        assert!(must(board.check_cache(10)).healthy);
    }

    #[test]
    fn swallowed_increment_on_cold_board_converges_through_top_backfill() {
        let board = board();
        board.cache().set_available(false);
        submit(&board, 4, 70);
        submit(&board, 5, 20);
        board.cache().set_available(true);
        assert_eq!(must(board.cache().cardinality()), 0);

        let top = must(board.top(Some(2)));
        assert_eq!(top[0].participant_id, ParticipantId(4));
        assert_eq!(top[0].score, 70);
        assert_eq!(must(board.cache().score_of(ParticipantId(4))), Some(70));
        assert_eq!(must(board.cache().score_of(ParticipantId(5))), Some(20));
    }

    #[test]
    fn cache_outage_on_read_falls_back_to_durable() {
        let board = board();
        submit(&board, 1, 10);
        submit(&board, 2, 20);

        board.cache().set_available(false);
        let entry = must(board.rank(ParticipantId(1)));
        assert_eq!((entry.score, entry.rank), (10, 2));

        let top = must(board.top(Some(5)));
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].participant_id, ParticipantId(2));
    }

    #[test]
    fn rank_of_unknown_participant_is_not_found() {
        let board = board_with_totals(&[(1, 10)]);
        assert_eq!(
            board.rank(ParticipantId(42)),
            Err(LeaderboardError::NotFound(ParticipantId(42)))
        );
        assert_eq!(must(board.cache().score_of(ParticipantId(42))), None);
    }

    #[test]
    fn store_outage_during_cache_miss_surfaces() {
        let board = board_with_totals(&[(1, 10)]);
        board.store().set_available(false);
        assert!(matches!(
            board.rank(ParticipantId(1)),
            Err(LeaderboardError::StoreUnavailable(_))
        ));
        assert!(matches!(
            board.top(None),
            Err(LeaderboardError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn empty_board_returns_empty_top() {
        let board = board();
        assert!(must(board.top(None)).is_empty());
        assert!(must(board.top(Some(0))).is_empty());
    }

    #[test]
    fn single_rank_backfill_does_not_warm_the_rest() {
        let board = board_with_totals(&[(1, 100), (2, 90), (3, 80)]);
        must(board.rank(ParticipantId(3)));

        assert_eq!(must(board.cache().cardinality()), 1);
        assert_eq!(must(board.cache().score_of(ParticipantId(1))), None);

        // other participants still miss and fill in one at a time
        assert_eq!(must(board.rank(ParticipantId(2))).rank, 2);
        assert_eq!(must(board.cache().cardinality()), 2);
    }

    #[test]
    fn invalid_submission_touches_neither_store() {
        let board = board();
        let result = board.submit(&ScoreSubmission::new(ParticipantId(1), -1));
        assert!(matches!(result, Err(LeaderboardError::Validation(_))));
        assert!(must(board.store().all_aggregates()).is_empty());
        assert_eq!(must(board.cache().cardinality()), 0);
    }

    #[test]
    fn concurrent_submissions_never_lose_updates() {
        let board = board();
        std::thread::scope(|scope| {
            for worker in 0..8_i64 {
                let board = &board;
                scope.spawn(move || {
                    for round in 0..25_i64 {
                        submit(board, 1, worker + round);
                        submit(board, 2, 1);
                    }
                });
            }
        });

        let expected: i64 = (0..8_i64)
            .flat_map(|worker| (0..25_i64).map(move |round| worker + round))
            .sum();
        assert_eq!(must(board.store().rank_of(ParticipantId(1))).map(|e| e.score), Some(expected));
        assert_eq!(must(board.cache().score_of(ParticipantId(1))), Some(expected));
        assert_eq!(must(board.cache().score_of(ParticipantId(2))), Some(200));
    }

    #[test]
    fn rebuild_replaces_partial_cache_with_full_projection() {
        let board = board_with_totals(&[(1, 30), (2, 20), (3, 10)]);
        must(board.cache().set(ParticipantId(99), 1_000));

        let report = must(board.rebuild_cache());
        assert_eq!(
            report,
            RebuildReport {
                entries: 3,
                top_score: Some(30)
            }
        );
        assert_eq!(must(board.cache().score_of(ParticipantId(99))), None);
        let drift = must(board.check_cache(10));
        assert!(drift.healthy);
        assert!(drift.missing.is_empty());
        assert_eq!(drift.cached_members, 3);
    }

    #[test]
    fn top_is_clamped_to_configured_maximum() {
        let totals: Vec<(i64, i64)> = (1..=20).map(|id| (id, id * 10)).collect();
        let store = must(MemoryAggregateStore::new().with_totals(totals));
        let config = LeaderboardConfig {
            default_top_k: 3,
            max_top_k: 5,
            ..LeaderboardConfig::default()
        };
        let board = must(Leaderboard::new(store, MemoryOrderedCache::new(), config));

        assert_eq!(must(board.top(Some(50))).len(), 5);
        assert_eq!(must(board.top(None)).len(), 3);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = LeaderboardConfig {
            default_top_k: 0,
            ..LeaderboardConfig::default()
        };
        let result = Leaderboard::new(
            MemoryAggregateStore::new(),
            MemoryOrderedCache::new(),
            config,
        );
        assert!(matches!(result, Err(LeaderboardError::Configuration(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_total_is_order_independent(deltas in prop::collection::vec(0i64..1_000, 1..40)) {
            let forward = board();
            let backward = board();
            for delta in &deltas {
                submit(&forward, 11, *delta);
            }
            for delta in deltas.iter().rev() {
                submit(&backward, 11, *delta);
            }

            let expected: i64 = deltas.iter().sum();
            prop_assert_eq!(must(forward.rank(ParticipantId(11))).score, expected);
            prop_assert_eq!(must(backward.rank(ParticipantId(11))).score, expected);
        }

        #[test]
        fn prop_top_has_no_duplicates_and_respects_k(
            submissions in prop::collection::vec((1i64..15, 0i64..100), 0..60),
            k in 1usize..12,
        ) {
            let board = board();
            for (participant, delta) in &submissions {
                submit(&board, *participant, *delta);
            }

            let top = must(board.top(Some(k)));
            prop_assert!(top.len() <= k);
            let unique: HashSet<ParticipantId> =
                top.iter().map(|entry| entry.participant_id).collect();
            prop_assert_eq!(unique.len(), top.len());

            let scores: Vec<ScoreEntry> = top
                .iter()
                .map(|entry| ScoreEntry {
                    participant_id: entry.participant_id,
                    score: entry.score,
                })
                .collect();
            prop_assert!(scores.windows(2).all(|pair| pair[0].score >= pair[1].score));
            for entry in &top {
                let durable = must(board.store().rank_of(entry.participant_id));
                prop_assert_eq!(durable.map(|item| item.rank), Some(entry.rank));
            }
        }
    }
}
