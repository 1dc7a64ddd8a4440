//! In-process implementations of both store contracts.
//!
//! Each carries an availability switch so callers can simulate an unreachable
//! backend without touching the network.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use ulid::Ulid;

use crate::{
    now_utc, AggregateStore, LeaderboardError, OrderedCache, ParticipantId, RankedEntry,
    RecordedScore, ScoreEntry, ScoreEvent, ScoreSubmission,
};

#[derive(Debug, Default)]
struct AggregateState {
    totals: HashMap<ParticipantId, i64>,
    events: Vec<ScoreEvent>,
}

impl AggregateState {
    fn sorted(&self) -> Vec<ScoreEntry> {
        let mut entries: Vec<ScoreEntry> = self
            .totals
            .iter()
            .map(|(participant_id, score)| ScoreEntry {
                participant_id: *participant_id,
                score: *score,
            })
            .collect();
        entries.sort_by_key(|entry| (Reverse(entry.score), entry.participant_id));
        entries
    }

    fn add(&mut self, participant_id: ParticipantId, delta: i64) -> Result<i64, LeaderboardError> {
        let total = self.totals.entry(participant_id).or_insert(0);
        *total = total.checked_add(delta).ok_or_else(|| {
            LeaderboardError::StoreUnavailable(format!(
                "total_score overflow for participant {participant_id}"
            ))
        })?;
        Ok(*total)
    }
}

/// Thread-safe in-memory [`AggregateStore`].
#[derive(Debug)]
pub struct MemoryAggregateStore {
    state: Mutex<AggregateState>,
    available: AtomicBool,
}

impl Default for MemoryAggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAggregateStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AggregateState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Seeds aggregates by recording one event per participant.
    ///
    /// # Errors
    /// Returns [`LeaderboardError::Validation`] for an invalid id or negative
    /// total, and [`LeaderboardError::StoreUnavailable`] when the store is
    /// switched off.
    pub fn with_totals(
        self,
        totals: impl IntoIterator<Item = (i64, i64)>,
    ) -> Result<Self, LeaderboardError> {
        for (participant, total) in totals {
            self.record_score(&ScoreSubmission::new(ParticipantId(participant), total))?;
        }
        Ok(self)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, AggregateState>, LeaderboardError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(LeaderboardError::StoreUnavailable(
                "memory store switched off".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| {
                LeaderboardError::StoreUnavailable("memory store lock poisoned".to_string())
            })
    }
}

impl AggregateStore for MemoryAggregateStore {
    fn record_score(
        &self,
        submission: &ScoreSubmission,
    ) -> Result<RecordedScore, LeaderboardError> {
        submission.validate()?;
        let mut state = self.lock()?;

        let total_score = state.add(submission.participant_id, submission.delta)?;
        let event = ScoreEvent {
            event_seq: i64::try_from(state.events.len()).unwrap_or(i64::MAX) + 1,
            event_id: Ulid::new(),
            participant_id: submission.participant_id,
            delta: submission.delta,
            category: submission.category.clone(),
            occurred_at: submission.occurred_at,
            recorded_at: now_utc(),
        };
        state.events.push(event.clone());

        Ok(RecordedScore { event, total_score })
    }

    fn rank_of(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Option<RankedEntry>, LeaderboardError> {
        let state = self.lock()?;
        let Some(score) = state.totals.get(&participant_id).copied() else {
            return Ok(None);
        };
        let above = state.totals.values().filter(|total| **total > score).count();
        Ok(Some(RankedEntry {
            participant_id,
            score,
            rank: above as u64 + 1,
        }))
    }

    fn top_k(&self, k: usize) -> Result<Vec<ScoreEntry>, LeaderboardError> {
        let mut entries = self.lock()?.sorted();
        entries.truncate(k);
        Ok(entries)
    }

    fn all_aggregates(&self) -> Result<Vec<ScoreEntry>, LeaderboardError> {
        Ok(self.lock()?.sorted())
    }

    fn events_for(
        &self,
        participant_id: ParticipantId,
        limit: Option<usize>,
    ) -> Result<Vec<ScoreEvent>, LeaderboardError> {
        let state = self.lock()?;
        Ok(state
            .events
            .iter()
            .filter(|event| event.participant_id == participant_id)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

type OrderKey = (Reverse<i64>, Reverse<ParticipantId>);

#[derive(Debug, Default)]
struct CacheState {
    scores: HashMap<ParticipantId, i64>,
    order: BTreeSet<OrderKey>,
}

impl CacheState {
    fn put(&mut self, participant_id: ParticipantId, score: i64) {
        if let Some(previous) = self.scores.insert(participant_id, score) {
            self.order.remove(&(Reverse(previous), Reverse(participant_id)));
        }
        self.order.insert((Reverse(score), Reverse(participant_id)));
    }
}

/// Thread-safe in-memory [`OrderedCache`].
///
/// Tied scores are ordered by participant id descending, the same direction a
/// reversed sorted-set range walks its members.
#[derive(Debug)]
pub struct MemoryOrderedCache {
    state: Mutex<CacheState>,
    available: AtomicBool,
}

impl Default for MemoryOrderedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrderedCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, LeaderboardError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(LeaderboardError::CacheUnavailable(
                "memory cache switched off".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| {
                LeaderboardError::CacheUnavailable("memory cache lock poisoned".to_string())
            })
    }
}

impl OrderedCache for MemoryOrderedCache {
    fn increment(
        &self,
        participant_id: ParticipantId,
        delta: i64,
    ) -> Result<i64, LeaderboardError> {
        let mut state = self.lock()?;
        let current = state.scores.get(&participant_id).copied().unwrap_or(0);
        let next = current.checked_add(delta).ok_or_else(|| {
            LeaderboardError::CacheUnavailable(format!(
                "score overflow for participant {participant_id}"
            ))
        })?;
        state.put(participant_id, next);
        Ok(next)
    }

    fn rank_descending(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Option<u64>, LeaderboardError> {
        let state = self.lock()?;
        let Some(score) = state.scores.get(&participant_id).copied() else {
            return Ok(None);
        };
        let position = state
            .order
            .range(..(Reverse(score), Reverse(participant_id)))
            .count();
        Ok(Some(position as u64))
    }

    fn count_above(&self, score: i64) -> Result<u64, LeaderboardError> {
        let state = self.lock()?;
        let above = state
            .order
            .iter()
            .take_while(|(Reverse(cached), _)| *cached > score)
            .count();
        Ok(above as u64)
    }

    fn top_k(&self, k: usize) -> Result<Vec<ScoreEntry>, LeaderboardError> {
        let state = self.lock()?;
        Ok(state
            .order
            .iter()
            .take(k)
            .map(|(Reverse(score), Reverse(participant_id))| ScoreEntry {
                participant_id: *participant_id,
                score: *score,
            })
            .collect())
    }

    fn score_of(&self, participant_id: ParticipantId) -> Result<Option<i64>, LeaderboardError> {
        Ok(self.lock()?.scores.get(&participant_id).copied())
    }

    fn set(&self, participant_id: ParticipantId, score: i64) -> Result<(), LeaderboardError> {
        self.lock()?.put(participant_id, score);
        Ok(())
    }

    fn replace_all(&self, entries: &[ScoreEntry]) -> Result<(), LeaderboardError> {
        let mut rebuilt = CacheState::default();
        for entry in entries {
            rebuilt.put(entry.participant_id, entry.score);
        }
        *self.lock()? = rebuilt;
        Ok(())
    }

    fn cardinality(&self) -> Result<u64, LeaderboardError> {
        Ok(self.lock()?.scores.len() as u64)
    }
}
