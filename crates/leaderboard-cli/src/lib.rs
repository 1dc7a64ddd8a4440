//! Operator command surface for the leaderboard.
//!
//! - [`run_cli`] executes a parsed command line against the configured
//!   `SQLite` database and cache.
//! - [`run_leaderboard`] executes one command against an existing
//!   [`Leaderboard`], whatever its backends.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use leaderboard_cache_redis::RedisOrderedCache;
use leaderboard_core::{
    parse_rfc3339_utc, AggregateStore, Leaderboard, LeaderboardConfig, LeaderboardError,
    MemoryOrderedCache, OrderedCache, ParticipantId, ScoreEntry, ScoreSubmission,
    DEFAULT_CACHE_KEY, DEFAULT_CATEGORY,
};
use leaderboard_store_sqlite::SqliteAggregateStore;
use serde_json::json;

mod logging;

pub use logging::{init_logging, LogFormat};

/// `--cache-url` value selecting the in-process cache.
pub const MEMORY_CACHE_URL: &str = "memory";

#[derive(Debug, Parser)]
#[command(name = "lb")]
#[command(about = "Leaderboard CLI")]
pub struct Cli {
    #[arg(long, env = "LEADERBOARD_DB", default_value = "./leaderboard.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "LEADERBOARD_CACHE_URL", default_value = MEMORY_CACHE_URL)]
    cache_url: String,

    #[arg(long, env = "LEADERBOARD_CACHE_KEY", default_value = DEFAULT_CACHE_KEY)]
    cache_key: String,

    #[arg(long, env = "LEADERBOARD_OPERATION_TIMEOUT_MS", default_value_t = 2_500)]
    operation_timeout_ms: u64,

    #[arg(long, default_value_t = 10)]
    default_top_k: usize,

    #[arg(long, default_value_t = 100)]
    max_top_k: usize,

    #[arg(long, env = "LEADERBOARD_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Human)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Submit(SubmitArgs),
    Top(TopArgs),
    Rank(RankArgs),
    History(HistoryArgs),
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(long)]
    participant: i64,
    #[arg(long, allow_negative_numbers = true)]
    delta: i64,
    #[arg(long, default_value = DEFAULT_CATEGORY)]
    category: String,
    #[arg(long)]
    occurred_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct TopArgs {
    #[arg(long)]
    k: Option<usize>,
}

#[derive(Debug, Args)]
pub struct RankArgs {
    #[arg(long)]
    participant: i64,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    participant: i64,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    Rebuild,
    Check(CacheCheckArgs),
}

#[derive(Debug, Args)]
pub struct CacheCheckArgs {
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    Totals,
}

/// Cache selected at startup from `--cache-url`.
pub enum CacheBackend {
    Memory(MemoryOrderedCache),
    Redis(RedisOrderedCache),
}

impl CacheBackend {
    /// Opens the cache named by `cache_url` under `config.cache_key`.
    ///
    /// # Errors
    /// Returns an error when the URL is neither `memory` nor a valid Redis URL.
    pub fn connect(
        cache_url: &str,
        config: &LeaderboardConfig,
        timeout: Duration,
    ) -> Result<Self> {
        if cache_url == MEMORY_CACHE_URL {
            return Ok(Self::Memory(MemoryOrderedCache::new()));
        }

        let cache = RedisOrderedCache::open(cache_url, config.cache_key.as_str())?
            .with_timeout(timeout);
        Ok(Self::Redis(cache))
    }

    /// True when the cache lives and dies with this process.
    #[must_use]
    pub fn is_process_local(&self) -> bool {
        matches!(self, Self::Memory(_))
    }
}

impl OrderedCache for CacheBackend {
    fn increment(
        &self,
        participant_id: ParticipantId,
        delta: i64,
    ) -> Result<i64, LeaderboardError> {
        match self {
            Self::Memory(cache) => cache.increment(participant_id, delta),
            Self::Redis(cache) => cache.increment(participant_id, delta),
        }
    }

    fn rank_descending(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Option<u64>, LeaderboardError> {
        match self {
            Self::Memory(cache) => cache.rank_descending(participant_id),
            Self::Redis(cache) => cache.rank_descending(participant_id),
        }
    }

    fn count_above(&self, score: i64) -> Result<u64, LeaderboardError> {
        match self {
            Self::Memory(cache) => cache.count_above(score),
            Self::Redis(cache) => cache.count_above(score),
        }
    }

    fn top_k(&self, k: usize) -> Result<Vec<ScoreEntry>, LeaderboardError> {
        match self {
            Self::Memory(cache) => cache.top_k(k),
            Self::Redis(cache) => cache.top_k(k),
        }
    }

    fn score_of(&self, participant_id: ParticipantId) -> Result<Option<i64>, LeaderboardError> {
        match self {
            Self::Memory(cache) => cache.score_of(participant_id),
            Self::Redis(cache) => cache.score_of(participant_id),
        }
    }

    fn set(&self, participant_id: ParticipantId, score: i64) -> Result<(), LeaderboardError> {
        match self {
            Self::Memory(cache) => cache.set(participant_id, score),
            Self::Redis(cache) => cache.set(participant_id, score),
        }
    }

    fn replace_all(&self, entries: &[ScoreEntry]) -> Result<(), LeaderboardError> {
        match self {
            Self::Memory(cache) => cache.replace_all(entries),
            Self::Redis(cache) => cache.replace_all(entries),
        }
    }

    fn cardinality(&self) -> Result<u64, LeaderboardError> {
        match self {
            Self::Memory(cache) => cache.cardinality(),
            Self::Redis(cache) => cache.cardinality(),
        }
    }
}

/// Executes the parsed command line.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, the cache
/// URL is invalid, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let Cli {
        db,
        cache_url,
        cache_key,
        operation_timeout_ms,
        default_top_k,
        max_top_k,
        command,
        ..
    } = cli;

    let timeout = Duration::from_millis(operation_timeout_ms);
    let store = SqliteAggregateStore::open(&db)?.with_busy_timeout(timeout);
    store.migrate()?;

    match command {
        Command::Migrate => print_json(&json!({
            "db": db.display().to_string(),
            "migrated": true,
        })),
        Command::Audit { command } => run_audit(command, &store),
        command => {
            let config = LeaderboardConfig {
                default_top_k,
                max_top_k,
                cache_key,
            };
            let cache = CacheBackend::connect(&cache_url, &config, timeout)?;
            if cache.is_process_local() && matches!(command, Command::Cache { .. }) {
                return Err(anyhow!(
                    "cache maintenance requires a shared cache: the `{MEMORY_CACHE_URL}` cache \
                     starts empty in every lb process; pass --cache-url redis://..."
                ));
            }
            let board = Leaderboard::new(store, cache, config)?;
            run_leaderboard(command, &board)
        }
    }
}

/// Executes one command against an existing leaderboard.
///
/// # Errors
/// Returns an error when input validation fails, the participant is unknown,
/// a store is unavailable, or a cache check finds stale entries.
pub fn run_leaderboard<S, C>(command: Command, board: &Leaderboard<S, C>) -> Result<()>
where
    S: AggregateStore,
    C: OrderedCache,
{
    match command {
        Command::Submit(args) => {
            let mut submission = ScoreSubmission::new(ParticipantId(args.participant), args.delta)
                .with_category(args.category);
            if let Some(raw) = args.occurred_at.as_deref() {
                submission = submission.with_occurred_at(parse_rfc3339_utc(raw)?);
            }
            print_json(&board.submit(&submission)?)
        }
        Command::Top(args) => print_json(&board.top(args.k)?),
        Command::Rank(args) => print_json(&board.rank(ParticipantId(args.participant))?),
        Command::History(args) => {
            print_json(&board.history(ParticipantId(args.participant), args.limit)?)
        }
        Command::Cache { command } => match command {
            CacheCommand::Rebuild => print_json(&board.rebuild_cache()?),
            CacheCommand::Check(args) => {
                let report = board.check_cache(args.limit)?;
                print_json(&report)?;
                if !report.healthy {
                    return Err(anyhow!(
                        "cache drift detected: {} stale entries",
                        report.stale.len()
                    ));
                }
                Ok(())
            }
        },
        Command::Migrate | Command::Audit { .. } => Err(anyhow!(
            "migrate and audit commands run against the sqlite store directly"
        )),
    }
}

fn run_audit(command: AuditCommand, store: &SqliteAggregateStore) -> Result<()> {
    match command {
        AuditCommand::Totals => {
            let mismatches = store.audit_totals()?;
            print_json(&mismatches)?;
            if !mismatches.is_empty() {
                return Err(anyhow!(
                    "totals audit failed: {} participants differ from their event sum",
                    mismatches.len()
                ));
            }
            Ok(())
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
