//! # LATS Service
//!
//! A test-suite synthesis service that drives a Language-Agent Tree Search
//! (LATS) — a Monte-Carlo Tree Search whose action space is "ask a language
//! model for K candidate tests" and whose transition step is "submit each
//! candidate to an external coverage executor and observe cumulative MC/DC
//! suite coverage."
//!
//! ## Core modules
//!
//! - [`state`] — the per-node snapshot (suite, coverage, residual
//!   conditions, learned rules).
//! - [`tree`] — the arena-backed search tree and UCB1 selection.
//! - [`reward`] — the pure reward function.
//! - [`executor`] — the coverage-executor client and its fingerprint cache.
//! - [`session`] — the per-session context cache (rules, tokens, TTL).
//! - [`prompt`] — prompt rendering for the four template modes.
//! - [`llm`] — the language-model client (retry/backoff, JSON extraction).
//! - [`controller`] — the MCTS search loop that ties everything together.
//! - [`http_server`] — the HTTP gateway under `/api/v1/lats`.

pub mod controller;
pub mod error;
pub mod executor;
pub mod http_server;
pub mod llm;
pub mod prompt;
pub mod reward;
pub mod session;
pub mod state;
pub mod tree;

pub use controller::{MCTSConfig, MCTSController};
pub use error::{LatsError, LatsResult};
pub use executor::{Executor, ExecutorClient, ExecutorConfig};
pub use llm::{HttpLmClient, LmClient, LmConfig};
pub use prompt::PromptManager;
pub use reward::{RewardConfig, RewardFunction};
pub use session::{SessionCache, SessionContext};
pub use state::{ConditionInfo, ExecutionResult, TestState};
pub use tree::{ActionKind, NodeId, Tree};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Initialize structured logging. Idempotent: a second call is a no-op.
pub fn init() -> Result<(), LatsError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| LatsError::Initialization(e.to_string()))?;

    tracing::info!("LATS service v{} initialized", VERSION);
    Ok(())
}
