//! LATS gateway binary.
//!
//! Run with: cargo run --bin lats-server

use std::env;
use std::sync::Arc;
use std::time::Duration;

use lats_service::controller::MCTSConfig;
use lats_service::executor::{ExecutorClient, ExecutorConfig};
use lats_service::http_server::{start_server, AppState, ServerConfig};
use lats_service::llm::{HttpLmClient, LmConfig};
use lats_service::prompt::PromptManager;
use lats_service::reward::RewardConfig;
use lats_service::session::SessionCache;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lats_service=debug".parse().unwrap())
                .add_directive("actix_web=info".parse().unwrap()),
        )
        .init();

    let server_config = ServerConfig {
        host: env::var("LATS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        port: env_or("LATS_PORT", 8081u16),
        workers: env_or("LATS_WORKERS", 4usize),
        enable_cors: env_or("LATS_ENABLE_CORS", true),
    };

    let mcts_config = MCTSConfig {
        max_iterations: env_or("LATS_MAX_ITERATIONS", 100u32),
        coverage_target: env_or("LATS_COVERAGE_TARGET", 0.95f64),
        exploration_coef: env_or("LATS_EXPLORATION_COEF", std::f64::consts::SQRT_2),
        beam_width: env_or("LATS_BEAM_WIDTH", 5usize),
        ..Default::default()
    };

    let reward_config = RewardConfig::default();

    let executor_config = ExecutorConfig {
        base_url: env::var("LATS_EXECUTOR_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".to_string()),
        timeout: Duration::from_secs(env_or("LATS_EXECUTOR_TIMEOUT_SECS", 30u64)),
    };
    let executor = Arc::new(
        ExecutorClient::new(executor_config).expect("failed to build executor client"),
    );

    let lm_config = LmConfig {
        api_key: env::var("LATS_LM_API_KEY").unwrap_or_default(),
        base_url: env::var("LATS_LM_BASE_URL")
            .unwrap_or_else(|_| "https://api.deepseek.com/v1".to_string()),
        model: env::var("LATS_LM_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string()),
        temperature: env_or("LATS_LM_TEMPERATURE", 0.7f64),
        max_tokens: env_or("LATS_LM_MAX_TOKENS", 2048u32),
        timeout: Duration::from_secs(60),
    };
    let llm = Arc::new(HttpLmClient::new(lm_config).expect("failed to build LM client"));

    let templates_dir = env::var("LATS_PROMPT_TEMPLATE_DIR").ok().map(std::path::PathBuf::from);
    let prompt_manager = Arc::new(PromptManager::new(templates_dir));

    let ttl_minutes = env_or("LATS_SESSION_TTL_MINUTES", 60u64);
    let session_cache = SessionCache::new(Duration::from_secs(ttl_minutes * 60));

    let state = AppState {
        session_cache,
        executor,
        llm,
        prompt_manager,
        mcts_config,
        reward_config,
        token_budget_default: env_or("LATS_TOKEN_BUDGET_DEFAULT", 100_000u64),
    };

    tracing::info!("starting LATS gateway on {}:{}", server_config.host, server_config.port);
    start_server(state, server_config).await
}
