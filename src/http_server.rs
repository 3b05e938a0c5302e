//! HTTP gateway for the LATS service.
//!
//! Exposes `/api/v1/lats/*` per `spec.md` §6. Grounded on the teacher's
//! `http_server.rs` (`AppState`, per-route handlers, `ServerConfig`,
//! `actix-cors`/`Logger`/`Compress` middleware stack); request/response
//! field names follow `original_source/models/lats_models.py` exactly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::controller::{MCTSConfig, MCTSController};
use crate::executor::Executor;
use crate::llm::LmClient;
use crate::prompt::PromptManager;
use crate::reward::RewardFunction;
use crate::session::{SessionCache, SessionContext};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            workers: 4,
            enable_cors: true,
        }
    }
}

pub struct AppState {
    pub session_cache: Arc<SessionCache>,
    pub executor: Arc<dyn Executor>,
    pub llm: Arc<dyn LmClient>,
    pub prompt_manager: Arc<PromptManager>,
    pub mcts_config: MCTSConfig,
    pub reward_config: crate::reward::RewardConfig,
    pub token_budget_default: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoverageType {
    Statement,
    Branch,
    Mcdc,
}

impl Default for CoverageType {
    fn default() -> Self {
        Self::Mcdc
    }
}

fn default_coverage_target() -> f64 {
    0.95
}

fn default_max_iterations() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
pub struct LATSSearchRequest {
    pub session_id: String,
    pub function_signature: String,
    pub function_path: String,
    pub function_code: String,
    #[serde(default)]
    pub context: String,
    #[serde(default = "default_coverage_target")]
    pub coverage_target: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub coverage_type: CoverageType,
}

impl LATSSearchRequest {
    fn validate(&self) -> Result<(), String> {
        if self.session_id.trim().is_empty() {
            return Err("session_id must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.coverage_target) {
            return Err("coverage_target must be in [0, 1]".to_string());
        }
        if !(1..=1000).contains(&self.max_iterations) {
            return Err("max_iterations must be in [1, 1000]".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize)]
pub struct CoverageDetails {
    pub statement: f64,
    pub branch: f64,
    pub mcdc: f64,
}

#[derive(Debug, Serialize)]
pub struct LATSSearchResponse {
    pub session_id: String,
    pub status: String,
    pub test_names: Vec<String>,
    pub final_coverage: f64,
    pub iterations: u32,
    pub total_tests_generated: u64,
    pub total_tests_in_suite: usize,
    pub tokens_used: u64,
    pub search_time_seconds: f64,
    pub learned_rules: Vec<String>,
    pub coverage_details: CoverageDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub function_signature: String,
    pub coverage_target: f64,
    pub tokens_used: u64,
    pub tokens_remaining: u64,
    pub age_seconds: i64,
    pub learned_rules: Vec<String>,
}

impl From<SessionContext> for SessionInfo {
    fn from(ctx: SessionContext) -> Self {
        Self {
            session_id: ctx.session_id.clone(),
            function_signature: ctx.function_signature.clone(),
            coverage_target: ctx.coverage_target,
            tokens_used: ctx.total_tokens(),
            tokens_remaining: ctx.tokens_remaining(),
            age_seconds: ctx.age_seconds(),
            learned_rules: ctx.learned_rules.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub active_sessions: usize,
    pub session_ids: Vec<String>,
    pub total_tokens_used: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

async fn search(state: web::Data<AppState>, body: web::Json<LATSSearchRequest>) -> HttpResponse {
    let request = body.into_inner();
    if let Err(message) = request.validate() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": message }));
    }

    let started = Instant::now();
    let session_id = request.session_id.clone();
    let function_signature = request.function_signature.clone();
    let function_path = request.function_path.clone();
    let function_code = request.function_code.clone();
    let context = request.context.clone();
    let coverage_target = request.coverage_target;
    let max_iterations = request.max_iterations;
    let token_budget = state.token_budget_default;

    let mut session = state
        .session_cache
        .get_or_create(&session_id, || {
            SessionContext::new(
                session_id.clone(),
                function_signature.clone(),
                function_path.clone(),
                function_code.clone(),
                context.clone(),
                coverage_target,
                max_iterations,
                token_budget,
            )
        })
        .await;

    let mut mcts_config = state.mcts_config.clone();
    mcts_config.coverage_target = coverage_target;
    mcts_config.max_iterations = max_iterations;

    let controller = MCTSController::new(
        mcts_config,
        RewardFunction::new(state.reward_config),
        Arc::clone(&state.executor),
        Arc::clone(&state.llm),
        Arc::clone(&state.prompt_manager),
    );

    let deadline = Duration::from_secs(600);
    let outcome = match tokio::time::timeout(deadline, controller.search(&mut session, None)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            return HttpResponse::RequestTimeout().json(serde_json::json!({
                "error": "search exceeded its deadline",
            }));
        }
    };

    // Persist token usage and learned rules accrued during this search back
    // into the shared session cache.
    state
        .session_cache
        .add_token_usage(
            &session_id,
            session.prompt_tokens,
            session.completion_tokens,
        )
        .await;
    for rule in &session.learned_rules {
        state.session_cache.update_learned_rules(&session_id, rule).await;
    }

    let best = outcome.tree.get(outcome.best_node);
    let status = if best.state.current_coverage >= coverage_target {
        "success"
    } else {
        "failed"
    };

    let response = LATSSearchResponse {
        session_id,
        status: status.to_string(),
        test_names: best.state.suite_names.clone(),
        final_coverage: best.state.current_coverage,
        iterations: outcome.stats.iterations,
        // spec.md §9: preserved as-is, an approximation that undercounts
        // actual candidates generated because visits grow by 1 per
        // backprop, not per candidate.
        total_tests_generated: outcome.tree.get(outcome.tree.root_id()).visits,
        total_tests_in_suite: best.state.suite_names.len(),
        tokens_used: session.total_tokens(),
        search_time_seconds: (started.elapsed().as_secs_f64() * 100.0).round() / 100.0,
        learned_rules: session.learned_rules.clone(),
        coverage_details: CoverageDetails {
            statement: best.state.coverage_breakdown.statement,
            branch: best.state.coverage_breakdown.branch,
            mcdc: best.state.coverage_breakdown.mcdc,
        },
        error_message: None,
    };

    HttpResponse::Ok().json(response)
}

async fn get_session(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let session_id = path.into_inner();
    match state.session_cache.get(&session_id).await {
        Some(ctx) => HttpResponse::Ok().json(SessionInfo::from(ctx)),
        None => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("session {session_id} not found"),
        })),
    }
}

async fn delete_session(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let session_id = path.into_inner();
    if state.session_cache.remove(&session_id).await {
        HttpResponse::NoContent().finish()
    } else {
        HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("session {session_id} not found"),
        }))
    }
}

async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.session_cache.stats().await;
    let session_ids = state.session_cache.active_ids().await;
    HttpResponse::Ok().json(SessionsResponse {
        active_sessions: stats.total_sessions,
        session_ids,
        total_tokens_used: stats.total_tokens_used,
    })
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(HealthCheckResponse {
        status: "ok",
        version: crate::VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

pub async fn start_server(state: AppState, server_config: ServerConfig) -> std::io::Result<()> {
    let data = web::Data::new(state);
    let workers = server_config.workers;
    let bind_addr = (server_config.host.clone(), server_config.port);
    let enable_cors = server_config.enable_cors;

    info!(
        "starting LATS gateway on {}:{} ({} workers)",
        server_config.host, server_config.port, workers
    );

    HttpServer::new(move || {
        let mut app = App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default());

        if enable_cors {
            app = app.wrap(Cors::permissive());
        }

        app.service(
            web::scope("/api/v1/lats")
                .route("/search", web::post().to(search))
                .route("/session/{id}", web::get().to(get_session))
                .route("/session/{id}", web::delete().to(delete_session))
                .route("/sessions", web::get().to(list_sessions))
                .route("/health", web::get().to(health_check)),
        )
    })
    .workers(workers)
    .bind(bind_addr)?
    .run()
    .await
    .map_err(|e| {
        error!("server error: {e}");
        e
    })
}
