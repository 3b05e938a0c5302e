//! Session context cache: per-session mutable state (learned rules, token
//! budget, TTL) shared across requests, guarded by a single lock over the
//! whole map.
//!
//! Grounded on `original_source/core/lats/context_manager.py`, adapted to
//! the teacher's `Arc<...>` shared-state idiom (`http_server.rs::AppState`)
//! instead of a module-level Python singleton.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub function_signature: String,
    pub function_path: String,
    pub function_code: String,
    pub context: String,
    pub coverage_target: f64,
    pub max_iterations: u32,
    pub learned_rules: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub max_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        function_signature: impl Into<String>,
        function_path: impl Into<String>,
        function_code: impl Into<String>,
        context: impl Into<String>,
        coverage_target: f64,
        max_iterations: u32,
        max_tokens: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            function_signature: function_signature.into(),
            function_path: function_path.into(),
            function_code: function_code.into(),
            context: context.into(),
            coverage_target,
            max_iterations,
            learned_rules: Vec::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            max_tokens,
            created_at: now,
            last_accessed: now,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn tokens_remaining(&self) -> u64 {
        self.max_tokens.saturating_sub(self.total_tokens())
    }

    pub fn budget_exceeded(&self) -> bool {
        self.total_tokens() >= self.max_tokens
    }

    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.last_accessed).num_seconds().max(0)
    }

    pub fn add_learned_rule(&mut self, rule: impl Into<String>) {
        let rule = rule.into();
        if !rule.is_empty() && !self.learned_rules.contains(&rule) {
            self.learned_rules.push(rule);
        }
        self.touch();
    }

    pub fn add_token_usage(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionCacheStats {
    pub total_sessions: usize,
    pub total_tokens_used: u64,
    pub total_learned_rules: usize,
    pub ttl_seconds: u64,
}

pub struct SessionCache {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionContext>>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Reuse-and-touch if the session exists; otherwise create it with the
    /// provided parameters and insert it.
    pub async fn get_or_create<F>(&self, session_id: &str, build: F) -> SessionContext
    where
        F: FnOnce() -> SessionContext,
    {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get_mut(session_id) {
            existing.last_accessed = Utc::now();
            return existing.clone();
        }
        let fresh = build();
        sessions.insert(session_id.to_string(), fresh.clone());
        fresh
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionContext> {
        let mut sessions = self.sessions.lock().await;
        if let Some(ctx) = sessions.get_mut(session_id) {
            ctx.last_accessed = Utc::now();
            Some(ctx.clone())
        } else {
            None
        }
    }

    pub async fn update_learned_rules(&self, session_id: &str, rule: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(ctx) => {
                ctx.add_learned_rule(rule.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn add_token_usage(&self, session_id: &str, prompt_tokens: u64, completion_tokens: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(ctx) => {
                ctx.add_token_usage(prompt_tokens, completion_tokens);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.lock().await.remove(session_id).is_some()
    }

    /// Remove entries whose `last_accessed` is older than the configured
    /// TTL. Returns the number evicted.
    pub async fn cleanup_expired(&self) -> usize {
        let ttl_seconds = self.ttl.as_secs() as i64;
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, ctx)| ctx.age_seconds() > ttl_seconds)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired.len()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn stats(&self) -> SessionCacheStats {
        let sessions = self.sessions.lock().await;
        SessionCacheStats {
            total_sessions: sessions.len(),
            total_tokens_used: sessions.values().map(|c| c.total_tokens()).sum(),
            total_learned_rules: sessions.values().map(|c| c.learned_rules.len()).sum(),
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}
