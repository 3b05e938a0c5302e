//! Coverage executor client: wraps the remote service that compiles and
//! runs a candidate test and reports cumulative suite coverage.
//!
//! Grounded on `original_source/core/lats/execution_engine.py`. Two
//! independent hashes are in play here and must stay independent: this
//! module's fingerprint cache hashes the *raw* test body (16 hex digits of
//! SHA-256), while the controller's in-batch dedup (see `controller.rs`)
//! separately hashes *trimmed* code for a different purpose.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LatsError, LatsResult};
use crate::state::{ConditionInfo, ExecutionResult};

/// The controller talks to this trait, not `ExecutorClient` directly, so
/// integration tests can substitute a canned in-memory executor with no
/// network I/O.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        function_path: &str,
        test_body: &str,
        test_name: &str,
        existing_names: &[String],
    ) -> ExecutionResult;

    async fn get_conditions(&self, function_path: &str) -> Vec<ConditionInfo>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            // spec.md §5: "configurable deadline (default 30s)".
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExecuteWithSuiteRequest<'a> {
    #[serde(rename = "functionPath")]
    function_path: &'a str,
    #[serde(rename = "testScript")]
    test_script: &'a str,
    #[serde(rename = "testCaseName")]
    test_case_name: &'a str,
    #[serde(rename = "existingTestNames")]
    existing_test_names: &'a [String],
    #[serde(rename = "coverageType")]
    coverage_type: &'static str,
}

#[derive(Debug, Serialize)]
struct GetCoverageRequest<'a> {
    #[serde(rename = "functionPath")]
    function_path: &'a str,
    #[serde(rename = "testCaseNames")]
    test_case_names: &'a [String],
    #[serde(rename = "coverageType")]
    coverage_type: &'static str,
}

#[derive(Debug, Serialize)]
struct GetConditionsRequest<'a> {
    #[serde(rename = "functionPath")]
    function_path: &'a str,
    #[serde(rename = "coverageType")]
    coverage_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct CoverageMetric {
    percentage: f64,
}

#[derive(Debug, Deserialize)]
struct CoverageBlock {
    statement: Option<CoverageMetric>,
    branch: Option<CoverageMetric>,
    mcdc: Option<CoverageMetric>,
}

#[derive(Debug, Deserialize)]
struct WireConditionInfo {
    condition: String,
    #[serde(rename = "needTrue")]
    need_true: bool,
    #[serde(rename = "needFalse")]
    need_false: bool,
    #[serde(rename = "parentDecision")]
    parent_decision: Option<String>,
}

impl From<WireConditionInfo> for ConditionInfo {
    fn from(w: WireConditionInfo) -> Self {
        ConditionInfo {
            expression: w.condition,
            need_true: w.need_true,
            need_false: w.need_false,
            parent_decision: w.parent_decision,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecutorResponse {
    status: String,
    coverage: Option<CoverageBlock>,
    log: Option<String>,
    #[serde(rename = "uncoveredConditions", default)]
    uncovered_conditions: Vec<WireConditionInfo>,
    #[serde(rename = "allConditions", default)]
    all_conditions: Vec<WireConditionInfo>,
}

#[derive(Debug, Deserialize)]
struct GetConditionsResponse {
    #[serde(default)]
    conditions: Vec<WireConditionInfo>,
}

/// Statistics retained for observability, following the teacher's
/// `cache.rs::CacheStatistics` naming convention.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ExecutorCacheStatistics {
    pub hits: u64,
    pub misses: u64,
}

impl ExecutorCacheStatistics {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct ExecutorClient {
    config: ExecutorConfig,
    http: reqwest::Client,
    // fingerprint (16 hex digits of sha256(raw body)) -> test name.
    fingerprint_cache: Mutex<HashMap<String, String>>,
    stats: Mutex<ExecutorCacheStatistics>,
}

impl ExecutorClient {
    pub fn new(config: ExecutorConfig) -> LatsResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LatsError::executor_transport(e.to_string()))?;
        Ok(Self {
            config,
            http,
            fingerprint_cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(ExecutorCacheStatistics::default()),
        })
    }

    fn fingerprint(body: &str) -> String {
        let digest = Sha256::digest(body.as_bytes());
        format!("{digest:x}")[..16].to_string()
    }

    pub fn clear_cache(&self) {
        self.fingerprint_cache.lock().unwrap().clear();
    }

    pub fn stats(&self) -> ExecutorCacheStatistics {
        *self.stats.lock().unwrap()
    }

    /// Submit one candidate, or reuse a cached result for an identical body.
    pub async fn execute(
        &self,
        function_path: &str,
        test_body: &str,
        test_name: &str,
        existing_names: &[String],
    ) -> ExecutionResult {
        let fingerprint = Self::fingerprint(test_body);
        let cached_name = {
            let cache = self.fingerprint_cache.lock().unwrap();
            cache.get(&fingerprint).cloned()
        };

        if let Some(cached_name) = cached_name {
            self.stats.lock().unwrap().hits += 1;
            let mut suite = existing_names.to_vec();
            if !suite.contains(&cached_name) {
                suite.push(cached_name.clone());
            }
            return self.coverage(function_path, &suite).await.unwrap_or_else(|e| {
                ExecutionResult::failed(e.to_string(), existing_names.to_vec(), cached_name)
            });
        }

        self.stats.lock().unwrap().misses += 1;
        match self
            .execute_remote(function_path, test_body, test_name, existing_names)
            .await
        {
            Ok(result) => {
                if result.compiled {
                    self.fingerprint_cache
                        .lock()
                        .unwrap()
                        .insert(fingerprint, test_name.to_string());
                }
                result
            }
            Err(e) => ExecutionResult::failed(e.to_string(), existing_names.to_vec(), test_name),
        }
    }

    async fn execute_remote(
        &self,
        function_path: &str,
        test_body: &str,
        test_name: &str,
        existing_names: &[String],
    ) -> LatsResult<ExecutionResult> {
        let url = format!("{}/api/test-execution/execute-with-suite", self.config.base_url);
        let body = ExecuteWithSuiteRequest {
            function_path,
            test_script: test_body,
            test_case_name: test_name,
            existing_test_names: existing_names,
            coverage_type: "MCDC",
        };
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LatsError::executor_transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LatsError::executor_transport(format!(
                "executor returned HTTP {}",
                response.status()
            )));
        }

        let parsed: ExecutorResponse = response
            .json()
            .await
            .map_err(|e| LatsError::executor_transport(e.to_string()))?;

        Ok(Self::parse_response(parsed, test_name, existing_names))
    }

    fn parse_response(
        parsed: ExecutorResponse,
        new_test_name: &str,
        existing_names: &[String],
    ) -> ExecutionResult {
        let compiled = parsed.status == "success";
        let error = if compiled {
            None
        } else {
            Some(parsed.log.unwrap_or_else(|| "unknown error".to_string()))
        };

        let (statement, branch, mcdc) = parsed
            .coverage
            .map(|c| {
                (
                    c.statement.map(|m| m.percentage / 100.0).unwrap_or(0.0),
                    c.branch.map(|m| m.percentage / 100.0).unwrap_or(0.0),
                    c.mcdc.map(|m| m.percentage / 100.0).unwrap_or(0.0),
                )
            })
            .unwrap_or((0.0, 0.0, 0.0));

        let suite_names = if compiled {
            let mut names = existing_names.to_vec();
            names.push(new_test_name.to_string());
            names
        } else {
            existing_names.to_vec()
        };

        let conditions_now_covered = if parsed.all_conditions.is_empty() {
            Vec::new()
        } else {
            let uncovered: std::collections::HashSet<ConditionInfo> = parsed
                .uncovered_conditions
                .iter()
                .cloned()
                .map(ConditionInfo::from)
                .collect();
            parsed
                .all_conditions
                .into_iter()
                .map(ConditionInfo::from)
                .filter(|c| !uncovered.contains(c))
                .collect()
        };

        ExecutionResult {
            new_test_name: new_test_name.to_string(),
            compiled,
            error,
            suite_names,
            statement_coverage: statement,
            branch_coverage: branch,
            mcdc_coverage: mcdc,
            conditions_now_covered,
        }
    }

    /// Recompute cumulative coverage for a suite without executing a new
    /// test.
    pub async fn coverage(&self, function_path: &str, test_names: &[String]) -> LatsResult<ExecutionResult> {
        let url = format!("{}/api/test-execution/get-coverage", self.config.base_url);
        let body = GetCoverageRequest {
            function_path,
            test_case_names: test_names,
            coverage_type: "MCDC",
        };
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LatsError::executor_transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LatsError::executor_transport(format!(
                "executor returned HTTP {}",
                response.status()
            )));
        }

        let parsed: ExecutorResponse = response
            .json()
            .await
            .map_err(|e| LatsError::executor_transport(e.to_string()))?;

        let last_name = test_names.last().cloned().unwrap_or_default();
        Ok(Self::parse_response(parsed, &last_name, test_names))
    }

    /// Fetch the root's initial condition inventory. On any error, returns
    /// an empty sequence — the search falls back to coverage-percentage
    /// tracking only rather than failing the session.
    pub async fn get_conditions(&self, function_path: &str) -> Vec<ConditionInfo> {
        let url = format!("{}/api/test-execution/get-conditions", self.config.base_url);
        let body = GetConditionsRequest {
            function_path,
            coverage_type: "MCDC",
        };

        let result: LatsResult<Vec<ConditionInfo>> = async {
            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| LatsError::executor_transport(e.to_string()))?;
            if !response.status().is_success() {
                return Err(LatsError::executor_transport(format!(
                    "executor returned HTTP {}",
                    response.status()
                )));
            }
            let parsed: GetConditionsResponse = response
                .json()
                .await
                .map_err(|e| LatsError::executor_transport(e.to_string()))?;
            Ok(parsed.conditions.into_iter().map(ConditionInfo::from).collect())
        }
        .await;

        result.unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Executor for ExecutorClient {
    async fn execute(
        &self,
        function_path: &str,
        test_body: &str,
        test_name: &str,
        existing_names: &[String],
    ) -> ExecutionResult {
        ExecutorClient::execute(self, function_path, test_body, test_name, existing_names).await
    }

    async fn get_conditions(&self, function_path: &str) -> Vec<ConditionInfo> {
        ExecutorClient::get_conditions(self, function_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_16_hex_digits() {
        let fp = ExecutorClient::fingerprint("fn test_foo() { assert!(true); }");
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive_to_content() {
        let a = ExecutorClient::fingerprint("same body");
        let b = ExecutorClient::fingerprint("same body");
        let c = ExecutorClient::fingerprint("different body");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parse_response_marks_failed_suite_unchanged() {
        let parsed = ExecutorResponse {
            status: "failed".to_string(),
            coverage: None,
            log: Some("compile error".to_string()),
            uncovered_conditions: vec![],
            all_conditions: vec![],
        };
        let existing = vec!["test_001".to_string()];
        let result = ExecutorClient::parse_response(parsed, "test_002", &existing);
        assert!(!result.compiled);
        assert_eq!(result.suite_names, existing);
        assert_eq!(result.error.as_deref(), Some("compile error"));
    }

    #[test]
    fn parse_response_derives_covered_from_all_minus_uncovered() {
        let parsed = ExecutorResponse {
            status: "success".to_string(),
            coverage: Some(CoverageBlock {
                statement: Some(CoverageMetric { percentage: 80.0 }),
                branch: Some(CoverageMetric { percentage: 70.0 }),
                mcdc: Some(CoverageMetric { percentage: 60.0 }),
            }),
            log: None,
            uncovered_conditions: vec![WireConditionInfo {
                condition: "x > 0".into(),
                need_true: true,
                need_false: true,
                parent_decision: None,
            }],
            all_conditions: vec![
                WireConditionInfo {
                    condition: "x > 0".into(),
                    need_true: true,
                    need_false: true,
                    parent_decision: None,
                },
                WireConditionInfo {
                    condition: "y < 5".into(),
                    need_true: true,
                    need_false: true,
                    parent_decision: None,
                },
            ],
        };
        let existing = vec![];
        let result = ExecutorClient::parse_response(parsed, "test_001", &existing);
        assert_eq!(result.mcdc_coverage, 0.6);
        assert_eq!(result.conditions_now_covered.len(), 1);
        assert_eq!(result.conditions_now_covered[0].expression, "y < 5");
    }

    #[test]
    fn parse_response_leaves_covered_empty_when_all_conditions_absent() {
        let parsed = ExecutorResponse {
            status: "success".to_string(),
            coverage: Some(CoverageBlock {
                statement: Some(CoverageMetric { percentage: 100.0 }),
                branch: None,
                mcdc: Some(CoverageMetric { percentage: 100.0 }),
            }),
            log: None,
            uncovered_conditions: vec![],
            all_conditions: vec![],
        };
        let result = ExecutorClient::parse_response(parsed, "test_001", &[]);
        assert!(result.conditions_now_covered.is_empty());
    }
}
