//! Language-model client: one async call with exponential-backoff retry,
//! plus JSON extraction from free-form LM output.
//!
//! Grounded on `original_source/core/lats/llm_client.py`; retry timing and
//! triggers match `spec.md` §4.6 exactly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LatsError, LatsResult};

#[derive(Debug, Clone)]
pub struct LmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-chat".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            // spec.md §5: "internal per-attempt timeout (default 60s)".
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOwned {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Async text-generation client used for candidate synthesis.
///
/// A trait rather than a single struct so tests and the mock-executor
/// fixtures can substitute a canned client with no network I/O.
#[async_trait::async_trait]
pub trait LmClient: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
        system_message: Option<&str>,
    ) -> LatsResult<String>;
}

pub struct HttpLmClient {
    config: LmConfig,
    http: reqwest::Client,
}

impl HttpLmClient {
    pub fn new(config: LmConfig) -> LatsResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LatsError::lm_transport(e.to_string()))?;
        Ok(Self { config, http })
    }

    const MAX_ATTEMPTS: u32 = 3;

    fn backoff_delay(attempt: u32) -> Duration {
        // attempt is 0-indexed: 2s, 4s, 8s.
        Duration::from_secs(2u64.pow(attempt + 1))
    }

    fn retry_eligible(status: Option<reqwest::StatusCode>) -> bool {
        match status {
            Some(status) => status.as_u16() == 429 || status.as_u16() >= 400,
            None => true, // timeout / transport error
        }
    }
}

#[async_trait::async_trait]
impl LmClient for HttpLmClient {
    async fn generate(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
        system_message: Option<&str>,
    ) -> LatsResult<String> {
        let mut messages = Vec::new();
        if let Some(system) = system_message {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature,
            max_tokens,
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        let mut last_error = LatsError::lm_transport("no attempt made");

        for attempt in 0..Self::MAX_ATTEMPTS {
            let outcome = self
                .http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await;

            match outcome {
                Ok(response) if response.status().is_success() => {
                    let parsed: ChatResponse = response
                        .json()
                        .await
                        .map_err(|e| LatsError::lm_transport(e.to_string()))?;
                    return parsed
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| LatsError::lm_transport("empty choices array"));
                }
                Ok(response) => {
                    let status = response.status();
                    last_error =
                        LatsError::lm_transport(format!("LM returned HTTP {status}"));
                    if attempt + 1 == Self::MAX_ATTEMPTS || !Self::retry_eligible(Some(status)) {
                        return Err(last_error);
                    }
                }
                Err(e) => {
                    last_error = LatsError::lm_transport(e.to_string());
                    if attempt + 1 == Self::MAX_ATTEMPTS {
                        return Err(last_error);
                    }
                }
            }

            tokio::time::sleep(Self::backoff_delay(attempt)).await;
        }

        Err(last_error)
    }
}

/// 4-stage fallback parsing, per `spec.md` §4.6: direct parse, a
/// ```` ```json ```` fenced block, an untagged fenced block, then a greedy
/// top-level array/object match anywhere in the text.
pub fn extract_json(text: &str) -> LatsResult<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(body) = extract_fenced(text, Some("json")) {
        if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
            return Ok(value);
        }
    }

    if let Some(body) = extract_fenced(text, None) {
        if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
            return Ok(value);
        }
    }

    if let Some(value) = extract_greedy(text) {
        return Ok(value);
    }

    Err(LatsError::lm_unparsable(
        "no JSON object or array could be extracted from the response",
    ))
}

fn extract_fenced(text: &str, tag: Option<&str>) -> Option<&str> {
    let fence = "```";
    let mut search_from = 0;
    while let Some(start_rel) = text[search_from..].find(fence) {
        let start = search_from + start_rel;
        let after_fence = start + fence.len();
        let rest = &text[after_fence..];

        let body_start = match tag {
            Some(tag) => {
                if rest.starts_with(tag) {
                    after_fence + tag.len()
                } else {
                    search_from = after_fence;
                    continue;
                }
            }
            None => after_fence,
        };

        let body_start = text[body_start..]
            .find('\n')
            .map(|i| body_start + i + 1)
            .unwrap_or(body_start);

        if let Some(end_rel) = text[body_start..].find(fence) {
            return Some(&text[body_start..body_start + end_rel]);
        }
        search_from = after_fence;
    }
    None
}

fn extract_greedy(text: &str) -> Option<Value> {
    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if end > start {
                if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_direct_parse() {
        let text = r#"{"tests":[{"name":"t1","code":"fn t1() {}"}]}"#;
        let value = extract_json(text).unwrap();
        assert!(value["tests"].is_array());
    }

    #[test]
    fn extract_json_tagged_fence() {
        let text = "Here is the result:\n```json\n{\"tests\":[]}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert!(value["tests"].is_array());
    }

    #[test]
    fn extract_json_untagged_fence() {
        let text = "```\n[{\"name\":\"t1\",\"code\":\"fn t1() {}\"}]\n```";
        let value = extract_json(text).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn extract_json_greedy_fallback() {
        let text = "Sure! [{\"name\":\"t1\",\"code\":\"x\"}] is what I came up with.";
        let value = extract_json(text).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn extract_json_fails_on_garbage() {
        assert!(extract_json("no json here at all").is_err());
    }

    #[test]
    fn backoff_delays_match_spec() {
        assert_eq!(HttpLmClient::backoff_delay(0), Duration::from_secs(2));
        assert_eq!(HttpLmClient::backoff_delay(1), Duration::from_secs(4));
        assert_eq!(HttpLmClient::backoff_delay(2), Duration::from_secs(8));
    }

    #[test]
    fn retry_eligibility_matches_taxonomy() {
        assert!(HttpLmClient::retry_eligible(None));
        assert!(HttpLmClient::retry_eligible(Some(reqwest::StatusCode::TOO_MANY_REQUESTS)));
        assert!(HttpLmClient::retry_eligible(Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(!HttpLmClient::retry_eligible(Some(reqwest::StatusCode::OK)));
    }
}
