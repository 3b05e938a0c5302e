//! Prompt rendering: pure template substitution, no LM I/O here.
//!
//! Four modes: the three from `spec.md` §4.5 (`initialize`, `targeted`,
//! `batch`) plus `reflection`, a supplemental mode grounded in
//! `original_source/core/lats/prompt_manager.py::render_reflection` that
//! produces the text asking the LM to propose a learned rule after a
//! compile failure (see `SPEC_FULL.md` §4.8).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::state::ConditionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Initialize,
    Targeted,
    Batch,
    Reflection,
}

impl PromptMode {
    fn template_name(self) -> &'static str {
        match self {
            PromptMode::Initialize => "initialize",
            PromptMode::Targeted => "targeted",
            PromptMode::Batch => "batch",
            PromptMode::Reflection => "reflection",
        }
    }
}

const DEFAULT_INITIALIZE_TEMPLATE: &str = "\
You are generating an initial test suite for the function below.

Function signature: {function_signature}
Function code:
{function_code}

Context:
{context}

Uncovered conditions (up to 10):
{uncovered_conditions}

Learned rules:
{learned_rules}

Produce {k} candidate tests as JSON: {{\"tests\":[{{\"name\":...,\"code\":...}}]}}";

const DEFAULT_TARGETED_TEMPLATE: &str = "\
You are generating a test that exercises exactly one residual condition.

Function signature: {function_signature}

Target condition: {target_condition}

Similar tests:
{similar_tests}

Prior failed attempts:
{failed_attempts}

Learned rules:
{learned_rules}

Produce 1 candidate test as JSON: {{\"tests\":[{{\"name\":...,\"code\":...}}]}}";

const DEFAULT_BATCH_TEMPLATE: &str = "\
You are extending an existing test suite to improve MC/DC coverage.

Function signature: {function_signature}

Existing tests (most recent 5):
{existing_tests}

Uncovered conditions (up to 10):
{uncovered_conditions}

Learned rules:
{learned_rules}

Recent errors:
{recent_errors}

Produce {k} candidate tests as JSON: {{\"tests\":[{{\"name\":...,\"code\":...}}]}}";

const DEFAULT_REFLECTION_TEMPLATE: &str = "\
A generated test failed to compile. Propose one short rule to avoid this
class of failure in future tests.

Target condition: {target_condition}

Failing test code:
{test_code}

Error message:
{error_message}

Existing rules:
{existing_rules}

Respond with a single short sentence, no JSON.";

pub struct PromptManager {
    templates_dir: Option<PathBuf>,
    cache: Mutex<HashMap<&'static str, String>>,
}

impl PromptManager {
    pub fn new(templates_dir: Option<PathBuf>) -> Self {
        Self {
            templates_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn load_template(&self, mode: PromptMode) -> String {
        let name = mode.template_name();
        if let Some(cached) = self.cache.lock().unwrap().get(name) {
            return cached.clone();
        }

        let from_disk = self.templates_dir.as_ref().and_then(|dir| {
            let path: &Path = &dir.join(format!("{name}.txt"));
            std::fs::read_to_string(path).ok()
        });

        let text = from_disk.unwrap_or_else(|| default_template(mode).to_string());
        self.cache.lock().unwrap().insert(name, text.clone());
        text
    }

    pub fn render_initialize(
        &self,
        function_signature: &str,
        function_code: &str,
        context: &str,
        uncovered_conditions: &[ConditionInfo],
        learned_rules: &[String],
        k: usize,
    ) -> String {
        let template = self.load_template(PromptMode::Initialize);
        template
            .replace("{function_signature}", function_signature)
            .replace("{function_code}", function_code)
            .replace("{context}", context)
            .replace(
                "{uncovered_conditions}",
                &format_conditions(&uncovered_conditions.iter().take(10).collect::<Vec<_>>()),
            )
            .replace("{learned_rules}", &format_learned_rules(learned_rules))
            .replace("{k}", &k.to_string())
    }

    pub fn render_targeted(
        &self,
        function_signature: &str,
        target_condition: &str,
        similar_tests: &[String],
        failed_attempts: &[String],
        learned_rules: &[String],
    ) -> String {
        let template = self.load_template(PromptMode::Targeted);
        template
            .replace("{function_signature}", function_signature)
            .replace("{target_condition}", target_condition)
            .replace("{similar_tests}", &format_list(similar_tests, "No similar tests yet"))
            .replace(
                "{failed_attempts}",
                &format_list(failed_attempts, "No prior failed attempts"),
            )
            .replace("{learned_rules}", &format_learned_rules(learned_rules))
    }

    pub fn render_batch(
        &self,
        function_signature: &str,
        existing_tests: &[String],
        uncovered_conditions: &[ConditionInfo],
        learned_rules: &[String],
        recent_errors: &[String],
        k: usize,
    ) -> String {
        let template = self.load_template(PromptMode::Batch);
        let last_five: Vec<String> = existing_tests.iter().rev().take(5).rev().cloned().collect();
        template
            .replace("{function_signature}", function_signature)
            .replace("{existing_tests}", &format_list(&last_five, "No tests yet"))
            .replace(
                "{uncovered_conditions}",
                &format_conditions(&uncovered_conditions.iter().take(10).collect::<Vec<_>>()),
            )
            .replace("{learned_rules}", &format_learned_rules(learned_rules))
            .replace(
                "{recent_errors}",
                &format_list(&recent_errors.iter().rev().take(5).rev().cloned().collect::<Vec<_>>(), "No recent errors"),
            )
            .replace("{k}", &k.to_string())
    }

    pub fn render_reflection(
        &self,
        target_condition: &str,
        test_code: &str,
        error_message: &str,
        existing_rules: &[String],
    ) -> String {
        let template = self.load_template(PromptMode::Reflection);
        template
            .replace("{target_condition}", target_condition)
            .replace("{test_code}", test_code)
            .replace("{error_message}", error_message)
            .replace("{existing_rules}", &format_learned_rules(existing_rules))
    }
}

fn default_template(mode: PromptMode) -> &'static str {
    match mode {
        PromptMode::Initialize => DEFAULT_INITIALIZE_TEMPLATE,
        PromptMode::Targeted => DEFAULT_TARGETED_TEMPLATE,
        PromptMode::Batch => DEFAULT_BATCH_TEMPLATE,
        PromptMode::Reflection => DEFAULT_REFLECTION_TEMPLATE,
    }
}

fn format_conditions(conditions: &[&ConditionInfo]) -> String {
    if conditions.is_empty() {
        return "No uncovered conditions".to_string();
    }
    conditions
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let obligations = match (c.need_true, c.need_false) {
                (true, true) => "TRUE and FALSE",
                (true, false) => "TRUE",
                (false, true) => "FALSE",
                (false, false) => "COVERED",
            };
            format!("{}. {} [{}]", i + 1, c.expression, obligations)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_learned_rules(rules: &[String]) -> String {
    format_list(rules, "No learned rules yet")
}

fn format_list(items: &[String], empty_placeholder: &str) -> String {
    if items.is_empty() {
        empty_placeholder.to_string()
    } else {
        items
            .iter()
            .map(|r| format!("- {r}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_template_substitutes_all_placeholders() {
        let pm = PromptManager::new(None);
        let rendered = pm.render_initialize(
            "fn f(x: i32) -> bool",
            "fn f(x: i32) -> bool { x > 0 }",
            "",
            &[ConditionInfo::new("x > 0", true, true)],
            &[],
            3,
        );
        assert!(rendered.contains("fn f(x: i32) -> bool"));
        assert!(rendered.contains("x > 0"));
        assert!(rendered.contains("No learned rules yet"));
        assert!(rendered.contains('3'));
        assert!(!rendered.contains("{function_signature}"));
    }

    #[test]
    fn batch_template_takes_last_five_tests_only() {
        let pm = PromptManager::new(None);
        let tests: Vec<String> = (1..=8).map(|i| format!("test_{i:03}")).collect();
        let rendered = pm.render_batch("fn f()", &tests, &[], &[], &[], 1);
        assert!(rendered.contains("test_004"));
        assert!(rendered.contains("test_008"));
        assert!(!rendered.contains("test_001"));
    }

    #[test]
    fn template_is_cached_after_first_load() {
        let pm = PromptManager::new(None);
        let _ = pm.render_initialize("f", "f", "", &[], &[], 1);
        assert!(pm.cache.lock().unwrap().contains_key("initialize"));
    }

    #[test]
    fn reflection_template_renders_without_k() {
        let pm = PromptManager::new(None);
        let rendered = pm.render_reflection("x > 0", "fn test_001() {}", "unexpected token", &[]);
        assert!(rendered.contains("unexpected token"));
        assert!(rendered.contains("x > 0"));
    }
}
