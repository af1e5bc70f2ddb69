//! Remote question generation through the Gemini `generateContent` API, and
//! the clean-up that turns its JSON into [`GeneratedQuestion`]s.

use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::models::{validate_questions, Difficulty, GeneratedQuestion, QuestionType, ValidationIssue, OPTION_COUNT};

pub const MAX_CONTEXT_CHARS: usize = 3000;
const PROMPT_CONTEXT_CHARS: usize = 6000;
const DEFAULT_EXPLANATION: &str = "Based on the provided context.";

static ANSWER_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-D])\b").expect("letter regex"));

const STATEMENT_OPTIONS: [&str; 4] = [
    "both statement i and statement ii are true",
    "statement i is true but statement ii is false",
    "statement i is false but statement ii is true",
    "both statement i and statement ii are false",
];

pub trait AiQuizClient: Send + Sync {
    fn generate_quiz_json(
        &self,
        context: &str,
        question_count: usize,
        difficulty: Difficulty,
    ) -> BoxFuture<'static, anyhow::Result<String>>;
}

#[derive(Clone)]
pub struct GeminiAiClient {
    pub http: reqwest::Client,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl GeminiAiClient {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        let base_url = std::env::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string());
        let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());
        let timeout_secs = std::env::var("GEMINI_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        Some(Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
            model,
            timeout_secs,
        })
    }
}

fn difficulty_guidance(difficulty: Difficulty) -> &'static str {
    match difficulty {
        Difficulty::Easy => {
            "EASY: test basic recall, use simple language, keep correct answers directly stated in the context."
        }
        Difficulty::Medium => {
            "MEDIUM: test comprehension and application, connect concepts, make distractors plausible but wrong."
        }
        Difficulty::Hard => {
            "HARD: test analysis and evaluation, use subtle distinctions, make distractors close to the correct answer."
        }
    }
}

pub fn build_prompt(context: &str, question_count: usize, difficulty: Difficulty) -> String {
    let context: String = context.chars().take(PROMPT_CONTEXT_CHARS).collect();
    format!(
        r#"CONTEXT: {context}

TASK: Generate EXACTLY {question_count} quiz questions based ONLY on the context above.
DIFFICULTY: {level}. {guidance}

Mix these question types: "MCQ", "TrueFalse", "FillInBlank" (sentence with _____),
"Statement" (two statements "Statement I: ... Statement II: ..." with the four standard relationship options).

Each question needs: question, type, options (exactly 4), answer (letter A-D, or "True"/"False"),
explanation referencing the context, difficulty "{level_lower}".

Return ONLY JSON of the form {{"questions": [{{"question": "...", "type": "MCQ", "options": ["...", "...", "...", "..."], "answer": "A", "explanation": "...", "difficulty": "{level_lower}"}}]}}"#,
        level = difficulty.as_str().to_uppercase(),
        level_lower = difficulty.as_str(),
        guidance = difficulty_guidance(difficulty),
    )
}

/// Removes a surrounding Markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        trimmed.to_string()
    }
}

impl AiQuizClient for GeminiAiClient {
    fn generate_quiz_json(
        &self,
        context: &str,
        question_count: usize,
        difficulty: Difficulty,
    ) -> BoxFuture<'static, anyhow::Result<String>> {
        let http = self.http.clone();
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let api_key = self.api_key.clone();
        let timeout = Duration::from_secs(self.timeout_secs);
        let prompt = build_prompt(context, question_count.max(1), difficulty);

        Box::pin(async move {
            let body = json!({
                "contents": [{ "parts": [{ "text": prompt }] }],
                "generationConfig": {
                    "temperature": 0.7,
                    "topP": 0.8,
                    "topK": 40,
                    "maxOutputTokens": 8192
                }
            });
            let response = http
                .post(&url)
                .header("x-goog-api-key", api_key)
                .timeout(timeout)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!("gemini returned {}: {}", status, text.trim());
            }

            let payload: Value = response.json().await?;
            let text = payload
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let cleaned = strip_code_fences(text);
            if cleaned.is_empty() {
                anyhow::bail!("gemini returned empty content");
            }
            Ok(cleaned)
        })
    }
}

#[derive(Debug, Error)]
pub enum AiPayloadError {
    #[error("ai result is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ai payload does not match schema")]
    Schema(Vec<ValidationIssue>),
    #[error("ai payload contained no usable questions")]
    NoQuestions,
}

/// Parses, schema-checks and normalizes a raw AI answer. Questions that
/// cannot be repaired are dropped; at most `limit` are kept.
pub fn parse_ai_questions(
    raw: &str,
    schema: &jsonschema::Validator,
    requested_difficulty: Difficulty,
    limit: usize,
) -> Result<Vec<GeneratedQuestion>, AiPayloadError> {
    let value: Value = serde_json::from_str(&strip_code_fences(raw))?;
    if schema.validate(&value).is_err() {
        let issues = schema
            .iter_errors(&value)
            .map(|e| ValidationIssue {
                field: e.instance_path.to_string(),
                issue: e.to_string(),
            })
            .collect();
        return Err(AiPayloadError::Schema(issues));
    }

    let items = value
        .get("questions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut questions = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match normalize_ai_question(item, requested_difficulty) {
            Some(q) if validate_questions(std::slice::from_ref(&q)).is_ok() => questions.push(q),
            _ => warn!("ai question {} filtered out during cleaning", i + 1),
        }
        if questions.len() >= limit {
            break;
        }
    }

    if questions.is_empty() {
        return Err(AiPayloadError::NoQuestions);
    }
    Ok(questions)
}

fn option_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => (if *b { "True" } else { "False" }).to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn parse_type(value: Option<&Value>) -> QuestionType {
    value
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn resolve_choice(answer: &Value, options: &[String]) -> Option<usize> {
    match answer {
        Value::Number(n) => n.as_u64().map(|i| i as usize).filter(|i| *i < OPTION_COUNT.min(options.len())),
        Value::String(s) => {
            let lowered = s.trim().to_lowercase();
            if let Some(idx) = options.iter().position(|o| o.to_lowercase() == lowered) {
                return Some(idx);
            }
            ANSWER_LETTER
                .captures(&s.to_uppercase())
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().chars().next())
                .map(|c| (c as u8 - b'A') as usize)
                .filter(|i| *i < options.len())
        }
        _ => None,
    }
}

fn resolve_true_false(answer: &Value) -> &'static str {
    let truthy = match answer {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "a" => Some(true),
            "false" | "f" | "no" | "n" | "b" => Some(false),
            _ => None,
        },
        _ => None,
    };
    match truthy {
        Some(true) => "True",
        Some(false) => "False",
        None => {
            warn!("could not parse TrueFalse answer {}, defaulting to False", answer);
            "False"
        }
    }
}

fn is_well_formed_statement(question: &str, options: &[String]) -> bool {
    if !question.contains("Statement I:") || !question.contains("Statement II:") {
        return false;
    }
    let lowered: Vec<String> = options.iter().map(|o| o.to_lowercase()).collect();
    let matches = STATEMENT_OPTIONS
        .iter()
        .filter(|expected| lowered.iter().any(|o| o.contains(*expected)))
        .count();
    matches >= 3
}

fn pad_options(options: &mut Vec<String>) {
    let mut n = options.len() + 1;
    while options.len() < OPTION_COUNT {
        let candidate = format!("Option {n}");
        if !options.iter().any(|o| o.eq_ignore_ascii_case(&candidate)) {
            options.push(candidate);
        }
        n += 1;
    }
}

/// Repairs one AI question. The answer is resolved to option text so every
/// stored question has its answer among its options.
pub fn normalize_ai_question(item: &Value, requested_difficulty: Difficulty) -> Option<GeneratedQuestion> {
    let question = item.get("question")?.as_str()?.trim().to_string();
    let answer_value = item.get("answer")?;
    item.get("type")?;
    if question.is_empty() {
        return None;
    }
    let raw_options: Vec<String> = item
        .get("options")?
        .as_array()?
        .iter()
        .filter_map(option_text)
        .collect();
    if raw_options.len() < 2 {
        return None;
    }

    let q_type = parse_type(item.get("type"));
    let answer = match q_type {
        QuestionType::TrueFalse => {
            let label = resolve_true_false(answer_value);
            raw_options
                .iter()
                .find(|o| o.eq_ignore_ascii_case(label))
                .cloned()
                .unwrap_or_else(|| label.to_string())
        }
        _ => {
            let idx = resolve_choice(answer_value, &raw_options).unwrap_or_else(|| {
                warn!("could not parse answer {}, defaulting to the first option", answer_value);
                0
            });
            raw_options[idx].clone()
        }
    };

    let mut options: Vec<String> = Vec::with_capacity(OPTION_COUNT);
    for option in raw_options {
        if !options.iter().any(|o| o.to_lowercase() == option.to_lowercase()) {
            options.push(option);
        }
    }
    if q_type == QuestionType::TrueFalse && !options.contains(&answer) {
        options = vec!["True".to_string(), "False".to_string()];
    }
    if !options.contains(&answer) {
        return None;
    }
    if options.len() > OPTION_COUNT {
        let slot = options
            .iter()
            .position(|o| *o == answer)
            .unwrap_or(0)
            .min(OPTION_COUNT - 1);
        let mut others = options.into_iter().filter(|o| *o != answer);
        options = (0..OPTION_COUNT)
            .filter_map(|i| if i == slot { Some(answer.clone()) } else { others.next() })
            .collect();
    }
    pad_options(&mut options);

    if q_type == QuestionType::Statement && !is_well_formed_statement(&question, &options) {
        warn!("statement question without the standard statement options dropped");
        return None;
    }

    let explanation = item
        .get("explanation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_EXPLANATION)
        .to_string();
    let difficulty = item
        .get("difficulty")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(requested_difficulty);

    Some(GeneratedQuestion {
        q_type,
        question,
        options,
        answer,
        explanation: Some(explanation),
        difficulty,
    })
}
