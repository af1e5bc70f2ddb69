use std::collections::HashSet;

use thiserror::Error;

use super::{normalize_text, SynthConfig};

const BANNED_MARKERS: [&str; 3] = ["example:", "labels:", "step:"];
const TRIVIAL_ANSWERS: [&str; 4] = ["yes", "no", "true", "false"];

/// Why a candidate was dropped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Rejection {
    #[error("question does not end with '?'")]
    MissingQuestionMark,
    #[error("question has {0} words")]
    QuestionLength(usize),
    #[error("question contains more than one '?'")]
    MultipleQuestions,
    #[error("question contains generator marker {0:?}")]
    GeneratorMarker(&'static str),
    #[error("question duplicates an earlier one")]
    Duplicate,
    #[error("answer is empty")]
    EmptyAnswer,
    #[error("answer confidence {0:.2} below threshold")]
    LowConfidence(f32),
    #[error("answer has {0} words")]
    AnswerLength(usize),
    #[error("answer {0:?} is a yes/no token")]
    TrivialAnswer(String),
}

/// Checks candidates for one generation run and remembers accepted
/// questions so later duplicates are refused.
#[derive(Debug)]
pub struct QuestionValidator<'a> {
    config: &'a SynthConfig,
    seen: HashSet<String>,
}

impl<'a> QuestionValidator<'a> {
    pub fn new(config: &'a SynthConfig) -> Self {
        Self {
            config,
            seen: HashSet::new(),
        }
    }

    pub fn check(&self, question: &str) -> Result<(), Rejection> {
        if !question.ends_with('?') {
            return Err(Rejection::MissingQuestionMark);
        }
        let words = question.split_whitespace().count();
        if words < self.config.min_question_words || words > self.config.max_question_words {
            return Err(Rejection::QuestionLength(words));
        }
        if question.matches('?').count() > 2 {
            return Err(Rejection::MultipleQuestions);
        }
        let lowered = question.to_lowercase();
        if let Some(marker) = BANNED_MARKERS.iter().find(|m| lowered.contains(*m)) {
            return Err(Rejection::GeneratorMarker(marker));
        }
        if self.seen.contains(&normalize_text(question)) {
            return Err(Rejection::Duplicate);
        }
        Ok(())
    }

    pub fn validate(&self, question: &str) -> bool {
        self.check(question).is_ok()
    }

    /// Returns false if an equivalent question was already remembered.
    pub fn remember(&mut self, question: &str) -> bool {
        self.seen.insert(normalize_text(question))
    }

    pub fn accepted(&self) -> usize {
        self.seen.len()
    }
}

pub fn check_answer(answer: &str, confidence: f32, config: &SynthConfig) -> Result<(), Rejection> {
    if answer.trim().is_empty() {
        return Err(Rejection::EmptyAnswer);
    }
    if confidence < config.min_confidence {
        return Err(Rejection::LowConfidence(confidence));
    }
    let words = answer.split_whitespace().count();
    if words > config.max_answer_words {
        return Err(Rejection::AnswerLength(words));
    }
    let lowered = answer.trim().to_lowercase();
    if TRIVIAL_ANSWERS.contains(&lowered.as_str()) {
        return Err(Rejection::TrivialAnswer(lowered));
    }
    Ok(())
}

pub fn validate_answer(answer: &str, confidence: f32, config: &SynthConfig) -> bool {
    check_answer(answer, confidence, config).is_ok()
}
