//! Heuristic quiz synthesizer.
//!
//! Turns a block of study text into multiple-choice questions without a
//! remote model. The stages run in order: [`chunker`] splits the text,
//! [`capability`] produces raw questions and answers, [`cleaner`] and
//! [`validator`] filter them, [`distractors`] builds wrong options and
//! [`assembler`] puts it all together, dropping to [`fallback`] when nothing
//! survives.

pub mod assembler;
pub mod capability;
pub mod chunker;
pub mod cleaner;
pub mod distractors;
pub mod fallback;
pub mod validator;

pub use assembler::{AttemptStats, GenerationOutcome, GenerationSource, Synthesizer};
pub use capability::{
    AnswerExtractor, Capabilities, CapabilityError, ExtractedAnswer, OverlapAnswerExtractor,
    PatternQuestionSynthesizer, QuestionSynthesizer,
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("source text is empty")]
    EmptySource,
    #[error("requested question count must be between 1 and {max}, got {requested}")]
    InvalidCount { requested: usize, max: usize },
}

/// Tunables for one synthesizer instance.
#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub paragraph_min_words: usize,
    pub sentence_min_words: usize,
    pub attempt_multiplier: usize,
    pub min_confidence: f32,
    pub min_question_words: usize,
    pub max_question_words: usize,
    pub max_answer_words: usize,
    pub distractor_count: usize,
    pub max_requested: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            paragraph_min_words: 10,
            sentence_min_words: 8,
            attempt_multiplier: 5,
            min_confidence: 0.1,
            // Three, not four: short who/what questions such as "Who created Python?" must pass.
            min_question_words: 3,
            max_question_words: 20,
            max_answer_words: 8,
            distractor_count: 3,
            max_requested: 50,
        }
    }
}

/// Lowercases and strips everything but letters and digits, collapsing the
/// rest to single spaces. Two questions are duplicates when this matches.
pub fn normalize_text(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Python-style capitalize: first char upper, rest lower.
pub(crate) fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
