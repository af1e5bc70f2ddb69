//! The two black-box steps of the pipeline: turning a passage into a raw
//! question and finding that question's answer in the source text.
//!
//! Any backend that implements [`QuestionSynthesizer`] and
//! [`AnswerExtractor`] can be plugged in. The rule-based pair in this module
//! is the default and needs no model files.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::RngCore;
use regex::Regex;
use thiserror::Error;

use super::chunker::split_sentences;
use super::cleaner::clean_answer;
use super::normalize_text;

static PASSIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<subject>.+?)\s+(?:was|were|is|are)\s+(?P<verb>[a-z]+ed)\s+by\s+(?P<agent>.+)$")
        .expect("passive regex")
});
static COPULA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<subject>[^,;:]+?)\s+(?P<verb>is|are|was|were)\s+(?P<rest>.+)$").expect("copula regex")
});

const PRONOUNS: [&str; 7] = ["it", "they", "he", "she", "this", "these", "that"];
const MAX_SUBJECT_WORDS: usize = 5;
const CLOZE_MIN_SENTENCE_WORDS: usize = 6;
const CLOZE_MIN_TERM_LEN: usize = 5;

const QUESTION_STOPWORDS: [&str; 24] = [
    "what", "who", "whom", "when", "where", "why", "how", "which", "is", "are", "was", "were", "the", "a",
    "an", "of", "to", "in", "on", "by", "for", "and", "does", "did",
];
const SPAN_STOPWORDS: [&str; 24] = [
    "the", "a", "an", "by", "of", "to", "in", "on", "it", "its", "was", "is", "are", "were", "and", "or",
    "as", "at", "for", "with", "this", "that", "they", "their",
];
const MAX_SPAN_WORDS: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("generation capability unavailable: {0}")]
    Unavailable(String),
    #[error("passage yields no question")]
    NoQuestion,
    #[error("capability failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedAnswer {
    pub text: String,
    /// Plausibility in `[0, 1]`.
    pub confidence: f32,
}

pub trait QuestionSynthesizer: Send + Sync {
    /// Raw, possibly noisy question text about `passage`.
    fn synthesize(&self, passage: &str, rng: &mut dyn RngCore) -> Result<String, CapabilityError>;
}

pub trait AnswerExtractor: Send + Sync {
    /// Best answer span for `question` found in `source`.
    fn extract(&self, question: &str, source: &str) -> Result<ExtractedAnswer, CapabilityError>;
}

/// The pair of backends a synthesizer runs with.
#[derive(Clone)]
pub struct Capabilities {
    pub synthesizer: Arc<dyn QuestionSynthesizer>,
    pub extractor: Arc<dyn AnswerExtractor>,
    available: bool,
}

impl Capabilities {
    pub fn new(synthesizer: Arc<dyn QuestionSynthesizer>, extractor: Arc<dyn AnswerExtractor>) -> Self {
        Self {
            synthesizer,
            extractor,
            available: true,
        }
    }

    pub fn rule_based() -> Self {
        Self::new(Arc::new(PatternQuestionSynthesizer), Arc::new(OverlapAnswerExtractor))
    }

    /// Backends that always fail, so every run ends in the fallback path.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        let backend = Arc::new(UnavailableBackend {
            reason: reason.into(),
        });
        Self {
            synthesizer: backend.clone(),
            extractor: backend,
            available: false,
        }
    }

    /// Builds the backend named by `kind` (`rule` or `none`).
    pub fn initialize(kind: &str) -> Result<Self, CapabilityError> {
        match kind.trim().to_lowercase().as_str() {
            "" | "rule" | "rules" => Ok(Self::rule_based()),
            "none" | "off" => Err(CapabilityError::Unavailable("disabled by configuration".into())),
            other => Err(CapabilityError::Unavailable(format!("unknown backend {other:?}"))),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }
}

struct UnavailableBackend {
    reason: String,
}

impl QuestionSynthesizer for UnavailableBackend {
    fn synthesize(&self, _passage: &str, _rng: &mut dyn RngCore) -> Result<String, CapabilityError> {
        Err(CapabilityError::Unavailable(self.reason.clone()))
    }
}

impl AnswerExtractor for UnavailableBackend {
    fn extract(&self, _question: &str, _source: &str) -> Result<ExtractedAnswer, CapabilityError> {
        Err(CapabilityError::Unavailable(self.reason.clone()))
    }
}

/// Builds questions from sentence shapes: passive ("X was made by Y"),
/// copular ("X is Y") and, failing those, a fill-in-the-term prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternQuestionSynthesizer;

fn lower_leading_article(subject: &str) -> String {
    for article in ["The ", "A ", "An "] {
        if let Some(rest) = subject.strip_prefix(article) {
            return format!("{}{}", article.to_lowercase(), rest);
        }
    }
    subject.to_string()
}

impl PatternQuestionSynthesizer {
    pub fn candidates(passage: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut last_subject: Option<String> = None;

        for sentence in split_sentences(passage) {
            let sentence = sentence.trim_end_matches(['.', '!', '?']).trim();
            let resolve = |subject: &str, last: &Option<String>| -> Option<String> {
                let subject = subject.trim();
                if PRONOUNS.contains(&subject.to_lowercase().as_str()) {
                    last.clone()
                } else if subject.split_whitespace().count() <= MAX_SUBJECT_WORDS {
                    Some(subject.to_string())
                } else {
                    None
                }
            };

            if let Some(caps) = PASSIVE.captures(sentence) {
                if let Some(subject) = resolve(&caps["subject"], &last_subject) {
                    out.push(format!(
                        "Who {} {}?",
                        caps["verb"].to_lowercase(),
                        lower_leading_article(&subject)
                    ));
                    last_subject = Some(subject);
                    continue;
                }
            }
            if let Some(caps) = COPULA.captures(sentence) {
                if let Some(subject) = resolve(&caps["subject"], &last_subject) {
                    out.push(format!(
                        "What {} {}?",
                        caps["verb"].to_lowercase(),
                        lower_leading_article(&subject)
                    ));
                    last_subject = Some(subject);
                    continue;
                }
            }

            let words: Vec<&str> = sentence.split_whitespace().collect();
            if words.len() < CLOZE_MIN_SENTENCE_WORDS {
                continue;
            }
            let term = words
                .iter()
                .enumerate()
                .filter(|(_, w)| w.chars().all(char::is_alphabetic) && w.chars().count() >= CLOZE_MIN_TERM_LEN)
                .max_by_key(|(i, w)| (w.chars().count(), std::cmp::Reverse(*i)));
            if let Some((idx, _)) = term {
                let blanked: Vec<&str> = words
                    .iter()
                    .enumerate()
                    .map(|(i, w)| if i == idx { "_____" } else { *w })
                    .collect();
                out.push(format!("Which term completes: {}?", blanked.join(" ")));
            }
        }
        out
    }
}

impl QuestionSynthesizer for PatternQuestionSynthesizer {
    fn synthesize(&self, passage: &str, rng: &mut dyn RngCore) -> Result<String, CapabilityError> {
        Self::candidates(passage)
            .choose(rng)
            .cloned()
            .ok_or(CapabilityError::NoQuestion)
    }
}

/// Finds the source sentence sharing the most content words with the
/// question and answers with the longest stretch of that sentence the
/// question does not already mention.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlapAnswerExtractor;

fn core(word: &str) -> String {
    normalize_text(word)
}

fn answer_span(sentence: &str, question_words: &HashSet<String>) -> String {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    let mut runs: Vec<&[&str]> = Vec::new();
    let mut start = None;
    for (i, w) in words.iter().enumerate() {
        let in_question = question_words.contains(&core(w));
        match (in_question, start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                runs.push(&words[s..i]);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(&words[s..]);
    }

    let trimmed: Vec<&[&str]> = runs
        .into_iter()
        .map(|run| {
            let is_stop = |w: &&str| SPAN_STOPWORDS.contains(&core(w).as_str()) || core(w).is_empty();
            let begin = run.iter().position(|w| !is_stop(w)).unwrap_or(run.len());
            let end = run.iter().rposition(|w| !is_stop(w)).map_or(begin, |p| p + 1);
            &run[begin..end.max(begin)]
        })
        .filter(|run| !run.is_empty())
        .collect();

    let best = trimmed
        .iter()
        .enumerate()
        .filter(|(_, run)| run.len() <= MAX_SPAN_WORDS)
        .max_by_key(|(i, run)| (run.len(), std::cmp::Reverse(*i)))
        .map(|(_, run)| *run)
        .or_else(|| trimmed.first().map(|run| &run[..MAX_SPAN_WORDS.min(run.len())]));

    best.map(|run| clean_answer(&run.join(" "))).unwrap_or_default()
}

impl AnswerExtractor for OverlapAnswerExtractor {
    fn extract(&self, question: &str, source: &str) -> Result<ExtractedAnswer, CapabilityError> {
        let normalized = normalize_text(question);
        let question_words: HashSet<String> = normalized.split(' ').map(str::to_string).collect();
        let content: HashSet<&str> = normalized
            .split(' ')
            .filter(|w| !w.is_empty() && !QUESTION_STOPWORDS.contains(w))
            .collect();
        let asks_who = normalized.starts_with("who");

        let mut best = ExtractedAnswer {
            text: String::new(),
            confidence: 0.0,
        };
        for sentence in split_sentences(source) {
            let sentence_words: HashSet<String> = normalize_text(sentence).split(' ').map(str::to_string).collect();
            let overlap = if content.is_empty() {
                0.0
            } else {
                content.iter().filter(|w| sentence_words.contains(**w)).count() as f32 / content.len() as f32
            };
            let span = answer_span(sentence, &question_words);
            if span.is_empty() {
                continue;
            }
            let proper = span.chars().next().is_some_and(char::is_uppercase);
            let bonus = match (asks_who, proper) {
                (true, true) => 1.0,
                (true, false) => 0.0,
                (false, _) => 0.5,
            };
            let score = (0.7 * overlap + 0.3 * bonus).clamp(0.0, 1.0);
            if score > best.confidence {
                best = ExtractedAnswer {
                    text: span,
                    confidence: score,
                };
            }
        }
        Ok(best)
    }
}
