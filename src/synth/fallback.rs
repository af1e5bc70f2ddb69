use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::capitalize;
use crate::models::GeneratedQuestion;

static LOWER_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-z]+\b").expect("word regex"));

const STOPWORDS: [&str; 8] = ["the", "and", "for", "with", "this", "that", "which", "what"];
const KEY_TERM_LIMIT: usize = 8;

const TEMPLATES: [&str; 4] = [
    "What is the significance of {term}?",
    "How does {term} contribute?",
    "What role does {term} play?",
    "Why is {term} important?",
];

pub const CONTENT_OPTIONS: [&str; 4] = [
    "Key element discussed",
    "Important role",
    "Central to topic",
    "Provides context",
];

pub const GENERIC_QUESTION: &str = "What is the main topic discussed?";
pub const GENERIC_OPTIONS: [&str; 4] = [
    "The subject matter",
    "Unrelated concepts",
    "General information",
    "Various topics",
];

/// Most frequent lowercase words of four or more letters, excluding
/// stopwords. Equal counts keep first-occurrence order.
pub fn key_terms(source: &str) -> Vec<String> {
    let lowered = source.to_lowercase();
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, m) in LOWER_WORD.find_iter(&lowered).enumerate() {
        let word = m.as_str();
        if word.len() > 3 && !STOPWORDS.contains(&word) {
            counts.entry(word).or_insert((0, position)).0 += 1;
        }
    }
    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked
        .into_iter()
        .take(KEY_TERM_LIMIT)
        .map(|(word, _)| word.to_string())
        .collect()
}

/// Template questions about the key terms of `source`, or `None` when the
/// text has no usable term. Term and template advance together so the first
/// `terms * templates` questions are all distinct.
pub fn content_based_fallback(source: &str, count: usize) -> Option<Vec<GeneratedQuestion>> {
    let terms = key_terms(source);
    if terms.is_empty() {
        return None;
    }
    let questions = (0..count)
        .map(|i| {
            let term = capitalize(&terms[i % terms.len()]);
            let template = TEMPLATES[(i / terms.len()) % TEMPLATES.len()];
            GeneratedQuestion::multiple_choice(
                template.replace("{term}", &term),
                CONTENT_OPTIONS.iter().map(|o| o.to_string()).collect(),
                CONTENT_OPTIONS[0].to_string(),
            )
        })
        .collect();
    Some(questions)
}

pub fn generic_fallback(count: usize) -> Vec<GeneratedQuestion> {
    (0..count)
        .map(|_| {
            GeneratedQuestion::multiple_choice(
                GENERIC_QUESTION.to_string(),
                GENERIC_OPTIONS.iter().map(|o| o.to_string()).collect(),
                GENERIC_OPTIONS[0].to_string(),
            )
        })
        .collect()
}
