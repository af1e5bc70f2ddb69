use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use super::capitalize;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Za-z]+\b").expect("word regex"));

const TOP_WORDS: usize = 50;
const STOPWORDS: [&str; 7] = ["the", "and", "for", "with", "this", "that", "which"];

/// Topic keyword to related terms, checked in this order.
pub const TOPIC_LEXICON: &[(&str, &[&str])] = &[
    (
        "testing",
        &["development", "debugging", "quality assurance", "verification", "validation"],
    ),
    (
        "date",
        &["yesterday", "tomorrow", "next week", "last month", "next meeting"],
    ),
    (
        "developer",
        &["tester", "designer", "manager", "analyst", "architect"],
    ),
    (
        "white box",
        &["black box", "gray box", "unit testing", "integration testing", "system testing"],
    ),
];

/// Alphabetic words of `text` ordered by descending frequency; ties keep the
/// order in which the words first appear. Counting is case-sensitive.
pub fn ranked_words(text: &str) -> Vec<(&str, usize)> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, m) in WORD.find_iter(text).enumerate() {
        counts.entry(m.as_str()).or_insert((0, position)).0 += 1;
    }
    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first))| (word, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().map(|(word, count, _)| (word, count)).collect()
}

fn strip_trailing_punct(text: &str) -> &str {
    text.trim_end_matches(|c: char| ".,;:".contains(c)).trim()
}

/// Plausible wrong answers for `answer`, drawn from frequent words of
/// `source` and from [`TOPIC_LEXICON`]. Returns at most `count` strings, none
/// equal to the answer ignoring case, none equal to each other ignoring case.
pub fn generate_distractors(answer: &str, count: usize, source: &str) -> Vec<String> {
    let answer_text = answer.trim();
    if answer_text.is_empty() || count == 0 {
        return Vec::new();
    }
    let answer_lower = strip_trailing_punct(answer_text).to_lowercase();

    let mut candidates: Vec<String> = Vec::new();
    for (word, _) in ranked_words(source).into_iter().take(TOP_WORDS) {
        let lowered = word.to_lowercase();
        if lowered != answer_lower
            && word.chars().count() > 3
            && !STOPWORDS.contains(&lowered.as_str())
            && !candidates.iter().any(|c| c == word)
        {
            candidates.push(word.to_string());
            if candidates.len() >= count * 3 {
                break;
            }
        }
    }

    let cap = count * 4;
    for (topic, terms) in TOPIC_LEXICON {
        if candidates.len() >= cap {
            break;
        }
        let relevant = answer_lower.contains(*topic)
            || candidates.iter().any(|c| c.to_lowercase().contains(*topic));
        if !relevant {
            continue;
        }
        for term in terms.iter() {
            if candidates.len() >= cap {
                break;
            }
            if !candidates.iter().any(|c| c == term) {
                candidates.push(term.to_string());
            }
        }
    }

    let uppercase = answer_text.chars().next().is_some_and(char::is_uppercase);
    let mut out: Vec<String> = Vec::with_capacity(count);
    for candidate in candidates {
        let cleaned = strip_trailing_punct(&candidate);
        if cleaned.is_empty() || cleaned.to_lowercase() == answer_lower {
            continue;
        }
        let cased = if uppercase {
            capitalize(cleaned)
        } else {
            cleaned.to_lowercase()
        };
        let key = cased.to_lowercase();
        if out.iter().any(|o| o.to_lowercase() == key) {
            continue;
        }
        out.push(cased);
        if out.len() == count {
            break;
        }
    }
    out
}
