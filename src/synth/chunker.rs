use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::SynthConfig;

static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").expect("paragraph regex"));
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").expect("sentence regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Paragraph,
    Sentence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub kind: ChunkKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("source text has no passage long enough to question")]
pub struct NoUsableContent;

/// Splits `text` after every `.`, `!` or `?` that is followed by whitespace.
/// The punctuation stays with its sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        let end = m.start() + 1;
        let piece = text[start..end].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        start = m.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Paragraph chunks first; sentence chunks with a lower bar when no
/// paragraph is long enough.
pub fn chunk(text: &str, config: &SynthConfig) -> Result<Vec<Chunk>, NoUsableContent> {
    let paragraphs: Vec<Chunk> = PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| p.split_whitespace().count() > config.paragraph_min_words)
        .map(|p| Chunk {
            text: p.to_string(),
            kind: ChunkKind::Paragraph,
        })
        .collect();
    if !paragraphs.is_empty() {
        return Ok(paragraphs);
    }

    let sentences: Vec<Chunk> = split_sentences(text)
        .into_iter()
        .filter(|s| s.split_whitespace().count() > config.sentence_min_words)
        .map(|s| Chunk {
            text: s.to_string(),
            kind: ChunkKind::Sentence,
        })
        .collect();
    if sentences.is_empty() {
        Err(NoUsableContent)
    } else {
        Ok(sentences)
    }
}
