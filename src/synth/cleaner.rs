use once_cell::sync::Lazy;
use regex::Regex;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));

const MAX_WORDS: usize = 15;
const TRUNCATED_WORDS: usize = 12;
const REPEAT_WINDOW: usize = 4;

/// Turns noisy generator output into a single well-formed question.
///
/// Output is either empty (nothing question-like was left) or a single
/// capitalized sentence ending in exactly one `?`. Running it twice gives the
/// same result as running it once.
pub fn clean_question(raw: &str) -> String {
    let mut text = raw.to_string();
    loop {
        let stripped = TAG.replace_all(&text, " ").into_owned();
        if stripped == text {
            break;
        }
        text = stripped;
    }

    let words = collapse_repeats(text.split_whitespace().collect());
    let joined = words.join(" ");

    let first = match joined.find('?') {
        Some(idx) => &joined[..idx],
        None => joined.as_str(),
    };
    let body = trim_trailing_punctuation(first);
    if !body.chars().any(char::is_alphanumeric) {
        return String::new();
    }

    let mut question = capitalize_first(body);
    let words: Vec<&str> = question.split_whitespace().collect();
    if words.len() > MAX_WORDS {
        question = format!("{}...", words[..TRUNCATED_WORDS].join(" "));
    }
    question.push('?');
    question
}

/// Trims leading and trailing characters that are not letters or digits.
pub fn clean_answer(raw: &str) -> String {
    raw.trim_matches(|c: char| !c.is_alphanumeric()).to_string()
}

fn word_core(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Removes immediately repeated runs of up to four words, e.g.
/// "the the cat" or "what is what is it".
fn collapse_repeats(mut words: Vec<&str>) -> Vec<&str> {
    let mut changed = true;
    while changed {
        changed = false;
        'scan: for len in 1..=REPEAT_WINDOW {
            let mut i = 0;
            while i + 2 * len <= words.len() {
                let same = (0..len).all(|k| word_core(words[i + k]) == word_core(words[i + len + k]));
                if same {
                    words.drain(i + len..i + 2 * len);
                    changed = true;
                    break 'scan;
                }
                i += 1;
            }
        }
    }
    words
}

/// Drops trailing whitespace and `.,;:!`, keeping a literal ellipsis.
fn trim_trailing_punctuation(mut text: &str) -> &str {
    loop {
        text = text.trim_end();
        if text.ends_with("...") {
            return text;
        }
        match text.chars().last() {
            Some(c) if ".,;:!".contains(c) => text = &text[..text.len() - c.len_utf8()],
            _ => return text,
        }
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_separator_tags() {
        assert_eq!(clean_question("Who created <sep> Python?"), "Who created Python?");
        assert_eq!(clean_question("<pad> what is rust</s>"), "What is rust?");
    }

    #[test]
    fn keeps_only_first_question() {
        assert_eq!(
            clean_question("what is a borrow? what is a lifetime?"),
            "What is a borrow?"
        );
    }

    #[test]
    fn collapses_repeated_words() {
        assert_eq!(clean_question("What what is is the the heap?"), "What is the heap?");
        assert_eq!(clean_question("what is what is a trait"), "What is a trait?");
    }

    #[test]
    fn strips_trailing_punctuation_before_mark() {
        assert_eq!(clean_question("Where is the stack.;:"), "Where is the stack?");
    }

    #[test]
    fn truncates_long_questions() {
        let raw = "one two three four five six seven eight nine ten eleven twelve thirteen fourteen fifteen sixteen?";
        let cleaned = clean_question(raw);
        assert_eq!(
            cleaned,
            "One two three four five six seven eight nine ten eleven twelve...?"
        );
    }

    #[test]
    fn empty_when_nothing_left() {
        assert_eq!(clean_question(""), "");
        assert_eq!(clean_question("<sep>"), "");
        assert_eq!(clean_question("?? ..."), "");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let samples = [
            "Who created <sep> Python?",
            "what what is is going on. And then? more",
            "one two three four five six seven eight nine ten eleven twelve, thirteen fourteen fifteen sixteen",
            "<<a>b> nested tags here",
            "Is it,.",
            "trailing ellipsis ...",
            "¿qué es esto?",
            "a a a a a a",
        ];
        for raw in samples {
            let once = clean_question(raw);
            assert_eq!(clean_question(&once), once, "raw input: {raw:?}");
        }
    }

    #[test]
    fn answer_trim() {
        assert_eq!(clean_answer("  \"Guido van Rossum\". "), "Guido van Rossum");
        assert_eq!(clean_answer("..."), "");
    }
}
