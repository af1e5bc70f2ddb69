use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const OPTION_COUNT: usize = 4;
const OPTION_LETTERS: [char; OPTION_COUNT] = ['A', 'B', 'C', 'D'];
const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum QuestionType {
    #[default]
    #[serde(rename = "MCQ")]
    Mcq,
    TrueFalse,
    FillInBlank,
    Statement,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Mcq => "MCQ",
            QuestionType::TrueFalse => "TrueFalse",
            QuestionType::FillInBlank => "FillInBlank",
            QuestionType::Statement => "Statement",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

/// One finished question as shown to the user and stored with its quiz.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedQuestion {
    #[serde(rename = "type", default)]
    pub q_type: QuestionType,
    pub question: String,
    pub options: Vec<String>,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
}

impl GeneratedQuestion {
    pub fn multiple_choice(question: String, options: Vec<String>, answer: String) -> Self {
        Self {
            q_type: QuestionType::Mcq,
            question,
            options,
            answer,
            explanation: None,
            difficulty: Difficulty::default(),
        }
    }

    pub fn correct_index(&self) -> Option<usize> {
        self.options.iter().position(|o| *o == self.answer)
    }

    /// A submission is correct when it is the answer text (ignoring case and
    /// surrounding space) or the letter/index of the correct option. Text of
    /// any other option always scores wrong, even when it looks like an index.
    pub fn is_correct(&self, submitted: &str) -> bool {
        let submitted = submitted.trim().to_lowercase();
        if submitted.is_empty() {
            return false;
        }
        if submitted == self.answer.trim().to_lowercase() {
            return true;
        }
        if self.options.iter().any(|o| o.trim().to_lowercase() == submitted) {
            return false;
        }
        let Some(correct) = self.correct_index() else {
            return false;
        };
        let mut chars = submitted.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            let upper = c.to_ascii_uppercase();
            if let Some(idx) = OPTION_LETTERS.iter().position(|l| *l == upper) {
                return idx == correct;
            }
        }
        submitted.parse::<usize>().map(|idx| idx == correct).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub field: String,
    pub issue: String,
}

/// Structural checks every stored question must pass: non-empty text,
/// exactly four distinct options, answer present exactly once.
pub fn validate_questions(questions: &[GeneratedQuestion]) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    if questions.is_empty() {
        issues.push(ValidationIssue {
            field: "questions".into(),
            issue: "must contain at least one question".into(),
        });
    }

    for (i, q) in questions.iter().enumerate() {
        if q.question.trim().is_empty() {
            issues.push(ValidationIssue {
                field: format!("questions[{i}].question"),
                issue: "must not be empty".into(),
            });
        }
        if q.options.len() != OPTION_COUNT {
            issues.push(ValidationIssue {
                field: format!("questions[{i}].options"),
                issue: format!("must contain exactly {OPTION_COUNT} options"),
            });
        }
        let mut seen = HashSet::new();
        for (j, opt) in q.options.iter().enumerate() {
            if opt.trim().is_empty() {
                issues.push(ValidationIssue {
                    field: format!("questions[{i}].options[{j}]"),
                    issue: "must not be empty".into(),
                });
            }
            if !seen.insert(opt.to_lowercase()) {
                issues.push(ValidationIssue {
                    field: format!("questions[{i}].options[{j}]"),
                    issue: "must be unique".into(),
                });
            }
        }
        let hits = q.options.iter().filter(|o| **o == q.answer).count();
        if hits != 1 {
            issues.push(ValidationIssue {
                field: format!("questions[{i}].answer"),
                issue: "must match exactly one option".into(),
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Per-question correctness of `submitted`; missing answers count as wrong.
pub fn score_answers(questions: &[GeneratedQuestion], submitted: &[String]) -> Vec<bool> {
    questions
        .iter()
        .enumerate()
        .map(|(i, q)| submitted.get(i).map(|s| q.is_correct(s)).unwrap_or(false))
        .collect()
}

/// Quiz title: the user's own title if given, else the first substantial
/// sentence of the material, else its first words.
pub fn derive_quiz_title(context: &str, custom: Option<&str>) -> String {
    if let Some(custom) = custom.map(str::trim).filter(|t| !t.is_empty()) {
        if custom.chars().count() > TITLE_MAX_CHARS {
            let cut: String = custom.chars().take(TITLE_MAX_CHARS - 3).collect();
            return format!("{cut}...");
        }
        return custom.to_string();
    }

    let context = context.trim();
    if context.is_empty() {
        return "Generated Quiz".to_string();
    }

    for sentence in context.split(['.', '!', '?']) {
        let sentence = sentence.trim();
        if sentence.chars().count() > 20 && sentence.split_whitespace().count() >= 3 {
            let title: String = sentence.chars().take(TITLE_MAX_CHARS).collect();
            let title = title.trim_end().to_string();
            if title.ends_with(['.', '!', '?']) {
                return title;
            }
            return format!("{title}...");
        }
    }

    let words: Vec<&str> = context.split_whitespace().take(4).collect();
    if words.is_empty() {
        return "Study Material Quiz".to_string();
    }
    format!("{}...", words.join(" "))
}
