//! Progress, history and admin analytics computed from stored attempts.
//! Retakes overwrite nothing here: every function looks only at the latest
//! attempt per quiz (highest attempt id) unless it counts raw activity.

use crate::models::{Difficulty, QuestionType};
use crate::state::{AttemptRecord, QuizRecord, User};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const QUIZZES_GOAL: usize = 20;
const SCORE_HISTORY_LEN: usize = 10;
const ACTIVE_WINDOW_DAYS: i64 = 30;
const ACTIVITY_WINDOW_DAYS: i64 = 7;
const ADMIN_LIST_LEN: usize = 10;
pub const ADMIN_PAGE_SIZE: usize = 20;

const ALL_TYPES: [QuestionType; 4] = [
    QuestionType::Mcq,
    QuestionType::TrueFalse,
    QuestionType::FillInBlank,
    QuestionType::Statement,
];
const ALL_DIFFICULTIES: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

/// Latest attempt of `user_id` for each quiz, in ascending id order.
pub fn latest_per_quiz(attempts: &[AttemptRecord], user_id: i64) -> Vec<&AttemptRecord> {
    let mut latest: HashMap<i64, &AttemptRecord> = HashMap::new();
    for attempt in attempts.iter().filter(|a| a.user_id == user_id) {
        let slot = latest.entry(attempt.quiz_id).or_insert(attempt);
        if attempt.id > slot.id {
            *slot = attempt;
        }
    }
    let mut out: Vec<_> = latest.into_values().collect();
    out.sort_by_key(|a| a.id);
    out
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn accuracy(correct: usize, total: usize) -> u32 {
    if total == 0 {
        0
    } else {
        (correct as f64 * 100.0 / total as f64).round() as u32
    }
}

fn window(now: DateTime<Utc>, days: i64) -> Vec<NaiveDate> {
    let today = now.date_naive();
    (0..days).rev().map(|i| today - Duration::days(i)).collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Achievements {
    pub first_quiz: bool,
    pub quiz_master: bool,
    pub perfect_score: bool,
    pub streak_7: bool,
    pub streak_30: bool,
    pub quick_learner: bool,
    pub prolific_creator: bool,
    pub difficulty_master: bool,
    pub earned: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DayCount {
    pub date: NaiveDate,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserProgress {
    pub quizzes_completed: usize,
    pub average_score: f64,
    pub quizzes_created: usize,
    pub total_time_minutes: u64,
    pub quizzes_goal: usize,
    pub progress_percentage: u32,
    pub active_days: usize,
    pub score_history: Vec<f64>,
    pub last_7_days: Vec<DayCount>,
    pub question_types: BTreeMap<&'static str, u32>,
    pub difficulty: BTreeMap<&'static str, u32>,
    pub achievements: Achievements,
}

pub fn user_progress(
    user_id: i64,
    attempts: &[AttemptRecord],
    quizzes: &[QuizRecord],
    now: DateTime<Utc>,
) -> UserProgress {
    let by_id: HashMap<i64, &QuizRecord> = quizzes.iter().map(|q| (q.id, q)).collect();
    let latest = latest_per_quiz(attempts, user_id);

    let quizzes_completed = latest.len();
    let average_score = round1(mean(latest.iter().map(|a| a.percentage())));
    let quizzes_created = quizzes.iter().filter(|q| q.owner_id == user_id).count();
    let total_time_minutes = latest.iter().map(|a| a.time_spent).sum::<u64>() / 60;
    let progress_percentage =
        ((quizzes_completed as f64 / QUIZZES_GOAL as f64) * 100.0).round().min(100.0) as u32;

    let own: Vec<&AttemptRecord> = attempts.iter().filter(|a| a.user_id == user_id).collect();
    let since = now - Duration::days(ACTIVE_WINDOW_DAYS);
    let active_days = own
        .iter()
        .filter(|a| a.completed_at >= since)
        .map(|a| a.completed_at.date_naive())
        .collect::<HashSet<_>>()
        .len();

    let mut chronological = latest.clone();
    chronological.sort_by_key(|a| (a.completed_at, a.id));
    let skip = chronological.len().saturating_sub(SCORE_HISTORY_LEN);
    let score_history = chronological
        .iter()
        .skip(skip)
        .map(|a| round1(a.percentage()))
        .collect();

    let last_7_days = window(now, ACTIVITY_WINDOW_DAYS)
        .into_iter()
        .map(|date| DayCount {
            date,
            count: own
                .iter()
                .filter(|a| a.completed_at.date_naive() == date)
                .map(|a| a.quiz_id)
                .collect::<HashSet<_>>()
                .len(),
        })
        .collect();

    let mut by_type: HashMap<QuestionType, (usize, usize)> = HashMap::new();
    let mut by_difficulty: HashMap<Difficulty, (usize, usize)> = HashMap::new();
    let mut hard_attempted = false;
    for attempt in &latest {
        let Some(quiz) = by_id.get(&attempt.quiz_id) else {
            continue;
        };
        hard_attempted |= quiz.difficulty == Difficulty::Hard;
        for (question, submitted) in quiz.questions.iter().zip(&attempt.answers) {
            let hit = question.is_correct(submitted) as usize;
            let t = by_type.entry(question.q_type).or_default();
            t.0 += hit;
            t.1 += 1;
            let d = by_difficulty.entry(question.difficulty).or_default();
            d.0 += hit;
            d.1 += 1;
        }
    }
    let question_types = ALL_TYPES
        .iter()
        .map(|t| {
            let (c, n) = by_type.get(t).copied().unwrap_or_default();
            (t.as_str(), accuracy(c, n))
        })
        .collect();
    let difficulty = ALL_DIFFICULTIES
        .iter()
        .map(|d| {
            let (c, n) = by_difficulty.get(d).copied().unwrap_or_default();
            (d.as_str(), accuracy(c, n))
        })
        .collect();

    let flags = [
        quizzes_completed >= 1,
        quizzes_completed >= 10,
        latest.iter().any(|a| a.total_questions > 0 && a.score == a.total_questions),
        active_days >= 7,
        active_days >= 30,
        average_score >= 80.0,
        quizzes_created >= 5,
        hard_attempted,
    ];
    let achievements = Achievements {
        first_quiz: flags[0],
        quiz_master: flags[1],
        perfect_score: flags[2],
        streak_7: flags[3],
        streak_30: flags[4],
        quick_learner: flags[5],
        prolific_creator: flags[6],
        difficulty_master: flags[7],
        earned: flags.iter().filter(|f| **f).count(),
        total: flags.len(),
    };

    UserProgress {
        quizzes_completed,
        average_score,
        quizzes_created,
        total_time_minutes,
        quizzes_goal: QUIZZES_GOAL,
        progress_percentage,
        active_days,
        score_history,
        last_7_days,
        question_types,
        difficulty,
        achievements,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub attempt_id: i64,
    pub quiz_id: i64,
    pub title: String,
    pub difficulty: Difficulty,
    pub score: usize,
    pub total_questions: usize,
    pub percentage: f64,
    pub time_spent: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub items: Vec<HistoryEntry>,
    pub total: usize,
    pub average_score: f64,
}

pub fn history(user_id: i64, attempts: &[AttemptRecord], quizzes: &[QuizRecord]) -> History {
    let by_id: HashMap<i64, &QuizRecord> = quizzes.iter().map(|q| (q.id, q)).collect();
    let mut items: Vec<HistoryEntry> = latest_per_quiz(attempts, user_id)
        .into_iter()
        .map(|a| {
            let quiz = by_id.get(&a.quiz_id);
            HistoryEntry {
                attempt_id: a.id,
                quiz_id: a.quiz_id,
                title: quiz.map(|q| q.title.clone()).unwrap_or_else(|| "Deleted quiz".to_string()),
                difficulty: quiz.map(|q| q.difficulty).unwrap_or_default(),
                score: a.score,
                total_questions: a.total_questions,
                percentage: round1(a.percentage()),
                time_spent: a.time_spent,
                completed_at: a.completed_at,
            }
        })
        .collect();
    items.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then(b.attempt_id.cmp(&a.attempt_id)));
    let average_score = round1(mean(items.iter().map(|i| i.percentage)));
    History {
        total: items.len(),
        items,
        average_score,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AdminTotals {
    pub total_users: usize,
    pub total_quizzes: usize,
    pub total_attempts: usize,
    pub active_today: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentAttempt {
    pub username: String,
    pub title: String,
    pub score: usize,
    pub total_questions: usize,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopularQuiz {
    pub quiz_id: i64,
    pub title: String,
    pub attempt_count: usize,
    pub average_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DifficultyUsage {
    pub difficulty: Difficulty,
    pub count: usize,
    pub average_context_length: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DailyActivity {
    pub date: NaiveDate,
    pub attempts: usize,
    pub active_users: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminOverview {
    pub totals: AdminTotals,
    pub recent_activity: Vec<RecentAttempt>,
    pub popular_quizzes: Vec<PopularQuiz>,
    pub difficulty_usage: Vec<DifficultyUsage>,
    pub daily_activity: Vec<DailyActivity>,
}

pub fn admin_overview(
    users: &[User],
    quizzes: &[QuizRecord],
    attempts: &[AttemptRecord],
    now: DateTime<Utc>,
) -> AdminOverview {
    let learners: HashMap<i64, &User> = users
        .iter()
        .filter(|u| !u.is_admin())
        .map(|u| (u.id, u))
        .collect();
    let quiz_by_id: HashMap<i64, &QuizRecord> = quizzes.iter().map(|q| (q.id, q)).collect();
    let learner_attempts: Vec<&AttemptRecord> = attempts
        .iter()
        .filter(|a| learners.contains_key(&a.user_id))
        .collect();
    let today = now.date_naive();

    let totals = AdminTotals {
        total_users: learners.len(),
        total_quizzes: quizzes.len(),
        total_attempts: attempts.len(),
        active_today: learner_attempts
            .iter()
            .filter(|a| a.completed_at.date_naive() == today)
            .map(|a| a.user_id)
            .collect::<HashSet<_>>()
            .len(),
    };

    let mut recent = learner_attempts.clone();
    recent.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then(b.id.cmp(&a.id)));
    let recent_activity = recent
        .iter()
        .filter_map(|a| {
            let quiz = quiz_by_id.get(&a.quiz_id)?;
            let user = learners.get(&a.user_id)?;
            Some(RecentAttempt {
                username: user.username.clone(),
                title: quiz.title.clone(),
                score: a.score,
                total_questions: a.total_questions,
                completed_at: a.completed_at,
            })
        })
        .take(ADMIN_LIST_LEN)
        .collect();

    let mut per_quiz: HashMap<i64, Vec<f64>> = HashMap::new();
    for a in &learner_attempts {
        if quiz_by_id.contains_key(&a.quiz_id) {
            per_quiz.entry(a.quiz_id).or_default().push(a.percentage());
        }
    }
    let mut popular_quizzes: Vec<PopularQuiz> = per_quiz
        .into_iter()
        .filter_map(|(quiz_id, scores)| {
            let quiz = quiz_by_id.get(&quiz_id)?;
            Some(PopularQuiz {
                quiz_id,
                title: quiz.title.clone(),
                attempt_count: scores.len(),
                average_score: round1(mean(scores.into_iter())),
            })
        })
        .collect();
    popular_quizzes.sort_by(|a, b| b.attempt_count.cmp(&a.attempt_count).then(a.quiz_id.cmp(&b.quiz_id)));
    popular_quizzes.truncate(ADMIN_LIST_LEN);

    let difficulty_usage = ALL_DIFFICULTIES
        .iter()
        .filter_map(|d| {
            let lengths: Vec<f64> = quizzes
                .iter()
                .filter(|q| q.difficulty == *d)
                .map(|q| q.context.chars().count() as f64)
                .collect();
            (!lengths.is_empty()).then(|| DifficultyUsage {
                difficulty: *d,
                count: lengths.len(),
                average_context_length: round1(mean(lengths.into_iter())),
            })
        })
        .collect();

    let daily_activity = window(now, ACTIVITY_WINDOW_DAYS)
        .into_iter()
        .map(|date| {
            let day: Vec<&&AttemptRecord> = learner_attempts
                .iter()
                .filter(|a| a.completed_at.date_naive() == date)
                .collect();
            DailyActivity {
                date,
                attempts: day.len(),
                active_users: day.iter().map(|a| a.user_id).collect::<HashSet<_>>().len(),
            }
        })
        .collect();

    AdminOverview {
        totals,
        recent_activity,
        popular_quizzes,
        difficulty_usage,
        daily_activity,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total: usize,
}

/// One-based paging; page 0 is read as page 1.
fn paginate<T>(rows: Vec<T>, page: usize) -> Page<T> {
    let page = page.max(1);
    let total = rows.len();
    let items = rows
        .into_iter()
        .skip((page - 1).saturating_mul(ADMIN_PAGE_SIZE))
        .take(ADMIN_PAGE_SIZE)
        .collect();
    Page {
        items,
        page,
        total_pages: total.div_ceil(ADMIN_PAGE_SIZE),
        total,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminUserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub quizzes_created: usize,
    pub quizzes_taken: usize,
    pub average_score: f64,
    pub last_active: Option<DateTime<Utc>>,
}

/// Non-admin accounts, newest first. Counts every stored attempt.
pub fn admin_users(users: &[User], quizzes: &[QuizRecord], attempts: &[AttemptRecord], page: usize) -> Page<AdminUserRow> {
    let mut rows: Vec<AdminUserRow> = users
        .iter()
        .filter(|u| !u.is_admin())
        .map(|u| {
            let own: Vec<&AttemptRecord> = attempts.iter().filter(|a| a.user_id == u.id).collect();
            AdminUserRow {
                id: u.id,
                username: u.username.clone(),
                email: u.email.clone(),
                created_at: u.created_at,
                quizzes_created: quizzes.iter().filter(|q| q.owner_id == u.id).count(),
                quizzes_taken: own.len(),
                average_score: round1(mean(own.iter().map(|a| a.percentage()))),
                last_active: own.iter().map(|a| a.completed_at).max(),
            }
        })
        .collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    paginate(rows, page)
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminQuizRow {
    pub quiz_id: i64,
    pub title: String,
    pub owner: String,
    pub difficulty: Difficulty,
    pub source: String,
    pub question_count: usize,
    pub attempt_count: usize,
    pub average_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Quizzes owned by non-admin accounts, newest first.
pub fn admin_quizzes(users: &[User], quizzes: &[QuizRecord], attempts: &[AttemptRecord], page: usize) -> Page<AdminQuizRow> {
    let owners: HashMap<i64, &User> = users
        .iter()
        .filter(|u| !u.is_admin())
        .map(|u| (u.id, u))
        .collect();
    let mut rows: Vec<AdminQuizRow> = quizzes
        .iter()
        .filter_map(|q| {
            let owner = owners.get(&q.owner_id)?;
            let scores: Vec<f64> = attempts
                .iter()
                .filter(|a| a.quiz_id == q.id)
                .map(|a| a.percentage())
                .collect();
            Some(AdminQuizRow {
                quiz_id: q.id,
                title: q.title.clone(),
                owner: owner.username.clone(),
                difficulty: q.difficulty,
                source: q.source.clone(),
                question_count: q.questions.len(),
                attempt_count: scores.len(),
                average_score: (!scores.is_empty()).then(|| round1(mean(scores.into_iter()))),
                created_at: q.created_at,
            })
        })
        .collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.quiz_id.cmp(&a.quiz_id)));
    paginate(rows, page)
}
