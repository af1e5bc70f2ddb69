use crate::ai::{parse_ai_questions, AiQuizClient, MAX_CONTEXT_CHARS};
use crate::error::{AppError, ErrorDetail};
use crate::models::{derive_quiz_title, score_answers, validate_questions, Difficulty, GeneratedQuestion, QuestionType};
use crate::state::{
    hash_password, AccountConflict, AppState, AttemptRecord, LoginSession, NewQuiz, QuizSessionState, Role, User,
};
use crate::stats::{self, AdminOverview, AdminQuizRow, AdminUserRow, History, Page, UserProgress};
use crate::synth::GenerationError;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use validator::Validate;

const SESSION_COOKIE: &str = "session";
const CSRF_COOKIE: &str = "csrf_token";
const PASSWORD_SPECIALS: &str = "!@#$%^&*(),.?\":{}|<>";
const RATE_WINDOW: Duration = Duration::from_secs(60);
static RATE_LIMIT: Lazy<DashMap<String, (u32, Instant)>> = Lazy::new(DashMap::new);

fn check_rate_limit(scope: &str, key: &str, limit_per_minute: u32) -> bool {
    let now = Instant::now();
    RATE_LIMIT.retain(|_, (_, started)| now.duration_since(*started) <= RATE_WINDOW);
    let full_key = format!("{scope}:{key}");
    if let Some(mut entry) = RATE_LIMIT.get_mut(&full_key) {
        if now.duration_since(entry.1) > RATE_WINDOW {
            *entry = (1, now);
            true
        } else if entry.0 >= limit_per_minute {
            false
        } else {
            entry.0 += 1;
            true
        }
    } else {
        RATE_LIMIT.insert(full_key, (1, now));
        true
    }
}

fn rate_limited(scope: &str, headers: &HeaderMap, limit_per_minute: u32, req_id: &str) -> Result<(), AppError> {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local");
    if check_rate_limit(scope, ip, limit_per_minute) {
        Ok(())
    } else {
        Err(AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "too many requests",
            req_id,
        ))
    }
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn session_id(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE).map(|c| c.value().to_string())
}

async fn auth_session(jar: &CookieJar, state: &AppState) -> Option<(String, LoginSession)> {
    let sid = session_id(jar)?;
    let sessions = state.db.sessions.read().await;
    sessions.get(&sid).cloned().map(|s| (sid, s))
}

async fn auth_user_id(jar: &CookieJar, state: &AppState, req_id: &str) -> Result<i64, AppError> {
    auth_session(jar, state)
        .await
        .map(|(_, s)| s.user_id)
        .ok_or_else(|| AppError::unauthorized(req_id))
}

async fn ensure_csrf(headers: &HeaderMap, jar: &CookieJar, state: &AppState, req_id: &str) -> Result<(), AppError> {
    let valid = match (
        session_id(jar),
        headers.get("x-csrf-token").and_then(|h| h.to_str().ok()),
    ) {
        (Some(sid), Some(header)) => state
            .db
            .sessions
            .read()
            .await
            .get(&sid)
            .map(|s| s.csrf_token == header)
            .unwrap_or(false),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AppError::new(StatusCode::FORBIDDEN, "FORBIDDEN", "csrf token invalid", req_id))
    }
}

async fn require_admin(jar: &CookieJar, state: &AppState, req_id: &str) -> Result<i64, AppError> {
    let user_id = auth_user_id(jar, state, req_id).await?;
    let is_admin = state
        .db
        .users
        .read()
        .await
        .get(&user_id)
        .is_some_and(User::is_admin);
    if is_admin {
        Ok(user_id)
    } else {
        Err(AppError::new(StatusCode::FORBIDDEN, "FORBIDDEN", "admin access required", req_id))
    }
}

fn conflict(err: AccountConflict, req_id: &str) -> AppError {
    AppError::new(StatusCode::CONFLICT, "CONFLICT", err.to_string(), req_id)
}

fn password_matches(hash: &str, password: &str, req_id: &str) -> Result<bool, AppError> {
    let parsed = PasswordHash::new(hash).map_err(|_| AppError::internal("bad hash", req_id))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

fn username_issues(username: &str) -> Vec<ErrorDetail> {
    if username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Vec::new()
    } else {
        vec![ErrorDetail {
            field: "username".into(),
            issue: "may only contain letters, digits and underscores".into(),
        }]
    }
}

fn password_issues(password: &str) -> Vec<ErrorDetail> {
    let rules: [(bool, &str); 4] = [
        (password.chars().any(|c| c.is_ascii_uppercase()), "must contain an uppercase letter"),
        (password.chars().any(|c| c.is_ascii_lowercase()), "must contain a lowercase letter"),
        (password.chars().any(|c| c.is_ascii_digit()), "must contain a digit"),
        (password.chars().any(|c| PASSWORD_SPECIALS.contains(c)), "must contain a special character"),
    ];
    rules
        .iter()
        .filter(|(ok, _)| !ok)
        .map(|(_, issue)| ErrorDetail {
            field: "password".into(),
            issue: issue.to_string(),
        })
        .collect()
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterPayload {
    #[validate(length(min = 3, max = 32, message = "must be 3 to 32 characters"))]
    pub username: String,
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    #[validate(length(min = 8, message = "must be at least 8 characters"))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginPayload {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserOut {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: Role,
}

impl From<&User> for UserOut {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterPayload>,
) -> Result<(StatusCode, Json<UserOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    rate_limited("auth_register", &headers, 20, &req_id)?;

    let username = payload.username.trim().to_string();
    let email = payload.email.trim().to_lowercase();
    let mut details = match payload.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => AppError::from_payload(errors, req_id.clone()).details,
    };
    details.extend(username_issues(&username));
    details.extend(password_issues(&payload.password));
    if !details.is_empty() {
        return Err(AppError::validation("invalid registration data", req_id).with_details(details));
    }

    let hash = hash_password(&payload.password).map_err(|e| AppError::internal(e.to_string(), req_id.clone()))?;
    let user = state
        .create_user(&username, &email, hash, Role::User)
        .await
        .map_err(|e| conflict(e, &req_id))?;
    info!("registered user {}", user.username);
    Ok((StatusCode::CREATED, Json(UserOut::from(&user))))
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<LoginPayload>,
) -> Result<(CookieJar, Json<UserOut>), AppError> {
    let req_id = request_id_from_headers(&headers);
    rate_limited("auth_login", &headers, 30, &req_id)?;
    let invalid = || AppError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "invalid credentials", req_id.clone());

    let id = {
        let by_name = state.db.users_by_name.read().await;
        by_name.get(&payload.username.trim().to_lowercase()).copied()
    }
    .ok_or_else(invalid)?;
    let user = state
        .db
        .users
        .read()
        .await
        .get(&id)
        .cloned()
        .ok_or_else(invalid)?;

    if !password_matches(&user.password_hash, &payload.password, &req_id)? {
        return Err(invalid());
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let csrf_token = uuid::Uuid::new_v4().to_string();
    state.db.sessions.write().await.insert(
        session_id.clone(),
        LoginSession {
            user_id: id,
            csrf_token: csrf_token.clone(),
            current_quiz: None,
        },
    );

    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build();
    let csrf_cookie = Cookie::build((CSRF_COOKIE, csrf_token))
        .http_only(false)
        .same_site(SameSite::Lax)
        .path("/")
        .build();

    Ok((jar.add(cookie).add(csrf_cookie), Json(UserOut::from(&user))))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode), AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let sid = session_id(&jar).ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    state.db.sessions.write().await.remove(&sid);
    let jar = jar
        .remove(Cookie::build(SESSION_COOKIE).path("/"))
        .remove(Cookie::build(CSRF_COOKIE).path("/"));
    Ok((jar, StatusCode::NO_CONTENT))
}

pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<UserOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let user_id = auth_user_id(&jar, &state, &req_id).await?;
    let users = state.db.users.read().await;
    let user = users.get(&user_id).ok_or_else(|| AppError::unauthorized(req_id))?;
    Ok(Json(UserOut::from(user)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ProfilePayload {
    #[validate(length(min = 3, max = 32, message = "must be 3 to 32 characters"))]
    pub username: String,
}

pub async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<ProfilePayload>,
) -> Result<Json<UserOut>, AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let user_id = auth_user_id(&jar, &state, &req_id).await?;

    let username = payload.username.trim().to_string();
    let mut details = match payload.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => AppError::from_payload(errors, req_id.clone()).details,
    };
    details.extend(username_issues(&username));
    if !details.is_empty() {
        return Err(AppError::validation("invalid username", req_id).with_details(details));
    }

    let user = state
        .rename_user(user_id, &username)
        .await
        .map_err(|e| conflict(e, &req_id))?
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    info!("user {} renamed to {}", user.id, user.username);
    Ok(Json(UserOut::from(&user)))
}

#[derive(Debug, Deserialize)]
pub struct PasswordChangePayload {
    #[serde(default)]
    pub current_password: String,
    #[serde(default)]
    pub new_password: String,
    #[serde(default)]
    pub confirm_password: String,
}

fn field_issue(field: &str, issue: &str) -> ErrorDetail {
    ErrorDetail {
        field: field.into(),
        issue: issue.into(),
    }
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<PasswordChangePayload>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let user_id = auth_user_id(&jar, &state, &req_id).await?;

    let missing: Vec<ErrorDetail> = [
        ("current_password", &payload.current_password),
        ("new_password", &payload.new_password),
        ("confirm_password", &payload.confirm_password),
    ]
    .into_iter()
    .filter(|(_, value)| value.is_empty())
    .map(|(field, _)| field_issue(field, "is required"))
    .collect();
    if !missing.is_empty() {
        return Err(AppError::validation("all fields are required", req_id).with_details(missing));
    }

    let current_hash = state
        .db
        .users
        .read()
        .await
        .get(&user_id)
        .map(|u| u.password_hash.clone())
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    if !password_matches(&current_hash, &payload.current_password, &req_id)? {
        return Err(AppError::validation("current password is incorrect", req_id)
            .with_details(vec![field_issue("current_password", "is incorrect")]));
    }
    if payload.new_password != payload.confirm_password {
        return Err(AppError::validation("new passwords do not match", req_id)
            .with_details(vec![field_issue("confirm_password", "must match new_password")]));
    }

    let mut details: Vec<ErrorDetail> = password_issues(&payload.new_password)
        .into_iter()
        .map(|d| field_issue("new_password", &d.issue))
        .collect();
    if payload.new_password.chars().count() < 8 {
        details.insert(0, field_issue("new_password", "must be at least 8 characters"));
    }
    if !details.is_empty() {
        return Err(AppError::validation("new password is too weak", req_id).with_details(details));
    }

    let hash = hash_password(&payload.new_password).map_err(|e| AppError::internal(e.to_string(), req_id.clone()))?;
    if !state.set_password_hash(user_id, hash).await {
        return Err(AppError::unauthorized(req_id));
    }
    info!("user {} changed their password", user_id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode), AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let user_id = auth_user_id(&jar, &state, &req_id).await?;
    let removed = state
        .delete_user(user_id)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    info!(
        "user {} deleted their account ({} quizzes, {} attempts)",
        user_id, removed.quizzes, removed.attempts
    );
    let jar = jar
        .remove(Cookie::build(SESSION_COOKIE).path("/"))
        .remove(Cookie::build(CSRF_COOKIE).path("/"));
    Ok((jar, StatusCode::NO_CONTENT))
}

fn default_num_questions() -> usize {
    5
}

#[derive(Debug, Deserialize, Validate)]
pub struct GeneratePayload {
    #[validate(length(min = 1, message = "must not be empty"))]
    pub context: String,
    #[serde(default = "default_num_questions")]
    #[validate(range(min = 1, max = 50, message = "must be between 1 and 50"))]
    pub num_questions: usize,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[validate(length(max = 200, message = "must be at most 200 characters"))]
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub source: String,
    pub quiz_id: i64,
    pub title: String,
    pub questions: Vec<GeneratedQuestion>,
    pub message: String,
}

async fn generate_with_ai(
    state: &AppState,
    client: &Arc<dyn AiQuizClient>,
    context: &str,
    count: usize,
    difficulty: Difficulty,
) -> Option<Vec<GeneratedQuestion>> {
    let context: String = context.chars().take(MAX_CONTEXT_CHARS).collect();
    for attempt in 1..=2 {
        let raw = match client.generate_quiz_json(&context, count, difficulty).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!("ai generation failed, using heuristic synthesizer: {}", err);
                return None;
            }
        };
        match parse_ai_questions(&raw, &state.quiz_schema, difficulty, count) {
            Ok(questions) => return Some(questions),
            Err(err) => warn!("ai attempt {} rejected: {}", attempt, err),
        }
    }
    None
}

pub async fn generate_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<GeneratePayload>,
) -> Result<(StatusCode, Json<GenerateResponse>), AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let (sid, session) = auth_session(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    rate_limited("generate", &headers, 10, &req_id)?;
    payload
        .validate()
        .map_err(|e| AppError::from_payload(e, req_id.clone()))?;
    if payload.context.trim().is_empty() {
        return Err(AppError::from_generation(GenerationError::EmptySource, req_id));
    }

    let count = payload.num_questions;
    let ai_questions = match state.ai_client.as_ref() {
        Some(client) => generate_with_ai(&state, client, &payload.context, count, payload.difficulty).await,
        None => None,
    };

    let (questions, source) = match ai_questions {
        Some(questions) => (questions, "ai".to_string()),
        None => {
            let synthesizer = state.synthesizer.clone();
            let context = payload.context.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let mut rng = StdRng::from_entropy();
                synthesizer.assemble(&context, count, &mut rng)
            })
            .await
            .map_err(|e| AppError::internal(format!("generation task failed: {e}"), req_id.clone()))?
            .map_err(|e| AppError::from_generation(e, req_id.clone()))?;
            info!(
                "heuristic generation for user {}: source={} attempts={}",
                session.user_id,
                outcome.source.as_str(),
                outcome.stats.attempts
            );
            let questions = outcome
                .questions
                .into_iter()
                .map(|mut q| {
                    q.difficulty = payload.difficulty;
                    q
                })
                .collect();
            (questions, outcome.source.as_str().to_string())
        }
    };

    if let Err(issues) = validate_questions(&questions) {
        return Err(AppError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "VALIDATION_ERROR",
            "generated questions failed validation",
            req_id,
        )
        .with_details(issues.into_iter().map(ErrorDetail::from).collect()));
    }

    let title = derive_quiz_title(&payload.context, payload.title.as_deref());
    let quiz_id = state
        .create_quiz(
            session.user_id,
            NewQuiz {
                title: title.clone(),
                context: payload.context.clone(),
                difficulty: payload.difficulty,
                source: source.clone(),
                questions: questions.clone(),
            },
        )
        .await;

    if let Some(s) = state.db.sessions.write().await.get_mut(&sid) {
        s.current_quiz = Some(QuizSessionState {
            quiz_id,
            title: title.clone(),
            questions: questions.clone(),
            is_retake: false,
        });
    }

    let message = match source.as_str() {
        "ai" => format!("Generated {} questions with AI", questions.len()),
        "pipeline" => format!("Generated {} questions from your text", questions.len()),
        _ => format!("Generated {} fallback questions", questions.len()),
    };
    Ok((
        StatusCode::CREATED,
        Json(GenerateResponse {
            source,
            quiz_id,
            title,
            questions,
            message,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct CurrentQuizResponse {
    pub quiz_id: i64,
    pub title: String,
    pub is_retake: bool,
    pub questions: Vec<GeneratedQuestion>,
}

impl From<QuizSessionState> for CurrentQuizResponse {
    fn from(s: QuizSessionState) -> Self {
        Self {
            quiz_id: s.quiz_id,
            title: s.title,
            is_retake: s.is_retake,
            questions: s.questions,
        }
    }
}

pub async fn current_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<CurrentQuizResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let (_, session) = auth_session(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    let current = session
        .current_quiz
        .ok_or_else(|| AppError::not_found("current quiz", req_id))?;
    Ok(Json(current.into()))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitAttemptPayload {
    #[validate(length(max = 50, message = "too many answers"))]
    pub answers: Vec<String>,
    /// Seconds.
    #[serde(default)]
    pub time_spent: u64,
}

#[derive(Debug, Serialize)]
pub struct AttemptResultResponse {
    pub attempt_id: i64,
    pub quiz_id: i64,
    pub score: usize,
    pub total_questions: usize,
    pub percentage: f64,
    pub results: Vec<bool>,
    pub is_retake: bool,
}

pub async fn submit_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<SubmitAttemptPayload>,
) -> Result<(StatusCode, Json<AttemptResultResponse>), AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let (sid, session) = auth_session(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    payload
        .validate()
        .map_err(|e| AppError::from_payload(e, req_id.clone()))?;
    let current = session
        .current_quiz
        .ok_or_else(|| AppError::not_found("current quiz", req_id.clone()))?;

    let results = score_answers(&current.questions, &payload.answers);
    let score = results.iter().filter(|r| **r).count();
    let total_questions = current.questions.len();
    let now = Utc::now();

    let attempt_id = {
        let mut attempts = state.db.attempts.write().await;
        let previous = current
            .is_retake
            .then(|| {
                attempts
                    .values()
                    .filter(|a| a.user_id == session.user_id && a.quiz_id == current.quiz_id)
                    .map(|a| a.id)
                    .max()
            })
            .flatten();
        match previous.and_then(|id| attempts.get_mut(&id)) {
            Some(existing) => {
                existing.score = score;
                existing.total_questions = total_questions;
                existing.answers = payload.answers.clone();
                existing.time_spent = payload.time_spent;
                existing.completed_at = now;
                existing.id
            }
            None => {
                let id = state.db.next_attempt_id();
                attempts.insert(
                    id,
                    AttemptRecord {
                        id,
                        user_id: session.user_id,
                        quiz_id: current.quiz_id,
                        score,
                        total_questions,
                        answers: payload.answers.clone(),
                        time_spent: payload.time_spent,
                        completed_at: now,
                    },
                );
                id
            }
        }
    };

    if let Some(s) = state.db.sessions.write().await.get_mut(&sid) {
        s.current_quiz = None;
    }
    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after submit_attempt: {}", err);
    }

    let percentage = if total_questions == 0 {
        0.0
    } else {
        (score as f64 * 1000.0 / total_questions as f64).round() / 10.0
    };
    Ok((
        StatusCode::CREATED,
        Json(AttemptResultResponse {
            attempt_id,
            quiz_id: current.quiz_id,
            score,
            total_questions,
            percentage,
            results,
            is_retake: current.is_retake,
        }),
    ))
}

pub async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<History>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let user_id = auth_user_id(&jar, &state, &req_id).await?;
    let attempts: Vec<AttemptRecord> = state.db.attempts.read().await.values().cloned().collect();
    let quizzes: Vec<_> = state.db.quizzes.read().await.values().cloned().collect();
    Ok(Json(stats::history(user_id, &attempts, &quizzes)))
}

async fn owned_attempt(state: &AppState, user_id: i64, attempt_id: i64, req_id: &str) -> Result<AttemptRecord, AppError> {
    state
        .db
        .attempts
        .read()
        .await
        .get(&attempt_id)
        .filter(|a| a.user_id == user_id)
        .cloned()
        .ok_or_else(|| AppError::not_found("attempt", req_id))
}

#[derive(Debug, Serialize)]
pub struct AnswerReview {
    #[serde(rename = "type")]
    pub q_type: QuestionType,
    pub question: String,
    pub options: Vec<String>,
    pub answer: String,
    pub user_answer: Option<String>,
    pub is_correct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AttemptDetailResponse {
    pub attempt_id: i64,
    pub quiz_id: i64,
    pub title: String,
    pub difficulty: Difficulty,
    pub score: usize,
    pub total_questions: usize,
    pub percentage: f64,
    pub time_spent: u64,
    pub completed_at: DateTime<Utc>,
    pub questions: Vec<AnswerReview>,
}

pub async fn get_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(attempt_id): Path<i64>,
) -> Result<Json<AttemptDetailResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let user_id = auth_user_id(&jar, &state, &req_id).await?;
    let attempt = owned_attempt(&state, user_id, attempt_id, &req_id).await?;
    let quiz = state
        .db
        .quizzes
        .read()
        .await
        .get(&attempt.quiz_id)
        .cloned()
        .ok_or_else(|| AppError::not_found("quiz", req_id.clone()))?;

    let questions = quiz
        .questions
        .into_iter()
        .enumerate()
        .map(|(i, q)| {
            let user_answer = attempt.answers.get(i).cloned();
            AnswerReview {
                is_correct: user_answer.as_deref().map(|a| q.is_correct(a)).unwrap_or(false),
                q_type: q.q_type,
                question: q.question,
                options: q.options,
                answer: q.answer,
                user_answer,
                explanation: q.explanation,
            }
        })
        .collect();

    Ok(Json(AttemptDetailResponse {
        attempt_id: attempt.id,
        quiz_id: attempt.quiz_id,
        title: quiz.title,
        difficulty: quiz.difficulty,
        score: attempt.score,
        total_questions: attempt.total_questions,
        percentage: (attempt.percentage() * 10.0).round() / 10.0,
        time_spent: attempt.time_spent,
        completed_at: attempt.completed_at,
        questions,
    }))
}

pub async fn retake_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(attempt_id): Path<i64>,
) -> Result<Json<CurrentQuizResponse>, AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let (sid, session) = auth_session(&jar, &state)
        .await
        .ok_or_else(|| AppError::unauthorized(req_id.clone()))?;
    let attempt = owned_attempt(&state, session.user_id, attempt_id, &req_id).await?;
    let quiz = state
        .db
        .quizzes
        .read()
        .await
        .get(&attempt.quiz_id)
        .cloned()
        .ok_or_else(|| AppError::not_found("quiz", req_id.clone()))?;

    let current = QuizSessionState {
        quiz_id: quiz.id,
        title: quiz.title,
        questions: quiz.questions,
        is_retake: true,
    };
    if let Some(s) = state.db.sessions.write().await.get_mut(&sid) {
        s.current_quiz = Some(current.clone());
    }
    Ok(Json(current.into()))
}

#[derive(Debug, Deserialize, Validate)]
pub struct RenamePayload {
    #[validate(length(max = 200, message = "must be at most 200 characters"))]
    pub title: String,
}

pub async fn rename_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(attempt_id): Path<i64>,
    Json(payload): Json<RenamePayload>,
) -> Result<Json<serde_json::Value>, AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let user_id = auth_user_id(&jar, &state, &req_id).await?;
    payload
        .validate()
        .map_err(|e| AppError::from_payload(e, req_id.clone()))?;
    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::validation("title must not be empty", req_id.clone()).with_details(vec![
            ErrorDetail {
                field: "title".into(),
                issue: "must not be empty".into(),
            },
        ]));
    }

    let attempt = owned_attempt(&state, user_id, attempt_id, &req_id).await?;
    {
        let mut quizzes = state.db.quizzes.write().await;
        let quiz = quizzes
            .get_mut(&attempt.quiz_id)
            .ok_or_else(|| AppError::not_found("quiz", req_id.clone()))?;
        quiz.title = title.clone();
    }
    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after rename_attempt: {}", err);
    }
    Ok(Json(serde_json::json!({ "attempt_id": attempt_id, "title": title })))
}

pub async fn delete_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(attempt_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let user_id = auth_user_id(&jar, &state, &req_id).await?;
    owned_attempt(&state, user_id, attempt_id, &req_id).await?;
    state.db.attempts.write().await.remove(&attempt_id);
    if let Err(err) = state.persist_core_data().await {
        warn!("failed to persist local state after delete_attempt: {}", err);
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<UserProgress>, AppError> {
    let req_id = request_id_from_headers(&headers);
    let user_id = auth_user_id(&jar, &state, &req_id).await?;
    let attempts: Vec<AttemptRecord> = state.db.attempts.read().await.values().cloned().collect();
    let quizzes: Vec<_> = state.db.quizzes.read().await.values().cloned().collect();
    Ok(Json(stats::user_progress(user_id, &attempts, &quizzes, Utc::now())))
}

pub async fn admin_overview(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<AdminOverview>, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_admin(&jar, &state, &req_id).await?;
    let users: Vec<User> = state.db.users.read().await.values().cloned().collect();
    let quizzes: Vec<_> = state.db.quizzes.read().await.values().cloned().collect();
    let attempts: Vec<AttemptRecord> = state.db.attempts.read().await.values().cloned().collect();
    Ok(Json(stats::admin_overview(&users, &quizzes, &attempts, Utc::now())))
}

fn first_page() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "first_page")]
    pub page: usize,
}

pub async fn admin_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<AdminUserRow>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_admin(&jar, &state, &req_id).await?;
    let users: Vec<User> = state.db.users.read().await.values().cloned().collect();
    let quizzes: Vec<_> = state.db.quizzes.read().await.values().cloned().collect();
    let attempts: Vec<AttemptRecord> = state.db.attempts.read().await.values().cloned().collect();
    Ok(Json(stats::admin_users(&users, &quizzes, &attempts, query.page)))
}

pub async fn admin_quizzes(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<AdminQuizRow>>, AppError> {
    let req_id = request_id_from_headers(&headers);
    require_admin(&jar, &state, &req_id).await?;
    let users: Vec<User> = state.db.users.read().await.values().cloned().collect();
    let quizzes: Vec<_> = state.db.quizzes.read().await.values().cloned().collect();
    let attempts: Vec<AttemptRecord> = state.db.attempts.read().await.values().cloned().collect();
    Ok(Json(stats::admin_quizzes(&users, &quizzes, &attempts, query.page)))
}

pub async fn admin_delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let admin_id = require_admin(&jar, &state, &req_id).await?;
    let target_is_admin = state
        .db
        .users
        .read()
        .await
        .get(&user_id)
        .map(User::is_admin)
        .ok_or_else(|| AppError::not_found("user", req_id.clone()))?;
    if target_is_admin {
        return Err(AppError::validation("cannot delete administrator accounts", req_id));
    }
    let removed = state
        .delete_user(user_id)
        .await
        .ok_or_else(|| AppError::not_found("user", req_id.clone()))?;
    info!(
        "admin {} deleted user {} ({} quizzes, {} attempts)",
        admin_id, user_id, removed.quizzes, removed.attempts
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn admin_delete_quiz(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Path(quiz_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let req_id = request_id_from_headers(&headers);
    ensure_csrf(&headers, &jar, &state, &req_id).await?;
    let admin_id = require_admin(&jar, &state, &req_id).await?;
    let attempts = state
        .delete_quiz(quiz_id)
        .await
        .ok_or_else(|| AppError::not_found("quiz", req_id.clone()))?;
    info!("admin {} deleted quiz {} ({} attempts)", admin_id, quiz_id, attempts);
    Ok(StatusCode::NO_CONTENT)
}
