use crate::ai::AiQuizClient;
use crate::models::{Difficulty, GeneratedQuestion};
use crate::synth::Synthesizer;
use argon2::{password_hash::SaltString, Argon2, PasswordHasher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::{fs, path::Path};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizRecord {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
    pub context: String,
    pub difficulty: Difficulty,
    pub source: String,
    pub questions: Vec<GeneratedQuestion>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: i64,
    pub user_id: i64,
    pub quiz_id: i64,
    pub score: usize,
    pub total_questions: usize,
    pub answers: Vec<String>,
    /// Seconds.
    pub time_spent: u64,
    pub completed_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn percentage(&self) -> f64 {
        if self.total_questions == 0 {
            0.0
        } else {
            self.score as f64 * 100.0 / self.total_questions as f64
        }
    }
}

/// The quiz a logged-in user is currently taking.
#[derive(Debug, Clone)]
pub struct QuizSessionState {
    pub quiz_id: i64,
    pub title: String,
    pub questions: Vec<GeneratedQuestion>,
    pub is_retake: bool,
}

#[derive(Debug, Clone)]
pub struct LoginSession {
    pub user_id: i64,
    pub csrf_token: String,
    pub current_quiz: Option<QuizSessionState>,
}

pub struct InMemoryDb {
    pub users: RwLock<HashMap<i64, User>>,
    pub users_by_name: RwLock<HashMap<String, i64>>,
    pub sessions: RwLock<HashMap<String, LoginSession>>,
    pub quizzes: RwLock<HashMap<i64, QuizRecord>>,
    pub attempts: RwLock<HashMap<i64, AttemptRecord>>,
    next_user_id: AtomicI64,
    next_quiz_id: AtomicI64,
    next_attempt_id: AtomicI64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistentSnapshot {
    users: HashMap<i64, User>,
    quizzes: HashMap<i64, QuizRecord>,
    attempts: HashMap<i64, AttemptRecord>,
    next_user_id: i64,
    next_quiz_id: i64,
    next_attempt_id: i64,
}

fn next_free<V>(stored: Option<i64>, map: &HashMap<i64, V>) -> i64 {
    stored
        .unwrap_or(1)
        .max(map.keys().max().copied().unwrap_or(0) + 1)
}

impl InMemoryDb {
    pub fn new(snapshot_path: Option<&str>) -> Self {
        let snapshot = snapshot_path.and_then(|path| {
            let raw = fs::read_to_string(path).ok()?;
            match serde_json::from_str::<PersistentSnapshot>(&raw) {
                Ok(s) => Some(s),
                Err(err) => {
                    warn!("failed to read local snapshot {}: {}", path, err);
                    None
                }
            }
        });

        let (users, quizzes, attempts, ids) = match snapshot {
            Some(s) => (
                s.users,
                s.quizzes,
                s.attempts,
                (Some(s.next_user_id), Some(s.next_quiz_id), Some(s.next_attempt_id)),
            ),
            None => (HashMap::new(), HashMap::new(), HashMap::new(), (None, None, None)),
        };
        let users_by_name = users
            .values()
            .map(|u| (u.username.to_lowercase(), u.id))
            .collect();

        Self {
            next_user_id: AtomicI64::new(next_free(ids.0, &users)),
            next_quiz_id: AtomicI64::new(next_free(ids.1, &quizzes)),
            next_attempt_id: AtomicI64::new(next_free(ids.2, &attempts)),
            users: RwLock::new(users),
            users_by_name: RwLock::new(users_by_name),
            sessions: RwLock::new(HashMap::new()),
            quizzes: RwLock::new(quizzes),
            attempts: RwLock::new(attempts),
        }
    }

    pub fn next_user_id(&self) -> i64 {
        self.next_user_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_quiz_id(&self) -> i64 {
        self.next_quiz_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_attempt_id(&self) -> i64 {
        self.next_attempt_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn snapshot(&self) -> PersistentSnapshot {
        PersistentSnapshot {
            users: self.users.read().await.clone(),
            quizzes: self.quizzes.read().await.clone(),
            attempts: self.attempts.read().await.clone(),
            next_user_id: self.next_user_id.load(Ordering::SeqCst),
            next_quiz_id: self.next_quiz_id.load(Ordering::SeqCst),
            next_attempt_id: self.next_attempt_id.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewQuiz {
    pub title: String,
    pub context: String,
    pub difficulty: Difficulty,
    pub source: String,
    pub questions: Vec<GeneratedQuestion>,
}

/// Why an account write was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AccountConflict {
    #[error("username already exists")]
    Username,
    #[error("email already exists")]
    Email,
}

/// What `delete_user` removed alongside the account.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Removed {
    pub quizzes: usize,
    pub attempts: usize,
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hash failed: {e}"))?;
    Ok(hash.to_string())
}

fn forget_quizzes(sessions: &mut HashMap<String, LoginSession>, quiz_ids: &HashSet<i64>) {
    for session in sessions.values_mut() {
        if session
            .current_quiz
            .as_ref()
            .is_some_and(|q| quiz_ids.contains(&q.quiz_id))
        {
            session.current_quiz = None;
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<InMemoryDb>,
    pub ai_client: Option<Arc<dyn AiQuizClient>>,
    pub synthesizer: Arc<Synthesizer>,
    pub quiz_schema: Arc<jsonschema::Validator>,
    pub local_state_path: Option<String>,
}

impl AppState {
    pub fn new(
        ai_client: Option<Arc<dyn AiQuizClient>>,
        synthesizer: Synthesizer,
        quiz_schema: jsonschema::Validator,
    ) -> Self {
        let local_state_path = match std::env::var("LOCAL_STATE_PATH") {
            Ok(v) if v.trim().is_empty() => None,
            Ok(v) => Some(v),
            Err(_) => Some(format!("{}/local_state.json", env!("CARGO_MANIFEST_DIR"))),
        };
        Self {
            db: Arc::new(InMemoryDb::new(local_state_path.as_deref())),
            ai_client,
            synthesizer: Arc::new(synthesizer),
            quiz_schema: Arc::new(quiz_schema),
            local_state_path,
        }
    }

    /// Inserts a new account. Uniqueness of the username (case-insensitive)
    /// and the email is checked under the same write locks as the insert.
    /// Lock order everywhere: `users_by_name`, then `users`.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: String,
        role: Role,
    ) -> Result<User, AccountConflict> {
        let user = {
            let mut by_name = self.db.users_by_name.write().await;
            let mut users = self.db.users.write().await;
            let key = username.to_lowercase();
            if by_name.contains_key(&key) {
                return Err(AccountConflict::Username);
            }
            if users.values().any(|u| u.email.eq_ignore_ascii_case(email)) {
                return Err(AccountConflict::Email);
            }
            let id = self.db.next_user_id();
            let user = User {
                id,
                username: username.to_string(),
                email: email.to_string(),
                password_hash,
                role,
                created_at: Utc::now(),
            };
            users.insert(id, user.clone());
            by_name.insert(key, id);
            user
        };
        if let Err(err) = self.persist_core_data().await {
            warn!("failed to persist local state after create_user: {}", err);
        }
        Ok(user)
    }

    /// Creates the configured admin account unless that username exists.
    pub async fn ensure_admin(&self, username: &str, password: &str) -> anyhow::Result<()> {
        if self
            .db
            .users_by_name
            .read()
            .await
            .contains_key(&username.to_lowercase())
        {
            return Ok(());
        }
        let hash = hash_password(password)?;
        let email = format!("{}@localhost", username.to_lowercase());
        match self.create_user(username, &email, hash, Role::Admin).await {
            Ok(admin) => info!("created admin account {}", admin.username),
            Err(AccountConflict::Username) => {}
            Err(err) => anyhow::bail!("cannot create admin account {username}: {err}"),
        }
        Ok(())
    }

    /// Renames an account. `Ok(None)` when the user does not exist.
    pub async fn rename_user(&self, user_id: i64, username: &str) -> Result<Option<User>, AccountConflict> {
        let renamed = {
            let mut by_name = self.db.users_by_name.write().await;
            let mut users = self.db.users.write().await;
            let key = username.to_lowercase();
            if by_name.get(&key).is_some_and(|id| *id != user_id) {
                return Err(AccountConflict::Username);
            }
            let Some(user) = users.get_mut(&user_id) else {
                return Ok(None);
            };
            by_name.remove(&user.username.to_lowercase());
            by_name.insert(key, user_id);
            user.username = username.to_string();
            user.clone()
        };
        if let Err(err) = self.persist_core_data().await {
            warn!("failed to persist local state after rename_user: {}", err);
        }
        Ok(Some(renamed))
    }

    pub async fn set_password_hash(&self, user_id: i64, password_hash: String) -> bool {
        let updated = match self.db.users.write().await.get_mut(&user_id) {
            Some(user) => {
                user.password_hash = password_hash;
                true
            }
            None => false,
        };
        if updated {
            if let Err(err) = self.persist_core_data().await {
                warn!("failed to persist local state after set_password_hash: {}", err);
            }
        }
        updated
    }

    /// Removes an account together with its quizzes, every attempt by the
    /// user or on those quizzes, and its login sessions.
    pub async fn delete_user(&self, user_id: i64) -> Option<Removed> {
        {
            let mut by_name = self.db.users_by_name.write().await;
            let user = self.db.users.write().await.remove(&user_id)?;
            by_name.remove(&user.username.to_lowercase());
        }
        let owned: HashSet<i64> = {
            let mut quizzes = self.db.quizzes.write().await;
            let ids: HashSet<i64> = quizzes
                .values()
                .filter(|q| q.owner_id == user_id)
                .map(|q| q.id)
                .collect();
            quizzes.retain(|id, _| !ids.contains(id));
            ids
        };
        let attempts = {
            let mut attempts = self.db.attempts.write().await;
            let before = attempts.len();
            attempts.retain(|_, a| a.user_id != user_id && !owned.contains(&a.quiz_id));
            before - attempts.len()
        };
        {
            let mut sessions = self.db.sessions.write().await;
            sessions.retain(|_, s| s.user_id != user_id);
            forget_quizzes(&mut sessions, &owned);
        }
        if let Err(err) = self.persist_core_data().await {
            warn!("failed to persist local state after delete_user: {}", err);
        }
        Some(Removed {
            quizzes: owned.len(),
            attempts,
        })
    }

    /// Removes a quiz and all attempts on it. Returns the removed attempt count.
    pub async fn delete_quiz(&self, quiz_id: i64) -> Option<usize> {
        self.db.quizzes.write().await.remove(&quiz_id)?;
        let removed = {
            let mut attempts = self.db.attempts.write().await;
            let before = attempts.len();
            attempts.retain(|_, a| a.quiz_id != quiz_id);
            before - attempts.len()
        };
        forget_quizzes(&mut *self.db.sessions.write().await, &HashSet::from([quiz_id]));
        if let Err(err) = self.persist_core_data().await {
            warn!("failed to persist local state after delete_quiz: {}", err);
        }
        Some(removed)
    }

    pub async fn create_quiz(&self, owner_id: i64, quiz: NewQuiz) -> i64 {
        let id = self.db.next_quiz_id();
        let record = QuizRecord {
            id,
            owner_id,
            title: quiz.title,
            context: quiz.context,
            difficulty: quiz.difficulty,
            source: quiz.source,
            questions: quiz.questions,
            created_at: Utc::now(),
        };
        self.db.quizzes.write().await.insert(id, record);
        if let Err(err) = self.persist_core_data().await {
            warn!("failed to persist local state after create_quiz: {}", err);
        }
        id
    }

    pub async fn persist_core_data(&self) -> anyhow::Result<()> {
        let Some(path) = self.local_state_path.as_ref() else {
            return Ok(());
        };
        let snapshot = self.db.snapshot().await;
        let serialized = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serialized).await?;
        Ok(())
    }
}
