use futures::future::BoxFuture;
use quizgen_backend::ai::AiQuizClient;
use quizgen_backend::models::Difficulty;
use quizgen_backend::state::AppState;
use quizgen_backend::{build_state_with, routes::build_router};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const PASSWORD: &str = "Sup3r!secret";

const STUDY_TEXT: &str = "Photosynthesis is the process used by plants to convert light energy into chemical energy. \
The chlorophyll inside chloroplasts absorbs sunlight and powers the reactions that build sugars.\n\n\
The Calvin cycle was discovered by Melvin Calvin and his colleagues at the University of California. \
It fixes carbon dioxide from the air into organic molecules that the plant can store for later use.\n\n\
Cellular respiration is the reverse process that releases the stored energy inside the mitochondria. \
Oxygen is consumed during respiration while carbon dioxide and water are released as waste products.";

struct FixedAi(&'static str);

impl AiQuizClient for FixedAi {
    fn generate_quiz_json(&self, _context: &str, _count: usize, _difficulty: Difficulty) -> BoxFuture<'static, anyhow::Result<String>> {
        let raw = self.0.to_string();
        Box::pin(async move { Ok(raw) })
    }
}

struct DownAi;

impl AiQuizClient for DownAi {
    fn generate_quiz_json(&self, _context: &str, _count: usize, _difficulty: Difficulty) -> BoxFuture<'static, anyhow::Result<String>> {
        Box::pin(async { Err::<String, _>(anyhow::anyhow!("upstream unavailable")) })
    }
}

fn test_state(ai: Option<Arc<dyn AiQuizClient>>) -> AppState {
    std::env::set_var("LOCAL_STATE_PATH", "");
    std::env::set_var("QUIZGEN_CAPABILITY", "rule");
    build_state_with(ai).expect("state")
}

fn client_for(client_ip: &str) -> reqwest::Client {
    let mut defaults = HeaderMap::new();
    defaults.insert("x-forwarded-for", HeaderValue::from_str(client_ip).unwrap());
    reqwest::Client::builder()
        .cookie_store(true)
        .default_headers(defaults)
        .build()
        .unwrap()
}

async fn spawn_server(state: AppState, client_ip: &str) -> (String, reqwest::Client) {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), client_for(client_ip))
}

async fn login(base: &str, client: &reqwest::Client, username: &str, password: &str) -> String {
    let resp = client
        .post(format!("{}/api/v1/auth/login", base))
        .json(&json!({"username": username, "password": password}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let csrf = resp
        .cookies()
        .find(|c| c.name() == "csrf_token")
        .map(|c| c.value().to_string())
        .unwrap();
    csrf
}

async fn auth(base: &str, client: &reqwest::Client, username: &str) -> String {
    let resp = client
        .post(format!("{}/api/v1/auth/register", base))
        .json(&json!({"username": username, "email": format!("{username}@example.com"), "password": PASSWORD}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    login(base, client, username, PASSWORD).await
}

fn csrf_headers(token: &str) -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert("x-csrf-token", HeaderValue::from_str(token).unwrap());
    h
}

async fn generate(base: &str, client: &reqwest::Client, csrf: &str, body: Value) -> Value {
    let resp = client
        .post(format!("{}/api/v1/quizzes/generate", base))
        .headers(csrf_headers(csrf))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn health_responds() {
    let app = build_router(test_state(None));
    let resp = app
        .oneshot(axum::http::Request::get("/health").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn registration_is_validated() {
    let (base, client) = spawn_server(test_state(None), "10.1.0.1").await;

    let weak = client
        .post(format!("{}/api/v1/auth/register", base))
        .json(&json!({"username": "bad name", "email": "not-an-email", "password": "weakpass"}))
        .send()
        .await
        .unwrap();
    assert_eq!(weak.status(), 400);
    let body: Value = weak.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    let fields: Vec<&str> = body["error"]["details"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["field"].as_str())
        .collect();
    assert!(fields.contains(&"email"));
    assert!(fields.contains(&"username"));
    assert!(fields.contains(&"password"));

    auth(&base, &client, "alice").await;
    let dup = client
        .post(format!("{}/api/v1/auth/register", base))
        .json(&json!({"username": "Alice", "email": "other@example.com", "password": PASSWORD}))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), 409);

    let me: Value = client
        .get(format!("{}/api/v1/auth/me", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["username"], "alice");
    assert_eq!(me["role"], "user");
}

#[tokio::test]
async fn heuristic_quiz_flow() {
    let (base, client) = spawn_server(test_state(None), "10.1.0.2").await;
    let csrf = auth(&base, &client, "bob").await;

    let no_csrf = client
        .post(format!("{}/api/v1/quizzes/generate", base))
        .json(&json!({"context": STUDY_TEXT, "num_questions": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(no_csrf.status(), 403);

    let generated = generate(&base, &client, &csrf, json!({"context": STUDY_TEXT, "num_questions": 3, "difficulty": "hard"})).await;
    let source = generated["source"].as_str().unwrap();
    assert!(["pipeline", "content_based", "generic"].contains(&source));
    let questions = generated["questions"].as_array().unwrap();
    assert_eq!(questions.len(), 3);
    for q in questions {
        let options = q["options"].as_array().unwrap();
        assert_eq!(options.len(), 4);
        assert!(options.contains(&q["answer"]));
        assert!(q["question"].as_str().unwrap().ends_with('?'));
    }
    let quiz_id = generated["quiz_id"].as_i64().unwrap();
    assert_eq!(generated["title"], "Photosynthesis is the process used by plants to convert ligh...");

    let current: Value = client
        .get(format!("{}/api/v1/quiz/current", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current["quiz_id"], quiz_id);
    assert_eq!(current["is_retake"], false);

    let answers: Vec<Value> = questions.iter().map(|q| q["answer"].clone()).collect();
    let submitted: Value = client
        .post(format!("{}/api/v1/attempts", base))
        .headers(csrf_headers(&csrf))
        .json(&json!({"answers": answers, "time_spent": 120}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(submitted["score"], 3);
    assert_eq!(submitted["percentage"], 100.0);
    let attempt_id = submitted["attempt_id"].as_i64().unwrap();

    let gone = client
        .get(format!("{}/api/v1/quiz/current", base))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);

    let retake: Value = client
        .post(format!("{}/api/v1/attempts/{}/retake", base, attempt_id))
        .headers(csrf_headers(&csrf))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(retake["is_retake"], true);

    let resubmitted: Value = client
        .post(format!("{}/api/v1/attempts", base))
        .headers(csrf_headers(&csrf))
        .json(&json!({"answers": ["", "", ""], "time_spent": 60}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resubmitted["attempt_id"], attempt_id);
    assert_eq!(resubmitted["score"], 0);

    let history: Value = client
        .get(format!("{}/api/v1/history", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["total"], 1);
    assert_eq!(history["items"][0]["score"], 0);

    let renamed = client
        .put(format!("{}/api/v1/attempts/{}/title", base, attempt_id))
        .headers(csrf_headers(&csrf))
        .json(&json!({"title": "  Plants  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(renamed.status(), 200);
    let blank = client
        .put(format!("{}/api/v1/attempts/{}/title", base, attempt_id))
        .headers(csrf_headers(&csrf))
        .json(&json!({"title": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), 400);

    let detail: Value = client
        .get(format!("{}/api/v1/attempts/{}", base, attempt_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["title"], "Plants");
    assert_eq!(detail["difficulty"], "hard");
    assert_eq!(detail["questions"].as_array().unwrap().len(), 3);
    assert_eq!(detail["questions"][0]["is_correct"], false);

    let progress: Value = client
        .get(format!("{}/api/v1/progress", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(progress["quizzes_completed"], 1);
    assert_eq!(progress["quizzes_created"], 1);
    assert_eq!(progress["achievements"]["difficulty_master"], true);

    let admin = client
        .get(format!("{}/api/v1/admin/overview", base))
        .send()
        .await
        .unwrap();
    assert_eq!(admin.status(), 403);

    let deleted = client
        .delete(format!("{}/api/v1/attempts/{}", base, attempt_id))
        .headers(csrf_headers(&csrf))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
    let history: Value = client
        .get(format!("{}/api/v1/history", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["total"], 0);
}

#[tokio::test]
async fn generation_input_errors() {
    let (base, client) = spawn_server(test_state(None), "10.1.0.3").await;
    let csrf = auth(&base, &client, "carol").await;

    let blank = client
        .post(format!("{}/api/v1/quizzes/generate", base))
        .headers(csrf_headers(&csrf))
        .json(&json!({"context": "   ", "num_questions": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), 400);

    let too_many = client
        .post(format!("{}/api/v1/quizzes/generate", base))
        .headers(csrf_headers(&csrf))
        .json(&json!({"context": STUDY_TEXT, "num_questions": 51}))
        .send()
        .await
        .unwrap();
    assert_eq!(too_many.status(), 400);
    let body: Value = too_many.json().await.unwrap();
    assert_eq!(body["error"]["details"][0]["field"], "num_questions");

    let tiny = generate(&base, &client, &csrf, json!({"context": "Short note.", "num_questions": 2})).await;
    assert_eq!(tiny["source"], "content_based");
    assert_eq!(tiny["questions"][0]["question"], "What is the significance of Short?");
    assert_eq!(tiny["questions"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn ai_questions_are_normalized() {
    let raw = r#"```json
{"questions": [
  {"question": "What absorbs sunlight?", "type": "MCQ", "options": ["Chlorophyll", "Water", "Oxygen", "Salt"], "answer": "A"},
  {"question": "Respiration releases energy.", "type": "TrueFalse", "options": ["True", "False"], "answer": "true", "explanation": "Stated in the text."}
]}
```"#;
    let (base, client) = spawn_server(test_state(Some(Arc::new(FixedAi(raw)))), "10.1.0.4").await;
    let csrf = auth(&base, &client, "dave").await;

    let generated = generate(&base, &client, &csrf, json!({"context": STUDY_TEXT, "num_questions": 2, "title": "Biology"})).await;
    assert_eq!(generated["source"], "ai");
    assert_eq!(generated["title"], "Biology");
    assert_eq!(generated["questions"][0]["answer"], "Chlorophyll");
    assert_eq!(generated["questions"][0]["explanation"], "Based on the provided context.");
    assert_eq!(generated["questions"][1]["answer"], "True");
    assert_eq!(generated["questions"][1]["options"].as_array().unwrap().len(), 4);

    let submitted: Value = client
        .post(format!("{}/api/v1/attempts", base))
        .headers(csrf_headers(&csrf))
        .json(&json!({"answers": ["a", "False"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(submitted["results"], json!([true, false]));
}

#[tokio::test]
async fn ai_failure_falls_back_to_heuristics() {
    let (base, client) = spawn_server(test_state(Some(Arc::new(DownAi))), "10.1.0.5").await;
    let csrf = auth(&base, &client, "erin").await;
    let generated = generate(&base, &client, &csrf, json!({"context": STUDY_TEXT, "num_questions": 2})).await;
    assert_ne!(generated["source"], "ai");
    assert_eq!(generated["questions"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn blank_context_is_rejected_before_ai() {
    let raw = r#"{"questions": [{"question": "What absorbs sunlight?", "type": "MCQ", "options": ["Chlorophyll", "Water", "Oxygen", "Salt"], "answer": "A"}]}"#;
    let (base, client) = spawn_server(test_state(Some(Arc::new(FixedAi(raw)))), "10.1.0.8").await;
    let csrf = auth(&base, &client, "gina").await;

    let resp = client
        .post(format!("{}/api/v1/quizzes/generate", base))
        .headers(csrf_headers(&csrf))
        .json(&json!({"context": "   \n  ", "num_questions": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"]["details"][0]["field"], "context");

    let current = client
        .get(format!("{}/api/v1/quiz/current", base))
        .send()
        .await
        .unwrap();
    assert_eq!(current.status(), 404);
}

#[tokio::test]
async fn admin_sees_overview() {
    let state = test_state(None);
    state.ensure_admin("root_admin", PASSWORD).await.unwrap();
    let (base, admin_client) = spawn_server(state, "10.1.0.6").await;

    let learner = reqwest::Client::builder().cookie_store(true).build().unwrap();
    learner
        .post(format!("{}/api/v1/auth/register", base))
        .header("x-forwarded-for", "10.1.0.7")
        .json(&json!({"username": "frank", "email": "frank@example.com", "password": PASSWORD}))
        .send()
        .await
        .unwrap();

    login(&base, &admin_client, "root_admin", PASSWORD).await;
    let overview: Value = admin_client
        .get(format!("{}/api/v1/admin/overview", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(overview["totals"]["total_users"], 1);
    assert_eq!(overview["daily_activity"].as_array().unwrap().len(), 7);
}

#[tokio::test]
async fn account_settings_flow() {
    let (base, client) = spawn_server(test_state(None), "10.1.0.9").await;
    let taken = client
        .post(format!("{}/api/v1/auth/register", base))
        .json(&json!({"username": "ivy_taken", "email": "ivy@example.com", "password": PASSWORD}))
        .send()
        .await
        .unwrap();
    assert_eq!(taken.status(), 201);
    let csrf = auth(&base, &client, "henry").await;

    let clash = client
        .put(format!("{}/api/v1/account/profile", base))
        .headers(csrf_headers(&csrf))
        .json(&json!({"username": "IVY_TAKEN"}))
        .send()
        .await
        .unwrap();
    assert_eq!(clash.status(), 409);

    let renamed: Value = client
        .put(format!("{}/api/v1/account/profile", base))
        .headers(csrf_headers(&csrf))
        .json(&json!({"username": "henry2"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(renamed["username"], "henry2");

    let change = |body: Value| {
        client
            .put(format!("{}/api/v1/account/password", base))
            .headers(csrf_headers(&csrf))
            .json(&body)
            .send()
    };
    let wrong = change(json!({"current_password": "Nope!1234", "new_password": "N3w!secret", "confirm_password": "N3w!secret"}))
        .await
        .unwrap();
    assert_eq!(wrong.status(), 400);
    let body: Value = wrong.json().await.unwrap();
    assert_eq!(body["error"]["details"][0]["field"], "current_password");

    let mismatch = change(json!({"current_password": PASSWORD, "new_password": "N3w!secret", "confirm_password": "N3w!secreT"}))
        .await
        .unwrap();
    let body: Value = mismatch.json().await.unwrap();
    assert_eq!(body["error"]["details"][0]["field"], "confirm_password");

    let weak = change(json!({"current_password": PASSWORD, "new_password": "short", "confirm_password": "short"}))
        .await
        .unwrap();
    assert_eq!(weak.status(), 400);
    let body: Value = weak.json().await.unwrap();
    assert!(body["error"]["details"]
        .as_array()
        .unwrap()
        .iter()
        .all(|d| d["field"] == "new_password"));

    let ok = change(json!({"current_password": PASSWORD, "new_password": "N3w!secret", "confirm_password": "N3w!secret"}))
        .await
        .unwrap();
    assert_eq!(ok.status(), 204);

    let old_login = client
        .post(format!("{}/api/v1/auth/login", base))
        .json(&json!({"username": "henry2", "password": PASSWORD}))
        .send()
        .await
        .unwrap();
    assert_eq!(old_login.status(), 401);
    let csrf = login(&base, &client, "henry2", "N3w!secret").await;
    generate(&base, &client, &csrf, json!({"context": STUDY_TEXT, "num_questions": 1})).await;

    let deleted = client
        .delete(format!("{}/api/v1/account", base))
        .headers(csrf_headers(&csrf))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
    let me = client.get(format!("{}/api/v1/auth/me", base)).send().await.unwrap();
    assert_eq!(me.status(), 401);
    let gone = client
        .post(format!("{}/api/v1/auth/login", base))
        .json(&json!({"username": "henry2", "password": "N3w!secret"}))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 401);
}

#[tokio::test]
async fn admin_manages_users_and_quizzes() {
    let state = test_state(None);
    state.ensure_admin("boss_admin", PASSWORD).await.unwrap();
    let (base, admin) = spawn_server(state, "10.1.0.10").await;
    let learner = client_for("10.1.0.11");

    let learner_csrf = auth(&base, &learner, "jack").await;
    let quiz = generate(&base, &learner, &learner_csrf, json!({"context": STUDY_TEXT, "num_questions": 2})).await;
    let quiz_id = quiz["quiz_id"].as_i64().unwrap();

    let admin_csrf = login(&base, &admin, "boss_admin", PASSWORD).await;
    let users: Value = admin
        .get(format!("{}/api/v1/admin/users?page=1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(users["total"], 1);
    assert_eq!(users["items"][0]["username"], "jack");
    assert_eq!(users["items"][0]["quizzes_created"], 1);
    let jack_id = users["items"][0]["id"].as_i64().unwrap();

    let quizzes: Value = admin
        .get(format!("{}/api/v1/admin/quizzes", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(quizzes["total"], 1);
    assert_eq!(quizzes["items"][0]["owner"], "jack");

    let forbidden = learner.get(format!("{}/api/v1/admin/users", base)).send().await.unwrap();
    assert_eq!(forbidden.status(), 403);

    let no_csrf = admin
        .delete(format!("{}/api/v1/admin/quizzes/{}", base, quiz_id))
        .send()
        .await
        .unwrap();
    assert_eq!(no_csrf.status(), 403);
    let removed = admin
        .delete(format!("{}/api/v1/admin/quizzes/{}", base, quiz_id))
        .headers(csrf_headers(&admin_csrf))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), 204);
    let again = admin
        .delete(format!("{}/api/v1/admin/quizzes/{}", base, quiz_id))
        .headers(csrf_headers(&admin_csrf))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);
    let stale = learner.get(format!("{}/api/v1/quiz/current", base)).send().await.unwrap();
    assert_eq!(stale.status(), 404);

    let me: Value = admin
        .get(format!("{}/api/v1/auth/me", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let self_delete = admin
        .delete(format!("{}/api/v1/admin/users/{}", base, me["id"]))
        .headers(csrf_headers(&admin_csrf))
        .send()
        .await
        .unwrap();
    assert_eq!(self_delete.status(), 400);

    let dropped = admin
        .delete(format!("{}/api/v1/admin/users/{}", base, jack_id))
        .headers(csrf_headers(&admin_csrf))
        .send()
        .await
        .unwrap();
    assert_eq!(dropped.status(), 204);
    let users: Value = admin
        .get(format!("{}/api/v1/admin/users", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(users["total"], 0);
    let learner_me = learner.get(format!("{}/api/v1/auth/me", base)).send().await.unwrap();
    assert_eq!(learner_me.status(), 401);
}
