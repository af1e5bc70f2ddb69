use crate::handlers;
use crate::state::AppState;
use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

fn allowed_origins() -> Vec<HeaderValue> {
    let configured = std::env::var("CORS_ORIGINS").unwrap_or_default();
    let origins: Vec<HeaderValue> = configured
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if origins.is_empty() {
        vec![HeaderValue::from_static("http://localhost:5173")]
    } else {
        origins
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_credentials(true)
        .allow_origin(allowed_origins())
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::COOKIE,
            axum::http::HeaderName::from_static("x-csrf-token"),
            axum::http::HeaderName::from_static("x-request-id"),
            axum::http::HeaderName::from_static("x-forwarded-for"),
        ]);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/auth/register", post(handlers::register))
        .route("/api/v1/auth/login", post(handlers::login))
        .route("/api/v1/auth/logout", post(handlers::logout))
        .route("/api/v1/auth/me", get(handlers::me))
        .route("/api/v1/account", delete(handlers::delete_account))
        .route("/api/v1/account/profile", put(handlers::update_profile))
        .route("/api/v1/account/password", put(handlers::change_password))
        .route("/api/v1/quizzes/generate", post(handlers::generate_quiz))
        .route("/api/v1/quiz/current", get(handlers::current_quiz))
        .route("/api/v1/attempts", post(handlers::submit_attempt))
        .route(
            "/api/v1/attempts/:id",
            get(handlers::get_attempt).delete(handlers::delete_attempt),
        )
        .route("/api/v1/attempts/:id/retake", post(handlers::retake_attempt))
        .route("/api/v1/attempts/:id/title", put(handlers::rename_attempt))
        .route("/api/v1/history", get(handlers::history))
        .route("/api/v1/progress", get(handlers::progress))
        .route("/api/v1/admin/overview", get(handlers::admin_overview))
        .route("/api/v1/admin/users", get(handlers::admin_users))
        .route("/api/v1/admin/users/:id", delete(handlers::admin_delete_user))
        .route("/api/v1/admin/quizzes", get(handlers::admin_quizzes))
        .route("/api/v1/admin/quizzes/:id", delete(handlers::admin_delete_quiz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
