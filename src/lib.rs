pub mod ai;
pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod state;
pub mod stats;
pub mod synth;

use std::sync::Arc;
use synth::{Capabilities, SynthConfig, Synthesizer};
use tracing::warn;

fn heuristic_synthesizer() -> Synthesizer {
    let kind = std::env::var("QUIZGEN_CAPABILITY").unwrap_or_else(|_| "rule".to_string());
    let capabilities = Capabilities::initialize(&kind).unwrap_or_else(|err| {
        warn!("question capabilities unavailable ({}), only fallback questions will be produced", err);
        Capabilities::unavailable(err.to_string())
    });
    Synthesizer::new(SynthConfig::default(), capabilities)
}

/// Builds the service state with an explicit AI client (or none).
pub fn build_state_with(ai_client: Option<Arc<dyn ai::AiQuizClient>>) -> anyhow::Result<state::AppState> {
    let schema_raw = include_str!("../contracts/ai_quiz.schema.json");
    let schema: serde_json::Value = serde_json::from_str(schema_raw)?;
    let compiled = jsonschema::draft202012::new(&schema)
        .map_err(|e| anyhow::anyhow!("ai quiz schema is invalid: {e}"))?;
    Ok(state::AppState::new(ai_client, heuristic_synthesizer(), compiled))
}

pub fn build_state() -> anyhow::Result<state::AppState> {
    let ai_client: Option<Arc<dyn ai::AiQuizClient>> = match ai::GeminiAiClient::from_env() {
        Some(client) => Some(Arc::new(client)),
        None => {
            warn!("GEMINI_API_KEY is not set, quizzes are generated heuristically");
            None
        }
    };
    build_state_with(ai_client)
}
