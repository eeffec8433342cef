use axum::{extract::State, routing::get, Json, Router};
use kiln_core::{HealthChecker, HealthReport};

pub fn router(checker: HealthChecker) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(checker)
}

async fn health(State(checker): State<HealthChecker>) -> Json<HealthReport> {
    Json(checker.report())
}
