//! Axum handlers for the game routes.
//!
//! Inference is CPU/GPU bound, so every game call runs on the blocking pool.

use axum::{extract::State, Json};

use super::dto::*;
use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Run `f` on the blocking pool and flatten its result.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("inference task failed: {e}")))?
        .map_err(ApiError::from)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        games: state.games(),
    })
}

/// `POST /api/predict`: classify the base digit with the drawn strokes applied.
#[tracing::instrument(skip(state, request))]
pub async fn predict_digit(
    State(state): State<AppState>,
    Json(request): Json<PredictDigitRequest>,
) -> ApiResult<Json<PredictDigitResponse>> {
    let game = state
        .digit_game()
        .ok_or(ApiError::NotConfigured { game: "digit" })?;
    let points = request.points.to_pairs();
    tracing::debug!(n_points = points.len(), "Predicting drawn digit");

    let prediction = blocking(move || game.predict_points(&points)).await?;
    Ok(Json(PredictDigitResponse {
        prediction: Some(prediction.prediction),
    }))
}

/// `POST /coordinates`: place a guessed word on the plane.
#[tracing::instrument(skip(state, request))]
pub async fn coordinates(
    State(state): State<AppState>,
    Json(request): Json<CoordinatesRequest>,
) -> ApiResult<Json<CoordinatesResponse>> {
    let projector = state
        .word_projector()
        .ok_or(ApiError::NotConfigured { game: "coordinates" })?;
    let word = request.word.trim().to_string();
    if word.is_empty() {
        return Err(ApiError::bad_request("word must not be empty"));
    }

    let location = blocking(move || projector.locate(&word)).await?;
    Ok(Json(CoordinatesResponse {
        coordinates: location.coordinates,
        scalar: location.scalar,
    }))
}

/// `POST /api/steer`: turn the neuron knobs and report the model's answer.
#[tracing::instrument(skip(state, request))]
pub async fn steer(
    State(state): State<AppState>,
    Json(request): Json<SteerRequest>,
) -> ApiResult<Json<SteerResponse>> {
    let game = state
        .knob_game()
        .ok_or(ApiError::NotConfigured { game: "steer" })?;
    let knobs = crate::steering::parse_knob_turns(&request.knob_turns)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    if knobs.len() > game.neurons().len() {
        return Err(ApiError::bad_request(format!(
            "{} knob values for {} neurons",
            knobs.len(),
            game.neurons().len()
        )));
    }

    let knob_turns = request.knob_turns;
    let result = blocking(move || game.turn(&knob_turns)).await?;
    Ok(Json(SteerResponse {
        prediction: result.prediction,
    }))
}
