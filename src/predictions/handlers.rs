use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use super::dto::{
    CropRequest, CropResponse, DetailedRequest, ModelInfo, ModelsResponse, MonitorResponse,
    RiskRequest, RiskResponse, SavedDetailed, YieldRequest, YieldResponse,
};
use super::models::{CROP_FEATURES, RISK_FEATURES, YIELD_FEATURES};
use super::repo_types::{BasicKind, ModelProvenance};
use super::services::{
    assess_risk, crop_output, estimate_yield, monitor, recommend_crop, risk_output, save_basic,
    save_detailed, to_fields, yield_output,
};
use crate::analytics::round_to;
use crate::auth::extractors::{AuthUser, MaybeAuthUser};
use crate::state::AppState;

pub fn prediction_routes() -> Router<AppState> {
    Router::new()
        .route("/predict-yield", post(predict_yield))
        .route("/predict-crop", post(predict_crop))
        .route("/predict-risk", post(predict_risk))
        .route("/save-detailed-prediction", post(save_detailed_prediction))
        .route("/models", get(list_models))
        .route("/monitor", get(monitor_models))
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    error!(error = %e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
}

fn save_message(saved: bool) -> &'static str {
    if saved {
        "Prediction saved to your profile"
    } else {
        "Login to save predictions"
    }
}

fn model_status(provenance: ModelProvenance) -> &'static str {
    match provenance {
        ModelProvenance::Trained => "Trained Model",
        ModelProvenance::Mock => "Mock Model",
    }
}

#[instrument(skip(state, req))]
pub async fn predict_yield(
    State(state): State<AppState>,
    MaybeAuthUser(user): MaybeAuthUser,
    Json(req): Json<YieldRequest>,
) -> Result<Json<YieldResponse>, (StatusCode, String)> {
    let models = state.models.load().await;
    let estimate = estimate_yield(models, &req, &mut rand::thread_rng());

    let saved = match user {
        Some(user_id) => {
            save_basic(
                state.store.as_ref(),
                user_id,
                BasicKind::Yield,
                to_fields(&req),
                yield_output(&estimate),
                estimate.provenance,
            )
            .await
            .map_err(internal)?;
            true
        }
        None => false,
    };

    Ok(Json(YieldResponse {
        yield_value: round_to(estimate.value, 2),
        unit: "kg/hectare",
        confidence: round_to(estimate.confidence, 2),
        model_status: model_status(estimate.provenance),
        saved,
        message: save_message(saved),
    }))
}

#[instrument(skip(state, req))]
pub async fn predict_crop(
    State(state): State<AppState>,
    MaybeAuthUser(user): MaybeAuthUser,
    Json(req): Json<CropRequest>,
) -> Result<Json<CropResponse>, (StatusCode, String)> {
    let models = state.models.load().await;
    let estimate = recommend_crop(models, &req, &mut rand::thread_rng());

    let saved = match user {
        Some(user_id) => {
            save_basic(
                state.store.as_ref(),
                user_id,
                BasicKind::Crop,
                to_fields(&req),
                crop_output(&estimate),
                estimate.provenance,
            )
            .await
            .map_err(internal)?;
            true
        }
        None => false,
    };

    Ok(Json(CropResponse {
        recommended_crop: estimate.crop,
        confidence: round_to(estimate.confidence, 3),
        model_status: model_status(estimate.provenance),
        top_3: estimate.top,
        model_error: estimate.model_error,
        saved,
        message: save_message(saved),
    }))
}

#[instrument(skip(state, req))]
pub async fn predict_risk(
    State(state): State<AppState>,
    MaybeAuthUser(user): MaybeAuthUser,
    Json(req): Json<RiskRequest>,
) -> Result<Json<RiskResponse>, (StatusCode, String)> {
    let models = state.models.load().await;
    let estimate = assess_risk(models, &req);

    let saved = match user {
        Some(user_id) => {
            save_basic(
                state.store.as_ref(),
                user_id,
                BasicKind::Risk,
                to_fields(&req),
                risk_output(&estimate),
                estimate.provenance,
            )
            .await
            .map_err(internal)?;
            true
        }
        None => false,
    };

    Ok(Json(RiskResponse {
        risk_level: estimate.level.as_str(),
        confidence: round_to(estimate.confidence, 2),
        model_status: match estimate.provenance {
            ModelProvenance::Trained => "Enhanced Trained Model",
            ModelProvenance::Mock => "Enhanced Mock Model",
        },
        recommendations: estimate.level.recommendations(),
        saved,
        message: save_message(saved),
    }))
}

#[instrument(skip(state, req))]
pub async fn save_detailed_prediction(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<DetailedRequest>,
) -> Result<(StatusCode, Json<SavedDetailed>), (StatusCode, String)> {
    let record = save_detailed(state.store.as_ref(), user_id, req)
        .await
        .map_err(internal)?;
    info!(%user_id, id = %record.id, "detailed prediction stored");
    Ok((
        StatusCode::CREATED,
        Json(SavedDetailed {
            success: true,
            prediction_id: record.id,
            message: "Detailed prediction saved successfully",
        }),
    ))
}

/// GET /models: which artifacts were loaded; triggers the load on first call.
#[instrument(skip(state))]
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state.models.load().await;
    Json(ModelsResponse {
        model_dir: state.models.dir().display().to_string(),
        loaded: models.loaded_count(),
        models: vec![
            ModelInfo {
                name: "yield",
                loaded: models.yield_model.is_some(),
                features: YIELD_FEATURES,
            },
            ModelInfo {
                name: "crop",
                loaded: models.crop_model.is_some(),
                features: CROP_FEATURES,
            },
            ModelInfo {
                name: "risk",
                loaded: models.risk_model.is_some(),
                features: RISK_FEATURES,
            },
        ],
    })
}

/// GET /monitor: held-out metrics for the yield and crop models.
#[instrument(skip(state))]
pub async fn monitor_models(
    State(state): State<AppState>,
) -> Result<Json<MonitorResponse>, (StatusCode, String)> {
    let models = state.models.load().await;
    let report = monitor(models, state.models.dir()).await;
    if report.yield_model.is_none() && report.crop_model.is_none() {
        warn!("no models available for monitoring");
        return Err((
            StatusCode::NOT_FOUND,
            "No models available for monitoring".into(),
        ));
    }
    Ok(Json(report))
}
