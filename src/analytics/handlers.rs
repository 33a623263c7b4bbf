use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use tracing::{error, instrument, warn};

use super::dto::{
    DashboardStats, FilterParams, FilteredPredictions, HistoryPage, HistoryParams, HistorySummary,
    PageParams, PeriodParams, QuarterlyAnalytics, YearlyAnalytics,
};
use super::filter::{filter_predictions, paginate_history, prediction_history, PredictionFilter};
use super::{dashboard, periods, AnalyticsError};
use crate::auth::extractors::{AuthUser, MaybeAuthUser};
use crate::state::AppState;

pub fn analytics_routes() -> Router<AppState> {
    Router::new()
        .route("/dashboard-stats", get(dashboard_stats))
        .route("/predictions/filters", get(filtered_predictions))
        .route("/profile/predictions", get(profile_predictions))
        .route("/prediction-history", get(history))
        .route("/analytics/yearly", get(yearly_analytics))
        .route("/analytics/quarterly", get(quarterly_analytics))
}

fn reject(op: &'static str, e: AnalyticsError) -> (StatusCode, String) {
    let status = e.status();
    if status.is_server_error() {
        error!(error = %e, op, "analytics query failed");
        (status, "Internal server error".into())
    } else {
        warn!(error = %e, op, "analytics request rejected");
        (status, e.to_string())
    }
}

/// GET /dashboard-stats: personal numbers when a token is present, platform totals otherwise.
#[instrument(skip(state))]
pub async fn dashboard_stats(
    State(state): State<AppState>,
    MaybeAuthUser(user): MaybeAuthUser,
) -> Result<Json<DashboardStats>, (StatusCode, String)> {
    let stats = match user {
        Some(user_id) => dashboard::personal_stats(state.store.as_ref(), user_id, state.clock.now())
            .await
            .map(DashboardStats::Personal),
        None => dashboard::aggregate_stats(state.store.as_ref())
            .await
            .map(DashboardStats::Aggregate),
    };
    stats.map(Json).map_err(|e| reject("dashboard_stats", e))
}

#[instrument(skip(state))]
pub async fn filtered_predictions(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<FilterParams>,
) -> Result<Json<FilteredPredictions>, (StatusCode, String)> {
    let filter = PredictionFilter::from_params(&params);
    filter_predictions(
        state.store.as_ref(),
        user_id,
        &filter,
        state.config.analytics.scan_cap,
    )
    .await
    .map(Json)
    .map_err(|e| reject("filtered_predictions", e))
}

#[instrument(skip(state))]
pub async fn profile_predictions(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<PageParams>,
) -> Result<Json<HistoryPage>, (StatusCode, String)> {
    paginate_history(state.store.as_ref(), user_id, &params)
        .await
        .map(Json)
        .map_err(|e| reject("profile_predictions", e))
}

#[instrument(skip(state))]
pub async fn history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistorySummary>, (StatusCode, String)> {
    prediction_history(
        state.store.as_ref(),
        user_id,
        &params,
        state.config.analytics.scan_cap,
    )
    .await
    .map(Json)
    .map_err(|e| reject("prediction_history", e))
}

#[instrument(skip(state))]
pub async fn yearly_analytics(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<PeriodParams>,
) -> Result<Json<YearlyAnalytics>, (StatusCode, String)> {
    let year = params.year.unwrap_or_else(|| state.clock.now().year());
    periods::yearly(
        state.store.as_ref(),
        user_id,
        year,
        state.config.analytics.scan_cap,
    )
    .await
    .map(Json)
    .map_err(|e| reject("yearly_analytics", e))
}

#[instrument(skip(state))]
pub async fn quarterly_analytics(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<PeriodParams>,
) -> Result<Json<QuarterlyAnalytics>, (StatusCode, String)> {
    let now = state.clock.now();
    let year = params.year.unwrap_or(now.year());
    let quarter = params.quarter.unwrap_or_else(|| periods::current_quarter(now));
    periods::quarterly(
        state.store.as_ref(),
        user_id,
        year,
        quarter,
        state.config.analytics.scan_cap,
    )
    .await
    .map(Json)
    .map_err(|e| reject("quarterly_analytics", e))
}
