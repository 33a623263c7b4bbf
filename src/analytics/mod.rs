//! Dashboard analytics over the prediction log.

pub mod dashboard;
mod dto;
pub mod filter;
pub mod handlers;
pub mod normalize;
pub mod periods;

use axum::{http::StatusCode, Router};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

use crate::state::AppState;

/// Confidence at or above this counts as a successful prediction.
pub const SUCCESS_THRESHOLD: f64 = 0.70;

/// Price used to turn a yield into an estimated revenue (INR per kg).
pub const REVENUE_PER_UNIT: f64 = 20.0;

pub const CURRENCY: &str = "INR";

/// How many recent predictions the personal dashboard lists.
pub const RECENT_LIMIT: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("User not found")]
    UserNotFound,
    #[error("{0}")]
    InvalidPeriod(String),
    #[error("{0}")]
    InvalidFilter(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl AnalyticsError {
    pub fn status(&self) -> StatusCode {
        match self {
            AnalyticsError::UserNotFound => StatusCode::NOT_FOUND,
            AnalyticsError::InvalidPeriod(_) | AnalyticsError::InvalidFilter(_) => {
                StatusCode::BAD_REQUEST
            }
            AnalyticsError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn router() -> Router<AppState> {
    handlers::analytics_routes()
}

/// `success / total` as a percentage; 0 for an empty window.
pub fn success_rate(success: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        success as f64 / total as f64 * 100.0
    }
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

const LONG_DATE: &[FormatItem<'static>] = format_description!("[month repr:long] [day], [year]");
const LONG_DATE_TIME: &[FormatItem<'static>] =
    format_description!("[month repr:long] [day], [year] at [hour repr:12]:[minute] [period]");
const MONTH_YEAR: &[FormatItem<'static>] = format_description!("[month repr:long] [year]");

pub(crate) fn iso_date(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// "February 14, 2025"
pub(crate) fn long_date(at: OffsetDateTime) -> String {
    at.format(LONG_DATE).unwrap_or_default()
}

/// "February 14, 2025 at 09:30 AM"
pub(crate) fn long_date_time(at: OffsetDateTime) -> String {
    at.format(LONG_DATE_TIME).unwrap_or_default()
}

pub(crate) fn month_year(at: OffsetDateTime) -> String {
    at.format(MONTH_YEAR).unwrap_or_default()
}
