use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::normalize::NormalizedView;
use crate::predictions::repo_types::{ModelProvenance, PredictionKind};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DashboardStats {
    Aggregate(AggregateStats),
    Personal(PersonalStats),
}

#[derive(Debug, Serialize)]
pub struct AggregateStats {
    pub total_predictions: u64,
    pub avg_yield: f64,
    pub success_rate: f64,
    pub active_farmers: u64,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PersonalStats {
    pub user: UserSummary,
    pub year_summary: YearSummary,
    pub statistics: PersonalStatistics,
    pub crop_distribution: Vec<CropCount>,
    pub recent_predictions: Vec<RecentPrediction>,
}

#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub name: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Default, Serialize)]
pub struct YearSummary {
    pub year: i32,
    pub total_predictions: u64,
    pub yield_predictions: u64,
    pub crop_predictions: u64,
    pub risk_predictions: u64,
    pub detailed_predictions: u64,
}

#[derive(Debug, Serialize)]
pub struct PersonalStatistics {
    pub avg_yield: f64,
    pub top_crop: String,
    pub crop_count: usize,
    pub success_count: u64,
    pub success_rate: f64,
    pub total_predictions_all_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CropCount {
    pub crop: String,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct RecentPrediction {
    pub id: Uuid,
    pub prediction_type: PredictionKind,
    pub output_data: Value,
    pub model_type: Option<ModelProvenance>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Raw filter query; every field is parsed leniently.
#[derive(Debug, Default, Deserialize)]
pub struct FilterParams {
    pub crop: Option<String>,
    pub season: Option<String>,
    pub location: Option<String>,
    pub region: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub min_revenue: Option<String>,
    pub max_revenue: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FilteredPrediction {
    pub id: Uuid,
    #[serde(flatten)]
    pub view: NormalizedView,
    pub date: String,
    pub formatted_date: String,
}

#[derive(Debug, Serialize)]
pub struct FilteredPredictions {
    pub count: usize,
    pub predictions: Vec<FilteredPrediction>,
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}
fn default_page() -> i64 { 1 }
fn default_page_limit() -> i64 { 20 }

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}
fn default_history_limit() -> i64 { 100 }

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: PredictionKind,
    pub input_data: Value,
    pub output_data: Value,
    pub model_type: &'static str,
    pub date: String,
    pub formatted_date: String,
}

#[derive(Debug, Serialize)]
pub struct PageInfo {
    pub page: i64,
    pub limit: i64,
    pub total: u64,
    pub pages: u64,
}

#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub predictions: Vec<HistoryItem>,
    pub pagination: PageInfo,
}

#[derive(Debug, Serialize)]
pub struct HistorySummary {
    pub count: usize,
    pub summary: BTreeMap<String, u64>,
    pub predictions: Vec<HistoryItem>,
}

#[derive(Debug, Deserialize)]
pub struct PeriodParams {
    pub year: Option<i32>,
    pub quarter: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonthCounts {
    #[serde(rename = "yield")]
    pub yield_count: u64,
    pub crop: u64,
    pub risk: u64,
    pub yield_detailed: u64,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct YearlySummary {
    pub total_predictions: u64,
    pub avg_yield: f64,
    pub estimated_revenue: f64,
    pub currency: &'static str,
}

#[derive(Debug, Serialize)]
pub struct YearlyAnalytics {
    pub year: i32,
    pub summary: YearlySummary,
    pub monthly_breakdown: BTreeMap<u8, MonthCounts>,
    pub quarterly_breakdown: BTreeMap<String, u64>,
    pub crop_distribution: BTreeMap<String, u64>,
    pub risk_distribution: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct QuarterlyAnalytics {
    pub year: i32,
    pub quarter: String,
    pub period: String,
    pub total_predictions: u64,
    pub avg_yield: f64,
    pub revenue: f64,
    pub crops_recommended: Vec<String>,
    pub monthly_breakdown: BTreeMap<u8, MonthCounts>,
    pub crop_distribution: BTreeMap<String, u64>,
    pub risk_distribution: BTreeMap<String, u64>,
    pub currency: &'static str,
}
