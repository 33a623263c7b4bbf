use std::collections::BTreeMap;

use serde_json::{json, Value};
use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, OffsetDateTime,
    PrimitiveDateTime, Time,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::dto::{
    FilterParams, FilteredPrediction, FilteredPredictions, HistoryItem, HistoryParams,
    HistorySummary, HistoryPage, PageInfo, PageParams,
};
use super::normalize::{normalize, NormalizedView};
use super::{iso_date, long_date, long_date_time, AnalyticsError};
use crate::predictions::repo_types::{PredictionBody, PredictionKind, PredictionRecord};
use crate::store::{FindOptions, RecordQuery, RecordStore};

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Parsed search predicates. `None` means "don't filter on this".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionFilter {
    pub crop: Option<String>,
    pub season: Option<String>,
    /// Stored lowercased; matched as a substring.
    pub location: Option<String>,
    pub region: Option<String>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub min_revenue: Option<f64>,
    pub max_revenue: Option<f64>,
}

impl PredictionFilter {
    /// Malformed dates and amounts are logged and dropped.
    pub fn from_params(params: &FilterParams) -> Self {
        Self {
            crop: present(&params.crop).map(str::to_string),
            season: present(&params.season).map(str::to_string),
            location: present(&params.location).map(str::to_lowercase),
            region: present(&params.region).map(str::to_string),
            start: present(&params.start_date)
                .and_then(|raw| lenient("start_date", raw, parse_datetime(raw))),
            end: present(&params.end_date)
                .and_then(|raw| lenient("end_date", raw, parse_datetime(raw))),
            min_revenue: present(&params.min_revenue)
                .and_then(|raw| lenient("min_revenue", raw, parse_amount(raw))),
            max_revenue: present(&params.max_revenue)
                .and_then(|raw| lenient("max_revenue", raw, parse_amount(raw))),
        }
    }

    /// The part of the filter the store can evaluate.
    pub fn store_query(&self, owner: Uuid) -> RecordQuery {
        RecordQuery {
            owner: Some(owner),
            since: self.start,
            until: self.end,
            ..RecordQuery::default()
        }
    }

    pub fn matches(&self, view: &NormalizedView) -> bool {
        self.crop.as_ref().map_or(true, |c| &view.crop_type == c)
            && self.season.as_ref().map_or(true, |s| &view.season == s)
            && self
                .location
                .as_ref()
                .map_or(true, |l| view.location.to_lowercase().contains(l.as_str()))
            && self.region.as_ref().map_or(true, |r| &view.region == r)
            && self.min_revenue.map_or(true, |min| view.revenue_estimate >= min)
            && self.max_revenue.map_or(true, |max| view.revenue_estimate <= max)
    }
}

fn present(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn lenient<T>(field: &'static str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(field, value = raw, "ignoring malformed filter value");
    }
    parsed
}

/// NaN and infinities never compare usefully, so they count as malformed.
fn parse_amount(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a bare
/// date at midnight UTC.
fn parse_datetime(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(at) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(at);
    }
    let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    if let Ok(at) = PrimitiveDateTime::parse(raw, naive) {
        return Some(at.assume_utc());
    }
    let date = Date::parse(raw, format_description!("[year]-[month]-[day]")).ok()?;
    Some(date.with_time(Time::MIDNIGHT).assume_utc())
}

/// Owner's records matching every predicate, newest first.
pub async fn filter_predictions(
    store: &dyn RecordStore,
    owner: Uuid,
    filter: &PredictionFilter,
    scan_cap: i64,
) -> Result<FilteredPredictions, AnalyticsError> {
    let records = store
        .find(&filter.store_query(owner), FindOptions::newest(scan_cap))
        .await?;
    let scanned = records.len();

    let predictions: Vec<FilteredPrediction> = records
        .iter()
        .filter_map(|record| {
            let view = normalize(record);
            filter.matches(&view).then(|| FilteredPrediction {
                id: record.id,
                date: iso_date(record.created_at),
                formatted_date: long_date(record.created_at),
                view,
            })
        })
        .collect();

    debug!(%owner, scanned, matched = predictions.len(), "filtered predictions");
    Ok(FilteredPredictions {
        count: predictions.len(),
        predictions,
    })
}

/// `None` and `"all"` mean every kind.
fn parse_kind(raw: Option<&str>) -> Result<Option<PredictionKind>, AnalyticsError> {
    match raw.map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some(other) => other
            .parse::<PredictionKind>()
            .map(Some)
            .map_err(|e| AnalyticsError::InvalidFilter(e.to_string())),
    }
}

/// One page of the owner's history, newest first.
pub async fn paginate_history(
    store: &dyn RecordStore,
    owner: Uuid,
    params: &PageParams,
) -> Result<HistoryPage, AnalyticsError> {
    let page = params.page.max(1);
    let limit = params.limit.clamp(1, MAX_PAGE_LIMIT);
    let mut query = RecordQuery::owned_by(owner);
    if let Some(kind) = parse_kind(params.kind.as_deref())? {
        query = query.kind(kind);
    }

    let total = store.count(&query).await?;
    let records = store
        .find(&query, FindOptions::newest(limit).skip((page - 1).saturating_mul(limit)))
        .await?;

    Ok(HistoryPage {
        predictions: records.iter().map(history_item).collect(),
        pagination: PageInfo {
            page,
            limit,
            total,
            pages: total.div_ceil(limit as u64),
        },
    })
}

/// Latest records plus a per-kind tally of what was returned.
pub async fn prediction_history(
    store: &dyn RecordStore,
    owner: Uuid,
    params: &HistoryParams,
    scan_cap: i64,
) -> Result<HistorySummary, AnalyticsError> {
    let mut query = RecordQuery::owned_by(owner);
    if let Some(kind) = parse_kind(params.kind.as_deref())? {
        query = query.kind(kind);
    }
    let limit = params.limit.clamp(1, scan_cap.max(1));
    let records = store.find(&query, FindOptions::newest(limit)).await?;

    let mut summary: BTreeMap<String, u64> = BTreeMap::new();
    for record in &records {
        *summary.entry(record.kind().to_string()).or_default() += 1;
    }
    Ok(HistorySummary {
        count: records.len(),
        summary,
        predictions: records.iter().map(history_item).collect(),
    })
}

fn history_item(record: &PredictionRecord) -> HistoryItem {
    let input_data = match &record.body {
        PredictionBody::Basic { data, .. } => Value::Object(data.input_data.clone()),
        PredictionBody::Detailed(d) => json!({
            "crop_type": d.crop_type,
            "season": d.season,
            "location": d.location,
            "region": d.region,
            "land_area": d.land_area,
            "land_area_unit": d.land_area_unit,
            "soil_parameters": d.soil_parameters,
            "weather_parameters": d.weather_parameters,
        }),
    };
    HistoryItem {
        id: record.id,
        kind: record.kind(),
        input_data,
        output_data: record
            .body
            .output()
            .cloned()
            .map(Value::Object)
            .unwrap_or_else(|| json!({})),
        model_type: record
            .body
            .model_type()
            .map(|m| m.as_str())
            .unwrap_or("unknown"),
        date: iso_date(record.created_at),
        formatted_date: long_date_time(record.created_at),
    }
}
