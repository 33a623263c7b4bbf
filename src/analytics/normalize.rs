use serde::Serialize;
use time::OffsetDateTime;

use super::REVENUE_PER_UNIT;
use crate::predictions::repo_types::{number, BasicPrediction, DetailedPrediction, PredictionBody, PredictionRecord};

/// Canonical analytics shape both record variants are projected into.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedView {
    pub crop_type: String,
    pub season: String,
    pub location: String,
    pub region: String,
    pub land_area: f64,
    pub land_area_unit: String,
    #[serde(rename = "yield")]
    pub yield_value: f64,
    #[serde(rename = "revenue")]
    pub revenue_estimate: f64,
    pub confidence: f64,
    #[serde(skip)]
    pub created_at: OffsetDateTime,
}

pub fn normalize(record: &PredictionRecord) -> NormalizedView {
    match &record.body {
        PredictionBody::Detailed(d) => from_detailed(d, record.created_at),
        PredictionBody::Basic { data, .. } => from_basic(data, record.created_at),
    }
}

fn from_detailed(d: &DetailedPrediction, created_at: OffsetDateTime) -> NormalizedView {
    let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "Unknown".to_string());
    let result = &d.prediction_result;
    NormalizedView {
        crop_type: or_unknown(&d.crop_type),
        season: or_unknown(&d.season),
        location: or_unknown(&d.location),
        region: or_unknown(&d.region),
        land_area: d.land_area.unwrap_or(0.0),
        land_area_unit: d.land_area_unit.clone().unwrap_or_else(|| "acres".to_string()),
        yield_value: number(result, "yield").unwrap_or(0.0),
        revenue_estimate: number(result, "revenue").unwrap_or(0.0),
        confidence: number(result, "confidence").unwrap_or(0.0),
        created_at,
    }
}

fn from_basic(b: &BasicPrediction, created_at: OffsetDateTime) -> NormalizedView {
    let output = b.output_data.as_ref().or(b.prediction_result.as_ref());
    let read = |key: &str| output.and_then(|fields| number(fields, key));
    let yield_value = read("yield").unwrap_or(0.0);
    NormalizedView {
        crop_type: "Mixed".to_string(),
        season: "All Seasons".to_string(),
        location: "Various Locations".to_string(),
        region: "Multiple Regions".to_string(),
        land_area: 1.0,
        land_area_unit: "acre".to_string(),
        yield_value,
        revenue_estimate: read("revenue").unwrap_or(yield_value * REVENUE_PER_UNIT),
        confidence: read("confidence").unwrap_or(0.0),
        created_at,
    }
}
