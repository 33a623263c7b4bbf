use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

/// Loosely-typed key/value mapping as stored in prediction documents.
pub type Fields = Map<String, Value>;

/// Discriminator stored in the `prediction_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    Yield,
    Crop,
    Risk,
    YieldDetailed,
}

impl PredictionKind {
    pub const ALL: [PredictionKind; 4] = [
        PredictionKind::Yield,
        PredictionKind::Crop,
        PredictionKind::Risk,
        PredictionKind::YieldDetailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionKind::Yield => "yield",
            PredictionKind::Crop => "crop",
            PredictionKind::Risk => "risk",
            PredictionKind::YieldDetailed => "yield_detailed",
        }
    }
}

impl fmt::Display for PredictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yield" => Ok(PredictionKind::Yield),
            "crop" => Ok(PredictionKind::Crop),
            "risk" => Ok(PredictionKind::Risk),
            "yield_detailed" => Ok(PredictionKind::YieldDetailed),
            other => anyhow::bail!("unknown prediction kind: {other}"),
        }
    }
}

/// Kinds that use the basic record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicKind {
    Yield,
    Crop,
    Risk,
}

impl From<BasicKind> for PredictionKind {
    fn from(kind: BasicKind) -> Self {
        match kind {
            BasicKind::Yield => PredictionKind::Yield,
            BasicKind::Crop => PredictionKind::Crop,
            BasicKind::Risk => PredictionKind::Risk,
        }
    }
}

/// Whether a basic prediction came from a trained artifact or the fallback heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvenance {
    Trained,
    Mock,
}

impl ModelProvenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvenance::Trained => "trained",
            ModelProvenance::Mock => "mock",
        }
    }
}

/// Output of one of the three tabular predictors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BasicPrediction {
    #[serde(default)]
    pub input_data: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Fields>,
    /// Older documents kept their output here instead of `output_data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_result: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<ModelProvenance>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SoilParameters {
    pub ph: Option<f64>,
    pub nitrogen: Option<f64>,
    pub phosphorus: Option<f64>,
    pub potassium: Option<f64>,
    pub moisture: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeatherParameters {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub rainfall: Option<f64>,
}

/// Field-level yield estimate saved from the detailed prediction form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetailedPrediction {
    #[serde(default)]
    pub crop_type: Option<String>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub land_area: Option<f64>,
    #[serde(default)]
    pub land_area_unit: Option<String>,
    #[serde(default)]
    pub soil_parameters: SoilParameters,
    #[serde(default)]
    pub weather_parameters: WeatherParameters,
    #[serde(default)]
    pub prediction_result: Fields,
}

/// The two record shapes sharing the predictions collection.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionBody {
    Basic { kind: BasicKind, data: BasicPrediction },
    Detailed(DetailedPrediction),
}

impl PredictionBody {
    pub fn kind(&self) -> PredictionKind {
        match self {
            PredictionBody::Basic { kind, .. } => (*kind).into(),
            PredictionBody::Detailed(_) => PredictionKind::YieldDetailed,
        }
    }

    /// Rebuild a body from its stored discriminator and JSON document.
    pub fn from_document(kind: PredictionKind, document: Value) -> anyhow::Result<Self> {
        let basic_kind = match kind {
            PredictionKind::Yield => BasicKind::Yield,
            PredictionKind::Crop => BasicKind::Crop,
            PredictionKind::Risk => BasicKind::Risk,
            PredictionKind::YieldDetailed => {
                return Ok(PredictionBody::Detailed(serde_json::from_value(document)?));
            }
        };
        Ok(PredictionBody::Basic {
            kind: basic_kind,
            data: serde_json::from_value(document)?,
        })
    }

    pub fn to_document(&self) -> serde_json::Result<Value> {
        match self {
            PredictionBody::Basic { data, .. } => serde_json::to_value(data),
            PredictionBody::Detailed(data) => serde_json::to_value(data),
        }
    }

    /// The mapping that holds the model output for this shape.
    pub fn output(&self) -> Option<&Fields> {
        match self {
            PredictionBody::Basic { data, .. } => {
                data.output_data.as_ref().or(data.prediction_result.as_ref())
            }
            PredictionBody::Detailed(data) => Some(&data.prediction_result),
        }
    }

    pub fn output_number(&self, key: &str) -> Option<f64> {
        self.output().and_then(|fields| number(fields, key))
    }

    pub fn output_text(&self, key: &str) -> Option<&str> {
        self.output().and_then(|fields| text(fields, key))
    }

    pub fn confidence(&self) -> Option<f64> {
        self.output_number("confidence")
    }

    pub fn model_type(&self) -> Option<ModelProvenance> {
        match self {
            PredictionBody::Basic { data, .. } => data.model_type,
            PredictionBody::Detailed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub body: PredictionBody,
    pub created_at: OffsetDateTime,
}

impl PredictionRecord {
    pub fn kind(&self) -> PredictionKind {
        self.body.kind()
    }
}

/// A record about to be appended; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewPrediction {
    pub user_id: Uuid,
    pub body: PredictionBody,
}

pub fn number(fields: &Fields, key: &str) -> Option<f64> {
    fields.get(key).and_then(Value::as_f64)
}

pub fn text<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parses_and_displays() {
        for kind in PredictionKind::ALL {
            assert_eq!(kind.as_str().parse::<PredictionKind>().unwrap(), kind);
        }
        assert!("harvest".parse::<PredictionKind>().is_err());
    }

    #[test]
    fn detailed_document_tolerates_missing_fields() {
        let body =
            PredictionBody::from_document(PredictionKind::YieldDetailed, json!({ "season": "Kharif" }))
                .expect("partial document decodes");
        match body {
            PredictionBody::Detailed(d) => {
                assert_eq!(d.season.as_deref(), Some("Kharif"));
                assert!(d.crop_type.is_none());
                assert!(d.prediction_result.is_empty());
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn basic_output_falls_back_to_legacy_result() {
        let body = PredictionBody::from_document(
            PredictionKind::Yield,
            json!({ "prediction_result": { "yield": 3200.0, "confidence": 0.8 } }),
        )
        .unwrap();
        assert_eq!(body.kind(), PredictionKind::Yield);
        assert_eq!(body.output_number("yield"), Some(3200.0));
        assert_eq!(body.confidence(), Some(0.8));
        assert_eq!(body.model_type(), None);
    }
}
