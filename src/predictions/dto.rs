use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::repo_types::Fields;

/// Request body for POST /predict-yield. Missing features take field averages.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct YieldRequest {
    pub rainfall: Option<f64>,
    pub temperature: Option<f64>,
    pub nitrogen: Option<f64>,
    pub phosphorus: Option<f64>,
    pub potassium: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub humidity: Option<f64>,
}

impl YieldRequest {
    pub fn features(&self) -> [f64; 7] {
        [
            self.rainfall.unwrap_or(1500.0),
            self.temperature.unwrap_or(25.0),
            self.nitrogen.unwrap_or(80.0),
            self.phosphorus.unwrap_or(50.0),
            self.potassium.unwrap_or(50.0),
            self.soil_moisture.unwrap_or(50.0),
            self.humidity.unwrap_or(65.0),
        ]
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CropRequest {
    pub nitrogen: Option<f64>,
    pub phosphorus: Option<f64>,
    pub potassium: Option<f64>,
    pub temperature: Option<f64>,
    pub ph: Option<f64>,
    pub rainfall: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npk_ratio: Option<f64>,
}

impl CropRequest {
    /// Feature order: N, P, K, temperature, pH, rainfall, npk_ratio.
    pub fn features(&self) -> [f64; 7] {
        let n = self.nitrogen.unwrap_or(80.0);
        let p = self.phosphorus.unwrap_or(40.0);
        let k = self.potassium.unwrap_or(40.0);
        [
            n,
            p,
            k,
            self.temperature.unwrap_or(25.0),
            self.ph.unwrap_or(7.0),
            self.rainfall.unwrap_or(1200.0),
            self.npk_ratio.unwrap_or((n + p + k) / 3.0),
        ]
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RiskRequest {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub rainfall: Option<f64>,
    pub crop_age: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub nitrogen: Option<f64>,
    pub phosphorus: Option<f64>,
    pub potassium: Option<f64>,
    pub soil_ph: Option<f64>,
    pub soil_drainage: Option<f64>,
}

impl RiskRequest {
    pub fn features(&self) -> [f64; 10] {
        [
            self.temperature.unwrap_or(25.0),
            self.humidity.unwrap_or(65.0),
            self.rainfall.unwrap_or(100.0),
            self.crop_age.unwrap_or(50.0),
            self.soil_moisture.unwrap_or(50.0),
            self.nitrogen.unwrap_or(80.0),
            self.phosphorus.unwrap_or(40.0),
            self.potassium.unwrap_or(40.0),
            self.soil_ph.unwrap_or(7.0),
            self.soil_drainage.unwrap_or(75.0),
        ]
    }
}

#[derive(Debug, Serialize)]
pub struct YieldResponse {
    #[serde(rename = "yield")]
    pub yield_value: f64,
    pub unit: &'static str,
    pub confidence: f64,
    pub model_status: &'static str,
    pub saved: bool,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CropScore {
    pub crop: String,
    pub confidence: f64,
}

#[derive(Debug, Serialize)]
pub struct CropResponse {
    pub recommended_crop: String,
    pub confidence: f64,
    pub model_status: &'static str,
    pub top_3: Vec<CropScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_error: Option<String>,
    pub saved: bool,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RiskResponse {
    pub risk_level: &'static str,
    pub confidence: f64,
    pub model_status: &'static str,
    pub recommendations: &'static [&'static str],
    pub saved: bool,
    pub message: &'static str,
}

/// Body of POST /save-detailed-prediction, as sent by the web form.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedRequest {
    pub crop_type: Option<String>,
    pub season: Option<String>,
    pub location: Option<String>,
    pub region: Option<String>,
    pub land_area: Option<f64>,
    pub land_area_unit: Option<String>,
    #[serde(rename = "soilPH")]
    pub soil_ph: Option<f64>,
    pub nitrogen: Option<f64>,
    pub phosphorus: Option<f64>,
    pub potassium: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub rainfall: Option<f64>,
    #[serde(default)]
    pub result: Fields,
}

#[derive(Debug, Serialize)]
pub struct SavedDetailed {
    pub success: bool,
    pub prediction_id: Uuid,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub name: &'static str,
    pub loaded: bool,
    pub features: usize,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub model_dir: String,
    pub loaded: usize,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldMetrics {
    pub samples: usize,
    pub features_used: Vec<&'static str>,
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CropMetrics {
    pub samples: usize,
    pub features_used: Vec<&'static str>,
    pub classes: Vec<String>,
    pub accuracy: f64,
}

/// Body of GET /monitor. A model without a usable split reports `null`.
#[derive(Debug, Serialize)]
pub struct MonitorResponse {
    pub yield_model: Option<YieldMetrics>,
    pub crop_model: Option<CropMetrics>,
}
