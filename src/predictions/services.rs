use std::path::Path;

use rand::{seq::SliceRandom, Rng};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::dto::{
    CropMetrics, CropRequest, CropScore, DetailedRequest, MonitorResponse, RiskRequest,
    YieldMetrics, YieldRequest,
};
use super::models::{
    read_split, ClassifierModel, ModelError, ModelSet, TestSplit, YieldModel, CROP_COLUMNS,
    SPLITS_DIR, YIELD_COLUMNS,
};
use super::repo_types::{
    BasicKind, BasicPrediction, DetailedPrediction, Fields, ModelProvenance, NewPrediction,
    PredictionBody, PredictionRecord, SoilParameters, WeatherParameters,
};
use crate::store::{RecordStore, UserCounter};

pub const MIN_YIELD: f64 = 1500.0;
pub const MAX_YIELD: f64 = 8000.0;
pub const MOCK_CROPS: [&str; 6] = ["rice", "wheat", "maize", "sugarcane", "cotton", "soybean"];

#[derive(Debug, Clone, PartialEq)]
pub struct YieldEstimate {
    pub value: f64,
    pub confidence: f64,
    pub provenance: ModelProvenance,
}

/// kg/hectare, always within `MIN_YIELD..=MAX_YIELD`.
pub fn estimate_yield<R: Rng + ?Sized>(
    models: &ModelSet,
    req: &YieldRequest,
    rng: &mut R,
) -> YieldEstimate {
    let trained = models
        .yield_model
        .as_ref()
        .map(|model| model.predict(&req.features()));
    let (value, confidence, provenance) = match trained {
        Some(Ok(value)) => (value, 0.92, ModelProvenance::Trained),
        Some(Err(e)) => {
            warn!(error = %e, "yield model failed; using fallback");
            (rng.gen_range(4000.0..5000.0), 0.70, ModelProvenance::Mock)
        }
        None => (rng.gen_range(4000.0..5000.0), 0.70, ModelProvenance::Mock),
    };
    YieldEstimate {
        value: value.clamp(MIN_YIELD, MAX_YIELD),
        confidence,
        provenance,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CropEstimate {
    pub crop: String,
    pub confidence: f64,
    pub top: Vec<CropScore>,
    pub provenance: ModelProvenance,
    pub model_error: Option<String>,
}

fn score(crop: &str, confidence: f64) -> CropScore {
    CropScore {
        crop: crop.to_string(),
        confidence: crate::analytics::round_to(confidence, 3),
    }
}

pub fn recommend_crop<R: Rng + ?Sized>(
    models: &ModelSet,
    req: &CropRequest,
    rng: &mut R,
) -> CropEstimate {
    let Some(model) = models.crop_model.as_ref() else {
        return mock_crop(rng);
    };
    match model.rank(&req.features()) {
        Ok(ranked) if !ranked.is_empty() => CropEstimate {
            crop: ranked[0].0.clone(),
            confidence: ranked[0].1 * 0.95,
            top: ranked.iter().take(3).map(|(c, p)| score(c, *p)).collect(),
            provenance: ModelProvenance::Trained,
            model_error: None,
        },
        Ok(_) => mock_crop(rng),
        Err(e) => {
            warn!(error = %e, "crop model failed; using fallback");
            CropEstimate {
                crop: "rice".into(),
                confidence: 0.70,
                top: vec![score("rice", 0.70), score("wheat", 0.20), score("maize", 0.10)],
                provenance: ModelProvenance::Mock,
                model_error: Some(e.to_string()),
            }
        }
    }
}

fn mock_crop<R: Rng + ?Sized>(rng: &mut R) -> CropEstimate {
    let confidence = rng.gen_range(0.6..0.85);
    let picks: Vec<&str> = MOCK_CROPS.choose_multiple(rng, 3).copied().collect();
    let mut top = vec![score(picks[0], confidence)];
    let mut runner_up: f64 = rng.gen_range(0.0..(1.0 - confidence));
    for crop in &picks[1..] {
        top.push(score(crop, runner_up));
        runner_up = rng.gen_range(0.0..=runner_up);
    }
    CropEstimate {
        crop: picks[0].to_string(),
        confidence,
        top,
        provenance: ModelProvenance::Mock,
        model_error: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        if score > 70 {
            RiskLevel::High
        } else if score > 40 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }

    pub fn recommendations(&self) -> &'static [&'static str] {
        match self {
            RiskLevel::Low => &[
                "Continue current farming practices",
                "Monitor soil health regularly",
            ],
            RiskLevel::Medium => &[
                "Improve irrigation system",
                "Consider crop rotation",
                "Monitor pest activity",
            ],
            RiskLevel::High => &[
                "Urgent soil testing required",
                "Change crop variety",
                "Consult agricultural officer",
                "Consider insurance",
            ],
        }
    }
}

/// Additive score from weather and soil stress; 0 means no warning signs.
pub fn heuristic_risk_score(req: &RiskRequest) -> u32 {
    let [temperature, humidity, rainfall, _, _, nitrogen, _, potassium, _, drainage] =
        req.features();
    let mut score = 0;

    let temp_diff = (temperature - 28.0).abs();
    if temp_diff > 10.0 {
        score += 35;
    } else if temp_diff > 5.0 {
        score += 15;
    }

    if humidity > 85.0 {
        score += 25;
    } else if humidity > 75.0 {
        score += 12;
    }

    if rainfall < 40.0 {
        score += 30;
    } else if rainfall < 60.0 {
        score += 15;
    } else if rainfall > 200.0 {
        score += 25;
    }

    if nitrogen < 40.0 {
        score += 20;
    }
    if potassium < 30.0 {
        score += 25;
    }
    if drainage < 50.0 {
        score += 20;
    }
    score
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskEstimate {
    pub level: RiskLevel,
    pub confidence: f64,
    pub provenance: ModelProvenance,
}

pub fn assess_risk(models: &ModelSet, req: &RiskRequest) -> RiskEstimate {
    if let Some(model) = models.risk_model.as_ref() {
        match model.rank(&req.features()) {
            Ok(ranked) => {
                let best = ranked
                    .first()
                    .and_then(|(label, p)| RiskLevel::parse(label).map(|level| (level, *p)));
                match best {
                    Some((level, p)) => {
                        return RiskEstimate {
                            level,
                            confidence: p * 0.95,
                            provenance: ModelProvenance::Trained,
                        }
                    }
                    None => warn!("risk model produced an unknown label; using fallback"),
                }
            }
            Err(e) => warn!(error = %e, "risk model failed; using fallback"),
        }
    }
    RiskEstimate {
        level: RiskLevel::from_score(heuristic_risk_score(req)),
        confidence: 0.72,
        provenance: ModelProvenance::Mock,
    }
}

/// Serializes a request body into the stored input mapping.
pub fn to_fields<T: Serialize>(value: &T) -> Fields {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => fields,
        _ => Fields::new(),
    }
}

/// Counter updates are best effort: the record is already stored.
async fn bump_counter(store: &dyn RecordStore, owner: Uuid) {
    if let Err(e) = store
        .increment(owner, UserCounter::TotalPredictions, 1)
        .await
    {
        warn!(error = %e, %owner, "failed to increment total_predictions");
    }
}

/// Appends a basic prediction for `owner` and bumps their counter.
pub async fn save_basic(
    store: &dyn RecordStore,
    owner: Uuid,
    kind: BasicKind,
    input_data: Fields,
    output_data: Value,
    provenance: ModelProvenance,
) -> anyhow::Result<PredictionRecord> {
    let output_data = match output_data {
        Value::Object(fields) => Some(fields),
        _ => None,
    };
    let record = store
        .insert_prediction(NewPrediction {
            user_id: owner,
            body: PredictionBody::Basic {
                kind,
                data: BasicPrediction {
                    input_data,
                    output_data,
                    prediction_result: None,
                    model_type: Some(provenance),
                },
            },
        })
        .await?;
    bump_counter(store, owner).await;
    debug!(%owner, id = %record.id, kind = %record.kind(), "prediction saved");
    Ok(record)
}

/// Appends a detailed prediction and records its crop and region on the owner.
pub async fn save_detailed(
    store: &dyn RecordStore,
    owner: Uuid,
    req: DetailedRequest,
) -> anyhow::Result<PredictionRecord> {
    let detailed = DetailedPrediction {
        crop_type: req.crop_type,
        season: req.season,
        location: req.location,
        region: req.region,
        land_area: req.land_area,
        land_area_unit: req.land_area_unit,
        soil_parameters: SoilParameters {
            ph: req.soil_ph,
            nitrogen: req.nitrogen,
            phosphorus: req.phosphorus,
            potassium: req.potassium,
            moisture: req.soil_moisture,
        },
        weather_parameters: WeatherParameters {
            temperature: req.temperature,
            humidity: req.humidity,
            rainfall: req.rainfall,
        },
        prediction_result: req.result,
    };
    let crop = detailed.crop_type.clone();
    let region = detailed.region.clone();

    let record = store
        .insert_prediction(NewPrediction {
            user_id: owner,
            body: PredictionBody::Detailed(detailed),
        })
        .await?;
    bump_counter(store, owner).await;
    if let Err(e) = store
        .track_usage(owner, crop.as_deref(), region.as_deref())
        .await
    {
        warn!(error = %e, %owner, "failed to track crop/region usage");
    }
    debug!(%owner, id = %record.id, "detailed prediction saved");
    Ok(record)
}

pub fn yield_output(estimate: &YieldEstimate) -> Value {
    json!({ "yield": estimate.value, "confidence": estimate.confidence })
}

pub fn crop_output(estimate: &CropEstimate) -> Value {
    json!({ "crop": estimate.crop, "confidence": estimate.confidence })
}

pub fn risk_output(estimate: &RiskEstimate) -> Value {
    json!({ "risk_level": estimate.level.as_str(), "confidence": estimate.confidence })
}

/// RMSE, MAE and R² of the yield model over a held-out split.
pub fn evaluate_yield(model: &YieldModel, split: &TestSplit) -> Result<YieldMetrics, ModelError> {
    let mut actual = Vec::with_capacity(split.targets.len());
    for raw in &split.targets {
        let value = raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ModelError::Invalid(format!("yield target `{raw}` is not a number")))?;
        actual.push(value);
    }
    let predicted = split
        .rows
        .iter()
        .map(|row| model.predict(row))
        .collect::<Result<Vec<_>, _>>()?;

    let n = actual.len() as f64;
    let mean = actual.iter().sum::<f64>() / n;
    let ss_res: f64 = actual.iter().zip(&predicted).map(|(y, p)| (y - p).powi(2)).sum();
    let ss_tot: f64 = actual.iter().map(|y| (y - mean).powi(2)).sum();
    let mae = actual.iter().zip(&predicted).map(|(y, p)| (y - p).abs()).sum::<f64>() / n;

    Ok(YieldMetrics {
        samples: actual.len(),
        features_used: split.features_used.clone(),
        rmse: (ss_res / n).sqrt(),
        mae,
        // constant targets leave R² undefined
        r2: if ss_tot == 0.0 { 0.0 } else { 1.0 - ss_res / ss_tot },
    })
}

/// Share of split rows whose top-ranked class matches the labelled crop.
pub fn evaluate_crop(model: &ClassifierModel, split: &TestSplit) -> Result<CropMetrics, ModelError> {
    let mut hits = 0usize;
    for (row, label) in split.rows.iter().zip(&split.targets) {
        let ranked = model.rank(row)?;
        if ranked
            .first()
            .is_some_and(|(crop, _)| crop.eq_ignore_ascii_case(label))
        {
            hits += 1;
        }
    }
    Ok(CropMetrics {
        samples: split.rows.len(),
        features_used: split.features_used.clone(),
        classes: model.classifier.classes.clone(),
        accuracy: hits as f64 / split.rows.len() as f64,
    })
}

async fn split_metrics<M, T>(
    model: Option<&M>,
    path: &Path,
    features: &[&'static str],
    target: &str,
    evaluate: impl Fn(&M, &TestSplit) -> Result<T, ModelError>,
) -> Option<T> {
    let model = model?;
    if !path.is_file() {
        debug!(path = %path.display(), "no test split");
        return None;
    }
    match read_split(path, features, target)
        .await
        .and_then(|split| evaluate(model, &split))
    {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "model evaluation failed");
            None
        }
    }
}

/// Evaluates the loaded yield and crop models against `<model_dir>/splits/`.
pub async fn monitor(models: &ModelSet, model_dir: &Path) -> MonitorResponse {
    let splits = model_dir.join(SPLITS_DIR);
    MonitorResponse {
        yield_model: split_metrics(
            models.yield_model.as_ref(),
            &splits.join("test_yield.csv"),
            &YIELD_COLUMNS,
            "yield",
            evaluate_yield,
        )
        .await,
        crop_model: split_metrics(
            models.crop_model.as_ref(),
            &splits.join("test_crop.csv"),
            &CROP_COLUMNS,
            "crop",
            evaluate_crop,
        )
        .await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_types::NewUser;
    use crate::predictions::models::{
        ClassifierModel, LinearRegressor, SoftmaxClassifier, StandardScaler, YieldModel,
    };
    use crate::store::{MemoryStore, RecordQuery};
    use rand::{rngs::StdRng, SeedableRng};

    fn scaler(n: usize) -> StandardScaler {
        StandardScaler {
            mean: vec![0.0; n],
            scale: vec![1.0; n],
        }
    }

    fn classifier(n: usize, classes: &[&str], winner: usize) -> ClassifierModel {
        ClassifierModel {
            scaler: scaler(n),
            classifier: SoftmaxClassifier {
                classes: classes.iter().map(|c| c.to_string()).collect(),
                weights: vec![vec![0.0; n]; classes.len()],
                intercepts: (0..classes.len())
                    .map(|i| if i == winner { 3.0 } else { 0.0 })
                    .collect(),
            },
        }
    }

    #[test]
    fn mock_yield_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let est = estimate_yield(&ModelSet::default(), &YieldRequest::default(), &mut rng);
            assert!((MIN_YIELD..=MAX_YIELD).contains(&est.value));
            assert_eq!(est.confidence, 0.70);
            assert_eq!(est.provenance, ModelProvenance::Mock);
        }
    }

    #[test]
    fn trained_yield_is_clamped() {
        let models = ModelSet {
            yield_model: Some(YieldModel {
                scaler: scaler(7),
                regressor: LinearRegressor {
                    coefficients: vec![0.0; 7],
                    intercept: 12_000.0,
                },
            }),
            ..ModelSet::default()
        };
        let est = estimate_yield(&models, &YieldRequest::default(), &mut StdRng::seed_from_u64(1));
        assert_eq!(est.value, MAX_YIELD);
        assert_eq!(est.confidence, 0.92);
        assert_eq!(est.provenance, ModelProvenance::Trained);
    }

    #[test]
    fn trained_crop_returns_top_three() {
        let models = ModelSet {
            crop_model: Some(classifier(7, &["rice", "wheat", "maize", "cotton"], 2)),
            ..ModelSet::default()
        };
        let est = recommend_crop(&models, &CropRequest::default(), &mut StdRng::seed_from_u64(1));
        assert_eq!(est.crop, "maize");
        assert_eq!(est.top.len(), 3);
        assert_eq!(est.top[0].crop, "maize");
        assert!(est.confidence < est.top[0].confidence);
        assert_eq!(est.provenance, ModelProvenance::Trained);
    }

    #[test]
    fn mismatched_crop_model_falls_back_with_error() {
        let models = ModelSet {
            crop_model: Some(classifier(3, &["rice"], 0)),
            ..ModelSet::default()
        };
        let est = recommend_crop(&models, &CropRequest::default(), &mut StdRng::seed_from_u64(1));
        assert_eq!(est.crop, "rice");
        assert_eq!(est.confidence, 0.70);
        assert!(est.model_error.is_some());
    }

    #[test]
    fn mock_crop_picks_distinct_known_crops() {
        let mut rng = StdRng::seed_from_u64(42);
        let est = recommend_crop(&ModelSet::default(), &CropRequest::default(), &mut rng);
        assert!(MOCK_CROPS.contains(&est.crop.as_str()));
        assert!((0.6..0.85).contains(&est.confidence));
        assert_eq!(est.top.len(), 3);
        assert_ne!(est.top[0].crop, est.top[1].crop);
        assert!(est.top[1].confidence >= est.top[2].confidence);
    }

    #[test]
    fn risk_heuristic_scores_stress() {
        assert_eq!(heuristic_risk_score(&RiskRequest::default()), 0);
        let dry_hot = RiskRequest {
            temperature: Some(40.0),
            rainfall: Some(30.0),
            potassium: Some(20.0),
            ..RiskRequest::default()
        };
        assert_eq!(heuristic_risk_score(&dry_hot), 35 + 30 + 25);
        let est = assess_risk(&ModelSet::default(), &dry_hot);
        assert_eq!(est.level, RiskLevel::High);
        assert_eq!(est.level.recommendations().len(), 4);
        assert_eq!(RiskLevel::from_score(41), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(40), RiskLevel::Low);
    }

    #[test]
    fn trained_risk_labels_are_case_insensitive() {
        let models = ModelSet {
            risk_model: Some(classifier(10, &["low", "medium", "high"], 1)),
            ..ModelSet::default()
        };
        let est = assess_risk(&models, &RiskRequest::default());
        assert_eq!(est.level, RiskLevel::Medium);
        assert_eq!(est.provenance, ModelProvenance::Trained);
    }

    async fn farmer(store: &MemoryStore) -> Uuid {
        store
            .create_user(NewUser {
                name: "Ravi".into(),
                email: "ravi@example.com".into(),
                national_id: "999988887777".into(),
                password_hash: "x".into(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn saving_appends_and_counts() {
        let store = MemoryStore::new();
        let owner = farmer(&store).await;
        let est = YieldEstimate {
            value: 4321.0,
            confidence: 0.92,
            provenance: ModelProvenance::Trained,
        };
        let record = save_basic(
            &store,
            owner,
            BasicKind::Yield,
            to_fields(&YieldRequest {
                rainfall: Some(900.0),
                ..YieldRequest::default()
            }),
            yield_output(&est),
            est.provenance,
        )
        .await
        .unwrap();

        assert_eq!(record.body.output_number("yield"), Some(4321.0));
        assert_eq!(record.body.model_type(), Some(ModelProvenance::Trained));
        assert_eq!(store.count(&RecordQuery::owned_by(owner)).await.unwrap(), 1);
        let user = store.find_user(owner).await.unwrap().unwrap();
        assert_eq!(user.total_predictions, 1);
    }

    #[tokio::test]
    async fn detailed_save_tracks_crop_and_region() {
        let store = MemoryStore::new();
        let owner = farmer(&store).await;
        for _ in 0..2 {
            save_detailed(
                &store,
                owner,
                DetailedRequest {
                    crop_type: Some("Rice".into()),
                    region: Some("Deccan".into()),
                    soil_ph: Some(6.5),
                    result: json!({ "yield": 3000.0, "revenue": 5000.0 })
                        .as_object()
                        .cloned()
                        .unwrap(),
                    ..DetailedRequest::default()
                },
            )
            .await
            .unwrap();
        }
        let user = store.find_user(owner).await.unwrap().unwrap();
        assert_eq!(user.total_predictions, 2);
        assert_eq!(user.crops, vec!["Rice".to_string()]);
        assert_eq!(user.regions, vec!["Deccan".to_string()]);
    }

    fn monitor_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("agroai-monitor-{}", Uuid::new_v4()));
        std::fs::create_dir_all(dir.join(SPLITS_DIR)).unwrap();
        dir
    }

    #[tokio::test]
    async fn monitor_scores_models_on_held_out_splits() {
        let dir = monitor_dir();
        std::fs::write(
            dir.join(SPLITS_DIR).join("test_yield.csv"),
            "rainfall,temperature,nitrogen,phosphorus,potassium,soil_moisture,humidity,yield\n\
             100,25,80,50,50,50,65,100\n\
             200,25,80,50,50,50,65,250\n",
        )
        .unwrap();
        std::fs::write(
            dir.join(SPLITS_DIR).join("test_crop.csv"),
            "crop,nitrogen,phosphorus,potassium,temperature,ph,rainfall,npk_ratio\n\
             Rice,5,0,0,25,7,1200,1\n\
             wheat,-5,0,0,25,7,1200,1\n\
             wheat,3,0,0,25,7,1200,1\n",
        )
        .unwrap();

        let mut weights = vec![vec![0.0; 7]; 2];
        weights[0][0] = 1.0;
        weights[1][0] = -1.0;
        let mut coefficients = vec![0.0; 7];
        coefficients[0] = 1.0;
        let models = ModelSet {
            yield_model: Some(YieldModel {
                scaler: scaler(7),
                regressor: LinearRegressor {
                    coefficients,
                    intercept: 0.0,
                },
            }),
            crop_model: Some(ClassifierModel {
                scaler: scaler(7),
                classifier: SoftmaxClassifier {
                    classes: vec!["rice".into(), "wheat".into()],
                    weights,
                    intercepts: vec![0.0, 0.0],
                },
            }),
            risk_model: None,
        };

        let report = monitor(&models, &dir).await;
        let yields = report.yield_model.unwrap();
        assert_eq!(yields.samples, 2);
        assert_eq!(yields.features_used, YIELD_COLUMNS.to_vec());
        assert!((yields.rmse - 1250f64.sqrt()).abs() < 1e-9);
        assert!((yields.mae - 25.0).abs() < 1e-9);
        assert!((yields.r2 - (1.0 - 2500.0 / 11250.0)).abs() < 1e-9);

        let crops = report.crop_model.unwrap();
        assert_eq!(crops.samples, 3);
        assert_eq!(crops.classes, vec!["rice", "wheat"]);
        assert!((crops.accuracy - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn monitor_skips_models_without_a_split() {
        let dir = monitor_dir();
        let models = ModelSet {
            crop_model: Some(classifier(7, &["rice", "wheat"], 0)),
            ..ModelSet::default()
        };
        let report = monitor(&models, &dir).await;
        assert!(report.yield_model.is_none());
        assert!(report.crop_model.is_none());

        std::fs::write(dir.join(SPLITS_DIR).join("test_crop.csv"), "crop,nitrogen\nrice,1\n").unwrap();
        assert!(monitor(&models, &dir).await.crop_model.is_none());
    }
}
