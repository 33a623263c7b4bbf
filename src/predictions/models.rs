//! Trained model artifacts and the process-wide registry that loads them.
//!
//! Artifacts are JSON exports of a standard scaler plus either a linear
//! regressor (yield) or a multinomial logistic classifier (crop, risk).
//! A model that is missing or fails validation is simply absent, and the
//! prediction service falls back to its heuristics for it.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub const YIELD_FEATURES: usize = 7;
pub const CROP_FEATURES: usize = 7;
pub const RISK_FEATURES: usize = 10;

/// Column names of the yield features, in model input order.
pub const YIELD_COLUMNS: [&str; YIELD_FEATURES] = [
    "rainfall",
    "temperature",
    "nitrogen",
    "phosphorus",
    "potassium",
    "soil_moisture",
    "humidity",
];

/// Column names of the crop features, in model input order.
pub const CROP_COLUMNS: [&str; CROP_FEATURES] = [
    "nitrogen",
    "phosphorus",
    "potassium",
    "temperature",
    "ph",
    "rainfall",
    "npk_ratio",
];

/// Held-out evaluation data lives under `<model dir>/splits/`.
pub const SPLITS_DIR: &str = "splits";

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("expected {expected} features, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid artifact: {0}")]
    Invalid(String),
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("could not parse {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("{path}: {reason}")]
    Split { path: PathBuf, reason: String },
}

fn check_len(expected: usize, got: usize) -> Result<(), ModelError> {
    if expected == got {
        Ok(())
    } else {
        Err(ModelError::DimensionMismatch { expected, got })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn transform(&self, features: &[f64]) -> Result<Vec<f64>, ModelError> {
        check_len(self.mean.len(), features.len())?;
        Ok(features
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (mean, scale))| {
                // zero-variance columns were constant during training
                if *scale == 0.0 {
                    0.0
                } else {
                    (x - mean) / scale
                }
            })
            .collect())
    }

    fn validate(&self, features: usize) -> Result<(), ModelError> {
        check_len(features, self.mean.len())?;
        check_len(features, self.scale.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressor {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl LinearRegressor {
    pub fn predict(&self, scaled: &[f64]) -> Result<f64, ModelError> {
        check_len(self.coefficients.len(), scaled.len())?;
        Ok(self.intercept
            + self
                .coefficients
                .iter()
                .zip(scaled)
                .map(|(w, x)| w * x)
                .sum::<f64>())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxClassifier {
    pub classes: Vec<String>,
    /// One row of coefficients per class.
    pub weights: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
}

impl SoftmaxClassifier {
    /// Class probabilities in `classes` order.
    pub fn predict_proba(&self, scaled: &[f64]) -> Result<Vec<f64>, ModelError> {
        let mut logits = Vec::with_capacity(self.classes.len());
        for (row, intercept) in self.weights.iter().zip(&self.intercepts) {
            check_len(row.len(), scaled.len())?;
            logits.push(intercept + row.iter().zip(scaled).map(|(w, x)| w * x).sum::<f64>());
        }
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        Ok(exps.into_iter().map(|e| e / total).collect())
    }

    /// Classes ranked by probability, most likely first.
    pub fn rank(&self, scaled: &[f64]) -> Result<Vec<(String, f64)>, ModelError> {
        let proba = self.predict_proba(scaled)?;
        let mut ranked: Vec<(String, f64)> = self.classes.iter().cloned().zip(proba).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(ranked)
    }

    fn validate(&self, features: usize) -> Result<(), ModelError> {
        if self.classes.is_empty() {
            return Err(ModelError::Invalid("classifier has no classes".into()));
        }
        check_len(self.classes.len(), self.weights.len())?;
        check_len(self.classes.len(), self.intercepts.len())?;
        for row in &self.weights {
            check_len(features, row.len())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldModel {
    pub scaler: StandardScaler,
    pub regressor: LinearRegressor,
}

impl YieldModel {
    pub fn predict(&self, features: &[f64]) -> Result<f64, ModelError> {
        self.regressor.predict(&self.scaler.transform(features)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub scaler: StandardScaler,
    pub classifier: SoftmaxClassifier,
}

impl ClassifierModel {
    pub fn rank(&self, features: &[f64]) -> Result<Vec<(String, f64)>, ModelError> {
        self.classifier.rank(&self.scaler.transform(features)?)
    }
}

/// Whatever artifacts were found at load time.
#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    pub yield_model: Option<YieldModel>,
    pub crop_model: Option<ClassifierModel>,
    pub risk_model: Option<ClassifierModel>,
}

impl ModelSet {
    pub fn loaded_count(&self) -> usize {
        [
            self.yield_model.is_some(),
            self.crop_model.is_some(),
            self.risk_model.is_some(),
        ]
        .iter()
        .filter(|loaded| **loaded)
        .count()
    }

    async fn load_from(dir: &Path) -> Self {
        let yield_model = load_artifact::<YieldModel>(dir, "yield_model.json", |m| {
            m.scaler.validate(YIELD_FEATURES)?;
            check_len(YIELD_FEATURES, m.regressor.coefficients.len())
        })
        .await;
        let crop_model = load_artifact::<ClassifierModel>(dir, "crop_model.json", |m| {
            m.scaler.validate(CROP_FEATURES)?;
            m.classifier.validate(CROP_FEATURES)
        })
        .await;
        let risk_model = load_artifact::<ClassifierModel>(dir, "risk_model.json", |m| {
            m.scaler.validate(RISK_FEATURES)?;
            m.classifier.validate(RISK_FEATURES)
        })
        .await;

        let set = ModelSet {
            yield_model,
            crop_model,
            risk_model,
        };
        match set.loaded_count() {
            0 => warn!(dir = %dir.display(), "no models loaded; using fallback predictions"),
            3 => info!(dir = %dir.display(), "all models loaded"),
            n => warn!(loaded = n, "some models missing; using fallback for the rest"),
        }
        set
    }
}

/// `production/<name>` wins over `<name>`.
fn resolve(dir: &Path, name: &str) -> Option<PathBuf> {
    [dir.join("production").join(name), dir.join(name)]
        .into_iter()
        .find(|p| p.is_file())
}

async fn read_artifact<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ModelError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&raw).map_err(|source| ModelError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

async fn load_artifact<T>(
    dir: &Path,
    name: &str,
    validate: impl Fn(&T) -> Result<(), ModelError>,
) -> Option<T>
where
    T: for<'de> Deserialize<'de>,
{
    let path = resolve(dir, name)?;
    match read_artifact::<T>(&path).await.and_then(|m| validate(&m).map(|_| m)) {
        Ok(model) => {
            info!(path = %path.display(), "model loaded");
            Some(model)
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to load model");
            None
        }
    }
}

/// Feature rows and raw target values read from a held-out CSV split.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSplit {
    pub features_used: Vec<&'static str>,
    pub rows: Vec<Vec<f64>>,
    pub targets: Vec<String>,
}

/// Reads `path`, picking `features` (in that order) and `target` by header name.
/// Every feature column must be present and numeric in every row.
pub async fn read_split(
    path: &Path,
    features: &[&'static str],
    target: &str,
) -> Result<TestSplit, ModelError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let csv_err = |source| ModelError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let split_err = |reason: String| ModelError::Split {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::Reader::from_reader(raw.as_bytes());
    let headers = reader.headers().map_err(csv_err)?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| split_err(format!("missing column `{name}`")))
    };
    let feature_idx = features
        .iter()
        .map(|name| column(name))
        .collect::<Result<Vec<_>, _>>()?;
    let target_idx = column(target)?;

    let mut split = TestSplit {
        features_used: features.to_vec(),
        rows: Vec::new(),
        targets: Vec::new(),
    };
    for (n, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        let mut row = Vec::with_capacity(feature_idx.len());
        for (&idx, name) in feature_idx.iter().zip(features) {
            let value = record
                .get(idx)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .ok_or_else(|| split_err(format!("row {}: `{name}` is not a number", n + 1)))?;
            row.push(value);
        }
        split.rows.push(row);
        split
            .targets
            .push(record.get(target_idx).unwrap_or_default().trim().to_string());
    }
    if split.rows.is_empty() {
        return Err(split_err("no rows".into()));
    }
    Ok(split)
}

/// Loads the model set at most once; concurrent first callers wait on the same load.
#[derive(Debug)]
pub struct ModelRegistry {
    dir: PathBuf,
    cell: OnceCell<ModelSet>,
    loads: AtomicUsize,
}

impl ModelRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cell: OnceCell::new(),
            loads: AtomicUsize::new(0),
        }
    }

    /// A registry that is already loaded with `models`.
    pub fn preloaded(models: ModelSet) -> Self {
        Self {
            dir: PathBuf::new(),
            cell: OnceCell::new_with(Some(models)),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn load(&self) -> &ModelSet {
        self.cell
            .get_or_init(|| async {
                self.loads.fetch_add(1, Ordering::SeqCst);
                ModelSet::load_from(&self.dir).await
            })
            .await
    }

    #[cfg(test)]
    fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}
