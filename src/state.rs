use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::predictions::models::ModelRegistry;
use crate::store::{MemoryStore, PgStore, RecordStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub config: Arc<AppConfig>,
    pub models: Arc<ModelRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let store: Arc<dyn RecordStore> = match config.database_url.as_deref() {
            Some(url) => match PgStore::connect(url).await {
                Ok(pg) => Arc::new(pg),
                Err(e) => {
                    tracing::warn!(error = %e, "postgres unavailable; using in-memory store");
                    Arc::new(MemoryStore::new())
                }
            },
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        tracing::info!(backend = store.backend(), "record store ready");

        let models = Arc::new(ModelRegistry::new(&config.model_dir));

        Ok(Self::from_parts(store, config, models, Arc::new(SystemClock)))
    }

    pub fn from_parts(
        store: Arc<dyn RecordStore>,
        config: Arc<AppConfig>,
        models: Arc<ModelRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            models,
            clock,
        }
    }

    /// In-memory store, no models, clock pinned to 2025-06-15 12:00 UTC.
    #[cfg(test)]
    pub fn fake() -> Self {
        use crate::clock::FixedClock;
        use crate::config::{AnalyticsConfig, JwtConfig};
        use crate::predictions::models::ModelSet;

        let config = Arc::new(AppConfig {
            database_url: None,
            jwt: JwtConfig {
                secret: "test".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
                ttl_minutes: 5,
                refresh_ttl_minutes: 60,
            },
            model_dir: String::new(),
            analytics: AnalyticsConfig { scan_cap: 5000 },
        });

        Self::from_parts(
            Arc::new(MemoryStore::new()),
            config,
            Arc::new(ModelRegistry::preloaded(ModelSet::default())),
            Arc::new(FixedClock(time::macros::datetime!(2025-06-15 12:00 UTC))),
        )
    }
}
