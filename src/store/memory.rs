use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{sort_records, FacetQuery, FacetResult, FindOptions, RecordQuery, RecordStore, UserCounter};
use crate::auth::repo_types::{NewUser, ProfileUpdate, User};
use crate::predictions::repo_types::{NewPrediction, PredictionRecord};

#[derive(Default)]
struct Inner {
    users: Vec<User>,
    predictions: Vec<PredictionRecord>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed record, keeping its timestamp. Used to seed history.
    pub fn push_record(&self, record: PredictionRecord) -> anyhow::Result<()> {
        self.write()?.predictions.push(record);
        Ok(())
    }

    fn read(&self) -> anyhow::Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    fn write(&self) -> anyhow::Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    fn find_user_by<F>(&self, pred: F) -> anyhow::Result<Option<User>>
    where
        F: Fn(&User) -> bool,
    {
        Ok(self.read()?.users.iter().find(|u| pred(u)).cloned())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_user(&self, new: NewUser) -> anyhow::Result<User> {
        let mut inner = self.write()?;
        if inner
            .users
            .iter()
            .any(|u| u.email == new.email || u.national_id == new.national_id)
        {
            anyhow::bail!("duplicate email or national id");
        }
        let user = User {
            id: Uuid::new_v4(),
            name: new.name,
            email: new.email,
            national_id: new.national_id,
            password_hash: new.password_hash,
            total_predictions: 0,
            crops: Vec::new(),
            regions: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        self.find_user_by(|u| u.id == id)
    }

    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        self.find_user_by(|u| u.email == email)
    }

    async fn find_user_by_national_id(&self, national_id: &str) -> anyhow::Result<Option<User>> {
        self.find_user_by(|u| u.national_id == national_id)
    }

    async fn count_users(&self) -> anyhow::Result<u64> {
        Ok(self.read()?.users.len() as u64)
    }

    async fn update_profile(&self, id: Uuid, update: &ProfileUpdate) -> anyhow::Result<Option<User>> {
        let mut inner = self.write()?;
        let Some(user) = inner.users.iter_mut().find(|u| u.id == id) else {
            return Ok(None);
        };
        if let Some(name) = &update.name {
            user.name = name.clone();
        }
        if let Some(email) = &update.email {
            user.email = email.clone();
        }
        Ok(Some(user.clone()))
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<bool> {
        let mut inner = self.write()?;
        match inner.users.iter_mut().find(|u| u.id == id) {
            Some(user) => {
                user.password_hash = password_hash.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_user(&self, id: Uuid) -> anyhow::Result<bool> {
        let mut inner = self.write()?;
        let before = inner.users.len();
        inner.users.retain(|u| u.id != id);
        if inner.users.len() == before {
            return Ok(false);
        }
        inner.predictions.retain(|p| p.user_id != id);
        Ok(true)
    }

    async fn increment(&self, id: Uuid, counter: UserCounter, delta: i64) -> anyhow::Result<()> {
        let mut inner = self.write()?;
        if let Some(user) = inner.users.iter_mut().find(|u| u.id == id) {
            match counter {
                UserCounter::TotalPredictions => user.total_predictions += delta,
            }
        }
        Ok(())
    }

    async fn track_usage(&self, id: Uuid, crop: Option<&str>, region: Option<&str>) -> anyhow::Result<()> {
        let mut inner = self.write()?;
        if let Some(user) = inner.users.iter_mut().find(|u| u.id == id) {
            if let Some(crop) = crop {
                if !user.crops.iter().any(|c| c == crop) {
                    user.crops.push(crop.to_string());
                }
            }
            if let Some(region) = region {
                if !user.regions.iter().any(|r| r == region) {
                    user.regions.push(region.to_string());
                }
            }
        }
        Ok(())
    }

    async fn insert_prediction(&self, new: NewPrediction) -> anyhow::Result<PredictionRecord> {
        let record = PredictionRecord {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            body: new.body,
            created_at: OffsetDateTime::now_utc(),
        };
        self.write()?.predictions.push(record.clone());
        Ok(record)
    }

    async fn count(&self, query: &RecordQuery) -> anyhow::Result<u64> {
        let inner = self.read()?;
        Ok(inner.predictions.iter().filter(|r| query.matches(r)).count() as u64)
    }

    async fn find(&self, query: &RecordQuery, opts: FindOptions) -> anyhow::Result<Vec<PredictionRecord>> {
        let mut matched: Vec<PredictionRecord> = {
            let inner = self.read()?;
            inner
                .predictions
                .iter()
                .filter(|r| query.matches(r))
                .cloned()
                .collect()
        };
        sort_records(&mut matched, opts.sort);
        Ok(matched
            .into_iter()
            .skip(opts.skip.max(0) as usize)
            .take(opts.limit.max(0) as usize)
            .collect())
    }

    async fn aggregate(&self, query: &FacetQuery) -> anyhow::Result<FacetResult> {
        let inner = self.read()?;
        let scoped: Vec<&PredictionRecord> = inner
            .predictions
            .iter()
            .filter(|r| query.scope.matches(r))
            .collect();

        let mut result = FacetResult::default();
        for spec in &query.facets {
            let subset: Vec<&PredictionRecord> = scoped
                .iter()
                .copied()
                .filter(|r| spec.filter.matches(r))
                .collect();
            result.insert(spec.name, spec.facet.evaluate(&subset));
        }
        debug!(facets = query.facets.len(), scoped = scoped.len(), "memory aggregate");
        Ok(result)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.read().map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
