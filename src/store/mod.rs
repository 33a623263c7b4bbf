//! Record store: users plus the append-only prediction log.
//!
//! The analytics engine only talks to [`RecordStore`]. Postgres backs it in
//! production; [`MemoryStore`] is used when no database is reachable and in tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, ProfileUpdate, User};
use crate::predictions::repo_types::{NewPrediction, PredictionKind, PredictionRecord};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_user(&self, new: NewUser) -> anyhow::Result<User>;
    async fn find_user(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_user_by_national_id(&self, national_id: &str) -> anyhow::Result<Option<User>>;
    async fn count_users(&self) -> anyhow::Result<u64>;
    async fn update_profile(&self, id: Uuid, update: &ProfileUpdate) -> anyhow::Result<Option<User>>;
    async fn update_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<bool>;
    /// Removes the user and every prediction they own. Returns false if no such user.
    async fn delete_user(&self, id: Uuid) -> anyhow::Result<bool>;
    async fn increment(&self, id: Uuid, counter: UserCounter, delta: i64) -> anyhow::Result<()>;
    /// Adds crop/region to the user's distinct sets.
    async fn track_usage(&self, id: Uuid, crop: Option<&str>, region: Option<&str>) -> anyhow::Result<()>;

    async fn insert_prediction(&self, new: NewPrediction) -> anyhow::Result<PredictionRecord>;
    async fn count(&self, query: &RecordQuery) -> anyhow::Result<u64>;
    async fn find(&self, query: &RecordQuery, opts: FindOptions) -> anyhow::Result<Vec<PredictionRecord>>;
    /// Evaluates every facet in one round trip.
    async fn aggregate(&self, query: &FacetQuery) -> anyhow::Result<FacetResult>;

    async fn ping(&self) -> anyhow::Result<()>;
    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCounter {
    TotalPredictions,
}

/// Conjunctive predicate over prediction records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    pub owner: Option<Uuid>,
    pub kind: Option<PredictionKind>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<OffsetDateTime>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<OffsetDateTime>,
    /// Exclusive upper bound on `created_at`.
    pub before: Option<OffsetDateTime>,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn owned_by(owner: Uuid) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: PredictionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn since(mut self, at: OffsetDateTime) -> Self {
        self.since = Some(at);
        self
    }

    pub fn until(mut self, at: OffsetDateTime) -> Self {
        self.until = Some(at);
        self
    }

    pub fn before(mut self, at: OffsetDateTime) -> Self {
        self.before = Some(at);
        self
    }

    /// Narrow `self` by `other`; fields set on `other` win.
    pub fn and(&self, other: &RecordQuery) -> RecordQuery {
        RecordQuery {
            owner: other.owner.or(self.owner),
            kind: other.kind.or(self.kind),
            since: other.since.or(self.since),
            until: other.until.or(self.until),
            before: other.before.or(self.before),
        }
    }

    pub fn matches(&self, record: &PredictionRecord) -> bool {
        self.owner.map_or(true, |o| record.user_id == o)
            && self.kind.map_or(true, |k| record.kind() == k)
            && self.since.map_or(true, |t| record.created_at >= t)
            && self.until.map_or(true, |t| record.created_at <= t)
            && self.before.map_or(true, |t| record.created_at < t)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: SortOrder,
    pub skip: i64,
    pub limit: i64,
}

impl FindOptions {
    pub fn newest(limit: i64) -> Self {
        Self {
            sort: SortOrder::NewestFirst,
            skip: 0,
            limit,
        }
    }

    pub fn oldest(limit: i64) -> Self {
        Self {
            sort: SortOrder::OldestFirst,
            skip: 0,
            limit,
        }
    }

    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = skip;
        self
    }
}

/// Keys of the output mapping that facets may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKey {
    Yield,
    Crop,
    RiskLevel,
}

impl OutputKey {
    pub fn json_key(&self) -> &'static str {
        match self {
            OutputKey::Yield => "yield",
            OutputKey::Crop => "crop",
            OutputKey::RiskLevel => "risk_level",
        }
    }
}

/// One named sub-aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum Facet {
    Count,
    /// Records whose confidence is at or above the threshold.
    CountConfident { threshold: f64 },
    /// Mean of a numeric output value; records without it are ignored.
    Average(OutputKey),
    /// Counts per text output value, most frequent first.
    GroupCounts(OutputKey),
    /// Per-kind count, average yield (yield kind only) and confident count.
    KindBreakdown { success_threshold: f64 },
    Latest { limit: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacetSpec {
    pub name: &'static str,
    pub filter: RecordQuery,
    pub facet: Facet,
}

/// Builder for a multi-facet aggregation over a common scope.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetQuery {
    pub scope: RecordQuery,
    pub facets: Vec<FacetSpec>,
}

impl FacetQuery {
    pub fn new(scope: RecordQuery) -> Self {
        Self {
            scope,
            facets: Vec::new(),
        }
    }

    pub fn facet(self, name: &'static str, facet: Facet) -> Self {
        self.facet_where(name, RecordQuery::all(), facet)
    }

    pub fn facet_where(mut self, name: &'static str, filter: RecordQuery, facet: Facet) -> Self {
        self.facets.push(FacetSpec { name, filter, facet });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCount {
    pub key: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
    pub kind: PredictionKind,
    pub count: u64,
    pub avg_yield: Option<f64>,
    pub success_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FacetValue {
    Count(u64),
    Average(Option<f64>),
    Groups(Vec<GroupCount>),
    Kinds(Vec<KindStats>),
    Records(Vec<PredictionRecord>),
}

/// Named results of a [`FacetQuery`]. Missing or mismatched facets read as empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacetResult {
    values: HashMap<&'static str, FacetValue>,
}

impl FacetResult {
    pub fn insert(&mut self, name: &'static str, value: FacetValue) {
        self.values.insert(name, value);
    }

    pub fn count(&self, name: &str) -> u64 {
        match self.values.get(name) {
            Some(FacetValue::Count(n)) => *n,
            _ => 0,
        }
    }

    pub fn average(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(FacetValue::Average(avg)) => *avg,
            _ => None,
        }
    }

    pub fn groups(&self, name: &str) -> &[GroupCount] {
        match self.values.get(name) {
            Some(FacetValue::Groups(groups)) => groups,
            _ => &[],
        }
    }

    pub fn kinds(&self, name: &str) -> &[KindStats] {
        match self.values.get(name) {
            Some(FacetValue::Kinds(kinds)) => kinds,
            _ => &[],
        }
    }

    pub fn records(&self, name: &str) -> &[PredictionRecord] {
        match self.values.get(name) {
            Some(FacetValue::Records(records)) => records,
            _ => &[],
        }
    }
}

/// Newest first, ties broken by id so pagination is stable.
pub(crate) fn sort_records(records: &mut [PredictionRecord], order: SortOrder) {
    records.sort_by(|a, b| {
        let ord = a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id));
        match order {
            SortOrder::NewestFirst => ord.reverse(),
            SortOrder::OldestFirst => ord,
        }
    });
}

impl Facet {
    /// In-process evaluation over already-filtered records.
    pub(crate) fn evaluate(&self, records: &[&PredictionRecord]) -> FacetValue {
        match self {
            Facet::Count => FacetValue::Count(records.len() as u64),
            Facet::CountConfident { threshold } => FacetValue::Count(
                records
                    .iter()
                    .filter(|r| r.body.confidence().map_or(false, |c| c >= *threshold))
                    .count() as u64,
            ),
            Facet::Average(key) => {
                let values: Vec<f64> = records
                    .iter()
                    .filter_map(|r| r.body.output_number(key.json_key()))
                    .collect();
                FacetValue::Average(mean(&values))
            }
            Facet::GroupCounts(key) => {
                let mut counts: HashMap<&str, u64> = HashMap::new();
                for r in records {
                    if let Some(value) = r.body.output_text(key.json_key()) {
                        *counts.entry(value).or_default() += 1;
                    }
                }
                let mut groups: Vec<GroupCount> = counts
                    .into_iter()
                    .map(|(key, count)| GroupCount {
                        key: key.to_string(),
                        count,
                    })
                    .collect();
                groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
                FacetValue::Groups(groups)
            }
            Facet::KindBreakdown { success_threshold } => {
                let mut kinds = Vec::new();
                for kind in PredictionKind::ALL {
                    let of_kind: Vec<&&PredictionRecord> =
                        records.iter().filter(|r| r.kind() == kind).collect();
                    if of_kind.is_empty() {
                        continue;
                    }
                    let yields: Vec<f64> = if kind == PredictionKind::Yield {
                        of_kind
                            .iter()
                            .filter_map(|r| r.body.output_number("yield"))
                            .collect()
                    } else {
                        Vec::new()
                    };
                    let success_count = of_kind
                        .iter()
                        .filter(|r| r.body.confidence().map_or(false, |c| c >= *success_threshold))
                        .count() as u64;
                    kinds.push(KindStats {
                        kind,
                        count: of_kind.len() as u64,
                        avg_yield: mean(&yields),
                        success_count,
                    });
                }
                FacetValue::Kinds(kinds)
            }
            Facet::Latest { limit } => {
                let mut latest: Vec<PredictionRecord> =
                    records.iter().map(|r| (*r).clone()).collect();
                sort_records(&mut latest, SortOrder::NewestFirst);
                latest.truncate((*limit).max(0) as usize);
                FacetValue::Records(latest)
            }
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
