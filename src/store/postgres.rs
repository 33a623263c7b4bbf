use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Facet, FacetQuery, FacetResult, FacetValue, FindOptions, GroupCount, KindStats, RecordQuery,
    RecordStore, SortOrder, UserCounter,
};
use crate::auth::repo_types::{NewUser, ProfileUpdate, User};
use crate::predictions::repo_types::{NewPrediction, PredictionBody, PredictionKind, PredictionRecord};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await
            .context("connect to database")?;

        // Run migrations if present
        if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
            warn!(error = %e, "migration failed; continuing");
        }
        info!("postgres record store ready");
        Ok(Self { pool })
    }
}

#[derive(Debug, FromRow)]
struct PredictionRow {
    id: Uuid,
    user_id: Uuid,
    prediction_type: String,
    document: Value,
    created_at: OffsetDateTime,
}

impl TryFrom<PredictionRow> for PredictionRecord {
    type Error = anyhow::Error;

    fn try_from(row: PredictionRow) -> Result<Self, Self::Error> {
        let kind: PredictionKind = row.prediction_type.parse()?;
        Ok(PredictionRecord {
            id: row.id,
            user_id: row.user_id,
            body: PredictionBody::from_document(kind, row.document)
                .with_context(|| format!("decode prediction {}", row.id))?,
            created_at: row.created_at,
        })
    }
}

/// Row shape of the `Latest` facet, which travels inside the facet JSON.
#[derive(Debug, Deserialize)]
struct LatestRow {
    id: Uuid,
    user_id: Uuid,
    prediction_type: String,
    document: Value,
    created_at_us: i64,
}

impl TryFrom<LatestRow> for PredictionRecord {
    type Error = anyhow::Error;

    fn try_from(row: LatestRow) -> Result<Self, Self::Error> {
        let created_at = OffsetDateTime::from_unix_timestamp_nanos(row.created_at_us as i128 * 1_000)?;
        PredictionRecord::try_from(PredictionRow {
            id: row.id,
            user_id: row.user_id,
            prediction_type: row.prediction_type,
            document: row.document,
            created_at,
        })
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &RecordQuery) {
    qb.push(" WHERE TRUE");
    if let Some(owner) = query.owner {
        qb.push(" AND p.user_id = ").push_bind(owner);
    }
    if let Some(kind) = query.kind {
        qb.push(" AND p.prediction_type = ").push_bind(kind.as_str());
    }
    if let Some(at) = query.since {
        qb.push(" AND p.created_at >= ").push_bind(at);
    }
    if let Some(at) = query.until {
        qb.push(" AND p.created_at <= ").push_bind(at);
    }
    if let Some(at) = query.before {
        qb.push(" AND p.created_at < ").push_bind(at);
    }
}

fn push_facet(qb: &mut QueryBuilder<'_, Postgres>, facet: &Facet, filter: &RecordQuery) {
    match facet {
        Facet::Count => {
            qb.push("(SELECT count(*) FROM predictions p");
            push_filters(qb, filter);
            qb.push(")");
        }
        Facet::CountConfident { threshold } => {
            qb.push("(SELECT count(*) FROM predictions p");
            push_filters(qb, filter);
            qb.push(" AND p.confidence >= ").push_bind(*threshold);
            qb.push(")");
        }
        Facet::Average(key) => {
            let k = key.json_key();
            qb.push(format!(
                "(SELECT avg(CASE WHEN jsonb_typeof(p.output -> '{k}') = 'number' \
                 THEN (p.output ->> '{k}')::float8 END) FROM predictions p"
            ));
            push_filters(qb, filter);
            qb.push(")");
        }
        Facet::GroupCounts(key) => {
            let k = key.json_key();
            qb.push(
                "(SELECT coalesce(jsonb_agg(jsonb_build_object('key', g.key, 'count', g.count) \
                 ORDER BY g.count DESC, g.key ASC), '[]'::jsonb) FROM (",
            );
            qb.push(format!(
                "SELECT p.output ->> '{k}' AS key, count(*) AS count FROM predictions p"
            ));
            push_filters(qb, filter);
            qb.push(format!(
                " AND jsonb_typeof(p.output -> '{k}') = 'string' GROUP BY 1) g)"
            ));
        }
        Facet::KindBreakdown { success_threshold } => {
            qb.push(
                "(SELECT coalesce(jsonb_agg(jsonb_build_object('kind', g.kind, 'count', g.count, \
                 'avg_yield', g.avg_yield, 'success_count', g.success_count) ORDER BY g.kind), \
                 '[]'::jsonb) FROM (SELECT p.prediction_type AS kind, count(*) AS count, \
                 avg(CASE WHEN p.prediction_type = 'yield' \
                 AND jsonb_typeof(p.output -> 'yield') = 'number' \
                 THEN (p.output ->> 'yield')::float8 END) AS avg_yield, \
                 count(*) FILTER (WHERE p.confidence >= ",
            );
            qb.push_bind(*success_threshold);
            qb.push(") AS success_count FROM predictions p");
            push_filters(qb, filter);
            qb.push(" GROUP BY p.prediction_type) g)");
        }
        Facet::Latest { limit } => {
            qb.push(
                "(SELECT coalesce(jsonb_agg(jsonb_build_object('id', l.id, 'user_id', l.user_id, \
                 'prediction_type', l.prediction_type, 'document', l.document, \
                 'created_at_us', l.created_at_us) ORDER BY l.created_at_us DESC, l.id DESC), \
                 '[]'::jsonb) FROM (SELECT p.id, p.user_id, p.prediction_type, p.document, \
                 (extract(epoch FROM p.created_at) * 1000000)::bigint AS created_at_us \
                 FROM predictions p",
            );
            push_filters(qb, filter);
            qb.push(" ORDER BY p.created_at DESC, p.id DESC LIMIT ")
                .push_bind((*limit).max(0));
            qb.push(") l)");
        }
    }
}

/// One `SELECT jsonb_build_object(...)` with a scalar subquery per facet.
fn build_facet_sql(query: &FacetQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT jsonb_build_object(");
    for (i, spec) in query.facets.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(format!("'{}', ", spec.name));
        push_facet(&mut qb, &spec.facet, &query.scope.and(&spec.filter));
    }
    qb.push(") AS facets");
    qb
}

fn decode_facet(facet: &Facet, raw: Value) -> anyhow::Result<FacetValue> {
    Ok(match facet {
        Facet::Count | Facet::CountConfident { .. } => FacetValue::Count(raw.as_u64().unwrap_or(0)),
        Facet::Average(_) => FacetValue::Average(raw.as_f64()),
        Facet::GroupCounts(_) => FacetValue::Groups(serde_json::from_value::<Vec<GroupCount>>(raw)?),
        Facet::KindBreakdown { .. } => FacetValue::Kinds(serde_json::from_value::<Vec<KindStats>>(raw)?),
        Facet::Latest { .. } => FacetValue::Records(
            serde_json::from_value::<Vec<LatestRow>>(raw)?
                .into_iter()
                .map(PredictionRecord::try_from)
                .collect::<anyhow::Result<_>>()?,
        ),
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn create_user(&self, new: NewUser) -> anyhow::Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (name, email, national_id, password_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, email, national_id, password_hash,
                      total_predictions, crops, regions, created_at
            "#,
        )
        .bind(&new.name)
        .bind(&new.email)
        .bind(&new.national_id)
        .bind(&new.password_hash)
        .fetch_one(&self.pool)
        .await
        .context("insert user")?;
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, national_id, password_hash,
                   total_predictions, crops, regions, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, national_id, password_hash,
                   total_predictions, crops, regions, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_user_by_national_id(&self, national_id: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, national_id, password_hash,
                   total_predictions, crops, regions, created_at
            FROM users
            WHERE national_id = $1
            "#,
        )
        .bind(national_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn count_users(&self) -> anyhow::Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn update_profile(&self, id: Uuid, update: &ProfileUpdate) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
               SET name = COALESCE($2, name),
                   email = COALESCE($3, email)
             WHERE id = $1
            RETURNING id, name, email, national_id, password_hash,
                      total_predictions, crops, regions, created_at
            "#,
        )
        .bind(id)
        .bind(update.name.as_deref())
        .bind(update.email.as_deref())
        .fetch_optional(&self.pool)
        .await
        .context("update profile")?;
        Ok(user)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .context("update password")?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_user(&self, id: Uuid) -> anyhow::Result<bool> {
        // predictions go with it via ON DELETE CASCADE
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete user")?;
        Ok(res.rows_affected() > 0)
    }

    async fn increment(&self, id: Uuid, counter: UserCounter, delta: i64) -> anyhow::Result<()> {
        let sql = match counter {
            UserCounter::TotalPredictions => {
                "UPDATE users SET total_predictions = total_predictions + $2 WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(id)
            .bind(delta)
            .execute(&self.pool)
            .await
            .context("increment user counter")?;
        Ok(())
    }

    async fn track_usage(&self, id: Uuid, crop: Option<&str>, region: Option<&str>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE users
               SET crops = CASE WHEN $2::text IS NULL OR $2::text = ANY(crops)
                                THEN crops ELSE array_append(crops, $2::text) END,
                   regions = CASE WHEN $3::text IS NULL OR $3::text = ANY(regions)
                                  THEN regions ELSE array_append(regions, $3::text) END
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(crop)
        .bind(region)
        .execute(&self.pool)
        .await
        .context("track usage")?;
        Ok(())
    }

    async fn insert_prediction(&self, new: NewPrediction) -> anyhow::Result<PredictionRecord> {
        let id = Uuid::new_v4();
        let kind = new.body.kind();
        let document = new.body.to_document()?;
        let output = Value::Object(new.body.output().cloned().unwrap_or_default());
        let (created_at,): (OffsetDateTime,) = sqlx::query_as(
            r#"
            INSERT INTO predictions (id, user_id, prediction_type, document, output, confidence)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING created_at
            "#,
        )
        .bind(id)
        .bind(new.user_id)
        .bind(kind.as_str())
        .bind(document)
        .bind(output)
        .bind(new.body.confidence())
        .fetch_one(&self.pool)
        .await
        .context("insert prediction")?;

        Ok(PredictionRecord {
            id,
            user_id: new.user_id,
            body: new.body,
            created_at,
        })
    }

    async fn count(&self, query: &RecordQuery) -> anyhow::Result<u64> {
        let mut qb = QueryBuilder::new("SELECT count(*) FROM predictions p");
        push_filters(&mut qb, query);
        let (n,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    async fn find(&self, query: &RecordQuery, opts: FindOptions) -> anyhow::Result<Vec<PredictionRecord>> {
        let mut qb = QueryBuilder::new(
            "SELECT p.id, p.user_id, p.prediction_type, p.document, p.created_at FROM predictions p",
        );
        push_filters(&mut qb, query);
        qb.push(match opts.sort {
            SortOrder::NewestFirst => " ORDER BY p.created_at DESC, p.id DESC",
            SortOrder::OldestFirst => " ORDER BY p.created_at ASC, p.id ASC",
        });
        qb.push(" OFFSET ").push_bind(opts.skip.max(0));
        qb.push(" LIMIT ").push_bind(opts.limit.max(0));

        let rows: Vec<PredictionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(PredictionRecord::try_from).collect()
    }

    async fn aggregate(&self, query: &FacetQuery) -> anyhow::Result<FacetResult> {
        let mut qb = build_facet_sql(query);
        let (doc,): (Value,) = qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .context("facet aggregate")?;

        let mut result = FacetResult::default();
        for spec in &query.facets {
            let raw = doc.get(spec.name).cloned().unwrap_or(Value::Null);
            let value = decode_facet(&spec.facet, raw)
                .with_context(|| format!("decode facet {}", spec.name))?;
            result.insert(spec.name, value);
        }
        debug!(facets = query.facets.len(), "postgres aggregate");
        Ok(result)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
