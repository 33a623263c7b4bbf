use serde_json::Value;
use time::{Date, Month, OffsetDateTime, Time};
use tracing::debug;
use uuid::Uuid;

use super::dto::{
    AggregateStats, CropCount, PersonalStatistics, PersonalStats, RecentPrediction, UserSummary,
    YearSummary,
};
use super::{round_to, success_rate, AnalyticsError, RECENT_LIMIT, SUCCESS_THRESHOLD};
use crate::predictions::repo_types::{PredictionKind, PredictionRecord};
use crate::store::{Facet, FacetQuery, OutputKey, RecordQuery, RecordStore};

/// Midnight UTC on January 1st of `now`'s year.
pub fn year_start(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(time::UtcOffset::UTC);
    // January 1st exists for every representable year
    Date::from_calendar_date(now.year(), Month::January, 1)
        .map(|d| d.with_time(Time::MIDNIGHT).assume_utc())
        .unwrap_or(now)
}

/// Platform-wide numbers for anonymous visitors.
pub async fn aggregate_stats(store: &dyn RecordStore) -> Result<AggregateStats, AnalyticsError> {
    let query = FacetQuery::new(RecordQuery::all())
        .facet("total_count", Facet::Count)
        .facet_where(
            "yield_stats",
            RecordQuery::all().kind(PredictionKind::Yield),
            Facet::Average(OutputKey::Yield),
        )
        .facet(
            "high_confidence",
            Facet::CountConfident {
                threshold: SUCCESS_THRESHOLD,
            },
        );
    let facets = store.aggregate(&query).await?;
    let active_farmers = store.count_users().await?;

    let total = facets.count("total_count");
    let confident = facets.count("high_confidence");
    Ok(AggregateStats {
        total_predictions: total,
        avg_yield: round_to(facets.average("yield_stats").unwrap_or(0.0), 2),
        success_rate: round_to(success_rate(confident, total), 1),
        active_farmers,
        message: "Login to see your personal statistics",
    })
}

/// Year-to-date and all-time numbers for one farmer.
pub async fn personal_stats(
    store: &dyn RecordStore,
    owner: Uuid,
    now: OffsetDateTime,
) -> Result<PersonalStats, AnalyticsError> {
    let user = store
        .find_user(owner)
        .await?
        .ok_or(AnalyticsError::UserNotFound)?;

    let start = year_start(now);
    let this_year = RecordQuery::all().since(start);
    let query = FacetQuery::new(RecordQuery::owned_by(owner))
        .facet("total_all_time", Facet::Count)
        .facet_where(
            "year_stats",
            this_year.clone(),
            Facet::KindBreakdown {
                success_threshold: SUCCESS_THRESHOLD,
            },
        )
        .facet_where(
            "crop_distribution",
            this_year.kind(PredictionKind::Crop),
            Facet::GroupCounts(OutputKey::Crop),
        )
        .facet("recent_10", Facet::Latest { limit: RECENT_LIMIT });
    let facets = store.aggregate(&query).await?;

    let mut year_summary = YearSummary {
        year: start.year(),
        ..YearSummary::default()
    };
    let mut avg_yield = 0.0;
    let mut success_count = 0;
    for stats in facets.kinds("year_stats") {
        year_summary.total_predictions += stats.count;
        success_count += stats.success_count;
        match stats.kind {
            PredictionKind::Yield => {
                year_summary.yield_predictions = stats.count;
                avg_yield = stats.avg_yield.unwrap_or(0.0);
            }
            PredictionKind::Crop => year_summary.crop_predictions = stats.count,
            PredictionKind::Risk => year_summary.risk_predictions = stats.count,
            PredictionKind::YieldDetailed => year_summary.detailed_predictions = stats.count,
        }
    }

    let crop_distribution: Vec<CropCount> = facets
        .groups("crop_distribution")
        .iter()
        .map(|g| CropCount {
            crop: g.key.clone(),
            count: g.count,
        })
        .collect();
    let top_crop = crop_distribution
        .first()
        .map(|c| c.crop.clone())
        .unwrap_or_else(|| "N/A".to_string());

    debug!(
        %owner,
        year = year_summary.year,
        total = year_summary.total_predictions,
        "personal stats computed"
    );

    Ok(PersonalStats {
        user: UserSummary {
            name: user.name,
            email: user.email,
            created_at: user.created_at,
        },
        statistics: PersonalStatistics {
            avg_yield: round_to(avg_yield, 2),
            top_crop,
            crop_count: crop_distribution.len(),
            success_count,
            success_rate: round_to(success_rate(success_count, year_summary.total_predictions), 1),
            total_predictions_all_time: facets.count("total_all_time"),
        },
        year_summary,
        crop_distribution,
        recent_predictions: facets.records("recent_10").iter().map(recent).collect(),
    })
}

fn recent(record: &PredictionRecord) -> RecentPrediction {
    RecentPrediction {
        id: record.id,
        prediction_type: record.kind(),
        output_data: record
            .body
            .output()
            .cloned()
            .map(Value::Object)
            .unwrap_or(Value::Null),
        model_type: record.body.model_type(),
        created_at: record.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_types::NewUser;
    use crate::predictions::repo_types::{
        BasicKind, BasicPrediction, DetailedPrediction, PredictionBody,
    };
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;
    use time::macros::datetime;

    fn basic(owner: Uuid, kind: BasicKind, output: Value, at: OffsetDateTime) -> PredictionRecord {
        PredictionRecord {
            id: Uuid::new_v4(),
            user_id: owner,
            body: PredictionBody::Basic {
                kind,
                data: BasicPrediction {
                    output_data: output.as_object().cloned(),
                    ..Default::default()
                },
            },
            created_at: at,
        }
    }

    async fn farmer(store: &MemoryStore) -> Uuid {
        store
            .create_user(NewUser {
                name: "Asha".into(),
                email: "asha@example.com".into(),
                national_id: "123456789012".into(),
                password_hash: "x".into(),
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn year_start_is_new_year_midnight() {
        assert_eq!(
            year_start(datetime!(2025-06-15 13:45 UTC)),
            datetime!(2025-01-01 0:00 UTC)
        );
        assert_eq!(
            year_start(datetime!(2025-01-01 02:00 +05:30)),
            datetime!(2024-01-01 0:00 UTC)
        );
    }

    #[tokio::test]
    async fn empty_store_gives_zeroed_aggregate() {
        let store = MemoryStore::new();
        let stats = aggregate_stats(&store).await.unwrap();
        assert_eq!(stats.total_predictions, 0);
        assert_eq!(stats.avg_yield, 0.0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.active_farmers, 0);
    }

    #[tokio::test]
    async fn aggregate_averages_yield_records_only() {
        let store = MemoryStore::new();
        let owner = farmer(&store).await;
        let at = datetime!(2025-03-01 10:00 UTC);
        store
            .push_record(basic(owner, BasicKind::Yield, json!({ "yield": 100.0, "confidence": 0.9 }), at))
            .unwrap();
        store
            .push_record(basic(owner, BasicKind::Yield, json!({ "yield": 201.0, "confidence": 0.6 }), at))
            .unwrap();
        store
            .push_record(PredictionRecord {
                id: Uuid::new_v4(),
                user_id: owner,
                body: PredictionBody::Detailed(DetailedPrediction {
                    prediction_result: json!({ "yield": 9000.0, "confidence": 0.95 })
                        .as_object()
                        .cloned()
                        .unwrap(),
                    ..Default::default()
                }),
                created_at: at,
            })
            .unwrap();

        let stats = aggregate_stats(&store).await.unwrap();
        assert_eq!(stats.total_predictions, 3);
        assert_eq!(stats.avg_yield, 150.5);
        assert_eq!(stats.success_rate, 66.7);
        assert_eq!(stats.active_farmers, 1);
    }

    #[tokio::test]
    async fn personal_stats_for_unknown_user_is_not_found() {
        let store = MemoryStore::new();
        let err = personal_stats(&store, Uuid::new_v4(), datetime!(2025-05-01 0:00 UTC))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::UserNotFound));
    }

    #[tokio::test]
    async fn personal_stats_without_records_is_zeroed() {
        let store = MemoryStore::new();
        let owner = farmer(&store).await;
        let stats = personal_stats(&store, owner, datetime!(2025-05-01 0:00 UTC))
            .await
            .unwrap();
        assert_eq!(stats.year_summary.year, 2025);
        assert_eq!(stats.year_summary.total_predictions, 0);
        assert_eq!(stats.statistics.success_rate, 0.0);
        assert_eq!(stats.statistics.top_crop, "N/A");
        assert_eq!(stats.statistics.crop_count, 0);
        assert!(stats.crop_distribution.is_empty());
        assert!(stats.recent_predictions.is_empty());
    }

    #[tokio::test]
    async fn personal_stats_scenario() {
        let store = MemoryStore::new();
        let owner = farmer(&store).await;
        store
            .push_record(basic(
                owner,
                BasicKind::Yield,
                json!({ "yield": 3000.0, "confidence": 0.9 }),
                datetime!(2025-01-10 08:00 UTC),
            ))
            .unwrap();
        store
            .push_record(basic(
                owner,
                BasicKind::Crop,
                json!({ "crop": "rice", "confidence": 0.5 }),
                datetime!(2025-02-10 08:00 UTC),
            ))
            .unwrap();
        store
            .push_record(basic(
                owner,
                BasicKind::Yield,
                json!({ "yield": 4000.0, "confidence": 0.8 }),
                datetime!(2025-03-10 08:00 UTC),
            ))
            .unwrap();
        // last year: counts all-time only
        store
            .push_record(basic(
                owner,
                BasicKind::Crop,
                json!({ "crop": "wheat", "confidence": 0.99 }),
                datetime!(2024-12-31 23:59 UTC),
            ))
            .unwrap();

        let stats = personal_stats(&store, owner, datetime!(2025-04-01 12:00 UTC))
            .await
            .unwrap();
        assert_eq!(stats.year_summary.total_predictions, 3);
        assert_eq!(stats.year_summary.yield_predictions, 2);
        assert_eq!(stats.year_summary.crop_predictions, 1);
        assert_eq!(stats.statistics.success_count, 2);
        assert_eq!(stats.statistics.success_rate, 66.7);
        assert_eq!(stats.statistics.avg_yield, 3500.0);
        assert_eq!(stats.statistics.top_crop, "rice");
        assert_eq!(stats.statistics.total_predictions_all_time, 4);
        assert_eq!(stats.recent_predictions.len(), 4);
        assert_eq!(
            stats.recent_predictions[0].prediction_type,
            PredictionKind::Yield
        );
        assert_eq!(stats.recent_predictions[0].output_data["yield"], json!(4000.0));
    }

    #[tokio::test]
    async fn recent_predictions_are_capped() {
        let store = MemoryStore::new();
        let owner = farmer(&store).await;
        for day in 1..=12u8 {
            let at = datetime!(2025-01-01 0:00 UTC) + time::Duration::days(day as i64);
            store
                .push_record(basic(owner, BasicKind::Risk, json!({ "risk_level": "Low" }), at))
                .unwrap();
        }
        let stats = personal_stats(&store, owner, datetime!(2025-02-01 0:00 UTC))
            .await
            .unwrap();
        assert_eq!(stats.recent_predictions.len(), RECENT_LIMIT as usize);
        assert_eq!(stats.year_summary.risk_predictions, 12);
    }

    proptest! {
        #[test]
        fn success_rate_grows_with_confident_count(total in 1u64..10_000, a in 0u64..10_000, b in 0u64..10_000) {
            let (lo, hi) = (a.min(b).min(total), a.max(b).min(total));
            prop_assert!(success_rate(lo, total) <= success_rate(hi, total));
            prop_assert!(success_rate(hi, total) <= 100.0);
        }
    }
}
