use std::collections::{BTreeMap, BTreeSet};

use time::{Date, Month, OffsetDateTime, Time};
use tracing::debug;
use uuid::Uuid;

use super::dto::{MonthCounts, QuarterlyAnalytics, YearlyAnalytics, YearlySummary};
use super::{month_year, round_to, AnalyticsError, CURRENCY, REVENUE_PER_UNIT};
use crate::predictions::repo_types::{PredictionKind, PredictionRecord};
use crate::store::{FindOptions, RecordQuery, RecordStore};

/// Half-open `[start, end)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

fn first_of_month(year: i32, month: u8) -> Result<OffsetDateTime, AnalyticsError> {
    let month = Month::try_from(month)
        .map_err(|_| AnalyticsError::InvalidPeriod(format!("invalid month {month}")))?;
    let date = Date::from_calendar_date(year, month, 1)
        .map_err(|_| AnalyticsError::InvalidPeriod(format!("year {year} is out of range")))?;
    Ok(date.with_time(Time::MIDNIGHT).assume_utc())
}

fn next_year(year: i32) -> Result<i32, AnalyticsError> {
    year.checked_add(1)
        .ok_or_else(|| AnalyticsError::InvalidPeriod(format!("year {year} is out of range")))
}

pub fn year_bounds(year: i32) -> Result<Period, AnalyticsError> {
    Ok(Period {
        start: first_of_month(year, 1)?,
        end: first_of_month(next_year(year)?, 1)?,
    })
}

pub fn quarter_bounds(year: i32, quarter: u8) -> Result<Period, AnalyticsError> {
    if !(1..=4).contains(&quarter) {
        return Err(AnalyticsError::InvalidPeriod(format!(
            "quarter must be between 1 and 4, got {quarter}"
        )));
    }
    let start_month = 3 * (quarter - 1) + 1;
    let end = if quarter == 4 {
        first_of_month(next_year(year)?, 1)?
    } else {
        first_of_month(year, start_month + 3)?
    };
    Ok(Period {
        start: first_of_month(year, start_month)?,
        end,
    })
}

pub fn current_quarter(now: OffsetDateTime) -> u8 {
    (u8::from(now.month()) - 1) / 3 + 1
}

/// Running totals shared by the yearly and quarterly reports.
#[derive(Debug, Default)]
struct Tally {
    total: u64,
    yield_sum: f64,
    yield_count: u64,
    months: BTreeMap<u8, MonthCounts>,
    crops: BTreeMap<String, u64>,
    risks: BTreeMap<String, u64>,
}

impl Tally {
    fn for_months(months: impl IntoIterator<Item = u8>) -> Self {
        let mut risks = BTreeMap::new();
        for level in ["Low", "Medium", "High"] {
            risks.insert(level.to_string(), 0);
        }
        Self {
            months: months.into_iter().map(|m| (m, MonthCounts::default())).collect(),
            risks,
            ..Self::default()
        }
    }

    fn add(&mut self, record: &PredictionRecord) {
        self.total += 1;
        let month = self
            .months
            .entry(u8::from(record.created_at.to_offset(time::UtcOffset::UTC).month()))
            .or_default();
        month.total += 1;
        match record.kind() {
            PredictionKind::Yield => {
                month.yield_count += 1;
                self.yield_sum += record.body.output_number("yield").unwrap_or(0.0);
                self.yield_count += 1;
            }
            PredictionKind::Crop => {
                month.crop += 1;
                let crop = record.body.output_text("crop").unwrap_or("Unknown");
                *self.crops.entry(crop.to_string()).or_default() += 1;
            }
            PredictionKind::Risk => {
                month.risk += 1;
                let level = record.body.output_text("risk_level").unwrap_or("Low");
                *self.risks.entry(level.to_string()).or_default() += 1;
            }
            PredictionKind::YieldDetailed => month.yield_detailed += 1,
        }
    }

    fn avg_yield(&self) -> f64 {
        if self.yield_count == 0 {
            0.0
        } else {
            self.yield_sum / self.yield_count as f64
        }
    }

    fn quarter_total(&self, quarter: u8) -> u64 {
        let first = 3 * (quarter - 1) + 1;
        (first..first + 3)
            .filter_map(|m| self.months.get(&m))
            .map(|m| m.total)
            .sum()
    }
}

async fn records_in(
    store: &dyn RecordStore,
    owner: Uuid,
    period: Period,
    scan_cap: i64,
) -> Result<Vec<PredictionRecord>, AnalyticsError> {
    let query = RecordQuery::owned_by(owner)
        .since(period.start)
        .before(period.end);
    Ok(store.find(&query, FindOptions::oldest(scan_cap)).await?)
}

pub async fn yearly(
    store: &dyn RecordStore,
    owner: Uuid,
    year: i32,
    scan_cap: i64,
) -> Result<YearlyAnalytics, AnalyticsError> {
    let period = year_bounds(year)?;
    let records = records_in(store, owner, period, scan_cap).await?;

    let mut tally = Tally::for_months(1..=12);
    for record in &records {
        tally.add(record);
    }
    debug!(%owner, year, records = tally.total, "yearly analytics");

    let avg_yield = tally.avg_yield();
    let quarterly_breakdown = (1..=4u8)
        .map(|q| (format!("Q{q}"), tally.quarter_total(q)))
        .collect();
    Ok(YearlyAnalytics {
        year,
        summary: YearlySummary {
            total_predictions: tally.total,
            avg_yield: round_to(avg_yield, 2),
            estimated_revenue: round_to(avg_yield * REVENUE_PER_UNIT, 2),
            currency: CURRENCY,
        },
        quarterly_breakdown,
        monthly_breakdown: tally.months,
        crop_distribution: tally.crops,
        risk_distribution: tally.risks,
    })
}

pub async fn quarterly(
    store: &dyn RecordStore,
    owner: Uuid,
    year: i32,
    quarter: u8,
    scan_cap: i64,
) -> Result<QuarterlyAnalytics, AnalyticsError> {
    let period = quarter_bounds(year, quarter)?;
    let records = records_in(store, owner, period, scan_cap).await?;

    let first_month = 3 * (quarter - 1) + 1;
    let mut tally = Tally::for_months(first_month..first_month + 3);
    for record in &records {
        tally.add(record);
    }
    debug!(%owner, year, quarter, records = tally.total, "quarterly analytics");

    let crops_recommended: BTreeSet<&String> = tally.crops.keys().collect();
    let last_month = period.end - time::Duration::days(1);
    let avg_yield = tally.avg_yield();
    Ok(QuarterlyAnalytics {
        year,
        quarter: format!("Q{quarter}"),
        period: format!("{} - {}", month_year(period.start), month_year(last_month)),
        total_predictions: tally.total,
        avg_yield: round_to(avg_yield, 2),
        revenue: round_to(avg_yield * REVENUE_PER_UNIT, 2),
        crops_recommended: crops_recommended.into_iter().cloned().collect(),
        monthly_breakdown: tally.months,
        crop_distribution: tally.crops,
        risk_distribution: tally.risks,
        currency: CURRENCY,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictions::repo_types::{BasicKind, BasicPrediction, DetailedPrediction, PredictionBody};
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use serde_json::{json, Value};
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

    #[test]
    fn quarter_bounds_follow_the_calendar() {
        let q1 = quarter_bounds(2025, 1).unwrap();
        assert_eq!(q1.start, datetime!(2025-01-01 0:00 UTC));
        assert_eq!(q1.end, datetime!(2025-04-01 0:00 UTC));
        let q4 = quarter_bounds(2025, 4).unwrap();
        assert_eq!(q4.start, datetime!(2025-10-01 0:00 UTC));
        assert_eq!(q4.end, datetime!(2026-01-01 0:00 UTC));
        assert!(matches!(quarter_bounds(2025, 0), Err(AnalyticsError::InvalidPeriod(_))));
        assert!(matches!(quarter_bounds(2025, 5), Err(AnalyticsError::InvalidPeriod(_))));
        assert!(year_bounds(9999).is_err());
    }

    #[test]
    fn extreme_years_are_invalid_not_overflowing() {
        for result in [
            year_bounds(i32::MAX),
            year_bounds(i32::MIN),
            quarter_bounds(i32::MAX, 4),
            quarter_bounds(i32::MAX, 1),
        ] {
            assert!(matches!(result, Err(AnalyticsError::InvalidPeriod(_))));
        }
    }

    #[test]
    fn current_quarter_from_month() {
        assert_eq!(current_quarter(datetime!(2025-01-31 0:00 UTC)), 1);
        assert_eq!(current_quarter(datetime!(2025-04-01 0:00 UTC)), 2);
        assert_eq!(current_quarter(datetime!(2025-09-30 0:00 UTC)), 3);
        assert_eq!(current_quarter(datetime!(2025-12-31 0:00 UTC)), 4);
    }

    proptest! {
        #[test]
        fn quarter_end_is_next_quarter_start(year in 1i32..9000, quarter in 1u8..=4) {
            let period = quarter_bounds(year, quarter).unwrap();
            if quarter == 4 {
                prop_assert_eq!(period.end, year_bounds(year + 1).unwrap().start);
            } else {
                prop_assert_eq!(period.end, quarter_bounds(year, quarter + 1).unwrap().start);
                prop_assert_eq!(u8::from(period.end.month()), 3 * quarter + 1);
            }
            prop_assert!(period.start < period.end);
        }
    }

    #[tokio::test]
    async fn empty_year_has_twelve_zeroed_months() {
        let store = MemoryStore::new();
        let report = yearly(&store, Uuid::new_v4(), 2025, 5000).await.unwrap();
        assert_eq!(report.monthly_breakdown.len(), 12);
        assert!(report.monthly_breakdown.keys().copied().eq(1..=12u8));
        assert!(report.monthly_breakdown.values().all(|m| *m == MonthCounts::default()));
        assert_eq!(report.summary.total_predictions, 0);
        assert_eq!(report.summary.avg_yield, 0.0);
        assert_eq!(report.risk_distribution.len(), 3);
        assert!(report.crop_distribution.is_empty());
    }

    #[tokio::test]
    async fn yearly_tallies_by_month_and_kind() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let records = [
            basic(owner, BasicKind::Yield, json!({ "yield": 200.0 }), datetime!(2025-01-10 0:00 UTC)),
            basic(owner, BasicKind::Yield, json!({ "yield": 300.0 }), datetime!(2025-01-20 0:00 UTC)),
            basic(owner, BasicKind::Crop, json!({ "crop": "rice" }), datetime!(2025-05-01 0:00 UTC)),
            basic(owner, BasicKind::Crop, json!({}), datetime!(2025-05-02 0:00 UTC)),
            basic(owner, BasicKind::Risk, json!({ "risk_level": "High" }), datetime!(2025-11-30 0:00 UTC)),
            basic(owner, BasicKind::Risk, json!({}), datetime!(2025-12-31 23:59 UTC)),
            // outside the year
            basic(owner, BasicKind::Yield, json!({ "yield": 9000.0 }), datetime!(2026-01-01 0:00 UTC)),
        ];
        for record in records {
            store.push_record(record).unwrap();
        }
        store
            .push_record(PredictionRecord {
                id: Uuid::new_v4(),
                user_id: owner,
                body: PredictionBody::Detailed(DetailedPrediction::default()),
                created_at: datetime!(2025-07-04 0:00 UTC),
            })
            .unwrap();

        let report = yearly(&store, owner, 2025, 5000).await.unwrap();
        assert_eq!(report.summary.total_predictions, 7);
        assert_eq!(report.summary.avg_yield, 250.0);
        assert_eq!(report.summary.estimated_revenue, 5000.0);
        assert_eq!(report.monthly_breakdown[&1].yield_count, 2);
        assert_eq!(report.monthly_breakdown[&5].crop, 2);
        assert_eq!(report.monthly_breakdown[&7].yield_detailed, 1);
        assert_eq!(report.monthly_breakdown[&12].total, 1);
        assert_eq!(report.quarterly_breakdown["Q1"], 2);
        assert_eq!(report.quarterly_breakdown["Q2"], 2);
        assert_eq!(report.quarterly_breakdown["Q3"], 1);
        assert_eq!(report.quarterly_breakdown["Q4"], 2);
        assert_eq!(report.crop_distribution["rice"], 1);
        assert_eq!(report.crop_distribution["Unknown"], 1);
        assert_eq!(report.risk_distribution["High"], 1);
        assert_eq!(report.risk_distribution["Low"], 1);
        assert_eq!(report.risk_distribution["Medium"], 0);
    }

    #[tokio::test]
    async fn quarterly_reports_its_window() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        for (crop, at) in [
            ("wheat", datetime!(2025-01-05 0:00 UTC)),
            ("rice", datetime!(2025-03-31 23:00 UTC)),
            ("rice", datetime!(2025-02-01 0:00 UTC)),
            ("maize", datetime!(2025-04-01 0:00 UTC)),
        ] {
            store
                .push_record(basic(owner, BasicKind::Crop, json!({ "crop": crop }), at))
                .unwrap();
        }
        store
            .push_record(basic(owner, BasicKind::Yield, json!({ "yield": 123.456 }), datetime!(2025-02-02 0:00 UTC)))
            .unwrap();

        let report = quarterly(&store, owner, 2025, 1, 5000).await.unwrap();
        assert_eq!(report.quarter, "Q1");
        assert_eq!(report.period, "January 2025 - March 2025");
        assert_eq!(report.total_predictions, 4);
        assert_eq!(report.crops_recommended, vec!["rice".to_string(), "wheat".to_string()]);
        assert_eq!(report.avg_yield, 123.46);
        assert_eq!(report.revenue, 2469.12);
        assert_eq!(report.monthly_breakdown.len(), 3);
        assert_eq!(report.currency, "INR");

        let q4 = quarterly(&store, owner, 2025, 4, 5000).await.unwrap();
        assert_eq!(q4.period, "October 2025 - December 2025");
        assert_eq!(q4.total_predictions, 0);
    }
}
