//! Query-time downsampling of the snapshot series.
//!
//! Buckets are laid over the span the filtered data actually covers, not a
//! calendar grid: the first bucket starts at the hour containing the earliest
//! snapshot and buckets are added until the latest snapshot is covered.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::snapshots::{map_details, SnapshotStore, WhereClause, DETAIL_COLUMNS, DETAIL_JOINS};
use crate::types::{checked_epoch_secs, PeriodicSample, SampleFilters, SamplePosition, SnapshotDetails};

pub const MAX_POINTS_LIMIT: u32 = 10_000;

/// Widest accepted bucket: one hundred leap years.
pub const MAX_INTERVAL_HOURS: u32 = 24 * 366 * 100;

const SECS_PER_HOUR: i64 = 3600;

/// Picks `amount` distinct indices from `0..population`.
pub trait SampleSource: Send {
    fn choose_indices(&mut self, population: usize, amount: usize) -> Vec<usize>;
}

/// Uniform sampling without replacement.
pub struct RngSampler<R>(pub R);

impl<R: Rng + Send> SampleSource for RngSampler<R> {
    fn choose_indices(&mut self, population: usize, amount: usize) -> Vec<usize> {
        rand::seq::index::sample(&mut self.0, population, amount.min(population)).into_vec()
    }
}

/// Earliest and latest observation time (epoch seconds) of a filtered set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSpan {
    pub first: i64,
    pub last: i64,
}

impl DataSpan {
    pub fn total_hours(&self) -> f64 {
        (self.last - self.first) as f64 / SECS_PER_HOUR as f64
    }

    pub fn is_degenerate(&self) -> bool {
        self.last <= self.first
    }

    /// Start of the first bucket: the earliest timestamp truncated to the hour.
    pub fn bucket_origin(&self) -> i64 {
        self.first - self.first.rem_euclid(SECS_PER_HOUR)
    }

    /// Buckets of `interval_hours` needed to cover the span. Zero when degenerate.
    pub fn bucket_count(&self, interval_hours: u32) -> i64 {
        if self.is_degenerate() || interval_hours == 0 {
            return 0;
        }
        let width = i64::from(interval_hours) * SECS_PER_HOUR;
        (self.last - self.bucket_origin()) / width + 1
    }

    pub fn expected_periods(&self, interval_hours: u32) -> i64 {
        if interval_hours == 0 {
            return 0;
        }
        (self.total_hours() / f64::from(interval_hours)).ceil() as i64
    }
}

/// `max(1, ceil(total_hours / max_points))`.
pub fn interval_for_points(span: &DataSpan, max_points: u32) -> u32 {
    let hours = (span.total_hours() / f64::from(max_points.max(1))).ceil();
    (hours as u32).max(1)
}

/// Exact-count selection over an ascending series: the latest row for one
/// point, otherwise the earliest and latest plus up to `max_points - 2`
/// interior rows chosen by `sampler`. Output stays ascending.
pub fn select_exact_count<T>(
    mut rows: Vec<T>,
    max_points: usize,
    sampler: &mut dyn SampleSource,
) -> Vec<T> {
    let n = rows.len();
    if n == 0 || max_points == 0 {
        return Vec::new();
    }
    if max_points == 1 {
        return rows.pop().into_iter().collect();
    }
    if n <= max_points {
        return rows;
    }

    let mut keep = vec![false; n];
    keep[0] = true;
    keep[n - 1] = true;
    let interior = n - 2;
    for i in sampler.choose_indices(interior, max_points - 2) {
        if i < interior {
            keep[i + 1] = true;
        }
    }
    rows.into_iter()
        .zip(keep)
        .filter_map(|(row, kept)| kept.then_some(row))
        .collect()
}

fn sample_clause(filters: &SampleFilters) -> WhereClause {
    let mut clause = WhereClause::new();
    clause.any_of("w.address", &filters.wallet_addresses);
    clause.any_of("n.name", &filters.network_names);
    clause.at_least("bs.timestamp", filters.since);
    clause
}

fn check_max_points(max_points: u32) -> StoreResult<()> {
    if max_points == 0 || max_points > MAX_POINTS_LIMIT {
        return Err(StoreError::validation(format!(
            "max_points must be between 1 and {MAX_POINTS_LIMIT}"
        )));
    }
    Ok(())
}

type SamplerFactory = dyn Fn() -> Box<dyn SampleSource> + Send + Sync;

#[derive(Clone)]
pub struct TimeSeriesDownsampler {
    store: SnapshotStore,
    /// Every `wallet_time_series` call draws from its own sampler.
    new_sampler: Arc<SamplerFactory>,
}

impl TimeSeriesDownsampler {
    pub fn new(store: SnapshotStore) -> Self {
        Self::with_sampler(store, || RngSampler(StdRng::from_entropy()))
    }

    pub fn with_sampler<S, F>(store: SnapshotStore, factory: F) -> Self
    where
        S: SampleSource + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            store,
            new_sampler: Arc::new(move || Box::new(factory()) as Box<dyn SampleSource>),
        }
    }

    /// Observed span of the filtered snapshots, `None` when nothing matches.
    pub async fn data_span(&self, filters: &SampleFilters) -> StoreResult<Option<DataSpan>> {
        let clause = sample_clause(filters);
        let span = self
            .store
            .db()
            .call_named("downsample.span", move |conn| {
                let sql = format!(
                    "SELECT MIN(bs.timestamp), MAX(bs.timestamp)
                     FROM balance_snapshots bs {DETAIL_JOINS} {where_sql}",
                    where_sql = clause.sql()
                );
                let (first, last): (Option<i64>, Option<i64>) = conn.query_row(
                    &sql,
                    rusqlite::params_from_iter(clause.into_params()),
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(first.zip(last).map(|(first, last)| DataSpan { first, last }))
            })
            .await?;
        Ok(span)
    }

    /// One representative snapshot per (bucket, wallet, network): the earliest
    /// in the bucket for [`SamplePosition::First`], the latest for `Last`.
    /// Pairs with no snapshot in a bucket contribute nothing to it.
    pub async fn periodic_samples(
        &self,
        interval_hours: u32,
        position: SamplePosition,
        filters: &SampleFilters,
    ) -> StoreResult<Vec<PeriodicSample>> {
        if interval_hours == 0 || interval_hours > MAX_INTERVAL_HOURS {
            return Err(StoreError::validation(format!(
                "interval_hours must be between 1 and {MAX_INTERVAL_HOURS}"
            )));
        }
        let Some(span) = self.data_span(filters).await? else {
            return Ok(Vec::new());
        };
        if span.is_degenerate() {
            tracing::debug!(first = span.first, "zero data span; no buckets");
            return Ok(Vec::new());
        }

        let origin = span.bucket_origin();
        let width = i64::from(interval_hours) * SECS_PER_HOUR;
        let order = match position {
            SamplePosition::First => "ASC",
            SamplePosition::Last => "DESC",
        };
        let clause = sample_clause(filters);

        let rows = self
            .store
            .db()
            .call_named("downsample.periodic", move |conn| {
                let sql = format!(
                    "WITH scoped AS (
                         SELECT bs.*, (bs.timestamp - ?) / ? AS period_index
                         FROM balance_snapshots bs {DETAIL_JOINS} {where_sql}
                     ), ranked AS (
                         SELECT scoped.*, ROW_NUMBER() OVER (
                             PARTITION BY period_index, wallet_id, network_id
                             ORDER BY timestamp {order}, id {order}
                         ) AS rn
                         FROM scoped
                     )
                     SELECT {DETAIL_COLUMNS}, bs.period_index
                     FROM ranked bs {DETAIL_JOINS}
                     WHERE bs.rn = 1
                     ORDER BY bs.period_index, w.address, n.name",
                    where_sql = clause.sql()
                );
                let mut params = vec![
                    rusqlite::types::Value::Integer(origin),
                    rusqlite::types::Value::Integer(width),
                ];
                params.extend(clause.into_params());
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params), |row| {
                        Ok((map_details(row)?, row.get::<_, i64>(12)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let total_hours = span.total_hours();
        let expected_periods = span.expected_periods(interval_hours);
        let first_timestamp = checked_epoch_secs(span.first)?;
        let last_timestamp = checked_epoch_secs(span.last)?;
        rows.into_iter()
            .map(|(snapshot, period_index)| {
                let period_start = origin + period_index * width;
                Ok(PeriodicSample {
                    snapshot,
                    period_start: checked_epoch_secs(period_start)?,
                    period_end: checked_epoch_secs(period_start + width)?,
                    period_index,
                    total_hours,
                    first_timestamp,
                    last_timestamp,
                    expected_periods,
                })
            })
            .collect()
    }

    /// Roughly `max_points` buckets over the observed span, latest-in-bucket.
    pub async fn time_series(
        &self,
        filters: &SampleFilters,
        max_points: u32,
    ) -> StoreResult<Vec<PeriodicSample>> {
        check_max_points(max_points)?;
        let Some(span) = self.data_span(filters).await? else {
            return Ok(Vec::new());
        };
        if span.is_degenerate() {
            return Ok(Vec::new());
        }
        let interval_hours = interval_for_points(&span, max_points);
        tracing::debug!(
            max_points,
            interval_hours,
            total_hours = span.total_hours(),
            "time series interval derived from data span"
        );
        self.periodic_samples(interval_hours, SamplePosition::Last, filters)
            .await
    }

    /// Exactly `min(max_points, available)` snapshots of one wallet, always
    /// including its earliest and latest (or only the latest when one point is
    /// requested). Network and `since` filters apply; wallet filters are
    /// replaced by `address`.
    pub async fn wallet_time_series(
        &self,
        address: &str,
        max_points: u32,
        filters: &SampleFilters,
    ) -> StoreResult<Vec<SnapshotDetails>> {
        check_max_points(max_points)?;
        let scoped = SampleFilters {
            wallet_addresses: vec![address.to_string()],
            ..filters.clone()
        };
        let clause = sample_clause(&scoped);
        let rows = self
            .store
            .db()
            .call_named("downsample.wallet_rows", move |conn| {
                let sql = format!(
                    "SELECT {DETAIL_COLUMNS} FROM balance_snapshots bs {DETAIL_JOINS}
                     {where_sql}
                     ORDER BY bs.timestamp ASC, bs.id ASC",
                    where_sql = clause.sql()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(clause.into_params()), map_details)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut sampler = (self.new_sampler)();
        Ok(select_exact_count(
            rows,
            max_points as usize,
            sampler.as_mut(),
        ))
    }
}
