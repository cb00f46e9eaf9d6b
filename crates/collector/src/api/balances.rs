use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use common::snapshots::MAX_CHART_LIMIT;
use common::types::{
    BalanceSummary, ChartData, Network, Page, PeriodicSample, SampleFilters, SamplePosition,
    SnapshotDetails, SnapshotFilters, Wallet,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::{ok, ApiQuery, ApiResult, AppState};

const DEFAULT_PAGE_LIMIT: u32 = 20;
const DEFAULT_MAX_POINTS: u32 = 100;

/// Comma-separated list parameter; blanks are dropped.
fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub wallet_addresses: Option<String>,
    pub network_names: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl SnapshotsQuery {
    fn filters(&self) -> SnapshotFilters {
        SnapshotFilters {
            wallet_addresses: split_list(self.wallet_addresses.as_deref()),
            network_names: split_list(self.network_names.as_deref()),
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }
}

pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<SnapshotsQuery>,
) -> ApiResult<Page<SnapshotDetails>> {
    let page = state
        .store
        .snapshots_page(
            &query.filters(),
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        )
        .await?;
    Ok(ok(page))
}

/// Snapshot page for charting. Oversized limits are clamped, not rejected.
pub async fn chart_data(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<SnapshotsQuery>,
) -> ApiResult<ChartData> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_CHART_LIMIT);
    tracing::debug!(page = ?query.page, limit, "fetching chart data");
    let chart = state
        .store
        .chart_page(&query.filters(), query.page.unwrap_or(1), limit)
        .await?;
    Ok(ok(chart))
}

pub async fn latest(State(state): State<Arc<AppState>>) -> ApiResult<Vec<SnapshotDetails>> {
    Ok(ok(state.store.latest_balances().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path((wallet, network)): Path<(String, String)>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> ApiResult<Vec<SnapshotDetails>> {
    let rows = state
        .store
        .balance_history(&wallet, &network, query.start_date, query.end_date)
        .await?;
    Ok(ok(rows))
}

pub async fn summary(State(state): State<Arc<AppState>>) -> ApiResult<BalanceSummary> {
    Ok(ok(state.store.balance_summary().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct PeriodicQuery {
    pub interval_hours: Option<u32>,
    pub position: Option<String>,
    pub wallet_addresses: Option<String>,
    pub network_names: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

pub async fn periodic(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<PeriodicQuery>,
) -> ApiResult<Vec<PeriodicSample>> {
    let position = match query.position.as_deref() {
        Some(p) => p.parse::<SamplePosition>()?,
        None => SamplePosition::Last,
    };
    let filters = SampleFilters {
        wallet_addresses: split_list(query.wallet_addresses.as_deref()),
        network_names: split_list(query.network_names.as_deref()),
        since: query.since,
    };
    let rows = state
        .downsampler
        .periodic_samples(query.interval_hours.unwrap_or(1), position, &filters)
        .await?;
    Ok(ok(rows))
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeSeriesQuery {
    pub max_points: Option<u32>,
    pub wallet_addresses: Option<String>,
    pub network_names: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl TimeSeriesQuery {
    fn filters(&self) -> SampleFilters {
        SampleFilters {
            wallet_addresses: split_list(self.wallet_addresses.as_deref()),
            network_names: split_list(self.network_names.as_deref()),
            since: self.since,
        }
    }
}

pub async fn time_series(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<TimeSeriesQuery>,
) -> ApiResult<Vec<PeriodicSample>> {
    let rows = state
        .downsampler
        .time_series(&query.filters(), query.max_points.unwrap_or(DEFAULT_MAX_POINTS))
        .await?;
    Ok(ok(rows))
}

pub async fn wallet_time_series(
    State(state): State<Arc<AppState>>,
    Path(wallet): Path<String>,
    ApiQuery(query): ApiQuery<TimeSeriesQuery>,
) -> ApiResult<Vec<SnapshotDetails>> {
    let rows = state
        .downsampler
        .wallet_time_series(
            &wallet,
            query.max_points.unwrap_or(DEFAULT_MAX_POINTS),
            &query.filters(),
        )
        .await?;
    Ok(ok(rows))
}

pub async fn networks(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Network>> {
    Ok(ok(state.store.list_networks().await?))
}

pub async fn wallets(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Wallet>> {
    Ok(ok(state.store.list_wallets().await?))
}
