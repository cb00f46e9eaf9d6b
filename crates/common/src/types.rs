use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{StoreError, StoreResult};

/// A monitored network as configured at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkDescriptor {
    /// Stable lookup key (e.g. `ETH`); persisted as `networks.name`.
    pub key: String,
    pub name: String,
    pub chain_id: i64,
    pub rpc_url: String,
    pub is_native: bool,
    pub token_address: Option<String>,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub chain_id: i64,
    pub rpc_url: Option<String>,
    pub token_address: Option<String>,
    pub is_native: bool,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wallet {
    pub id: i64,
    pub address: String,
    pub label: Option<String>,
    pub is_active: bool,
}

/// A snapshot ready to be written. `balance` is a decimal integer string in
/// the smallest on-chain unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSnapshot {
    pub wallet_id: i64,
    pub network_id: i64,
    pub balance: String,
    pub block_number: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// A persisted snapshot joined with its wallet and network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotDetails {
    pub id: i64,
    pub wallet_id: i64,
    pub network_id: i64,
    pub balance: String,
    pub block_number: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub wallet_address: String,
    pub wallet_label: Option<String>,
    pub network_name: String,
    pub network_symbol: String,
    pub is_native: bool,
}

/// A snapshot selected to represent one bucket of a downsampled series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodicSample {
    #[serde(flatten)]
    pub snapshot: SnapshotDetails,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub period_index: i64,
    pub total_hours: f64,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub expected_periods: i64,
}

/// Which snapshot inside a bucket represents it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplePosition {
    First,
    Last,
}

impl SamplePosition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

impl fmt::Display for SamplePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplePosition {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => Err(StoreError::Validation(format!(
                "position must be 'first' or 'last', got '{other}'"
            ))),
        }
    }
}

/// Filters shared by the downsampling queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SampleFilters {
    #[serde(default)]
    pub wallet_addresses: Vec<String>,
    #[serde(default)]
    pub network_names: Vec<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Filters for the paginated snapshot listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SnapshotFilters {
    #[serde(default)]
    pub wallet_addresses: Vec<String>,
    #[serde(default)]
    pub network_names: Vec<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub balance: String,
    pub block_number: Option<i64>,
}

/// All points of one (wallet, network) pair, in page order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartSeries {
    pub wallet_address: String,
    pub wallet_label: Option<String>,
    pub network_name: String,
    pub network_symbol: String,
    pub is_native: bool,
    pub data_points: Vec<ChartPoint>,
}

/// One page of snapshots shaped for charting: the flat rows plus the same
/// rows grouped per pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartData {
    pub chart_data: Vec<SnapshotDetails>,
    pub time_series: Vec<ChartSeries>,
    pub pagination: PageInfo,
}

impl From<Page<SnapshotDetails>> for ChartData {
    fn from(page: Page<SnapshotDetails>) -> Self {
        let mut time_series: Vec<ChartSeries> = Vec::new();
        for row in &page.data {
            let point = ChartPoint {
                timestamp: row.timestamp,
                balance: row.balance.clone(),
                block_number: row.block_number,
            };
            // Series keep the order in which their pair first shows up.
            match time_series.iter_mut().find(|s| {
                s.wallet_address == row.wallet_address && s.network_name == row.network_name
            }) {
                Some(series) => series.data_points.push(point),
                None => time_series.push(ChartSeries {
                    wallet_address: row.wallet_address.clone(),
                    wallet_label: row.wallet_label.clone(),
                    network_name: row.network_name.clone(),
                    network_symbol: row.network_symbol.clone(),
                    is_native: row.is_native,
                    data_points: vec![point],
                }),
            }
        }
        ChartData {
            time_series,
            pagination: PageInfo {
                page: page.page,
                limit: page.limit,
                total: page.total,
                total_pages: page.total_pages,
                has_next: page.has_next,
                has_prev: page.has_prev,
            },
            chart_data: page.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkTotal {
    pub network_name: String,
    pub wallet_count: usize,
    pub total_balance: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletBalanceEntry {
    pub network_name: String,
    pub balance: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletBalances {
    pub wallet_address: String,
    pub network_count: usize,
    pub balances: Vec<WalletBalanceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSummary {
    pub total_snapshots: usize,
    pub unique_wallets: usize,
    pub unique_networks: usize,
    pub by_network: Vec<NetworkTotal>,
    pub by_wallet: Vec<WalletBalances>,
}

/// Seconds since the epoch to UTC, for timestamps read back from storage.
/// Those were written from a `DateTime<Utc>` and are always in range; anything
/// else clamps to the epoch.
pub fn from_epoch_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Seconds since the epoch to UTC for computed instants, which may fall
/// outside chrono's range.
pub fn checked_epoch_secs(secs: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::validation(format!("timestamp {secs} is out of range")))
}
