use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use std::collections::{BTreeMap, HashMap};

use crate::amount;
use crate::db::AsyncDb;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    from_epoch_secs, BalanceSummary, ChartData, Network, NetworkDescriptor, NetworkTotal, NewSnapshot, Page,
    SnapshotDetails, SnapshotFilters, Wallet, WalletBalanceEntry, WalletBalances,
};

pub const MAX_PAGE_LIMIT: u32 = 100;
pub const MAX_CHART_LIMIT: u32 = 1000;

pub(crate) const DETAIL_COLUMNS: &str = "bs.id, bs.wallet_id, bs.network_id, bs.balance, \
     bs.block_number, bs.timestamp, bs.created_at, w.address, w.label, n.name, n.symbol, n.is_native";

pub(crate) const DETAIL_JOINS: &str = "JOIN wallets w ON bs.wallet_id = w.id \
     JOIN networks n ON bs.network_id = n.id";

/// Maps the first twelve columns selected as [`DETAIL_COLUMNS`].
pub(crate) fn map_details(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotDetails> {
    Ok(SnapshotDetails {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        network_id: row.get(2)?,
        balance: row.get(3)?,
        block_number: row.get(4)?,
        timestamp: from_epoch_secs(row.get(5)?),
        created_at: from_epoch_secs(row.get(6)?),
        wallet_address: row.get(7)?,
        wallet_label: row.get(8)?,
        network_name: row.get(9)?,
        network_symbol: row.get(10)?,
        is_native: row.get::<_, i64>(11)? != 0,
    })
}

/// Incrementally built `WHERE` clause with positional parameters.
#[derive(Debug, Default)]
pub(crate) struct WhereClause {
    sql: String,
    params: Vec<Value>,
}

impl WhereClause {
    pub(crate) fn new() -> Self {
        Self {
            sql: "WHERE 1=1".to_string(),
            params: Vec::new(),
        }
    }

    pub(crate) fn any_of(&mut self, column: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        self.sql
            .push_str(&format!(" AND {column} IN ({placeholders})"));
        self.params
            .extend(values.iter().cloned().map(Value::Text));
    }

    pub(crate) fn at_least(&mut self, column: &str, ts: Option<DateTime<Utc>>) {
        if let Some(ts) = ts {
            self.sql.push_str(&format!(" AND {column} >= ?"));
            self.params.push(Value::Integer(ts.timestamp()));
        }
    }

    pub(crate) fn at_most(&mut self, column: &str, ts: Option<DateTime<Utc>>) {
        if let Some(ts) = ts {
            self.sql.push_str(&format!(" AND {column} <= ?"));
            self.params.push(Value::Integer(ts.timestamp()));
        }
    }

    pub(crate) fn sql(&self) -> &str {
        &self.sql
    }

    pub(crate) fn into_params(self) -> Vec<Value> {
        self.params
    }
}

/// Append-only persistence of balance observations plus the wallet and
/// network registries they reference.
#[derive(Clone)]
pub struct SnapshotStore {
    db: AsyncDb,
}

impl SnapshotStore {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    pub(crate) fn db(&self) -> &AsyncDb {
        &self.db
    }

    /// Insert or reactivate a wallet. A `None` label keeps the stored one.
    pub async fn upsert_wallet(&self, address: &str, label: Option<&str>) -> StoreResult<i64> {
        if address.trim().is_empty() {
            return Err(StoreError::validation("wallet address must not be empty"));
        }
        let address = address.to_string();
        let label = label.map(str::to_string);
        let id = self
            .db
            .call_named("wallets.upsert", move |conn| {
                Ok(conn.query_row(
                    "INSERT INTO wallets (address, label) VALUES (?1, ?2)
                     ON CONFLICT(address) DO UPDATE SET
                         label = COALESCE(excluded.label, wallets.label),
                         is_active = 1,
                         updated_at = unixepoch()
                     RETURNING id",
                    rusqlite::params![address, label],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(id)
    }

    /// Soft-deactivate. Returns false when the wallet is unknown or already inactive.
    pub async fn deactivate_wallet(&self, address: &str) -> StoreResult<bool> {
        let address = address.to_string();
        let changed = self
            .db
            .call_named("wallets.deactivate", move |conn| {
                Ok(conn.execute(
                    "UPDATE wallets SET is_active = 0, updated_at = unixepoch()
                     WHERE address = ?1 AND is_active = 1",
                    [address],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Create the network row or refresh its endpoint and token settings.
    pub async fn upsert_network(&self, network: &NetworkDescriptor) -> StoreResult<i64> {
        let n = network.clone();
        let id = self
            .db
            .call_named("networks.upsert", move |conn| {
                let rpc_url = Some(n.rpc_url).filter(|u| !u.is_empty());
                Ok(conn.query_row(
                    "INSERT INTO networks
                         (name, display_name, chain_id, rpc_url, token_address, is_native, symbol)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(name) DO UPDATE SET
                         display_name = excluded.display_name,
                         chain_id = excluded.chain_id,
                         rpc_url = excluded.rpc_url,
                         token_address = excluded.token_address,
                         is_native = excluded.is_native,
                         symbol = excluded.symbol,
                         updated_at = unixepoch()
                     RETURNING id",
                    rusqlite::params![
                        n.key,
                        n.name,
                        n.chain_id,
                        rpc_url,
                        n.token_address,
                        i64::from(n.is_native),
                        n.symbol,
                    ],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(id)
    }

    pub async fn list_wallets(&self) -> StoreResult<Vec<Wallet>> {
        let wallets = self
            .db
            .call_named("wallets.list", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, address, label, is_active FROM wallets
                     WHERE is_active = 1 ORDER BY address",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(Wallet {
                            id: row.get(0)?,
                            address: row.get(1)?,
                            label: row.get(2)?,
                            is_active: row.get::<_, i64>(3)? != 0,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(wallets)
    }

    pub async fn list_networks(&self) -> StoreResult<Vec<Network>> {
        let networks = self
            .db
            .call_named("networks.list", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, display_name, chain_id, rpc_url, token_address, is_native, symbol
                     FROM networks ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(Network {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            display_name: row.get(2)?,
                            chain_id: row.get(3)?,
                            rpc_url: row.get(4)?,
                            token_address: row.get(5)?,
                            is_native: row.get::<_, i64>(6)? != 0,
                            symbol: row.get(7)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(networks)
    }

    /// `{address -> wallet id}` for active wallets.
    pub async fn wallet_ids(&self) -> StoreResult<HashMap<String, i64>> {
        let map = self
            .db
            .call_named("wallets.id_map", |conn| {
                let mut stmt = conn.prepare("SELECT address, id FROM wallets WHERE is_active = 1")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<std::result::Result<HashMap<_, _>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(map)
    }

    /// `{network key -> network id}`.
    pub async fn network_ids(&self) -> StoreResult<HashMap<String, i64>> {
        let map = self
            .db
            .call_named("networks.id_map", |conn| {
                let mut stmt = conn.prepare("SELECT name, id FROM networks")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<std::result::Result<HashMap<_, _>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(map)
    }

    pub async fn create_snapshot(&self, snapshot: NewSnapshot) -> StoreResult<i64> {
        validate_snapshot(&snapshot)?;
        let created_at = Utc::now().timestamp();
        let id = self
            .db
            .call_named("snapshots.insert", move |conn| {
                conn.execute(
                    "INSERT INTO balance_snapshots
                         (wallet_id, network_id, balance, block_number, timestamp, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        snapshot.wallet_id,
                        snapshot.network_id,
                        snapshot.balance,
                        block_number_column(snapshot.block_number),
                        snapshot.timestamp.timestamp(),
                        created_at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Write a whole batch in one transaction. Either every row lands or none do.
    pub async fn bulk_create_snapshots(&self, snapshots: Vec<NewSnapshot>) -> StoreResult<usize> {
        if snapshots.is_empty() {
            return Ok(0);
        }
        for s in &snapshots {
            validate_snapshot(s)?;
        }
        let created_at = Utc::now().timestamp();
        let inserted = self
            .db
            .call_named("snapshots.bulk_insert", move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = 0_usize;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO balance_snapshots
                             (wallet_id, network_id, balance, block_number, timestamp, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for s in &snapshots {
                        inserted += stmt.execute(rusqlite::params![
                            s.wallet_id,
                            s.network_id,
                            s.balance,
                            block_number_column(s.block_number),
                            s.timestamp.timestamp(),
                            created_at,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await?;
        Ok(inserted)
    }

    /// One row per (wallet, network) among active wallets: the newest snapshot.
    pub async fn latest_balances(&self) -> StoreResult<Vec<SnapshotDetails>> {
        let rows = self
            .db
            .call_named("snapshots.latest", |conn| {
                let sql = format!(
                    "SELECT {DETAIL_COLUMNS}
                     FROM (
                         SELECT *, ROW_NUMBER() OVER (
                             PARTITION BY wallet_id, network_id
                             ORDER BY timestamp DESC, id DESC
                         ) AS rn
                         FROM balance_snapshots
                     ) bs
                     {DETAIL_JOINS}
                     WHERE bs.rn = 1 AND w.is_active = 1
                     ORDER BY w.address, n.name"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], map_details)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Balance of the newest snapshot for an exact (address, network key) pair.
    pub async fn latest_balance_for(
        &self,
        address: &str,
        network_key: &str,
    ) -> StoreResult<Option<String>> {
        let address = address.to_string();
        let network_key = network_key.to_string();
        let balance = self
            .db
            .call_named("snapshots.latest_for_pair", move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT bs.balance FROM balance_snapshots bs {DETAIL_JOINS}
                             WHERE w.address = ?1 AND n.name = ?2
                             ORDER BY bs.timestamp DESC, bs.id DESC
                             LIMIT 1"
                        ),
                        [address, network_key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        Ok(balance)
    }

    /// Ascending-timestamp history for one pair, optionally bounded on both ends.
    pub async fn balance_history(
        &self,
        address: &str,
        network_key: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<SnapshotDetails>> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(StoreError::validation("start_date must not be after end_date"));
            }
        }
        let mut clause = WhereClause::new();
        clause.any_of("w.address", &[address.to_string()]);
        clause.any_of("n.name", &[network_key.to_string()]);
        clause.at_least("bs.timestamp", from);
        clause.at_most("bs.timestamp", to);

        let rows = self
            .db
            .call_named("snapshots.history", move |conn| {
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
        Ok(rows)
    }

    /// Newest-first page of snapshots matching `filters`.
    pub async fn snapshots_page(
        &self,
        filters: &SnapshotFilters,
        page: u32,
        limit: u32,
    ) -> StoreResult<Page<SnapshotDetails>> {
        self.page_capped(filters, page, limit, MAX_PAGE_LIMIT).await
    }

    /// Same rows as [`Self::snapshots_page`] with the wider chart cap, grouped
    /// per (wallet, network).
    pub async fn chart_page(
        &self,
        filters: &SnapshotFilters,
        page: u32,
        limit: u32,
    ) -> StoreResult<ChartData> {
        let page = self.page_capped(filters, page, limit, MAX_CHART_LIMIT).await?;
        Ok(ChartData::from(page))
    }

    async fn page_capped(
        &self,
        filters: &SnapshotFilters,
        page: u32,
        limit: u32,
        max_limit: u32,
    ) -> StoreResult<Page<SnapshotDetails>> {
        if page == 0 {
            return Err(StoreError::validation("page must be >= 1"));
        }
        if limit == 0 || limit > max_limit {
            return Err(StoreError::validation(format!(
                "limit must be between 1 and {max_limit}"
            )));
        }
        let mut clause = WhereClause::new();
        clause.any_of("w.address", &filters.wallet_addresses);
        clause.any_of("n.name", &filters.network_names);
        clause.at_least("bs.timestamp", filters.start_date);
        clause.at_most("bs.timestamp", filters.end_date);

        let offset = i64::from(page - 1) * i64::from(limit);
        let (total, data) = self
            .db
            .call_named("snapshots.page", move |conn| {
                let where_sql = clause.sql().to_string();
                let mut params = clause.into_params();
                let total: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM balance_snapshots bs {DETAIL_JOINS} {where_sql}"),
                    rusqlite::params_from_iter(params.iter()),
                    |row| row.get(0),
                )?;
                params.push(Value::Integer(i64::from(limit)));
                params.push(Value::Integer(offset));
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DETAIL_COLUMNS} FROM balance_snapshots bs {DETAIL_JOINS}
                     {where_sql}
                     ORDER BY bs.timestamp DESC, bs.id DESC
                     LIMIT ? OFFSET ?"
                ))?;
                let data = stmt
                    .query_map(rusqlite::params_from_iter(params), map_details)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok((total, data))
            })
            .await?;

        let total_pages = (total + i64::from(limit) - 1) / i64::from(limit);
        Ok(Page {
            data,
            page,
            limit,
            total,
            total_pages,
            has_next: i64::from(page) < total_pages,
            has_prev: page > 1,
        })
    }

    /// Latest balances grouped by network (with exact totals) and by wallet.
    pub async fn balance_summary(&self) -> StoreResult<BalanceSummary> {
        let latest = self.latest_balances().await?;

        let mut by_network: BTreeMap<&str, Vec<&SnapshotDetails>> = BTreeMap::new();
        let mut by_wallet: BTreeMap<&str, Vec<&SnapshotDetails>> = BTreeMap::new();
        for s in &latest {
            by_network.entry(&s.network_name).or_default().push(s);
            by_wallet.entry(&s.wallet_address).or_default().push(s);
        }

        let mut network_totals = Vec::with_capacity(by_network.len());
        for (name, rows) in &by_network {
            network_totals.push(NetworkTotal {
                network_name: (*name).to_string(),
                wallet_count: rows.len(),
                total_balance: amount::sum_balances(rows.iter().map(|r| r.balance.as_str()))?,
            });
        }

        let wallet_balances = by_wallet
            .iter()
            .map(|(address, rows)| WalletBalances {
                wallet_address: (*address).to_string(),
                network_count: rows.len(),
                balances: rows
                    .iter()
                    .map(|r| WalletBalanceEntry {
                        network_name: r.network_name.clone(),
                        balance: r.balance.clone(),
                        timestamp: r.timestamp,
                    })
                    .collect(),
            })
            .collect();

        Ok(BalanceSummary {
            total_snapshots: latest.len(),
            unique_wallets: by_wallet.len(),
            unique_networks: by_network.len(),
            by_network: network_totals,
            by_wallet: wallet_balances,
        })
    }

    /// Delete snapshots observed more than `retention_days` ago.
    pub async fn cleanup_old_snapshots(&self, retention_days: u32) -> StoreResult<usize> {
        if retention_days == 0 {
            return Err(StoreError::validation("retention days must be > 0"));
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        self.delete_snapshots_before(cutoff).await
    }

    pub async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff_secs = cutoff.timestamp();
        let deleted = self
            .db
            .call_named("snapshots.cleanup", move |conn| {
                Ok(conn.execute(
                    "DELETE FROM balance_snapshots WHERE timestamp < ?1",
                    [cutoff_secs],
                )?)
            })
            .await?;
        tracing::info!(deleted, cutoff = %cutoff, "cleaned up old balance snapshots");
        Ok(deleted)
    }
}

fn validate_snapshot(s: &NewSnapshot) -> StoreResult<()> {
    if !amount::is_valid_balance(&s.balance) {
        return Err(StoreError::validation(format!(
            "balance must be a non-negative integer string, got '{}'",
            s.balance
        )));
    }
    Ok(())
}

fn block_number_column(block: Option<u64>) -> Option<i64> {
    block.and_then(|b| i64::try_from(b).ok())
}
