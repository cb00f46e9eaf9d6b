use anyhow::Result;
use chrono::{DateTime, Utc};
use common::config::WalletConfig;
use common::error::{StoreError, StoreResult};
use common::snapshots::SnapshotStore;
use common::types::{NetworkDescriptor, NewSnapshot};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn, Instrument};

use crate::chain::{BalanceFetcher, BalanceReading, FetchError, TokenInfo};
use crate::coordinator::{CollectedBalance, ResilientFetchCoordinator};
use crate::scheduler::CronTrigger;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("unresolved {kind} '{key}'")]
    Reference { kind: &'static str, key: String },
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// Natural key to storage id, rebuilt wholesale by `refresh_lookup_maps`.
#[derive(Debug, Default)]
struct LookupMaps {
    wallets: HashMap<String, i64>,
    networks: HashMap<String, i64>,
}

impl LookupMaps {
    fn resolve(&self, reading: &BalanceReading) -> Result<(i64, i64), MonitorError> {
        let wallet = self
            .wallets
            .get(&reading.address)
            .ok_or_else(|| MonitorError::Reference {
                kind: "wallet",
                key: reading.address.clone(),
            })?;
        let network = self
            .networks
            .get(&reading.network_key)
            .ok_or_else(|| MonitorError::Reference {
                kind: "network",
                key: reading.network_key.clone(),
            })?;
        Ok((*wallet, *network))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub fetched: usize,
    pub stored: usize,
    pub skipped: usize,
    pub fallbacks: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was in flight; this one was dropped.
    Skipped,
    Completed(CycleReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub is_running: bool,
    pub is_monitoring: bool,
    pub schedule: Option<String>,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub networks: BTreeMap<String, bool>,
    pub monitoring: MonitorStatus,
    pub latest_balances: usize,
    pub timestamp: DateTime<Utc>,
}

/// Clears the in-flight flag however the cycle ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives periodic collection: at most one cycle at a time, one bulk write
/// per cycle.
pub struct MonitoringService<F> {
    store: SnapshotStore,
    fetcher: Arc<F>,
    coordinator: ResilientFetchCoordinator<F, SnapshotStore>,
    networks: Vec<NetworkDescriptor>,
    wallets: Vec<WalletConfig>,
    lookups: RwLock<LookupMaps>,
    in_flight: AtomicBool,
    trigger: Mutex<Option<CronTrigger>>,
    last_cycle: RwLock<Option<CycleReport>>,
}

impl<F> MonitoringService<F>
where
    F: BalanceFetcher + 'static,
{
    pub fn new(
        store: SnapshotStore,
        fetcher: Arc<F>,
        networks: Vec<NetworkDescriptor>,
        wallets: Vec<WalletConfig>,
    ) -> Self {
        let coordinator =
            ResilientFetchCoordinator::new(Arc::clone(&fetcher), Arc::new(store.clone()));
        Self {
            store,
            fetcher,
            coordinator,
            networks,
            wallets,
            lookups: RwLock::new(LookupMaps::default()),
            in_flight: AtomicBool::new(false),
            trigger: Mutex::new(None),
            last_cycle: RwLock::new(None),
        }
    }

    pub fn networks(&self) -> &[NetworkDescriptor] {
        &self.networks
    }

    pub fn network(&self, key: &str) -> Option<&NetworkDescriptor> {
        self.networks.iter().find(|n| n.key == key)
    }

    /// Register configured wallets and networks, load the identifier caches,
    /// and check every network connection once.
    pub async fn initialize(&self) -> Result<()> {
        for wallet in &self.wallets {
            if let Err(e) = self
                .store
                .upsert_wallet(&wallet.address, wallet.label.as_deref())
                .await
            {
                error!(wallet = %wallet.address, error = %e, "failed to register wallet");
            }
        }
        for network in &self.networks {
            if network.rpc_url.is_empty() {
                warn!(network = %network.key, "no RPC endpoint configured");
            }
            if let Err(e) = self.store.upsert_network(network).await {
                error!(network = %network.key, error = %e, "failed to register network");
            }
        }
        self.refresh_lookup_maps().await?;

        for (network, ok) in self.fetcher.test_all_connections(&self.networks).await {
            if !ok {
                warn!(network = %network, "network unreachable at startup");
            }
        }
        info!(
            wallets = self.wallets.len(),
            networks = self.networks.len(),
            "balance monitoring initialized"
        );
        Ok(())
    }

    /// Reload both identifier caches from storage. Wallets or networks added
    /// elsewhere are invisible to collection until this runs.
    pub async fn refresh_lookup_maps(&self) -> StoreResult<()> {
        let wallets = self.store.wallet_ids().await?;
        let networks = self.store.network_ids().await?;
        info!(
            wallets = wallets.len(),
            networks = networks.len(),
            "identifier caches loaded"
        );
        *self.lookups.write().await = LookupMaps { wallets, networks };
        Ok(())
    }

    /// Run one collection cycle unless one is already in flight, in which case
    /// this call is dropped.
    pub async fn fetch_and_store_balances(&self) -> CycleOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("balance fetch already in progress; skipping");
            metrics::counter!("collector_cycles_total", "status" => "skipped").increment(1);
            return CycleOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);

        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let span = tracing::info_span!("collection_cycle", started_at = %started_at);

        let mut report = CycleReport {
            started_at,
            duration_ms: 0,
            fetched: 0,
            stored: 0,
            skipped: 0,
            fallbacks: 0,
            error: None,
        };
        let res = self.collect(&mut report).instrument(span.clone()).await;
        report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        metrics::histogram!("collector_cycle_duration_ms").record(report.duration_ms as f64);

        span.in_scope(|| match res {
            Ok(()) => {
                metrics::counter!("collector_cycles_total", "status" => "completed").increment(1);
                info!(
                    fetched = report.fetched,
                    stored = report.stored,
                    skipped = report.skipped,
                    fallbacks = report.fallbacks,
                    duration_ms = report.duration_ms,
                    "balance fetch cycle completed"
                );
            }
            Err(e) => {
                metrics::counter!("collector_cycles_total", "status" => "failed").increment(1);
                error!(error = %e, "balance fetch cycle failed");
                report.error = Some(e.to_string());
            }
        });

        *self.last_cycle.write().await = Some(report.clone());
        CycleOutcome::Completed(report)
    }

    async fn collect(&self, report: &mut CycleReport) -> Result<(), MonitorError> {
        let addresses: Vec<String> = self.wallets.iter().map(|w| w.address.clone()).collect();
        info!(
            wallets = addresses.len(),
            networks = self.networks.len(),
            "starting balance fetch cycle"
        );
        let results = self
            .coordinator
            .get_multiple_balances(&self.networks, &addresses)
            .await;
        report.fetched = results.len();
        report.fallbacks = results.iter().filter(|r| r.source.is_fallback()).count();

        let (batch, skipped) = self.resolve_batch(&results).await;
        report.skipped = skipped;

        let stored = self.store.bulk_create_snapshots(batch).await?;
        report.stored = stored;
        metrics::counter!("collector_snapshots_stored_total").increment(stored as u64);
        Ok(())
    }

    async fn resolve_batch(&self, results: &[CollectedBalance]) -> (Vec<NewSnapshot>, usize) {
        let lookups = self.lookups.read().await;
        let mut batch = Vec::with_capacity(results.len());
        let mut skipped = 0;
        for r in results {
            match lookups.resolve(&r.reading) {
                Ok((wallet_id, network_id)) => batch.push(NewSnapshot {
                    wallet_id,
                    network_id,
                    balance: r.reading.balance.clone(),
                    block_number: r.reading.block_number,
                    timestamp: r.reading.timestamp,
                }),
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping balance with unresolved reference");
                }
            }
        }
        (batch, skipped)
    }

    /// Fire a cycle in the background; the caller is never blocked by it.
    pub fn trigger_balance_fetch(self: &Arc<Self>) {
        info!("manual balance fetch triggered");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.fetch_and_store_balances().await;
        });
    }

    /// Bind collection to `pattern`. Returns false if monitoring is already on.
    pub async fn start_monitoring(self: &Arc<Self>, pattern: &str) -> Result<bool> {
        let mut trigger = self.trigger.lock().await;
        if trigger.is_some() {
            warn!("monitoring already started");
            return Ok(false);
        }
        let weak = Arc::downgrade(self);
        let started = CronTrigger::start(pattern, move || {
            let weak = weak.clone();
            async move {
                if let Some(service) = weak.upgrade() {
                    service.fetch_and_store_balances().await;
                }
            }
        })
        .await?;
        info!(schedule = %started.pattern(), "balance monitoring started");
        *trigger = Some(started);
        Ok(true)
    }

    /// Release the trigger. Returns false if monitoring was not on.
    pub async fn stop_monitoring(&self) -> Result<bool> {
        let Some(trigger) = self.trigger.lock().await.take() else {
            return Ok(false);
        };
        trigger.shutdown().await?;
        info!("balance monitoring stopped");
        Ok(true)
    }

    pub async fn status(&self) -> MonitorStatus {
        let schedule = self
            .trigger
            .lock()
            .await
            .as_ref()
            .map(|t| t.pattern().to_string());
        MonitorStatus {
            is_running: self.in_flight.load(Ordering::Acquire),
            is_monitoring: schedule.is_some(),
            schedule,
            last_cycle: self.last_cycle.read().await.clone(),
        }
    }

    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> StoreResult<usize> {
        info!(days_to_keep, "cleaning up old balance snapshots");
        self.store.cleanup_old_snapshots(days_to_keep).await
    }

    /// `None` when `key` is not a configured network.
    pub async fn test_connection(&self, key: &str) -> Option<bool> {
        let network = self.network(key)?;
        Some(self.fetcher.test_connection(network).await)
    }

    pub async fn test_all_connections(&self) -> BTreeMap<String, bool> {
        self.fetcher
            .test_all_connections(&self.networks)
            .await
            .into_iter()
            .collect()
    }

    /// `Ok(None)` for native networks; unknown keys are the caller's concern.
    pub async fn token_info(
        &self,
        network: &NetworkDescriptor,
    ) -> Result<Option<TokenInfo>, FetchError> {
        self.fetcher.token_info(network).await
    }

    pub async fn health(&self) -> StoreResult<HealthReport> {
        let networks = self.test_all_connections().await;
        let latest_balances = self.store.latest_balances().await?.len();
        Ok(HealthReport {
            healthy: networks.values().all(|ok| *ok),
            networks,
            monitoring: self.status().await,
            latest_balances,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::test_fakes::{network, FakeFetcher};
    use common::db::AsyncDb;
    use std::time::Duration;

    fn wallet(address: &str) -> WalletConfig {
        WalletConfig {
            address: address.to_string(),
            label: None,
        }
    }

    async fn service(
        fetcher: FakeFetcher,
        networks: &[&str],
        wallets: &[&str],
    ) -> (Arc<MonitoringService<FakeFetcher>>, SnapshotStore, AsyncDb) {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let store = SnapshotStore::new(db.clone());
        let svc = Arc::new(MonitoringService::new(
            store.clone(),
            Arc::new(fetcher),
            networks.iter().map(|k| network(k)).collect(),
            wallets.iter().map(|a| wallet(a)).collect(),
        ));
        svc.initialize().await.unwrap();
        (svc, store, db)
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            CycleOutcome::Skipped => panic!("cycle was skipped"),
        }
    }

    #[tokio::test]
    async fn test_cycle_stores_full_matrix() {
        let fetcher = FakeFetcher::with(&[
            ("ETH", "0xA", "1"),
            ("ETH", "0xB", "2"),
            ("EDGEN", "0xA", "3"),
            ("EDGEN", "0xB", "4"),
        ]);
        let (svc, store, _db) = service(fetcher, &["ETH", "EDGEN"], &["0xA", "0xB"]).await;

        let report = completed(svc.fetch_and_store_balances().await);
        assert_eq!(report.fetched, 4);
        assert_eq!(report.stored, 4);
        assert_eq!(report.fallbacks, 0);
        assert!(report.error.is_none());
        assert_eq!(store.latest_balances().await.unwrap().len(), 4);
        assert!(!svc.status().await.is_running);
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_dropped() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let fetcher = FakeFetcher {
            gate: Some(Arc::clone(&gate)),
            ..FakeFetcher::with(&[("ETH", "0xA", "5")])
        };
        let (svc, store, _db) = service(fetcher, &["ETH"], &["0xA"]).await;

        let first = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.fetch_and_store_balances().await })
        };
        while !svc.status().await.is_running {
            tokio::task::yield_now().await;
        }

        assert_eq!(svc.fetch_and_store_balances().await, CycleOutcome::Skipped);

        gate.notify_one();
        let report = completed(first.await.unwrap());
        assert_eq!(report.stored, 1);

        let history = store.balance_history("0xA", "ETH", None, None).await.unwrap();
        assert_eq!(history.len(), 1, "exactly one batch persisted");
        assert!(!svc.status().await.is_running);
    }

    #[tokio::test]
    async fn test_failed_fetch_stores_last_known_balance() {
        let (svc, store, _db) = service(
            FakeFetcher::with(&[("ETH", "0xA", "77")]),
            &["ETH", "EDGEN"],
            &["0xA"],
        )
        .await;
        completed(svc.fetch_and_store_balances().await);

        // Same database, but every live read now fails.
        let offline = MonitoringService::new(
            store.clone(),
            Arc::new(FakeFetcher::default()),
            vec![network("ETH"), network("EDGEN")],
            vec![wallet("0xA")],
        );
        offline.refresh_lookup_maps().await.unwrap();
        let report = completed(offline.fetch_and_store_balances().await);
        assert_eq!(report.fallbacks, 2);
        assert_eq!(report.stored, 2);

        let eth = store.balance_history("0xA", "ETH", None, None).await.unwrap();
        assert_eq!(eth.len(), 2);
        assert_eq!(eth[1].balance, "77");
        assert_eq!(eth[1].block_number, None);
        let edgen = store.latest_balance_for("0xA", "EDGEN").await.unwrap();
        assert_eq!(edgen.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_unresolved_wallet_skipped_until_refresh() {
        let fetcher = FakeFetcher::with(&[("ETH", "0xA", "1"), ("ETH", "0xB", "2")]);
        let (svc, store, _db) = service(fetcher, &["ETH"], &["0xA", "0xB"]).await;

        store.deactivate_wallet("0xB").await.unwrap();
        svc.refresh_lookup_maps().await.unwrap();
        let report = completed(svc.fetch_and_store_balances().await);
        assert_eq!((report.stored, report.skipped), (1, 1));

        // Reactivated in storage but the cache is stale.
        store.upsert_wallet("0xB", None).await.unwrap();
        let report = completed(svc.fetch_and_store_balances().await);
        assert_eq!((report.stored, report.skipped), (1, 1));

        svc.refresh_lookup_maps().await.unwrap();
        let report = completed(svc.fetch_and_store_balances().await);
        assert_eq!((report.stored, report.skipped), (2, 0));
    }

    #[tokio::test]
    async fn test_persistence_failure_recorded_and_flag_released() {
        let (svc, _store, db) =
            service(FakeFetcher::with(&[("ETH", "0xA", "1")]), &["ETH"], &["0xA"]).await;
        // Cache still points at the removed network; the insert violates its foreign key.
        db.call(|conn| Ok(conn.execute("DELETE FROM networks", [])?))
            .await
            .unwrap();

        let report = completed(svc.fetch_and_store_balances().await);
        assert!(report.error.is_some());
        assert_eq!(report.stored, 0);

        let status = svc.status().await;
        assert!(!status.is_running);
        assert_eq!(status.last_cycle, Some(report));
    }

    #[tokio::test]
    async fn test_start_stop_monitoring_is_idempotent() {
        let (svc, _store, _db) =
            service(FakeFetcher::with(&[("ETH", "0xA", "1")]), &["ETH"], &["0xA"]).await;

        assert!(svc.start_monitoring("* * * * *").await.unwrap());
        assert!(!svc.start_monitoring("*/5 * * * *").await.unwrap());
        let status = svc.status().await;
        assert!(status.is_monitoring);
        assert_eq!(status.schedule.as_deref(), Some("0 * * * * *"));

        assert!(svc.stop_monitoring().await.unwrap());
        assert!(!svc.stop_monitoring().await.unwrap());
        assert!(!svc.status().await.is_monitoring);
        assert!(svc.start_monitoring("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_scheduled_ticks_collect() {
        let (svc, store, _db) =
            service(FakeFetcher::with(&[("ETH", "0xA", "1")]), &["ETH"], &["0xA"]).await;
        svc.start_monitoring("* * * * * *").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        svc.stop_monitoring().await.unwrap();
        let history = store.balance_history("0xA", "ETH", None, None).await.unwrap();
        assert!(!history.is_empty());
    }

    #[tokio::test]
    async fn test_health_and_connection_checks() {
        let (svc, _store, _db) = service(
            FakeFetcher::with(&[("ETH", "0xA", "1")]),
            &["ETH", "BSC"],
            &["0xA"],
        )
        .await;
        assert_eq!(svc.test_connection("ETH").await, Some(true));
        assert_eq!(svc.test_connection("BSC").await, Some(false));
        assert_eq!(svc.test_connection("NOPE").await, None);

        let health = svc.health().await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.networks.len(), 2);
        assert_eq!(health.latest_balances, 0);
    }

    #[tokio::test]
    async fn test_cleanup_validates_days() {
        let (svc, _store, _db) = service(FakeFetcher::default(), &["ETH"], &["0xA"]).await;
        assert!(svc.cleanup_old_data(0).await.unwrap_err().is_validation());
        assert_eq!(svc.cleanup_old_data(30).await.unwrap(), 0);
    }
}
