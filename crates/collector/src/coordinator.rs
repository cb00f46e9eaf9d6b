use chrono::Utc;
use common::error::StoreResult;
use common::snapshots::SnapshotStore;
use common::types::NetworkDescriptor;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::chain::{BalanceFetcher, BalanceReading};

/// Most recent persisted balance for an exact (address, network key) pair.
pub trait LastKnownBalance: Send + Sync {
    fn last_known_balance(
        &self,
        address: &str,
        network_key: &str,
    ) -> impl Future<Output = StoreResult<Option<String>>> + Send;
}

impl LastKnownBalance for SnapshotStore {
    async fn last_known_balance(
        &self,
        address: &str,
        network_key: &str,
    ) -> StoreResult<Option<String>> {
        self.latest_balance_for(address, network_key).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSource {
    Live,
    /// Live read failed; substituted the last persisted balance.
    LastKnown,
    /// Live read failed and nothing was persisted yet.
    Default,
}

impl BalanceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::LastKnown => "last_known",
            Self::Default => "default",
        }
    }

    pub fn is_fallback(self) -> bool {
        self != Self::Live
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectedBalance {
    #[serde(flatten)]
    pub reading: BalanceReading,
    pub source: BalanceSource,
}

/// Fans balance reads out across every (network, wallet) pair and never lets
/// one failure affect another.
pub struct ResilientFetchCoordinator<F, L> {
    fetcher: Arc<F>,
    fallback: Arc<L>,
}

impl<F, L> ResilientFetchCoordinator<F, L>
where
    F: BalanceFetcher,
    L: LastKnownBalance,
{
    pub fn new(fetcher: Arc<F>, fallback: Arc<L>) -> Self {
        Self { fetcher, fallback }
    }

    /// One result per pair of the cross product, all requested concurrently.
    pub async fn get_multiple_balances(
        &self,
        networks: &[NetworkDescriptor],
        addresses: &[String],
    ) -> Vec<CollectedBalance> {
        let calls = networks
            .iter()
            .flat_map(|n| addresses.iter().map(move |a| self.fetch_one(n, a)));
        futures::future::join_all(calls).await
    }

    async fn fetch_one(&self, network: &NetworkDescriptor, address: &str) -> CollectedBalance {
        let err = match self.fetcher.get_balance(network, address).await {
            Ok(reading) => {
                return CollectedBalance {
                    reading,
                    source: BalanceSource::Live,
                }
            }
            Err(e) => e,
        };

        metrics::counter!(
            "collector_fetch_failures_total",
            "network" => network.key.clone(),
            "kind" => err.kind(),
        )
        .increment(1);

        let (balance, source) = match self
            .fallback
            .last_known_balance(address, &network.key)
            .await
        {
            Ok(Some(balance)) => (balance, BalanceSource::LastKnown),
            Ok(None) => ("0".to_string(), BalanceSource::Default),
            Err(lookup_err) => {
                warn!(
                    network = %network.key,
                    wallet = %address,
                    error = %lookup_err,
                    "last-known balance lookup failed"
                );
                ("0".to_string(), BalanceSource::Default)
            }
        };

        warn!(
            network = %network.key,
            wallet = %address,
            error = %err,
            fallback = source.as_str(),
            "balance fetch failed; substituting"
        );
        metrics::counter!(
            "collector_fallback_substitutions_total",
            "network" => network.key.clone(),
            "source" => source.as_str(),
        )
        .increment(1);

        CollectedBalance {
            reading: BalanceReading {
                address: address.to_string(),
                network_key: network.key.clone(),
                balance,
                block_number: None,
                timestamp: Utc::now(),
            },
            source,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_fakes::*;
    use super::*;
    use common::db::AsyncDb;
    use common::types::NewSnapshot;
    use metrics_exporter_prometheus::PrometheusBuilder;

    struct MapFallback(Option<String>);

    impl LastKnownBalance for MapFallback {
        async fn last_known_balance(&self, _: &str, _: &str) -> StoreResult<Option<String>> {
            Ok(self.0.clone())
        }
    }

    fn find<'a>(rows: &'a [CollectedBalance], net: &str, addr: &str) -> &'a CollectedBalance {
        rows.iter()
            .find(|r| r.reading.network_key == net && r.reading.address == addr)
            .unwrap()
    }

    #[tokio::test]
    async fn test_cross_product_with_isolated_failures() {
        let fetcher = Arc::new(FakeFetcher::with(&[
            ("ETH", "0xA", "10"),
            ("ETH", "0xB", "20"),
            ("EDGEN", "0xA", "30"),
        ]));
        let coordinator =
            ResilientFetchCoordinator::new(Arc::clone(&fetcher), Arc::new(MapFallback(None)));
        let rows = coordinator
            .get_multiple_balances(
                &[network("ETH"), network("EDGEN")],
                &["0xA".to_string(), "0xB".to_string()],
            )
            .await;

        assert_eq!(rows.len(), 4);
        assert_eq!(find(&rows, "ETH", "0xB").reading.balance, "20");
        assert_eq!(find(&rows, "ETH", "0xB").source, BalanceSource::Live);
        let failed = find(&rows, "EDGEN", "0xB");
        assert_eq!(failed.reading.balance, "0");
        assert_eq!(failed.source, BalanceSource::Default);
        assert_eq!(failed.reading.block_number, None);
    }

    #[tokio::test]
    async fn test_failure_uses_last_known_value() {
        let coordinator = ResilientFetchCoordinator::new(
            Arc::new(FakeFetcher::default()),
            Arc::new(MapFallback(Some("123456789012345678901234567890".to_string()))),
        );
        let rows = coordinator
            .get_multiple_balances(&[network("ETH")], &["0xA".to_string()])
            .await;
        assert_eq!(rows[0].reading.balance, "123456789012345678901234567890");
        assert_eq!(rows[0].source, BalanceSource::LastKnown);
    }

    #[tokio::test]
    async fn test_snapshot_store_serves_most_recent_prior_balance() {
        let store = SnapshotStore::new(AsyncDb::open(":memory:").await.unwrap());
        let wallet = store.upsert_wallet("0xA", None).await.unwrap();
        let eth = store.upsert_network(&network("ETH")).await.unwrap();
        for (balance, ts) in [("5", 1_700_000_000), ("9", 1_700_000_600)] {
            store
                .create_snapshot(NewSnapshot {
                    wallet_id: wallet,
                    network_id: eth,
                    balance: balance.to_string(),
                    block_number: None,
                    timestamp: common::types::from_epoch_secs(ts),
                })
                .await
                .unwrap();
        }

        let coordinator =
            ResilientFetchCoordinator::new(Arc::new(FakeFetcher::default()), Arc::new(store));
        let rows = coordinator
            .get_multiple_balances(
                &[network("ETH"), network("EDGEN")],
                &["0xA".to_string()],
            )
            .await;
        assert_eq!(find(&rows, "ETH", "0xA").reading.balance, "9");
        assert_eq!(find(&rows, "EDGEN", "0xA").reading.balance, "0");
    }

    #[tokio::test]
    async fn test_empty_inputs_issue_no_calls() {
        let fetcher = Arc::new(FakeFetcher::default());
        let coordinator =
            ResilientFetchCoordinator::new(Arc::clone(&fetcher), Arc::new(MapFallback(None)));
        assert!(coordinator
            .get_multiple_balances(&[network("ETH")], &[])
            .await
            .is_empty());
        assert_eq!(
            fetcher.calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn test_fallback_metrics_emitted() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let rt = tokio::runtime::Runtime::new().unwrap();

        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let coordinator = ResilientFetchCoordinator::new(
                    Arc::new(FakeFetcher::default()),
                    Arc::new(MapFallback(None)),
                );
                coordinator
                    .get_multiple_balances(&[network("BSC")], &["0xA".to_string()])
                    .await;
            });
        });

        let rendered = handle.render();
        assert!(rendered.contains("collector_fetch_failures_total"), "{rendered}");
        assert!(rendered.contains("collector_fallback_substitutions_total"), "{rendered}");
        assert!(rendered.contains("source=\"default\""), "{rendered}");
    }
}
