use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::transports::{RpcError, TransportErrorKind};
use chrono::{DateTime, Utc};
use common::types::NetworkDescriptor;
use serde::Serialize;
use std::future::{Future, IntoFuture};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::erc20::IERC20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Endpoint unreachable, timed out, non-2xx, or rejected a core RPC method.
    #[error("{network}: connectivity error: {message}")]
    Connectivity { network: String, message: String },
    /// Contract call reverted or returned something that is not a balance.
    #[error("{network}: contract call failed: {message}")]
    ContractCall { network: String, message: String },
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "connectivity",
            Self::ContractCall { .. } => "contract_call",
        }
    }
}

/// A live balance observation for one (wallet, network) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceReading {
    pub address: String,
    pub network_key: String,
    /// Decimal integer, smallest on-chain unit.
    pub balance: String,
    pub block_number: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

pub trait BalanceFetcher: Send + Sync {
    fn get_balance(
        &self,
        network: &NetworkDescriptor,
        address: &str,
    ) -> impl Future<Output = Result<BalanceReading, FetchError>> + Send;

    fn block_number(
        &self,
        network: &NetworkDescriptor,
    ) -> impl Future<Output = Result<u64, FetchError>> + Send;

    /// `None` for native-asset networks.
    fn token_info(
        &self,
        network: &NetworkDescriptor,
    ) -> impl Future<Output = Result<Option<TokenInfo>, FetchError>> + Send;

    /// Liveness check. Never fails; an unreachable network reports `false`.
    fn test_connection(&self, network: &NetworkDescriptor) -> impl Future<Output = bool> + Send {
        async move {
            match self.block_number(network).await {
                Ok(block) => {
                    info!(network = %network.key, block, "network connection ok");
                    true
                }
                Err(e) => {
                    warn!(network = %network.key, error = %e, "network connection failed");
                    false
                }
            }
        }
    }

    /// Check every network concurrently, results in input order.
    fn test_all_connections(
        &self,
        networks: &[NetworkDescriptor],
    ) -> impl Future<Output = Vec<(String, bool)>> + Send {
        async move {
            let checks = networks.iter().map(|n| async move {
                (n.key.clone(), self.test_connection(n).await)
            });
            futures::future::join_all(checks).await
        }
    }
}

/// Reads balances from EVM-compatible networks over an alloy HTTP provider.
pub struct ChainClient {
    timeout: Duration,
}

impl ChainClient {
    /// `timeout` bounds every individual RPC round trip.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn provider(network: &NetworkDescriptor) -> Result<impl Provider, FetchError> {
        if network.rpc_url.is_empty() {
            return Err(connectivity(network, "no RPC endpoint configured"));
        }
        network
            .rpc_url
            .parse()
            .map_err(|e| connectivity(network, format!("invalid RPC endpoint '{}': {e}", network.rpc_url)))
            .map(|rpc_url| ProviderBuilder::new().connect_http(rpc_url))
    }

    /// Run one RPC round trip under the client timeout, recording its latency.
    async fn timed<T, E, C>(
        &self,
        network: &NetworkDescriptor,
        method: &'static str,
        call: C,
    ) -> Result<Result<T, E>, FetchError>
    where
        C: IntoFuture<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let res = tokio::time::timeout(self.timeout, call.into_future()).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!(
            "collector_rpc_latency_ms",
            "network" => network.key.clone(),
            "method" => method,
        )
        .record(ms);
        debug!(network = %network.key, method, ms, ok = matches!(res, Ok(Ok(_))), "rpc request");
        res.map_err(|_| {
            connectivity(
                network,
                format!("{method} timed out after {}ms", self.timeout.as_millis()),
            )
        })
    }

    async fn read_contract<T, C>(
        &self,
        network: &NetworkDescriptor,
        method: &'static str,
        call: C,
    ) -> Result<T, FetchError>
    where
        C: IntoFuture<Output = Result<T, alloy::contract::Error>>,
    {
        self.timed(network, method, call)
            .await?
            .map_err(|e| contract_failure(network, &e))
    }

    async fn native_balance(
        &self,
        network: &NetworkDescriptor,
        owner: Address,
    ) -> Result<String, FetchError> {
        let provider = Self::provider(network)?;
        let balance = self
            .timed(network, "eth_getBalance", provider.get_balance(owner))
            .await?
            .map_err(|e| core_failure(network, &e))?;
        Ok(balance.to_string())
    }

    async fn token_balance(
        &self,
        network: &NetworkDescriptor,
        token: &str,
        owner: Address,
    ) -> Result<String, FetchError> {
        let token = parse_address(network, token)?;
        let contract = IERC20::new(token, Self::provider(network)?);
        let call = contract.balanceOf(owner);
        let balance = self.read_contract(network, "balanceOf", call.call()).await?;
        Ok(balance.to_string())
    }
}

impl BalanceFetcher for ChainClient {
    async fn get_balance(
        &self,
        network: &NetworkDescriptor,
        address: &str,
    ) -> Result<BalanceReading, FetchError> {
        let owner = parse_address(network, address)?;
        let balance = match (network.is_native, network.token_address.as_deref()) {
            (true, _) => self.native_balance(network, owner).await?,
            (false, Some(token)) => self.token_balance(network, token, owner).await?,
            (false, None) => {
                return Err(contract_call(network, "no token contract configured"));
            }
        };
        let block_number = self.block_number(network).await?;

        Ok(BalanceReading {
            address: address.to_string(),
            network_key: network.key.clone(),
            balance,
            block_number: Some(block_number),
            timestamp: Utc::now(),
        })
    }

    async fn block_number(&self, network: &NetworkDescriptor) -> Result<u64, FetchError> {
        let provider = Self::provider(network)?;
        self.timed(network, "eth_blockNumber", provider.get_block_number())
            .await?
            .map_err(|e| core_failure(network, &e))
    }

    async fn token_info(&self, network: &NetworkDescriptor) -> Result<Option<TokenInfo>, FetchError> {
        let Some(token) = network.token_address.as_deref().filter(|_| !network.is_native) else {
            return Ok(None);
        };
        let contract = IERC20::new(parse_address(network, token)?, Self::provider(network)?);
        let name = contract.name();
        let symbol = contract.symbol();
        let decimals = contract.decimals();
        let (name, symbol, decimals) = futures::try_join!(
            self.read_contract(network, "name", name.call()),
            self.read_contract(network, "symbol", symbol.call()),
            self.read_contract(network, "decimals", decimals.call()),
        )?;
        Ok(Some(TokenInfo {
            name,
            symbol,
            decimals,
        }))
    }
}

fn connectivity(network: &NetworkDescriptor, message: impl Into<String>) -> FetchError {
    FetchError::Connectivity {
        network: network.key.clone(),
        message: message.into(),
    }
}

fn contract_call(network: &NetworkDescriptor, message: impl Into<String>) -> FetchError {
    FetchError::ContractCall {
        network: network.key.clone(),
        message: message.into(),
    }
}

fn parse_address(network: &NetworkDescriptor, raw: &str) -> Result<Address, FetchError> {
    raw.parse::<Address>()
        .map_err(|e| contract_call(network, format!("invalid address '{raw}': {e}")))
}

/// `eth_getBalance` / `eth_blockNumber`: an error response means the node is
/// unusable; an undecodable result is a malformed payload.
fn core_failure(network: &NetworkDescriptor, err: &RpcError<TransportErrorKind>) -> FetchError {
    match err {
        RpcError::Transport(_) | RpcError::ErrorResp(_) => connectivity(network, err.to_string()),
        _ => contract_call(network, err.to_string()),
    }
}

/// Contract reads: only a transport failure counts against the endpoint.
fn contract_failure(network: &NetworkDescriptor, err: &alloy::contract::Error) -> FetchError {
    match err {
        alloy::contract::Error::TransportError(RpcError::Transport(_)) => {
            connectivity(network, err.to_string())
        }
        _ => contract_call(network, err.to_string()),
    }
}
