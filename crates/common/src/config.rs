use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use crate::types::NetworkDescriptor;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub monitoring: Monitoring,
    pub server: Server,
    pub observability: Observability,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub wallets: Vec<WalletConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Monitoring {
    pub schedule: String,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub run_on_startup: bool,
    pub retention_days: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: i64,
    #[serde(default)]
    pub rpc_url: String,
    pub token_address: Option<String>,
    pub is_native: bool,
    pub symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub address: String,
    pub label: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load from `COLLECTOR_CONFIG` (or the default path), then apply
    /// `<KEY>_RPC_URL` / `<KEY>_TOKEN_ADDRESS` environment overrides.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("COLLECTOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("failed to parse collector config")
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (key, network) in &mut self.networks {
            let upper = key.to_ascii_uppercase();
            if let Some(url) = lookup(&format!("{upper}_RPC_URL")).filter(|v| !v.is_empty()) {
                network.rpc_url = url;
            }
            if let Some(addr) = lookup(&format!("{upper}_TOKEN_ADDRESS")).filter(|v| !v.is_empty())
            {
                network.token_address = Some(addr);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitoring.schedule.trim().is_empty() {
            anyhow::bail!("monitoring.schedule must not be empty");
        }
        if self.monitoring.retention_days == 0 {
            anyhow::bail!("monitoring.retention_days must be > 0");
        }
        for (key, network) in &self.networks {
            if key.trim().is_empty() {
                anyhow::bail!("network key must not be empty");
            }
            let has_token = network
                .token_address
                .as_deref()
                .is_some_and(|a| !a.trim().is_empty());
            if !network.is_native && !has_token {
                anyhow::bail!("network {key} is a token network but has no token_address");
            }
        }
        let mut seen = HashSet::new();
        for wallet in &self.wallets {
            if wallet.address.trim().is_empty() {
                anyhow::bail!("wallet address must not be empty");
            }
            if !seen.insert(wallet.address.as_str()) {
                anyhow::bail!("duplicate wallet address: {}", wallet.address);
            }
        }
        Ok(())
    }

    /// Network descriptors in key order.
    pub fn network_descriptors(&self) -> Vec<NetworkDescriptor> {
        self.networks
            .iter()
            .map(|(key, n)| NetworkDescriptor {
                key: key.clone(),
                name: n.name.clone(),
                chain_id: n.chain_id,
                rpc_url: n.rpc_url.clone(),
                is_native: n.is_native,
                token_address: if n.is_native {
                    None
                } else {
                    n.token_address.clone()
                },
                symbol: n.symbol.clone(),
            })
            .collect()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
