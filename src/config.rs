use anyhow::Result;
use ethers::providers::{Http, Provider};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::cache::TtlPolicy;
use crate::retry::RetryPolicy;
use crate::user_settings::UserSettings;

/// A predefined EVM-compatible network with label, chain ID, and default RPC.
#[derive(Clone, Debug)]
pub struct EvmNetwork {
    pub label: &'static str,
    pub chain_id: u64,
    pub default_rpc: &'static str,
    /// Chain identifier used by the price index API.
    pub price_slug: &'static str,
}

impl EvmNetwork {
    pub const fn new(
        label: &'static str,
        chain_id: u64,
        default_rpc: &'static str,
        price_slug: &'static str,
    ) -> Self {
        Self {
            label,
            chain_id,
            default_rpc,
            price_slug,
        }
    }
}

/// Networks the dashboard can switch between.
pub const NETWORKS: &[EvmNetwork] = &[
    EvmNetwork::new("Ethereum", 1, "https://ethereum-rpc.publicnode.com", "ethereum"),
    EvmNetwork::new("Base", 8453, "https://mainnet.base.org", "base"),
    EvmNetwork::new("Optimism", 10, "https://mainnet.optimism.io", "optimism"),
    EvmNetwork::new("Polygon", 137, "https://polygon-rpc.com", "polygon"),
    EvmNetwork::new("BNB Chain", 56, "https://bsc-dataseed.binance.org", "bsc"),
    EvmNetwork::new("Avalanche C-Chain", 43114, "https://avalanche-c-chain-rpc.publicnode.com", "avalanche"),
    EvmNetwork::new("Pulsechain", 369, "https://rpc.pulsechain.com", "pulsechain"),
];

/// Default chain when nothing has been selected yet.
pub const DEFAULT_CHAIN_ID: u64 = 8453;

/// Default price index endpoint (DexScreener-compatible pair lookup).
pub const DEFAULT_PRICE_API: &str = "https://api.dexscreener.com/latest/dex/pairs";

/// Find a network by chain ID
pub fn find_network_by_chain_id(chain_id: u64) -> Option<&'static EvmNetwork> {
    NETWORKS.iter().find(|n| n.chain_id == chain_id)
}

/// Timing and paging knobs of the synchronization layer.
#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// Minimum spacing between two outbound node calls.
    pub min_interval: Duration,
    /// Pause after each dispatch before the next queue entry is drained.
    pub settle_delay: Duration,
    pub retry: RetryPolicy,
    pub ttl: TtlPolicy,
    /// Positions per ledger page.
    pub page_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            settle_delay: Duration::from_millis(50),
            retry: RetryPolicy::default(),
            ttl: TtlPolicy::default(),
            page_size: 6,
        }
    }
}

impl SyncSettings {
    /// Defaults with `XBURN_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(ms) = env_u64("XBURN_MIN_INTERVAL_MS") {
            settings.min_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("XBURN_SETTLE_DELAY_MS") {
            settings.settle_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_u64("XBURN_MAX_ATTEMPTS") {
            settings.retry.max_attempts = attempts.max(1) as u32;
        }
        if let Some(size) = env_u64("XBURN_PAGE_SIZE") {
            settings.page_size = size.max(1) as usize;
        }
        settings
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub rpc_url: String,
    pub chain_id: u64,
    pub price_api: String,
    pub sync: SyncSettings,
}

impl Config {
    pub fn new(rpc_url: String, chain_id: u64) -> Self {
        let price_api = env::var("XBURN_PRICE_API")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PRICE_API.to_string());

        Self {
            rpc_url,
            chain_id,
            price_api,
            sync: SyncSettings::from_env(),
        }
    }

    pub fn from_network(network: &EvmNetwork) -> Self {
        Self::new(network.default_rpc.to_string(), network.chain_id)
    }

    /// Build a config for the chain selected in the user's settings,
    /// honouring any custom RPC override for that chain.
    pub fn from_settings(settings: &UserSettings) -> Self {
        let chain_id = settings.selected_chain_id;
        let rpc_url = settings
            .get_custom_rpc(chain_id)
            .cloned()
            .or_else(|| find_network_by_chain_id(chain_id).map(|n| n.default_rpc.to_string()));

        match rpc_url {
            Some(url) => Self::new(url, chain_id),
            None => {
                tracing::warn!("No RPC known for chain {}, falling back to default network", chain_id);
                Self::default()
            }
        }
    }

    pub fn network_label(&self) -> &str {
        find_network_by_chain_id(self.chain_id)
            .map(|n| n.label)
            .unwrap_or("Unknown")
    }

    pub fn price_slug(&self) -> Option<&'static str> {
        find_network_by_chain_id(self.chain_id).map(|n| n.price_slug)
    }

    pub async fn get_provider(&self) -> Result<Arc<Provider<Http>>> {
        let url = Url::parse(&self.rpc_url)?;
        let provider = Provider::<Http>::try_from(url.as_str())?;
        Ok(Arc::new(provider))
    }
}

impl Default for Config {
    fn default() -> Self {
        if let Some(base) = find_network_by_chain_id(DEFAULT_CHAIN_ID) {
            Self::from_network(base)
        } else {
            Self::new("https://mainnet.base.org".to_string(), DEFAULT_CHAIN_ID)
        }
    }
}
