//! USD price and pool liquidity from an HTTP price API.

use ethers::types::Address;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub pair: Address,
    pub price_usd: Option<f64>,
    pub liquidity_usd: Option<f64>,
}

/// Source of USD quotes for a pool on a given chain.
pub trait PriceSource: Send + Sync {
    fn quote<'a>(&'a self, chain_slug: &'a str, pair: Address) -> BoxFuture<'a, Result<PriceQuote, SyncError>>;
}

#[derive(Debug, Deserialize)]
struct PairsResponse {
    #[serde(default)]
    pairs: Option<Vec<PairEntry>>,
    #[serde(default)]
    pair: Option<PairEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairEntry {
    #[serde(default)]
    price_usd: Option<String>,
    #[serde(default)]
    liquidity: Option<Liquidity>,
}

#[derive(Debug, Deserialize)]
struct Liquidity {
    #[serde(default)]
    usd: Option<f64>,
}

/// DexScreener `latest/dex/pairs/{chain}/{pair}` client.
pub struct DexScreenerSource {
    client: reqwest::Client,
    base_url: String,
}

impl DexScreenerSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("xburn-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, chain_slug: &str, pair: Address) -> String {
        format!("{}/{}/{:?}", self.base_url, chain_slug, pair)
    }
}

impl PriceSource for DexScreenerSource {
    fn quote<'a>(&'a self, chain_slug: &'a str, pair: Address) -> BoxFuture<'a, Result<PriceQuote, SyncError>> {
        Box::pin(async move {
            let url = self.url(chain_slug, pair);
            debug!("GET {}", url);
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                return Err(SyncError::Http(format!("{} returned {}", url, status)));
            }
            if !status.is_success() {
                return Err(SyncError::Rejected(format!("{} returned {}", url, status)));
            }
            let body = response.text().await?;
            parse_quote(pair, &body)
        })
    }
}

/// Extract a quote from a pairs response body.
pub fn parse_quote(pair: Address, body: &str) -> Result<PriceQuote, SyncError> {
    let response: PairsResponse =
        serde_json::from_str(body).map_err(|e| SyncError::SchemaDrift(format!("price response: {}", e)))?;

    let entry = response
        .pairs
        .and_then(|pairs| pairs.into_iter().next())
        .or(response.pair);

    let Some(entry) = entry else {
        return Ok(PriceQuote {
            pair,
            price_usd: None,
            liquidity_usd: None,
        });
    };

    Ok(PriceQuote {
        pair,
        price_usd: entry
            .price_usd
            .and_then(|p| p.trim().parse::<f64>().ok())
            .filter(|p| p.is_finite()),
        liquidity_usd: entry.liquidity.and_then(|l| l.usd),
    })
}
