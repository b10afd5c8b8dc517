//! Top-level facade wiring the context, node access, caches, aggregator and ledger.

use ethers::abi::Token;
use ethers::types::{Address, TxHash, U256};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::addresses::ContractName;
use crate::cache::{CacheKey, CacheStore};
use crate::config::{find_network_by_chain_id, SyncSettings};
use crate::context::{ChainContext, EpochToken};
use crate::error::SyncError;
use crate::ledger::{PositionAction, PositionLedger, PositionWriter};
use crate::node::NodeClient;
use crate::price::{PriceQuote, PriceSource};
use crate::reader::ContractReader;
use crate::scheduler::RequestScheduler;
use crate::stats::{StatsAggregator, StatsSnapshot};

/// A confirmed write whose effects must be reflected immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Approve { token: ContractName, spender: ContractName },
    /// XEN burned, optionally creating a lock position.
    Burn,
    Swap,
    Claim,
    EmergencyEnd,
}

pub struct SyncEngine {
    context: Arc<ChainContext>,
    reader: ContractReader,
    amounts: CacheStore<U256>,
    snapshots: CacheStore<StatsSnapshot>,
    quotes: CacheStore<PriceQuote>,
    stats: Arc<StatsAggregator>,
    ledger: PositionLedger,
    price_source: Option<Arc<dyn PriceSource>>,
}

impl SyncEngine {
    /// Must be called from within a tokio runtime.
    pub fn new(context: Arc<ChainContext>, node: Arc<dyn NodeClient>, settings: &SyncSettings) -> Self {
        let scheduler = RequestScheduler::new(settings.min_interval, settings.settle_delay);
        let reader = ContractReader::new(context.clone(), scheduler, node, settings.retry.clone());

        Self {
            amounts: CacheStore::new(context.clone(), settings.ttl.clone()),
            snapshots: CacheStore::new(context.clone(), settings.ttl.clone()),
            quotes: CacheStore::new(context.clone(), settings.ttl.clone()),
            stats: Arc::new(StatsAggregator::new(reader.clone())),
            ledger: PositionLedger::new(reader.clone(), settings.ttl.clone(), settings.page_size),
            price_source: None,
            context,
            reader,
        }
    }

    pub fn with_price_source(mut self, source: Arc<dyn PriceSource>) -> Self {
        self.price_source = Some(source);
        self
    }

    pub fn context(&self) -> &Arc<ChainContext> {
        &self.context
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    /// Requests dispatched to the node so far.
    pub fn dispatched(&self) -> u64 {
        self.reader.scheduler().dispatched()
    }

    /// Epoch notifications for observers that re-render on context changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.context.subscribe()
    }

    pub fn switch_chain(&self, chain_id: u64) -> u64 {
        let epoch = self.context.switch_chain(chain_id);
        info!("Switched to chain {} (epoch {})", chain_id, epoch);
        epoch
    }

    pub fn set_account(&self, account: Option<Address>) -> u64 {
        let epoch = self.context.set_account(account);
        info!("Active account {:?} (epoch {})", account, epoch);
        epoch
    }

    /// Balance of the active account in ERC-20 `token`.
    pub async fn token_balance(&self, token: ContractName) -> Result<Option<U256>, SyncError> {
        self.balance(token, false).await
    }

    /// Allowance of the active account towards the `spender` contract.
    pub async fn allowance(&self, token: ContractName, spender: ContractName) -> Result<Option<U256>, SyncError> {
        self.allowance_of(token, spender, false).await
    }

    pub async fn stats(&self) -> Result<Option<StatsSnapshot>, SyncError> {
        self.refresh_stats(false).await
    }

    /// USD quote of the XEN/XBURN pool on the active chain.
    pub async fn price(&self) -> Result<Option<PriceQuote>, SyncError> {
        let source = self
            .price_source
            .clone()
            .ok_or_else(|| SyncError::Rejected("no price source configured".to_string()))?;
        let chain_id = self.context.chain_id();
        let pair = self
            .context
            .address_of(ContractName::LiquidityPair)
            .ok_or_else(|| SyncError::MissingContract {
                contract: ContractName::LiquidityPair.label().to_string(),
                chain_id,
            })?;
        let slug = find_network_by_chain_id(chain_id)
            .map(|n| n.price_slug)
            .ok_or_else(|| SyncError::Rejected(format!("no price index for chain {}", chain_id)))?;

        self.quotes
            .get(CacheKey::Price(pair), move |_token| async move {
                source.quote(slug, pair).await.map(Some)
            })
            .await
    }

    /// Refresh everything a confirmed transaction of `kind` may have changed.
    pub async fn on_transaction_confirmed(&self, kind: TxKind) -> Result<(), SyncError> {
        info!("{:?} confirmed, refreshing affected state", kind);
        let mut results = Vec::new();
        match kind {
            TxKind::Approve { token, spender } => {
                results.push(self.allowance_of(token, spender, true).await.map(drop));
            }
            TxKind::Burn => {
                results.push(self.balance(ContractName::Xen, true).await.map(drop));
                results.push(self.balance(ContractName::XburnToken, true).await.map(drop));
                results.push(
                    self.allowance_of(ContractName::Xen, ContractName::XburnMinter, true)
                        .await
                        .map(drop),
                );
                results.push(self.refresh_stats(true).await.map(drop));
                results.push(self.ledger.relist(0).await.map(drop));
            }
            TxKind::Swap => {
                results.push(self.balance(ContractName::Xen, true).await.map(drop));
                results.push(self.balance(ContractName::XburnToken, true).await.map(drop));
                results.push(self.refresh_stats(true).await.map(drop));
            }
            TxKind::Claim | TxKind::EmergencyEnd => {
                results.push(self.balance(ContractName::XburnToken, true).await.map(drop));
                results.push(self.refresh_stats(true).await.map(drop));
            }
        }

        for result in &results {
            if let Err(e) = result {
                warn!("Refresh after {:?} failed: {}", kind, e);
            }
        }
        results.into_iter().collect()
    }

    /// Claim or end a position early, then refresh the affected balances and stats.
    ///
    /// Refresh failures after the write are logged, not returned.
    pub async fn act_on_position(
        &self,
        id: U256,
        action: PositionAction,
        writer: &dyn PositionWriter,
    ) -> Result<Option<TxHash>, SyncError> {
        let Some(tx_hash) = self.ledger.act(id, action, writer).await? else {
            return Ok(None);
        };
        let kind = match action {
            PositionAction::Claim => TxKind::Claim,
            PositionAction::EmergencyEnd => TxKind::EmergencyEnd,
        };
        // The write already landed, so the hash is returned even when a refresh failed.
        if self.on_transaction_confirmed(kind).await.is_err() {
            warn!("Position #{} {} confirmed in {:?}, some values may be stale", id, action, tx_hash);
        }
        Ok(Some(tx_hash))
    }

    async fn balance(&self, token: ContractName, force: bool) -> Result<Option<U256>, SyncError> {
        if self.context.account().is_none() {
            return Err(SyncError::NoAccount);
        }
        let reader = self.reader.clone();
        let fetch = move |epoch: EpochToken| async move {
            let account = epoch.account.ok_or(SyncError::NoAccount)?;
            read_amount(&reader, epoch, token, "balanceOf", vec![Token::Address(account)]).await
        };
        let key = CacheKey::Balance(token);
        if force {
            self.amounts.force_refresh(key, fetch).await
        } else {
            self.amounts.get(key, fetch).await
        }
    }

    async fn allowance_of(
        &self,
        token: ContractName,
        spender: ContractName,
        force: bool,
    ) -> Result<Option<U256>, SyncError> {
        if self.context.account().is_none() {
            return Err(SyncError::NoAccount);
        }
        let reader = self.reader.clone();
        let fetch = move |epoch: EpochToken| async move {
            let account = epoch.account.ok_or(SyncError::NoAccount)?;
            let spender_address = reader.binding(spender)?.address;
            let args = vec![Token::Address(account), Token::Address(spender_address)];
            read_amount(&reader, epoch, token, "allowance", args).await
        };
        let key = CacheKey::Allowance { token, spender };
        if force {
            self.amounts.force_refresh(key, fetch).await
        } else {
            self.amounts.get(key, fetch).await
        }
    }

    async fn refresh_stats(&self, force: bool) -> Result<Option<StatsSnapshot>, SyncError> {
        let aggregator = self.stats.clone();
        let previous = self.snapshots.peek(&CacheKey::Stats);
        let fetch = move |epoch: EpochToken| async move { aggregator.refresh(epoch, previous).await };
        if force {
            self.snapshots.force_refresh(CacheKey::Stats, fetch).await
        } else {
            self.snapshots.get(CacheKey::Stats, fetch).await
        }
    }
}

async fn read_amount(
    reader: &ContractReader,
    epoch: EpochToken,
    token: ContractName,
    method: &'static str,
    args: Vec<Token>,
) -> Result<Option<U256>, SyncError> {
    match reader.read(epoch, token, method, args).await? {
        Some(record) => record
            .uint_at(0)
            .map(Some)
            .ok_or_else(|| SyncError::SchemaDrift(format!("{}.{} returned no amount", token, method))),
        None => Ok(None),
    }
}
