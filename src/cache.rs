//! TTL-gated cache with in-flight refresh deduplication.
//!
//! Values are refreshed lazily on read: a fresh entry is returned as is, a stale
//! or missing one triggers exactly one refresh that every concurrent reader of
//! the same key awaits. Entries belong to the epoch they were fetched under and
//! the whole store is wiped the first time it is touched after an epoch change.

use ethers::types::Address;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::addresses::ContractName;
use crate::context::{ChainContext, EpochToken};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// ERC-20 balance of the active account.
    Balance(ContractName),
    /// ERC-20 allowance of the active account towards a spender contract.
    Allowance { token: ContractName, spender: ContractName },
    /// Merged statistics snapshot.
    Stats,
    /// Price and liquidity of a pool pair.
    Price(Address),
    /// One page of the position listing.
    Listing(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Balance,
    Allowance,
    Stats,
    Price,
    Listing,
}

impl CacheKey {
    pub fn kind(&self) -> CacheKind {
        match self {
            CacheKey::Balance(_) => CacheKind::Balance,
            CacheKey::Allowance { .. } => CacheKind::Allowance,
            CacheKey::Stats => CacheKind::Stats,
            CacheKey::Price(_) => CacheKind::Price,
            CacheKey::Listing(_) => CacheKind::Listing,
        }
    }
}

/// Time-to-live per kind of cached value, with optional per-key overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    pub balance: Duration,
    pub stats: Duration,
    pub price: Duration,
    pub listing: Duration,
    pub overrides: HashMap<CacheKey, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            balance: Duration::from_secs(5),
            stats: Duration::from_secs(3),
            price: Duration::from_secs(10),
            listing: Duration::from_secs(1),
            overrides: HashMap::new(),
        }
    }
}

impl TtlPolicy {
    pub fn with_override(mut self, key: CacheKey, ttl: Duration) -> Self {
        self.overrides.insert(key, ttl);
        self
    }

    pub fn ttl_for(&self, key: &CacheKey) -> Duration {
        if let Some(ttl) = self.overrides.get(key) {
            return *ttl;
        }
        match key.kind() {
            CacheKind::Balance | CacheKind::Allowance => self.balance,
            CacheKind::Stats => self.stats,
            CacheKind::Price => self.price,
            CacheKind::Listing => self.listing,
        }
    }
}

/// A cached value with the instant its refresh started and the epoch it belongs to.
#[derive(Debug, Clone)]
pub struct CachedValue<V> {
    pub value: V,
    pub fetched_at: Instant,
    pub ttl: Duration,
    pub epoch: u64,
}

impl<V> CachedValue<V> {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }
}

type SharedRefresh<V> = Shared<BoxFuture<'static, Result<Option<V>, SyncError>>>;

struct InFlight<V> {
    generation: u64,
    refresh: SharedRefresh<V>,
}

struct CacheInner<V> {
    epoch: u64,
    next_generation: u64,
    entries: HashMap<CacheKey, CachedValue<V>>,
    in_flight: HashMap<CacheKey, InFlight<V>>,
}

pub struct CacheStore<V> {
    context: Arc<ChainContext>,
    ttl: TtlPolicy,
    inner: Arc<Mutex<CacheInner<V>>>,
}

fn lock<V>(inner: &Mutex<CacheInner<V>>) -> MutexGuard<'_, CacheInner<V>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(context: Arc<ChainContext>, ttl: TtlPolicy) -> Self {
        let epoch = context.epoch();
        Self {
            context,
            ttl,
            inner: Arc::new(Mutex::new(CacheInner {
                epoch,
                next_generation: 0,
                entries: HashMap::new(),
                in_flight: HashMap::new(),
            })),
        }
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Cached value if fresh, otherwise the result of a (shared) refresh.
    ///
    /// `Ok(None)` means the refresh produced nothing for the current context,
    /// e.g. because the chain changed while it was in flight.
    pub async fn get<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<Option<V>, SyncError>
    where
        F: FnOnce(EpochToken) -> Fut,
        Fut: Future<Output = Result<Option<V>, SyncError>> + Send + 'static,
    {
        let refresh = {
            let mut inner = lock(&self.inner);
            self.sync_epoch(&mut inner);

            if let Some(entry) = inner.entries.get(&key) {
                if entry.is_fresh(Instant::now()) {
                    return Ok(Some(entry.value.clone()));
                }
            }

            match inner.in_flight.get(&key) {
                Some(flight) => {
                    debug!("Joining in-flight refresh of {:?}", key);
                    flight.refresh.clone()
                }
                None => self.start_refresh(&mut inner, key, fetch),
            }
        };
        refresh.await
    }

    /// Refresh `key` regardless of its freshness.
    pub async fn force_refresh<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<Option<V>, SyncError>
    where
        F: FnOnce(EpochToken) -> Fut,
        Fut: Future<Output = Result<Option<V>, SyncError>> + Send + 'static,
    {
        let refresh = {
            let mut inner = lock(&self.inner);
            self.sync_epoch(&mut inner);
            self.start_refresh(&mut inner, key, fetch)
        };
        refresh.await
    }

    /// Latest value for the current epoch, fresh or not.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        self.entry(key).map(|e| e.value)
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CachedValue<V>> {
        let mut inner = lock(&self.inner);
        self.sync_epoch(&mut inner);
        inner.entries.get(key).cloned()
    }

    fn sync_epoch(&self, inner: &mut CacheInner<V>) {
        let epoch = self.context.epoch();
        if inner.epoch != epoch {
            debug!(
                "Epoch {} -> {}: dropping {} cached entries",
                inner.epoch,
                epoch,
                inner.entries.len()
            );
            inner.entries.clear();
            inner.in_flight.clear();
            inner.epoch = epoch;
        }
    }

    fn start_refresh<F, Fut>(&self, inner: &mut CacheInner<V>, key: CacheKey, fetch: F) -> SharedRefresh<V>
    where
        F: FnOnce(EpochToken) -> Fut,
        Fut: Future<Output = Result<Option<V>, SyncError>> + Send + 'static,
    {
        let token = self.context.snapshot();
        let started_at = Instant::now();
        let ttl = self.ttl.ttl_for(&key);
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let pending = fetch(token);
        let store = self.inner.clone();
        let context = self.context.clone();
        let refresh_key = key.clone();

        let refresh = async move {
            let result = pending.await;

            let mut inner = lock(&store);
            if inner
                .in_flight
                .get(&refresh_key)
                .map_or(false, |f| f.generation == generation)
            {
                inner.in_flight.remove(&refresh_key);
            }

            let value = match result? {
                Some(value) => value,
                None => return Ok(None),
            };

            if !context.is_current(&token) || inner.epoch != token.epoch {
                debug!("Discarding {:?} fetched under stale epoch {}", refresh_key, token.epoch);
                return Ok(None);
            }

            if let Some(existing) = inner.entries.get(&refresh_key) {
                if existing.fetched_at > started_at {
                    debug!("Keeping newer cached {:?}", refresh_key);
                    return Ok(Some(existing.value.clone()));
                }
            }

            inner.entries.insert(
                refresh_key,
                CachedValue {
                    value: value.clone(),
                    fetched_at: started_at,
                    ttl,
                    epoch: token.epoch,
                },
            );
            Ok(Some(value))
        }
        .boxed()
        .shared();

        inner.in_flight.insert(
            key,
            InFlight {
                generation,
                refresh: refresh.clone(),
            },
        );
        refresh
    }
}
