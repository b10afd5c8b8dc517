//! The connected account's lock positions (XBURN NFTs).
//!
//! Positions are enumerated page by page, detailed one at a time, and pruned
//! locally when they vanish (burned by a claim, ended early, or transferred).
//! A pruned id is never shown again for the rest of the session.

use chrono::{DateTime, TimeZone, Utc};
use ethers::abi::Token;
use ethers::types::{Address, TxHash, U256};
use futures::future::{join_all, BoxFuture};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::addresses::ContractName;
use crate::cache::{CacheKey, CacheStore, TtlPolicy};
use crate::context::EpochToken;
use crate::error::SyncError;
use crate::guard::ContractBinding;
use crate::reader::ContractReader;
use crate::schema::{
    resolve_address, resolve_bool, resolve_text, resolve_uint, Candidate, FieldPath, Parser, SourceRecords,
};
use crate::utils;

const LOCK_DETAILS: &str = "lockDetails";
const LEGACY_LOCK: &str = "legacyLock";
const OWNER: &str = "owner";
const URI: &str = "uri";

const DETAIL_SOURCES: &[(&str, &str)] = &[(LOCK_DETAILS, "getLockDetails"), (OWNER, "ownerOf"), (URI, "tokenURI")];
/// Read only when the current schema yields no usable details.
const LEGACY_SOURCES: &[(&str, &str)] = &[(LEGACY_LOCK, "lockInfo")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Loaded,
    Detailing,
    /// Terminal. The position is no longer owned or no longer exists.
    Vanished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionDetails {
    /// Locked XBURN amount.
    pub amount: U256,
    /// Unix timestamp at which the lock matures.
    pub maturity: u64,
    pub term_days: u64,
    pub claimed: bool,
    pub reward: U256,
    pub owner: Option<Address>,
    pub uri: Option<String>,
}

impl PositionDetails {
    pub fn is_mature_at(&self, now: u64) -> bool {
        now >= self.maturity
    }

    pub fn is_mature(&self) -> bool {
        self.is_mature_at(utils::unix_now())
    }

    pub fn is_claimable(&self) -> bool {
        self.is_mature() && !self.claimed
    }

    pub fn maturity_time(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.maturity).ok()?;
        Utc.timestamp_opt(secs, 0).single()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub id: U256,
    pub details: Option<PositionDetails>,
    pub state: PositionState,
}

impl Position {
    fn new(id: U256) -> Self {
        Self {
            id,
            details: None,
            state: PositionState::Loaded,
        }
    }
}

/// Ids found on one page of the ownership enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionPage {
    pub page: usize,
    /// Number of positions the account owns in total.
    pub total: u64,
    pub ids: Vec<U256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionAction {
    Claim,
    EmergencyEnd,
}

impl PositionAction {
    /// Minter method that performs the action.
    pub fn method(&self) -> &'static str {
        match self {
            PositionAction::Claim => "claimLockedTokens",
            PositionAction::EmergencyEnd => "emergencyEnd",
        }
    }
}

impl fmt::Display for PositionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionAction::Claim => write!(f, "claim"),
            PositionAction::EmergencyEnd => write!(f, "emergency end"),
        }
    }
}

/// Write path for position actions. Resolves once the transaction is confirmed.
pub trait PositionWriter: Send + Sync {
    fn submit<'a>(
        &'a self,
        binding: ContractBinding,
        action: PositionAction,
        id: U256,
    ) -> BoxFuture<'a, Result<TxHash, SyncError>>;
}

#[derive(Default)]
struct LedgerState {
    epoch: u64,
    page: usize,
    positions: Vec<Position>,
    selected: Option<U256>,
    /// `(chain_id, account, id)` of every position pruned this session.
    vanished: HashSet<(u64, Option<Address>, U256)>,
}

impl LedgerState {
    fn visible(&self, id: U256) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    fn visible_mut(&mut self, id: U256) -> Option<&mut Position> {
        self.positions.iter_mut().find(|p| p.id == id)
    }
}

pub struct PositionLedger {
    reader: ContractReader,
    page_size: usize,
    listings: CacheStore<PositionPage>,
    state: Mutex<LedgerState>,
}

impl PositionLedger {
    pub fn new(reader: ContractReader, ttl: TtlPolicy, page_size: usize) -> Self {
        let listings = CacheStore::new(reader.context().clone(), ttl);
        let epoch = reader.context().epoch();
        Self {
            reader,
            page_size: page_size.max(1),
            listings,
            state: Mutex::new(LedgerState {
                epoch,
                ..Default::default()
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Visible positions of the current page.
    pub fn positions(&self) -> Vec<Position> {
        self.lock().positions.clone()
    }

    pub fn ids(&self) -> Vec<U256> {
        self.lock().positions.iter().map(|p| p.id).collect()
    }

    pub fn selected(&self) -> Option<U256> {
        self.lock().selected
    }

    pub fn position(&self, id: U256) -> Option<Position> {
        self.lock().visible(id).cloned()
    }

    pub fn is_vanished(&self, id: U256) -> bool {
        let token = self.reader.context().snapshot();
        self.lock().vanished.contains(&(token.chain_id, token.account, id))
    }

    /// Enumerate page `page` of the account's positions.
    ///
    /// `Ok(None)` when the context changed while enumerating.
    pub async fn list(&self, page: usize) -> Result<Option<Vec<Position>>, SyncError> {
        let reader = self.reader.clone();
        let page_size = self.page_size;
        let listing = self
            .listings
            .get(CacheKey::Listing(page), move |token| enumerate(reader, token, page, page_size))
            .await?;
        Ok(listing.and_then(|listing| self.apply_page(listing)))
    }

    /// Re-enumerate `page` bypassing the listing cache.
    pub async fn relist(&self, page: usize) -> Result<Option<Vec<Position>>, SyncError> {
        let reader = self.reader.clone();
        let page_size = self.page_size;
        let listing = self
            .listings
            .force_refresh(CacheKey::Listing(page), move |token| enumerate(reader, token, page, page_size))
            .await?;
        Ok(listing.and_then(|listing| self.apply_page(listing)))
    }

    fn apply_page(&self, listing: PositionPage) -> Option<Vec<Position>> {
        let token = self.reader.context().snapshot();
        let mut state = self.lock();
        if state.epoch != token.epoch {
            return None;
        }

        let positions: Vec<Position> = listing
            .ids
            .iter()
            .filter(|id| !state.vanished.contains(&(token.chain_id, token.account, **id)))
            .map(|id| state.visible(*id).cloned().unwrap_or_else(|| Position::new(*id)))
            .collect();

        state.page = listing.page;
        state.positions = positions;
        let selection_visible = state.selected.map_or(false, |id| state.visible(id).is_some());
        if !selection_visible {
            state.selected = state.positions.first().map(|p| p.id);
        }
        Some(state.positions.clone())
    }

    /// Load and normalize the details of `id`.
    ///
    /// A position found to be burned or owned by someone else is pruned and
    /// returned in the [`PositionState::Vanished`] state.
    pub async fn load_details(&self, id: U256) -> Result<Option<Position>, SyncError> {
        let token = self.reader.context().snapshot();
        if self.is_vanished(id) {
            return Err(SyncError::Vanished { token_id: id });
        }
        self.set_state(token, id, PositionState::Detailing);

        let mut records = SourceRecords::new();
        let mut errors = Vec::new();
        for sources in [DETAIL_SOURCES, LEGACY_SOURCES] {
            if normalize_details(&records).is_some() {
                break;
            }
            match self.read_detail_sources(token, id, sources, &mut records, &mut errors).await {
                DetailRead::Stale => return Ok(None),
                DetailRead::Vanished => {
                    self.prune(token, id);
                    return Ok(Some(vanished_position(id)));
                }
                DetailRead::Done => {}
            }
        }

        let details = match normalize_details(&records) {
            Some(details) => details,
            None => {
                self.set_state(token, id, PositionState::Loaded);
                return Err(errors.into_iter().next().unwrap_or_else(|| {
                    SyncError::SchemaDrift(format!("position #{} returned no usable lock details", id))
                }));
            }
        };

        if let (Some(owner), Some(account)) = (details.owner, token.account) {
            if owner != account {
                info!("Position #{} now belongs to {:?}, pruning", id, owner);
                self.prune(token, id);
                return Ok(Some(vanished_position(id)));
            }
        }

        if !self.reader.context().is_current(&token) {
            return Ok(None);
        }
        let mut state = self.lock();
        if state.epoch != token.epoch {
            return Ok(None);
        }
        let position = match state.visible_mut(id) {
            Some(position) => {
                position.details = Some(details);
                position.state = PositionState::Loaded;
                position.clone()
            }
            None => Position {
                id,
                details: Some(details),
                state: PositionState::Loaded,
            },
        };
        Ok(Some(position))
    }

    /// Read `sources` of position `id` concurrently into `records`.
    async fn read_detail_sources(
        &self,
        token: EpochToken,
        id: U256,
        sources: &[(&'static str, &'static str)],
        records: &mut SourceRecords,
        errors: &mut Vec<SyncError>,
    ) -> DetailRead {
        let reads = sources
            .iter()
            .map(|(_, method)| self.reader.read(token, ContractName::XburnNft, *method, vec![Token::Uint(id)]));
        let outcomes = join_all(reads).await;

        let mut flow = DetailRead::Done;
        for ((source, _), outcome) in sources.iter().zip(outcomes) {
            match outcome {
                Ok(Some(record)) => {
                    records.insert(*source, record);
                }
                Ok(None) => flow = DetailRead::Stale,
                Err(e) if e.is_vanished() => return DetailRead::Vanished,
                Err(e) => {
                    debug!("Position #{} source {} failed: {}", id, source, e);
                    if *source != URI {
                        errors.push(e);
                    }
                }
            }
        }
        flow
    }

    /// Make `id` the active position after re-checking its ownership.
    ///
    /// Returns the resulting selection, which differs from `id` when the
    /// position had vanished and the ledger fell back to another one.
    pub async fn select(&self, id: U256) -> Result<Option<U256>, SyncError> {
        let token = self.reader.context().snapshot();
        let account = token.account.ok_or(SyncError::NoAccount)?;
        if self.is_vanished(id) {
            return self.fallback_selection(token).await;
        }
        {
            let mut state = self.lock();
            if state.epoch == token.epoch {
                state.selected = Some(id);
            }
        }

        let owned = match self
            .reader
            .read(token, ContractName::XburnNft, "ownerOf", vec![Token::Uint(id)])
            .await
        {
            Ok(Some(record)) => record.address_at(0).map_or(true, |owner| owner == account),
            Ok(None) => return Ok(None),
            Err(e) if e.is_vanished() => false,
            Err(e) => return Err(e),
        };

        if owned {
            return Ok(Some(id));
        }
        info!("Position #{} is gone, pruning", id);
        self.prune(token, id);
        self.fallback_selection(token).await
    }

    /// Claim or end `id` early through `writer`, then prune it locally.
    pub async fn act(
        &self,
        id: U256,
        action: PositionAction,
        writer: &dyn PositionWriter,
    ) -> Result<Option<TxHash>, SyncError> {
        let token = self.reader.context().snapshot();
        if token.account.is_none() {
            return Err(SyncError::NoAccount);
        }
        if self.is_vanished(id) {
            return Err(SyncError::Vanished { token_id: id });
        }

        if action == PositionAction::Claim {
            let known = self.lock().visible(id).and_then(|p| p.details.clone());
            let details = match known {
                Some(details) => details,
                None => match self.load_details(id).await? {
                    Some(position) if position.state == PositionState::Vanished => {
                        return Err(SyncError::Vanished { token_id: id });
                    }
                    Some(position) => position.details.ok_or_else(|| {
                        SyncError::SchemaDrift(format!("position #{} has no details", id))
                    })?,
                    None => return Ok(None),
                },
            };
            if details.claimed {
                return Err(SyncError::Rejected(format!("position #{} was already claimed", id)));
            }
            if !details.is_mature() {
                let when = details
                    .maturity_time()
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| details.maturity.to_string());
                return Err(SyncError::Rejected(format!("position #{} is not mature until {}", id, when)));
            }
        }

        let binding = self.reader.binding(ContractName::XburnMinter)?;
        if !self.reader.context().is_current(&token) || !self.reader.guard().assert_fresh(&binding) {
            return Ok(None);
        }

        info!("Submitting {} for position #{}", action, id);
        let tx_hash = writer.submit(binding, action, id).await?;
        info!("{} of position #{} confirmed in {:?}", action, id, tx_hash);

        if self.reader.context().is_current(&token) {
            self.prune(token, id);
            self.fallback_selection(token).await?;
        }
        Ok(Some(tx_hash))
    }

    /// Remove `id` from the visible list and move the selection off it.
    fn prune(&self, token: EpochToken, id: U256) {
        let mut state = self.lock();
        state.vanished.insert((token.chain_id, token.account, id));
        if state.epoch != token.epoch {
            return;
        }
        state.positions.retain(|p| p.id != id);
        if state.selected == Some(id) {
            state.selected = state.positions.first().map(|p| p.id);
        }
        debug!(
            "Pruned position #{} ({} remaining, selected {:?})",
            id,
            state.positions.len(),
            state.selected
        );
    }

    /// Selection after a prune. Re-enumerates only when nothing is left.
    async fn fallback_selection(&self, token: EpochToken) -> Result<Option<U256>, SyncError> {
        let (empty, page) = {
            let state = self.lock();
            (state.positions.is_empty(), state.page)
        };
        if empty && self.reader.context().is_current(&token) {
            self.relist(page).await?;
        }
        Ok(self.selected())
    }

    fn set_state(&self, token: EpochToken, id: U256, next: PositionState) {
        let mut state = self.lock();
        if state.epoch != token.epoch {
            return;
        }
        if let Some(position) = state.visible_mut(id) {
            position.state = next;
        }
    }

    /// The ledger state, reset when the chain or account changed since last use.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        let epoch = self.reader.context().epoch();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.epoch != epoch {
            state.epoch = epoch;
            state.page = 0;
            state.positions.clear();
            state.selected = None;
        }
        state
    }
}

enum DetailRead {
    Done,
    /// The context changed while reading.
    Stale,
    Vanished,
}

fn vanished_position(id: U256) -> Position {
    Position {
        id,
        details: None,
        state: PositionState::Vanished,
    }
}

async fn enumerate(
    reader: ContractReader,
    token: EpochToken,
    page: usize,
    page_size: usize,
) -> Result<Option<PositionPage>, SyncError> {
    let account = token.account.ok_or(SyncError::NoAccount)?;
    let Some(record) = reader
        .read(token, ContractName::XburnNft, "balanceOf", vec![Token::Address(account)])
        .await?
    else {
        return Ok(None);
    };
    let total = record
        .uint_at(0)
        .ok_or_else(|| SyncError::SchemaDrift("balanceOf returned no count".to_string()))?;

    let total = total.min(U256::from(u64::MAX)).as_u64();
    let start = page
        .checked_mul(page_size)
        .and_then(|start| u64::try_from(start).ok())
        .unwrap_or(u64::MAX);
    let end = total.min(start.saturating_add(page_size as u64));

    let reads = (start..end).map(|index| {
        let args = vec![Token::Address(account), Token::Uint(U256::from(index))];
        reader.read(token, ContractName::XburnNft, "tokenOfOwnerByIndex", args)
    });
    let outcomes = join_all(reads).await;

    let mut ids = Vec::with_capacity(outcomes.len());
    for (index, outcome) in (start..end).zip(outcomes) {
        match outcome {
            Ok(Some(record)) => match record.uint_at(0) {
                Some(id) => ids.push(id),
                None => warn!("tokenOfOwnerByIndex({}) returned no id, skipping", index),
            },
            Ok(None) => return Ok(None),
            Err(e) => warn!("tokenOfOwnerByIndex({}) failed, skipping: {}", index, e),
        }
    }

    debug!("Listed page {} ({} of {} positions)", page, ids.len(), total);
    Ok(Some(PositionPage { page, total, ids }))
}

fn normalize_details(records: &SourceRecords) -> Option<PositionDetails> {
    use FieldPath::{Index, Key};

    let amount = resolve_uint(
        records,
        &[Candidate::uint(LOCK_DETAILS, Key("xenAmount")), Candidate::uint(LEGACY_LOCK, Index(0))],
    )?;
    let maturity = resolve_uint(
        records,
        &[Candidate::uint(LOCK_DETAILS, Key("maturityTs")), Candidate::uint(LEGACY_LOCK, Index(1))],
    )?;
    let term = resolve_uint(
        records,
        &[Candidate::uint(LOCK_DETAILS, Key("termDays")), Candidate::uint(LEGACY_LOCK, Index(2))],
    )
    .unwrap_or_default();
    let claimed = resolve_bool(
        records,
        &[
            Candidate::new(LOCK_DETAILS, Key("redeemed"), Parser::Bool),
            Candidate::new(LEGACY_LOCK, Index(3), Parser::Bool),
        ],
    )
    .unwrap_or(false);
    let reward = resolve_uint(
        records,
        &[Candidate::uint(LOCK_DETAILS, Key("rewardAmount")), Candidate::uint(LEGACY_LOCK, Index(4))],
    )
    .unwrap_or_default();
    let owner = resolve_address(
        records,
        &[
            Candidate::new(OWNER, Index(0), Parser::Address),
            Candidate::new(LOCK_DETAILS, Key("owner"), Parser::Address),
        ],
    );
    let uri = resolve_text(records, &[Candidate::new(URI, Index(0), Parser::Text)]);

    Some(PositionDetails {
        amount,
        maturity: maturity.min(U256::from(u64::MAX)).as_u64(),
        term_days: term.min(U256::from(u64::MAX)).as_u64(),
        claimed,
        reward,
        owner,
        uri,
    })
}
