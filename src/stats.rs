//! Statistics aggregation across contract generations.
//!
//! A refresh issues every configured source read concurrently, tolerates any
//! subset of them failing, and merges the survivors into one [`StatsSnapshot`]
//! using a declarative, priority-ordered candidate table per field.

use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{Address, U256};
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

use crate::addresses::ContractName;
use crate::context::EpochToken;
use crate::error::SyncError;
use crate::reader::ContractReader;
use crate::schema::{resolve_address, resolve_uint, Candidate, FieldPath, Parser, SourceRecords};
use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatField {
    UserXenBurned,
    UserXburnBurned,
    UserRank,
    UserLockCount,
    TotalXenBurned,
    TotalXburnBurned,
    XburnSupply,
    CurrentAmp,
    DaysSinceLaunch,
    TotalLocks,
    /// XEN side of the liquidity pair.
    ReserveXen,
    /// XBURN side of the liquidity pair.
    ReserveXburn,
}

impl fmt::Display for StatField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceArgs {
    None,
    /// The active account as the only argument.
    Account,
}

/// One contract read feeding the aggregator.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: &'static str,
    pub contract: ContractName,
    pub method: &'static str,
    pub args: SourceArgs,
}

impl SourceSpec {
    pub const fn new(name: &'static str, contract: ContractName, method: &'static str, args: SourceArgs) -> Self {
        Self {
            name,
            contract,
            method,
            args,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub field: StatField,
    pub candidates: Vec<Candidate>,
}

pub const USER_STATS: &str = "userStats";
pub const LEGACY_USER_BURNS: &str = "legacyUserBurns";
pub const GLOBAL_STATS: &str = "globalStats";
pub const LEGACY_STATS: &str = "legacyStats";
pub const XBURN_SUPPLY: &str = "xburnSupply";
pub const PAIR_RESERVES: &str = "pairReserves";
pub const PAIR_TOKEN0: &str = "pairToken0";

/// Sources and per-field candidate lists.
#[derive(Debug, Clone)]
pub struct StatsTable {
    pub sources: Vec<SourceSpec>,
    pub fields: Vec<FieldSpec>,
}

impl Default for StatsTable {
    fn default() -> Self {
        use FieldPath::{Index, Key};
        use StatField::*;

        let field = |field, candidates: &[Candidate]| FieldSpec {
            field,
            candidates: candidates.to_vec(),
        };

        Self {
            sources: vec![
                SourceSpec::new(USER_STATS, ContractName::XburnMinter, "getStats", SourceArgs::Account),
                SourceSpec::new(LEGACY_USER_BURNS, ContractName::XburnMinter, "userBurns", SourceArgs::Account),
                SourceSpec::new(GLOBAL_STATS, ContractName::XburnMinter, "getGlobalStats", SourceArgs::None),
                SourceSpec::new(LEGACY_STATS, ContractName::XburnMinter, "burnStats", SourceArgs::None),
                SourceSpec::new(XBURN_SUPPLY, ContractName::XburnToken, "totalSupply", SourceArgs::None),
                SourceSpec::new(PAIR_RESERVES, ContractName::LiquidityPair, "getReserves", SourceArgs::None),
                SourceSpec::new(PAIR_TOKEN0, ContractName::LiquidityPair, "token0", SourceArgs::None),
            ],
            fields: vec![
                field(UserXenBurned, &[
                    Candidate::uint(USER_STATS, Key("userXenBurned")),
                    Candidate::uint(LEGACY_USER_BURNS, Index(0)),
                ]),
                field(UserXburnBurned, &[Candidate::uint(USER_STATS, Key("userXburnBurned"))]),
                field(UserRank, &[Candidate::uint(USER_STATS, Key("userRank"))]),
                field(UserLockCount, &[Candidate::uint(USER_STATS, Key("userLockCount"))]),
                field(TotalXenBurned, &[
                    Candidate::uint(GLOBAL_STATS, Key("totalXenBurned")),
                    Candidate::uint(LEGACY_STATS, Key("xenBurned")),
                    Candidate::uint(LEGACY_STATS, Index(0)),
                ]),
                field(TotalXburnBurned, &[
                    Candidate::uint(GLOBAL_STATS, Key("totalXburnBurned")),
                    Candidate::uint(LEGACY_STATS, Key("xburnBurned")),
                    Candidate::uint(LEGACY_STATS, Index(1)),
                ]),
                field(XburnSupply, &[
                    Candidate::uint(GLOBAL_STATS, Key("totalXburnSupply")),
                    Candidate::uint(XBURN_SUPPLY, Index(0)),
                    Candidate::uint(LEGACY_STATS, Key("supply")),
                    Candidate::uint(LEGACY_STATS, Index(2)),
                ]),
                field(CurrentAmp, &[Candidate::uint(GLOBAL_STATS, Key("currentAMP"))]),
                field(DaysSinceLaunch, &[Candidate::uint(GLOBAL_STATS, Key("daysSinceLaunch"))]),
                field(TotalLocks, &[Candidate::uint(GLOBAL_STATS, Key("totalLocks"))]),
            ],
        }
    }
}

/// Merged point-in-time statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub values: BTreeMap<StatField, U256>,
    /// `source: reason` for every source that failed this refresh.
    pub failed_sources: Vec<String>,
    /// Non-fatal summary of partial failure; the values are still usable.
    pub error: Option<String>,
    pub chain_id: u64,
    pub epoch: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    pub fn get(&self, field: StatField) -> Option<U256> {
        self.values.get(&field).copied()
    }

    pub fn is_partial(&self) -> bool {
        self.error.is_some()
    }

    /// XEN paid per XBURN according to the pool reserves.
    pub fn xburn_price_in_xen(&self) -> Option<f64> {
        let xen = utils::to_f64(self.get(StatField::ReserveXen)?);
        let xburn = utils::to_f64(self.get(StatField::ReserveXburn)?);
        if xburn == 0.0 {
            None
        } else {
            Some(xen / xburn)
        }
    }
}

enum SourceOutcome {
    Loaded(crate::schema::RawRecord),
    Failed(SyncError),
    /// Needs an account and none is connected.
    Skipped,
    /// The context moved on while the read was in flight.
    Stale,
}

pub struct StatsAggregator {
    reader: ContractReader,
    table: StatsTable,
}

impl StatsAggregator {
    pub fn new(reader: ContractReader) -> Self {
        Self::with_table(reader, StatsTable::default())
    }

    pub fn with_table(reader: ContractReader, table: StatsTable) -> Self {
        Self { reader, table }
    }

    pub fn table(&self) -> &StatsTable {
        &self.table
    }

    /// Build a new snapshot. Fields no source could provide keep their value
    /// from `previous` (when it belongs to the same epoch).
    ///
    /// Returns `Ok(None)` when the context changed during the refresh.
    pub async fn refresh(
        &self,
        token: EpochToken,
        previous: Option<StatsSnapshot>,
    ) -> Result<Option<StatsSnapshot>, SyncError> {
        let reads = self.table.sources.iter().map(|source| self.read_source(token, source));
        let outcomes = join_all(reads).await;

        if !self.reader.context().is_current(&token) {
            debug!("Stats refresh for epoch {} is stale, discarding", token.epoch);
            return Ok(None);
        }

        let mut records = SourceRecords::new();
        let mut failed_names = HashSet::new();
        let mut failed_sources = Vec::new();
        for (source, outcome) in self.table.sources.iter().zip(outcomes) {
            match outcome {
                SourceOutcome::Loaded(record) => {
                    records.insert(source.name, record);
                }
                SourceOutcome::Failed(e) => {
                    warn!("Stats source {} failed: {}", source.name, e);
                    failed_names.insert(source.name);
                    failed_sources.push(format!("{}: {}", source.name, e));
                }
                SourceOutcome::Skipped => debug!("Stats source {} skipped (no account)", source.name),
                SourceOutcome::Stale => return Ok(None),
            }
        }

        let mut values = previous
            .filter(|p| p.epoch == token.epoch && p.chain_id == token.chain_id)
            .map(|p| p.values)
            .unwrap_or_default();

        let mut unresolved = Vec::new();
        for spec in &self.table.fields {
            match resolve_uint(&records, &spec.candidates) {
                Some(value) => {
                    values.insert(spec.field, value);
                }
                None => {
                    let every_source_failed = spec
                        .candidates
                        .iter()
                        .all(|c| failed_names.contains(c.source));
                    if every_source_failed {
                        unresolved.push(spec.field);
                    }
                }
            }
        }

        let xen = self.reader.context().address_of(ContractName::Xen);
        orient_reserves(&records, xen, &mut values);

        let error = partial_failure_message(&failed_sources, &unresolved);
        Ok(Some(StatsSnapshot {
            values,
            failed_sources,
            error,
            chain_id: token.chain_id,
            epoch: token.epoch,
            refreshed_at: Some(Utc::now()),
        }))
    }

    async fn read_source(&self, token: EpochToken, source: &SourceSpec) -> SourceOutcome {
        let args = match source.args {
            SourceArgs::None => Vec::new(),
            SourceArgs::Account => match token.account {
                Some(account) => vec![Token::Address(account)],
                None => return SourceOutcome::Skipped,
            },
        };

        match self.reader.read(token, source.contract, source.method, args).await {
            Ok(Some(record)) => SourceOutcome::Loaded(record),
            Ok(None) => SourceOutcome::Stale,
            Err(e) => SourceOutcome::Failed(e),
        }
    }
}

/// Map raw pair reserves onto the XEN / XBURN sides using `token0`.
fn orient_reserves(records: &SourceRecords, xen: Option<Address>, values: &mut BTreeMap<StatField, U256>) {
    let token0 = resolve_address(
        records,
        &[Candidate::new(PAIR_TOKEN0, FieldPath::Index(0), Parser::Address)],
    );
    let reserve0 = resolve_uint(
        records,
        &[
            Candidate::uint(PAIR_RESERVES, FieldPath::Key("reserve0")),
            Candidate::uint(PAIR_RESERVES, FieldPath::Index(0)),
        ],
    );
    let reserve1 = resolve_uint(
        records,
        &[
            Candidate::uint(PAIR_RESERVES, FieldPath::Key("reserve1")),
            Candidate::uint(PAIR_RESERVES, FieldPath::Index(1)),
        ],
    );

    if let (Some(token0), Some(xen), Some(r0), Some(r1)) = (token0, xen, reserve0, reserve1) {
        let (xen_side, xburn_side) = if token0 == xen { (r0, r1) } else { (r1, r0) };
        values.insert(StatField::ReserveXen, xen_side);
        values.insert(StatField::ReserveXburn, xburn_side);
    }
}

fn partial_failure_message(failed_sources: &[String], unresolved: &[StatField]) -> Option<String> {
    if failed_sources.is_empty() {
        return None;
    }
    let mut message = format!("Partial data: {} source(s) failed", failed_sources.len());
    if !unresolved.is_empty() {
        let fields: Vec<String> = unresolved.iter().map(|f| f.to_string()).collect();
        message.push_str(&format!("; no source for {}", fields.join(", ")));
    }
    Some(message)
}
