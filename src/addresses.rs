//! Per-chain contract address book.
//!
//! Logical contract names map to deployed addresses for each supported chain.
//! The built-in entries cover the XEN token; deployments of the XBurn contracts
//! are supplied through an address book JSON file (see [`AddressBook::load_file`]).

use anyhow::{Context as _, Result};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Logical contract identities the dashboard talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContractName {
    /// The XEN ERC-20 token that gets burned.
    Xen,
    /// The XBurn minter: burns XEN, mints XBURN and lock NFTs, exposes stats.
    XburnMinter,
    /// The XBURN ERC-20 token.
    XburnToken,
    /// The ERC-721 collection representing burn locks.
    XburnNft,
    /// The XEN/XBURN liquidity pair.
    LiquidityPair,
}

impl ContractName {
    pub const ALL: [ContractName; 5] = [
        ContractName::Xen,
        ContractName::XburnMinter,
        ContractName::XburnToken,
        ContractName::XburnNft,
        ContractName::LiquidityPair,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ContractName::Xen => "XEN",
            ContractName::XburnMinter => "XBurnMinter",
            ContractName::XburnToken => "XBURN",
            ContractName::XburnNft => "XBurnNFT",
            ContractName::LiquidityPair => "XEN/XBURN pair",
        }
    }
}

impl fmt::Display for ContractName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Contract addresses deployed on one chain.
pub type AddressTable = HashMap<ContractName, Address>;

/// XEN token deployments known at build time.
const BUILTIN_XEN: &[(u64, &str)] = &[
    (1, "0x06450dEe7FD2Fb8E39061434BAbCFC05599a6Fb8"),
    (8453, "0xffcbF84650cE02DaFE96926B37a0ac5E34932fa5"),
];

static BUILTIN_BOOK: OnceLock<AddressBook> = OnceLock::new();

/// Chain id → contract table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressBook {
    #[serde(default)]
    pub chains: HashMap<u64, AddressTable>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address book holding only the entries shipped with the crate.
    pub fn builtin() -> &'static AddressBook {
        BUILTIN_BOOK.get_or_init(|| {
            let mut book = AddressBook::new();
            for (chain_id, address) in BUILTIN_XEN {
                // Constants are checked by test_builtin_entries_parse.
                if let Ok(address) = address.parse::<Address>() {
                    book.insert(*chain_id, ContractName::Xen, address);
                }
            }
            book
        })
    }

    /// Load an address book file and layer it over the built-in entries.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read address book {:?}", path))?;
        let overlay: AddressBook = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse address book {:?}", path))?;

        let mut book = Self::builtin().clone();
        book.merge(overlay);
        tracing::info!("Loaded address book from {:?}", path);
        Ok(book)
    }

    /// Entries in `other` replace entries in `self`.
    pub fn merge(&mut self, other: AddressBook) {
        for (chain_id, table) in other.chains {
            self.chains.entry(chain_id).or_default().extend(table);
        }
    }

    pub fn insert(&mut self, chain_id: u64, name: ContractName, address: Address) {
        self.chains.entry(chain_id).or_default().insert(name, address);
    }

    /// Builder-style [`AddressBook::insert`].
    pub fn with(mut self, chain_id: u64, name: ContractName, address: Address) -> Self {
        self.insert(chain_id, name, address);
        self
    }

    pub fn table(&self, chain_id: u64) -> Option<&AddressTable> {
        self.chains.get(&chain_id)
    }

    pub fn address_of(&self, chain_id: u64, name: ContractName) -> Option<Address> {
        self.table(chain_id).and_then(|t| t.get(&name)).copied()
    }

    /// Whether every contract the dashboard needs is deployed on `chain_id`.
    pub fn is_fully_deployed(&self, chain_id: u64) -> bool {
        ContractName::ALL
            .iter()
            .all(|name| self.address_of(chain_id, *name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[test]
    fn test_builtin_entries_parse() {
        for (_, address) in BUILTIN_XEN {
            assert!(address.parse::<Address>().is_ok(), "{} is not an address", address);
        }
        let book = AddressBook::builtin();
        assert!(book.address_of(1, ContractName::Xen).is_some());
        assert!(book.address_of(8453, ContractName::Xen).is_some());
    }

    #[test]
    fn test_address_of_missing_chain() {
        let book = AddressBook::new().with(10, ContractName::Xen, addr(1));
        assert_eq!(book.address_of(10, ContractName::Xen), Some(addr(1)));
        assert_eq!(book.address_of(10, ContractName::XburnNft), None);
        assert_eq!(book.address_of(999, ContractName::Xen), None);
    }

    #[test]
    fn test_merge_overrides_entries() {
        let mut book = AddressBook::new()
            .with(10, ContractName::Xen, addr(1))
            .with(10, ContractName::XburnToken, addr(2));
        book.merge(AddressBook::new().with(10, ContractName::Xen, addr(9)));

        assert_eq!(book.address_of(10, ContractName::Xen), Some(addr(9)));
        assert_eq!(book.address_of(10, ContractName::XburnToken), Some(addr(2)));
    }

    #[test]
    fn test_is_fully_deployed() {
        let mut book = AddressBook::new();
        for (i, name) in ContractName::ALL.iter().enumerate() {
            book.insert(8453, *name, addr(i as u64 + 1));
        }
        assert!(book.is_fully_deployed(8453));
        assert!(!book.is_fully_deployed(1));
    }

    #[test]
    fn test_address_book_json_round_trip_shape() {
        let json = r#"{"chains":{"10":{"XburnMinter":"0x0000000000000000000000000000000000000005"}}}"#;
        let book: AddressBook = serde_json::from_str(json).unwrap();
        assert_eq!(book.address_of(10, ContractName::XburnMinter), Some(addr(5)));
    }
}
