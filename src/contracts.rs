//! View-function ABIs for the contracts the dashboard reads.
//!
//! Both the current and the legacy contract generations are listed; calls to a
//! function that a deployment does not have simply revert and are handled as a
//! failed source by the callers.

use ethers::abi::{parse_abi, Abi, Function};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::addresses::ContractName;

const ERC20_ABI: &[&str] = &[
    "function balanceOf(address account) view returns (uint256)",
    "function allowance(address owner, address spender) view returns (uint256)",
    "function totalSupply() view returns (uint256)",
];

const MINTER_ABI: &[&str] = &[
    "function getStats(address user) view returns (uint256 userXenBurned, uint256 userXburnBurned, uint256 userRank, uint256 userLockCount)",
    "function getGlobalStats() view returns (uint256 totalXenBurned, uint256 totalXburnBurned, uint256 totalXburnSupply, uint256 currentAMP, uint256 daysSinceLaunch, uint256 totalLocks)",
    "function burnStats() view returns (uint256 xenBurned, uint256 xburnBurned, uint256 supply)",
    "function userBurns(address user) view returns (uint256)",
];

const NFT_ABI: &[&str] = &[
    "function balanceOf(address owner) view returns (uint256)",
    "function tokenOfOwnerByIndex(address owner, uint256 index) view returns (uint256)",
    "function ownerOf(uint256 tokenId) view returns (address)",
    "function tokenURI(uint256 tokenId) view returns (string)",
    "function getLockDetails(uint256 tokenId) view returns (uint256 xenAmount, uint256 maturityTs, uint256 termDays, bool redeemed, uint256 rewardAmount, address owner)",
    "function lockInfo(uint256 tokenId) view returns (uint256, uint256, uint256, bool, uint256)",
];

const PAIR_ABI: &[&str] = &[
    "function getReserves() view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)",
    "function token0() view returns (address)",
];

static ABIS: OnceLock<HashMap<ContractName, Abi>> = OnceLock::new();

fn human_readable(name: ContractName) -> &'static [&'static str] {
    match name {
        ContractName::Xen | ContractName::XburnToken => ERC20_ABI,
        ContractName::XburnMinter => MINTER_ABI,
        ContractName::XburnNft => NFT_ABI,
        ContractName::LiquidityPair => PAIR_ABI,
    }
}

fn abis() -> &'static HashMap<ContractName, Abi> {
    ABIS.get_or_init(|| {
        ContractName::ALL
            .iter()
            .map(|name| {
                let abi = parse_abi(human_readable(*name))
                    .expect("built-in ABI definitions are invalid - this is a programming error");
                (*name, abi)
            })
            .collect()
    })
}

/// Look up a view function of a logical contract.
pub fn function(name: ContractName, method: &str) -> Option<&'static Function> {
    abis()
        .get(&name)
        .and_then(|abi| abi.functions_by_name(method).ok())
        .and_then(|functions| functions.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_abi_parses() {
        for name in ContractName::ALL {
            assert!(parse_abi(human_readable(name)).is_ok(), "{} ABI failed to parse", name);
        }
    }

    #[test]
    fn test_named_outputs_are_kept() {
        let func = function(ContractName::XburnMinter, "getGlobalStats").unwrap();
        let names: Vec<&str> = func.outputs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names[0], "totalXenBurned");
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn test_legacy_outputs_are_positional() {
        let func = function(ContractName::XburnNft, "lockInfo").unwrap();
        assert!(func.outputs.iter().all(|p| p.name.is_empty()));
    }

    #[test]
    fn test_unknown_method() {
        assert!(function(ContractName::Xen, "getLockDetails").is_none());
    }
}
