//! Active chain / account context.
//!
//! The context is the single owner of "which chain and which account are we
//! talking about". Every change bumps the epoch; async work captures an
//! [`EpochToken`] when it starts and compares it against the context at each
//! suspension point to find out whether its result is still wanted.

use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::addresses::{AddressBook, AddressTable, ContractName};

/// Point-in-time copy of the context captured by in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochToken {
    pub epoch: u64,
    pub chain_id: u64,
    pub account: Option<Address>,
}

#[derive(Debug, Clone)]
struct ContextState {
    chain_id: u64,
    account: Option<Address>,
    epoch: u64,
}

pub struct ChainContext {
    state: watch::Sender<ContextState>,
    address_book: Arc<AddressBook>,
}

impl ChainContext {
    pub fn new(chain_id: u64, account: Option<Address>, address_book: Arc<AddressBook>) -> Self {
        let (state, _) = watch::channel(ContextState {
            chain_id,
            account,
            epoch: 0,
        });
        Self { state, address_book }
    }

    pub fn snapshot(&self) -> EpochToken {
        let state = self.state.borrow();
        EpochToken {
            epoch: state.epoch,
            chain_id: state.chain_id,
            account: state.account,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.state.borrow().chain_id
    }

    pub fn account(&self) -> Option<Address> {
        self.state.borrow().account
    }

    pub fn epoch(&self) -> u64 {
        self.state.borrow().epoch
    }

    /// Whether work started under `token` may still write its result.
    pub fn is_current(&self, token: &EpochToken) -> bool {
        let state = self.state.borrow();
        state.epoch == token.epoch && state.chain_id == token.chain_id
    }

    /// Switch the active chain. Returns the new epoch (unchanged if the chain is the same).
    pub fn switch_chain(&self, chain_id: u64) -> u64 {
        self.update(|state| {
            if state.chain_id == chain_id {
                return false;
            }
            info!("Switching chain {} -> {}", state.chain_id, chain_id);
            state.chain_id = chain_id;
            true
        })
    }

    /// Change the connected account. Returns the new epoch (unchanged if the account is the same).
    pub fn set_account(&self, account: Option<Address>) -> u64 {
        self.update(|state| {
            if state.account == account {
                return false;
            }
            info!("Account changed {:?} -> {:?}", state.account, account);
            state.account = account;
            true
        })
    }

    pub fn disconnect(&self) -> u64 {
        self.set_account(None)
    }

    fn update(&self, change: impl FnOnce(&mut ContextState) -> bool) -> u64 {
        self.state.send_if_modified(|state| {
            let changed = change(state);
            if changed {
                state.epoch += 1;
            }
            changed
        });
        self.epoch()
    }

    /// Receiver notified with every epoch change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        let mut state_rx = self.state.subscribe();
        let (tx, rx) = watch::channel(state_rx.borrow().epoch);
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let epoch = state_rx.borrow().epoch;
                if tx.send(epoch).is_err() {
                    break;
                }
            }
        });
        rx
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.address_book
    }

    /// Contract table for the active chain.
    pub fn address_table(&self) -> Option<&AddressTable> {
        self.address_book.table(self.chain_id())
    }

    pub fn address_of(&self, name: ContractName) -> Option<Address> {
        self.address_book.address_of(self.chain_id(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ChainContext {
        let book = AddressBook::new()
            .with(8453, ContractName::Xen, Address::from_low_u64_be(1))
            .with(10, ContractName::Xen, Address::from_low_u64_be(2));
        ChainContext::new(8453, Some(Address::from_low_u64_be(0xa)), Arc::new(book))
    }

    #[test]
    fn test_switch_chain_bumps_epoch() {
        let ctx = context();
        let token = ctx.snapshot();
        assert_eq!(ctx.switch_chain(10), 1);
        assert_eq!(ctx.chain_id(), 10);
        assert!(!ctx.is_current(&token));
    }

    #[test]
    fn test_switch_to_same_chain_is_noop() {
        let ctx = context();
        let token = ctx.snapshot();
        assert_eq!(ctx.switch_chain(8453), 0);
        assert!(ctx.is_current(&token));
    }

    #[test]
    fn test_account_change_bumps_epoch() {
        let ctx = context();
        let token = ctx.snapshot();
        ctx.set_account(Some(Address::from_low_u64_be(0xb)));
        assert!(!ctx.is_current(&token));
        assert_eq!(ctx.disconnect(), 2);
        assert_eq!(ctx.account(), None);
    }

    #[test]
    fn test_address_lookup_follows_chain() {
        let ctx = context();
        assert_eq!(ctx.address_of(ContractName::Xen), Some(Address::from_low_u64_be(1)));
        ctx.switch_chain(10);
        assert_eq!(ctx.address_of(ContractName::Xen), Some(Address::from_low_u64_be(2)));
        ctx.switch_chain(1);
        assert!(ctx.address_table().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_sees_epoch_changes() {
        let ctx = context();
        let mut rx = ctx.subscribe();
        ctx.switch_chain(10);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
