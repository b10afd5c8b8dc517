//! Contract bindings and the consistency guard that keeps them honest.

use ethers::types::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::addresses::ContractName;
use crate::context::ChainContext;

/// A contract handle tagged with the chain and address it was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractBinding {
    pub name: ContractName,
    pub address: Address,
    pub chain_id: u64,
}

#[derive(Clone)]
pub struct ConsistencyGuard {
    context: Arc<ChainContext>,
}

impl ConsistencyGuard {
    pub fn new(context: Arc<ChainContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ChainContext> {
        &self.context
    }

    /// Resolve a fresh binding from the active chain's address table.
    pub fn bind(&self, name: ContractName) -> Option<ContractBinding> {
        let chain_id = self.context.chain_id();
        self.context
            .address_book()
            .address_of(chain_id, name)
            .map(|address| ContractBinding {
                name,
                address,
                chain_id,
            })
    }

    /// Check that `binding` still matches the active chain and address table.
    /// Never fails loudly: callers skip the operation when this returns false.
    pub fn assert_fresh(&self, binding: &ContractBinding) -> bool {
        let fresh = self.is_fresh(binding);
        if !fresh {
            warn!(
                "Skipping call on stale {} binding (bound to chain {} at {:?}, active chain {})",
                binding.name,
                binding.chain_id,
                binding.address,
                self.context.chain_id()
            );
        }
        fresh
    }

    fn is_fresh(&self, binding: &ContractBinding) -> bool {
        let chain_id = self.context.chain_id();
        binding.chain_id == chain_id
            && self.context.address_book().address_of(chain_id, binding.name) == Some(binding.address)
    }
}

/// Lazily created bindings held by a long-lived component.
///
/// When the active chain differs from the chain the set was built for, every
/// binding is dropped and re-resolved; bindings are never patched in place.
pub struct BindingSet {
    guard: ConsistencyGuard,
    inner: Mutex<BindingSetInner>,
}

struct BindingSetInner {
    chain_id: u64,
    bindings: HashMap<ContractName, ContractBinding>,
}

impl BindingSet {
    pub fn new(guard: ConsistencyGuard) -> Self {
        let chain_id = guard.context().chain_id();
        Self {
            guard,
            inner: Mutex::new(BindingSetInner {
                chain_id,
                bindings: HashMap::new(),
            }),
        }
    }

    pub fn guard(&self) -> &ConsistencyGuard {
        &self.guard
    }

    /// Binding for `name` on the active chain, or None if it is not deployed there.
    pub fn get(&self, name: ContractName) -> Option<ContractBinding> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let chain_id = self.guard.context().chain_id();
        if inner.chain_id != chain_id {
            debug!("Rebuilding contract bindings for chain {}", chain_id);
            inner.bindings.clear();
            inner.chain_id = chain_id;
        }

        if let Some(binding) = inner.bindings.get(&name) {
            return Some(*binding);
        }

        let binding = self.guard.bind(name)?;
        inner.bindings.insert(name, binding);
        Some(binding)
    }
}
