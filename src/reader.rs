//! Guarded, throttled, retried contract reads.
//!
//! [`ContractReader::read`] is the single path every component uses to reach
//! the node: the retry wrapper drives attempts, each attempt is queued on the
//! scheduler, and the consistency guard is consulted inside the queued thunk
//! right before the call leaves the process.

use ethers::abi::Token;
use std::sync::Arc;

use crate::addresses::ContractName;
use crate::context::{ChainContext, EpochToken};
use crate::error::SyncError;
use crate::guard::{BindingSet, ConsistencyGuard, ContractBinding};
use crate::node::NodeClient;
use crate::retry::{with_retry, RetryPolicy};
use crate::scheduler::RequestScheduler;
use crate::schema::RawRecord;

#[derive(Clone)]
pub struct ContractReader {
    context: Arc<ChainContext>,
    scheduler: RequestScheduler,
    node: Arc<dyn NodeClient>,
    guard: ConsistencyGuard,
    bindings: Arc<BindingSet>,
    policy: RetryPolicy,
}

impl ContractReader {
    pub fn new(
        context: Arc<ChainContext>,
        scheduler: RequestScheduler,
        node: Arc<dyn NodeClient>,
        policy: RetryPolicy,
    ) -> Self {
        let guard = ConsistencyGuard::new(context.clone());
        let bindings = Arc::new(BindingSet::new(guard.clone()));
        Self {
            context,
            scheduler,
            node,
            guard,
            bindings,
            policy,
        }
    }

    pub fn context(&self) -> &Arc<ChainContext> {
        &self.context
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn guard(&self) -> &ConsistencyGuard {
        &self.guard
    }

    /// Binding for `name` on the active chain.
    pub fn binding(&self, name: ContractName) -> Result<ContractBinding, SyncError> {
        self.bindings.get(name).ok_or_else(|| SyncError::MissingContract {
            contract: name.label().to_string(),
            chain_id: self.context.chain_id(),
        })
    }

    /// Read `method` on contract `name` under the context captured in `token`.
    ///
    /// `Ok(None)` means the context moved on and the result is no longer wanted.
    pub async fn read(
        &self,
        token: EpochToken,
        name: ContractName,
        method: &'static str,
        args: Vec<Token>,
    ) -> Result<Option<RawRecord>, SyncError> {
        if !self.context.is_current(&token) {
            return Ok(None);
        }
        let binding = self.binding(name)?;
        let label = format!("{}.{}", name, method);

        with_retry(&self.scheduler, &self.context, token, &self.policy, &label, || {
            let guard = self.guard.clone();
            let node = self.node.clone();
            let args = args.clone();
            async move {
                if !guard.assert_fresh(&binding) {
                    return Err(SyncError::StaleContext);
                }
                node.call(binding, method, args).await
            }
        })
        .await
    }
}
