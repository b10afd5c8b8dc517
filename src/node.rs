//! Node RPC boundary.
//!
//! [`NodeClient`] is the only way the synchronization layer talks to a chain.
//! The production implementation performs `eth_call`s through an ethers
//! [`Middleware`]; tests substitute a scripted client.

use ethers::abi::Token;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::addresses::ContractName;
use crate::contracts;
use crate::error::SyncError;
use crate::guard::ContractBinding;
use crate::schema::RawRecord;

/// Read-only contract call interface.
pub trait NodeClient: Send + Sync {
    fn call<'a>(
        &'a self,
        binding: ContractBinding,
        method: &'a str,
        args: Vec<Token>,
    ) -> BoxFuture<'a, Result<RawRecord, SyncError>>;
}

/// [`NodeClient`] backed by an ethers middleware stack.
pub struct EthersNode<M: Middleware> {
    provider: Arc<M>,
}

impl<M: Middleware> EthersNode<M> {
    pub fn new(provider: Arc<M>) -> Self {
        Self { provider }
    }
}

impl<M: Middleware + 'static> NodeClient for EthersNode<M> {
    fn call<'a>(
        &'a self,
        binding: ContractBinding,
        method: &'a str,
        args: Vec<Token>,
    ) -> BoxFuture<'a, Result<RawRecord, SyncError>> {
        Box::pin(async move {
            let function = contracts::function(binding.name, method).ok_or_else(|| {
                SyncError::SchemaDrift(format!("{} has no view function {}", binding.name, method))
            })?;

            let token_id = nft_token_id(&binding, &args);
            let calldata = function
                .encode_input(&args)
                .map_err(|e| SyncError::SchemaDrift(format!("{}.{}: {}", binding.name, method, e)))?;

            let tx: TypedTransaction = TransactionRequest::new()
                .to(binding.address)
                .data(calldata)
                .into();

            debug!("eth_call {}.{} on chain {}", binding.name, method, binding.chain_id);
            let output = self
                .provider
                .call(&tx, None)
                .await
                .map_err(|e| SyncError::classify(&e.to_string(), token_id))?;

            let tokens = function.decode_output(&output).map_err(|e| {
                SyncError::SchemaDrift(format!("{}.{} returned {} bytes: {}", binding.name, method, output.len(), e))
            })?;

            Ok(RawRecord::from_tokens(&function.outputs, tokens))
        })
    }
}

/// Routes every call to the node of the chain its binding was made for.
#[derive(Clone, Default)]
pub struct ChainRouter {
    nodes: HashMap<u64, Arc<dyn NodeClient>>,
}

impl ChainRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain_id: u64, node: Arc<dyn NodeClient>) {
        self.nodes.insert(chain_id, node);
    }

    pub fn with_node(mut self, chain_id: u64, node: Arc<dyn NodeClient>) -> Self {
        self.insert(chain_id, node);
        self
    }

}

impl NodeClient for ChainRouter {
    fn call<'a>(
        &'a self,
        binding: ContractBinding,
        method: &'a str,
        args: Vec<Token>,
    ) -> BoxFuture<'a, Result<RawRecord, SyncError>> {
        match self.nodes.get(&binding.chain_id) {
            Some(node) => node.call(binding, method, args),
            None => Box::pin(async move {
                Err(SyncError::Rejected(format!(
                    "no RPC endpoint configured for chain {}",
                    binding.chain_id
                )))
            }),
        }
    }
}

/// Token id argument of an NFT call, used to tag vanished-token errors.
fn nft_token_id(binding: &ContractBinding, args: &[Token]) -> Option<U256> {
    if binding.name != ContractName::XburnNft {
        return None;
    }
    match args {
        [Token::Uint(id)] => Some(*id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: ContractName) -> ContractBinding {
        ContractBinding {
            name,
            address: Address::from_low_u64_be(1),
            chain_id: 8453,
        }
    }

    #[test]
    fn test_nft_token_id_only_for_single_uint_nft_calls() {
        let id = U256::from(12);
        assert_eq!(nft_token_id(&binding(ContractName::XburnNft), &[Token::Uint(id)]), Some(id));
        assert_eq!(nft_token_id(&binding(ContractName::Xen), &[Token::Uint(id)]), None);
        assert_eq!(
            nft_token_id(
                &binding(ContractName::XburnNft),
                &[Token::Address(Address::zero()), Token::Uint(id)]
            ),
            None
        );
    }

    #[tokio::test]
    async fn test_ethers_node_decodes_mocked_response() {
        let (provider, mock) = Provider::mocked();
        let mut word = [0u8; 32];
        U256::from(1000).to_big_endian(&mut word);
        mock.push::<Bytes, _>(Bytes::from(word.to_vec())).unwrap();

        let node = EthersNode::new(Arc::new(provider));
        let record = node
            .call(binding(ContractName::Xen), "balanceOf", vec![Token::Address(Address::zero())])
            .await
            .unwrap();
        assert_eq!(record.positional, vec![serde_json::json!("1000")]);
    }

    #[tokio::test]
    async fn test_router_picks_node_by_chain() {
        let base = Arc::new(crate::testing::ScriptedNode::new());
        base.respond(
            ContractName::Xen,
            "totalSupply",
            Ok(RawRecord::default().with_positional("5")),
        );
        let router = ChainRouter::new().with_node(8453, base.clone());

        let record = router
            .call(binding(ContractName::Xen), "totalSupply", vec![])
            .await
            .unwrap();
        assert_eq!(record.uint_at(0), Some(U256::from(5)));
        assert_eq!(base.total_calls(), 1);

        let elsewhere = ContractBinding {
            chain_id: 10,
            ..binding(ContractName::Xen)
        };
        let err = router.call(elsewhere, "totalSupply", vec![]).await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_ethers_node_unknown_method_is_schema_drift() {
        let (provider, _mock) = Provider::mocked();
        let node = EthersNode::new(Arc::new(provider));
        let err = node
            .call(binding(ContractName::Xen), "getLockDetails", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SchemaDrift(_)));
    }
}
