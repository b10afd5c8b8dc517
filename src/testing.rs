//! Test doubles shared by the unit tests.

use ethers::abi::Token;
use ethers::types::Address;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::addresses::{AddressBook, ContractName};
use crate::context::ChainContext;
use crate::error::SyncError;
use crate::guard::ContractBinding;
use crate::node::NodeClient;
use crate::reader::ContractReader;
use crate::retry::RetryPolicy;
use crate::scheduler::RequestScheduler;
use crate::schema::RawRecord;

pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

pub fn account() -> Address {
    Address::from_low_u64_be(0xa11ce)
}

pub fn address_of(chain_id: u64, name: ContractName) -> Address {
    let index = ContractName::ALL.iter().position(|n| *n == name).unwrap_or(0) as u64;
    Address::from_low_u64_be(chain_id * 100 + index + 1)
}

/// Every contract deployed on Base (8453) and Optimism (10) at synthetic addresses.
pub fn address_book() -> AddressBook {
    let mut book = AddressBook::new();
    for chain_id in [8453, 10] {
        for name in ContractName::ALL {
            book.insert(chain_id, name, address_of(chain_id, name));
        }
    }
    book
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(200),
        backoff_factor: 2,
        max_delay: Duration::from_millis(800),
    }
}

pub fn context(chain_id: u64, account: Option<Address>) -> Arc<ChainContext> {
    Arc::new(ChainContext::new(chain_id, account, Arc::new(address_book())))
}

pub fn reader(node: Arc<ScriptedNode>, chain_id: u64, account: Option<Address>) -> ContractReader {
    reader_with_context(node, context(chain_id, account))
}

pub fn reader_with_context(node: Arc<ScriptedNode>, context: Arc<ChainContext>) -> ContractReader {
    let scheduler = RequestScheduler::new(MIN_INTERVAL, Duration::from_millis(10));
    ContractReader::new(context, scheduler, node, fast_retry())
}

struct Scripted {
    result: Result<RawRecord, SyncError>,
    delay: Duration,
}

/// [`NodeClient`] answering from scripted responses and recording every call.
///
/// Responses are keyed by `Contract.method` or `Contract.method(args)`; the
/// argument-specific key wins. A queue with several entries is consumed in
/// order and its last entry repeats.
#[derive(Default)]
pub struct ScriptedNode {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, name: ContractName, method: &str, result: Result<RawRecord, SyncError>) {
        self.push(format!("{}.{}", name, method), result, Duration::ZERO);
    }

    pub fn respond_to(
        &self,
        name: ContractName,
        method: &str,
        args: &[Token],
        result: Result<RawRecord, SyncError>,
    ) {
        self.push(format!("{}.{}({})", name, method, args_key(args)), result, Duration::ZERO);
    }

    /// Drop every scripted response for `name.method`, including argument-specific ones.
    pub fn clear(&self, name: ContractName, method: &str) {
        let prefix = format!("{}.{}", name, method);
        self.responses
            .lock()
            .unwrap()
            .retain(|key, _| key != &prefix && !key.starts_with(&format!("{}(", prefix)));
    }

    fn push(&self, key: String, result: Result<RawRecord, SyncError>, delay: Duration) {
        self.responses
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push_back(Scripted { result, delay });
    }

    fn next(&self, keys: &[String]) -> Option<(Result<RawRecord, SyncError>, Duration)> {
        let mut responses = self.responses.lock().unwrap();
        for key in keys {
            if let Some(queue) = responses.get_mut(key) {
                let scripted = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().map(|s| Scripted {
                        result: s.result.clone(),
                        delay: s.delay,
                    })
                };
                if let Some(s) = scripted {
                    return Some((s.result, s.delay));
                }
            }
        }
        None
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_count(&self, name: ContractName, method: &str) -> usize {
        let prefix = format!("{}.{}(", name, method);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }
}

fn args_key(args: &[Token]) -> String {
    args.iter()
        .map(|t| match t {
            Token::Uint(v) => v.to_string(),
            Token::Address(a) => format!("{:?}", a),
            other => format!("{:?}", other),
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl NodeClient for ScriptedNode {
    fn call<'a>(
        &'a self,
        binding: ContractBinding,
        method: &'a str,
        args: Vec<Token>,
    ) -> BoxFuture<'a, Result<RawRecord, SyncError>> {
        Box::pin(async move {
            let plain = format!("{}.{}", binding.name, method);
            let specific = format!("{}({})", plain, args_key(&args));
            self.calls.lock().unwrap().push(specific.clone());

            let (result, delay) = self
                .next(&[specific, plain.clone()])
                .unwrap_or_else(|| (Err(SyncError::Revert(format!("no scripted response for {}", plain))), Duration::ZERO));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}
