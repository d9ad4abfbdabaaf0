//! Scripted in-memory chain for driver and runner tests

use crate::chain::{ChainRpc, Connector, NonceTag, Receipt, RpcFailure, RpcResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{keccak256, rlp};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

pub const KEY_A: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const KEY_B: &str = "0x646f1ce2fdad0e6deeeb5c7e8e5543bdde65e86029e2fd9fc169899c440a7913";

/// How the fake node answers the next `eth_sendRawTransaction`
#[derive(Debug, Clone)]
pub enum SendBehavior {
    /// Accept and mine immediately
    Accept,
    /// Accept into the "mempool" but never mine
    AcceptNoReceipt,
    /// Answer with a JSON-RPC error
    Reject(String),
    /// Mine the transaction but answer "already known"
    AlreadyKnown,
    /// Connection failure; the node never sees the request
    Transport,
}

/// A transaction that reached the fake node
#[derive(Debug, Clone)]
pub struct SentTx {
    pub hash: H256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas_limit: u64,
    /// Legacy gas price or EIP-1559 max fee
    pub fee: U256,
    pub accepted: bool,
}

struct State {
    chain_id: u64,
    down: bool,
    default_balance: U256,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, (u64, u64)>,
    gas_price: U256,
    base_fee: Option<U256>,
    priority_fee: Option<U256>,
    estimate: Option<U256>,
    script: VecDeque<SendBehavior>,
    receipt_status: u64,
    gas_used: U256,
    report_effective_price: bool,
    receipts: HashMap<H256, Receipt>,
    known: HashSet<H256>,
    sent: Vec<SentTx>,
    block: u64,
}

/// Cloneable handle to one fake endpoint
#[derive(Clone)]
pub struct FakeChain {
    state: Arc<Mutex<State>>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                chain_id,
                down: false,
                default_balance: U256::exp10(20),
                balances: HashMap::new(),
                nonces: HashMap::new(),
                gas_price: U256::from(1_000_000_000u64),
                base_fee: Some(U256::from(1_000_000_000u64)),
                priority_fee: Some(U256::from(100_000_000u64)),
                estimate: Some(U256::from(50_000u64)),
                script: VecDeque::new(),
                receipt_status: 1,
                gas_used: U256::from(21_000u64),
                report_effective_price: true,
                receipts: HashMap::new(),
                known: HashSet::new(),
                sent: Vec::new(),
                block: 100,
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_down(&self, down: bool) {
        self.with(|s| s.down = down);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.with(|s| {
            s.balances.insert(address, balance);
        });
    }

    pub fn set_nonces(&self, address: Address, latest: u64, pending: u64) {
        self.with(|s| {
            s.nonces.insert(address, (latest, pending));
        });
    }

    pub fn set_receipt_status(&self, status: u64) {
        self.with(|s| s.receipt_status = status);
    }

    /// Receipts omit `effectiveGasPrice`, like some older nodes
    pub fn omit_effective_gas_price(&self) {
        self.with(|s| s.report_effective_price = false);
    }

    pub fn script(&self, behaviors: impl IntoIterator<Item = SendBehavior>) {
        self.with(|s| s.script.extend(behaviors));
    }

    /// Transactions that reached the node, accepted or not
    pub fn sent(&self) -> Vec<SentTx> {
        self.with(|s| s.sent.clone())
    }

    pub fn receipt(&self, hash: H256) -> Option<Receipt> {
        self.with(|s| s.receipts.get(&hash).cloned())
    }

    /// Mine every accepted transaction that has no receipt yet
    pub fn mine_pending(&self) {
        self.with(|s| {
            let pending: Vec<SentTx> = s
                .sent
                .iter()
                .filter(|t| t.accepted && !s.receipts.contains_key(&t.hash))
                .cloned()
                .collect();
            for sent in &pending {
                mine(s, sent, None);
            }
        });
    }
}

fn transport(s: &State) -> RpcResult<()> {
    if s.down {
        Err(RpcFailure::Transport("connection refused".to_string()))
    } else {
        Ok(())
    }
}

fn rejected(message: &str) -> RpcFailure {
    RpcFailure::Rejected {
        code: -32000,
        message: message.to_string(),
    }
}

fn mine(s: &mut State, sent: &SentTx, effective: Option<U256>) {
    let entry = s.nonces.entry(sent.from).or_insert((0, 0));
    entry.0 = entry.0.max(sent.nonce + 1);
    entry.1 = entry.1.max(entry.0);
    s.block += 1;
    let receipt = Receipt {
        tx_hash: sent.hash,
        block_number: Some(s.block),
        status: Some(s.receipt_status),
        gas_used: s.gas_used,
        effective_gas_price: if s.report_effective_price {
            Some(effective.unwrap_or(sent.fee))
        } else {
            None
        },
        logs: 0,
    };
    s.receipts.insert(sent.hash, receipt);
}

fn decode(raw: &Bytes) -> (SentTx, Option<U256>) {
    let (tx, sig) = TypedTransaction::decode_signed(&rlp::Rlp::new(raw.as_ref())).unwrap();
    let from = sig.recover(tx.sighash()).unwrap();
    let priority = match &tx {
        TypedTransaction::Eip1559(inner) => inner.max_priority_fee_per_gas,
        _ => None,
    };
    let sent = SentTx {
        hash: H256::from(keccak256(raw.as_ref())),
        from,
        to: tx.to().and_then(|t| t.as_address().copied()),
        nonce: tx.nonce().map(|n| n.as_u64()).unwrap_or_default(),
        value: tx.value().copied().unwrap_or_default(),
        gas_limit: tx.gas().map(|g| g.as_u64()).unwrap_or_default(),
        fee: tx.gas_price().unwrap_or_default(),
        accepted: false,
    };
    (sent, priority)
}

#[async_trait]
impl ChainRpc for FakeChain {
    async fn chain_id(&self) -> RpcResult<u64> {
        self.with(|s| transport(s).map(|_| s.chain_id))
    }

    async fn block_number(&self) -> RpcResult<u64> {
        self.with(|s| transport(s).map(|_| s.block))
    }

    async fn balance(&self, address: Address) -> RpcResult<U256> {
        self.with(|s| {
            transport(s)?;
            Ok(s.balances.get(&address).copied().unwrap_or(s.default_balance))
        })
    }

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> RpcResult<u64> {
        self.with(|s| {
            transport(s)?;
            let (latest, pending) = s.nonces.get(&address).copied().unwrap_or((0, 0));
            Ok(match tag {
                NonceTag::Latest => latest,
                NonceTag::Pending => pending.max(latest),
            })
        })
    }

    async fn gas_price(&self) -> RpcResult<U256> {
        self.with(|s| transport(s).map(|_| s.gas_price))
    }

    async fn max_priority_fee(&self) -> RpcResult<U256> {
        self.with(|s| {
            transport(s)?;
            s.priority_fee
                .ok_or_else(|| rejected("the method eth_maxPriorityFeePerGas does not exist"))
        })
    }

    async fn latest_base_fee(&self) -> RpcResult<Option<U256>> {
        self.with(|s| transport(s).map(|_| s.base_fee))
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> RpcResult<U256> {
        self.with(|s| {
            transport(s)?;
            s.estimate
                .ok_or_else(|| rejected("execution reverted"))
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<H256> {
        self.with(|s| {
            transport(s)?;
            let behavior = s.script.pop_front().unwrap_or(SendBehavior::Accept);
            if matches!(behavior, SendBehavior::Transport) {
                return Err(RpcFailure::Transport("connection reset by peer".to_string()));
            }

            let (mut sent, priority) = decode(&raw);
            let latest = s.nonces.get(&sent.from).map(|n| n.0).unwrap_or(0);
            let effective = s
                .base_fee
                .zip(priority)
                .map(|(base, tip)| sent.fee.min(base + tip));

            let result = match behavior {
                SendBehavior::Reject(message) => Err(rejected(&message)),
                _ if sent.nonce < latest => Err(rejected("nonce too low")),
                SendBehavior::Accept => {
                    mine(s, &sent, effective);
                    Ok(sent.hash)
                }
                SendBehavior::AlreadyKnown => {
                    mine(s, &sent, effective);
                    Err(rejected("already known"))
                }
                SendBehavior::AcceptNoReceipt => {
                    let entry = s.nonces.entry(sent.from).or_insert((0, 0));
                    entry.1 = entry.1.max(sent.nonce + 1);
                    Ok(sent.hash)
                }
                SendBehavior::Transport => unreachable!(),
            };

            sent.accepted = result.is_ok();
            if sent.accepted {
                s.known.insert(sent.hash);
            }
            s.sent.push(sent);
            result
        })
    }

    async fn transaction_receipt(&self, hash: H256) -> RpcResult<Option<Receipt>> {
        self.with(|s| {
            transport(s)?;
            Ok(s.receipts.get(&hash).cloned())
        })
    }

    async fn transaction_exists(&self, hash: H256) -> RpcResult<bool> {
        self.with(|s| {
            transport(s)?;
            Ok(s.known.contains(&hash))
        })
    }
}

/// Map `http://node{i}.test` to the i-th fake chain
pub fn connector_for(chains: &[FakeChain]) -> Connector {
    let chains = chains.to_vec();
    Arc::new(move |url: &str| {
        let index = url
            .trim_start_matches("http://node")
            .trim_end_matches(".test")
            .parse::<usize>()
            .map_err(|_| format!("unparseable test url {}", url))?;
        let chain = chains
            .get(index)
            .cloned()
            .ok_or_else(|| format!("no fake chain for {}", url))?;
        Ok(Arc::new(chain) as Arc<dyn ChainRpc>)
    })
}

/// URLs matching [`connector_for`]
pub fn urls(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("http://node{}.test", i)).collect()
}
