//! JSON-RPC surface consumed by the driver
//!
//! The driver never talks to `ethers` providers directly; it goes through
//! [`ChainRpc`] so endpoints can be swapped, rotated and faked in tests.

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Failure of a single RPC call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcFailure {
    /// Request never produced a JSON-RPC answer (socket, HTTP, timeout)
    Transport(String),
    /// Node answered with a JSON-RPC error object
    Rejected { code: i64, message: String },
}

impl RpcFailure {
    /// True when a node actually saw the request
    pub fn reached_node(&self) -> bool {
        matches!(self, RpcFailure::Rejected { .. })
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcFailure::Transport(message) => write!(f, "transport error: {}", message),
            RpcFailure::Rejected { code, message } => write!(f, "rpc error {}: {}", code, message),
        }
    }
}

pub type RpcResult<T> = Result<T, RpcFailure>;

/// Block tag for `eth_getTransactionCount`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    Latest,
    Pending,
}

/// Transaction receipt, decoded with every node-dependent field optional
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub status: Option<u64>,
    pub gas_used: U256,
    pub effective_gas_price: Option<U256>,
    pub logs: usize,
}

impl Receipt {
    /// Status 0 means reverted; nodes that omit status are taken at their word
    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s == 1).unwrap_or(true)
    }
}

impl From<TransactionReceipt> for Receipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            status: receipt.status.map(|s| s.as_u64()),
            gas_used: receipt.gas_used.unwrap_or_default(),
            effective_gas_price: receipt.effective_gas_price,
            logs: receipt.logs.len(),
        }
    }
}

/// The EVM JSON-RPC methods the driver consumes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> RpcResult<u64>;

    async fn block_number(&self) -> RpcResult<u64>;

    async fn balance(&self, address: Address) -> RpcResult<U256>;

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> RpcResult<u64>;

    async fn gas_price(&self) -> RpcResult<U256>;

    async fn max_priority_fee(&self) -> RpcResult<U256>;

    /// `baseFeePerGas` of the latest block, if the chain reports one
    async fn latest_base_fee(&self) -> RpcResult<Option<U256>>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RpcResult<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<H256>;

    async fn transaction_receipt(&self, hash: H256) -> RpcResult<Option<Receipt>>;

    /// Whether the node knows the transaction at all (`eth_getTransaction`)
    async fn transaction_exists(&self, hash: H256) -> RpcResult<bool>;
}

/// HTTP JSON-RPC client backed by an ethers provider
pub struct HttpRpc {
    provider: Provider<Http>,
    request_timeout: Duration,
}

impl HttpRpc {
    pub fn connect(url: &str, request_timeout: Duration) -> Result<Self, String> {
        let provider = Provider::<Http>::try_from(url).map_err(|e| e.to_string())?;
        Ok(Self {
            provider: provider.interval(Duration::from_millis(500)),
            request_timeout,
        })
    }

    async fn call<T, F>(&self, method: &str, fut: F) -> RpcResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let failure = map_provider_error(e);
                debug!("{} failed: {}", method, failure);
                Err(failure)
            }
            Err(_) => Err(RpcFailure::Transport(format!(
                "{} timed out after {:?}",
                method, self.request_timeout
            ))),
        }
    }
}

fn map_provider_error(err: ProviderError) -> RpcFailure {
    match RpcError::as_error_response(&err) {
        Some(response) => RpcFailure::Rejected {
            code: response.code,
            message: response.message.clone(),
        },
        None => RpcFailure::Transport(err.to_string()),
    }
}

#[async_trait]
impl ChainRpc for HttpRpc {
    async fn chain_id(&self) -> RpcResult<u64> {
        let id = self.call("eth_chainId", self.provider.get_chainid()).await?;
        Ok(id.as_u64())
    }

    async fn block_number(&self) -> RpcResult<u64> {
        let block = self
            .call("eth_blockNumber", self.provider.get_block_number())
            .await?;
        Ok(block.as_u64())
    }

    async fn balance(&self, address: Address) -> RpcResult<U256> {
        self.call("eth_getBalance", self.provider.get_balance(address, None))
            .await
    }

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> RpcResult<u64> {
        let block = match tag {
            NonceTag::Latest => BlockNumber::Latest,
            NonceTag::Pending => BlockNumber::Pending,
        };
        let count = self
            .call(
                "eth_getTransactionCount",
                self.provider
                    .get_transaction_count(address, Some(block.into())),
            )
            .await?;
        Ok(count.as_u64())
    }

    async fn gas_price(&self) -> RpcResult<U256> {
        self.call("eth_gasPrice", self.provider.get_gas_price()).await
    }

    async fn max_priority_fee(&self) -> RpcResult<U256> {
        self.call(
            "eth_maxPriorityFeePerGas",
            self.provider
                .request::<_, U256>("eth_maxPriorityFeePerGas", ()),
        )
        .await
    }

    async fn latest_base_fee(&self) -> RpcResult<Option<U256>> {
        let block = self
            .call(
                "eth_getBlockByNumber",
                self.provider.get_block(BlockNumber::Latest),
            )
            .await?;
        Ok(block.and_then(|b| b.base_fee_per_gas))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RpcResult<U256> {
        self.call("eth_estimateGas", self.provider.estimate_gas(tx, None))
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<H256> {
        let fut = async {
            let pending = self.provider.send_raw_transaction(raw).await?;
            Ok::<H256, ProviderError>(pending.tx_hash())
        };
        self.call("eth_sendRawTransaction", fut).await
    }

    async fn transaction_receipt(&self, hash: H256) -> RpcResult<Option<Receipt>> {
        let receipt = self
            .call(
                "eth_getTransactionReceipt",
                self.provider.get_transaction_receipt(hash),
            )
            .await?;
        Ok(receipt.map(Receipt::from))
    }

    async fn transaction_exists(&self, hash: H256) -> RpcResult<bool> {
        let tx = self
            .call("eth_getTransaction", self.provider.get_transaction(hash))
            .await?;
        Ok(tx.is_some())
    }
}

/// Strip path and query from an RPC URL; they frequently carry API keys
pub fn redact_url(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };
    let host = rest.split(['/', '?']).next().unwrap_or(rest);
    match scheme {
        Some(scheme) => format!("{}://{}", scheme, host),
        None => host.to_string(),
    }
}
