//! Ordered rotation of signing identities

use super::nonce::{NonceCache, NonceView};
use crate::chain::{ChainRpc, NonceTag, RpcResult};
use crate::error::{DriverError, DriverResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use tokio::time::Instant;
use tracing::info;

/// One signing identity
///
/// The key never leaves this struct; `Debug` prints index and address only.
pub struct Wallet {
    index: usize,
    signer: LocalWallet,
    address: Address,
    nonce: NonceCache,
    last_used: Option<Instant>,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("index", &self.index)
            .field("address", &self.address)
            .finish()
    }
}

impl Wallet {
    pub fn from_key(index: usize, key: &str) -> DriverResult<Self> {
        let signer = key
            .parse::<LocalWallet>()
            .map_err(|_| {
                DriverError::Wallet(format!("key #{} is not a valid secp256k1 key", index + 1))
            })?;
        let address = signer.address();

        Ok(Self {
            index,
            signer,
            address,
            nonce: NonceCache::new(),
            last_used: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    pub fn nonce_cache(&self) -> &NonceCache {
        &self.nonce
    }

    pub fn nonce_cache_mut(&mut self) -> &mut NonceCache {
        &mut self.nonce
    }

    /// Read the confirmed and pending counts and fold them into the cache
    pub async fn nonce_for(&mut self, client: &dyn ChainRpc) -> RpcResult<NonceView> {
        let confirmed = client
            .transaction_count(self.address, NonceTag::Latest)
            .await?;
        let pending = client
            .transaction_count(self.address, NonceTag::Pending)
            .await?;
        Ok(self.nonce.sync(confirmed, pending))
    }

    /// Sign locally, returning the raw envelope and its hash
    pub fn sign(&mut self, tx: &TypedTransaction) -> DriverResult<(Bytes, H256)> {
        let signature = self
            .signer
            .sign_transaction_sync(tx)
            .map_err(|e| {
                DriverError::Wallet(format!("wallet #{} failed to sign: {}", self.index, e))
            })?;
        self.last_used = Some(Instant::now());
        Ok((tx.rlp_signed(&signature), tx.hash(&signature)))
    }
}

/// Ordered wallets plus the rotation cursor
#[derive(Debug)]
pub struct WalletBook {
    wallets: Vec<Wallet>,
    cursor: usize,
}

impl WalletBook {
    /// Build the book from normalized private keys
    pub fn from_keys(keys: &[String]) -> DriverResult<Self> {
        if keys.is_empty() {
            return Err(DriverError::NoWallets);
        }

        let wallets = keys
            .iter()
            .enumerate()
            .map(|(index, key)| Wallet::from_key(index, key))
            .collect::<DriverResult<Vec<_>>>()?;

        info!("Loaded {} wallet(s)", wallets.len());
        for wallet in &wallets {
            info!("Wallet #{}: {:?}", wallet.index, wallet.address);
        }

        Ok(Self { wallets, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn current(&self) -> &Wallet {
        &self.wallets[self.cursor]
    }

    pub fn current_mut(&mut self) -> &mut Wallet {
        &mut self.wallets[self.cursor]
    }

    pub fn wallets(&self) -> &[Wallet] {
        &self.wallets
    }

    /// Move to the next wallet; true when a full cycle just completed
    pub fn advance(&mut self) -> bool {
        let previous = self.cursor;
        self.cursor = (self.cursor + 1) % self.wallets.len();
        self.wallets.len() == 1 || (self.cursor == 0 && previous != 0)
    }
}
