//! Wallet book and per-wallet nonce bookkeeping

mod book;
mod nonce;

pub use book::{Wallet, WalletBook};
pub use nonce::{NonceCache, NonceView};
