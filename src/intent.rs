//! Logical on-chain actions handed to the driver

use crate::tx::{FeeEnvelope, FeeMode};

use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use uuid::Uuid;

/// What the transaction carries in its data field
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain native transfer, empty calldata
    Transfer,
    /// ABI call: 4-byte selector followed by encoded arguments
    Call { selector: [u8; 4], args: Vec<Token> },
    /// Pre-encoded calldata
    Raw(Bytes),
}

impl Payload {
    pub fn calldata(&self) -> Bytes {
        match self {
            Payload::Transfer => Bytes::default(),
            Payload::Call { selector, args } => {
                let mut data = selector.to_vec();
                data.extend(abi::encode(args));
                data.into()
            }
            Payload::Raw(data) => data.clone(),
        }
    }
}

/// A single logical on-chain action, independent of how many attempts it takes
#[derive(Debug, Clone)]
pub struct Intent {
    pub id: Uuid,
    /// Human label, e.g. the task name
    pub label: String,
    pub to: Address,
    pub payload: Payload,
    pub value: U256,
    /// Overrides the estimator's clamp band
    pub gas_limit_range: Option<(u64, u64)>,
    /// Gas limit used when estimation fails
    pub fallback_gas: u64,
    pub fee_mode: FeeMode,
    pub chain_id: u64,
    /// Idempotency hint (game id, upload root); only ever logged
    pub hint: Option<String>,
    /// Long-running call; waits longer for its receipt
    pub heavy: bool,
}

impl Intent {
    pub fn new(label: impl Into<String>, to: Address, payload: Payload, chain_id: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            to,
            payload,
            value: U256::zero(),
            gas_limit_range: None,
            fallback_gas: 150_000,
            fee_mode: FeeMode::Eip1559,
            chain_id,
            hint: None,
            heavy: false,
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_fee_mode(mut self, fee_mode: FeeMode) -> Self {
        self.fee_mode = fee_mode;
        self
    }

    pub fn with_fallback_gas(mut self, fallback_gas: u64) -> Self {
        self.fallback_gas = fallback_gas;
        self
    }

    pub fn with_gas_limit_range(mut self, range: Option<(u64, u64)>) -> Self {
        self.gas_limit_range = range;
        self
    }

    pub fn with_hint(mut self, hint: Option<String>) -> Self {
        self.hint = hint;
        self
    }

    pub fn heavy(mut self, heavy: bool) -> Self {
        self.heavy = heavy;
        self
    }

    pub fn calldata(&self) -> Bytes {
        self.payload.calldata()
    }

    /// Materialize an unsigned transaction for one attempt
    pub fn build_transaction(
        &self,
        from: Address,
        nonce: u64,
        fee: &FeeEnvelope,
        gas_limit: Option<u64>,
    ) -> TypedTransaction {
        let mut tx: TypedTransaction = match fee {
            FeeEnvelope::Legacy { gas_price } => TransactionRequest::new()
                .from(from)
                .to(self.to)
                .value(self.value)
                .data(self.calldata())
                .nonce(nonce)
                .gas_price(*gas_price)
                .chain_id(self.chain_id)
                .into(),
            FeeEnvelope::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(self.to)
                .value(self.value)
                .data(self.calldata())
                .nonce(nonce)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(self.chain_id)
                .into(),
        };
        if let Some(gas) = gas_limit {
            tx.set_gas(gas);
        }
        tx
    }

    /// Same action under a fresh id, for another wallet's slot
    pub fn reissued(&self) -> Intent {
        Intent {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }

    /// Short description for log lines
    pub fn describe(&self) -> String {
        match &self.hint {
            Some(hint) => format!("{} [{}]", self.label, hint),
            None => self.label.clone(),
        }
    }
}

/// 0-value transfer to self, used to unblock a stuck nonce
pub fn self_transfer(from: Address, chain_id: u64, fee_mode: FeeMode) -> Intent {
    Intent::new("nonce-replacement", from, Payload::Transfer, chain_id)
        .with_fee_mode(fee_mode)
        .with_fallback_gas(21_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_calldata_is_selector_and_args() {
        let payload = Payload::Call {
            selector: [0x0f, 0x59, 0xf8, 0x3a],
            args: vec![Token::Uint(U256::from(7u64))],
        };
        let data = payload.calldata();
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[..4], &[0x0f, 0x59, 0xf8, 0x3a]);
        assert_eq!(data[35], 7);
    }

    #[test]
    fn test_build_legacy_transaction() {
        let to = Address::repeat_byte(0x11);
        let from = Address::repeat_byte(0x22);
        let intent = Intent::new("gm", to, Payload::Transfer, 16601)
            .with_value(U256::from(5u64))
            .with_fee_mode(FeeMode::Legacy);
        let fee = FeeEnvelope::Legacy {
            gas_price: U256::from(1_000u64),
        };

        let tx = intent.build_transaction(from, 3, &fee, Some(21_000));
        assert!(matches!(tx, TypedTransaction::Legacy(_)));
        assert_eq!(tx.nonce(), Some(&U256::from(3u64)));
        assert_eq!(tx.gas(), Some(&U256::from(21_000u64)));
        assert_eq!(tx.gas_price(), Some(U256::from(1_000u64)));
        assert_eq!(tx.chain_id(), Some(U64::from(16601u64)));
        assert_eq!(tx.value(), Some(&U256::from(5u64)));
    }

    #[test]
    fn test_build_eip1559_transaction() {
        let intent = Intent::new("vote", Address::repeat_byte(1), Payload::Transfer, 1);
        let fee = FeeEnvelope::Eip1559 {
            max_fee_per_gas: U256::from(30u64),
            max_priority_fee_per_gas: U256::from(2u64),
        };
        let tx = intent.build_transaction(Address::repeat_byte(2), 0, &fee, None);
        match tx {
            TypedTransaction::Eip1559(inner) => {
                assert_eq!(inner.max_fee_per_gas, Some(U256::from(30u64)));
                assert_eq!(inner.max_priority_fee_per_gas, Some(U256::from(2u64)));
                assert!(inner.gas.is_none());
            }
            other => panic!("unexpected transaction {:?}", other),
        }
    }

    #[test]
    fn test_reissued_gets_new_id() {
        let intent = Intent::new("gm", Address::zero(), Payload::Transfer, 1).heavy(true);
        let again = intent.reissued();
        assert_ne!(again.id, intent.id);
        assert_eq!(again.label, intent.label);
        assert!(again.heavy);
    }

    #[test]
    fn test_describe_includes_hint() {
        let intent = Intent::new("upload", Address::zero(), Payload::Transfer, 1)
            .with_hint(Some("0xabc".into()));
        assert_eq!(intent.describe(), "upload [0xabc]");
    }
}
