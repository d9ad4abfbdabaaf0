//! Intent source built from `[[tasks]]` configuration entries
//!
//! Each task is one contract call (or plain transfer) repeated `per_wallet`
//! times in every wallet's slot. Call arguments may use two placeholders:
//! `{wallet}` expands to the current wallet address and `{random32}` to a
//! fresh random 32-byte hex value, which also becomes the intent's hint.

use super::IntentSource;
use crate::config::TaskConfig;
use crate::error::{DriverError, DriverResult};
use crate::intent::{Intent, Payload};
use crate::tx::FeeMode;

use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{AbiParser, Function, Token};
use ethers::prelude::*;
use std::collections::VecDeque;
use tracing::debug;

const WALLET_PLACEHOLDER: &str = "{wallet}";
const RANDOM_PLACEHOLDER: &str = "{random32}";

#[derive(Debug, Clone)]
enum Template {
    Transfer,
    Call { function: Function, args: Vec<String> },
    Raw(Bytes),
}

#[derive(Debug, Clone)]
struct Task {
    name: String,
    to: Address,
    template: Template,
    value: U256,
    fallback_gas: u64,
    gas_limit_band: Option<(u64, u64)>,
    per_wallet: u32,
    heavy: bool,
}

/// Serves configured tasks for each wallet slot
pub struct TaskSource {
    chain_id: u64,
    fee_mode: FeeMode,
    tasks: Vec<Task>,
    queue: VecDeque<usize>,
}

impl TaskSource {
    /// Parse and validate every task up front
    pub fn from_config(
        configs: &[TaskConfig],
        chain_id: u64,
        fee_mode: FeeMode,
    ) -> DriverResult<Self> {
        let tasks = configs
            .iter()
            .map(parse_task)
            .collect::<DriverResult<Vec<_>>>()?;

        Ok(Self {
            chain_id,
            fee_mode,
            tasks,
            queue: VecDeque::new(),
        })
    }

    fn render(&self, task: &Task, wallet: Address) -> DriverResult<Intent> {
        let mut hint = None;

        let payload = match &task.template {
            Template::Transfer => Payload::Transfer,
            Template::Raw(data) => Payload::Raw(data.clone()),
            Template::Call { function, args } => {
                let mut expanded = Vec::with_capacity(args.len());
                for arg in args {
                    let mut value = arg.replace(WALLET_PLACEHOLDER, &format!("{:?}", wallet));
                    if value.contains(RANDOM_PLACEHOLDER) {
                        let random = format!("0x{}", hex::encode(rand::random::<[u8; 32]>()));
                        value = value.replace(RANDOM_PLACEHOLDER, &random);
                        hint = Some(random);
                    }
                    expanded.push(value);
                }
                Payload::Call {
                    selector: function.short_signature(),
                    args: tokenize(&task.name, function, &expanded)?,
                }
            }
        };

        let intent = Intent::new(task.name.clone(), task.to, payload, self.chain_id)
            .with_value(task.value)
            .with_fee_mode(self.fee_mode)
            .with_fallback_gas(task.fallback_gas)
            .with_gas_limit_range(task.gas_limit_band)
            .with_hint(hint)
            .heavy(task.heavy);

        debug!("Built intent {} ({})", intent.describe(), intent.id);
        Ok(intent)
    }
}

impl IntentSource for TaskSource {
    fn begin_slot(&mut self, _wallet: Address) {
        self.queue = self
            .tasks
            .iter()
            .enumerate()
            .flat_map(|(i, task)| std::iter::repeat(i).take(task.per_wallet as usize))
            .collect();
    }

    fn next_intent(&mut self, wallet: Address) -> DriverResult<Option<Intent>> {
        match self.queue.pop_front() {
            Some(index) => self.render(&self.tasks[index], wallet).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_task(config: &TaskConfig) -> DriverResult<Task> {
    let invalid = |what: String| DriverError::Config(format!("task {}: {}", config.name, what));

    let to = config
        .contract
        .parse::<Address>()
        .map_err(|_| invalid(format!("invalid contract address {}", config.contract)))?;

    let value = U256::from_dec_str(&config.value_wei)
        .map_err(|_| invalid(format!("invalid value_wei {}", config.value_wei)))?;

    let template = match (&config.function, &config.calldata) {
        (Some(_), Some(_)) => return Err(invalid("sets both function and calldata".into())),
        (Some(signature), None) => {
            let function = AbiParser::default()
                .parse_function(signature)
                .map_err(|e| invalid(format!("cannot parse {:?}: {}", signature, e)))?;
            if function.inputs.len() != config.args.len() {
                return Err(invalid(format!(
                    "{} takes {} argument(s), {} given",
                    function.name,
                    function.inputs.len(),
                    config.args.len()
                )));
            }

            // Tokenize once with sample placeholder values to fail fast on bad args
            let sample: Vec<String> = config
                .args
                .iter()
                .map(|a| {
                    a.replace(WALLET_PLACEHOLDER, &format!("{:?}", Address::zero()))
                        .replace(RANDOM_PLACEHOLDER, &format!("{:?}", H256::zero()))
                })
                .collect();
            tokenize(&config.name, &function, &sample)?;

            Template::Call {
                function,
                args: config.args.clone(),
            }
        }
        (None, Some(calldata)) => {
            let data = hex::decode(calldata.trim_start_matches("0x"))
                .map_err(|e| invalid(format!("invalid calldata: {}", e)))?;
            Template::Raw(data.into())
        }
        (None, None) => Template::Transfer,
    };

    Ok(Task {
        name: config.name.clone(),
        to,
        template,
        value,
        fallback_gas: config.fallback_gas,
        gas_limit_band: config.gas_limit_band,
        per_wallet: config.per_wallet,
        heavy: config.heavy,
    })
}

fn tokenize(task: &str, function: &Function, args: &[String]) -> DriverResult<Vec<Token>> {
    function
        .inputs
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            LenientTokenizer::tokenize(&param.kind, arg).map_err(|e| {
                DriverError::Config(format!(
                    "task {}: argument {} ({}) rejected: {}",
                    task, param.name, param.kind, e
                ))
            })
        })
        .collect()
}
