//! Tron adapter over the TronGrid HTTP API
//!
//! Runs the same HashedTimelock contract as the EVM adapter. Transactions are
//! built by `triggersmartcontract`, signed locally with the secp256k1 key and
//! pushed through `broadcasttransaction`.

use crate::chain::htlc_abi::{self, GET_CONTRACT, NEW_CONTRACT, REFUND, WITHDRAW};
use crate::chain::rest::RestClient;
use crate::chain::{
    check_redeem, check_refund, check_spendable, registry_contract_id, ChainAdapter, ContractRef,
    ContractStatus, HtlcParams, TxObservation,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{ChainConfig, ChainKind};
use crate::error::{SwapError, SwapResult};
use crate::secret::{self, Secret};

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const ADDRESS_PREFIX: u8 = 0x41;

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    #[serde(default)]
    result: TriggerResult,
    transaction: Option<Value>,
    #[serde(default)]
    constant_result: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerResult {
    #[serde(default)]
    result: bool,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    result: bool,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TxInfo {
    id: Option<String>,
    #[serde(rename = "blockNumber")]
    block_number: Option<u64>,
    receipt: Option<TxReceipt>,
    result: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TxReceipt {
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NowBlock {
    block_header: BlockHeader,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    raw_data: BlockRawData,
}

#[derive(Debug, Deserialize)]
struct BlockRawData {
    #[serde(default)]
    number: u64,
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    data: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    transaction_id: String,
    #[serde(default)]
    result: HashMap<String, Value>,
}

pub struct TronAdapter {
    name: String,
    config: ChainConfig,
    api: RestClient,
    wallet: LocalWallet,
    owner: [u8; 21],
    contract: [u8; 21],
}

impl TronAdapter {
    pub fn new(name: &str, config: ChainConfig) -> SwapResult<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => std::env::var(var).ok().map(|key| ("tron-pro-api-key", key)),
            None => None,
        };
        let api = RestClient::new(name, &config.rpc_urls, api_key, Duration::from_secs(10))?;

        let key = std::env::var(&config.private_key_env).map_err(|_| {
            SwapError::Config(format!(
                "Signing key variable {} is not set for chain {}",
                config.private_key_env, name
            ))
        })?;
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| SwapError::Wallet(e.to_string()))?;

        let owner = prefixed(wallet.address());
        let contract = decode_address(&config.contract_address).ok_or_else(|| {
            SwapError::InvalidAddress {
                chain: name.to_string(),
                address: config.contract_address.clone(),
            }
        })?;

        Ok(Self {
            name: name.to_string(),
            config,
            api,
            wallet,
            owner,
            contract,
        })
    }

    fn parse_address(&self, address: &str) -> SwapResult<[u8; 21]> {
        decode_address(address).ok_or_else(|| SwapError::InvalidAddress {
            chain: self.name.clone(),
            address: address.to_string(),
        })
    }

    fn trigger_body(&self, selector: &str, args: &[Token], call_value: u64) -> Value {
        json!({
            "owner_address": hex::encode(self.owner),
            "contract_address": hex::encode(self.contract),
            "function_selector": selector,
            "parameter": hex::encode(htlc_abi::encode_args(args)),
            "fee_limit": self.config.fee_limit,
            "call_value": call_value,
            "visible": false,
        })
    }

    /// Build, sign and broadcast a contract call
    async fn send(&self, selector: &str, args: &[Token], call_value: u64) -> SwapResult<String> {
        let response: TriggerResponse = self
            .api
            .post_json(
                "/wallet/triggersmartcontract",
                &self.trigger_body(selector, args, call_value),
            )
            .await?;

        if !response.result.result {
            return Err(SwapError::Contract(format!(
                "{} rejected: {} {}",
                selector,
                response.result.code.unwrap_or_default(),
                decode_message(response.result.message.as_deref())
            )));
        }

        let mut transaction = response
            .transaction
            .ok_or_else(|| SwapError::Transaction("Node returned no transaction".to_string()))?;

        let tx_id = transaction["txID"]
            .as_str()
            .ok_or_else(|| SwapError::Transaction("Transaction has no txID".to_string()))?
            .to_string();
        let raw_data_hex = transaction["raw_data_hex"]
            .as_str()
            .ok_or_else(|| SwapError::Transaction("Transaction has no raw_data_hex".to_string()))?;

        // Never sign an id the node could have chosen independently of raw_data
        let raw = hex::decode(raw_data_hex)
            .map_err(|e| SwapError::Transaction(format!("Invalid raw_data_hex: {}", e)))?;
        let digest = secret::sha256(&raw);
        if hex::encode(digest) != tx_id.to_lowercase() {
            return Err(SwapError::Transaction(format!(
                "txID {} does not match raw_data",
                tx_id
            )));
        }

        let signature = self
            .wallet
            .sign_hash(H256::from(digest))
            .map_err(|e| SwapError::Wallet(e.to_string()))?;
        transaction["signature"] = json!([hex::encode(signature.to_vec())]);

        let broadcast: BroadcastResponse = self
            .api
            .post_json("/wallet/broadcasttransaction", &transaction)
            .await?;

        if !broadcast.result {
            let code = broadcast.code.unwrap_or_default();
            match code.as_str() {
                "DUP_TRANSACTION_ERROR" => {}
                "SERVER_BUSY" | "NOT_ENOUGH_EFFECTIVE_CONNECTION" => {
                    return Err(SwapError::connection(&self.name, code))
                }
                _ => {
                    return Err(SwapError::Transaction(format!(
                        "Broadcast failed: {} {}",
                        code,
                        decode_message(broadcast.message.as_deref())
                    )))
                }
            }
        }

        info!("Sent tx {} on chain {} ({})", tx_id, self.name, selector);
        Ok(tx_id)
    }

    async fn read_contract(&self, contract_id: [u8; 32]) -> SwapResult<htlc_abi::OnChainHtlc> {
        let response: TriggerResponse = self
            .api
            .post_json(
                "/wallet/triggerconstantcontract",
                &self.trigger_body(GET_CONTRACT, &htlc_abi::id_args(contract_id), 0),
            )
            .await?;

        let output = response
            .constant_result
            .first()
            .ok_or_else(|| SwapError::Contract("getContract returned nothing".to_string()))?;
        let bytes = hex::decode(output)
            .map_err(|e| SwapError::Contract(format!("Invalid constant_result: {}", e)))?;

        htlc_abi::decode_get_contract(&bytes)
    }

    /// Find the transaction that emitted `HTLCNew` through the events API
    async fn funding_tx(&self, contract_id: [u8; 32]) -> SwapResult<Option<String>> {
        let path = format!(
            "/v1/contracts/{}/events?event_name=HTLCNew&only_confirmed=false&limit=200",
            encode_address(&self.contract)
        );
        let page: Option<EventsPage> = self.api.get_json_opt(&path).await?;
        let wanted = hex::encode(contract_id);

        Ok(page.and_then(|page| {
            page.data
                .into_iter()
                .find(|event| {
                    event
                        .result
                        .get("contractId")
                        .and_then(Value::as_str)
                        .map(|id| id.trim_start_matches("0x").eq_ignore_ascii_case(&wanted))
                        .unwrap_or(false)
                })
                .map(|event| event.transaction_id)
        }))
    }
}

#[async_trait]
impl ChainAdapter for TronAdapter {
    fn chain(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Tron
    }

    fn create_htlc(&self, params: &HtlcParams) -> SwapResult<ContractRef> {
        derive_contract(&self.name, params)
    }

    async fn fund(&self, contract: &ContractRef, amount: u128) -> SwapResult<String> {
        if self.parse_address(&contract.params.sender)? != self.owner {
            return Err(SwapError::Wallet(format!(
                "Signer {} is not the HTLC sender {}",
                self.signer_address(),
                contract.params.sender
            )));
        }
        if amount != contract.params.amount {
            return Err(SwapError::Validation(format!(
                "Funding amount {} differs from committed amount {}",
                amount, contract.params.amount
            )));
        }
        let call_value = u64::try_from(amount)
            .map_err(|_| SwapError::Validation(format!("Amount {} exceeds sun range", amount)))?;

        let receiver = evm_address(&self.parse_address(&contract.params.receiver)?);
        self.send(
            NEW_CONTRACT,
            &htlc_abi::new_contract_args(receiver, &contract.params),
            call_value,
        )
        .await
    }

    async fn redeem(
        &self,
        contract: &ContractRef,
        secret: &Secret,
        recipient: &str,
    ) -> SwapResult<String> {
        check_redeem(contract, secret, SystemClock.now())?;
        let id = htlc_abi::parse_contract_id(&contract.id)?;
        check_spendable(&self.read_contract(id).await?.into_status(None), contract)?;

        debug!("Redeeming {} on chain {} for {}", contract.id, self.name, recipient);
        self.send(WITHDRAW, &htlc_abi::withdraw_args(id, secret), 0).await
    }

    async fn refund(&self, contract: &ContractRef, sender: &str) -> SwapResult<String> {
        let id = htlc_abi::parse_contract_id(&contract.id)?;
        check_spendable(&self.read_contract(id).await?.into_status(None), contract)?;
        check_refund(contract, SystemClock.now())?;

        debug!("Refunding {} on chain {} to {}", contract.id, self.name, sender);
        self.send(REFUND, &htlc_abi::id_args(id), 0).await
    }

    async fn get_status(&self, contract: &ContractRef) -> SwapResult<ContractStatus> {
        let id = htlc_abi::parse_contract_id(&contract.id)?;
        let on_chain = self.read_contract(id).await?;

        let funding_tx = if on_chain.exists() {
            self.funding_tx(id).await?
        } else {
            None
        };

        Ok(on_chain.into_status(funding_tx))
    }

    fn validate_address(&self, address: &str) -> bool {
        decode_address(address).is_some()
    }

    fn required_confirmations(&self) -> u64 {
        self.config.required_confirmations()
    }

    async fn block_height(&self) -> SwapResult<u64> {
        let block: NowBlock = self
            .api
            .post_json("/wallet/getnowblock", &json!({}))
            .await?;
        Ok(block.block_header.raw_data.number)
    }

    async fn transaction(&self, tx_hash: &str) -> SwapResult<TxObservation> {
        let info: TxInfo = self
            .api
            .post_json("/wallet/gettransactioninfobyid", &json!({ "value": tx_hash }))
            .await?;

        if info.id.is_some() {
            return Ok(tx_info_observation(&info));
        }

        // Info is empty until the transaction is in a block
        let tx: Value = self
            .api
            .post_json("/wallet/gettransactionbyid", &json!({ "value": tx_hash }))
            .await?;
        Ok(if tx.get("txID").is_some() {
            TxObservation::Pending
        } else {
            TxObservation::NotFound
        })
    }

    fn signer_address(&self) -> String {
        encode_address(&self.owner)
    }
}

fn tx_info_observation(info: &TxInfo) -> TxObservation {
    let failed = info.result.as_deref() == Some("FAILED")
        || info
            .receipt
            .as_ref()
            .and_then(|r| r.result.as_deref())
            .map(|r| r != "SUCCESS")
            .unwrap_or(false);

    match (failed, info.block_number) {
        (true, _) => TxObservation::Failed,
        (false, Some(block_height)) => TxObservation::Included { block_height },
        (false, None) => TxObservation::Pending,
    }
}

/// TronGrid returns error messages hex encoded
fn decode_message(message: Option<&str>) -> String {
    match message {
        Some(m) => hex::decode(m)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| m.to_string()),
        None => String::new(),
    }
}

fn prefixed(address: Address) -> [u8; 21] {
    let mut out = [0u8; 21];
    out[0] = ADDRESS_PREFIX;
    out[1..].copy_from_slice(address.as_bytes());
    out
}

fn evm_address(address: &[u8; 21]) -> Address {
    Address::from_slice(&address[1..])
}

/// Base58check `T...` address to its 21-byte form
pub fn decode_address(address: &str) -> Option<[u8; 21]> {
    let bytes = ::bitcoin::base58::decode_check(address).ok()?;
    let bytes: [u8; 21] = bytes.try_into().ok()?;
    (bytes[0] == ADDRESS_PREFIX).then_some(bytes)
}

pub fn encode_address(address: &[u8; 21]) -> String {
    ::bitcoin::base58::encode_check(address)
}

pub fn derive_contract(chain: &str, params: &HtlcParams) -> SwapResult<ContractRef> {
    let invalid = |address: &str| SwapError::InvalidAddress {
        chain: chain.to_string(),
        address: address.to_string(),
    };
    let sender = decode_address(&params.sender).ok_or_else(|| invalid(&params.sender))?;
    let receiver = decode_address(&params.receiver).ok_or_else(|| invalid(&params.receiver))?;

    let id = registry_contract_id(
        evm_address(&sender).as_fixed_bytes(),
        evm_address(&receiver).as_fixed_bytes(),
        params.amount,
        &params.hash_lock,
        params.time_lock,
    );

    Ok(ContractRef {
        chain: chain.to_string(),
        id: format!("0x{}", hex::encode(id)),
        params: params.clone(),
        locator: None,
    })
}
