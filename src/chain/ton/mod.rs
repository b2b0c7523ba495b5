//! TON adapter over toncenter
//!
//! HTLCs live in a registry contract. Calls are internal messages carried by
//! a wallet v4r2 external message signed with the wallet's ed25519 key. State
//! is read with the `get_htlc` get-method, which only reflects applied
//! (final) blocks, so the adapter reports no separate funding transaction.

pub mod address;
pub mod cell;

pub use address::TonAddress;

use crate::chain::rest::RestClient;
use crate::chain::{
    check_redeem, check_refund, check_spendable, registry_contract_id, ChainAdapter, ContractRef,
    ContractStatus, HtlcParams, TxObservation,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{ChainConfig, ChainKind};
use crate::error::{SwapError, SwapResult};
use crate::secret::{HashLock, Secret, SECRET_LEN};
use cell::{to_boc, Cell, CellBuilder};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const OP_CREATE: u32 = 0x1f3a_2c01;
pub const OP_REDEEM: u32 = 0x1f3a_2c02;
pub const OP_REFUND: u32 = 0x1f3a_2c03;

/// Attached to every registry call to pay for its execution
const GAS_RESERVE: u128 = 50_000_000;
const DEFAULT_SUBWALLET_ID: u32 = 698_983_191;
const MESSAGE_TTL_SECS: u64 = 60;
/// Pay fees separately, ignore action errors
const SEND_MODE: u8 = 3;

#[derive(Debug, Deserialize)]
struct V2Response<T> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetMethodResult {
    exit_code: i32,
    #[serde(default)]
    stack: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SendResult {
    hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionsPage {
    #[serde(default)]
    transactions: Vec<IndexedTransaction>,
}

#[derive(Debug, Deserialize)]
struct IndexedTransaction {
    mc_block_seqno: Option<u64>,
    #[serde(default)]
    description: TransactionDescription,
}

#[derive(Debug, Default, Deserialize)]
struct TransactionDescription {
    #[serde(default)]
    aborted: bool,
    compute_ph: Option<ComputePhase>,
}

#[derive(Debug, Deserialize)]
struct ComputePhase {
    success: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct MasterchainInfo {
    last: BlockRef,
}

#[derive(Debug, Deserialize)]
struct BlockRef {
    seqno: u64,
}

pub struct TonAdapter {
    name: String,
    config: ChainConfig,
    v2: RestClient,
    v3: RestClient,
    key: SigningKey,
    wallet: TonAddress,
    registry: TonAddress,
    subwallet_id: u32,
    testnet: bool,
    /// Seqno of the last external message sent
    last_seqno: Mutex<Option<u32>>,
}

impl TonAdapter {
    pub fn new(name: &str, config: ChainConfig) -> SwapResult<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => std::env::var(var).ok().map(|key| ("x-api-key", key)),
            None => None,
        };
        let v2 = RestClient::new(name, &config.rpc_urls, api_key.clone(), Duration::from_secs(10))?;
        let index_url = config
            .index_url
            .clone()
            .ok_or_else(|| SwapError::Config(format!("TON chain {} needs an index_url", name)))?;
        let v3 = RestClient::new(name, &[index_url], api_key, Duration::from_secs(10))?;

        let seed = std::env::var(&config.private_key_env).map_err(|_| {
            SwapError::Config(format!(
                "Signing key variable {} is not set for chain {}",
                config.private_key_env, name
            ))
        })?;
        let key = signing_key(seed.trim())?;

        let invalid = |address: &str| SwapError::InvalidAddress {
            chain: name.to_string(),
            address: address.to_string(),
        };
        let wallet_address = config.wallet_address.clone().unwrap_or_default();
        let wallet = TonAddress::parse(&wallet_address).ok_or_else(|| invalid(&wallet_address))?;
        let registry = TonAddress::parse(&config.contract_address)
            .ok_or_else(|| invalid(&config.contract_address))?;

        Ok(Self {
            name: name.to_string(),
            subwallet_id: config.subwallet_id.unwrap_or(DEFAULT_SUBWALLET_ID),
            testnet: config.network.as_deref() == Some("testnet"),
            config,
            v2,
            v3,
            key,
            wallet,
            registry,
            last_seqno: Mutex::new(None),
        })
    }

    fn parse_address(&self, address: &str) -> SwapResult<TonAddress> {
        TonAddress::parse(address).ok_or_else(|| SwapError::InvalidAddress {
            chain: self.name.clone(),
            address: address.to_string(),
        })
    }

    async fn v2_post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> SwapResult<T> {
        let response: V2Response<T> = self.v2.post_json(path, body).await?;
        match (response.ok, response.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(SwapError::connection(
                &self.name,
                response.error.unwrap_or_else(|| format!("{} failed", path)),
            )),
        }
    }

    async fn run_get_method(
        &self,
        address: &TonAddress,
        method: &str,
        stack: Value,
    ) -> SwapResult<Vec<Value>> {
        let result: GetMethodResult = self
            .v2_post(
                "/runGetMethod",
                &json!({ "address": address.to_raw(), "method": method, "stack": stack }),
            )
            .await?;

        if result.exit_code != 0 {
            return Err(SwapError::Contract(format!(
                "{} exited with code {}",
                method, result.exit_code
            )));
        }
        Ok(result.stack)
    }

    async fn seqno(&self) -> SwapResult<u32> {
        let stack = self.run_get_method(&self.wallet, "seqno", json!([])).await?;
        let seqno = stack_num(&stack, 0)
            .ok_or_else(|| SwapError::Contract("seqno returned no number".to_string()))?;
        u32::try_from(bytes_to_u128(&seqno.1))
            .map_err(|_| SwapError::Contract("seqno out of range".to_string()))
    }

    /// Send one internal message through the wallet
    async fn send(&self, value: u128, body: Arc<Cell>) -> SwapResult<String> {
        let mut last = self.last_seqno.lock().await;

        let seqno = self.seqno().await?;
        if let Some(prev) = *last {
            if seqno <= prev {
                return Err(SwapError::connection(
                    &self.name,
                    format!("wallet seqno {} still pending", prev),
                ));
            }
        }

        let internal = internal_message(&self.registry, value, body)?;
        let valid_until = SystemClock.now() + MESSAGE_TTL_SECS;
        let external = self.external_message(seqno, valid_until, internal)?;

        let boc = STANDARD.encode(to_boc(&external));
        let result: SendResult = self
            .v2_post("/sendBocReturnHash", &json!({ "boc": boc }))
            .await?;
        *last = Some(seqno);

        let hash = result
            .hash
            .and_then(|h| STANDARD.decode(h).ok())
            .map(hex::encode)
            .unwrap_or_else(|| hex::encode(external.hash()));

        info!("Sent message {} on chain {} (seqno {})", hash, self.name, seqno);
        Ok(hash)
    }

    fn external_message(
        &self,
        seqno: u32,
        valid_until: u64,
        internal: Arc<Cell>,
    ) -> SwapResult<Arc<Cell>> {
        let mut signing = CellBuilder::new();
        signing
            .store_uint(self.subwallet_id as u128, 32)?
            .store_uint(valid_until as u128, 32)?
            .store_uint(seqno as u128, 32)?
            .store_uint(0, 8)?
            .store_uint(SEND_MODE as u128, 8)?
            .store_ref(internal.clone())?;
        let signature = self.key.sign(&signing.build().hash());

        let body = CellBuilder::new()
            .store_bytes(&signature.to_bytes())?
            .store_uint(self.subwallet_id as u128, 32)?
            .store_uint(valid_until as u128, 32)?
            .store_uint(seqno as u128, 32)?
            .store_uint(0, 8)?
            .store_uint(SEND_MODE as u128, 8)?
            .store_ref(internal)?
            .build();

        Ok(CellBuilder::new()
            // ext_in_msg_info$10 src:addr_none dest import_fee:0
            .store_uint(0b10, 2)?
            .store_address_none()?
            .store_address(&self.wallet)?
            .store_coins(0)?
            // no state init, body by reference
            .store_bit(false)?
            .store_bit(true)?
            .store_ref(body)?
            .build())
    }
}

#[async_trait]
impl ChainAdapter for TonAdapter {
    fn chain(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Ton
    }

    fn create_htlc(&self, params: &HtlcParams) -> SwapResult<ContractRef> {
        derive_contract(&self.name, params)
    }

    async fn fund(&self, contract: &ContractRef, amount: u128) -> SwapResult<String> {
        if self.parse_address(&contract.params.sender)? != self.wallet {
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

        let receiver = self.parse_address(&contract.params.receiver)?;
        let body = create_body(
            SystemClock.now(),
            &contract.params.hash_lock,
            contract.params.time_lock,
            &receiver,
            amount,
        )?;
        self.send(amount + GAS_RESERVE, body).await
    }

    async fn redeem(
        &self,
        contract: &ContractRef,
        secret: &Secret,
        recipient: &str,
    ) -> SwapResult<String> {
        check_redeem(contract, secret, SystemClock.now())?;
        check_spendable(&self.get_status(contract).await?, contract)?;

        let id = contract_id_bytes(&contract.id)?;
        let body = CellBuilder::new()
            .store_uint(OP_REDEEM as u128, 32)?
            .store_uint(SystemClock.now() as u128, 64)?
            .store_bytes(&id)?
            .store_bytes(secret.as_bytes())?
            .build();

        debug!("Redeeming {} on chain {} for {}", contract.id, self.name, recipient);
        self.send(GAS_RESERVE, body).await
    }

    async fn refund(&self, contract: &ContractRef, sender: &str) -> SwapResult<String> {
        check_spendable(&self.get_status(contract).await?, contract)?;
        check_refund(contract, SystemClock.now())?;

        let id = contract_id_bytes(&contract.id)?;
        let body = CellBuilder::new()
            .store_uint(OP_REFUND as u128, 32)?
            .store_uint(SystemClock.now() as u128, 64)?
            .store_bytes(&id)?
            .build();

        debug!("Refunding {} on chain {} to {}", contract.id, self.name, sender);
        self.send(GAS_RESERVE, body).await
    }

    async fn get_status(&self, contract: &ContractRef) -> SwapResult<ContractStatus> {
        let stack = self
            .run_get_method(
                &self.registry,
                "get_htlc",
                json!([["num", format!("0x{}", contract.id.trim_start_matches("0x"))]]),
            )
            .await?;
        parse_htlc_stack(&stack)
    }

    fn validate_address(&self, address: &str) -> bool {
        TonAddress::parse(address).is_some()
    }

    fn required_confirmations(&self) -> u64 {
        self.config.required_confirmations()
    }

    async fn block_height(&self) -> SwapResult<u64> {
        let info: MasterchainInfo = self.v3.get_json("/masterchainInfo").await?;
        Ok(info.last.seqno)
    }

    async fn transaction(&self, tx_hash: &str) -> SwapResult<TxObservation> {
        let page: Option<TransactionsPage> = self
            .v3
            .get_json_opt(&format!(
                "/transactionsByMessage?msg_hash={}&direction=in",
                tx_hash
            ))
            .await?;

        let Some(tx) = page.and_then(|p| p.transactions.into_iter().next()) else {
            return Ok(TxObservation::NotFound);
        };

        let computed = tx
            .description
            .compute_ph
            .as_ref()
            .and_then(|c| c.success)
            .unwrap_or(true);
        if tx.description.aborted || !computed {
            return Ok(TxObservation::Failed);
        }

        Ok(match tx.mc_block_seqno {
            Some(block_height) => TxObservation::Included { block_height },
            None => TxObservation::Pending,
        })
    }

    fn signer_address(&self) -> String {
        self.wallet.to_friendly(true, self.testnet)
    }
}

fn signing_key(seed: &str) -> SwapResult<SigningKey> {
    let bytes = hex::decode(seed.trim_start_matches("0x"))
        .map_err(|e| SwapError::Wallet(format!("Invalid ed25519 key hex: {}", e)))?;
    // Accept a bare seed or a 64-byte seed||public key
    let seed: [u8; 32] = bytes
        .get(..32)
        .and_then(|s| s.try_into().ok())
        .filter(|_| bytes.len() == 32 || bytes.len() == 64)
        .ok_or_else(|| SwapError::Wallet("ed25519 key must be 32 or 64 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&seed))
}

fn internal_message(dest: &TonAddress, value: u128, body: Arc<Cell>) -> SwapResult<Arc<Cell>> {
    Ok(CellBuilder::new()
        // int_msg_info$0 ihr_disabled bounce bounced
        .store_bit(false)?
        .store_bit(true)?
        .store_bit(true)?
        .store_bit(false)?
        .store_address_none()?
        .store_address(dest)?
        .store_coins(value)?
        // no extra currencies, ihr_fee, fwd_fee, created_lt, created_at
        .store_bit(false)?
        .store_coins(0)?
        .store_coins(0)?
        .store_uint(0, 64)?
        .store_uint(0, 32)?
        // no state init, body by reference
        .store_bit(false)?
        .store_bit(true)?
        .store_ref(body)?
        .build())
}

fn create_body(
    query_id: u64,
    hash_lock: &HashLock,
    time_lock: u64,
    receiver: &TonAddress,
    amount: u128,
) -> SwapResult<Arc<Cell>> {
    Ok(CellBuilder::new()
        .store_uint(OP_CREATE as u128, 32)?
        .store_uint(query_id as u128, 64)?
        .store_bytes(hash_lock.as_bytes())?
        .store_uint(time_lock as u128, 64)?
        .store_address(receiver)?
        .store_coins(amount)?
        .build())
}

fn contract_id_bytes(id: &str) -> SwapResult<[u8; 32]> {
    hex::decode(id.trim_start_matches("0x"))
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SwapError::Validation(format!("Invalid contract id {}", id)))
}

pub fn derive_contract(chain: &str, params: &HtlcParams) -> SwapResult<ContractRef> {
    let parse = |address: &str| {
        TonAddress::parse(address).ok_or_else(|| SwapError::InvalidAddress {
            chain: chain.to_string(),
            address: address.to_string(),
        })
    };
    let sender = parse(&params.sender)?;
    let receiver = parse(&params.receiver)?;

    let id = registry_contract_id(
        &sender.hash,
        &receiver.hash,
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

/// `["num", "0x.."]` entry at `index` as (negative, big-endian magnitude)
fn stack_num(stack: &[Value], index: usize) -> Option<(bool, Vec<u8>)> {
    let entry = stack.get(index)?.as_array()?;
    if entry.first()?.as_str()? != "num" {
        return None;
    }
    let raw = entry.get(1)?.as_str()?;
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let digits = digits.trim_start_matches("0x");
    let padded = if digits.len() % 2 == 1 {
        format!("0{}", digits)
    } else {
        digits.to_string()
    };
    Some((negative, hex::decode(padded).ok()?))
}

fn bytes_to_u128(bytes: &[u8]) -> u128 {
    bytes
        .iter()
        .rev()
        .take(16)
        .rev()
        .fold(0u128, |acc, b| (acc << 8) | *b as u128)
}

fn flag(stack: &[Value], index: usize) -> SwapResult<bool> {
    stack_num(stack, index)
        .map(|(_, bytes)| bytes.iter().any(|b| *b != 0))
        .ok_or_else(|| SwapError::Contract(format!("get_htlc stack entry {} missing", index)))
}

/// `get_htlc` returns `(exists, redeemed, refunded, secret)`
fn parse_htlc_stack(stack: &[Value]) -> SwapResult<ContractStatus> {
    let exists = flag(stack, 0)?;
    let redeemed = flag(stack, 1)?;
    let refunded = flag(stack, 2)?;

    let revealed_secret = match stack_num(stack, 3) {
        Some((_, bytes)) if redeemed && bytes.iter().any(|b| *b != 0) => {
            if bytes.len() > SECRET_LEN {
                return Err(SwapError::InvalidSecretLength(bytes.len()));
            }
            let mut secret = [0u8; SECRET_LEN];
            secret[SECRET_LEN - bytes.len()..].copy_from_slice(&bytes);
            Some(Secret::from_bytes(secret))
        }
        _ => None,
    };

    Ok(ContractStatus {
        exists,
        redeemed,
        refunded,
        revealed_secret,
        funding_tx: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::{generate_secret, hash};
    use ed25519_dalek::Verifier;

    fn addr(byte: u8) -> TonAddress {
        TonAddress {
            workchain: 0,
            hash: [byte; 32],
        }
    }

    #[test]
    fn test_contract_id_accepts_both_address_forms() {
        let params = HtlcParams {
            hash_lock: HashLock::from_bytes([4; 32]),
            time_lock: 1_700_000_000,
            sender: addr(1).to_raw(),
            receiver: addr(2).to_friendly(true, false),
            amount: 2_000_000_000,
            chain: "ton".into(),
        };
        let a = derive_contract("ton", &params).unwrap();

        let mut swapped = params.clone();
        swapped.sender = addr(1).to_friendly(false, true);
        swapped.receiver = addr(2).to_raw();
        let b = derive_contract("ton", &swapped).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_htlc_stack_reveals_secret() {
        let secret = generate_secret();
        let stack = vec![
            json!(["num", "-0x1"]),
            json!(["num", "-0x1"]),
            json!(["num", "0x0"]),
            json!(["num", format!("0x{}", secret.to_hex())]),
        ];
        let status = parse_htlc_stack(&stack).unwrap();
        assert!(status.exists && status.redeemed && !status.refunded);
        assert_eq!(status.revealed_secret.map(|s| hash(&s)), Some(hash(&secret)));
    }

    #[test]
    fn test_secret_with_leading_zero_bytes() {
        let mut bytes = [0u8; 32];
        bytes[31] = 0x07;
        let stack = vec![
            json!(["num", "-0x1"]),
            json!(["num", "-0x1"]),
            json!(["num", "0x0"]),
            json!(["num", "0x7"]),
        ];
        let status = parse_htlc_stack(&stack).unwrap();
        assert_eq!(status.revealed_secret, Some(Secret::from_bytes(bytes)));
    }

    #[test]
    fn test_unknown_htlc() {
        let stack = vec![
            json!(["num", "0x0"]),
            json!(["num", "0x0"]),
            json!(["num", "0x0"]),
            json!(["num", "0x0"]),
        ];
        let status = parse_htlc_stack(&stack).unwrap();
        assert!(!status.exists);
        assert!(parse_htlc_stack(&stack[..2]).is_err());
    }

    #[test]
    fn test_create_body_layout() {
        let lock = HashLock::from_bytes([9; 32]);
        let body = create_body(1, &lock, 1_700_000_000, &addr(3), 5).unwrap();
        // op + query_id + hash + time_lock + address + coins(5)
        assert_eq!(body.bit_len(), 32 + 64 + 256 + 64 + 267 + 12);
    }

    #[test]
    fn test_wallet_signature_verifies() {
        let key = signing_key(&"11".repeat(32)).unwrap();
        let internal = internal_message(&addr(5), 1, Arc::new(Cell::empty())).unwrap();

        let mut signing = CellBuilder::new();
        signing
            .store_uint(DEFAULT_SUBWALLET_ID as u128, 32)
            .unwrap()
            .store_uint(100, 32)
            .unwrap()
            .store_uint(3, 32)
            .unwrap()
            .store_uint(0, 8)
            .unwrap()
            .store_uint(SEND_MODE as u128, 8)
            .unwrap()
            .store_ref(internal)
            .unwrap();
        let digest = signing.build().hash();
        let signature = key.sign(&digest);
        assert!(key.verifying_key().verify(&digest, &signature).is_ok());
    }

    #[test]
    fn test_signing_key_lengths() {
        assert!(signing_key(&"22".repeat(64)).is_ok());
        assert!(signing_key(&"22".repeat(31)).is_err());
    }
}
