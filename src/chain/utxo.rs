//! Bitcoin-style UTXO adapter over an Esplora REST API
//!
//! The HTLC is a P2WSH output locked by
//! `IF SHA256 <H> EQUALVERIFY DUP HASH160 <receiver> ELSE <T> CLTV DROP DUP
//! HASH160 <sender> ENDIF EQUALVERIFY CHECKSIG`. The contract id is the
//! P2WSH address and the locator carries the witness script.

use crate::chain::rest::RestClient;
use crate::chain::{
    check_redeem, check_refund, check_spendable, ChainAdapter, ContractRef, ContractStatus,
    HtlcParams, TxObservation,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{ChainConfig, ChainKind};
use crate::error::{SwapError, SwapResult};
use crate::secret::{HashLock, Secret};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_HASH160, OP_IF,
    OP_SHA256,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    ecdsa, Address, AddressType, Amount, CompressedPublicKey, Network, OutPoint, PrivateKey,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DUST_LIMIT: u64 = 546;
/// Size of a one-input HTLC spend to a P2WPKH output, in vbytes
const HTLC_SPEND_VSIZE: u64 = 160;

#[derive(Debug, Clone, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: EsploraStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraTx {
    txid: String,
    #[serde(default)]
    vin: Vec<EsploraVin>,
    #[serde(default)]
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVin {
    txid: String,
    vout: u32,
    #[serde(default)]
    witness: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

/// The funded HTLC output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcOutput {
    pub outpoint: OutPoint,
    pub value: u64,
}

/// How an HTLC output was spent, read from the spending witness
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spend {
    Redeem(Option<Secret>),
    Refund,
    Unknown,
}

pub enum SpendPath<'a> {
    Redeem(&'a Secret),
    Refund { time_lock: u64 },
}

struct HtlcScan {
    output: Option<HtlcOutput>,
    funding_tx: Option<String>,
    spend: Option<Spend>,
}

pub struct BitcoinAdapter {
    name: String,
    config: ChainConfig,
    network: Network,
    api: RestClient,
    secp: Secp256k1<All>,
    key: PrivateKey,
    pubkey: CompressedPublicKey,
    address: Address,
    /// Serializes wallet spends so concurrent fundings never pick the same coins
    spend_lock: Mutex<HashSet<OutPoint>>,
}

impl BitcoinAdapter {
    pub fn new(name: &str, config: ChainConfig) -> SwapResult<Self> {
        let wif = std::env::var(&config.private_key_env).map_err(|_| {
            SwapError::Config(format!(
                "Signing key variable {} is not set for chain {}",
                config.private_key_env, name
            ))
        })?;
        let key = PrivateKey::from_wif(wif.trim()).map_err(|e| SwapError::Wallet(e.to_string()))?;
        Self::with_key(name, config, key)
    }

    pub fn with_key(name: &str, config: ChainConfig, key: PrivateKey) -> SwapResult<Self> {
        let network = match config.network.as_deref() {
            Some(network) => Network::from_str(network)
                .map_err(|e| SwapError::Config(format!("Invalid network for {}: {}", name, e)))?,
            None => Network::Bitcoin,
        };

        let secp = Secp256k1::new();
        let pubkey = CompressedPublicKey::from_private_key(&secp, &key)
            .map_err(|e| SwapError::Wallet(e.to_string()))?;
        let address = Address::p2wpkh(&pubkey, network);
        let api = RestClient::new(name, &config.rpc_urls, None, Duration::from_secs(10))?;

        Ok(Self {
            name: name.to_string(),
            config,
            network,
            api,
            secp,
            key,
            pubkey,
            address,
            spend_lock: Mutex::new(HashSet::new()),
        })
    }

    fn parse_address(&self, address: &str) -> SwapResult<Address> {
        parse_address(&self.name, address, self.network)
    }

    fn witness_script(&self, contract: &ContractRef) -> SwapResult<ScriptBuf> {
        let locator = contract.locator.as_deref().ok_or_else(|| {
            SwapError::Validation(format!("Contract {} has no witness script", contract.id))
        })?;
        ScriptBuf::from_hex(locator)
            .map_err(|e| SwapError::Validation(format!("Invalid witness script: {}", e)))
    }

    /// Locate the funding output and its spend among the HTLC address history
    async fn scan(&self, contract: &ContractRef) -> SwapResult<HtlcScan> {
        let txs: Vec<EsploraTx> = self
            .api
            .get_json_opt(&format!("/address/{}/txs", contract.id))
            .await?
            .unwrap_or_default();

        let funding = txs.iter().find_map(|tx| {
            tx.vout.iter().enumerate().find_map(|(n, out)| {
                (out.scriptpubkey_address.as_deref() == Some(contract.id.as_str())
                    && out.value as u128 >= contract.params.amount)
                    .then(|| (tx.txid.clone(), n as u32, out.value))
            })
        });

        let Some((txid, vout, value)) = funding else {
            return Ok(HtlcScan {
                output: None,
                funding_tx: None,
                spend: None,
            });
        };

        let spend = txs.iter().find_map(|tx| {
            tx.vin
                .iter()
                .find(|input| input.txid == txid && input.vout == vout)
                .map(|input| classify_spend(&input.witness))
        });

        let outpoint = OutPoint {
            txid: Txid::from_str(&txid)
                .map_err(|e| SwapError::connection(&self.name, format!("Bad txid {}: {}", txid, e)))?,
            vout,
        };

        Ok(HtlcScan {
            output: Some(HtlcOutput { outpoint, value }),
            funding_tx: Some(txid),
            spend,
        })
    }

    fn status_from_scan(scan: &HtlcScan) -> ContractStatus {
        let (redeemed, refunded, revealed_secret) = match &scan.spend {
            Some(Spend::Redeem(secret)) => (true, false, secret.clone()),
            Some(Spend::Refund) => (false, true, None),
            // Spent through a path we cannot read; treat as settled by the receiver
            Some(Spend::Unknown) => (true, false, None),
            None => (false, false, None),
        };

        ContractStatus {
            exists: scan.output.is_some(),
            redeemed,
            refunded,
            revealed_secret,
            funding_tx: scan.funding_tx.clone(),
        }
    }

    /// Build and sign a transaction spending the HTLC output
    pub fn spend_htlc(
        &self,
        htlc: &HtlcOutput,
        script: &ScriptBuf,
        destination: &Address,
        path: SpendPath<'_>,
    ) -> SwapResult<Transaction> {
        let fee = self
            .config
            .fee_rate_sat_vb
            .checked_mul(HTLC_SPEND_VSIZE)
            .ok_or_else(|| {
                SwapError::Validation(format!(
                    "Fee rate {} sat/vB is out of range",
                    self.config.fee_rate_sat_vb
                ))
            })?;
        let floor = fee.saturating_add(DUST_LIMIT);
        if htlc.value <= floor {
            return Err(SwapError::InsufficientBalance {
                chain: self.name.clone(),
                have: htlc.value.to_string(),
                need: floor.saturating_add(1).to_string(),
            });
        }

        let (lock_time, sequence) = match path {
            SpendPath::Redeem(_) => (LockTime::ZERO, Sequence::ENABLE_RBF_NO_LOCKTIME),
            SpendPath::Refund { time_lock } => (
                timestamp_lock(time_lock)?,
                Sequence::ENABLE_LOCKTIME_NO_RBF,
            ),
        };

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time,
            input: vec![TxIn {
                previous_output: htlc.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(htlc.value - fee),
                script_pubkey: destination.script_pubkey(),
            }],
        };

        let sighash = SighashCache::new(&tx)
            .p2wsh_signature_hash(0, script, Amount::from_sat(htlc.value), EcdsaSighashType::All)
            .map_err(|e| SwapError::Wallet(e.to_string()))?;
        let signature = self.sign(sighash.to_byte_array());

        let pubkey = self.pubkey.to_bytes().to_vec();
        let items: Vec<Vec<u8>> = match path {
            SpendPath::Redeem(secret) => vec![
                signature.to_vec(),
                pubkey,
                secret.as_bytes().to_vec(),
                vec![1],
                script.to_bytes(),
            ],
            SpendPath::Refund { .. } => vec![signature.to_vec(), pubkey, Vec::new(), script.to_bytes()],
        };
        tx.input[0].witness = Witness::from_slice(&items);

        Ok(tx)
    }

    fn sign(&self, digest: [u8; 32]) -> ecdsa::Signature {
        let message = Message::from_digest(digest);
        ecdsa::Signature {
            signature: self.secp.sign_ecdsa(&message, &self.key.inner),
            sighash_type: EcdsaSighashType::All,
        }
    }

    async fn broadcast(&self, tx: &Transaction) -> SwapResult<String> {
        match self.api.post_text("/tx", &serialize_hex(tx)).await {
            Ok(txid) => {
                let txid = txid.trim().to_string();
                info!("Broadcast tx {} on chain {}", txid, self.name);
                Ok(txid)
            }
            // Median time past trails wall clock; the refund becomes final later
            Err(SwapError::Transaction(msg)) if msg.contains("non-final") => {
                warn!("Transaction not final yet on chain {}", self.name);
                Err(SwapError::connection(&self.name, msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Fund a P2WSH output from the signer's P2WPKH coins
    async fn fund_output(&self, destination: &Address, amount: u64) -> SwapResult<String> {
        let mut in_flight = self.spend_lock.lock().await;

        let mut utxos: Vec<EsploraUtxo> = self
            .api
            .get_json(&format!("/address/{}/utxo", self.address))
            .await?;
        // Confirmed coins first, then largest
        utxos.sort_by(|a, b| {
            b.status
                .confirmed
                .cmp(&a.status.confirmed)
                .then(b.value.cmp(&a.value))
        });

        let mut coins = Vec::with_capacity(utxos.len());
        for utxo in &utxos {
            let txid = Txid::from_str(&utxo.txid).map_err(|e| SwapError::connection(&self.name, e))?;
            coins.push((OutPoint { txid, vout: utxo.vout }, utxo.value));
        }
        // Coins the indexer no longer lists are spent for good
        in_flight.retain(|outpoint| coins.iter().any(|(op, _)| op == outpoint));

        let CoinSelection {
            coins: selected,
            total,
            need,
        } = select_coins(
            coins.into_iter().filter(|(outpoint, _)| !in_flight.contains(outpoint)),
            amount,
            self.config.fee_rate_sat_vb,
        )?;

        if total < need {
            return Err(SwapError::InsufficientBalance {
                chain: self.name.clone(),
                have: total.to_string(),
                need: need.to_string(),
            });
        }

        let mut output = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: destination.script_pubkey(),
        }];
        // total >= need was checked above
        let change = total - need;
        if change > DUST_LIMIT {
            output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: self.address.script_pubkey(),
            });
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selected
                .iter()
                .map(|(outpoint, _)| TxIn {
                    previous_output: *outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output,
        };

        let signer_spk = self.address.script_pubkey();
        let mut witnesses = Vec::with_capacity(selected.len());
        {
            let mut cache = SighashCache::new(&tx);
            for (i, (_, value)) in selected.iter().enumerate() {
                let sighash = cache
                    .p2wpkh_signature_hash(i, &signer_spk, Amount::from_sat(*value), EcdsaSighashType::All)
                    .map_err(|e| SwapError::Wallet(e.to_string()))?;
                let signature = self.sign(sighash.to_byte_array());
                witnesses.push(Witness::p2wpkh(&signature, &self.pubkey.0));
            }
        }
        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        let txid = self.broadcast(&tx).await?;
        in_flight.extend(selected.into_iter().map(|(outpoint, _)| outpoint));
        Ok(txid)
    }
}

#[async_trait]
impl ChainAdapter for BitcoinAdapter {
    fn chain(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Bitcoin
    }

    fn create_htlc(&self, params: &HtlcParams) -> SwapResult<ContractRef> {
        derive_contract(&self.name, params, self.network)
    }

    async fn fund(&self, contract: &ContractRef, amount: u128) -> SwapResult<String> {
        if self.parse_address(&contract.params.sender)? != self.address {
            return Err(SwapError::Wallet(format!(
                "Signer {} is not the HTLC sender {}",
                self.address, contract.params.sender
            )));
        }
        if amount != contract.params.amount {
            return Err(SwapError::Validation(format!(
                "Funding amount {} differs from committed amount {}",
                amount, contract.params.amount
            )));
        }
        let amount = u64::try_from(amount)
            .map_err(|_| SwapError::Validation(format!("Amount {} exceeds satoshi range", amount)))?;

        let destination = self.parse_address(&contract.id)?;
        self.fund_output(&destination, amount).await
    }

    async fn redeem(
        &self,
        contract: &ContractRef,
        secret: &Secret,
        recipient: &str,
    ) -> SwapResult<String> {
        check_redeem(contract, secret, SystemClock.now())?;
        if self.parse_address(&contract.params.receiver)? != self.address {
            return Err(SwapError::Wallet(format!(
                "Signer {} is not the HTLC receiver {}",
                self.address, contract.params.receiver
            )));
        }

        let scan = self.scan(contract).await?;
        check_spendable(&Self::status_from_scan(&scan), contract)?;
        let htlc = scan.output.ok_or_else(|| SwapError::ContractNotFound {
            chain: self.name.clone(),
            contract_id: contract.id.clone(),
        })?;

        let tx = self.spend_htlc(
            &htlc,
            &self.witness_script(contract)?,
            &self.parse_address(recipient)?,
            SpendPath::Redeem(secret),
        )?;
        debug!("Redeeming {} on chain {}", contract.id, self.name);
        self.broadcast(&tx).await
    }

    async fn refund(&self, contract: &ContractRef, sender: &str) -> SwapResult<String> {
        if self.parse_address(&contract.params.sender)? != self.address {
            return Err(SwapError::Wallet(format!(
                "Signer {} is not the HTLC sender {}",
                self.address, contract.params.sender
            )));
        }

        let scan = self.scan(contract).await?;
        check_spendable(&Self::status_from_scan(&scan), contract)?;
        check_refund(contract, SystemClock.now())?;
        let htlc = scan.output.ok_or_else(|| SwapError::ContractNotFound {
            chain: self.name.clone(),
            contract_id: contract.id.clone(),
        })?;

        let tx = self.spend_htlc(
            &htlc,
            &self.witness_script(contract)?,
            &self.parse_address(sender)?,
            SpendPath::Refund {
                time_lock: contract.params.time_lock,
            },
        )?;
        debug!("Refunding {} on chain {}", contract.id, self.name);
        self.broadcast(&tx).await
    }

    async fn get_status(&self, contract: &ContractRef) -> SwapResult<ContractStatus> {
        let scan = self.scan(contract).await?;
        Ok(Self::status_from_scan(&scan))
    }

    fn validate_address(&self, address: &str) -> bool {
        self.parse_address(address)
            .ok()
            .and_then(|a| pubkey_hash(&a))
            .is_some()
    }

    fn required_confirmations(&self) -> u64 {
        self.config.required_confirmations()
    }

    async fn block_height(&self) -> SwapResult<u64> {
        let text = self.api.get_text("/blocks/tip/height").await?;
        text.trim()
            .parse::<u64>()
            .map_err(|e| SwapError::connection(&self.name, format!("Bad tip height: {}", e)))
    }

    async fn transaction(&self, tx_hash: &str) -> SwapResult<TxObservation> {
        let status: Option<EsploraStatus> = self
            .api
            .get_json_opt(&format!("/tx/{}/status", tx_hash))
            .await?;

        Ok(match status {
            None => TxObservation::NotFound,
            Some(EsploraStatus {
                confirmed: true,
                block_height: Some(block_height),
            }) => TxObservation::Included { block_height },
            Some(_) => TxObservation::Pending,
        })
    }

    fn signer_address(&self) -> String {
        self.address.to_string()
    }

    fn permissionless_spends(&self) -> bool {
        false
    }
}

struct CoinSelection {
    coins: Vec<(OutPoint, u64)>,
    total: u64,
    /// Amount plus the fee of spending `coins`
    need: u64,
}

/// Take coins in order until they cover the amount and their own fee
fn select_coins(
    coins: impl IntoIterator<Item = (OutPoint, u64)>,
    amount: u64,
    fee_rate: u64,
) -> SwapResult<CoinSelection> {
    let mut selection = CoinSelection {
        coins: Vec::new(),
        total: 0,
        need: amount,
    };
    for (outpoint, value) in coins {
        selection.total = selection.total.saturating_add(value);
        selection.coins.push((outpoint, value));
        selection.need = fee_rate
            .checked_mul(funding_vsize(selection.coins.len()))
            .and_then(|fee| amount.checked_add(fee))
            .ok_or_else(|| {
                SwapError::Validation(format!("Funding {} sat overflows with fees", amount))
            })?;
        if selection.total >= selection.need {
            break;
        }
    }
    Ok(selection)
}

fn funding_vsize(inputs: usize) -> u64 {
    11 + 68 * inputs as u64 + 43 + 31
}

fn timestamp_lock(time_lock: u64) -> SwapResult<LockTime> {
    let seconds = u32::try_from(time_lock)
        .map_err(|_| SwapError::Validation(format!("Time lock {} out of range", time_lock)))?;
    LockTime::from_time(seconds)
        .map_err(|e| SwapError::Validation(format!("Time lock {} is not a timestamp: {}", time_lock, e)))
}

fn parse_address(chain: &str, address: &str, network: Network) -> SwapResult<Address> {
    Address::from_str(address)
        .ok()
        .and_then(|a| a.require_network(network).ok())
        .ok_or_else(|| SwapError::InvalidAddress {
            chain: chain.to_string(),
            address: address.to_string(),
        })
}

/// HASH160 of the key behind a P2PKH or P2WPKH address
fn pubkey_hash(address: &Address) -> Option<[u8; 20]> {
    if let Some(hash) = address.pubkey_hash() {
        return Some(hash.to_byte_array());
    }
    if address.address_type() == Some(AddressType::P2wpkh) {
        return address
            .witness_program()
            .and_then(|program| program.program().as_bytes().try_into().ok());
    }
    None
}

pub fn htlc_script(
    hash_lock: &HashLock,
    receiver_pkh: &[u8; 20],
    sender_pkh: &[u8; 20],
    time_lock: u64,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_slice(hash_lock.as_bytes())
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(receiver_pkh)
        .push_opcode(OP_ELSE)
        .push_int(time_lock as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(sender_pkh)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

pub fn derive_contract(chain: &str, params: &HtlcParams, network: Network) -> SwapResult<ContractRef> {
    let key_hash = |address: &str| {
        parse_address(chain, address, network)
            .ok()
            .and_then(|a| pubkey_hash(&a))
            .ok_or_else(|| SwapError::InvalidAddress {
                chain: chain.to_string(),
                address: address.to_string(),
            })
    };
    let sender = key_hash(&params.sender)?;
    let receiver = key_hash(&params.receiver)?;
    // Keep CLTV in timestamp mode
    timestamp_lock(params.time_lock)?;

    let script = htlc_script(&params.hash_lock, &receiver, &sender, params.time_lock);
    let address = Address::p2wsh(&script, network);

    Ok(ContractRef {
        chain: chain.to_string(),
        id: address.to_string(),
        params: params.clone(),
        locator: Some(script.to_hex_string()),
    })
}

/// Read the spend path from a P2WSH witness given as hex items
pub fn classify_spend(witness: &[String]) -> Spend {
    match witness.len() {
        5 if witness[3] == "01" => {
            let secret = hex::decode(&witness[2])
                .ok()
                .and_then(|bytes| Secret::from_slice(&bytes).ok());
            Spend::Redeem(secret)
        }
        4 if witness[2].is_empty() => Spend::Refund,
        _ => Spend::Unknown,
    }
}
