//! Chain module - HTLC adapters for every supported chain family
//!
//! This module provides:
//! - The `ChainAdapter` capability trait shared by all families
//! - EVM, Tron, Bitcoin-style UTXO and TON implementations
//! - The adapter registry injected into the order monitor
//! - Confirmation tracking on top of the adapters

pub mod evm;
pub mod htlc_abi;
pub mod nonce;
pub mod rest;
pub mod ton;
pub mod tracker;
pub mod tron;
pub mod utxo;

#[cfg(test)]
pub mod testing;

pub use tracker::{ConfirmationTracker, TrackHandle, TransactionStatus, TxState};

use crate::config::{ChainKind, Settings};
use crate::error::{SwapError, SwapResult};
use crate::secret::{self, HashLock, Secret};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Parameters both parties agree on before an HTLC is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtlcParams {
    pub hash_lock: HashLock,
    /// Absolute expiry, unix seconds
    pub time_lock: u64,
    pub sender: String,
    pub receiver: String,
    #[serde(with = "amount_str")]
    pub amount: u128,
    pub chain: String,
}

/// Handle to an HTLC returned by `create_htlc`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRef {
    pub chain: String,
    /// Contract id (registry contracts) or script address (UTXO chains)
    pub id: String,
    pub params: HtlcParams,
    /// Chain-specific spending data, e.g. the witness script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

/// On-chain view of an HTLC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractStatus {
    pub exists: bool,
    pub redeemed: bool,
    pub refunded: bool,
    pub revealed_secret: Option<Secret>,
    /// Transaction that locked the funds, if the family exposes it
    pub funding_tx: Option<String>,
}

/// What a node knows about a transaction hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxObservation {
    NotFound,
    Pending,
    Included { block_height: u64 },
    Failed,
}

/// Capability interface every chain family implements
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Configured chain name
    fn chain(&self) -> String;

    fn kind(&self) -> ChainKind;

    /// Derive the HTLC identity for the given parameters. Makes no network write.
    fn create_htlc(&self, params: &HtlcParams) -> SwapResult<ContractRef>;

    /// Lock the committed amount into the HTLC
    async fn fund(&self, contract: &ContractRef, amount: u128) -> SwapResult<String>;

    /// Claim the HTLC with the preimage
    async fn redeem(
        &self,
        contract: &ContractRef,
        secret: &Secret,
        recipient: &str,
    ) -> SwapResult<String>;

    /// Return the locked funds to the sender after expiry
    async fn refund(&self, contract: &ContractRef, sender: &str) -> SwapResult<String>;

    async fn get_status(&self, contract: &ContractRef) -> SwapResult<ContractStatus>;

    fn validate_address(&self, address: &str) -> bool;

    fn required_confirmations(&self) -> u64;

    async fn block_height(&self) -> SwapResult<u64>;

    async fn transaction(&self, tx_hash: &str) -> SwapResult<TxObservation>;

    /// Address of the key this adapter signs with
    fn signer_address(&self) -> String;

    /// Whether redeem/refund can be submitted by a key other than the
    /// beneficiary's. Registry contracts pay out to the recorded sender and
    /// receiver whoever calls them; script-based families override this.
    fn permissionless_spends(&self) -> bool {
        true
    }
}

/// Checks shared by every family before a redeem reaches the network.
/// An expired leg reports `Expired` whatever the secret.
pub fn check_redeem(contract: &ContractRef, secret: &Secret, now: u64) -> SwapResult<()> {
    if now > contract.params.time_lock {
        return Err(SwapError::Expired {
            chain: contract.chain.clone(),
            time_lock: contract.params.time_lock,
        });
    }
    if !secret::verify_reveal(secret, &contract.params.hash_lock) {
        return Err(SwapError::HashMismatch);
    }
    Ok(())
}

/// Time check for a refund. Adapters run it after `check_spendable`, so a
/// redeemed leg reports `AlreadyRedeemed` even before expiry.
pub fn check_refund(contract: &ContractRef, now: u64) -> SwapResult<()> {
    if now <= contract.params.time_lock {
        return Err(SwapError::NotYetExpired {
            chain: contract.chain.clone(),
            time_lock: contract.params.time_lock,
        });
    }
    Ok(())
}

/// Map the on-chain flags of an HTLC to redeem/refund errors
pub fn check_spendable(status: &ContractStatus, contract: &ContractRef) -> SwapResult<()> {
    if !status.exists {
        return Err(SwapError::ContractNotFound {
            chain: contract.chain.clone(),
            contract_id: contract.id.clone(),
        });
    }
    if status.redeemed {
        return Err(SwapError::AlreadyRedeemed);
    }
    if status.refunded {
        return Err(SwapError::AlreadyRefunded);
    }
    Ok(())
}

/// Counterfactual id used by registry-style HTLC contracts:
/// `sha256(sender || receiver || amount32 || hash_lock || time_lock32)` with
/// addresses in their raw account form (20 bytes on EVM/Tron, 32 on TON)
pub fn registry_contract_id(
    sender: &[u8],
    receiver: &[u8],
    amount: u128,
    hash_lock: &HashLock,
    time_lock: u64,
) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(sender.len() + receiver.len() + 96);
    preimage.extend_from_slice(sender);
    preimage.extend_from_slice(receiver);
    preimage.extend_from_slice(&u256_be(amount));
    preimage.extend_from_slice(hash_lock.as_bytes());
    preimage.extend_from_slice(&u256_be(time_lock as u128));
    secret::sha256(&preimage)
}

pub(crate) fn u256_be(value: u128) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[16..].copy_from_slice(&value.to_be_bytes());
    out
}

/// Serialize u128 amounts as decimal strings
pub mod amount_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u128>().map_err(de::Error::custom)
    }
}

/// Adapters for all configured chains, keyed by chain name
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    /// Construct adapters for every enabled chain
    pub async fn from_settings(settings: &Settings) -> SwapResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} ({}, {})",
                name,
                chain_config.name,
                chain_config.kind.as_str()
            );

            let adapter: Arc<dyn ChainAdapter> = match chain_config.kind {
                ChainKind::Evm => Arc::new(evm::EvmAdapter::new(name, chain_config.clone()).await?),
                ChainKind::Tron => Arc::new(tron::TronAdapter::new(name, chain_config.clone())?),
                ChainKind::Bitcoin => {
                    Arc::new(utxo::BitcoinAdapter::new(name, chain_config.clone())?)
                }
                ChainKind::Ton => Arc::new(ton::TonAdapter::new(name, chain_config.clone())?),
            };

            info!(
                "Chain {} initialized, signer {}",
                name,
                adapter.signer_address()
            );
            registry.insert(adapter);
        }

        Ok(registry)
    }

    pub fn insert(&self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain(), adapter);
    }

    /// Get adapter for a specific chain
    pub fn get(&self, chain: &str) -> SwapResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(chain)
            .map(|a| a.clone())
            .ok_or_else(|| SwapError::ChainNotFound {
                chain: chain.to_string(),
            })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let adapters: Vec<_> = self
            .adapters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(adapters.len());
        for (name, adapter) in adapters {
            let healthy = match adapter.block_height().await {
                Ok(_) => true,
                Err(e) => {
                    error!("Health check failed for chain {}: {}", name, e);
                    false
                }
            };
            crate::metrics::record_chain_health(&name, healthy);
            results.push((name, healthy));
        }

        results
    }

    /// Names of all connected chains
    pub fn connected_chains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
