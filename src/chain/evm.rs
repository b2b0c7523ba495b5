//! EVM adapter with multi-RPC support and automatic failover

use crate::chain::htlc_abi::{self, EVENT_NEW};
use crate::chain::nonce::NonceManager;
use crate::chain::{
    check_redeem, check_refund, check_spendable, registry_contract_id, ChainAdapter, ContractRef,
    ContractStatus, HtlcParams, TxObservation,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{ChainConfig, ChainKind, GasPriceStrategy};
use crate::error::{SwapError, SwapResult};
use crate::secret::Secret;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const GWEI: u64 = 1_000_000_000;

/// HTLC registry adapter for EVM chains
pub struct EvmAdapter {
    name: String,
    config: ChainConfig,
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    wallet: LocalWallet,
    contract: Address,
    nonces: NonceManager,
}

impl EvmAdapter {
    pub async fn new(name: &str, config: ChainConfig) -> SwapResult<Self> {
        let chain_id = config
            .chain_id
            .ok_or_else(|| SwapError::Config(format!("Chain {} has no chain_id", name)))?;

        let mut http_providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", name, url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        if http_providers.is_empty() {
            return Err(SwapError::connection(name, "No valid RPC providers"));
        }

        let key = std::env::var(&config.private_key_env).map_err(|_| {
            SwapError::Config(format!(
                "Signing key variable {} is not set for chain {}",
                config.private_key_env, name
            ))
        })?;
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| SwapError::Wallet(e.to_string()))?
            .with_chain_id(chain_id);

        let contract = config.contract_address.parse::<Address>().map_err(|_| {
            SwapError::InvalidAddress {
                chain: name.to_string(),
                address: config.contract_address.clone(),
            }
        })?;

        let adapter = Self {
            name: name.to_string(),
            config,
            chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
            wallet,
            contract,
            nonces: NonceManager::new(name),
        };

        // Nonce is fetched lazily if the node is unreachable at start-up
        if let Err(e) = adapter.ensure_nonce().await {
            warn!("Deferring nonce initialization on chain {}: {}", name, e);
        }

        Ok(adapter)
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.name, next);
    }

    /// Run a provider call, rotating providers on transport failures
    async fn with_failover<'a, T, F, Fut>(&'a self, operation: &str, call: F) -> SwapResult<T>
    where
        F: Fn(&'a Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>> + 'a,
    {
        let mut last_error = SwapError::connection(&self.name, "No providers attempted");

        for _ in 0..self.http_providers.len() {
            match call(self.http()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let err = classify_provider_error(&self.name, &e.to_string());
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!("{} failed on chain {}: {}", operation, self.name, e);
                    last_error = err;
                    self.failover();
                }
            }
        }

        Err(last_error)
    }

    async fn ensure_nonce(&self) -> SwapResult<()> {
        if self.nonces.is_initialized().await {
            return Ok(());
        }
        let address = self.wallet.address();
        let count = self
            .with_failover("get_transaction_count", |p| {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
            })
            .await?;
        self.nonces.init(count.as_u64()).await;
        Ok(())
    }

    /// Get current gas price based on chain strategy
    async fn gas_price(&self) -> SwapResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .with_failover("get_gas_price", |p| p.get_gas_price())
                    .await?;
                Ok(GasPrice::Legacy(cap_fee(price, self.config.max_gas_price_gwei)))
            }
            GasPriceStrategy::Eip1559 => {
                let block = self
                    .with_failover("get_block", |p| p.get_block(BlockNumber::Latest))
                    .await?
                    .ok_or_else(|| SwapError::connection(&self.name, "No latest block"))?;

                let base_fee = block.base_fee_per_gas.ok_or_else(|| {
                    SwapError::Config(format!(
                        "Chain {} has no base fee, use the legacy gas strategy",
                        self.name
                    ))
                })?;

                let priority_fee = U256::from(2 * GWEI);
                let max_fee = cap_fee(base_fee * 2 + priority_fee, self.config.max_gas_price_gwei);

                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: std::cmp::min(priority_fee, max_fee),
                })
            }
        }
    }

    /// Timestamp of the latest block
    async fn chain_time(&self) -> SwapResult<u64> {
        let block = self
            .with_failover("get_block", |p| p.get_block(BlockNumber::Latest))
            .await?
            .ok_or_else(|| SwapError::connection(&self.name, "No latest block"))?;
        Ok(block.timestamp.low_u64())
    }

    /// Sign and broadcast a call to the HTLC contract
    async fn send(&self, data: Vec<u8>, value: U256) -> SwapResult<String> {
        self.ensure_nonce().await?;
        let price = self.gas_price().await?;
        let nonce = self.nonces.next().await?;

        match self.sign_and_send(data, value, nonce, price).await {
            Ok(tx_hash) => {
                self.nonces.mark_pending(nonce, &tx_hash).await;
                debug!(
                    "Chain {} sent {} with nonce {} ({} pending)",
                    self.name,
                    tx_hash,
                    nonce,
                    self.nonces.pending_count().await
                );
                Ok(tx_hash)
            }
            Err(e) => {
                self.nonces.release(nonce).await;
                if let Ok(count) = self
                    .with_failover("get_transaction_count", |p| {
                        p.get_transaction_count(self.wallet.address(), Some(BlockNumber::Pending.into()))
                    })
                    .await
                {
                    self.nonces.sync(count.as_u64()).await;
                }
                Err(e)
            }
        }
    }

    async fn sign_and_send(
        &self,
        data: Vec<u8>,
        value: U256,
        nonce: u64,
        price: GasPrice,
    ) -> SwapResult<String> {
        let from = self.wallet.address();
        let mut tx: TypedTransaction = match price {
            GasPrice::Legacy(gas_price) => TransactionRequest::new()
                .from(from)
                .to(self.contract)
                .data(data)
                .value(value)
                .nonce(nonce)
                .gas_price(gas_price)
                .chain_id(self.chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(self.contract)
                .data(data)
                .value(value)
                .nonce(nonce)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .chain_id(self.chain_id)
                .into(),
        };

        let gas = self
            .with_failover("estimate_gas", |p| p.estimate_gas(&tx, None))
            .await?;
        // 20% headroom over the estimate
        tx.set_gas(gas * 12 / 10);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SwapError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = self
            .with_failover("send_raw_transaction", |p| {
                let raw = raw.clone();
                async move { p.send_raw_transaction(raw).await.map(|pending| pending.tx_hash()) }
            })
            .await?;

        info!(
            "Sent tx {:?} on chain {} (nonce {})",
            tx_hash, self.name, nonce
        );
        Ok(format!("{:?}", tx_hash))
    }

    async fn read_contract(&self, contract_id: [u8; 32]) -> SwapResult<htlc_abi::OnChainHtlc> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract)
            .data(htlc_abi::get_contract(contract_id))
            .into();

        let output = self
            .with_failover("getContract", |p| p.call(&tx, None))
            .await?;

        htlc_abi::decode_get_contract(&output)
    }

    /// Find the transaction that emitted `HTLCNew` for a contract id
    async fn funding_tx(&self, contract_id: [u8; 32]) -> SwapResult<Option<String>> {
        let tip = self
            .with_failover("get_block_number", |p| p.get_block_number())
            .await?
            .as_u64();
        let from_block = tip.saturating_sub(self.config.log_lookback_blocks);

        let filter = Filter::new()
            .address(self.contract)
            .topic0(H256::from(htlc_abi::event_topic(EVENT_NEW)))
            .topic1(H256::from(contract_id))
            .from_block(from_block)
            .to_block(BlockNumber::Latest);

        let logs = self
            .with_failover("get_logs", |p| p.get_logs(&filter))
            .await?;

        Ok(logs
            .into_iter()
            .find_map(|log| log.transaction_hash)
            .map(|h| format!("{:?}", h)))
    }

    fn parse_address(&self, address: &str) -> SwapResult<Address> {
        parse_address(&self.name, address)
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Evm
    }

    fn create_htlc(&self, params: &HtlcParams) -> SwapResult<ContractRef> {
        derive_contract(&self.name, params)
    }

    async fn fund(&self, contract: &ContractRef, amount: u128) -> SwapResult<String> {
        let sender = self.parse_address(&contract.params.sender)?;
        if sender != self.wallet.address() {
            return Err(SwapError::Wallet(format!(
                "Signer {:?} is not the HTLC sender {}",
                self.wallet.address(),
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
        self.send(
            htlc_abi::new_contract(receiver, &contract.params),
            U256::from(amount),
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

        let on_chain = self.read_contract(id).await?;
        check_spendable(&on_chain.into_status(None), contract)?;

        debug!(
            "Redeeming {} on chain {} for {}",
            contract.id, self.name, recipient
        );
        self.send(htlc_abi::withdraw(id, secret), U256::zero()).await
    }

    async fn refund(&self, contract: &ContractRef, sender: &str) -> SwapResult<String> {
        let id = htlc_abi::parse_contract_id(&contract.id)?;

        let on_chain = self.read_contract(id).await?;
        check_spendable(&on_chain.into_status(None), contract)?;
        // The registry compares against block.timestamp, not our clock
        check_refund(contract, self.chain_time().await?)?;

        debug!("Refunding {} on chain {} to {}", contract.id, self.name, sender);
        self.send(htlc_abi::refund(id), U256::zero()).await
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
        is_valid_address(address)
    }

    fn required_confirmations(&self) -> u64 {
        self.config.required_confirmations()
    }

    async fn block_height(&self) -> SwapResult<u64> {
        Ok(self
            .with_failover("get_block_number", |p| p.get_block_number())
            .await?
            .as_u64())
    }

    async fn transaction(&self, tx_hash: &str) -> SwapResult<TxObservation> {
        let hash = tx_hash
            .parse::<H256>()
            .map_err(|e| SwapError::Validation(format!("Invalid tx hash {}: {}", tx_hash, e)))?;

        let receipt = self
            .with_failover("get_transaction_receipt", |p| p.get_transaction_receipt(hash))
            .await?;

        if let Some(receipt) = receipt {
            if receipt.status == Some(U64::zero()) {
                return Ok(TxObservation::Failed);
            }
            if let Some(block) = receipt.block_number {
                return Ok(TxObservation::Included {
                    block_height: block.as_u64(),
                });
            }
        }

        let tx = self
            .with_failover("get_transaction", |p| p.get_transaction(hash))
            .await?;
        Ok(if tx.is_some() {
            TxObservation::Pending
        } else {
            TxObservation::NotFound
        })
    }

    fn signer_address(&self) -> String {
        format!("{:?}", self.wallet.address())
    }
}

/// Gas price types
#[derive(Debug, Clone)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

fn cap_fee(fee: U256, max_gwei: u64) -> U256 {
    std::cmp::min(fee, U256::from(max_gwei) * U256::from(GWEI))
}

pub fn is_valid_address(address: &str) -> bool {
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn parse_address(chain: &str, address: &str) -> SwapResult<Address> {
    if !is_valid_address(address) {
        return Err(SwapError::InvalidAddress {
            chain: chain.to_string(),
            address: address.to_string(),
        });
    }
    address.parse::<Address>().map_err(|_| SwapError::InvalidAddress {
        chain: chain.to_string(),
        address: address.to_string(),
    })
}

/// Contract id the registry will assign when `sender` funds these params
pub fn derive_contract(chain: &str, params: &HtlcParams) -> SwapResult<ContractRef> {
    let sender = parse_address(chain, &params.sender)?;
    let receiver = parse_address(chain, &params.receiver)?;
    let id = registry_contract_id(
        sender.as_fixed_bytes(),
        receiver.as_fixed_bytes(),
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

/// Map provider errors onto the coordinator's retry classes
fn classify_provider_error(chain: &str, message: &str) -> SwapError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        SwapError::RateLimited {
            chain: chain.to_string(),
        }
    } else if lower.contains("revert") {
        SwapError::Contract(message.to_string())
    } else if lower.contains("insufficient funds")
        || lower.contains("nonce too low")
        || lower.contains("replacement transaction underpriced")
    {
        SwapError::Transaction(message.to_string())
    } else {
        SwapError::connection(chain, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::HashLock;

    fn params() -> HtlcParams {
        HtlcParams {
            hash_lock: HashLock::from_bytes([3u8; 32]),
            time_lock: 1_700_000_000,
            sender: "0x1111111111111111111111111111111111111111".into(),
            receiver: "0x2222222222222222222222222222222222222222".into(),
            amount: 1_000_000_000_000_000,
            chain: "sepolia".into(),
        }
    }

    #[test]
    fn test_contract_id_is_deterministic() {
        let a = derive_contract("sepolia", &params()).unwrap();
        let b = derive_contract("sepolia", &params()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id.len(), 66);

        let mut other = params();
        other.time_lock += 1;
        assert_ne!(derive_contract("sepolia", &other).unwrap().id, a.id);
    }

    #[test]
    fn test_invalid_addresses_rejected() {
        assert!(is_valid_address("0x2222222222222222222222222222222222222222"));
        assert!(!is_valid_address("2222222222222222222222222222222222222222"));
        assert!(!is_valid_address("0x22222222222222222222222222222222222222zz"));

        let mut bad = params();
        bad.receiver = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".into();
        assert!(matches!(
            derive_contract("sepolia", &bad),
            Err(SwapError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_fee_cap() {
        let capped = cap_fee(U256::from(900 * GWEI), 500);
        assert_eq!(capped, U256::from(500 * GWEI));
        assert_eq!(cap_fee(U256::from(GWEI), 500), U256::from(GWEI));
    }

    #[test]
    fn test_provider_error_classification() {
        assert!(classify_provider_error("sepolia", "HTTP 429 Too Many Requests").is_retryable());
        assert!(classify_provider_error("sepolia", "connection refused").is_retryable());
        assert!(!classify_provider_error("sepolia", "execution reverted: expired").is_retryable());
        assert!(!classify_provider_error("sepolia", "insufficient funds for gas").is_retryable());
    }
}
