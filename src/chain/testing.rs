//! In-memory chain and manual clock for driving the monitor in tests

use crate::chain::{
    check_redeem, check_refund, check_spendable, registry_contract_id, ChainAdapter, ContractRef,
    ContractStatus, HtlcParams, TxObservation,
};
use crate::clock::Clock;
use crate::config::ChainKind;
use crate::error::{SwapError, SwapResult};
use crate::secret::Secret;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(AtomicU64::new(now))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Htlc {
    redeemed: bool,
    refunded: bool,
    secret: Option<Secret>,
    funding_tx: String,
}

#[derive(Debug)]
struct Tx {
    height: u64,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    next_tx: u64,
    htlcs: HashMap<String, Htlc>,
    txs: HashMap<String, Tx>,
    failing_status_calls: usize,
    rejected_refunds: usize,
    rejected_funds: usize,
    /// Report HTLCs without their funding transaction
    hide_funding: bool,
}

impl ChainState {
    fn record_tx(&mut self, chain: &str) -> String {
        self.next_tx += 1;
        let hash = format!("{}-tx-{}", chain, self.next_tx);
        self.txs.insert(
            hash.clone(),
            Tx {
                height: self.height,
            },
        );
        hash
    }
}

/// Registry-style HTLC chain kept in memory. Transactions are mined into
/// the current block as soon as they are sent; anyone may fund.
pub struct InMemoryChain {
    name: String,
    signer: String,
    confirmations: AtomicU64,
    clock: Arc<ManualClock>,
    state: Mutex<ChainState>,
    status_calls: AtomicUsize,
}

impl InMemoryChain {
    pub fn new(name: &str, clock: Arc<ManualClock>) -> Self {
        Self {
            name: name.to_string(),
            signer: "resolver".to_string(),
            confirmations: AtomicU64::new(1),
            clock,
            state: Mutex::new(ChainState {
                height: 1,
                ..Default::default()
            }),
            status_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `calls` status reads fail with a connection error
    pub fn fail_status_calls(&self, calls: usize) {
        self.state().failing_status_calls = calls;
    }

    /// Make the next `calls` refunds revert the way a registry does when
    /// its block time has not reached the lock
    pub fn reject_refunds(&self, calls: usize) {
        self.state().rejected_refunds = calls;
    }

    /// Make the next `calls` funding attempts fail for good
    pub fn reject_funding(&self, calls: usize) {
        self.state().rejected_funds = calls;
    }

    pub fn hide_funding_txs(&self) {
        self.state().hide_funding = true;
    }

    pub fn set_required_confirmations(&self, confirmations: u64) {
        self.confirmations.store(confirmations, Ordering::SeqCst);
    }

    pub fn mine(&self, blocks: u64) {
        self.state().height += blocks;
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn is_redeemed(&self, contract: &ContractRef) -> bool {
        self.state()
            .htlcs
            .get(&contract.id)
            .map(|h| h.redeemed)
            .unwrap_or(false)
    }

    pub fn is_refunded(&self, contract: &ContractRef) -> bool {
        self.state()
            .htlcs
            .get(&contract.id)
            .map(|h| h.refunded)
            .unwrap_or(false)
    }

    fn spendable(&self, contract: &ContractRef) -> SwapResult<()> {
        let status = self.status_of(contract);
        check_spendable(&status, contract)
    }

    fn status_of(&self, contract: &ContractRef) -> ContractStatus {
        let state = self.state();
        match state.htlcs.get(&contract.id) {
            Some(htlc) => ContractStatus {
                exists: true,
                redeemed: htlc.redeemed,
                refunded: htlc.refunded,
                revealed_secret: htlc.secret.clone(),
                funding_tx: (!state.hide_funding).then(|| htlc.funding_tx.clone()),
            },
            None => ContractStatus::default(),
        }
    }
}

#[async_trait]
impl ChainAdapter for InMemoryChain {
    fn chain(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ChainKind {
        ChainKind::Evm
    }

    fn create_htlc(&self, params: &HtlcParams) -> SwapResult<ContractRef> {
        let id = registry_contract_id(
            params.sender.as_bytes(),
            params.receiver.as_bytes(),
            params.amount,
            &params.hash_lock,
            params.time_lock,
        );
        Ok(ContractRef {
            chain: self.name.clone(),
            id: format!("0x{}", hex::encode(id)),
            params: params.clone(),
            locator: None,
        })
    }

    async fn fund(&self, contract: &ContractRef, amount: u128) -> SwapResult<String> {
        if amount != contract.params.amount {
            return Err(SwapError::Validation(format!(
                "Funding amount {} differs from committed amount {}",
                amount, contract.params.amount
            )));
        }
        let mut state = self.state();
        if state.rejected_funds > 0 {
            state.rejected_funds -= 1;
            return Err(SwapError::InsufficientBalance {
                chain: self.name.clone(),
                have: "0".to_string(),
                need: amount.to_string(),
            });
        }
        if state.htlcs.contains_key(&contract.id) {
            return Err(SwapError::Contract(format!(
                "HTLC {} already exists",
                contract.id
            )));
        }
        let tx = state.record_tx(&self.name);
        state.htlcs.insert(
            contract.id.clone(),
            Htlc {
                funding_tx: tx.clone(),
                ..Default::default()
            },
        );
        Ok(tx)
    }

    async fn redeem(
        &self,
        contract: &ContractRef,
        secret: &Secret,
        _recipient: &str,
    ) -> SwapResult<String> {
        check_redeem(contract, secret, self.clock.now())?;
        self.spendable(contract)?;

        let mut state = self.state();
        let tx = state.record_tx(&self.name);
        if let Some(htlc) = state.htlcs.get_mut(&contract.id) {
            htlc.redeemed = true;
            htlc.secret = Some(secret.clone());
        }
        Ok(tx)
    }

    async fn refund(&self, contract: &ContractRef, _sender: &str) -> SwapResult<String> {
        self.spendable(contract)?;
        check_refund(contract, self.clock.now())?;

        let mut state = self.state();
        if state.rejected_refunds > 0 {
            state.rejected_refunds -= 1;
            return Err(SwapError::Contract(
                "execution reverted: timelock not yet passed".to_string(),
            ));
        }
        let tx = state.record_tx(&self.name);
        if let Some(htlc) = state.htlcs.get_mut(&contract.id) {
            htlc.refunded = true;
        }
        Ok(tx)
    }

    async fn get_status(&self, contract: &ContractRef) -> SwapResult<ContractStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state();
            if state.failing_status_calls > 0 {
                state.failing_status_calls -= 1;
                return Err(SwapError::connection(&self.name, "injected outage"));
            }
        }
        Ok(self.status_of(contract))
    }

    fn validate_address(&self, address: &str) -> bool {
        !address.is_empty() && !address.contains(char::is_whitespace)
    }

    fn required_confirmations(&self) -> u64 {
        self.confirmations.load(Ordering::SeqCst)
    }

    async fn block_height(&self) -> SwapResult<u64> {
        Ok(self.state().height)
    }

    async fn transaction(&self, tx_hash: &str) -> SwapResult<TxObservation> {
        Ok(match self.state().txs.get(tx_hash) {
            Some(tx) => TxObservation::Included {
                block_height: tx.height,
            },
            None => TxObservation::NotFound,
        })
    }

    fn signer_address(&self) -> String {
        self.signer.clone()
    }
}
