//! Transaction confirmation tracking across chain families
//!
//! Each chain has its own finality depth (see `ChainAdapter::required_confirmations`):
//! - EVM: 12 blocks by default
//! - Tron: 19 blocks (solidified)
//! - Bitcoin: 6 blocks
//! - TON: 1 masterchain block
//!
//! Confirmations are `tip - inclusion_height + 1`. A transaction stops being
//! polled once it is confirmed or failed; the settled status stays cached for
//! its handle until released.

use crate::chain::{AdapterRegistry, TxObservation};
use crate::error::{SwapError, SwapResult};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Polls after which a transaction that was never seen counts as dropped
pub const DEFAULT_MAX_UNSEEN_POLLS: u32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TrackHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatus {
    pub hash: String,
    pub chain: String,
    pub confirmations: u64,
    pub required_confirmations: u64,
    pub status: TxState,
}

impl TransactionStatus {
    pub fn is_confirmed(&self) -> bool {
        self.status == TxState::Confirmed
    }

    pub fn is_failed(&self) -> bool {
        self.status == TxState::Failed
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    hash: String,
    chain: String,
    /// Observed on-chain or in the mempool at least once
    seen: bool,
    unseen_polls: u32,
}

/// Tracks confirmations for funding, redeem and refund transactions
pub struct ConfirmationTracker {
    adapters: Arc<AdapterRegistry>,
    next_handle: AtomicU64,
    max_unseen_polls: u32,
    /// Transactions still being polled
    pending: RwLock<HashMap<TrackHandle, Tracked>>,
    /// Confirmed or failed transactions (no further polling)
    settled: RwLock<HashMap<TrackHandle, TransactionStatus>>,
}

impl ConfirmationTracker {
    pub fn new(adapters: Arc<AdapterRegistry>) -> Self {
        Self::with_max_unseen_polls(adapters, DEFAULT_MAX_UNSEEN_POLLS)
    }

    pub fn with_max_unseen_polls(adapters: Arc<AdapterRegistry>, max_unseen_polls: u32) -> Self {
        Self {
            adapters,
            next_handle: AtomicU64::new(1),
            max_unseen_polls,
            pending: RwLock::new(HashMap::new()),
            settled: RwLock::new(HashMap::new()),
        }
    }

    /// Begin tracking a transaction
    pub async fn track(&self, tx_hash: &str, chain: &str) -> TrackHandle {
        let handle = TrackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.pending.write().await.insert(
            handle,
            Tracked {
                hash: tx_hash.to_string(),
                chain: chain.to_string(),
                seen: false,
                unseen_polls: 0,
            },
        );
        debug!("Tracking tx {} on chain {}", tx_hash, chain);
        handle
    }

    /// Refresh and return the status of a tracked transaction
    pub async fn status(&self, handle: TrackHandle) -> SwapResult<TransactionStatus> {
        if let Some(settled) = self.settled.read().await.get(&handle) {
            return Ok(settled.clone());
        }

        let tracked = self
            .pending
            .read()
            .await
            .get(&handle)
            .cloned()
            .ok_or_else(|| SwapError::Internal(format!("Unknown track handle {:?}", handle)))?;

        let adapter = self.adapters.get(&tracked.chain)?;
        let required = adapter.required_confirmations();
        let observation = adapter.transaction(&tracked.hash).await?;

        let mut seen = tracked.seen;
        let mut unseen_polls = tracked.unseen_polls;
        let (state, confirmations) = match observation {
            TxObservation::NotFound if tracked.seen => {
                warn!(
                    "Transaction {} disappeared from chain {}",
                    tracked.hash, tracked.chain
                );
                (TxState::Failed, 0)
            }
            TxObservation::NotFound => {
                unseen_polls += 1;
                if unseen_polls > self.max_unseen_polls {
                    warn!(
                        "Transaction {} never appeared on chain {} after {} polls",
                        tracked.hash, tracked.chain, unseen_polls
                    );
                    (TxState::Failed, 0)
                } else {
                    (TxState::Pending, 0)
                }
            }
            TxObservation::Pending => {
                seen = true;
                (TxState::Pending, 0)
            }
            TxObservation::Included { block_height } => {
                seen = true;
                let tip = adapter.block_height().await?;
                let confirmations = if tip >= block_height {
                    tip - block_height + 1
                } else {
                    0
                };
                if confirmations >= required {
                    (TxState::Confirmed, confirmations)
                } else {
                    (TxState::Pending, confirmations)
                }
            }
            TxObservation::Failed => (TxState::Failed, 0),
        };

        let status = TransactionStatus {
            hash: tracked.hash.clone(),
            chain: tracked.chain.clone(),
            confirmations,
            required_confirmations: required,
            status: state,
        };

        let mut pending = self.pending.write().await;
        // Released while the adapter call was in flight
        let Some(entry) = pending.get_mut(&handle) else {
            return Ok(status);
        };

        if state == TxState::Pending {
            entry.seen = seen;
            entry.unseen_polls = unseen_polls;
            debug!(
                "Transaction {} has {} / {} confirmations on chain {}",
                status.hash, confirmations, required, status.chain
            );
        } else {
            pending.remove(&handle);
            drop(pending);
            if state == TxState::Confirmed {
                info!(
                    "Transaction {} confirmed on chain {} ({} confirmations)",
                    status.hash, status.chain, confirmations
                );
            }
            self.settled.write().await.insert(handle, status.clone());
        }

        Ok(status)
    }

    /// Stop tracking and drop any cached status
    pub async fn release(&self, handle: TrackHandle) {
        self.pending.write().await.remove(&handle);
        self.settled.write().await.remove(&handle);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Trim the settled cache (call periodically)
    pub async fn cleanup_cache(&self, max_entries: usize) {
        let mut settled = self.settled.write().await;
        if settled.len() > max_entries {
            // Oldest handles first
            let mut handles: Vec<TrackHandle> = settled.keys().copied().collect();
            handles.sort_by_key(|h| h.0);
            let excess = settled.len() - max_entries;
            for handle in handles.into_iter().take(excess) {
                settled.remove(&handle);
            }
        }
    }
}
