//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent orders on one chain do not collide
//! - Nonce release when a submission fails before reaching the mempool
//! - Resync against the node after gaps

use crate::error::{SwapError, SwapResult};

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Nonce state for one signer on one chain
#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out, `None` until initialized from the node
    current: Option<u64>,
    /// Submitted transactions: nonce -> tx_hash
    pending: HashMap<u64, String>,
}

/// Allocates nonces for a single signer
pub struct NonceManager {
    chain: String,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            state: Mutex::new(NonceState::default()),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.current.is_some()
    }

    /// Seed from the node's pending transaction count
    pub async fn init(&self, on_chain_nonce: u64) {
        let mut state = self.state.lock().await;
        if state.current.is_none() {
            state.current = Some(on_chain_nonce);
            debug!("Initialized nonce for chain {}: {}", self.chain, on_chain_nonce);
        }
    }

    /// Get the next nonce
    pub async fn next(&self) -> SwapResult<u64> {
        let mut state = self.state.lock().await;
        let nonce = state.current.ok_or_else(|| {
            SwapError::Internal(format!("Nonce for chain {} not initialized", self.chain))
        })?;
        state.current = Some(nonce + 1);

        debug!("Allocated nonce {} for chain {}", nonce, self.chain);
        Ok(nonce)
    }

    /// Mark a nonce as pending with transaction hash
    pub async fn mark_pending(&self, nonce: u64, tx_hash: &str) {
        self.state
            .lock()
            .await
            .pending
            .insert(nonce, tx_hash.to_string());
    }

    /// Release a nonce whose transaction never reached the node
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed out again
        if state.current == Some(nonce + 1) {
            state.current = Some(nonce);
        }
    }

    /// Sync with on-chain state
    pub async fn sync(&self, on_chain_nonce: u64) {
        let mut state = self.state.lock().await;

        if let Some(current) = state.current {
            if on_chain_nonce > current {
                warn!(
                    "Nonce gap detected on chain {}: local {}, node {}",
                    self.chain, current, on_chain_nonce
                );
            }
        }

        state.pending.retain(|nonce, _| *nonce >= on_chain_nonce);

        let current = state.current.unwrap_or(on_chain_nonce).max(on_chain_nonce);
        state.current = Some(current);
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
