//! Swap orders: the aggregate owned by each order monitor
//!
//! This module provides:
//! - The `Order` record with its two HTLC legs
//! - Phases, progress and phase timestamps
//! - The pure state machine (`machine`)
//! - Order creation and status queries (`service`)

pub mod machine;
pub mod service;

use crate::chain::{amount_str, ContractRef};
use crate::error::{SwapError, SwapResult};
use crate::secret::{HashLock, Secret};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Order lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Created,
    SrcFunded,
    DstCreated,
    DstFunded,
    Completed,
    RefundedSrc,
    RefundedDst,
    Failed,
}

/// Progress once the secret is public and the source redemption is in flight
pub const REVEALED_PROGRESS: u8 = 90;

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::SrcFunded => "srcFunded",
            Phase::DstCreated => "dstCreated",
            Phase::DstFunded => "dstFunded",
            Phase::Completed => "completed",
            Phase::RefundedSrc => "refundedSrc",
            Phase::RefundedDst => "refundedDst",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::RefundedSrc | Phase::RefundedDst | Phase::Failed
        )
    }

    /// Position on the success path, `None` for alternate terminals
    pub fn rank(&self) -> Option<u8> {
        match self {
            Phase::Created => Some(0),
            Phase::SrcFunded => Some(1),
            Phase::DstCreated => Some(2),
            Phase::DstFunded => Some(3),
            Phase::Completed => Some(4),
            _ => None,
        }
    }

    /// Success-path phase at a given rank
    pub fn from_rank(rank: u8) -> Option<Phase> {
        match rank {
            0 => Some(Phase::Created),
            1 => Some(Phase::SrcFunded),
            2 => Some(Phase::DstCreated),
            3 => Some(Phase::DstFunded),
            4 => Some(Phase::Completed),
            _ => None,
        }
    }

    pub fn progress(&self) -> Option<u8> {
        match self {
            Phase::Created => Some(20),
            Phase::SrcFunded => Some(40),
            Phase::DstCreated => Some(60),
            Phase::DstFunded => Some(80),
            Phase::Completed => Some(100),
            _ => None,
        }
    }

    /// Success-path phases advance one step at a time; alternate terminals
    /// are reachable from any non-terminal phase
    pub fn can_transition_to(&self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to == from + 1,
            (_, None) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Phase::Created,
            "srcFunded" => Phase::SrcFunded,
            "dstCreated" => Phase::DstCreated,
            "dstFunded" => Phase::DstFunded,
            "completed" => Phase::Completed,
            "refundedSrc" => Phase::RefundedSrc,
            "refundedDst" => Phase::RefundedDst,
            "failed" => Phase::Failed,
            other => return Err(SwapError::Internal(format!("Unknown phase {}", other))),
        })
    }
}

/// Which side of the swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Src,
    Dst,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Leg::Src => "src",
            Leg::Dst => "dst",
        })
    }
}

/// One HTLC and the transactions sent against it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapLeg {
    pub contract: ContractRef,
    pub funding_tx: Option<String>,
    pub redeem_tx: Option<String>,
    pub refund_tx: Option<String>,
}

impl SwapLeg {
    pub fn new(contract: ContractRef) -> Self {
        Self {
            contract,
            funding_tx: None,
            redeem_tx: None,
            refund_tx: None,
        }
    }

    pub fn chain(&self) -> &str {
        &self.contract.chain
    }

    pub fn time_lock(&self) -> u64 {
        self.contract.params.time_lock
    }

    /// Transactions the tracker should follow for this leg
    pub fn tracked_txs(&self) -> impl Iterator<Item = &str> {
        [&self.funding_tx, &self.redeem_tx, &self.refund_tx]
            .into_iter()
            .filter_map(|tx| tx.as_deref())
    }
}

/// Funding transactions of both legs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHashes {
    pub src: Option<String>,
    pub dst: Option<String>,
}

/// When each success-path phase was reached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTimes {
    pub order_created: Option<DateTime<Utc>>,
    pub src_funded: Option<DateTime<Utc>>,
    pub dst_created: Option<DateTime<Utc>>,
    pub dst_funded: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl PhaseTimes {
    fn mark(&mut self, phase: Phase, at: DateTime<Utc>) {
        let slot = match phase {
            Phase::Created => &mut self.order_created,
            Phase::SrcFunded => &mut self.src_funded,
            Phase::DstCreated => &mut self.dst_created,
            Phase::DstFunded => &mut self.dst_funded,
            Phase::Completed => &mut self.completed,
            _ => return,
        };
        slot.get_or_insert(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub from_chain: String,
    pub to_chain: String,
    pub from_token: String,
    pub to_token: String,
    #[serde(with = "amount_str")]
    pub from_amount: u128,
    #[serde(with = "amount_str")]
    pub to_amount: u128,
    pub hash_lock: HashLock,
    /// Only set once revealed on-chain
    pub secret: Option<Secret>,
    pub src: SwapLeg,
    pub dst: SwapLeg,
    pub phase: Phase,
    pub progress: u8,
    pub phases: PhaseTimes,
    /// The service funds the destination leg itself
    pub auto_fund_dst: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Source timelock, unix seconds
    pub expires_at: u64,
    pub error: Option<String>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from_token: &str,
        to_token: &str,
        from_amount: u128,
        to_amount: u128,
        hash_lock: HashLock,
        src: ContractRef,
        dst: ContractRef,
        auto_fund_dst: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut phases = PhaseTimes::default();
        phases.mark(Phase::Created, now);

        Self {
            id: Uuid::new_v4(),
            from_chain: src.chain.clone(),
            to_chain: dst.chain.clone(),
            from_token: from_token.to_string(),
            to_token: to_token.to_string(),
            from_amount,
            to_amount,
            hash_lock,
            secret: None,
            expires_at: src.params.time_lock,
            src: SwapLeg::new(src),
            dst: SwapLeg::new(dst),
            phase: Phase::Created,
            progress: Phase::Created.progress().unwrap_or(0),
            phases,
            auto_fund_dst,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn leg(&self, leg: Leg) -> &SwapLeg {
        match leg {
            Leg::Src => &self.src,
            Leg::Dst => &self.dst,
        }
    }

    pub fn leg_mut(&mut self, leg: Leg) -> &mut SwapLeg {
        match leg {
            Leg::Src => &mut self.src,
            Leg::Dst => &mut self.dst,
        }
    }

    pub fn tx_hashes(&self) -> TxHashes {
        TxHashes {
            src: self.src.funding_tx.clone(),
            dst: self.dst.funding_tx.clone(),
        }
    }

    /// Move to `next`, keeping progress monotonic
    pub fn advance(&mut self, next: Phase, at: DateTime<Utc>) -> SwapResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(SwapError::InvalidStateTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.phase = next;
        self.phases.mark(next, at);
        if let Some(progress) = next.progress() {
            self.raise_progress(progress);
        }
        self.updated_at = at;
        Ok(())
    }

    /// Returns whether progress changed
    pub fn raise_progress(&mut self, progress: u8) -> bool {
        if progress > self.progress {
            self.progress = progress;
            true
        } else {
            false
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> SwapResult<()> {
        self.advance(Phase::Failed, at)?;
        self.error = Some(reason.into());
        Ok(())
    }
}

/// Body of a create-order request
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub from_chain: String,
    pub to_chain: String,
    pub from_token: String,
    pub to_token: String,
    #[serde(with = "amount_str")]
    pub amount: u128,
    /// Receives the destination funds
    pub recipient_address: String,
    /// Funds the source leg and receives it back on refund
    pub refund_address: String,
    pub src_timelock_secs: Option<u64>,
    pub dst_timelock_secs: Option<u64>,
}

/// Destination must expire strictly before the source, and in the future
pub fn validate_timelocks(src_time_lock: u64, dst_time_lock: u64, now: u64) -> SwapResult<()> {
    if dst_time_lock >= src_time_lock {
        return Err(SwapError::Validation(format!(
            "Destination timelock {} must be before source timelock {}",
            dst_time_lock, src_time_lock
        )));
    }
    if dst_time_lock <= now {
        return Err(SwapError::Validation(format!(
            "Destination timelock {} is already in the past",
            dst_time_lock
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::HtlcParams;
    use crate::secret::{generate_secret, hash};

    pub(crate) fn sample_order(secret: &Secret, src_lock: u64, dst_lock: u64) -> Order {
        let contract = |chain: &str, time_lock: u64, sender: &str, receiver: &str| ContractRef {
            chain: chain.to_string(),
            id: format!("0x{}", chain),
            params: HtlcParams {
                hash_lock: hash(secret),
                time_lock,
                sender: sender.to_string(),
                receiver: receiver.to_string(),
                amount: 1000,
                chain: chain.to_string(),
            },
            locator: None,
        };
        Order::new(
            "BTC",
            "ETH",
            1000,
            1000,
            hash(secret),
            contract("alpha", src_lock, "alice", "resolver"),
            contract("beta", dst_lock, "resolver", "bob"),
            true,
            Utc::now(),
        )
    }

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Created.can_transition_to(Phase::SrcFunded));
        assert!(!Phase::Created.can_transition_to(Phase::DstCreated));
        assert!(!Phase::DstFunded.can_transition_to(Phase::SrcFunded));
        assert!(Phase::DstCreated.can_transition_to(Phase::RefundedSrc));
        assert!(!Phase::Completed.can_transition_to(Phase::Failed));
        assert!(!Phase::Failed.can_transition_to(Phase::Created));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut order = sample_order(&generate_secret(), 200, 100);
        assert_eq!(order.progress, 20);

        order.advance(Phase::SrcFunded, Utc::now()).unwrap();
        assert_eq!(order.progress, 40);
        assert!(order.phases.src_funded.is_some());

        let err = order.advance(Phase::Created, Utc::now()).unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));

        order.raise_progress(REVEALED_PROGRESS);
        order.fail("boom", Utc::now()).unwrap();
        assert_eq!(order.progress, REVEALED_PROGRESS);
        assert_eq!(order.error.as_deref(), Some("boom"));
        assert!(order.is_terminal());
    }

    #[test]
    fn test_phase_wire_names() {
        for phase in [
            Phase::Created,
            Phase::SrcFunded,
            Phase::DstCreated,
            Phase::DstFunded,
            Phase::Completed,
            Phase::RefundedSrc,
            Phase::RefundedDst,
            Phase::Failed,
        ] {
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json, phase.as_str());
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
    }

    #[test]
    fn test_timelock_ordering() {
        assert!(validate_timelocks(200, 100, 50).is_ok());
        assert!(matches!(
            validate_timelocks(100, 200, 50),
            Err(SwapError::Validation(_))
        ));
        assert!(validate_timelocks(100, 100, 50).is_err());
        assert!(validate_timelocks(200, 100, 100).is_err());
    }

    #[test]
    fn test_order_round_trips_through_json() {
        let order = sample_order(&generate_secret(), 200, 100);
        let json = serde_json::to_string(&order).unwrap();
        assert!(json.contains("\"fromAmount\":\"1000\""));
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(back, order);
    }
}
