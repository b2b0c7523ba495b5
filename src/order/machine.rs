//! Order state machine
//!
//! `evaluate` is pure: it looks at the order and what the chains currently
//! report and decides which phases to pass through and which actions the
//! monitor has to perform. `apply` commits the phase changes to the order.

use crate::chain::{ContractStatus, TransactionStatus};
use crate::error::SwapResult;
use crate::order::{Leg, Order, Phase, SwapLeg, REVEALED_PROGRESS};
use crate::secret::{verify_reveal, Secret};

use chrono::{DateTime, Utc};

/// What the chains report for one leg during a tick
#[derive(Debug, Clone, Default)]
pub struct LegObservation {
    pub status: ContractStatus,
    pub funding: Option<TransactionStatus>,
    pub redeem: Option<TransactionStatus>,
    pub refund: Option<TransactionStatus>,
    /// The HTLC has been visible for the chain's finality depth. Only
    /// consulted when the funding transaction is unknown.
    pub visible_for_depth: bool,
    /// The service key may submit a redeem for this leg
    pub can_redeem: bool,
    /// The service key may submit a refund for this leg
    pub can_refund: bool,
}

impl LegObservation {
    /// HTLC exists and its funding is final, judged by the funding
    /// transaction when known and by how long the HTLC has been visible otherwise
    fn funded(&self) -> bool {
        self.status.exists
            && match &self.funding {
                Some(funding) => funding.is_confirmed(),
                None => self.visible_for_depth,
            }
    }

    fn redeem_settled(&self) -> bool {
        self.status.redeemed
            && self
                .redeem
                .as_ref()
                .map_or(true, TransactionStatus::is_confirmed)
    }

    fn refund_settled(&self) -> bool {
        self.status.refunded
            && self
                .refund
                .as_ref()
                .map_or(true, TransactionStatus::is_confirmed)
    }

    fn open(&self) -> bool {
        self.status.exists && !self.status.redeemed && !self.status.refunded
    }
}

#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub src: LegObservation,
    pub dst: LegObservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Funding,
    Redeem,
    Refund,
}

/// Side effects the monitor performs after a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    FundDestination,
    RedeemSource,
    Refund(Leg),
}

#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub transitions: Vec<Phase>,
    pub progress: Option<u8>,
    /// Secret newly revealed on the destination chain
    pub reveal: Option<Secret>,
    /// Transactions that failed or did not take effect, to be resent
    pub clear: Vec<(Leg, TxKind)>,
    pub actions: Vec<Action>,
    pub failure: Option<String>,
}

impl Decision {
    fn clears(&self, leg: Leg, kind: TxKind) -> bool {
        self.clear.contains(&(leg, kind))
    }

    /// A transaction of `kind` is recorded and stays recorded
    fn in_flight(&self, swap_leg: &SwapLeg, leg: Leg, kind: TxKind) -> bool {
        let recorded = match kind {
            TxKind::Funding => swap_leg.funding_tx.is_some(),
            TxKind::Redeem => swap_leg.redeem_tx.is_some(),
            TxKind::Refund => swap_leg.refund_tx.is_some(),
        };
        recorded && !self.clears(leg, kind)
    }
}

/// Result of applying a decision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub phases: Vec<Phase>,
    pub progress_changed: bool,
    /// Anything about the order changed and must be persisted
    pub dirty: bool,
}

pub fn evaluate(order: &Order, obs: &Observation, now: u64) -> Decision {
    let mut decision = Decision::default();
    let Some(current) = order.phase.rank().filter(|_| !order.is_terminal()) else {
        return decision;
    };

    for (leg, o) in [(Leg::Src, &obs.src), (Leg::Dst, &obs.dst)] {
        if o.funding.as_ref().is_some_and(TransactionStatus::is_failed) {
            decision.clear.push((leg, TxKind::Funding));
        }
        if o
            .redeem
            .as_ref()
            .is_some_and(|t| t.is_failed() || (t.is_confirmed() && !o.status.redeemed))
        {
            decision.clear.push((leg, TxKind::Redeem));
        }
        if o
            .refund
            .as_ref()
            .is_some_and(|t| t.is_failed() || (t.is_confirmed() && !o.status.refunded))
        {
            decision.clear.push((leg, TxKind::Refund));
        }
    }

    let secret = match (&order.secret, &obs.dst.status.revealed_secret) {
        (Some(known), _) => Some(known.clone()),
        (None, Some(revealed)) if verify_reveal(revealed, &order.hash_lock) => {
            decision.reveal = Some(revealed.clone());
            Some(revealed.clone())
        }
        (None, Some(_)) => {
            decision.failure =
                Some("Secret revealed on the destination chain does not match the hash lock".into());
            return decision;
        }
        (None, None) => None,
    };
    let revealed = secret.is_some();

    // Highest success-path phase the chains support; each rung needs the previous
    let src_funded = obs.src.funded() || obs.src.status.redeemed;
    let dst_created = src_funded && (obs.dst.status.exists || revealed);
    let dst_funded = dst_created && (obs.dst.funded() || revealed);
    let completed = dst_funded && revealed && obs.src.redeem_settled();
    let target = [src_funded, dst_created, dst_funded, completed]
        .iter()
        .take_while(|reached| **reached)
        .count() as u8;

    for rank in current + 1..=target {
        if let Some(phase) = Phase::from_rank(rank) {
            decision.transitions.push(phase);
        }
    }
    if completed {
        return decision;
    }
    if revealed && target >= 3 && order.progress < REVEALED_PROGRESS {
        decision.progress = Some(REVEALED_PROGRESS);
    }

    if obs.src.refund_settled() {
        decision.transitions.push(Phase::RefundedSrc);
        return decision;
    }
    let src_never_funded = current == 0 && !src_funded && !obs.src.status.exists;
    if obs.dst.refund_settled() && src_never_funded {
        decision.transitions.push(Phase::RefundedDst);
        return decision;
    }

    let src_lock = order.src.time_lock();
    let dst_lock = order.dst.time_lock();

    if now > dst_lock
        && obs.dst.open()
        && obs.dst.can_refund
        && !decision.in_flight(&order.dst, Leg::Dst, TxKind::Refund)
    {
        decision.actions.push(Action::Refund(Leg::Dst));
    }

    if now > src_lock && src_never_funded && !obs.dst.open() {
        decision.failure = Some("Source leg expired before it was funded".into());
        return decision;
    }

    if now > src_lock
        && obs.src.open()
        && obs.src.can_refund
        && !decision.in_flight(&order.src, Leg::Src, TxKind::Refund)
    {
        decision.actions.push(Action::Refund(Leg::Src));
    }

    if revealed
        && now <= src_lock
        && obs.src.open()
        && obs.src.can_redeem
        && !decision.in_flight(&order.src, Leg::Src, TxKind::Redeem)
    {
        decision.actions.push(Action::RedeemSource);
    }

    if order.auto_fund_dst
        && !revealed
        && src_funded
        && now < dst_lock
        && !obs.dst.status.exists
        && !decision.in_flight(&order.dst, Leg::Dst, TxKind::Funding)
    {
        decision.actions.push(Action::FundDestination);
    }

    decision
}

/// Commit a decision's state changes. Actions are left to the caller.
pub fn apply(order: &mut Order, decision: &Decision, at: DateTime<Utc>) -> SwapResult<Applied> {
    let mut applied = Applied::default();

    for (leg, kind) in &decision.clear {
        let swap_leg = order.leg_mut(*leg);
        let slot = match kind {
            TxKind::Funding => &mut swap_leg.funding_tx,
            TxKind::Redeem => &mut swap_leg.redeem_tx,
            TxKind::Refund => &mut swap_leg.refund_tx,
        };
        if slot.take().is_some() {
            applied.dirty = true;
        }
    }

    if let Some(secret) = &decision.reveal {
        order.secret = Some(secret.clone());
        applied.dirty = true;
    }

    for phase in &decision.transitions {
        order.advance(*phase, at)?;
        applied.phases.push(*phase);
    }

    if let Some(progress) = decision.progress {
        applied.progress_changed = order.raise_progress(progress);
    }
    if !applied.phases.is_empty() {
        applied.progress_changed = true;
    }

    if let Some(reason) = &decision.failure {
        order.fail(reason.clone(), at)?;
        applied.phases.push(Phase::Failed);
    }

    applied.dirty |= !applied.phases.is_empty() || applied.progress_changed;
    if applied.dirty {
        order.updated_at = at;
    }
    Ok(applied)
}

/// Record a transaction sent by the monitor
pub fn record_tx(order: &mut Order, leg: Leg, kind: TxKind, tx_hash: String, at: DateTime<Utc>) {
    let swap_leg = order.leg_mut(leg);
    let slot = match kind {
        TxKind::Funding => &mut swap_leg.funding_tx,
        TxKind::Redeem => &mut swap_leg.redeem_tx,
        TxKind::Refund => &mut swap_leg.refund_tx,
    };
    *slot = Some(tx_hash);
    order.updated_at = at;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxState;
    use crate::order::tests::sample_order;
    use crate::secret::generate_secret;

    const SRC_LOCK: u64 = 2_000;
    const DST_LOCK: u64 = 1_000;

    fn tx(status: TxState) -> Option<TransactionStatus> {
        Some(TransactionStatus {
            hash: "0x1".into(),
            chain: "alpha".into(),
            confirmations: if status == TxState::Confirmed { 12 } else { 0 },
            required_confirmations: 12,
            status,
        })
    }

    fn funded(confirmed: bool) -> LegObservation {
        LegObservation {
            status: ContractStatus {
                exists: true,
                ..Default::default()
            },
            funding: tx(if confirmed {
                TxState::Confirmed
            } else {
                TxState::Pending
            }),
            can_redeem: true,
            can_refund: true,
            ..Default::default()
        }
    }

    fn empty() -> LegObservation {
        LegObservation {
            can_redeem: true,
            can_refund: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_src_funding_needs_confirmations() {
        let order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);

        let obs = Observation { src: funded(false), dst: empty() };
        assert!(evaluate(&order, &obs, 10).transitions.is_empty());

        let obs = Observation { src: funded(true), dst: empty() };
        let decision = evaluate(&order, &obs, 10);
        assert_eq!(decision.transitions, vec![Phase::SrcFunded]);
        assert_eq!(decision.actions, vec![Action::FundDestination]);
    }

    #[test]
    fn test_unknown_funding_tx_waits_for_depth() {
        let order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);
        let mut src = LegObservation {
            status: ContractStatus {
                exists: true,
                ..Default::default()
            },
            ..empty()
        };

        let decision = evaluate(&order, &Observation { src: src.clone(), dst: empty() }, 10);
        assert!(decision.transitions.is_empty());
        assert!(decision.actions.is_empty());

        src.visible_for_depth = true;
        let decision = evaluate(&order, &Observation { src, dst: empty() }, 10);
        assert_eq!(decision.transitions, vec![Phase::SrcFunded]);
        assert_eq!(decision.actions, vec![Action::FundDestination]);
    }

    #[test]
    fn test_no_auto_funding_when_disabled() {
        let mut order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);
        order.auto_fund_dst = false;
        let obs = Observation { src: funded(true), dst: empty() };
        assert!(evaluate(&order, &obs, 10).actions.is_empty());
    }

    #[test]
    fn test_destination_funding_not_repeated_while_in_flight() {
        let mut order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);
        order.advance(Phase::SrcFunded, Utc::now()).unwrap();
        order.dst.funding_tx = Some("0xfund".into());

        let obs = Observation {
            src: funded(true),
            dst: LegObservation {
                funding: tx(TxState::Pending),
                ..empty()
            },
        };
        assert!(evaluate(&order, &obs, 10).actions.is_empty());

        // A failed funding transaction is cleared and resent
        let obs = Observation {
            src: funded(true),
            dst: LegObservation {
                funding: tx(TxState::Failed),
                ..empty()
            },
        };
        let decision = evaluate(&order, &obs, 10);
        assert_eq!(decision.clear, vec![(Leg::Dst, TxKind::Funding)]);
        assert_eq!(decision.actions, vec![Action::FundDestination]);
    }

    #[test]
    fn test_reveal_passes_through_intermediate_phases() {
        let secret = generate_secret();
        let mut order = sample_order(&secret, SRC_LOCK, DST_LOCK);
        order.advance(Phase::SrcFunded, Utc::now()).unwrap();

        let mut dst = funded(false);
        dst.status.redeemed = true;
        dst.status.revealed_secret = Some(secret.clone());
        let obs = Observation { src: funded(true), dst };

        let decision = evaluate(&order, &obs, 10);
        assert_eq!(
            decision.transitions,
            vec![Phase::DstCreated, Phase::DstFunded]
        );
        assert_eq!(decision.progress, Some(REVEALED_PROGRESS));
        assert_eq!(decision.actions, vec![Action::RedeemSource]);
        assert!(decision.reveal.is_some());

        let applied = apply(&mut order, &decision, Utc::now()).unwrap();
        assert_eq!(applied.phases, vec![Phase::DstCreated, Phase::DstFunded]);
        assert_eq!(order.progress, REVEALED_PROGRESS);
        assert_eq!(order.secret, Some(secret));
    }

    #[test]
    fn test_completion_requires_confirmed_source_redemption() {
        let secret = generate_secret();
        let mut order = sample_order(&secret, SRC_LOCK, DST_LOCK);
        for phase in [Phase::SrcFunded, Phase::DstCreated, Phase::DstFunded] {
            order.advance(phase, Utc::now()).unwrap();
        }
        order.secret = Some(secret.clone());
        order.src.redeem_tx = Some("0xredeem".into());

        let mut src = funded(true);
        src.status.redeemed = true;
        src.redeem = tx(TxState::Pending);
        let mut dst = funded(true);
        dst.status.redeemed = true;
        dst.status.revealed_secret = Some(secret);

        let obs = Observation { src: src.clone(), dst: dst.clone() };
        let decision = evaluate(&order, &obs, 10);
        assert!(decision.transitions.is_empty());
        assert!(decision.actions.is_empty());

        src.redeem = tx(TxState::Confirmed);
        let decision = evaluate(&order, &Observation { src, dst }, 10);
        assert_eq!(decision.transitions, vec![Phase::Completed]);
        apply(&mut order, &decision, Utc::now()).unwrap();
        assert_eq!(order.progress, 100);
    }

    #[test]
    fn test_wrong_secret_fails_order() {
        let mut order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);
        order.advance(Phase::SrcFunded, Utc::now()).unwrap();

        let mut dst = funded(true);
        dst.status.redeemed = true;
        dst.status.revealed_secret = Some(generate_secret());
        let decision = evaluate(&order, &Observation { src: funded(true), dst }, 10);
        assert!(decision.failure.is_some());

        let applied = apply(&mut order, &decision, Utc::now()).unwrap();
        assert_eq!(applied.phases, vec![Phase::Failed]);
        assert!(order.error.is_some());
    }

    #[test]
    fn test_timeouts_refund_each_leg() {
        let mut order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);
        for phase in [Phase::SrcFunded, Phase::DstCreated, Phase::DstFunded] {
            order.advance(phase, Utc::now()).unwrap();
        }
        let obs = Observation { src: funded(true), dst: funded(true) };

        assert!(evaluate(&order, &obs, DST_LOCK).actions.is_empty());
        assert_eq!(
            evaluate(&order, &obs, DST_LOCK + 1).actions,
            vec![Action::Refund(Leg::Dst)]
        );
        assert_eq!(
            evaluate(&order, &obs, SRC_LOCK + 1).actions,
            vec![Action::Refund(Leg::Dst), Action::Refund(Leg::Src)]
        );

        // No second refund while one is in flight
        order.src.refund_tx = Some("0xrefund".into());
        let mut src = funded(true);
        src.refund = tx(TxState::Pending);
        let obs = Observation { src, dst: funded(true) };
        assert_eq!(
            evaluate(&order, &obs, SRC_LOCK + 1).actions,
            vec![Action::Refund(Leg::Dst)]
        );
    }

    #[test]
    fn test_no_source_redemption_after_expiry() {
        let secret = generate_secret();
        let mut order = sample_order(&secret, SRC_LOCK, DST_LOCK);
        for phase in [Phase::SrcFunded, Phase::DstCreated, Phase::DstFunded] {
            order.advance(phase, Utc::now()).unwrap();
        }
        order.secret = Some(secret);
        let mut dst = funded(true);
        dst.status.redeemed = true;
        let obs = Observation { src: funded(true), dst };

        assert_eq!(evaluate(&order, &obs, SRC_LOCK).actions, vec![Action::RedeemSource]);
        assert_eq!(
            evaluate(&order, &obs, SRC_LOCK + 1).actions,
            vec![Action::Refund(Leg::Src)]
        );
    }

    #[test]
    fn test_source_refund_is_terminal() {
        let mut order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);
        order.advance(Phase::SrcFunded, Utc::now()).unwrap();
        order.raise_progress(55);

        let mut src = funded(true);
        src.status.refunded = true;
        let decision = evaluate(&order, &Observation { src, dst: empty() }, SRC_LOCK + 5);
        assert_eq!(decision.transitions, vec![Phase::RefundedSrc]);

        apply(&mut order, &decision, Utc::now()).unwrap();
        assert_eq!(order.phase, Phase::RefundedSrc);
        assert_eq!(order.progress, 55);
        assert!(order.error.is_none());
    }

    #[test]
    fn test_destination_refund_without_source() {
        let order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);

        let obs = Observation { src: empty(), dst: funded(true) };
        assert_eq!(
            evaluate(&order, &obs, DST_LOCK + 1).actions,
            vec![Action::Refund(Leg::Dst)]
        );

        let mut dst = funded(true);
        dst.status.refunded = true;
        let decision = evaluate(&order, &Observation { src: empty(), dst }, DST_LOCK + 1);
        assert_eq!(decision.transitions, vec![Phase::RefundedDst]);
    }

    #[test]
    fn test_unfunded_source_expiry_fails() {
        let order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);
        let obs = Observation { src: empty(), dst: empty() };
        assert!(evaluate(&order, &obs, SRC_LOCK).failure.is_none());
        assert!(evaluate(&order, &obs, SRC_LOCK + 1).failure.is_some());
    }

    #[test]
    fn test_ineffective_redeem_is_retried() {
        let secret = generate_secret();
        let mut order = sample_order(&secret, SRC_LOCK, DST_LOCK);
        for phase in [Phase::SrcFunded, Phase::DstCreated, Phase::DstFunded] {
            order.advance(phase, Utc::now()).unwrap();
        }
        order.secret = Some(secret);
        order.src.redeem_tx = Some("0xredeem".into());

        let mut src = funded(true);
        src.redeem = tx(TxState::Failed);
        let decision = evaluate(&order, &Observation { src, dst: funded(true) }, 10);
        assert_eq!(decision.clear, vec![(Leg::Src, TxKind::Redeem)]);
        assert_eq!(decision.actions, vec![Action::RedeemSource]);

        let applied = apply(&mut order, &decision, Utc::now()).unwrap();
        assert!(applied.dirty);
        assert!(order.src.redeem_tx.is_none());
    }

    #[test]
    fn test_terminal_orders_are_inert() {
        let mut order = sample_order(&generate_secret(), SRC_LOCK, DST_LOCK);
        order.fail("done", Utc::now()).unwrap();
        let decision = evaluate(&order, &Observation { src: funded(true), dst: empty() }, 10);
        assert!(decision.transitions.is_empty() && decision.actions.is_empty());
    }
}
