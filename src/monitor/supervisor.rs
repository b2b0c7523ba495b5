//! Per-order supervision loop

use super::{MonitorContext, MonitorEntry};
use crate::chain::{ChainAdapter, ContractStatus, TrackHandle, TransactionStatus};
use crate::config::MonitorConfig;
use crate::error::{SwapError, SwapResult};
use crate::events::MonitorEvent;
use crate::metrics;
use crate::order::machine::{self, Action, Applied, LegObservation, Observation, TxKind};
use crate::order::{Leg, Order, Phase};

use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

enum TickOutcome {
    Continue,
    Finished,
    Cancelled,
}

pub(super) struct Supervisor {
    order: Order,
    ctx: Arc<MonitorContext>,
    active: Arc<DashMap<Uuid, MonitorEntry>>,
    events: broadcast::Sender<MonitorEvent>,
    cancel: watch::Receiver<bool>,
    handles: HashMap<String, TrackHandle>,
    /// Block height at which an HTLC with no known funding tx was first seen
    first_seen: HashMap<Leg, u64>,
    backoff: ExponentialBackoff,
    /// Order has unsaved changes
    dirty: bool,
}

impl Supervisor {
    pub(super) fn new(
        order: Order,
        ctx: Arc<MonitorContext>,
        active: Arc<DashMap<Uuid, MonitorEntry>>,
        events: broadcast::Sender<MonitorEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let backoff = retry_policy(&ctx.config);
        Self {
            order,
            ctx,
            active,
            events,
            cancel,
            handles: HashMap::new(),
            first_seen: HashMap::new(),
            backoff,
            dirty: false,
        }
    }

    pub(super) async fn run(mut self) {
        let semaphore = self.ctx.semaphore.clone();
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.ok(),
            _ = self.cancel.changed() => None,
        };
        let Some(_permit) = permit else {
            debug!("Monitor for order {} stopped before starting", self.order.id);
            return;
        };

        metrics::monitor_started();
        info!(
            "Monitoring order {} ({} -> {}, phase {})",
            self.order.id, self.order.from_chain, self.order.to_chain, self.order.phase
        );

        let poll_interval = Duration::from_millis(self.ctx.config.poll_interval_ms);

        loop {
            if self.cancelled() {
                break;
            }

            let started = Instant::now();
            let delay = match self.tick().await {
                Ok(TickOutcome::Continue) => {
                    metrics::record_tick("ok", started.elapsed().as_secs_f64());
                    self.backoff.reset();
                    poll_interval
                }
                Ok(TickOutcome::Finished) | Ok(TickOutcome::Cancelled) => break,
                Err(e) if e.is_retryable() => {
                    metrics::record_tick("transient", started.elapsed().as_secs_f64());
                    let delay = self
                        .backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.ctx.config.retry_max_delay_ms));
                    warn!(
                        "Transient error monitoring order {}, retrying in {:?}: {}",
                        self.order.id, delay, e
                    );
                    delay.max(poll_interval)
                }
                Err(e) => {
                    metrics::record_tick("failed", started.elapsed().as_secs_f64());
                    self.fail(&e).await;
                    break;
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.changed() => break,
            }
        }

        self.shutdown().await;
        metrics::monitor_stopped();
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn tick(&mut self) -> SwapResult<TickOutcome> {
        if self.order.is_terminal() {
            self.finish().await?;
            return Ok(TickOutcome::Finished);
        }

        let src = self.ctx.adapters.get(self.order.src.chain())?;
        let dst = self.ctx.adapters.get(self.order.dst.chain())?;

        let observation = self.observe(&src, &dst).await?;
        if self.cancelled() {
            debug!("Order {} cancelled mid-tick, discarding results", self.order.id);
            return Ok(TickOutcome::Cancelled);
        }

        let now = self.ctx.clock.now();
        let decision = machine::evaluate(&self.order, &observation, now);
        let applied = machine::apply(&mut self.order, &decision, Utc::now())?;
        self.dirty |= applied.dirty;
        self.emit(&applied);

        if !self.order.is_terminal() {
            for action in &decision.actions {
                self.perform(*action, &src, &dst).await?;
            }
        }

        self.release_stale_handles().await;
        self.persist().await?;

        if self.order.is_terminal() {
            self.finish().await?;
            return Ok(TickOutcome::Finished);
        }
        Ok(TickOutcome::Continue)
    }

    async fn observe(
        &mut self,
        src: &Arc<dyn ChainAdapter>,
        dst: &Arc<dyn ChainAdapter>,
    ) -> SwapResult<Observation> {
        let timeout = self.call_timeout();
        let (src_status, dst_status) = tokio::try_join!(
            with_timeout(
                timeout,
                self.order.src.chain(),
                "get_status",
                src.get_status(&self.order.src.contract)
            ),
            with_timeout(
                timeout,
                self.order.dst.chain(),
                "get_status",
                dst.get_status(&self.order.dst.contract)
            ),
        )?;

        self.adopt_funding(Leg::Src, &src_status);
        self.adopt_funding(Leg::Dst, &dst_status);

        let mut src_obs = self.observe_leg(Leg::Src, src, src_status).await?;
        let mut dst_obs = self.observe_leg(Leg::Dst, dst, dst_status).await?;

        src_obs.can_redeem = may_spend(src, &self.order.src.contract.params.receiver);
        src_obs.can_refund = may_spend(src, &self.order.src.contract.params.sender);
        dst_obs.can_redeem = may_spend(dst, &self.order.dst.contract.params.receiver);
        dst_obs.can_refund = may_spend(dst, &self.order.dst.contract.params.sender);

        Ok(Observation {
            src: src_obs,
            dst: dst_obs,
        })
    }

    /// Record a funding transaction the chain reports but the order lacks
    fn adopt_funding(&mut self, leg: Leg, status: &ContractStatus) {
        let swap_leg = self.order.leg_mut(leg);
        if let (None, Some(tx)) = (&swap_leg.funding_tx, &status.funding_tx) {
            debug!("Discovered {} funding tx {}", leg, tx);
            swap_leg.funding_tx = Some(tx.clone());
            self.dirty = true;
        }
    }

    async fn observe_leg(
        &mut self,
        leg: Leg,
        adapter: &Arc<dyn ChainAdapter>,
        status: ContractStatus,
    ) -> SwapResult<LegObservation> {
        let swap_leg = self.order.leg(leg).clone();
        let chain = swap_leg.chain();

        let visible_for_depth = match (status.exists, &swap_leg.funding_tx) {
            (false, _) => {
                self.first_seen.remove(&leg);
                false
            }
            (true, None) => self.visible_for_depth(leg, adapter).await?,
            (true, Some(_)) => false,
        };

        Ok(LegObservation {
            status,
            funding: self.tx_status(chain, swap_leg.funding_tx.as_deref()).await?,
            redeem: self.tx_status(chain, swap_leg.redeem_tx.as_deref()).await?,
            refund: self.tx_status(chain, swap_leg.refund_tx.as_deref()).await?,
            visible_for_depth,
            can_redeem: false,
            can_refund: false,
        })
    }

    /// Count confirmations for an HTLC whose funding tx the chain does not
    /// expose, starting from the first height it was seen at
    async fn visible_for_depth(
        &mut self,
        leg: Leg,
        adapter: &Arc<dyn ChainAdapter>,
    ) -> SwapResult<bool> {
        let chain = adapter.chain();
        let height =
            with_timeout(self.call_timeout(), &chain, "block_height", adapter.block_height())
                .await?;
        let first_seen = *self.first_seen.entry(leg).or_insert(height);
        let depth = height.saturating_sub(first_seen) + 1;
        debug!(
            "Order {} {} HTLC visible for {} of {} blocks",
            self.order.id,
            leg,
            depth,
            adapter.required_confirmations()
        );
        Ok(depth >= adapter.required_confirmations())
    }

    async fn tx_status(
        &mut self,
        chain: &str,
        tx_hash: Option<&str>,
    ) -> SwapResult<Option<TransactionStatus>> {
        let Some(tx_hash) = tx_hash else {
            return Ok(None);
        };

        let handle = match self.handles.get(tx_hash) {
            Some(handle) => *handle,
            None => {
                let handle = self.ctx.tracker.track(tx_hash, chain).await;
                self.handles.insert(tx_hash.to_string(), handle);
                handle
            }
        };

        let status = with_timeout(
            self.call_timeout(),
            chain,
            "transaction",
            self.ctx.tracker.status(handle),
        )
        .await?;
        Ok(Some(status))
    }

    async fn perform(
        &mut self,
        action: Action,
        src: &Arc<dyn ChainAdapter>,
        dst: &Arc<dyn ChainAdapter>,
    ) -> SwapResult<()> {
        let timeout = self.call_timeout();

        let (leg, kind, result) = match action {
            Action::FundDestination => {
                let contract = self.order.dst.contract.clone();
                info!(
                    "Funding destination HTLC {} on {} for order {}",
                    contract.id, contract.chain, self.order.id
                );
                let result = with_timeout(
                    timeout,
                    &contract.chain,
                    "fund",
                    dst.fund(&contract, contract.params.amount),
                )
                .await;
                (Leg::Dst, TxKind::Funding, result)
            }
            Action::RedeemSource => {
                let Some(secret) = self.order.secret.clone() else {
                    return Err(SwapError::Internal(
                        "Source redemption without a revealed secret".to_string(),
                    ));
                };
                let contract = self.order.src.contract.clone();
                info!(
                    "Redeeming source HTLC {} on {} for order {}",
                    contract.id, contract.chain, self.order.id
                );
                let result = with_retries(&self.ctx.config, &contract.chain, "redeem", || {
                    with_timeout(
                        timeout,
                        &contract.chain,
                        "redeem",
                        src.redeem(&contract, &secret, &contract.params.receiver),
                    )
                })
                .await;
                if result.is_ok() {
                    metrics::record_redemption(&contract.chain);
                }
                (Leg::Src, TxKind::Redeem, result)
            }
            Action::Refund(leg) => {
                let adapter = match leg {
                    Leg::Src => src,
                    Leg::Dst => dst,
                };
                let contract = self.order.leg(leg).contract.clone();
                info!(
                    "Refunding {} HTLC {} on {} for order {}",
                    leg, contract.id, contract.chain, self.order.id
                );
                let result = with_timeout(
                    timeout,
                    &contract.chain,
                    "refund",
                    adapter.refund(&contract, &contract.params.sender),
                )
                .await;
                if result.is_ok() {
                    metrics::record_refund(&contract.chain);
                }
                (leg, TxKind::Refund, result)
            }
        };

        match result {
            Ok(tx_hash) => {
                info!("Order {} {} {:?} tx {}", self.order.id, leg, kind, tx_hash);
                machine::record_tx(&mut self.order, leg, kind, tx_hash, Utc::now());
                self.dirty = true;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "{:?} on {} leg of order {} failed, retrying next tick: {}",
                    action, leg, self.order.id, e
                );
                Ok(())
            }
            // Someone else settled the HTLC first; the next status read shows it
            Err(SwapError::AlreadyRedeemed) | Err(SwapError::AlreadyRefunded) => {
                info!(
                    "{:?} skipped for order {}: {} leg already settled",
                    action, self.order.id, leg
                );
                Ok(())
            }
            // The source leg still expires into a refund without the destination
            Err(e) if kind == TxKind::Funding => {
                error!(
                    "Funding destination of order {} failed, auto-funding disabled: {}",
                    self.order.id, e
                );
                self.order.auto_fund_dst = false;
                self.order.error = Some(e.to_string());
                self.dirty = true;
                Ok(())
            }
            // A rejected spend leaves the leg open; the next tick decides again
            // from fresh chain state, e.g. once block time passes the lock
            Err(e) => {
                warn!(
                    "{:?} on {} leg of order {} rejected, re-evaluating next tick: {}",
                    action, leg, self.order.id, e
                );
                Ok(())
            }
        }
    }

    fn emit(&self, applied: &Applied) {
        let mut last_progress = None;
        for phase in &applied.phases {
            metrics::record_phase(*phase);
            info!("Order {} -> {}", self.order.id, phase);
            let progress = phase.progress().unwrap_or(self.order.progress);
            last_progress = Some(progress);
            self.send(MonitorEvent::StatusUpdate {
                order_id: self.order.id,
                status: *phase,
                progress,
                timestamp: Utc::now(),
            });
        }

        if applied.progress_changed && last_progress != Some(self.order.progress) {
            self.send(MonitorEvent::status_update(&self.order, self.order.phase));
        }

        if self.order.phase == Phase::Failed {
            if let Some(reason) = &self.order.error {
                error!("Order {} failed: {}", self.order.id, reason);
                self.send(MonitorEvent::error(&self.order, reason.clone()));
            }
        }
    }

    fn send(&self, event: MonitorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn persist(&mut self) -> SwapResult<()> {
        if self.dirty {
            self.ctx.store.save(&self.order).await?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Move the order to `failed` after a non-retryable error
    async fn fail(&mut self, cause: &SwapError) {
        if self.order.is_terminal() {
            return;
        }
        if cause.is_protocol_violation() {
            warn!("Order {} broke the HTLC protocol: {}", self.order.id, cause);
        }

        if let Err(e) = self.order.fail(cause.to_string(), Utc::now()) {
            error!("Cannot fail order {}: {}", self.order.id, e);
            return;
        }
        self.dirty = true;
        self.emit(&Applied {
            phases: vec![Phase::Failed],
            progress_changed: false,
            dirty: true,
        });
        if let Err(e) = self.finish().await {
            error!("Cannot persist failed order {}: {}", self.order.id, e);
        }
    }

    async fn finish(&mut self) -> SwapResult<()> {
        self.persist().await?;
        info!(
            "Order {} finished in phase {} (progress {})",
            self.order.id, self.order.phase, self.order.progress
        );
        self.send(MonitorEvent::completed(&self.order));
        Ok(())
    }

    async fn release_stale_handles(&mut self) {
        let live: Vec<String> = self
            .order
            .src
            .tracked_txs()
            .chain(self.order.dst.tracked_txs())
            .map(str::to_string)
            .collect();

        let stale: Vec<String> = self
            .handles
            .keys()
            .filter(|hash| !live.contains(hash))
            .cloned()
            .collect();
        for hash in stale {
            if let Some(handle) = self.handles.remove(&hash) {
                self.ctx.tracker.release(handle).await;
            }
        }
    }

    async fn shutdown(&mut self) {
        for (_, handle) in self.handles.drain() {
            self.ctx.tracker.release(handle).await;
        }
        let events = &self.events;
        self.active
            .remove_if(&self.order.id, |_, entry| entry.subscription.owns(events));
        debug!("Monitor for order {} exited", self.order.id);
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.ctx.config.call_timeout_ms)
    }
}

/// Whether the adapter's key can submit a spend that pays `party`
fn may_spend(adapter: &Arc<dyn ChainAdapter>, party: &str) -> bool {
    adapter.permissionless_spends() || adapter.signer_address() == party
}

/// Bound an adapter call; a timeout is a transient failure
async fn with_timeout<T>(
    timeout: Duration,
    chain: &str,
    operation: &str,
    call: impl Future<Output = SwapResult<T>>,
) -> SwapResult<T> {
    let result = match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SwapError::Timeout {
            operation: format!("{} on {}", operation, chain),
        }),
    };
    if let Err(e) = &result {
        metrics::record_adapter_error(chain, e);
    }
    result
}

pub(super) fn retry_policy(config: &MonitorConfig) -> ExponentialBackoff {
    let initial = Duration::from_millis(config.retry_base_delay_ms);
    ExponentialBackoff {
        initial_interval: initial,
        current_interval: initial,
        max_interval: Duration::from_millis(config.retry_max_delay_ms),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Retry transient failures with exponential backoff, up to `max_retries`
async fn with_retries<T, F, Fut>(
    config: &MonitorConfig,
    chain: &str,
    operation: &str,
    mut call: F,
) -> SwapResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SwapResult<T>>,
{
    let mut backoff = retry_policy(config);
    let mut attempts = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                attempts += 1;
                if attempts > config.max_retries {
                    warn!(
                        "{} on {} failed after {} attempts, giving up: {}",
                        operation, chain, attempts, e
                    );
                    return Err(e);
                }
                match backoff.next_backoff() {
                    Some(delay) => {
                        warn!(
                            "{} on {} failed, attempt {}/{}, retrying in {:?}: {}",
                            operation, chain, attempts, config.max_retries, delay, e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            max_retries: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let result = with_retries(&fast_config(), "alpha", "redeem", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SwapError::connection("alpha", "reset"))
            } else {
                Ok("0xabc")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "0xabc");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: SwapResult<()> = with_retries(&fast_config(), "alpha", "redeem", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SwapError::RateLimited {
                chain: "alpha".into(),
            })
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_protocol_violations_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: SwapResult<()> = with_retries(&fast_config(), "alpha", "redeem", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SwapError::HashMismatch)
        })
        .await;

        assert!(matches!(result, Err(SwapError::HashMismatch)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_calls_time_out_as_transient() {
        let result: SwapResult<()> = with_timeout(Duration::from_millis(5), "alpha", "get_status", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SwapError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
