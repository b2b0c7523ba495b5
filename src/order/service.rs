//! Order creation and status queries

use crate::chain::{amount_str, AdapterRegistry, ContractRef, HtlcParams};
use crate::clock::Clock;
use crate::config::{find_pair, PairConfig, Settings, SwapConfig};
use crate::error::{SwapError, SwapResult};
use crate::metrics;
use crate::monitor::OrderMonitor;
use crate::order::{validate_timelocks, Order, OrderRequest, Phase, PhaseTimes, TxHashes};
use crate::secret::{generate_secret, hash, HashLock, Secret};
use crate::state::OrderStore;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Returned once to the order creator; the only place the secret appears
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub hash_lock: HashLock,
    pub secret: Secret,
    pub src_contract: ContractRef,
    pub dst_contract: ContractRef,
    pub src_time_lock: u64,
    pub dst_time_lock: u64,
    #[serde(with = "amount_str")]
    pub to_amount: u128,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusView {
    pub id: Uuid,
    pub status: Phase,
    pub progress: u8,
    pub from_token: String,
    pub to_token: String,
    #[serde(with = "amount_str")]
    pub from_amount: u128,
    #[serde(with = "amount_str")]
    pub to_amount: u128,
    pub tx_hashes: TxHashes,
    pub phases: PhaseTimes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Order> for OrderStatusView {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            status: order.phase,
            progress: order.progress,
            from_token: order.from_token.clone(),
            to_token: order.to_token.clone(),
            from_amount: order.from_amount,
            to_amount: order.to_amount,
            tx_hashes: order.tx_hashes(),
            phases: order.phases.clone(),
            error: order.error.clone(),
        }
    }
}

pub struct OrderService {
    swap: SwapConfig,
    pairs: Vec<PairConfig>,
    adapters: Arc<AdapterRegistry>,
    store: Arc<dyn OrderStore>,
    monitor: Arc<OrderMonitor>,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    pub fn new(
        settings: &Settings,
        adapters: Arc<AdapterRegistry>,
        store: Arc<dyn OrderStore>,
        monitor: Arc<OrderMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_config(
            settings.swap.clone(),
            settings.pairs.clone(),
            adapters,
            store,
            monitor,
            clock,
        )
    }

    pub fn with_config(
        swap: SwapConfig,
        pairs: Vec<PairConfig>,
        adapters: Arc<AdapterRegistry>,
        store: Arc<dyn OrderStore>,
        monitor: Arc<OrderMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            swap,
            pairs,
            adapters,
            store,
            monitor,
            clock,
        }
    }

    pub fn monitor(&self) -> &Arc<OrderMonitor> {
        &self.monitor
    }

    /// Validate, build both HTLCs, persist and start monitoring
    pub async fn create_order(&self, request: OrderRequest) -> SwapResult<CreatedOrder> {
        if request.from_chain == request.to_chain {
            return Err(SwapError::Validation(
                "Source and destination chains must differ".to_string(),
            ));
        }
        if request.amount == 0 {
            return Err(SwapError::Validation("Amount must be positive".to_string()));
        }

        let src = self.adapters.get(&request.from_chain)?;
        let dst = self.adapters.get(&request.to_chain)?;

        let pair = find_pair(
            &self.pairs,
            &request.from_chain,
            &request.from_token,
            &request.to_chain,
            &request.to_token,
        )
        .ok_or_else(|| SwapError::UnsupportedPair {
            from: format!("{}:{}", request.from_chain, request.from_token),
            to: format!("{}:{}", request.to_chain, request.to_token),
        })?;
        let to_amount = pair
            .quote(request.amount)
            .filter(|a| *a > 0)
            .ok_or_else(|| {
                SwapError::Validation(format!("Amount {} quotes to nothing", request.amount))
            })?;

        if !src.validate_address(&request.refund_address) {
            return Err(SwapError::InvalidAddress {
                chain: request.from_chain.clone(),
                address: request.refund_address.clone(),
            });
        }
        if !dst.validate_address(&request.recipient_address) {
            return Err(SwapError::InvalidAddress {
                chain: request.to_chain.clone(),
                address: request.recipient_address.clone(),
            });
        }

        let now = self.clock.now();
        let src_time_lock = lock_after(
            now,
            request.src_timelock_secs.unwrap_or(self.swap.src_timelock_secs),
        )?;
        let dst_time_lock = lock_after(
            now,
            request.dst_timelock_secs.unwrap_or(self.swap.dst_timelock_secs),
        )?;
        validate_timelocks(src_time_lock, dst_time_lock, now)?;

        let secret = generate_secret();
        let hash_lock = hash(&secret);

        let src_contract = src.create_htlc(&HtlcParams {
            hash_lock,
            time_lock: src_time_lock,
            sender: request.refund_address.clone(),
            receiver: src.signer_address(),
            amount: request.amount,
            chain: request.from_chain.clone(),
        })?;
        let dst_contract = dst.create_htlc(&HtlcParams {
            hash_lock,
            time_lock: dst_time_lock,
            sender: dst.signer_address(),
            receiver: request.recipient_address.clone(),
            amount: to_amount,
            chain: request.to_chain.clone(),
        })?;

        let order = Order::new(
            &request.from_token,
            &request.to_token,
            request.amount,
            to_amount,
            hash_lock,
            src_contract.clone(),
            dst_contract.clone(),
            self.swap.auto_fund_destination,
            Utc::now(),
        );
        self.store.save(&order).await?;
        metrics::record_order_created(&order.from_chain, &order.to_chain);

        info!(
            "Created order {}: {} {} on {} -> {} {} on {}",
            order.id,
            order.from_amount,
            order.from_token,
            order.from_chain,
            order.to_amount,
            order.to_token,
            order.to_chain
        );

        let order_id = order.id;
        self.monitor.start_monitoring(order);

        Ok(CreatedOrder {
            order_id,
            hash_lock,
            secret,
            src_contract,
            dst_contract,
            src_time_lock,
            dst_time_lock,
            to_amount,
        })
    }

    pub async fn order(&self, id: Uuid) -> SwapResult<Order> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SwapError::OrderNotFound {
                order_id: id.to_string(),
            })
    }

    pub async fn status(&self, id: Uuid) -> SwapResult<OrderStatusView> {
        Ok(OrderStatusView::from(&self.order(id).await?))
    }
}

fn lock_after(now: u64, secs: u64) -> SwapResult<u64> {
    now.checked_add(secs)
        .ok_or_else(|| SwapError::Validation(format!("Timelock of {} seconds is out of range", secs)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::testing::{InMemoryChain, ManualClock};
    use crate::config::MonitorConfig;
    use crate::secret::verify_reveal;
    use crate::state::MemoryOrderStore;
    use tokio_test::{assert_err, assert_ok};

    pub(crate) const START: u64 = 1_700_000_000;

    pub(crate) struct Harness {
        pub service: Arc<OrderService>,
        pub adapters: Arc<AdapterRegistry>,
        pub alpha: Arc<InMemoryChain>,
        pub beta: Arc<InMemoryChain>,
        pub clock: Arc<ManualClock>,
        pub store: Arc<MemoryOrderStore>,
    }

    pub(crate) fn request(amount: u128) -> OrderRequest {
        OrderRequest {
            from_chain: "alpha".into(),
            to_chain: "beta".into(),
            from_token: "AAA".into(),
            to_token: "BBB".into(),
            amount,
            recipient_address: "bob".into(),
            refund_address: "alice".into(),
            src_timelock_secs: None,
            dst_timelock_secs: None,
        }
    }

    pub(crate) fn harness(auto_fund: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(START));
        let alpha = Arc::new(InMemoryChain::new("alpha", clock.clone()));
        let beta = Arc::new(InMemoryChain::new("beta", clock.clone()));

        let adapters = Arc::new(AdapterRegistry::new());
        adapters.insert(alpha.clone());
        adapters.insert(beta.clone());

        let store = Arc::new(MemoryOrderStore::new());
        let config = MonitorConfig {
            poll_interval_ms: 10,
            call_timeout_ms: 1_000,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 20,
            ..Default::default()
        };
        let monitor = Arc::new(OrderMonitor::new(
            adapters.clone(),
            store.clone(),
            clock.clone(),
            config,
        ));

        let service = Arc::new(OrderService::with_config(
            SwapConfig {
                src_timelock_secs: 7_200,
                dst_timelock_secs: 3_600,
                auto_fund_destination: auto_fund,
            },
            vec![PairConfig {
                from_chain: "alpha".into(),
                from_token: "AAA".into(),
                to_chain: "beta".into(),
                to_token: "BBB".into(),
                rate_numerator: 2,
                rate_denominator: 1,
            }],
            adapters.clone(),
            store.clone(),
            monitor,
            clock.clone(),
        ));

        Harness {
            service,
            adapters,
            alpha,
            beta,
            clock,
            store,
        }
    }

    #[tokio::test]
    async fn test_create_order_builds_both_legs() {
        let h = harness(true);
        let created = assert_ok!(h.service.create_order(request(1000)).await);

        assert!(verify_reveal(&created.secret, &created.hash_lock));
        assert_eq!(created.to_amount, 2000);
        assert_eq!(created.src_time_lock, START + 7_200);
        assert_eq!(created.dst_time_lock, START + 3_600);
        assert_eq!(created.src_contract.params.sender, "alice");
        assert_eq!(created.src_contract.params.receiver, "resolver");
        assert_eq!(created.dst_contract.params.sender, "resolver");
        assert_eq!(created.dst_contract.params.receiver, "bob");

        let status = h.service.status(created.order_id).await.unwrap();
        assert_eq!(status.status, Phase::Created);
        assert_eq!(status.progress, 20);
        assert!(status.phases.order_created.is_some());

        // The persisted record holds no secret until it is revealed on-chain
        let stored = h.store.get(created.order_id).await.unwrap().unwrap();
        assert!(stored.secret.is_none());
        assert!(h.service.monitor().is_monitoring(created.order_id));
    }

    #[tokio::test]
    async fn test_reversed_timelocks_rejected() {
        let h = harness(true);
        let mut req = request(1000);
        req.src_timelock_secs = Some(600);
        req.dst_timelock_secs = Some(1200);

        let err = assert_err!(h.service.create_order(req).await);
        assert!(matches!(err, SwapError::Validation(_)));
        assert!(h.store.active_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_timelocks_rejected() {
        let h = harness(true);
        let mut req = request(1000);
        req.src_timelock_secs = Some(u64::MAX);
        let err = assert_err!(h.service.create_order(req).await);
        assert!(matches!(err, SwapError::Validation(_)));

        let mut req = request(1000);
        req.dst_timelock_secs = Some(u64::MAX - START + 1);
        let err = assert_err!(h.service.create_order(req).await);
        assert!(matches!(err, SwapError::Validation(_)));

        assert!(h.store.active_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let h = harness(true);

        let err = h.service.create_order(request(0)).await.unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)));

        let mut req = request(10);
        req.to_token = "CCC".into();
        let err = h.service.create_order(req).await.unwrap_err();
        assert!(matches!(err, SwapError::UnsupportedPair { .. }));

        let mut req = request(10);
        req.to_chain = "gamma".into();
        let err = h.service.create_order(req).await.unwrap_err();
        assert!(matches!(err, SwapError::ChainNotFound { .. }));

        let mut req = request(10);
        req.recipient_address = "not an address".into();
        let err = h.service.create_order(req).await.unwrap_err();
        assert!(matches!(err, SwapError::InvalidAddress { .. }));

        let mut req = request(10);
        req.to_chain = "alpha".into();
        assert!(h.service.create_order(req).await.is_err());

        assert!(h.store.active_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_order_status() {
        let h = harness(true);
        let err = h.service.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SwapError::OrderNotFound { .. }));
    }
}
