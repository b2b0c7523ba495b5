//! Per-order monitoring
//!
//! Every non-terminal order gets one supervision task that polls both HTLC
//! legs, drives the order state machine and publishes events on a broadcast
//! channel. The task set is bounded by a semaphore; tasks beyond the limit
//! wait for a permit.

mod supervisor;

use crate::chain::{AdapterRegistry, ConfirmationTracker};
use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::error::SwapResult;
use crate::events::MonitorEvent;
use crate::order::Order;
use crate::state::OrderStore;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

use supervisor::Supervisor;

/// Shared by all supervision tasks
pub(crate) struct MonitorContext {
    pub adapters: Arc<AdapterRegistry>,
    pub tracker: Arc<ConfirmationTracker>,
    pub store: Arc<dyn OrderStore>,
    pub clock: Arc<dyn Clock>,
    pub config: MonitorConfig,
    pub semaphore: Arc<Semaphore>,
}

pub(crate) struct MonitorEntry {
    subscription: Subscription,
    cancel: watch::Sender<bool>,
}

/// Handle on an order's event channel
#[derive(Clone)]
pub struct Subscription {
    order_id: Uuid,
    sender: broadcast::Sender<MonitorEvent>,
}

impl Subscription {
    pub fn order_id(&self) -> Uuid {
        self.order_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn same_channel(&self, other: &Subscription) -> bool {
        self.sender.same_channel(&other.sender)
    }

    fn owns(&self, sender: &broadcast::Sender<MonitorEvent>) -> bool {
        self.sender.same_channel(sender)
    }
}

pub struct OrderMonitor {
    ctx: Arc<MonitorContext>,
    active: Arc<DashMap<Uuid, MonitorEntry>>,
}

impl OrderMonitor {
    pub fn new(
        adapters: Arc<AdapterRegistry>,
        store: Arc<dyn OrderStore>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Self {
        let tracker = Arc::new(ConfirmationTracker::new(adapters.clone()));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_monitors));
        Self {
            ctx: Arc::new(MonitorContext {
                adapters,
                tracker,
                store,
                clock,
                config,
                semaphore,
            }),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn tracker(&self) -> Arc<ConfirmationTracker> {
        self.ctx.tracker.clone()
    }

    /// Start supervising an order. Starting an order that is already being
    /// monitored returns the existing subscription; terminal orders get a
    /// channel with no task behind it.
    pub fn start_monitoring(&self, order: Order) -> Subscription {
        let order_id = order.id;

        if order.is_terminal() {
            debug!("Order {} is {}, not monitoring", order_id, order.phase);
            let (sender, _) = broadcast::channel(1);
            return Subscription { order_id, sender };
        }

        match self.active.entry(order_id) {
            Entry::Occupied(entry) => entry.get().subscription.clone(),
            Entry::Vacant(entry) => {
                let (sender, _) = broadcast::channel(self.ctx.config.event_buffer.max(1));
                let (cancel, cancel_rx) = watch::channel(false);
                let subscription = Subscription {
                    order_id,
                    sender: sender.clone(),
                };
                entry.insert(MonitorEntry {
                    subscription: subscription.clone(),
                    cancel,
                });

                let supervisor = Supervisor::new(
                    order,
                    self.ctx.clone(),
                    self.active.clone(),
                    sender,
                    cancel_rx,
                );
                tokio::spawn(supervisor.run());
                subscription
            }
        }
    }

    /// Cancel an order's task. Returns whether one was running.
    pub fn stop_monitoring(&self, order_id: Uuid) -> bool {
        match self.active.remove(&order_id) {
            Some((_, entry)) => {
                let _ = entry.cancel.send(true);
                info!("Stopped monitoring order {}", order_id);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<Uuid> = self.active.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.stop_monitoring(id);
        }
    }

    pub fn subscribe(&self, order_id: Uuid) -> Option<broadcast::Receiver<MonitorEvent>> {
        self.active
            .get(&order_id)
            .map(|entry| entry.subscription.subscribe())
    }

    /// Restart monitoring for every stored order that is still open
    pub async fn resume(&self) -> SwapResult<usize> {
        let orders = self.ctx.store.active_orders().await?;
        let mut started = 0;
        for order in orders {
            if self.is_monitoring(order.id) {
                continue;
            }
            self.start_monitoring(order);
            started += 1;
        }
        info!("Resumed monitoring for {} orders", started);
        Ok(started)
    }

    pub fn is_monitoring(&self, order_id: Uuid) -> bool {
        self.active.contains_key(&order_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
