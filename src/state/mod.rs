//! Order persistence
//!
//! One record per order keyed by id:
//! - PostgreSQL (`PgOrderStore`) when a database is configured
//! - In-memory (`MemoryOrderStore`) otherwise

mod manager;
mod memory;

pub use manager::PgOrderStore;
pub use memory::MemoryOrderStore;

use crate::error::SwapResult;
use crate::order::Order;

use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert or replace the order record
    async fn save(&self, order: &Order) -> SwapResult<()>;

    async fn get(&self, id: Uuid) -> SwapResult<Option<Order>>;

    /// Orders not yet in a terminal phase
    async fn active_orders(&self) -> SwapResult<Vec<Order>>;

    async fn health_check(&self) -> SwapResult<()>;
}
