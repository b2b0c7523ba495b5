//! PostgreSQL order store

use super::OrderStore;
use crate::config::DatabaseConfig;
use crate::error::{SwapError, SwapResult};
use crate::order::{Order, Phase};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

const TERMINAL_PHASES: [Phase; 4] = [
    Phase::Completed,
    Phase::RefundedSrc,
    Phase::RefundedDst,
    Phase::Failed,
];

/// Orders stored as JSONB documents with the phase broken out for queries
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub async fn new(config: &DatabaseConfig) -> SwapResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables if missing
    pub async fn run_migrations(&self) -> SwapResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_orders (
                id UUID PRIMARY KEY,
                from_chain VARCHAR(64) NOT NULL,
                to_chain VARCHAR(64) NOT NULL,
                phase VARCHAR(20) NOT NULL,
                progress SMALLINT NOT NULL,
                order_data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swap_orders_phase
            ON swap_orders (phase)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn decode(data: serde_json::Value) -> SwapResult<Order> {
        serde_json::from_value(data)
            .map_err(|e| SwapError::Internal(format!("Corrupt order record: {}", e)))
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn save(&self, order: &Order) -> SwapResult<()> {
        let data = serde_json::to_value(order).map_err(|e| SwapError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO swap_orders
                (id, from_chain, to_chain, phase, progress, order_data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id)
            DO UPDATE SET phase = $4, progress = $5, order_data = $6, updated_at = $8
            "#,
        )
        .bind(order.id)
        .bind(&order.from_chain)
        .bind(&order.to_chain)
        .bind(order.phase.as_str())
        .bind(order.progress as i16)
        .bind(data)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved order {} ({})", order.id, order.phase);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> SwapResult<Option<Order>> {
        let row = sqlx::query("SELECT order_data FROM swap_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::decode(r.get("order_data"))).transpose()
    }

    async fn active_orders(&self) -> SwapResult<Vec<Order>> {
        let terminal: Vec<&str> = TERMINAL_PHASES.iter().map(|p| p.as_str()).collect();

        let rows = sqlx::query(
            r#"
            SELECT order_data FROM swap_orders
            WHERE NOT (phase = ANY($1))
            ORDER BY created_at
            "#,
        )
        .bind(&terminal)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| Self::decode(r.get("order_data")))
            .collect()
    }

    async fn health_check(&self) -> SwapResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phase_filter_matches_order_phases() {
        for phase in TERMINAL_PHASES {
            assert!(phase.is_terminal());
        }
        assert!(!TERMINAL_PHASES.contains(&Phase::DstFunded));
    }

    #[test]
    fn test_corrupt_record_is_internal_error() {
        let err = PgOrderStore::decode(serde_json::json!({ "id": 1 })).unwrap_err();
        assert!(matches!(err, SwapError::Internal(_)));
    }
}
