//! Order monitor events and their wire format
//!
//! Every phase transition, progress change and terminal error produces an
//! event on the order's broadcast channel. The SSE endpoint serializes them as
//! `{type, orderId, status?, progress?, error?, timestamp}`.

use crate::order::{Order, Phase};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    StatusUpdate {
        order_id: Uuid,
        status: Phase,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
    Error {
        order_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Completed {
        order_id: Uuid,
        status: Phase,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    pub fn status_update(order: &Order, status: Phase) -> Self {
        MonitorEvent::StatusUpdate {
            order_id: order.id,
            status,
            progress: order.progress,
            timestamp: Utc::now(),
        }
    }

    pub fn error(order: &Order, error: impl Into<String>) -> Self {
        MonitorEvent::Error {
            order_id: order.id,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn completed(order: &Order) -> Self {
        MonitorEvent::Completed {
            order_id: order.id,
            status: order.phase,
            timestamp: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::StatusUpdate { .. } => "status_update",
            MonitorEvent::Error { .. } => "error",
            MonitorEvent::Completed { .. } => "completed",
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            MonitorEvent::StatusUpdate { order_id, .. }
            | MonitorEvent::Error { order_id, .. }
            | MonitorEvent::Completed { order_id, .. } => *order_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, MonitorEvent::Completed { .. })
    }

    pub fn to_wire(&self) -> WireEvent {
        match self {
            MonitorEvent::StatusUpdate {
                order_id,
                status,
                progress,
                timestamp,
            } => WireEvent {
                kind: self.name(),
                order_id: *order_id,
                status: Some(*status),
                progress: Some(*progress),
                error: None,
                timestamp: timestamp.timestamp_millis(),
            },
            MonitorEvent::Error {
                order_id,
                error,
                timestamp,
            } => WireEvent {
                kind: self.name(),
                order_id: *order_id,
                status: None,
                progress: None,
                error: Some(error.clone()),
                timestamp: timestamp.timestamp_millis(),
            },
            MonitorEvent::Completed {
                order_id,
                status,
                timestamp,
            } => WireEvent {
                kind: self.name(),
                order_id: *order_id,
                status: Some(*status),
                progress: None,
                error: None,
                timestamp: timestamp.timestamp_millis(),
            },
        }
    }
}

/// JSON payload of one SSE message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub order_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix milliseconds
    pub timestamp: i64,
}

impl WireEvent {
    /// First message on every stream
    pub fn connected(order_id: Uuid) -> Self {
        WireEvent {
            kind: "connected",
            order_id,
            status: None,
            progress: None,
            error: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
