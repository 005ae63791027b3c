use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of an order.
///
/// Transitions only move forward: `pending → processing → {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Failed,
    Completed,
}

impl OrderStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Failed => "failed",
            OrderStatus::Completed => "completed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "processing" => Some(OrderStatus::Processing),
            "failed" => Some(OrderStatus::Failed),
            "completed" => Some(OrderStatus::Completed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Failed | OrderStatus::Completed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only status changes a stage handler may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    BeginProcessing,
    Complete,
    Fail,
}

impl StatusTransition {
    #[must_use]
    pub fn source(self) -> OrderStatus {
        match self {
            StatusTransition::BeginProcessing => OrderStatus::Pending,
            StatusTransition::Complete | StatusTransition::Fail => OrderStatus::Processing,
        }
    }

    #[must_use]
    pub fn target(self) -> OrderStatus {
        match self {
            StatusTransition::BeginProcessing => OrderStatus::Processing,
            StatusTransition::Complete => OrderStatus::Completed,
            StatusTransition::Fail => OrderStatus::Failed,
        }
    }
}

/// Result of a compare-and-set status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The order already sits in the target status (redelivered event).
    AlreadyApplied,
    Rejected { current: OrderStatus },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: String,
    pub status: OrderStatus,
    pub total_amount: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub order_id: Uuid,
    pub sku: String,
    pub qty: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEnrichment {
    pub id: i64,
    pub order_id: Uuid,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    pub order_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Order fields supplied at admission; ids and timestamps are assigned by the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub id: Uuid,
    pub customer_id: String,
    pub total_amount: f64,
    pub created_at: DateTime<Utc>,
    pub items: Vec<NewOrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderItem {
    pub sku: String,
    pub qty: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOrderOutcome {
    Created(Order),
    /// Another admission already bound the token; carries the winning order id.
    Existing(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentInsert {
    Inserted(OrderEnrichment),
    AlreadyPresent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Processing,
            OrderStatus::Failed,
            OrderStatus::Completed,
        ] {
            assert_eq!(OrderStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::from_str("shipped"), None);
    }

    #[test]
    fn transitions_only_move_forward() {
        assert_eq!(StatusTransition::BeginProcessing.source(), OrderStatus::Pending);
        assert_eq!(StatusTransition::BeginProcessing.target(), OrderStatus::Processing);
        assert_eq!(StatusTransition::Complete.source(), OrderStatus::Processing);
        assert!(StatusTransition::Complete.target().is_terminal());
        assert!(StatusTransition::Fail.target().is_terminal());
        assert!(!StatusTransition::Fail.source().is_terminal());
    }

    #[test]
    fn order_serializes_with_lowercase_status() {
        let order = Order {
            id: Uuid::nil(),
            customer_id: "cust-1".to_string(),
            status: OrderStatus::Processing,
            total_amount: 10.0,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            items: vec![OrderItem {
                id: 1,
                order_id: Uuid::nil(),
                sku: "X".to_string(),
                qty: 2,
            }],
        };

        let json = serde_json::to_value(&order).expect("serialize");

        assert_eq!(json["status"], "processing");
        assert_eq!(json["items"][0]["sku"], "X");
        assert_eq!(json["customer_id"], "cust-1");
    }
}
