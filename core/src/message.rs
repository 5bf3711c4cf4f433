//! Queue messages and their wire envelope.
//!
//! Two logical queues connect the pipeline stages:
//!
//! ```text
//! OrderService ──OrderMessage──► [orders] ──► OrderProcessor
//!                                                  │
//!              InventoryUpdateMessage (per item)   │
//!                                                  ▼
//!                              [inventory_updates] ──► InventoryManager
//! ```
//!
//! Every message travels inside an [`Envelope`], which carries the delivery `attempt`
//! counter and a correlation id. The transport bumps `attempt` on redelivery; handlers
//! use the correlation id (or the order's current status) to stay idempotent.

use crate::catalog::AdjustmentKind;
use crate::types::{BookId, LineItem, OrderId, UserId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default name of the order-creation queue.
pub const ORDERS_QUEUE: &str = "orders";

/// Default name of the inventory-update queue.
pub const INVENTORY_UPDATES_QUEUE: &str = "inventory_updates";

/// Kind given to raw payloads the transport could not decode into an [`Envelope`].
pub const UNDECODABLE_KIND: &str = "undecodable";

/// Errors raised while packing or unpacking messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Failed to serialize a message or envelope.
    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    /// Failed to deserialize a message or envelope.
    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    /// Envelope holds a different message kind than requested.
    #[error("Unexpected message kind: expected {expected}, found {found}")]
    UnexpectedKind {
        /// Kind the caller asked for
        expected: &'static str,
        /// Kind found in the envelope
        found: String,
    },
}

/// A typed message that can travel through a queue.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable kind identifier, versioned (e.g. `"OrderMessage.v1"`).
    const KIND: &'static str;

    /// Key that identifies this logical message across redeliveries.
    fn correlation_id(&self) -> String;

    /// Delivery attempt counter (0 on first publish).
    fn attempt(&self) -> u32;

    /// Overwrite the delivery attempt counter.
    fn set_attempt(&mut self, attempt: u32);
}

/// Wire format shared by every queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind (see [`QueueMessage::KIND`])
    pub kind: String,
    /// Dedup / correlation key
    pub correlation_id: String,
    /// Delivery attempt, bumped by the transport on every redelivery
    pub attempt: u32,
    /// When the envelope was first published
    pub published_at: DateTime<Utc>,
    /// bincode-serialized message body
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Pack a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::SerializationError`] if the message cannot be encoded.
    pub fn wrap<M: QueueMessage>(
        message: &M,
        published_at: DateTime<Utc>,
    ) -> Result<Self, MessageError> {
        let payload = bincode::serialize(message)
            .map_err(|e| MessageError::SerializationError(e.to_string()))?;
        Ok(Self {
            kind: M::KIND.to_string(),
            correlation_id: message.correlation_id(),
            attempt: message.attempt(),
            published_at,
            payload,
        })
    }

    /// Unpack a typed message. The envelope's `attempt` wins over the one in the payload,
    /// since only the envelope is rewritten on redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::UnexpectedKind`] for a different kind and
    /// [`MessageError::DeserializationError`] for a corrupt payload.
    pub fn open<M: QueueMessage>(&self) -> Result<M, MessageError> {
        if self.kind != M::KIND {
            return Err(MessageError::UnexpectedKind {
                expected: M::KIND,
                found: self.kind.clone(),
            });
        }
        let mut message: M = bincode::deserialize(&self.payload)
            .map_err(|e| MessageError::DeserializationError(e.to_string()))?;
        message.set_attempt(self.attempt);
        Ok(message)
    }

    /// Carrier for bytes that are not a valid envelope, so consumers can dead-letter them
    /// like any other poison message. Opening it always fails.
    #[must_use]
    pub fn undecodable(
        raw: Vec<u8>,
        correlation_id: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: UNDECODABLE_KIND.to_string(),
            correlation_id: correlation_id.into(),
            attempt: 0,
            published_at: received_at,
            payload: raw,
        }
    }

    /// The same envelope, scheduled for another delivery.
    #[must_use]
    pub fn redelivery(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::SerializationError`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(|e| MessageError::SerializationError(e.to_string()))
    }

    /// Decode from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::DeserializationError`] on malformed bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(bytes).map_err(|e| MessageError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ kind: {}, correlation: {}, attempt: {}, size: {} bytes }}",
            self.kind,
            self.correlation_id,
            self.attempt,
            self.payload.len()
        )
    }
}

/// Request to process a freshly created order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMessage {
    /// Order to process
    pub order_id: OrderId,
    /// Owning user
    pub user_id: UserId,
    /// Snapshot of the order's items
    pub items: Vec<LineItem>,
    /// Delivery attempt
    pub attempt: u32,
}

impl OrderMessage {
    /// First delivery of an order-creation message.
    #[must_use]
    pub const fn new(order_id: OrderId, user_id: UserId, items: Vec<LineItem>) -> Self {
        Self {
            order_id,
            user_id,
            items,
            attempt: 0,
        }
    }
}

impl QueueMessage for OrderMessage {
    const KIND: &'static str = "OrderMessage.v1";

    fn correlation_id(&self) -> String {
        self.order_id.to_string()
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }
}

/// A signed stock change for one book on behalf of one order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUpdateMessage {
    /// Book whose stock changes
    pub book_id: BookId,
    /// Negative = reservation, positive = compensating restock
    pub quantity_delta: i64,
    /// Order this change belongs to
    pub order_id: OrderId,
    /// Delivery attempt
    pub attempt: u32,
}

impl InventoryUpdateMessage {
    /// Reserve the stock for `item`.
    #[must_use]
    pub fn reservation(order_id: OrderId, item: &LineItem) -> Self {
        Self {
            book_id: item.book_id,
            quantity_delta: -i64::from(item.quantity),
            order_id,
            attempt: 0,
        }
    }

    /// Give back the stock reserved for `item`.
    #[must_use]
    pub fn restock(order_id: OrderId, item: &LineItem) -> Self {
        Self {
            book_id: item.book_id,
            quantity_delta: i64::from(item.quantity),
            order_id,
            attempt: 0,
        }
    }

    /// Whether this message reserves or restocks.
    #[must_use]
    pub const fn kind(&self) -> AdjustmentKind {
        if self.quantity_delta < 0 {
            AdjustmentKind::Reservation
        } else {
            AdjustmentKind::Restock
        }
    }
}

impl QueueMessage for InventoryUpdateMessage {
    const KIND: &'static str = "InventoryUpdateMessage.v1";

    fn correlation_id(&self) -> String {
        format!("{}:{}:{}", self.order_id, self.book_id, self.kind())
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }
}
