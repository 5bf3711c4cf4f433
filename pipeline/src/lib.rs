//! # Order Fulfillment
//!
//! Order-fulfillment pipeline for the bookstore.
//!
//! An order is recorded synchronously by [`OrderService::create_order`]; everything after
//! that runs in background stages connected by two queues:
//!
//! ```text
//! OrderService ──► [orders] ──► OrderProcessor ──► [inventory_updates] ──► InventoryManager
//!                                     │                                          │
//!                                     ▼                                          │
//!                              ShippingSimulator            shortfall ◄──────────┘
//! ```
//!
//! - [`processor`]: validates stock, accepts or rejects the order, publishes reservations
//! - [`inventory`]: applies stock deltas, detects reservations lost to a concurrent order
//! - [`shipping`]: timed PROCESSING → SHIPPED → DELIVERED transitions
//! - [`service`]: create, read and cancel for the API layer
//! - [`notifications`]: the broadcast gateway for user and global notifications
//! - [`app`]: wiring and lifecycle
//!
//! Every status change is a compare-and-set on the order store, and every queue handler
//! is idempotent, so redelivered messages and racing cancellations are harmless.

#![forbid(unsafe_code)]

pub mod app;
pub mod config;
pub mod inventory;
pub mod notifications;
pub mod processor;
pub mod publisher;
pub mod service;
pub mod shipping;

pub use app::{Pipeline, PipelineError, PipelineSettings, Seams};
pub use config::Config;
pub use notifications::{BroadcastNotifier, Notification};
pub use service::OrderService;
