//! Book stock, the single source of truth for inventory.
//!
//! Stock is changed only through [`Catalog::apply_adjustment`]. Each adjustment is
//! atomic per book and recorded in a per-`(order, book)` ledger, so redelivered
//! inventory messages never move stock twice:
//!
//! ```text
//!            reserve                 restock
//!   (none) ──────────► Reserved ──────────────► Released
//!     │ │
//!     │ │ reserve, not enough stock
//!     │ └──────────► Rejected ── later reservations are rejected again
//!     │
//!     │ restock (reservation never applied)
//!     ▼
//!   Voided ── a late reservation for a voided pair is skipped
//! ```
//!
//! Invariant: stock never goes below zero. A reservation larger than the current stock
//! is rejected with [`CatalogError::InsufficientStock`], never clamped, and stays
//! rejected even if stock is replenished before it is redelivered.

use crate::types::{BookId, OrderId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from catalog operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// No book with this id
    #[error("Book not found: {0}")]
    BookNotFound(BookId),

    /// Applying the delta would drive stock negative
    #[error("Insufficient stock for book {book_id}: stock {stock}, delta {delta}")]
    InsufficientStock {
        /// Book being adjusted
        book_id: BookId,
        /// Stock at the time of the check
        stock: u32,
        /// Rejected delta
        delta: i64,
    },

    /// Backend failure
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Direction of a stock adjustment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjustmentKind {
    /// Negative delta taken when an order is accepted
    Reservation,
    /// Positive delta returned when an accepted order is cancelled
    Restock,
}

impl fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reservation => f.write_str("reserve"),
            Self::Restock => f.write_str("restock"),
        }
    }
}

/// State of the ledger entry for one `(order, book)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedgerState {
    /// Stock was taken for the order
    Reserved,
    /// Reserved stock was given back
    Released,
    /// A restock arrived before any reservation; later reservations are skipped
    Voided,
    /// The reservation did not fit the stock; it never takes stock afterwards
    Rejected,
}

impl LedgerState {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Released => "released",
            Self::Voided => "voided",
            Self::Rejected => "rejected",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(Self::Reserved),
            "released" => Some(Self::Released),
            "voided" => Some(Self::Voided),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A signed stock change correlated to an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StockAdjustment {
    /// Order the change belongs to
    pub order_id: OrderId,
    /// Book being adjusted
    pub book_id: BookId,
    /// Signed quantity
    pub delta: i64,
}

impl StockAdjustment {
    /// Direction of this adjustment.
    #[must_use]
    pub const fn kind(&self) -> AdjustmentKind {
        if self.delta < 0 {
            AdjustmentKind::Reservation
        } else {
            AdjustmentKind::Restock
        }
    }
}

/// What [`Catalog::apply_adjustment`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustmentOutcome {
    /// Stock moved by the delta
    Applied {
        /// Stock before the change
        previous: u32,
        /// Stock after the change
        stock: u32,
    },
    /// The ledger already holds this adjustment; nothing changed
    Duplicate {
        /// Current stock
        stock: u32,
    },
    /// Restock without a reservation, or reservation after such a restock; nothing changed
    Voided {
        /// Current stock
        stock: u32,
    },
}

impl AdjustmentOutcome {
    /// Stock after the call.
    #[must_use]
    pub const fn stock(&self) -> u32 {
        match self {
            Self::Applied { stock, .. } | Self::Duplicate { stock } | Self::Voided { stock } => {
                *stock
            }
        }
    }
}

/// What an adjustment does to one book.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdjustmentPlan {
    /// Result reported to the caller
    pub result: Result<AdjustmentOutcome, CatalogError>,
    /// Ledger state and stock to commit, if anything changes
    pub write: Option<(LedgerState, u32)>,
}

impl AdjustmentPlan {
    const fn unchanged(outcome: AdjustmentOutcome) -> Self {
        Self {
            result: Ok(outcome),
            write: None,
        }
    }
}

/// Decide what an adjustment does given the current ledger entry and stock.
///
/// Shared by every [`Catalog`] implementation so they agree on the ledger rules. The
/// `write` of a plan is committed even when its `result` is an error: a rejected
/// reservation is recorded so it can never apply later.
#[must_use]
pub fn plan_adjustment(adjustment: &StockAdjustment, entry: Option<LedgerState>, stock: u32) -> AdjustmentPlan {
    let insufficient = CatalogError::InsufficientStock {
        book_id: adjustment.book_id,
        stock,
        delta: adjustment.delta,
    };

    match (adjustment.kind(), entry) {
        (AdjustmentKind::Reservation, Some(LedgerState::Reserved | LedgerState::Released))
        | (AdjustmentKind::Restock, Some(LedgerState::Released | LedgerState::Voided)) => {
            AdjustmentPlan::unchanged(AdjustmentOutcome::Duplicate { stock })
        }
        (AdjustmentKind::Reservation, Some(LedgerState::Voided))
        | (AdjustmentKind::Restock, Some(LedgerState::Rejected)) => {
            AdjustmentPlan::unchanged(AdjustmentOutcome::Voided { stock })
        }
        (AdjustmentKind::Reservation, Some(LedgerState::Rejected)) => AdjustmentPlan {
            result: Err(insufficient),
            write: None,
        },
        (AdjustmentKind::Restock, None) => AdjustmentPlan {
            result: Ok(AdjustmentOutcome::Voided { stock }),
            write: Some((LedgerState::Voided, stock)),
        },
        (AdjustmentKind::Reservation, None) => match u32::try_from(i64::from(stock) + adjustment.delta) {
            Ok(next) => AdjustmentPlan {
                result: Ok(AdjustmentOutcome::Applied {
                    previous: stock,
                    stock: next,
                }),
                write: Some((LedgerState::Reserved, next)),
            },
            Err(_) => AdjustmentPlan {
                result: Err(insufficient),
                write: Some((LedgerState::Rejected, stock)),
            },
        },
        (AdjustmentKind::Restock, Some(LedgerState::Reserved)) => {
            let next = u32::try_from(i64::from(stock) + adjustment.delta).unwrap_or(u32::MAX);
            AdjustmentPlan {
                result: Ok(AdjustmentOutcome::Applied {
                    previous: stock,
                    stock: next,
                }),
                write: Some((LedgerState::Released, next)),
            }
        }
    }
}

/// Book stock levels.
pub trait Catalog: Send + Sync {
    /// Current stock for a book.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::BookNotFound`] for an unknown book.
    fn stock(&self, book_id: BookId) -> Pin<Box<dyn Future<Output = Result<u32, CatalogError>> + Send + '_>>;

    /// Apply an adjustment atomically for its book, honoring the ledger.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::BookNotFound`] for an unknown book
    /// - [`CatalogError::InsufficientStock`] if a reservation exceeds current stock
    fn apply_adjustment(
        &self,
        adjustment: StockAdjustment,
    ) -> Pin<Box<dyn Future<Output = Result<AdjustmentOutcome, CatalogError>> + Send + '_>>;
}
