//! # Journal Ledger
//!
//! The posting core of a multi-company accounting system: double-entry
//! journal entries, per-account ledger movements, hierarchical balance
//! aggregation and gap-filling document numbering.
//!
//! ## Features
//!
//! - **Journal lifecycle**: draft, posted and reversed entries with balance validation
//! - **Posting engine**: ledger entries with running balances, applied atomically
//! - **Hierarchy aggregation**: parent accounts always equal the sum of their children
//! - **Document numbering**: per-type numbers that reuse cancelled gaps
//! - **Storage abstraction**: database-agnostic design with trait-based storage
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use journal_ledger::{patterns, Ledger, MemoryStorage};
//! use bigdecimal::BigDecimal;
//! use chrono::NaiveDate;
//!
//! # async fn run() -> journal_ledger::LedgerResult<()> {
//! let ledger = Ledger::new(MemoryStorage::new());
//! ledger.setup_standard_chart_of_accounts("acme").await?;
//! let ce = ledger.create_document_type("acme", "CE", "Comprobante de egreso", None).await?;
//!
//! let number = ledger.allocate_number("acme", ce.id, None).await?;
//! let entry = patterns::expense_payment(
//!     "acme",
//!     &number.number,
//!     NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
//!     "January rent",
//!     "50101",
//!     "10101",
//!     BigDecimal::from(1200),
//! )?;
//! let entry = ledger.create_journal_entry(entry).await?;
//! ledger.post_journal_entry(entry.id).await?;
//! # Ok(())
//! # }
//! ```

pub mod changeset;
pub mod config;
pub mod ledger;
pub mod numbering;
pub mod telemetry;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use changeset::Changeset;
pub use crate::config::*;
pub use ledger::*;
pub use numbering::*;
pub use traits::*;
pub use types::*;
pub use utils::memory_storage::MemoryStorage;

// Re-export journal entry patterns for convenience
pub use ledger::journal::patterns;
