//! Ledger module containing the posting engine, balance aggregation and the
//! journal entry lifecycle

pub mod account;
pub mod core;
pub mod hierarchy;
pub mod journal;
pub mod posting;

pub use account::*;
pub use self::core::*;
pub use hierarchy::*;
pub use journal::*;
pub use posting::*;
