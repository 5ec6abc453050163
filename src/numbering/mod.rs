//! Document types and number reservations

pub mod allocator;

pub use allocator::*;
