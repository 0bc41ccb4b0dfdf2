//! Domain layer - pure admission logic with no I/O.
//!
//! This layer contains the core concepts and invariants of admission control:
//! - Request categories and caller identities
//! - Rules and tiers (quotas)
//! - Fixed windows and the store key namespace
//! - Decisions and the admit/deny predicate
//!
//! All types in this layer are pure and easily testable.

pub mod category;
pub mod decision;
pub mod identity;
pub mod rule;
pub mod window;
