//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Quota catalog (tier and category to rule lookup)
//! - Admission engine (conditional reservation, fallback)
//! - Fallback limiter and its background sweeper
//! - Circuit breaker around the shared store
//! - Decision accounting
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod accounting;
pub mod catalog;
pub mod circuit_breaker;
pub mod engine;
pub mod fallback;
pub mod ports;
pub mod sweeper;
