//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the contact store contract consumed by reconciliation.
//! - Isolate SQLite query details from service/business orchestration.
//!
//! # Invariants
//! - Repository writes enforce precedence/link validation before persistence.
//! - Repository APIs return semantic errors (`NotFound`, `Conflict`) in
//!   addition to DB transport errors.

pub mod contact_repo;
