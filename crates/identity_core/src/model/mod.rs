//! Domain model for identity reconciliation.
//!
//! # Responsibility
//! - Define the contact record and the identifier pair submitted by callers.
//! - Define the externally visible identity view and wire shapes.
//!
//! # Invariants
//! - Every contact is identified by a storage-assigned `ContactId`.
//! - Contacts are never deleted; merges only rewrite precedence and link.

pub mod contact;
pub mod view;
