//! Core domain logic for contact identity reconciliation.
//! This crate is the single source of truth for identity cluster invariants.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod repo;
pub mod service;

pub use config::{ConfigError, IdentityConfig};
pub use logging::{default_log_level, init_logging, logging_status, LogTarget};
pub use model::contact::{Contact, ContactId, ContactValidationError, Identifiers, LinkPrecedence};
pub use model::view::{IdentifyRequest, IdentifyResponse, IdentityView};
pub use reconcile::resolver::DecisionKind;
pub use reconcile::Resolution;
pub use repo::contact_repo::{
    ContactRepository, ContactStore, RepoError, RepoResult, SqliteContactStore,
};
pub use service::identity_service::{IdentityError, IdentityService};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
