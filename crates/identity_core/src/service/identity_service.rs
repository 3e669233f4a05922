//! Identity resolution use-case service.
//!
//! # Responsibility
//! - Validate submitted identifiers before any storage access.
//! - Run the reconciliation pipeline inside one atomic store scope.
//! - Retry the whole read-decide-write sequence on conflicts, a bounded
//!   number of times.
//!
//! # Invariants
//! - Service layer remains storage-agnostic (`ContactStore` only).
//! - A failed attempt leaves no partial writes behind.
//! - Identifier values are never logged.

use crate::config::{IdentityConfig, DEFAULT_MAX_ATTEMPTS};
use crate::model::contact::{ContactId, ContactValidationError, Identifiers};
use crate::model::view::{IdentifyRequest, IdentifyResponse, IdentityView};
use crate::reconcile::resolver::Cluster;
use crate::reconcile::{reconcile, view_builder, Resolution};
use crate::repo::contact_repo::{ContactStore, RepoError};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Service error for identity resolution.
#[derive(Debug)]
pub enum IdentityError {
    /// Both identifiers absent. Client error.
    InvalidInput(ContactValidationError),
    /// Conflicts persisted through every attempt. Transient; retry later.
    ConflictRetry { attempts: u32 },
    /// The contact store failed or could not be reached.
    StorageUnavailable(RepoError),
    /// Persisted contacts violate model invariants.
    InconsistentState(String),
    /// Requested contact does not exist.
    NotFound(ContactId),
}

impl IdentityError {
    /// Whether the caller sent a request that can never succeed as-is.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::NotFound(_))
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConflictRetry { .. })
    }
}

impl Display for IdentityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(err) => write!(f, "invalid input: {err}"),
            Self::ConflictRetry { attempts } => write!(
                f,
                "identity resolution conflicted on all {attempts} attempts; retry later"
            ),
            Self::StorageUnavailable(err) => write!(f, "contact store unavailable: {err}"),
            Self::InconsistentState(details) => write!(f, "inconsistent contact state: {details}"),
            Self::NotFound(id) => write!(f, "contact not found: {id}"),
        }
    }
}

impl Error for IdentityError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidInput(err) => Some(err),
            Self::StorageUnavailable(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ContactValidationError> for IdentityError {
    fn from(value: ContactValidationError) -> Self {
        Self::InvalidInput(value)
    }
}

impl From<RepoError> for IdentityError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Conflict(_) => Self::ConflictRetry { attempts: 1 },
            RepoError::NotFound(id) => Self::NotFound(id),
            RepoError::InvalidData(details) => Self::InconsistentState(details),
            RepoError::Validation(err) => Self::InconsistentState(err.to_string()),
            other => Self::StorageUnavailable(other),
        }
    }
}

/// Identity resolution facade over a contact store.
pub struct IdentityService<S: ContactStore> {
    store: S,
    max_attempts: u32,
}

impl<S: ContactStore> IdentityService<S> {
    /// Creates a service with the default retry budget.
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Creates a service using the retry budget from `config`.
    pub fn with_config(store: S, config: &IdentityConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Resolves `(email?, phone?)` to the identity view of its cluster,
    /// creating, attaching or merging records as needed.
    ///
    /// # Errors
    /// - `InvalidInput` when both identifiers are absent or blank.
    /// - `ConflictRetry` when every attempt hit a concurrent writer.
    /// - `StorageUnavailable` / `InconsistentState` from the store.
    pub fn resolve_identity(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<IdentityView, IdentityError> {
        let identifiers = Identifiers::new(email, phone_number)?;
        self.resolve(&identifiers).map(|resolution| resolution.view)
    }

    /// Handles an identify request body and wraps the view in the response
    /// envelope.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<IdentifyResponse, IdentityError> {
        let identifiers = request.identifiers()?;
        let resolution = self.resolve(&identifiers)?;
        Ok(IdentifyResponse {
            contact: resolution.view,
        })
    }

    /// Returns the view of the cluster containing `contact_id`.
    ///
    /// Accepts primary or secondary ids; never mutates.
    pub fn cluster_view(&self, contact_id: ContactId) -> Result<IdentityView, IdentityError> {
        let view = self.store.run_atomic(|repo| {
            let rows = repo.find_by_cluster_root(contact_id)?;
            let root_id = rows
                .iter()
                .find(|contact| contact.id == contact_id)
                .map(|contact| contact.root_id())
                .ok_or(RepoError::NotFound(contact_id))?;
            if root_id == contact_id {
                Ok(view_builder::project(&Cluster::from_rows(root_id, rows)?))
            } else {
                view_builder::build_view(repo, root_id)
            }
        })?;
        Ok(view)
    }

    /// Runs the full pipeline with bounded conflict retry.
    pub fn resolve(&self, identifiers: &Identifiers) -> Result<Resolution, IdentityError> {
        let started_at = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.store.run_atomic(|repo| reconcile(repo, identifiers)) {
                Ok(resolution) => {
                    info!(
                        "event=identity_resolve module=service status=ok decision={} primary_id={} created={} demoted={} attempt={} duration_ms={}",
                        resolution.decision.as_str(),
                        resolution.view.primary_contact_id,
                        resolution.outcome.created.is_some(),
                        resolution.outcome.demoted.len(),
                        attempt,
                        started_at.elapsed().as_millis()
                    );
                    return Ok(resolution);
                }
                Err(RepoError::Conflict(details)) if attempt < self.max_attempts => {
                    warn!(
                        "event=identity_conflict module=service status=retry attempt={} max_attempts={} details={}",
                        attempt, self.max_attempts, details
                    );
                }
                Err(RepoError::Conflict(details)) => {
                    error!(
                        "event=identity_conflict module=service status=exhausted attempt={} duration_ms={} details={}",
                        attempt,
                        started_at.elapsed().as_millis(),
                        details
                    );
                    return Err(IdentityError::ConflictRetry { attempts: attempt });
                }
                Err(other) => {
                    error!(
                        "event=identity_resolve module=service status=error attempt={} duration_ms={} error={}",
                        attempt,
                        started_at.elapsed().as_millis(),
                        other
                    );
                    return Err(other.into());
                }
            }
        }
    }
}
