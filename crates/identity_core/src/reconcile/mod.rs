//! Identity reconciliation pipeline.
//!
//! # Responsibility
//! - Match submitted identifiers against stored contacts.
//! - Decide between create, no-op, attach and merge.
//! - Apply the decision and project the resolved cluster.
//!
//! # Invariants
//! - Every stage runs against the same `ContactRepository` scope, so a whole
//!   pass observes and mutates one consistent snapshot.
//! - Clusters are a union-find forest of depth <= 1: secondaries always link
//!   straight to their primary.

pub mod matcher;
pub mod mutator;
pub mod resolver;
pub mod view_builder;

use crate::model::contact::Identifiers;
use crate::model::view::IdentityView;
use crate::repo::contact_repo::{ContactRepository, RepoResult};
use mutator::MutationOutcome;
use resolver::DecisionKind;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub decision: DecisionKind,
    pub outcome: MutationOutcome,
    pub view: IdentityView,
}

/// Runs match, resolve, mutate and project against one repository scope.
pub fn reconcile(repo: &dyn ContactRepository, identifiers: &Identifiers) -> RepoResult<Resolution> {
    let matched = matcher::find_matches(repo, identifiers)?;
    let clusters = resolver::load_clusters(repo, &matched)?;
    let decision = resolver::decide(clusters, identifiers);
    let kind = decision.kind();
    let outcome = mutator::apply(repo, decision, identifiers)?;
    let view = view_builder::build_view(repo, outcome.primary_id)?;
    Ok(Resolution {
        decision: kind,
        outcome,
        view,
    })
}
