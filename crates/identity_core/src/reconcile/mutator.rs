//! Application of reconciliation decisions to the contact store.
//!
//! # Responsibility
//! - Create primaries and secondaries.
//! - Demote absorbed primaries and relink their secondaries on merge.
//!
//! # Invariants
//! - Runs inside the caller's atomic scope; any error rolls back every write
//!   made by the same pass.
//! - An absorbed cluster is re-read before demotion; if its root or
//!   membership changed since the decision was taken the pass fails with
//!   `RepoError::Conflict`.
//! - Relinked secondaries point at the survivor directly, never at another
//!   secondary.

use crate::model::contact::{Contact, ContactId, Identifiers, LinkPrecedence};
use crate::reconcile::resolver::{Cluster, Decision};
use crate::repo::contact_repo::{ContactRepository, RepoError, RepoResult};
use log::info;

/// Writes performed by one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Primary of the resolved cluster after the writes.
    pub primary_id: ContactId,
    /// Contact inserted by this pass, if any.
    pub created: Option<Contact>,
    /// Former primaries demoted to secondary.
    pub demoted: Vec<ContactId>,
    /// Former secondaries of demoted primaries now linked to the survivor.
    pub relinked: Vec<ContactId>,
}

impl MutationOutcome {
    fn unchanged(primary_id: ContactId) -> Self {
        Self {
            primary_id,
            created: None,
            demoted: Vec::new(),
            relinked: Vec::new(),
        }
    }

    /// Returns whether the pass left the store untouched.
    pub fn is_noop(&self) -> bool {
        self.created.is_none() && self.demoted.is_empty() && self.relinked.is_empty()
    }
}

/// Applies `decision` for the submitted `identifiers`.
pub fn apply(
    repo: &dyn ContactRepository,
    decision: Decision,
    identifiers: &Identifiers,
) -> RepoResult<MutationOutcome> {
    match decision {
        Decision::CreatePrimary => {
            let created = repo.create_contact(
                identifiers.email(),
                identifiers.phone_number(),
                LinkPrecedence::Primary,
                None,
            )?;
            let mut outcome = MutationOutcome::unchanged(created.id);
            outcome.created = Some(created);
            Ok(outcome)
        }
        Decision::Existing { primary_id } => Ok(MutationOutcome::unchanged(primary_id)),
        Decision::Attach { primary_id } => {
            let created = attach_secondary(repo, primary_id, identifiers)?;
            Ok(MutationOutcome {
                created: Some(created),
                ..MutationOutcome::unchanged(primary_id)
            })
        }
        Decision::Merge {
            survivor_id,
            absorbed,
        } => {
            let mut outcome = MutationOutcome::unchanged(survivor_id);
            for cluster in &absorbed {
                ensure_cluster_unchanged(repo, cluster)?;
                demote_cluster(repo, survivor_id, cluster, &mut outcome)?;
            }
            info!(
                "event=contact_merge module=reconcile status=ok survivor_id={} demoted={} relinked={}",
                survivor_id,
                outcome.demoted.len(),
                outcome.relinked.len()
            );
            Ok(outcome)
        }
    }
}

fn attach_secondary(
    repo: &dyn ContactRepository,
    primary_id: ContactId,
    identifiers: &Identifiers,
) -> RepoResult<Contact> {
    repo.create_contact(
        identifiers.email(),
        identifiers.phone_number(),
        LinkPrecedence::Secondary,
        Some(primary_id),
    )
}

fn demote_cluster(
    repo: &dyn ContactRepository,
    survivor_id: ContactId,
    cluster: &Cluster,
    outcome: &mut MutationOutcome,
) -> RepoResult<()> {
    repo.update_precedence_and_link(
        cluster.primary_id(),
        LinkPrecedence::Secondary,
        Some(survivor_id),
    )?;
    outcome.demoted.push(cluster.primary_id());

    for secondary in cluster.secondaries() {
        repo.update_precedence_and_link(
            secondary.id,
            LinkPrecedence::Secondary,
            Some(survivor_id),
        )?;
        outcome.relinked.push(secondary.id);
    }
    Ok(())
}

fn ensure_cluster_unchanged(repo: &dyn ContactRepository, expected: &Cluster) -> RepoResult<()> {
    let current = match Cluster::load(repo, expected.primary_id()) {
        Ok(current) => current,
        Err(RepoError::NotFound(_)) | Err(RepoError::InvalidData(_)) => {
            return Err(RepoError::Conflict(format!(
                "cluster root {} changed before merge",
                expected.primary_id()
            )));
        }
        Err(other) => return Err(other),
    };

    let same_members = current
        .members()
        .iter()
        .map(|contact| contact.id)
        .eq(expected.members().iter().map(|contact| contact.id));
    if !same_members {
        return Err(RepoError::Conflict(format!(
            "cluster {} membership changed before merge",
            expected.primary_id()
        )));
    }
    Ok(())
}
