//! Cluster resolution for matched contacts.
//!
//! # Responsibility
//! - Group matched contacts into identity clusters by walking to their root.
//! - Decide how a submission changes the stored clusters.
//!
//! # Invariants
//! - The surviving primary of a merge is the most senior root under
//!   `Contact::seniority_cmp`, never the first one found.
//! - A submission never creates a record unless it carries a value the
//!   touched clusters do not already hold.

use crate::model::contact::{Contact, ContactId, Identifiers};
use crate::repo::contact_repo::{ContactRepository, RepoError, RepoResult};
use std::collections::BTreeSet;

/// One identity cluster: a primary and every secondary linked to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// `members[0]` is the primary; secondaries follow in seniority order.
    members: Vec<Contact>,
}

impl Cluster {
    /// Loads the cluster rooted at `primary_id`.
    ///
    /// # Errors
    /// - `NotFound` when no contact has id `primary_id`.
    /// - `InvalidData` when that contact is not a primary.
    pub fn load(repo: &dyn ContactRepository, primary_id: ContactId) -> RepoResult<Self> {
        let rows = repo.find_by_cluster_root(primary_id)?;
        Self::from_rows(primary_id, rows)
    }

    pub(crate) fn from_rows(primary_id: ContactId, rows: Vec<Contact>) -> RepoResult<Self> {
        let (mut roots, mut secondaries): (Vec<Contact>, Vec<Contact>) = rows
            .into_iter()
            .partition(|contact| contact.id == primary_id);

        let primary = roots.pop().ok_or(RepoError::NotFound(primary_id))?;
        if !primary.is_primary() {
            return Err(RepoError::InvalidData(format!(
                "contact {primary_id} is referenced as a cluster root but is secondary"
            )));
        }

        secondaries.sort_by(Contact::seniority_cmp);
        let mut members = Vec::with_capacity(secondaries.len() + 1);
        members.push(primary);
        members.extend(secondaries);
        Ok(Self { members })
    }

    pub fn primary(&self) -> &Contact {
        &self.members[0]
    }

    pub fn primary_id(&self) -> ContactId {
        self.primary().id
    }

    pub fn members(&self) -> &[Contact] {
        &self.members
    }

    pub fn secondaries(&self) -> &[Contact] {
        &self.members[1..]
    }

    pub fn has_email(&self, email: &str) -> bool {
        self.members
            .iter()
            .any(|contact| contact.email.as_deref() == Some(email))
    }

    pub fn has_phone_number(&self, phone_number: &str) -> bool {
        self.members
            .iter()
            .any(|contact| contact.phone_number.as_deref() == Some(phone_number))
    }
}

/// Decision taken for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing matched: create a new primary.
    CreatePrimary,
    /// One cluster already holds every submitted value.
    Existing { primary_id: ContactId },
    /// One cluster matched and the submission carries a new value.
    Attach { primary_id: ContactId },
    /// Several clusters matched: demote every root except `survivor_id`.
    ///
    /// Never writes a new record. Each submitted value lives in at most one
    /// cluster, so two matched clusters already hold both values.
    Merge {
        survivor_id: ContactId,
        absorbed: Vec<Cluster>,
    },
}

/// Log-friendly label of a `Decision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    CreatePrimary,
    Existing,
    Attach,
    Merge,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatePrimary => "create_primary",
            Self::Existing => "existing",
            Self::Attach => "attach",
            Self::Merge => "merge",
        }
    }
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::CreatePrimary => DecisionKind::CreatePrimary,
            Self::Existing { .. } => DecisionKind::Existing,
            Self::Attach { .. } => DecisionKind::Attach,
            Self::Merge { .. } => DecisionKind::Merge,
        }
    }
}

/// Loads every distinct cluster touched by `matched`, most senior first.
pub fn load_clusters(
    repo: &dyn ContactRepository,
    matched: &[Contact],
) -> RepoResult<Vec<Cluster>> {
    let roots: BTreeSet<ContactId> = matched.iter().map(Contact::root_id).collect();
    let mut clusters = roots
        .into_iter()
        .map(|root_id| Cluster::load(repo, root_id))
        .collect::<RepoResult<Vec<_>>>()?;
    clusters.sort_by(|left, right| left.primary().seniority_cmp(right.primary()));
    Ok(clusters)
}

/// Decides how `identifiers` change the touched `clusters`.
///
/// `clusters` may come in any order; the survivor is picked by seniority.
pub fn decide(mut clusters: Vec<Cluster>, identifiers: &Identifiers) -> Decision {
    if clusters.is_empty() {
        return Decision::CreatePrimary;
    }

    clusters.sort_by(|left, right| left.primary().seniority_cmp(right.primary()));
    let survivor = clusters.remove(0);
    let survivor_id = survivor.primary_id();

    if clusters.is_empty() {
        return if introduces_new_value(&survivor, identifiers) {
            Decision::Attach {
                primary_id: survivor_id,
            }
        } else {
            Decision::Existing {
                primary_id: survivor_id,
            }
        };
    }

    Decision::Merge {
        survivor_id,
        absorbed: clusters,
    }
}

fn introduces_new_value(cluster: &Cluster, identifiers: &Identifiers) -> bool {
    let new_email = identifiers
        .email()
        .is_some_and(|email| !cluster.has_email(email));
    let new_phone = identifiers
        .phone_number()
        .is_some_and(|phone_number| !cluster.has_phone_number(phone_number));
    new_email || new_phone
}
