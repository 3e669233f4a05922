//! Projection of a cluster into the externally visible identity view.

use crate::model::contact::ContactId;
use crate::model::view::IdentityView;
use crate::reconcile::resolver::Cluster;
use crate::repo::contact_repo::{ContactRepository, RepoResult};

/// Loads the cluster rooted at `primary_id` and projects it.
pub fn build_view(repo: &dyn ContactRepository, primary_id: ContactId) -> RepoResult<IdentityView> {
    let cluster = Cluster::load(repo, primary_id)?;
    Ok(project(&cluster))
}

/// Projects one cluster: primary values first, then secondaries in
/// seniority order, duplicates and nulls dropped.
pub fn project(cluster: &Cluster) -> IdentityView {
    let mut emails: Vec<String> = Vec::new();
    let mut phone_numbers: Vec<String> = Vec::new();

    for contact in cluster.members() {
        push_unique(&mut emails, contact.email.as_deref());
        push_unique(&mut phone_numbers, contact.phone_number.as_deref());
    }

    IdentityView {
        primary_contact_id: cluster.primary_id(),
        emails,
        phone_numbers,
        secondary_contact_ids: cluster
            .secondaries()
            .iter()
            .map(|contact| contact.id)
            .collect(),
    }
}

fn push_unique(values: &mut Vec<String>, value: Option<&str>) {
    if let Some(value) = value {
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }
}
