//! Exact-match lookup of stored contacts by submitted identifiers.

use crate::model::contact::{Contact, Identifiers};
use crate::repo::contact_repo::{ContactRepository, RepoResult};

/// Returns every contact sharing the submitted email or phone number,
/// oldest first under `Contact::seniority_cmp`.
///
/// `Identifiers` guarantees at least one value is present, so the
/// both-absent case is rejected before this runs.
pub fn find_matches(
    repo: &dyn ContactRepository,
    identifiers: &Identifiers,
) -> RepoResult<Vec<Contact>> {
    let mut matched = repo.find_by_identifiers(identifiers.email(), identifiers.phone_number())?;
    matched.sort_by(Contact::seniority_cmp);
    Ok(matched)
}
