//! Contact domain model.
//!
//! # Responsibility
//! - Define the canonical contact record and its link precedence.
//! - Provide the total order used for primary selection.
//! - Validate submitted identifier pairs before any storage access.
//!
//! # Invariants
//! - `id` is assigned by storage, strictly increasing, never reused.
//! - `linked_id` is `Some` iff `link_precedence == Secondary`.
//! - At least one of `email` / `phone_number` is present.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Storage-assigned contact identifier.
pub type ContactId = i64;

/// Role of a contact inside its identity cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    /// Representative record of the cluster.
    Primary,
    /// Member linked directly to the cluster primary.
    Secondary,
}

impl LinkPrecedence {
    /// Storage/text form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    /// Parses storage/text form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// Validation failures for contact records and submitted identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactValidationError {
    /// Neither email nor phone number is present.
    MissingIdentifiers,
    /// Secondary record without a linked primary.
    SecondaryWithoutLink,
    /// Primary record carrying a linked id.
    PrimaryWithLink(ContactId),
    /// Secondary record linked to itself.
    SelfLink(ContactId),
}

impl Display for ContactValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingIdentifiers => write!(f, "email or phoneNumber is required"),
            Self::SecondaryWithoutLink => write!(f, "secondary contact requires linked_id"),
            Self::PrimaryWithLink(linked_id) => {
                write!(f, "primary contact must not link to {linked_id}")
            }
            Self::SelfLink(id) => write!(f, "contact {id} cannot link to itself"),
        }
    }
}

impl Error for ContactValidationError {}

/// Canonical persisted contact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    /// Cluster primary for secondaries, `None` for primaries.
    pub linked_id: Option<ContactId>,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds. Bumped when the record is demoted or relinked.
    pub updated_at: i64,
}

impl Contact {
    /// Checks record-level invariants.
    pub fn validate(&self) -> Result<(), ContactValidationError> {
        if self.email.is_none() && self.phone_number.is_none() {
            return Err(ContactValidationError::MissingIdentifiers);
        }
        validate_link(self.link_precedence, self.linked_id)?;
        if self.linked_id == Some(self.id) {
            return Err(ContactValidationError::SelfLink(self.id));
        }
        Ok(())
    }

    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Id of the cluster primary this record belongs to.
    ///
    /// Secondaries point directly at their primary, so this never walks
    /// further than one hop.
    pub fn root_id(&self) -> ContactId {
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Secondary, Some(linked_id)) => linked_id,
            _ => self.id,
        }
    }

    /// Total order used for primary selection: `(created_at, id)` ascending.
    pub fn seniority_cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Checks the precedence/link pairing shared by records and store writes.
pub fn validate_link(
    precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<(), ContactValidationError> {
    match (precedence, linked_id) {
        (LinkPrecedence::Primary, Some(linked_id)) => {
            Err(ContactValidationError::PrimaryWithLink(linked_id))
        }
        (LinkPrecedence::Secondary, None) => Err(ContactValidationError::SecondaryWithoutLink),
        _ => Ok(()),
    }
}

/// A validated `(email?, phone?)` pair with at least one value present.
///
/// Blank strings count as absent. Non-blank values are kept verbatim since
/// matching is exact equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifiers {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Identifiers {
    pub fn new(
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Self, ContactValidationError> {
        let email = non_blank(email);
        let phone_number = non_blank(phone_number);
        if email.is_none() && phone_number.is_none() {
            return Err(ContactValidationError::MissingIdentifiers);
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}
