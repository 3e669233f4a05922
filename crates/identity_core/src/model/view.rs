//! Identity view and request/response wire shapes.
//!
//! # Responsibility
//! - Define the resolved identity summary returned to callers.
//! - Define JSON request/response envelopes used by the identify endpoint.
//!
//! # Invariants
//! - `emails` / `phone_numbers` are deduplicated, primary values first.
//! - `secondary_contact_ids` follow `(created_at, id)` order.

use crate::model::contact::{ContactId, ContactValidationError, Identifiers};
use serde::{Deserialize, Deserializer, Serialize};

/// Resolved identity summary for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Identify request body.
///
/// `phoneNumber` is accepted as either a JSON string or a JSON number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "deserialize_phone")]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    /// Converts the raw body into a validated identifier pair.
    pub fn identifiers(&self) -> Result<Identifiers, ContactValidationError> {
        Identifiers::new(self.email.as_deref(), self.phone_number.as_deref())
    }
}

/// Identify response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifyResponse {
    pub contact: IdentityView,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPhone {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

fn deserialize_phone<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawPhone>::deserialize(deserializer)?;
    Ok(raw.map(|value| match value {
        RawPhone::Text(text) => text,
        RawPhone::Unsigned(number) => number.to_string(),
        RawPhone::Signed(number) => number.to_string(),
    }))
}
