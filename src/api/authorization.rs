use serde::{Deserialize, Serialize};

use crate::api::{Challenge, Identifier};

/// Status of an [`Authorization`] and of application requirements.
///
/// Transitions form a DAG rooted at `pending`; a terminal status never
/// regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
}

/// An authorization: one account's proof of control over one identifier.
///
/// # Example JSON
///
/// ```json
/// {
///   "identifier": { "type": "dns", "value": "not-example.com" },
///   "status": "pending",
///   "expires": "2016-03-02T12:00:00Z",
///   "challenges": [
///     {
///       "type": "http-01",
///       "status": "pending",
///       "token": "DGyRejmCefe7v4NfDGDKfA"
///     }
///   ]
/// }
/// ```
///
/// Challenges are addressed as `{authorization-url}/{index}` by their
/// ordinal; they carry no URL of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,

    pub status: AuthorizationStatus,

    /// The timestamp after which the server considers this authorization
    /// invalid. Uses RFC 3339 format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    pub challenges: Vec<Challenge>,

    /// Optional sets of challenge indices; completing every challenge of any
    /// one set satisfies the authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combinations: Option<Vec<Vec<usize>>>,
}
