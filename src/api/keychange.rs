use serde::{Deserialize, Serialize};

/// Payload of the inner JWS in a key-change request.
///
/// The inner JWS is signed with the account's current (old) key; the outer
/// JWS is signed with the replacement key. Thumbprints bind both halves to
/// the registration being rolled over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChange {
    /// Registration URL of the account whose key is being replaced.
    pub account: String,

    /// Thumbprint of the current account key.
    pub old_key: String,

    /// Thumbprint of the replacement key; must match the outer signer.
    pub new_key: String,
}
