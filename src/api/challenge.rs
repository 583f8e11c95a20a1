use serde::{Deserialize, Serialize};

/// Status of a [`Challenge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid,
}

/// Public view of a challenge, as served inside an authorization.
///
/// # Example JSON
///
/// ```json
/// {
///   "type": "http-01",
///   "status": "valid",
///   "token": "DGyRejmCefe7v4NfDGDKfA",
///   "keyAuthorization": "DGyRejmCefe7v4NfDGDKfA.9jg46WB3rR_AHD-EBXdN7cBkH1WOu0tA3M9fm21mqTI"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    #[serde(rename = "type")]
    pub _type: String,

    pub status: ChallengeStatus,

    /// 32 random octets, base64url encoded without padding.
    pub token: String,

    /// `token + "." + account-key-thumbprint`; published once the client has
    /// responded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_authorization: Option<String>,

    /// Out-of-band challenges carry the URL the client must visit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
