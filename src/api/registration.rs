use serde::{Deserialize, Serialize};

use crate::jws::Jwk;

/// A registration resource, doubling as the new-reg/update-reg payload.
///
/// The server echoes `key` on responses; clients never send it.
///
/// # Example JSON
///
/// ```json
/// {
///   "key": { "kty": "EC", "crv": "P-256", "...": "..." },
///   "contact": ["mailto:anonymous@example.com"],
///   "agreement": "https://ca.example/terms"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Registration {
    pub fn is_deactivation(&self) -> bool {
        self.status.as_deref() == Some("deactivated")
    }
}
