use serde::{Deserialize, Serialize};

/// Directory object for client self-configuration.
///
/// # Example JSON
///
/// ```json
/// {
///   "directory": "https://ca.example/acme/directory",
///   "new-reg": "https://ca.example/acme/new-reg",
///   "new-app": "https://ca.example/acme/new-app",
///   "key-change": "https://ca.example/acme/key-change",
///   "revoke-cert": "https://ca.example/acme/revoke-cert",
///   "meta": {
///     "terms-of-service": "https://ca.example/terms"
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// URL of the directory itself.
    pub directory: String,

    #[serde(rename = "new-reg")]
    pub new_reg: String,

    #[serde(rename = "new-app")]
    pub new_app: String,

    #[serde(rename = "key-change")]
    pub key_change: String,

    #[serde(rename = "revoke-cert")]
    pub revoke_cert: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryMeta {
    /// URL identifying the current terms of service.
    #[serde(rename = "terms-of-service", skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    #[serde(rename = "caa-identities", skip_serializing_if = "Option::is_none")]
    pub caa_identities: Option<Vec<String>>,
}

impl Directory {
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta.as_ref()?.terms_of_service.as_deref()
    }
}
