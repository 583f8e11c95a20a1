use serde::{Deserialize, Serialize};

use crate::api::AuthorizationStatus;

/// Status of an [`Application`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Valid,
    Invalid,
}

/// A certificate application.
///
/// Tracks a request for a certificate from submission through requirement
/// fulfilment to issuance.
///
/// # Example JSON
///
/// ```json
/// {
///   "status": "pending",
///   "csr": "5jNudRx6Ye4HzKEqT5...FS6aKdZeGsysoCo4H9P",
///   "notBefore": "2016-01-01T00:00:00Z",
///   "notAfter": "2016-01-08T00:00:00Z",
///   "requirements": [
///     {
///       "type": "authorization",
///       "url": "https://ca.example/acme/authz/ZSuY2cJV",
///       "status": "pending"
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplicationStatus>,

    /// CSR in base64url-encoded DER, echoed verbatim from the request.
    pub csr: String,

    /// Uses RFC 3339 format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,

    /// Uses RFC 3339 format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Vec<Requirement>>,

    /// Certificate URL, present once issuance has happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

/// The new-app request payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApplication {
    pub csr: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
}

/// One precondition an application must satisfy before issuance.
///
/// The status mirrors the referenced subject and never regresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Requirement {
    Authorization {
        url: String,
        status: AuthorizationStatus,
    },
    OutOfBand {
        url: String,
        status: AuthorizationStatus,
    },
}

impl Requirement {
    pub fn url(&self) -> &str {
        match self {
            Requirement::Authorization { url, .. } | Requirement::OutOfBand { url, .. } => url,
        }
    }

    pub fn status(&self) -> AuthorizationStatus {
        match self {
            Requirement::Authorization { status, .. } | Requirement::OutOfBand { status, .. } => {
                *status
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status() == AuthorizationStatus::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requirement_tagging() {
        let req = Requirement::Authorization {
            url: "https://ca.example/acme/authz/1".into(),
            status: AuthorizationStatus::Pending,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "authorization");
        assert_eq!(json["status"], "pending");

        let req = Requirement::OutOfBand {
            url: "https://ca.example/acme/oob/2".into(),
            status: AuthorizationStatus::Valid,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "out-of-band");
        assert!(serde_json::from_value::<Requirement>(json).unwrap().is_valid());
    }

    #[test]
    fn test_application_field_names() {
        let app = Application {
            status: Some(ApplicationStatus::Pending),
            csr: "abc".into(),
            not_before: Some("2016-01-01T00:00:00Z".into()),
            not_after: None,
            requirements: Some(vec![]),
            certificate: None,
        };
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json["notBefore"], "2016-01-01T00:00:00Z");
        assert!(json.get("notAfter").is_none());
        assert!(json.get("certificate").is_none());
    }
}
