//! JSON wire payloads shared by both peers.
//!
//! One file per resource, mirroring the protocol's resource model. These are
//! the public shapes only; server-side records live in the store.

use std::fmt;

use serde::{Deserialize, Serialize};

mod application;
mod authorization;
mod challenge;
mod directory;
mod keychange;
mod registration;
mod revocation;

pub use self::{
    application::{Application, ApplicationStatus, NewApplication, Requirement},
    authorization::{Authorization, AuthorizationStatus},
    challenge::{Challenge, ChallengeStatus},
    directory::{Directory, DirectoryMeta},
    keychange::KeyChange,
    registration::Registration,
    revocation::{Revocation, RevocationReason},
};

pub const JOSE_JSON: &str = "application/jose+json";
pub const PROBLEM_JSON: &str = "application/problem+json";
pub const PKIX_CERT: &str = "application/pkix-cert";
pub const JSON: &str = "application/json";

const ERROR_URN: &str = "urn:ietf:params:acme:error:";

/// An identifier to be validated, currently always a DNS name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Identifier {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }

    pub fn is_type_dns(&self) -> bool {
        self._type == "dns"
    }
}

/// An RFC 7807 problem document with the ACME error URN namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Seconds carried on the `Retry-After` header, never in the body.
    #[serde(skip)]
    pub retry_after: Option<u64>,

    /// Carried on the `Location` header (409 duplicate registration), never
    /// in the body.
    #[serde(skip)]
    pub location: Option<String>,
}

impl Problem {
    fn acme(kind: &str, status: u16, detail: impl Into<String>) -> Self {
        Problem {
            _type: format!("{ERROR_URN}{kind}"),
            detail: Some(detail.into()),
            status: Some(status),
            retry_after: None,
            location: None,
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::acme("malformed", 400, detail)
    }

    /// A malformed problem with a non-default HTTP status (the scheme gate
    /// answers 500).
    pub fn malformed_with_status(status: u16, detail: impl Into<String>) -> Self {
        Self::acme("malformed", status, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::acme("unauthorized", 401, detail)
    }

    /// 403 variant of `unauthorized`, used where the account is known but
    /// not permitted to act.
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::acme("unauthorized", 403, detail)
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        let mut problem = Self::acme("rateLimited", 403, "too many requests");
        problem.retry_after = Some(retry_after);
        problem
    }

    pub fn not_found() -> Self {
        Self::acme("malformed", 404, "no such resource")
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::acme("malformed", 409, detail)
    }

    pub fn server_internal() -> Self {
        Self::acme("serverInternal", 500, "internal error")
    }

    pub fn with_location(mut self, url: impl Into<String>) -> Self {
        self.location = Some(url.into());
        self
    }

    pub fn http_status(&self) -> u16 {
        self.status.unwrap_or(400)
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self._type == format!("{ERROR_URN}{kind}")
    }

    pub fn is_rate_limited(&self) -> bool {
        self.is_kind("rateLimited")
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            None => write!(f, "{}", self._type),
        }
    }
}

impl std::error::Error for Problem {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_kinds() {
        let p = Problem::malformed("JWS verification error");
        assert_eq!(p._type, "urn:ietf:params:acme:error:malformed");
        assert_eq!(p.http_status(), 400);
        assert!(p.is_kind("malformed"));

        let p = Problem::rate_limited(12);
        assert!(p.is_rate_limited());
        assert_eq!(p.retry_after, Some(12));
        // retry_after never serializes into the document.
        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("retry_after").is_none());
    }

    #[test]
    fn test_identifier_dns() {
        let id = Identifier::dns("example.com");
        assert!(id.is_type_dns());
        assert_eq!(
            serde_json::to_value(&id).unwrap(),
            serde_json::json!({ "type": "dns", "value": "example.com" })
        );
    }
}
