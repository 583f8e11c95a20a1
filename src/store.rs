//! In-memory resource store.
//!
//! All server state lives here, keyed by `(type, id)`. Cross-references are
//! ids or absolute URLs, never back-pointers, so the object graph stays a
//! DAG. The store is process-local and only touched under the server's lock.

use std::collections::HashMap;

use serde_json::json;
use time::OffsetDateTime;

use crate::api::{ApplicationStatus, AuthorizationStatus, Identifier, Requirement};
use crate::challenges::ChallengeState;
use crate::jws::Jwk;
use crate::util;

/// A registered account, created by new-reg.
///
/// There is at most one registration per account-key thumbprint.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub key: Jwk,
    pub thumbprint: String,
    pub contact: Vec<String>,
    pub agreement: Option<String>,
}

impl Registration {
    /// Public view: key, contact and agreement only.
    pub fn marshal(&self) -> serde_json::Value {
        let mut out = json!({
            "key": self.key,
            "contact": self.contact,
        });
        if let Some(agreement) = &self.agreement {
            out["agreement"] = json!(agreement);
        }
        out
    }
}

/// A certificate application, created by new-app.
#[derive(Debug, Clone)]
pub struct Application {
    pub id: String,
    pub reg_id: String,
    /// CSR in base64url DER, echoed verbatim to the client.
    pub csr: String,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub status: ApplicationStatus,
    pub requirements: Vec<Requirement>,
    /// Certificate URL once issued.
    pub certificate: Option<String>,
}

impl Application {
    pub fn marshal(&self) -> serde_json::Value {
        let mut out = json!({
            "status": self.status,
            "csr": self.csr,
            "requirements": self.requirements,
        });
        if let Some(not_before) = &self.not_before {
            out["notBefore"] = json!(not_before);
        }
        if let Some(not_after) = &self.not_after {
            out["notAfter"] = json!(not_after);
        }
        if let Some(certificate) = &self.certificate {
            out["certificate"] = json!(certificate);
        }
        out
    }
}

/// An authorization for one identifier, owned by one registration.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub id: String,
    pub reg_id: String,
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    /// RFC 3339 expiry.
    pub expires: String,
    pub challenges: Vec<ChallengeState>,
}

impl Authorization {
    pub fn is_expired(&self) -> bool {
        match util::parse_rfc3339(&self.expires) {
            Ok(t) => t <= OffsetDateTime::now_utc(),
            Err(_) => true,
        }
    }

    /// Usable for new applications: pending or valid, and not expired.
    pub fn is_reusable(&self) -> bool {
        matches!(
            self.status,
            AuthorizationStatus::Pending | AuthorizationStatus::Valid
        ) && !self.is_expired()
    }

    pub fn marshal(&self) -> serde_json::Value {
        json!({
            "identifier": self.identifier,
            "status": self.status,
            "expires": self.expires,
            "challenges": self
                .challenges
                .iter()
                .map(ChallengeState::to_json)
                .collect::<Vec<_>>(),
        })
    }
}

/// An issued certificate. Immutable apart from the revocation flags.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub id: String,
    pub reg_id: String,
    pub der: Vec<u8>,
    pub revoked: bool,
    pub revocation_reason: Option<u8>,
}

/// Subject of an out-of-band requirement; a page view drives it valid.
#[derive(Debug, Clone)]
pub struct OobSubject {
    pub id: String,
    pub reg_id: String,
    pub status: AuthorizationStatus,
}

impl OobSubject {
    pub fn marshal(&self) -> serde_json::Value {
        json!({ "status": self.status })
    }
}

/// The typed arena holding every server resource.
#[derive(Debug, Default)]
pub struct Store {
    registrations: HashMap<String, Registration>,
    applications: HashMap<String, Application>,
    authorizations: HashMap<String, Authorization>,
    certificates: HashMap<String, Certificate>,
    oob_subjects: HashMap<String, OobSubject>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn fresh_id(&self) -> String {
        util::random_id()
    }

    pub fn insert_registration(&mut self, reg: Registration) {
        self.registrations.insert(reg.id.clone(), reg);
    }

    pub fn registration(&self, id: &str) -> Option<&Registration> {
        self.registrations.get(id)
    }

    pub fn registration_mut(&mut self, id: &str) -> Option<&mut Registration> {
        self.registrations.get_mut(id)
    }

    /// Account deactivation deletes the record outright.
    pub fn remove_registration(&mut self, id: &str) -> Option<Registration> {
        self.registrations.remove(id)
    }

    /// Thumbprints are unique across registrations.
    pub fn reg_by_thumbprint(&self, thumbprint: &str) -> Option<&Registration> {
        self.registrations
            .values()
            .find(|reg| reg.thumbprint == thumbprint)
    }

    pub fn insert_application(&mut self, app: Application) {
        self.applications.insert(app.id.clone(), app);
    }

    pub fn application(&self, id: &str) -> Option<&Application> {
        self.applications.get(id)
    }

    pub fn application_mut(&mut self, id: &str) -> Option<&mut Application> {
        self.applications.get_mut(id)
    }

    /// Applications of one registration, in no particular order.
    pub fn application_ids_of(&self, reg_id: &str) -> Vec<String> {
        self.applications
            .values()
            .filter(|app| app.reg_id == reg_id)
            .map(|app| app.id.clone())
            .collect()
    }

    pub fn insert_authorization(&mut self, authz: Authorization) {
        self.authorizations.insert(authz.id.clone(), authz);
    }

    pub fn authorization(&self, id: &str) -> Option<&Authorization> {
        self.authorizations.get(id)
    }

    pub fn authorization_mut(&mut self, id: &str) -> Option<&mut Authorization> {
        self.authorizations.get_mut(id)
    }

    /// A reusable authorization held by `reg_id` for `name`.
    pub fn authz_for(&self, reg_id: &str, name: &str) -> Option<&Authorization> {
        self.authorizations.values().find(|authz| {
            authz.reg_id == reg_id && authz.identifier.value == name && authz.is_reusable()
        })
    }

    /// True iff `reg_id` holds a valid authorization for every name.
    pub fn authorized_for(&self, reg_id: &str, names: &[String]) -> bool {
        names.iter().all(|name| {
            self.authorizations.values().any(|authz| {
                authz.reg_id == reg_id
                    && authz.identifier.value == *name
                    && authz.status == AuthorizationStatus::Valid
                    && !authz.is_expired()
            })
        })
    }

    pub fn insert_certificate(&mut self, cert: Certificate) {
        self.certificates.insert(cert.id.clone(), cert);
    }

    pub fn certificate(&self, id: &str) -> Option<&Certificate> {
        self.certificates.get(id)
    }

    pub fn certificate_mut(&mut self, id: &str) -> Option<&mut Certificate> {
        self.certificates.get_mut(id)
    }

    /// Exact byte-equality lookup used by revoke-cert.
    pub fn cert_by_value(&self, der: &[u8]) -> Option<&Certificate> {
        self.certificates.values().find(|cert| cert.der == der)
    }

    pub fn insert_oob_subject(&mut self, subject: OobSubject) {
        self.oob_subjects.insert(subject.id.clone(), subject);
    }

    pub fn oob_subject_mut(&mut self, id: &str) -> Option<&mut OobSubject> {
        self.oob_subjects.get_mut(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str, thumbprint: &str) -> Registration {
        Registration {
            id: id.to_owned(),
            key: crate::jws::AccountKey::generate().jwk(),
            thumbprint: thumbprint.to_owned(),
            contact: vec!["mailto:foo@bar.com".to_owned()],
            agreement: None,
        }
    }

    fn authz(store: &Store, reg_id: &str, name: &str, status: AuthorizationStatus) -> Authorization {
        Authorization {
            id: store.fresh_id(),
            reg_id: reg_id.to_owned(),
            identifier: Identifier::dns(name),
            status,
            expires: util::format_rfc3339(util::now_plus_secs(3600)),
            challenges: vec![],
        }
    }

    #[test]
    fn test_reg_by_thumbprint() {
        let mut store = Store::new();
        store.insert_registration(reg("r1", "tp-1"));
        store.insert_registration(reg("r2", "tp-2"));
        assert_eq!(store.reg_by_thumbprint("tp-2").unwrap().id, "r2");
        assert!(store.reg_by_thumbprint("tp-3").is_none());

        store.remove_registration("r2");
        assert!(store.reg_by_thumbprint("tp-2").is_none());
    }

    #[test]
    fn test_authz_for_skips_terminal_and_expired() {
        let mut store = Store::new();
        store.insert_registration(reg("r1", "tp-1"));

        let invalid = authz(&store, "r1", "example.com", AuthorizationStatus::Invalid);
        store.insert_authorization(invalid);
        assert!(store.authz_for("r1", "example.com").is_none());

        let mut expired = authz(&store, "r1", "example.com", AuthorizationStatus::Valid);
        expired.expires = "2000-01-01T00:00:00Z".to_owned();
        store.insert_authorization(expired);
        assert!(store.authz_for("r1", "example.com").is_none());

        let good = authz(&store, "r1", "example.com", AuthorizationStatus::Pending);
        let good_id = good.id.clone();
        store.insert_authorization(good);
        assert_eq!(store.authz_for("r1", "example.com").unwrap().id, good_id);
        // Wrong owner never matches.
        assert!(store.authz_for("r2", "example.com").is_none());
    }

    #[test]
    fn test_authorized_for_needs_every_name() {
        let mut store = Store::new();
        store.insert_authorization(authz(&store, "r1", "a.com", AuthorizationStatus::Valid));
        store.insert_authorization(authz(&store, "r1", "b.com", AuthorizationStatus::Pending));

        assert!(store.authorized_for("r1", &["a.com".to_owned()]));
        assert!(!store.authorized_for("r1", &["a.com".to_owned(), "b.com".to_owned()]));
    }

    #[test]
    fn test_cert_by_value() {
        let mut store = Store::new();
        store.insert_certificate(Certificate {
            id: "c1".to_owned(),
            reg_id: "r1".to_owned(),
            der: vec![1, 2, 3],
            revoked: false,
            revocation_reason: None,
        });
        assert_eq!(store.cert_by_value(&[1, 2, 3]).unwrap().id, "c1");
        assert!(store.cert_by_value(&[1, 2]).is_none());
    }

    #[test]
    fn test_registration_marshal_hides_private_fields() {
        let record = reg("r1", "tp-1");
        let out = record.marshal();
        assert!(out.get("id").is_none());
        assert!(out.get("thumbprint").is_none());
        assert_eq!(out["contact"][0], "mailto:foo@bar.com");
    }
}
