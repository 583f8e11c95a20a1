//! Identifier-validation challenges.
//!
//! Each mechanism pairs a server-side [`ChallengeKind`] (offers a challenge,
//! checks the client's response, runs the outbound validation probe) with a
//! client-side [`Validation`] (builds the response, stands up whatever
//! listener the probe will hit). Which kinds a server offers is
//! configuration; the dispatch is a registry keyed by the wire type name.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::api::{self, ChallengeStatus};
use crate::jws::AccountKey;
use crate::util;

mod auto;
mod dns;
mod http;
mod oob;
mod tls_sni;

pub use self::{
    auto::{AutoChallenge, AutoValidation},
    dns::{Dns01Challenge, Dns01Validation},
    http::{Http01Challenge, Http01Validation},
    oob::{Oob01Challenge, Oob01Validation},
    tls_sni::{TlsSni02Challenge, TlsSni02Validation},
};

/// The data half of a server-side challenge.
///
/// Kind-specific behaviour lives in [`ChallengeKind`]; the state is plain
/// data so the store can own and clone it freely.
#[derive(Debug, Clone)]
pub struct ChallengeState {
    /// Wire type name, e.g. `http-01`.
    pub kind: String,
    pub status: ChallengeStatus,
    /// 32 random octets, base64url.
    pub token: String,
    /// Expected `token + "." + thumbprint`, cached at offer time.
    pub key_authorization: String,
    /// Set once the client has responded; gates publishing the key
    /// authorization.
    pub responded: bool,
    /// The DNS name under validation.
    pub identifier: String,
    /// Kind-specific secrets (SNI SAN pair, OOB page token).
    pub secrets: Vec<String>,
    /// Out-of-band challenges carry the page-view URL.
    pub oob_url: Option<String>,
}

impl ChallengeState {
    pub(crate) fn new(kind: &str, identifier: &str, thumbprint: &str) -> ChallengeState {
        let token = util::random_token();
        let key_authorization = format!("{token}.{thumbprint}");
        ChallengeState {
            kind: kind.to_owned(),
            status: ChallengeStatus::Pending,
            token,
            key_authorization,
            responded: false,
            identifier: identifier.to_owned(),
            secrets: Vec::new(),
            oob_url: None,
        }
    }

    /// Public wire view.
    pub fn to_json(&self) -> Value {
        let mut out = json!({
            "type": self.kind,
            "status": self.status,
            "token": self.token,
        });
        if self.responded {
            out["keyAuthorization"] = json!(self.key_authorization);
        }
        if let Some(url) = &self.oob_url {
            out["url"] = json!(url);
        }
        out
    }
}

/// The server half of one validation mechanism.
#[async_trait]
pub trait ChallengeKind: Send + Sync {
    /// Wire type name.
    fn name(&self) -> &'static str;

    /// Create a fresh challenge for `identifier`, bound to the account with
    /// `thumbprint`.
    fn offer(&self, identifier: &str, thumbprint: &str) -> ChallengeState {
        ChallengeState::new(self.name(), identifier, thumbprint)
    }

    /// Shape-check the client's response; a mismatch fails the challenge
    /// without probing.
    fn accept(&self, state: &ChallengeState, response: &Value) -> bool {
        response["type"] == *self.name()
            && response["keyAuthorization"] == *state.key_authorization
    }

    /// Run the outbound validation probe against the applicant.
    ///
    /// An error (including timeout) drives the challenge `invalid`; it never
    /// propagates further.
    async fn probe(&self, state: &ChallengeState, env: &ProbeEnv) -> eyre::Result<()>;
}

/// The client half of one validation mechanism.
#[async_trait]
pub trait Validation: Send + Sync {
    /// Wire type name.
    fn name(&self) -> &'static str;

    /// Build the response payload POSTed to the challenge URL.
    fn make_response(&self, key: &AccountKey, challenge: &api::Challenge) -> eyre::Result<Value> {
        Ok(json!({
            "type": self.name(),
            "keyAuthorization": key_authorization(key, &challenge.token)?,
        }))
    }

    /// Stand up the listener the server probe will hit and resolve once it
    /// has been served (or the wait times out).
    async fn respond(
        &self,
        identifier: &str,
        challenge: &api::Challenge,
        response: &Value,
        env: &ValidationEnv,
    ) -> eyre::Result<()>;
}

/// `token + "." + account-key-thumbprint`.
pub fn key_authorization(key: &AccountKey, token: &str) -> eyre::Result<String> {
    Ok(format!("{token}.{}", key.thumbprint()?))
}

/// Everything a server-side probe needs to reach the applicant.
#[derive(Clone)]
pub struct ProbeEnv {
    pub(crate) http: reqwest::Client,
    pub http_port: u16,
    pub tls_port: u16,
    /// TCP resolver for dns-01; `None` uses the system configuration.
    pub dns_server: Option<SocketAddr>,
    pub timeout: Duration,
    pub(crate) oob: OobRegistry,
}

impl ProbeEnv {
    pub fn new(
        http_port: u16,
        tls_port: u16,
        dns_server: Option<SocketAddr>,
        timeout: Duration,
    ) -> ProbeEnv {
        ProbeEnv {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            http_port,
            tls_port,
            dns_server,
            timeout,
            oob: OobRegistry::default(),
        }
    }
}

impl Default for ProbeEnv {
    fn default() -> Self {
        ProbeEnv::new(80, 443, None, Duration::from_secs(5))
    }
}

/// Listener configuration for client-side responders.
#[derive(Debug, Clone)]
pub struct ValidationEnv {
    pub bind: IpAddr,
    pub http_port: u16,
    pub tls_port: u16,
    pub dns_port: u16,
    /// How long a responder waits to be probed.
    pub timeout: Duration,
}

impl Default for ValidationEnv {
    fn default() -> Self {
        ValidationEnv {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            tls_port: 443,
            dns_port: 53,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Pending out-of-band page views, keyed by page token.
///
/// Lives outside the store lock so the fetch handler can record views while
/// a challenge update is waiting.
#[derive(Clone, Default)]
pub struct OobRegistry {
    inner: Arc<parking_lot::Mutex<HashMap<String, OobSlot>>>,
}

enum OobSlot {
    /// Exposed, not yet visited.
    Pending,
    /// Visited before anyone started waiting.
    Viewed,
    /// A challenge update is blocked on the visit.
    Waiting(tokio::sync::oneshot::Sender<()>),
}

impl OobRegistry {
    /// Make a page token known, so page views on it answer 200.
    pub fn expose(&self, token: &str) {
        self.inner
            .lock()
            .entry(token.to_owned())
            .or_insert(OobSlot::Pending);
    }

    /// Record a page view; returns false for unknown tokens.
    pub fn page_view(&self, token: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.remove(token) {
            Some(OobSlot::Waiting(tx)) => {
                let _ = tx.send(());
                inner.insert(token.to_owned(), OobSlot::Viewed);
                true
            }
            Some(_) => {
                inner.insert(token.to_owned(), OobSlot::Viewed);
                true
            }
            None => false,
        }
    }

    /// Wait for a page view; resolves immediately if one already happened.
    pub fn wait(&self, token: &str) -> tokio::sync::oneshot::Receiver<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut inner = self.inner.lock();
        let viewed = matches!(inner.get(token), Some(OobSlot::Viewed));
        if viewed {
            let _ = tx.send(());
        } else {
            inner.insert(token.to_owned(), OobSlot::Waiting(tx));
        }
        rx
    }
}

/// Server-side registry lookup by wire type name.
pub fn server_kind(name: &str) -> Option<Arc<dyn ChallengeKind>> {
    match name {
        "http-01" => Some(Arc::new(Http01Challenge)),
        "dns-01" => Some(Arc::new(Dns01Challenge)),
        "tls-sni-02" => Some(Arc::new(TlsSni02Challenge)),
        "oob-01" => Some(Arc::new(Oob01Challenge)),
        "auto" => Some(Arc::new(AutoChallenge)),
        _ => None,
    }
}

/// Resolve a configured list of type names, skipping unknown entries.
pub fn server_kinds(names: &[String]) -> Vec<Arc<dyn ChallengeKind>> {
    names
        .iter()
        .filter_map(|name| {
            let kind = server_kind(name);
            if kind.is_none() {
                log::warn!("ignoring unknown challenge type {name:?}");
            }
            kind
        })
        .collect()
}

/// Every client-side responder this crate ships.
pub fn default_validations() -> Vec<Arc<dyn Validation>> {
    vec![
        Arc::new(Http01Validation),
        Arc::new(Dns01Validation),
        Arc::new(TlsSni02Validation),
        Arc::new(Oob01Validation),
        Arc::new(AutoValidation),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_json_hides_key_authorization_until_responded() {
        let mut state = ChallengeState::new("http-01", "example.com", "thumb");
        let out = state.to_json();
        assert_eq!(out["type"], "http-01");
        assert_eq!(out["status"], "pending");
        assert!(out.get("keyAuthorization").is_none());

        state.responded = true;
        let out = state.to_json();
        assert_eq!(
            out["keyAuthorization"],
            format!("{}.thumb", state.token).as_str()
        );
    }

    #[test]
    fn test_default_accept_checks_type_and_key_authorization() {
        let kind = Http01Challenge;
        let state = ChallengeState::new("http-01", "example.com", "thumb");
        let good = json!({
            "type": "http-01",
            "keyAuthorization": state.key_authorization,
        });
        assert!(kind.accept(&state, &good));
        assert!(!kind.accept(&state, &json!({ "type": "dns-01" })));
        assert!(!kind.accept(
            &state,
            &json!({ "type": "http-01", "keyAuthorization": "nope" })
        ));
    }

    #[test]
    fn test_registry_lookup() {
        for name in ["http-01", "dns-01", "tls-sni-02", "oob-01", "auto"] {
            assert_eq!(server_kind(name).unwrap().name(), name);
        }
        assert!(server_kind("tls-alpn-01").is_none());

        let kinds = server_kinds(&["http-01".to_owned(), "bogus".to_owned()]);
        assert_eq!(kinds.len(), 1);
    }

    #[tokio::test]
    async fn test_oob_registry_view_then_wait() {
        let registry = OobRegistry::default();
        registry.expose("tok");
        assert!(registry.page_view("tok"));
        registry.wait("tok").await.unwrap();
    }

    #[tokio::test]
    async fn test_oob_registry_wait_then_view() {
        let registry = OobRegistry::default();
        registry.expose("tok");
        let rx = registry.wait("tok");
        assert!(registry.page_view("tok"));
        rx.await.unwrap();
        assert!(!registry.page_view("unknown"));
    }
}
