//! The ACME client core.
//!
//! Drives the full life cycle against a server: registration, key rollover,
//! certificate applications (fulfilling authorization requirements via the
//! registered [`Validation`] responders), polling, retrieval and
//! revocation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::api::{self, AuthorizationStatus};
use crate::challenges::{self, Validation, ValidationEnv};
use crate::jws::AccountKey;
use crate::pki;
use crate::util;

mod trans;

use trans::Transport;

/// How long we poll an application for issuance.
const ISSUANCE_POLL_ATTEMPTS: usize = 30;
const ISSUANCE_POLL_SPACING: Duration = Duration::from_millis(500);

/// A certificate retrieved through [`AcmeClient::request_certificate`].
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub url: String,
    pub der: Vec<u8>,
}

/// Callback deciding whether to agree to a terms-of-service URL.
pub type AgreementCallback = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct AcmeClient {
    trans: Transport,
    directory_url: String,
    directory: Option<api::Directory>,
    key: AccountKey,
    registration_url: Option<String>,
    validations: Vec<Arc<dyn Validation>>,
    env: ValidationEnv,
    agreement_callback: Option<AgreementCallback>,
}

impl AcmeClient {
    /// A client for the given directory URL with a fresh account key.
    pub fn new(directory_url: &str) -> eyre::Result<AcmeClient> {
        Self::build(directory_url, false)
    }

    /// Accept plain-http directory and resource URLs. Debugging and tests
    /// only.
    pub fn new_insecure(directory_url: &str) -> eyre::Result<AcmeClient> {
        Self::build(directory_url, true)
    }

    fn build(directory_url: &str, allow_insecure: bool) -> eyre::Result<AcmeClient> {
        Ok(AcmeClient {
            trans: Transport::new(directory_url, allow_insecure)?,
            directory_url: directory_url.to_owned(),
            directory: None,
            key: AccountKey::generate(),
            registration_url: None,
            validations: challenges::default_validations(),
            env: ValidationEnv::default(),
            agreement_callback: None,
        })
    }

    pub fn with_key(mut self, key: AccountKey) -> AcmeClient {
        self.key = key;
        self
    }

    /// Replace the registered validation responders.
    pub fn with_validations(mut self, validations: Vec<Arc<dyn Validation>>) -> AcmeClient {
        self.validations = validations;
        self
    }

    pub fn with_validation_env(mut self, env: ValidationEnv) -> AcmeClient {
        self.env = env;
        self
    }

    pub fn with_agreement_callback(mut self, callback: AgreementCallback) -> AcmeClient {
        self.agreement_callback = Some(callback);
        self
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn registration_url(&self) -> Option<&str> {
        self.registration_url.as_deref()
    }

    /// Fetch (and cache) the directory.
    pub async fn directory(&mut self) -> eyre::Result<api::Directory> {
        if let Some(directory) = &self.directory {
            return Ok(directory.clone());
        }
        let directory: api::Directory = self.trans.get_json(&self.directory_url).await?;
        self.directory = Some(directory.clone());
        Ok(directory)
    }

    /// Create a registration for this client's key.
    ///
    /// Validates the echoed key and contact list, remembers the
    /// registration URL, and agrees to the terms of service when a link is
    /// present and the agreement callback approves.
    pub async fn register(&mut self, contact: &[String]) -> eyre::Result<()> {
        let directory = self.directory().await?;
        let payload = json!({ "contact": contact });
        let reply = self
            .trans
            .post(&self.key, &directory.new_reg, Some(&payload))
            .await?;
        eyre::ensure!(
            reply.status == 201,
            "registration got HTTP {}",
            reply.status
        );

        let registration: api::Registration = reply.json()?;
        eyre::ensure!(
            registration.key.as_ref() == Some(&self.key.jwk()),
            "server echoed a different account key"
        );
        eyre::ensure!(
            registration.contact.as_deref() == Some(contact),
            "server echoed a different contact list"
        );

        let location = reply
            .location
            .clone()
            .ok_or_else(|| eyre::eyre!("no Location header on the registration"))?;
        log::debug!("registered as {location}");
        self.registration_url = Some(location.clone());

        let terms = reply
            .terms_link
            .clone()
            .or_else(|| directory.terms_of_service().map(str::to_owned));
        if let (Some(terms), Some(callback)) = (terms, &self.agreement_callback) {
            if callback(&terms) {
                log::debug!("agreeing to terms at {terms}");
                let agreement = json!({ "agreement": terms });
                self.trans
                    .post(&self.key, &location, Some(&agreement))
                    .await?;
            }
        }
        Ok(())
    }

    /// Replace the account key via the key-change protocol.
    ///
    /// The old key stays in place unless the server accepts the rollover.
    pub async fn change_key(&mut self, new_key: AccountKey) -> eyre::Result<()> {
        let directory = self.directory().await?;
        let account = self
            .registration_url
            .clone()
            .ok_or_else(|| eyre::eyre!("no registration to roll over"))?;

        let proof = serde_json::to_value(api::KeyChange {
            account,
            old_key: self.key.thumbprint()?,
            new_key: new_key.thumbprint()?,
        })?;
        // The inner JWS is signed by the outgoing key over the same URL.
        let nonce = self.trans.take_nonce().await?;
        let inner = self.key.sign(Some(&proof), &nonce, &directory.key_change)?;

        self.trans
            .post(&new_key, &directory.key_change, Some(&inner))
            .await?;
        self.key = new_key;
        Ok(())
    }

    /// Deactivate the account and forget its registration.
    pub async fn deactivate_account(&mut self) -> eyre::Result<()> {
        let url = self
            .registration_url
            .clone()
            .ok_or_else(|| eyre::eyre!("no registration to deactivate"))?;
        self.trans
            .post(&self.key, &url, Some(&json!({ "status": "deactivated" })))
            .await?;
        self.registration_url = None;
        Ok(())
    }

    /// Submit an application for `csr_der` and drive it to issuance.
    pub async fn request_certificate(
        &mut self,
        csr_der: &[u8],
        not_before: Option<&str>,
        not_after: Option<&str>,
    ) -> eyre::Result<IssuedCertificate> {
        let directory = self.directory().await?;
        let csr_b64 = util::base64url(csr_der);

        let mut payload = json!({ "csr": csr_b64 });
        if let Some(not_before) = not_before {
            payload["notBefore"] = json!(not_before);
        }
        if let Some(not_after) = not_after {
            payload["notAfter"] = json!(not_after);
        }

        let reply = self
            .trans
            .post(&self.key, &directory.new_app, Some(&payload))
            .await?;
        eyre::ensure!(reply.status == 201, "new-app got HTTP {}", reply.status);
        let app_url = reply
            .location
            .clone()
            .ok_or_else(|| eyre::eyre!("no Location header on the application"))?;

        let app: api::Application = reply.json()?;
        eyre::ensure!(app.csr == csr_b64, "application does not echo the CSR");
        eyre::ensure!(app.status.is_some(), "application carries no status");
        eyre::ensure!(
            app.not_before.as_deref() == not_before && app.not_after.as_deref() == not_after,
            "application does not echo the requested validity dates"
        );

        if app.certificate.is_none() {
            for requirement in app.requirements.iter().flatten() {
                match requirement {
                    api::Requirement::Authorization { url, status } => {
                        if *status != AuthorizationStatus::Valid {
                            self.fulfill_authorization(url).await?;
                        }
                    }
                    api::Requirement::OutOfBand { url, status } => {
                        if *status != AuthorizationStatus::Valid {
                            log::debug!("out-of-band requirement: visiting {url}");
                            self.trans.get(url).await?;
                        }
                    }
                }
            }
        }

        let settled = self
            .trans
            .poll_json(&app_url, ISSUANCE_POLL_ATTEMPTS, ISSUANCE_POLL_SPACING, |app| {
                app["status"] == "invalid"
                    || (app["status"] == "valid" && app["certificate"].is_string())
            })
            .await?;
        let app: api::Application = serde_json::from_value(settled)?;
        let cert_url = match (app.status, app.certificate) {
            (Some(api::ApplicationStatus::Valid), Some(url)) => url,
            (status, _) => eyre::bail!("application settled as {status:?} without a certificate"),
        };

        let reply = self.trans.get(&cert_url).await?;
        eyre::ensure!(
            reply.content_type == api::PKIX_CERT,
            "certificate served as {:?}",
            reply.content_type
        );
        let der = reply.body;
        let csr = pki::csr_from_der(csr_der)?;
        pki::check_cert_match(&der, &csr, not_before, not_after)?;
        log::debug!("certificate retrieved from {cert_url}");
        Ok(IssuedCertificate { url: cert_url, der })
    }

    /// Fetch one authorization and complete a supported set of challenges.
    async fn fulfill_authorization(&self, url: &str) -> eyre::Result<()> {
        let authz: api::Authorization = self.trans.get_json(url).await?;
        eyre::ensure!(
            authz.identifier.is_type_dns(),
            "authorization is not for a dns identifier"
        );
        match authz.status {
            AuthorizationStatus::Valid => return Ok(()),
            AuthorizationStatus::Pending => {}
            status => eyre::bail!("authorization is already {status:?}"),
        }
        eyre::ensure!(
            !authz.challenges.is_empty(),
            "authorization offers no challenges"
        );

        let indices = self.pick_challenges(&authz)?;
        for index in indices {
            let challenge = authz.challenges[index].clone();
            let validation = self
                .validation_for(&challenge._type)
                .ok_or_else(|| eyre::eyre!("unsupported challenge {}", challenge._type))?;
            let response = validation.make_response(&self.key, &challenge)?;
            let challenge_url = format!("{}/{index}", url.trim_end_matches('/'));

            // The listener must be standing before the POST: the server
            // probes while it handles the update.
            let responder = tokio::spawn({
                let validation = Arc::clone(&validation);
                let name = authz.identifier.value.clone();
                let challenge = challenge.clone();
                let response = response.clone();
                let env = self.env.clone();
                async move { validation.respond(&name, &challenge, &response, &env).await }
            });

            let posted = self
                .trans
                .post(&self.key, &challenge_url, Some(&response))
                .await;
            let responded = responder.await;

            let reply = posted?;
            responded.map_err(|err| eyre::eyre!("responder task died: {err}"))??;

            let updated: Value = reply.json()?;
            eyre::ensure!(
                updated["status"] == "valid",
                "{} challenge for {} settled as {}",
                challenge._type,
                authz.identifier.value,
                updated["status"]
            );
        }
        Ok(())
    }

    /// Pick the challenge indices to run: the first supported combination
    /// when combinations are present, otherwise the first supported
    /// challenge.
    fn pick_challenges(&self, authz: &api::Authorization) -> eyre::Result<Vec<usize>> {
        if let Some(combinations) = &authz.combinations {
            return combinations
                .iter()
                .find(|combination| {
                    !combination.is_empty()
                        && combination.iter().all(|&index| {
                            authz
                                .challenges
                                .get(index)
                                .map(|c| self.validation_for(&c._type).is_some())
                                .unwrap_or(false)
                        })
                })
                .cloned()
                .ok_or_else(|| eyre::eyre!("no fully supported challenge combination"));
        }
        let index = authz
            .challenges
            .iter()
            .position(|c| self.validation_for(&c._type).is_some())
            .ok_or_else(|| eyre::eyre!("no supported challenge offered"))?;
        Ok(vec![index])
    }

    fn validation_for(&self, name: &str) -> Option<Arc<dyn Validation>> {
        self.validations
            .iter()
            .find(|validation| validation.name() == name)
            .cloned()
    }

    /// Deactivate an authorization by URL.
    pub async fn deactivate_authorization(&self, url: &str) -> eyre::Result<()> {
        // Confirm the resource looks like an authorization first.
        let authz: api::Authorization = self.trans.get_json(url).await?;
        eyre::ensure!(
            authz.identifier.is_type_dns(),
            "authorization is not for a dns identifier"
        );

        let reply = self
            .trans
            .post(&self.key, url, Some(&json!({ "status": "deactivated" })))
            .await?;
        let updated: api::Authorization = reply.json()?;
        eyre::ensure!(
            updated.status == AuthorizationStatus::Deactivated,
            "authorization did not deactivate"
        );
        Ok(())
    }

    /// Revoke a certificate given its base64url DER.
    pub async fn revoke_certificate(
        &mut self,
        certificate: &str,
        reason: Option<i64>,
    ) -> eyre::Result<()> {
        let directory = self.directory().await?;
        let payload = serde_json::to_value(api::Revocation::new(certificate.to_owned(), reason))?;
        self.trans
            .post(&self.key, &directory.revoke_cert, Some(&payload))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use der::Encode as _;
    use serde_json::json;

    use super::*;
    use crate::api::RevocationReason;
    use crate::server::{RateLimitConfig, RunningServer, ServerConfig};
    use crate::test::{signed_post_fresh, spawn_server, spawn_server_with, test_config, TERMS_URL};

    fn client_for(server: &RunningServer) -> AcmeClient {
        AcmeClient::new_insecure(&server.directory_url()).unwrap()
    }

    fn csr_der(names: &[&str]) -> Vec<u8> {
        let key = pki::create_p256_key();
        pki::create_csr(&key, names).unwrap().to_der().unwrap()
    }

    async fn registered(server: &RunningServer) -> AcmeClient {
        let mut client = client_for(server);
        client
            .register(&["mailto:anonymous@example.com".to_owned()])
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_happy_path_issuance() {
        let server = spawn_server();
        let mut client = registered(&server).await;

        let csr = csr_der(&["not-example.com", "www.not-example.com"]);
        let cert = client.request_certificate(&csr, None, None).await.unwrap();

        let sans: HashSet<String> = pki::sans_from_der(&cert.der).unwrap().into_iter().collect();
        let want: HashSet<String> = ["not-example.com", "www.not-example.com"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        assert_eq!(sans, want);
        assert!(cert.url.contains("/cert/"));
    }

    #[tokio::test]
    async fn test_issuance_echoes_requested_dates() {
        let server = spawn_server();
        let mut client = registered(&server).await;

        let csr = csr_der(&["dated.not-example.com"]);
        let cert = client
            .request_certificate(
                &csr,
                Some("2026-09-01T00:00:00Z"),
                Some("2026-10-01T00:00:00Z"),
            )
            .await
            .unwrap();
        assert!(!cert.der.is_empty());

        // notAfter without notBefore is refused by the server.
        assert!(client
            .request_certificate(&csr, None, Some("2026-10-01T00:00:00Z"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_register_agrees_to_terms() {
        let server = spawn_server();
        let mut client = client_for(&server).with_agreement_callback(Box::new(|terms| {
            assert_eq!(terms, TERMS_URL);
            true
        }));
        client
            .register(&["mailto:anonymous@example.com".to_owned()])
            .await
            .unwrap();

        // The agreement landed on the registration.
        let http = reqwest::Client::new();
        let response = signed_post_fresh(
            &http,
            client.key(),
            &server,
            client.registration_url().unwrap(),
            &json!({}),
        )
        .await;
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["agreement"], TERMS_URL);
    }

    #[tokio::test]
    async fn test_rate_limited_call_is_retried() {
        let config = ServerConfig {
            rate_limit: RateLimitConfig {
                max_posts: 1,
                window_secs: 1,
            },
            ..test_config()
        };
        let server = spawn_server_with(config);

        // register consumes the window's single slot; the deactivation POST
        // is answered 403 rateLimited and must succeed on the retry.
        let mut client = registered(&server).await;
        client.deactivate_account().await.unwrap();
        assert!(client.registration_url().is_none());
    }

    #[tokio::test]
    async fn test_change_key_keeps_the_account_working() {
        let server = spawn_server();
        let mut client = registered(&server).await;
        let old_thumbprint = client.key().thumbprint().unwrap();

        client.change_key(AccountKey::generate()).await.unwrap();
        assert_ne!(client.key().thumbprint().unwrap(), old_thumbprint);

        // The rolled-over account still issues.
        let csr = csr_der(&["rolled.not-example.com"]);
        client.request_certificate(&csr, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_deactivated_account_is_gone() {
        let server = spawn_server();
        let mut client = registered(&server).await;
        let reg_url = client.registration_url().unwrap().to_owned();

        client.deactivate_account().await.unwrap();
        assert!(client.registration_url().is_none());
        assert!(client.deactivate_account().await.is_err());

        // The record is deleted server-side too.
        let http = reqwest::Client::new();
        let response =
            signed_post_fresh(&http, client.key(), &server, &reg_url, &json!({})).await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_revocation_by_san_holder() {
        let server = spawn_server();

        let mut account_a = registered(&server).await;
        let cert = account_a
            .request_certificate(&csr_der(&["shared.not-example.com"]), None, None)
            .await
            .unwrap();

        // Account B proves control of the same name, which authorizes it to
        // revoke A's certificate.
        let mut account_b = registered(&server).await;
        account_b
            .request_certificate(&csr_der(&["shared.not-example.com"]), None, None)
            .await
            .unwrap();
        account_b
            .revoke_certificate(
                &util::base64url(&cert.der),
                Some(RevocationReason::Superseded.into()),
            )
            .await
            .unwrap();

        let response = reqwest::Client::new().get(&cert.url).send().await.unwrap();
        assert_eq!(
            response.headers()["revocation-reason"].to_str().unwrap(),
            "4"
        );
    }

    #[tokio::test]
    async fn test_revocation_needs_authority() {
        let server = spawn_server();
        let mut owner = registered(&server).await;
        let cert = owner
            .request_certificate(&csr_der(&["owned.not-example.com"]), None, None)
            .await
            .unwrap();

        let mut stranger = registered(&server).await;
        assert!(stranger
            .revoke_certificate(&util::base64url(&cert.der), None)
            .await
            .is_err());

        // The owner's account key always suffices.
        owner
            .revoke_certificate(&util::base64url(&cert.der), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oob_challenge_flow() {
        let config = ServerConfig {
            challenge_types: vec!["oob-01".to_owned()],
            ..test_config()
        };
        let server = spawn_server_with(config);

        // The oob-01 update blocks server-side until the page view lands;
        // the client's responder task performs it while the POST is in
        // flight.
        let mut client = registered(&server).await;
        let csr = csr_der(&["page.not-example.com"]);
        client.request_certificate(&csr, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_band_requirement_flow() {
        let config = ServerConfig {
            oob_handlers: vec!["manual-review".to_owned()],
            ..test_config()
        };
        let server = spawn_server_with(config);

        let mut client = registered(&server).await;
        let csr = csr_der(&["oob.not-example.com"]);
        // Issuance only completes because the client visits the
        // out-of-band URL after fulfilling the authorization.
        client.request_certificate(&csr, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_deactivate_authorization() {
        let server = spawn_server();
        let client = registered(&server).await;

        // Open an application directly so the authorization stays pending.
        let http = reqwest::Client::new();
        let directory: api::Directory = http
            .get(server.directory_url())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let csr = csr_der(&["park.not-example.com"]);
        let response = signed_post_fresh(
            &http,
            client.key(),
            &server,
            &directory.new_app,
            &json!({ "csr": util::base64url(&csr) }),
        )
        .await;
        let body: serde_json::Value = response.json().await.unwrap();
        let authz_url = body["requirements"][0]["url"].as_str().unwrap().to_owned();

        client.deactivate_authorization(&authz_url).await.unwrap();
        let authz: api::Authorization = http
            .get(&authz_url)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Deactivated);
    }
}
