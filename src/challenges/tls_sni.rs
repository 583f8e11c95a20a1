//! `tls-sni-02`: the prober opens a TLS connection with a synthetic SNI name
//! derived from the token and expects a certificate advertising both that
//! name and a second one derived from the key authorization.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt as _;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::api;
use crate::challenges::{ChallengeKind, ChallengeState, ProbeEnv, Validation, ValidationEnv};
use crate::{pki, util};

/// CN on the responder certificate. Only the SAN entries carry proof.
const RESPONDER_CN: &str = "tls-sni.acme.invalid";

/// `sha256(input)` as hex, split into two 32-character DNS labels under
/// `acme.invalid`.
fn sni_name(input: &str) -> String {
    let digest = util::hex(&Sha256::digest(input.as_bytes()));
    format!("{}.{}.acme.invalid", &digest[..32], &digest[32..64])
}

pub struct TlsSni02Challenge;

#[async_trait]
impl ChallengeKind for TlsSni02Challenge {
    fn name(&self) -> &'static str {
        "tls-sni-02"
    }

    fn offer(&self, identifier: &str, thumbprint: &str) -> ChallengeState {
        let mut state = ChallengeState::new(self.name(), identifier, thumbprint);
        state.secrets = vec![
            sni_name(&state.token),
            sni_name(&state.key_authorization),
        ];
        state
    }

    async fn probe(&self, state: &ChallengeState, env: &ProbeEnv) -> eyre::Result<()> {
        let [san_a, san_b] = state.secrets.as_slice() else {
            eyre::bail!("tls-sni-02 challenge is missing its SAN pair");
        };
        log::debug!("tls-sni-02 probe: {}:{} sni {san_a}", state.identifier, env.tls_port);

        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let stream = tokio::time::timeout(
            env.timeout,
            tokio::net::TcpStream::connect((state.identifier.as_str(), env.tls_port)),
        )
        .await
        .map_err(|_| eyre::eyre!("tls-sni-02 connect timed out"))??;

        let server_name = rustls::ServerName::try_from(san_a.as_str())
            .map_err(|_| eyre::eyre!("{san_a:?} is not a valid SNI name"))?;
        let tls = tokio::time::timeout(env.timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| eyre::eyre!("tls-sni-02 handshake timed out"))??;

        let (_, connection) = tls.get_ref();
        let certs = connection
            .peer_certificates()
            .ok_or_else(|| eyre::eyre!("no certificate presented"))?;
        let end_entity = certs
            .first()
            .ok_or_else(|| eyre::eyre!("empty certificate chain"))?;

        let sans = pki::sans_from_der(&end_entity.0)?;
        eyre::ensure!(
            sans.iter().any(|san| san == san_a) && sans.iter().any(|san| san == san_b),
            "certificate does not advertise both validation names"
        );
        Ok(())
    }
}

/// The probe authenticates the applicant by SAN content, not by trust chain.
struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

pub struct TlsSni02Validation;

#[async_trait]
impl Validation for TlsSni02Validation {
    fn name(&self) -> &'static str {
        "tls-sni-02"
    }

    async fn respond(
        &self,
        _identifier: &str,
        challenge: &api::Challenge,
        response: &Value,
        env: &ValidationEnv,
    ) -> eyre::Result<()> {
        let key_auth = response["keyAuthorization"]
            .as_str()
            .ok_or_else(|| eyre::eyre!("response carries no key authorization"))?;
        let sans = vec![sni_name(&challenge.token), sni_name(key_auth)];

        let (cert_der, key_der) = pki::self_signed(RESPONDER_CN, &sans)?;
        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::Certificate(cert_der)],
                rustls::PrivateKey(key_der),
            )
            .map_err(|err| eyre::eyre!("bad responder certificate: {err}"))?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = tokio::net::TcpListener::bind((env.bind, env.tls_port)).await?;
        let work = async {
            loop {
                let (stream, _) = listener.accept().await?;
                match acceptor.accept(stream).await {
                    Ok(mut tls) => {
                        let _ = tls.shutdown().await;
                        return Ok::<_, eyre::Report>(());
                    }
                    Err(err) => {
                        log::debug!("tls-sni-02 handshake failed: {err}");
                        continue;
                    }
                }
            }
        };
        tokio::time::timeout(env.timeout, work)
            .await
            .map_err(|_| eyre::eyre!("tls-sni-02 listener was never probed"))?
    }
}
