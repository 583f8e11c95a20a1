//! PKI adapter: CSR parsing and policy checks, certificate issuance against
//! the in-process CA key, and certificate/CSR matching.
//!
//! Certificates travel as DER (`application/pkix-cert`); CSRs travel as
//! base64url-encoded DER inside application payloads.

use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use const_oid::db::rfc4519::CN;
use const_oid::db::rfc5280::ID_KP_SERVER_AUTH;
use const_oid::AssociatedOid as _;
use der::asn1::{GeneralizedTime, Ia5String};
use der::{Decode as _, Encode as _};
use rand::RngCore as _;
use time::OffsetDateTime;
use x509_cert::builder::{Builder as _, CertificateBuilder, Profile, RequestBuilder};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{ExtendedKeyUsage, SubjectAltName};
use x509_cert::name::Name;
use x509_cert::request::{CertReq, ExtensionReq};
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

use crate::jws::Jwk;
use crate::util;

const ISSUER_DN: &str = "CN=acme-ref intermediate";
const DEFAULT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 3600);
const MAX_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Validity-date comparisons tolerate encoding truncation.
const DATE_TOLERANCE_SECS: i64 = 1;

/// The issuing side of the house.
///
/// The signing key is generated on first issuance and reused afterwards.
pub struct Ca {
    key: OnceLock<p256::ecdsa::SigningKey>,
    max_validity: Duration,
}

impl Default for Ca {
    fn default() -> Self {
        Ca::new()
    }
}

impl Ca {
    pub fn new() -> Ca {
        Ca {
            key: OnceLock::new(),
            max_validity: MAX_VALIDITY,
        }
    }

    pub fn with_max_validity(max_validity_secs: u64) -> Ca {
        Ca {
            key: OnceLock::new(),
            max_validity: Duration::from_secs(max_validity_secs),
        }
    }

    fn key(&self) -> &p256::ecdsa::SigningKey {
        self.key
            .get_or_init(|| p256::ecdsa::SigningKey::random(&mut rand::thread_rng()))
    }

    /// Issue a certificate for a checked CSR.
    ///
    /// Validity defaults to 90 days from now and is bounded by the policy
    /// maximum. The subject, public key and SAN set are taken from the CSR;
    /// the certificate carries BasicConstraints (cA=false), KeyUsage
    /// (digitalSignature, keyEncipherment) and ExtKeyUsage (serverAuth).
    pub fn issue(
        &self,
        csr: &CertReq,
        not_before: Option<OffsetDateTime>,
        not_after: Option<OffsetDateTime>,
    ) -> eyre::Result<Vec<u8>> {
        let names = check_csr(csr)?;

        let not_before = not_before.unwrap_or_else(OffsetDateTime::now_utc);
        let not_after = not_after.unwrap_or(not_before + DEFAULT_VALIDITY);
        if not_after <= not_before {
            eyre::bail!("notAfter precedes notBefore");
        }
        if not_after - not_before > self.max_validity {
            eyre::bail!(
                "requested validity exceeds the policy maximum of {} seconds",
                self.max_validity.as_secs()
            );
        }

        let issuer: Name = ISSUER_DN
            .parse()
            .map_err(|err| eyre::eyre!("bad issuer DN: {err}"))?;
        let profile = Profile::Leaf {
            issuer,
            enable_key_agreement: false,
            enable_key_encipherment: true,
        };
        let validity = Validity {
            not_before: asn1_time(not_before)?,
            not_after: asn1_time(not_after)?,
        };

        let mut builder = CertificateBuilder::new(
            profile,
            random_serial()?,
            validity,
            csr.info.subject.clone(),
            csr.info.public_key.clone(),
            self.key(),
        )
        .map_err(|err| eyre::eyre!("failed to start certificate: {err}"))?;

        builder
            .add_extension(&SubjectAltName(dns_general_names(&names)?))
            .map_err(|err| eyre::eyre!("failed to add SAN: {err}"))?;
        builder
            .add_extension(&ExtendedKeyUsage(vec![ID_KP_SERVER_AUTH]))
            .map_err(|err| eyre::eyre!("failed to add EKU: {err}"))?;

        let cert = builder
            .build::<p256::ecdsa::DerSignature>()
            .map_err(|err| eyre::eyre!("failed to sign certificate: {err}"))?;
        Ok(cert.to_der()?)
    }
}

/// Make a P-256 private key (from which we can derive a public key).
///
/// Suitable as a certificate key; account keys come from
/// [`AccountKey::generate`](crate::AccountKey::generate).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    p256::ecdsa::SigningKey::random(&mut rand::thread_rng())
}

/// Decode a base64url CSR.
pub fn parse_csr(b64: &str) -> eyre::Result<CertReq> {
    let der = util::base64url_decode(b64).map_err(|err| eyre::eyre!("CSR is not base64url: {err}"))?;
    csr_from_der(&der)
}

pub fn csr_from_der(der: &[u8]) -> eyre::Result<CertReq> {
    CertReq::from_der(der).map_err(|err| eyre::eyre!("CSR is not valid DER: {err}"))
}

/// Apply the issuance policy to a CSR and return the DNS names it asks for.
///
/// The subject must be a single CN holding a DNS name. At most one
/// extensionRequest attribute is allowed, carrying exactly one
/// subjectAltName extension whose entries must all be dNSName. The CN joins
/// the name list.
pub fn check_csr(csr: &CertReq) -> eyre::Result<Vec<String>> {
    let mut atvs = csr.info.subject.0.iter().flat_map(|rdn| rdn.0.iter());
    let cn = match (atvs.next(), atvs.next()) {
        (Some(atv), None) if atv.oid == CN => any_to_string(&atv.value)
            .ok_or_else(|| eyre::eyre!("subject CN is not a string"))?,
        (Some(_), None) => eyre::bail!("subject must consist of a single CN"),
        (None, _) => eyre::bail!("subject is empty"),
        (Some(_), Some(_)) => eyre::bail!("subject must consist of a single CN"),
    };
    if !is_dns_name(&cn) {
        eyre::bail!("subject CN {cn:?} is not a DNS name");
    }

    let mut names = Vec::new();
    match csr.info.attributes.as_slice() {
        [] => {}
        [attr] => {
            if attr.oid != ExtensionReq::OID {
                eyre::bail!("unexpected CSR attribute {}", attr.oid);
            }
            let value = match attr.values.as_slice() {
                [value] => value,
                _ => eyre::bail!("extensionRequest must hold a single value"),
            };
            let extensions: ExtensionReq = value
                .decode_as()
                .map_err(|err| eyre::eyre!("bad extensionRequest: {err}"))?;
            let extension = match extensions.0.as_slice() {
                [extension] => extension,
                _ => eyre::bail!("extensionRequest must carry exactly one extension"),
            };
            if extension.extn_id != SubjectAltName::OID {
                eyre::bail!("unexpected requested extension {}", extension.extn_id);
            }
            let san = SubjectAltName::from_der(extension.extn_value.as_bytes())
                .map_err(|err| eyre::eyre!("bad subjectAltName: {err}"))?;
            for general_name in san.0 {
                match general_name {
                    GeneralName::DnsName(name) => {
                        let name = name.to_string();
                        if !is_dns_name(&name) {
                            eyre::bail!("SAN entry {name:?} is not a DNS name");
                        }
                        names.push(name);
                    }
                    _ => eyre::bail!("subjectAltName entries must be dNSName"),
                }
            }
        }
        _ => eyre::bail!("at most one CSR attribute is allowed"),
    }

    if !names.contains(&cn) {
        names.insert(0, cn);
    }
    if names.is_empty() {
        eyre::bail!("CSR names no identifiers");
    }
    Ok(names)
}

/// Build a CSR for `domains`, signed by `signer`.
///
/// The first domain becomes the CN; all domains land in a subjectAltName
/// extension.
pub fn create_csr(signer: &p256::ecdsa::SigningKey, domains: &[&str]) -> eyre::Result<CertReq> {
    let primary = domains
        .first()
        .ok_or_else(|| eyre::eyre!("at least one domain is required"))?;
    let subject: Name = format!("CN={primary}")
        .parse()
        .map_err(|err| eyre::eyre!("bad subject: {err}"))?;

    let mut builder = RequestBuilder::new(subject, signer)
        .map_err(|err| eyre::eyre!("failed to start CSR: {err}"))?;
    let names: Vec<String> = domains.iter().map(|d| (*d).to_owned()).collect();
    builder
        .add_extension(&SubjectAltName(dns_general_names(&names)?))
        .map_err(|err| eyre::eyre!("failed to add SAN: {err}"))?;

    builder
        .build::<p256::ecdsa::DerSignature>()
        .map_err(|err| eyre::eyre!("failed to sign CSR: {err}"))
}

/// Compare an issued certificate against the CSR and dates it answers.
///
/// Subject and public key must match exactly; the SAN set is compared
/// order-independently; validity dates are compared with a one-second
/// tolerance when the caller supplied them.
pub fn check_cert_match(
    der: &[u8],
    csr: &CertReq,
    not_before: Option<&str>,
    not_after: Option<&str>,
) -> eyre::Result<()> {
    let cert = Certificate::from_der(der)
        .map_err(|err| eyre::eyre!("certificate is not valid DER: {err}"))?;
    let tbs = &cert.tbs_certificate;

    if tbs.subject != csr.info.subject {
        eyre::bail!("certificate subject does not match the CSR");
    }
    if tbs.subject_public_key_info.to_der()? != csr.info.public_key.to_der()? {
        eyre::bail!("certificate public key does not match the CSR");
    }

    let want: HashSet<String> = check_csr(csr)?.into_iter().collect();
    let got: HashSet<String> = sans_of(&cert)?.into_iter().collect();
    if want != got {
        eyre::bail!("certificate SAN set {got:?} does not match the CSR names {want:?}");
    }

    if let Some(not_before) = not_before {
        check_date_close(&tbs.validity.not_before, not_before, "notBefore")?;
    }
    if let Some(not_after) = not_after {
        check_date_close(&tbs.validity.not_after, not_after, "notAfter")?;
    }
    Ok(())
}

/// Thumbprint of a certificate's subject public key, in the same form as
/// account-key thumbprints.
pub fn cert_key_thumbprint(der: &[u8]) -> eyre::Result<String> {
    let cert = Certificate::from_der(der)
        .map_err(|err| eyre::eyre!("certificate is not valid DER: {err}"))?;
    let spki = &cert.tbs_certificate.subject_public_key_info;
    let point = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| eyre::eyre!("subject public key has unused bits"))?;
    if point.len() != 65 || point[0] != 0x04 {
        eyre::bail!("subject public key is not an uncompressed P-256 point");
    }
    let jwk = Jwk {
        alg: crate::jws::ES256.to_owned(),
        kty: "EC".to_owned(),
        crv: "P-256".to_owned(),
        _use: "sig".to_owned(),
        x: util::base64url(&point[1..33]),
        y: util::base64url(&point[33..65]),
    };
    jwk.thumbprint()
}

/// SAN values of a DER certificate.
pub(crate) fn sans_from_der(der: &[u8]) -> eyre::Result<Vec<String>> {
    let cert = Certificate::from_der(der)
        .map_err(|err| eyre::eyre!("certificate is not valid DER: {err}"))?;
    sans_of(&cert)
}

/// Build a throwaway self-signed certificate carrying `sans`.
///
/// Returns the certificate and its signing key, both DER encoded. Used by
/// the tls-sni-02 responder.
pub(crate) fn self_signed(cn: &str, sans: &[String]) -> eyre::Result<(Vec<u8>, Vec<u8>)> {
    use pkcs8::{EncodePrivateKey as _, EncodePublicKey as _};

    let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
    let subject: Name = format!("CN={cn}")
        .parse()
        .map_err(|err| eyre::eyre!("bad subject: {err}"))?;
    let spki_der = key
        .verifying_key()
        .to_public_key_der()
        .map_err(|err| eyre::eyre!("failed to encode public key: {err}"))?;
    let spki = spki::SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())?;

    let now = OffsetDateTime::now_utc();
    let validity = Validity {
        not_before: asn1_time(now - time::Duration::minutes(5))?,
        not_after: asn1_time(now + time::Duration::days(1))?,
    };
    let profile = Profile::Leaf {
        issuer: subject.clone(),
        enable_key_agreement: false,
        enable_key_encipherment: true,
    };

    let mut builder =
        CertificateBuilder::new(profile, random_serial()?, validity, subject, spki, &key)
            .map_err(|err| eyre::eyre!("failed to start certificate: {err}"))?;
    builder
        .add_extension(&SubjectAltName(dns_general_names(sans)?))
        .map_err(|err| eyre::eyre!("failed to add SAN: {err}"))?;
    let cert = builder
        .build::<p256::ecdsa::DerSignature>()
        .map_err(|err| eyre::eyre!("failed to sign certificate: {err}"))?;

    let key_der = key.to_pkcs8_der()?.as_bytes().to_vec();
    Ok((cert.to_der()?, key_der))
}

fn sans_of(cert: &Certificate) -> eyre::Result<Vec<String>> {
    let mut names = Vec::new();
    for extension in cert.tbs_certificate.extensions.iter().flatten() {
        if extension.extn_id != SubjectAltName::OID {
            continue;
        }
        let san = SubjectAltName::from_der(extension.extn_value.as_bytes())
            .map_err(|err| eyre::eyre!("bad subjectAltName: {err}"))?;
        for general_name in san.0 {
            if let GeneralName::DnsName(name) = general_name {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

fn dns_general_names(names: &[String]) -> eyre::Result<Vec<GeneralName>> {
    names
        .iter()
        .map(|name| {
            Ia5String::new(name)
                .map(GeneralName::DnsName)
                .map_err(|err| eyre::eyre!("{name:?} is not an IA5 string: {err}"))
        })
        .collect()
}

fn asn1_time(t: OffsetDateTime) -> eyre::Result<Time> {
    let unix: u64 = t
        .unix_timestamp()
        .try_into()
        .map_err(|_| eyre::eyre!("date {t} precedes the epoch"))?;
    Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(
        Duration::from_secs(unix),
    )?))
}

fn check_date_close(have: &Time, want: &str, what: &str) -> eyre::Result<()> {
    let want = util::parse_rfc3339(want)?.unix_timestamp();
    let have = have.to_date_time().unix_duration().as_secs() as i64;
    if (have - want).abs() > DATE_TOLERANCE_SECS {
        eyre::bail!("certificate {what} is {}s away from the requested date", have - want);
    }
    Ok(())
}

fn random_serial() -> eyre::Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Positive INTEGER, never all zero.
    bytes[0] &= 0x7f;
    bytes[15] |= 0x01;
    SerialNumber::new(&bytes).map_err(|err| eyre::eyre!("bad serial: {err}"))
}

fn is_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

fn any_to_string(value: &der::Any) -> Option<String> {
    if let Ok(s) = value.decode_as::<der::asn1::Utf8StringRef<'_>>() {
        return Some(s.to_string());
    }
    if let Ok(s) = value.decode_as::<der::asn1::PrintableStringRef<'_>>() {
        return Some(s.to_string());
    }
    if let Ok(s) = value.decode_as::<der::asn1::Ia5StringRef<'_>>() {
        return Some(s.to_string());
    }
    None
}
