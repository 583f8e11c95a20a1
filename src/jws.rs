//! JOSE adapter: ES256 account keys, flattened JWS signing and verification,
//! and JWK thumbprints.
//!
//! Every authenticated request in the protocol is a flattened JWS whose
//! protected header carries `alg`, `jwk`, `nonce` and `url`
//! ([RFC 7515 §7.2.2], draft-ietf-acme §5.2). The server never sees private
//! keys; it reconstructs the signer's public key from the `jwk` header.
//!
//! [RFC 7515 §7.2.2]: https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2

use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use signature::{Signer as _, Verifier as _};
use zeroize::Zeroizing;

use crate::util;

/// Account key pair used to sign requests.
///
/// This library uses elliptic curve P-256 (ES256) for account keys, the one
/// signature algorithm every ACME peer must implement.
#[derive(Clone, Debug)]
pub struct AccountKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl AccountKey {
    /// Generate a fresh P-256 key pair.
    pub fn generate() -> AccountKey {
        AccountKey {
            signing_key: p256::ecdsa::SigningKey::random(&mut rand::thread_rng()),
        }
    }

    pub fn from_pem(pem: &str) -> eyre::Result<AccountKey> {
        let signing_key = p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
            .map_err(|err| eyre::eyre!("failed to read account key PEM: {err}"))?;
        Ok(AccountKey { signing_key })
    }

    pub fn to_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.signing_key
            .to_pkcs8_pem(pkcs8::LineEnding::LF)
            .map_err(|err| eyre::eyre!("failed to encode account key PEM: {err}"))
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }

    /// Public half as a JWK.
    pub fn jwk(&self) -> Jwk {
        Jwk::from_verifying_key(self.signing_key.verifying_key())
    }

    /// base64url(SHA-256(canonical JWK)), the stable account identifier.
    pub fn thumbprint(&self) -> eyre::Result<String> {
        self.jwk().thumbprint()
    }

    /// Produce a flattened JWS over `payload` with the required protected
    /// header fields.
    ///
    /// A `None` payload signs the empty string.
    pub fn sign(
        &self,
        payload: Option<&serde_json::Value>,
        nonce: &str,
        url: &str,
    ) -> eyre::Result<serde_json::Value> {
        let protected = JwsProtectedHeader {
            alg: ES256.to_owned(),
            jwk: self.jwk(),
            nonce: nonce.to_owned(),
            url: url.to_owned(),
        };
        let protected = util::base64url(&serde_json::to_vec(&protected)?);
        let payload = match payload {
            Some(payload) => util::base64url(&serde_json::to_vec(payload)?),
            None => String::new(),
        };

        let to_sign = format!("{protected}.{payload}");
        let signature: p256::ecdsa::Signature = self.signing_key.sign(to_sign.as_bytes());

        Ok(serde_json::to_value(FlattenedJws {
            protected,
            payload,
            signature: util::base64url(&signature.to_bytes()),
        })?)
    }
}

pub(crate) const ES256: &str = "ES256";

/// JWS protected header as required by the transport layer.
///
/// All four fields are mandatory on every request; the server rejects a JWS
/// missing any of them as malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsProtectedHeader {
    pub alg: String,
    pub jwk: Jwk,
    pub nonce: String,
    pub url: String,
}

/// JSON Web Key for a P-256 public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub alg: String,
    pub crv: String,
    pub kty: String,
    #[serde(rename = "use")]
    pub _use: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    pub(crate) fn from_verifying_key(key: &p256::ecdsa::VerifyingKey) -> Jwk {
        let point = key.to_encoded_point(false);
        // An uncompressed point always carries both coordinates.
        let x = point.x().expect("uncompressed point");
        let y = point.y().expect("uncompressed point");

        Jwk {
            alg: ES256.to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: util::base64url(x),
            y: util::base64url(y),
        }
    }

    pub(crate) fn verifying_key(&self) -> eyre::Result<p256::ecdsa::VerifyingKey> {
        if self.kty != "EC" || self.crv != "P-256" {
            eyre::bail!("unsupported key type {}/{}", self.kty, self.crv);
        }
        let x = util::base64url_decode(&self.x)?;
        let y = util::base64url_decode(&self.y)?;
        if x.len() != 32 || y.len() != 32 {
            eyre::bail!("JWK coordinates must be 32 octets");
        }
        let point = p256::EncodedPoint::from_affine_coordinates(
            p256::FieldBytes::from_slice(&x),
            p256::FieldBytes::from_slice(&y),
            false,
        );
        p256::ecdsa::VerifyingKey::from_encoded_point(&point)
            .map_err(|err| eyre::eyre!("invalid JWK point: {err}"))
    }

    /// base64url(SHA-256(canonical JWK)) per RFC 7638.
    pub fn thumbprint(&self) -> eyre::Result<String> {
        let canonical = serde_json::to_vec(&JwkThumb::from(self))?;
        Ok(util::base64url(&Sha256::digest(canonical)))
    }
}

/// Canonical JWK form hashed for thumbprints.
#[derive(Debug, Serialize)]
// LEXICAL ORDER OF FIELDS MATTER!
struct JwkThumb<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

impl<'a> From<&'a Jwk> for JwkThumb<'a> {
    fn from(jwk: &'a Jwk) -> Self {
        JwkThumb {
            crv: &jwk.crv,
            kty: &jwk.kty,
            x: &jwk.x,
            y: &jwk.y,
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// A successfully verified JWS.
#[derive(Debug)]
pub struct VerifiedJws {
    pub key: Jwk,
    pub header: JwsProtectedHeader,
    /// Decoded payload; `Null` when the payload was the empty string.
    pub payload: serde_json::Value,
    pub thumbprint: String,
}

/// Verify a flattened JWS.
///
/// Rejects the general (`signatures` array) serialization, an unprotected
/// `header` member, missing protected fields, unsupported algorithms and bad
/// signatures. Nonce and URL validity are the transport layer's concern.
pub fn verify(body: &serde_json::Value) -> eyre::Result<VerifiedJws> {
    let obj = body
        .as_object()
        .ok_or_else(|| eyre::eyre!("JWS body is not a JSON object"))?;
    if obj.contains_key("signatures") {
        eyre::bail!("JWS must use the flattened serialization");
    }
    if obj.contains_key("header") {
        eyre::bail!("unprotected JWS headers are not allowed");
    }

    let jws: FlattenedJws = serde_json::from_value(body.clone())
        .map_err(|err| eyre::eyre!("not a flattened JWS: {err}"))?;

    let header_bytes = util::base64url_decode(&jws.protected)?;
    let header: JwsProtectedHeader = serde_json::from_slice(&header_bytes)
        .map_err(|err| eyre::eyre!("invalid protected header: {err}"))?;
    if header.alg != ES256 {
        eyre::bail!("unsupported signature algorithm {:?}", header.alg);
    }

    let key = header.jwk.verifying_key()?;
    let signature_bytes = util::base64url_decode(&jws.signature)?;
    let signature = p256::ecdsa::Signature::from_slice(&signature_bytes)
        .map_err(|err| eyre::eyre!("invalid signature encoding: {err}"))?;

    let signed = format!("{}.{}", jws.protected, jws.payload);
    key.verify(signed.as_bytes(), &signature)
        .map_err(|_| eyre::eyre!("JWS signature verification failed"))?;

    let payload = if jws.payload.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&util::base64url_decode(&jws.payload)?)
            .map_err(|err| eyre::eyre!("JWS payload is not JSON: {err}"))?
    };

    let thumbprint = header.jwk.thumbprint()?;
    Ok(VerifiedJws {
        key: header.jwk.clone(),
        header,
        payload,
        thumbprint,
    })
}
