//! Reference implementation of the ACME certificate management protocol.
//!
//! Two cooperating peers share one substrate:
//!
//! - [`server`] — a small certificate-authority front-end: authenticated
//!   JWS transport, the registration/application/authorization/challenge
//!   state machine, and issuance against an in-process CA.
//! - [`client`] — a requester of certificates: registration and key
//!   rollover, application submission, challenge fulfilment through
//!   pluggable [`challenges::Validation`] responders, polling and
//!   retrieval.
//!
//! State lives in memory; persistence, multi-node coordination and
//! production rate limiting are out of scope. The wire protocol follows
//! draft-ietf-acme: flattened JWS bodies (`application/jose+json`) with
//! `alg`, `jwk`, `nonce` and `url` protected headers, problem documents
//! under `urn:ietf:params:acme:error:`, and a `new-reg` / `new-app`
//! directory.
//!
//! # Example
//!
//! ```no_run
//! use acme_ref::{AcmeClient, pki};
//!
//! # async fn demo() -> eyre::Result<()> {
//! let mut client = AcmeClient::new("https://ca.example/acme/directory")?;
//! client.register(&["mailto:admin@example.com".to_owned()]).await?;
//!
//! let key = pki::create_p256_key();
//! let csr = pki::create_csr(&key, &["example.com", "www.example.com"])?;
//! use der::Encode as _;
//! let cert = client
//!     .request_certificate(&csr.to_der()?, None, None)
//!     .await?;
//! println!("certificate at {}", cert.url);
//! # Ok(())
//! # }
//! ```

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod jws;
mod nonce;
mod store;
mod util;

pub mod api;
pub mod challenges;
pub mod client;
pub mod pki;
pub mod server;

#[cfg(test)]
mod test;

pub use crate::{
    api::Problem,
    client::{AcmeClient, IssuedCertificate},
    jws::{AccountKey, Jwk},
    nonce::NonceSource,
    pki::Ca,
    server::{AcmeServer, RunningServer, ServerConfig},
};
