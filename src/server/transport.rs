//! Server transport gates: request body collection, inbound JWS
//! verification (signature, nonce, url), and problem/reply assembly.

use actix_http::body::BoxBody;
use actix_http::header::{self, HeaderName, HeaderValue};
use actix_http::{Payload, Response, StatusCode};
use futures_util::StreamExt as _;
use serde_json::Value;

use crate::api::{self, Problem};
use crate::jws::{self, Jwk};
use crate::server::ServerShared;

pub(crate) const REPLAY_NONCE: &str = "replay-nonce";
pub(crate) const RETRY_AFTER: &str = "retry-after";
pub(crate) const REVOCATION_REASON: &str = "revocation-reason";

/// Context attached to a request that passed every POST gate.
#[derive(Debug)]
pub(crate) struct VerifiedPost {
    pub key: Jwk,
    pub url: String,
    pub payload: Value,
    pub thumbprint: String,
}

pub(crate) async fn read_body(mut payload: Payload) -> Result<Vec<u8>, Problem> {
    let mut body = Vec::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|err| Problem::malformed(format!("failed to read body: {err}")))?;
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Verify an inbound POST body: flattened JWS, fresh nonce, matching url.
pub(crate) fn verify_post(
    shared: &ServerShared,
    absolute_url: &str,
    body: &[u8],
) -> Result<VerifiedPost, Problem> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| Problem::malformed(format!("body is not JSON: {err}")))?;
    let verified = jws::verify(&value)
        .map_err(|err| Problem::malformed(format!("JWS verification failed: {err}")))?;

    if !shared.nonces.lock().use_nonce(&verified.header.nonce) {
        return Err(Problem::malformed(format!(
            "invalid nonce {:?}",
            verified.header.nonce
        )));
    }

    if verified.header.url != absolute_url {
        return Err(Problem::malformed(format!(
            "JWS url {:?} does not match the request url {absolute_url:?}",
            verified.header.url
        )));
    }

    Ok(VerifiedPost {
        key: verified.key,
        url: verified.header.url,
        payload: verified.payload,
        thumbprint: verified.thumbprint,
    })
}

/// A handler's successful response, before transport decoration.
pub(crate) struct Reply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub location: Option<String>,
    pub terms_link: Option<String>,
    pub revocation_reason: Option<u8>,
}

impl Reply {
    pub(crate) fn json(value: Value) -> Reply {
        Reply {
            status: StatusCode::OK,
            content_type: api::JSON,
            body: serde_json::to_vec(&value).unwrap_or_default(),
            location: None,
            terms_link: None,
            revocation_reason: None,
        }
    }

    pub(crate) fn created(value: Value) -> Reply {
        Reply {
            status: StatusCode::CREATED,
            ..Reply::json(value)
        }
    }

    pub(crate) fn binary(content_type: &'static str, body: Vec<u8>) -> Reply {
        Reply {
            status: StatusCode::OK,
            content_type,
            body,
            location: None,
            terms_link: None,
            revocation_reason: None,
        }
    }

    pub(crate) fn location(mut self, url: String) -> Reply {
        self.location = Some(url);
        self
    }

    pub(crate) fn terms_link(mut self, url: Option<String>) -> Reply {
        self.terms_link = url;
        self
    }

    pub(crate) fn into_response(self) -> Response<BoxBody> {
        let mut builder = Response::build(self.status);
        builder.content_type(self.content_type);
        if let Some(location) = &self.location {
            builder.insert_header((header::LOCATION, location.as_str()));
        }
        if let Some(terms) = &self.terms_link {
            let link = format!("<{terms}>;rel=\"terms-of-service\"");
            builder.insert_header((header::LINK, link.as_str()));
        }
        if let Some(reason) = self.revocation_reason {
            builder.insert_header((REVOCATION_REASON, reason.to_string().as_str()));
        }
        builder.body(self.body).map_into_boxed_body()
    }
}

pub(crate) fn problem_response(problem: &Problem) -> Response<BoxBody> {
    let status =
        StatusCode::from_u16(problem.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::build(status);
    builder.content_type(api::PROBLEM_JSON);
    if let Some(retry_after) = problem.retry_after {
        builder.insert_header((RETRY_AFTER, retry_after.to_string().as_str()));
    }
    if let Some(location) = &problem.location {
        builder.insert_header((header::LOCATION, location.as_str()));
    }
    builder
        .body(serde_json::to_vec(problem).unwrap_or_default())
        .map_into_boxed_body()
}

/// Stamp a fresh `Replay-Nonce` onto an outgoing response.
pub(crate) fn attach_nonce(response: &mut Response<BoxBody>, nonce: &str) {
    if let Ok(value) = HeaderValue::from_str(nonce) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REPLAY_NONCE), value);
    }
}
