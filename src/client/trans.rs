//! Client transport: nonce reservoir, signed POSTs, JSON/binary GETs and
//! bounded polling.
//!
//! Every response may carry a `Replay-Nonce`; the pool hoards them so a
//! preflight HEAD is only needed when the reservoir runs dry. A
//! `rateLimited` problem is retried once after honouring `Retry-After`.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, CONTENT_TYPE, LOCATION};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::{self, Problem};
use crate::jws::AccountKey;

const REPLAY_NONCE: &str = "replay-nonce";
const RETRY_AFTER: &str = "retry-after";

/// Fallback when `Retry-After` is missing, invalid or in the past.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How many unused nonces to hoard.
const NONCE_POOL_LIMIT: usize = 10;

/// A fully read response.
#[derive(Debug)]
pub(crate) struct HttpReply {
    pub status: u16,
    pub content_type: String,
    pub location: Option<String>,
    /// URL from a `Link: rel="terms-of-service"` header.
    pub terms_link: Option<String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub(crate) fn json<T: DeserializeOwned>(&self) -> eyre::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The problem document carried by an error response, if any.
    fn problem(&self) -> Option<Problem> {
        if self.status < 400 {
            return None;
        }
        Some(
            serde_json::from_slice::<Problem>(&self.body).unwrap_or_else(|err| Problem {
                _type: "httpReqError".to_owned(),
                detail: Some(format!(
                    "HTTP {} with undecodable body ({err}): {}",
                    self.status,
                    String::from_utf8_lossy(&self.body),
                )),
                status: Some(self.status),
                retry_after: None,
                location: None,
            }),
        )
    }
}

pub(crate) struct Transport {
    http: reqwest::Client,
    /// Unused nonces, oldest first.
    nonces: Mutex<VecDeque<String>>,
    /// Preflight target; any endpoint would do, the directory always exists.
    head_url: String,
    allow_insecure: bool,
}

impl Transport {
    pub(crate) fn new(directory_url: &str, allow_insecure: bool) -> eyre::Result<Transport> {
        let transport = Transport {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            nonces: Mutex::new(VecDeque::new()),
            head_url: directory_url.to_owned(),
            allow_insecure,
        };
        transport.check_url(directory_url)?;
        Ok(transport)
    }

    fn check_url(&self, url: &str) -> eyre::Result<()> {
        if !url.starts_with("https://") && !self.allow_insecure {
            eyre::bail!("refusing non-https URL {url}");
        }
        Ok(())
    }

    fn extract_nonce(&self, headers: &HeaderMap) {
        if let Some(nonce) = headers.get(REPLAY_NONCE).and_then(|v| v.to_str().ok()) {
            log::trace!("pooling nonce");
            let mut pool = self.nonces.lock();
            pool.push_back(nonce.to_owned());
            if pool.len() > NONCE_POOL_LIMIT {
                pool.pop_front();
            }
        }
    }

    /// Pop a pooled nonce, or preflight a HEAD for one.
    pub(crate) async fn take_nonce(&self) -> eyre::Result<String> {
        if let Some(nonce) = self.nonces.lock().pop_front() {
            log::trace!("using pooled nonce");
            return Ok(nonce);
        }

        log::debug!("nonce pool dry; preflighting HEAD {}", self.head_url);
        let response = self.http.head(&self.head_url).send().await?;
        self.extract_nonce(response.headers());
        self.nonces
            .lock()
            .pop_front()
            .ok_or_else(|| eyre::eyre!("no Replay-Nonce header on preflight response"))
    }

    /// JWS-sign and POST `payload`, retrying once on `rateLimited`.
    pub(crate) async fn post(
        &self,
        key: &AccountKey,
        url: &str,
        payload: Option<&Value>,
    ) -> eyre::Result<HttpReply> {
        self.check_url(url)?;

        let mut retried = false;
        loop {
            let nonce = self.take_nonce().await?;
            let jws = key.sign(payload, &nonce, url)?;
            log::debug!("POST {url}");
            let response = self
                .http
                .post(url)
                .header(CONTENT_TYPE, api::JOSE_JSON)
                .body(serde_json::to_vec(&jws)?)
                .send()
                .await?;
            let delay = retry_after_delay(response.headers());
            let reply = self.read_reply(response).await?;

            if let Some(problem) = reply.problem() {
                if problem.is_rate_limited() && !retried {
                    retried = true;
                    log::debug!("rate limited; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(problem.into());
            }
            return Ok(reply);
        }
    }

    pub(crate) async fn get(&self, url: &str) -> eyre::Result<HttpReply> {
        self.check_url(url)?;
        log::debug!("GET {url}");
        let response = self.http.get(url).send().await?;
        let reply = self.read_reply(response).await?;
        if let Some(problem) = reply.problem() {
            return Err(problem.into());
        }
        Ok(reply)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: &str) -> eyre::Result<T> {
        self.get(url).await?.json()
    }

    /// Re-fetch `url` until `done` holds, bounded by `attempts`.
    ///
    /// Callers supply the bounds; 4 attempts at 500 ms spacing is the usual
    /// choice for anything but issuance.
    pub(crate) async fn poll_json<F>(
        &self,
        url: &str,
        attempts: usize,
        spacing: Duration,
        done: F,
    ) -> eyre::Result<Value>
    where
        F: Fn(&Value) -> bool,
    {
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(spacing).await;
            }
            let value: Value = self.get_json(url).await?;
            if done(&value) {
                return Ok(value);
            }
            log::trace!("poll {}/{attempts} of {url} not done", attempt + 1);
        }
        eyre::bail!("{url} did not settle within {attempts} polls");
    }

    async fn read_reply(&self, response: reqwest::Response) -> eyre::Result<HttpReply> {
        self.extract_nonce(response.headers());
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let terms_link = terms_link(response.headers());
        let body = response.bytes().await?.to_vec();
        Ok(HttpReply {
            status,
            content_type,
            location,
            terms_link,
            body,
        })
    }
}

/// Delay from a `Retry-After` header: integer seconds or an HTTP-date.
/// Missing, unparseable or past values fall back to the default.
fn retry_after_delay(headers: &HeaderMap) -> Duration {
    let Some(value) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) else {
        return DEFAULT_RETRY_DELAY;
    };
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    if let Ok(at) = httpdate::parse_http_date(value) {
        if let Ok(delay) = at.duration_since(SystemTime::now()) {
            return delay;
        }
    }
    DEFAULT_RETRY_DELAY
}

/// Extract the terms-of-service URL from `Link` headers.
fn terms_link(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(reqwest::header::LINK) {
        let Ok(value) = value.to_str() else { continue };
        for part in value.split(',') {
            let mut pieces = part.split(';');
            let Some(url) = pieces.next().map(str::trim) else {
                continue;
            };
            let is_terms = pieces
                .any(|p| p.trim() == "rel=\"terms-of-service\"" || p.trim() == "rel=terms-of-service");
            if is_terms && url.starts_with('<') && url.ends_with('>') {
                return Some(url[1..url.len() - 1].to_owned());
            }
        }
    }
    None
}
