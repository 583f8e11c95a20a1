//! The ACME server core: a small certificate-authority front-end.
//!
//! The HTTP front is deliberately thin: one dispatcher matching on method
//! and path behind `actix_http::HttpService`, single worker. All protocol
//! behaviour lives in [`transport`] (gates) and [`handlers`] (resources).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_http::body::BoxBody;
use actix_http::{HttpService, Method, Request, Response};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::api::{self, Problem};
use crate::challenges::{self, ChallengeKind, ProbeEnv};
use crate::nonce::NonceSource;
use crate::pki::Ca;
use crate::store::Store;

mod handlers;
mod limit;
pub(crate) mod transport;

use limit::RateWindow;
use transport::Reply;

/// Rate limit for POSTs: at most `max_posts` per `window_secs` window.
/// `max_posts == 0` disables the limiter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_posts: usize,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_posts: 0,
            window_secs: 60,
        }
    }
}

/// Where validation probes reach the applicant. Overridable so test rigs
/// can run listeners on unprivileged ports.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub http_port: u16,
    pub tls_port: u16,
    /// TCP resolver for dns-01 lookups; `None` uses the system resolver.
    pub dns_server: Option<SocketAddr>,
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            http_port: 80,
            tls_port: 443,
            dns_server: None,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    pub base_path: String,
    pub authz_expiry_secs: u64,
    pub max_validity_secs: u64,
    /// Challenge kinds offered on new authorizations, in preference order.
    pub challenge_types: Vec<String>,
    /// Out-of-band handlers; each adds an out-of-band requirement to new
    /// applications.
    pub oob_handlers: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub terms_of_service: Option<String>,
    /// Accept plain-http requests. Debugging and tests only.
    pub allow_insecure: bool,
    pub nonce_start: u64,
    pub nonce_window: usize,
    pub probe: ProbeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            base_path: "/acme".to_owned(),
            authz_expiry_secs: 24 * 3600,
            max_validity_secs: 365 * 24 * 3600,
            challenge_types: vec![
                "http-01".to_owned(),
                "dns-01".to_owned(),
                "tls-sni-02".to_owned(),
            ],
            oob_handlers: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            terms_of_service: None,
            allow_insecure: false,
            nonce_start: 1,
            nonce_window: 32,
            probe: ProbeConfig::default(),
        }
    }
}

/// Process-local state shared by every request.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    /// `scheme://host:port`, no base path.
    origin: String,
    pub(crate) store: Mutex<Store>,
    pub(crate) nonces: Mutex<NonceSource>,
    limiter: Mutex<RateWindow>,
    pub(crate) kinds: Vec<Arc<dyn ChallengeKind>>,
    pub(crate) ca: Ca,
    pub(crate) probe_env: ProbeEnv,
}

impl ServerShared {
    pub(crate) fn base_url(&self) -> String {
        format!("{}{}", self.origin, self.config.base_path)
    }

    pub(crate) fn url_for(&self, kind: &str, id: &str) -> String {
        format!("{}/{kind}/{id}", self.base_url())
    }

    pub(crate) fn kind(&self, name: &str) -> Option<Arc<dyn ChallengeKind>> {
        self.kinds.iter().find(|kind| kind.name() == name).cloned()
    }

    fn directory(&self) -> api::Directory {
        let base = self.base_url();
        api::Directory {
            directory: format!("{base}/directory"),
            new_reg: format!("{base}/new-reg"),
            new_app: format!("{base}/new-app"),
            key_change: format!("{base}/key-change"),
            revoke_cert: format!("{base}/revoke-cert"),
            meta: self
                .config
                .terms_of_service
                .as_ref()
                .map(|terms| api::DirectoryMeta {
                    terms_of_service: Some(terms.clone()),
                    ..api::DirectoryMeta::default()
                }),
        }
    }
}

/// Builder for a running server.
pub struct AcmeServer {
    config: ServerConfig,
    ca: Ca,
    kinds: Option<Vec<Arc<dyn ChallengeKind>>>,
}

impl AcmeServer {
    pub fn new(config: ServerConfig, ca: Ca) -> AcmeServer {
        AcmeServer {
            config,
            ca,
            kinds: None,
        }
    }

    /// Replace the challenge registry resolved from the configuration.
    pub fn with_kinds(mut self, kinds: Vec<Arc<dyn ChallengeKind>>) -> AcmeServer {
        self.kinds = Some(kinds);
        self
    }

    /// Bind the configured address and start serving.
    pub fn bind(self) -> eyre::Result<RunningServer> {
        let AcmeServer { config, ca, kinds } = self;
        let listener = std::net::TcpListener::bind((config.host.as_str(), config.port))?;
        let port = listener.local_addr()?.port();

        let scheme = if config.allow_insecure { "http" } else { "https" };
        let origin = format!("{scheme}://{}:{port}", config.host);
        let kinds = kinds.unwrap_or_else(|| challenges::server_kinds(&config.challenge_types));
        let probe_env = ProbeEnv::new(
            config.probe.http_port,
            config.probe.tls_port,
            config.probe.dns_server,
            Duration::from_secs(config.probe.timeout_secs),
        );

        let shared = Arc::new(ServerShared {
            origin,
            store: Mutex::new(Store::new()),
            nonces: Mutex::new(NonceSource::new(config.nonce_start, config.nonce_window)),
            limiter: Mutex::new(RateWindow::new(
                config.rate_limit.max_posts,
                Duration::from_secs(config.rate_limit.window_secs),
            )),
            kinds,
            ca,
            probe_env,
            config,
        });

        let server = actix_server::Server::build()
            .listen("acme", listener, {
                let shared = Arc::clone(&shared);
                move || {
                    let shared = Arc::clone(&shared);
                    HttpService::build()
                        .finish(move |req: Request| handle(Arc::clone(&shared), req))
                        .tcp()
                }
            })?
            .workers(1)
            .run();
        let handle = server.handle();
        tokio::spawn(server);

        log::debug!("acme server listening on {}", shared.base_url());
        Ok(RunningServer { shared, handle })
    }
}

/// A bound and serving ACME server.
pub struct RunningServer {
    shared: Arc<ServerShared>,
    handle: actix_server::ServerHandle,
}

impl RunningServer {
    pub fn base_url(&self) -> String {
        self.shared.base_url()
    }

    pub fn directory_url(&self) -> String {
        format!("{}/directory", self.shared.base_url())
    }

    pub async fn stop(self) {
        self.handle.stop(true).await;
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

async fn handle(
    shared: Arc<ServerShared>,
    mut req: Request,
) -> Result<Response<BoxBody>, Infallible> {
    let mut response = match dispatch(&shared, &mut req).await {
        Ok(reply) => reply.into_response(),
        Err(problem) => transport::problem_response(&problem),
    };
    // Every response carries a fresh nonce, problems included.
    let nonce = shared.nonces.lock().next();
    transport::attach_nonce(&mut response, &nonce);
    Ok(response)
}

async fn dispatch(shared: &ServerShared, req: &mut Request) -> Result<Reply, Problem> {
    // Scheme gate. The engine itself never terminates TLS; requests without
    // an explicit scheme are assumed to arrive the way the server is
    // configured to be reached.
    let https = match req.uri().scheme_str() {
        Some(scheme) => scheme == "https",
        None => true,
    };
    if !https && !shared.config.allow_insecure {
        return Err(Problem::malformed_with_status(500, "requests must use https"));
    }

    let method = req.method().clone();
    let path = req.path().to_owned();
    log::trace!("{method} {path}");

    if method == Method::POST {
        shared
            .limiter
            .lock()
            .check()
            .map_err(Problem::rate_limited)?;
    }

    if method == Method::HEAD {
        // Nonce preflight; the interesting part is the header.
        return Ok(Reply::json(serde_json::Value::Null));
    }

    let relative = path
        .strip_prefix(&shared.config.base_path)
        .ok_or_else(Problem::not_found)?;
    let segments: Vec<&str> = relative
        .strip_prefix('/')
        .unwrap_or(relative)
        .split('/')
        .collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["directory"]) => {
            Ok(Reply::json(serde_json::to_value(shared.directory()).map_err(
                |_| Problem::server_internal(),
            )?))
        }

        (&Method::POST, segments) => {
            let body = transport::read_body(req.take_payload()).await?;
            let absolute_url = format!("{}{}", shared.origin, path);
            let post = transport::verify_post(shared, &absolute_url, &body)?;

            match segments {
                ["new-reg"] => handlers::new_reg(shared, post),
                ["new-app"] => handlers::new_app(shared, post),
                ["key-change"] => handlers::key_change(shared, post),
                ["revoke-cert"] => handlers::revoke_cert(shared, post),
                ["reg", id] => handlers::update_reg(shared, id, post),
                ["authz", id] => handlers::deactivate_authz(shared, id, post),
                ["authz", id, index] => {
                    let index: usize =
                        index.parse().map_err(|_| Problem::not_found())?;
                    handlers::update_challenge(shared, id, index, post).await
                }
                _ => Err(Problem::not_found()),
            }
        }

        (&Method::GET, ["oob", token]) => handlers::oob_view(shared, token),
        (&Method::GET, [kind, id]) => handlers::fetch(shared, kind, id),

        _ => Err(Problem::not_found()),
    }
}

#[cfg(test)]
mod tests {
    use der::Encode as _;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;
    use crate::jws::AccountKey;
    use crate::pki;
    use crate::test::{
        head_nonce, server_port, signed_post, signed_post_fresh, spawn_server, spawn_server_with,
        test_config, TERMS_URL,
    };
    use crate::util;

    fn http() -> reqwest::Client {
        reqwest::Client::new()
    }

    async fn problem_of(response: reqwest::Response) -> Problem {
        response.json().await.expect("not a problem document")
    }

    fn csr_b64(names: &[&str]) -> String {
        let key = pki::create_p256_key();
        let csr = pki::create_csr(&key, names).unwrap();
        crate::util::base64url(&csr.to_der().unwrap())
    }

    #[tokio::test]
    async fn test_directory_lists_resources() {
        let server = spawn_server();
        let response = http().get(server.directory_url()).send().await.unwrap();
        assert!(response.headers().contains_key("replay-nonce"));

        let directory: api::Directory = response.json().await.unwrap();
        assert!(directory.new_reg.ends_with("/new-reg"));
        assert!(directory.new_app.ends_with("/new-app"));
        assert!(directory.key_change.ends_with("/key-change"));
        assert!(directory.revoke_cert.ends_with("/revoke-cert"));
        assert_eq!(directory.terms_of_service(), Some(TERMS_URL));
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let server = spawn_server();
        let http = http();
        let key = AccountKey::generate();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();
        let payload = json!({ "contact": ["mailto:anonymous@example.com"] });

        let first = signed_post_fresh(&http, &key, &server, &directory.new_reg, &payload).await;
        assert_eq!(first.status(), 201);
        let location = first.headers()["location"].to_str().unwrap().to_owned();

        let second = signed_post_fresh(&http, &key, &server, &directory.new_reg, &payload).await;
        assert_eq!(second.status(), 409);
        assert_eq!(second.headers()["location"].to_str().unwrap(), location);
    }

    #[tokio::test]
    async fn test_replayed_nonce_rejected() {
        let server = spawn_server();
        let http = http();
        let key = AccountKey::generate();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();
        let payload = json!({ "contact": ["mailto:anonymous@example.com"] });

        let nonce = head_nonce(&http, &server.directory_url()).await;
        let first = signed_post(&http, &key, &directory.new_reg, &nonce, &payload).await;
        assert_eq!(first.status(), 201);

        let replay = signed_post(&http, &key, &directory.new_reg, &nonce, &payload).await;
        assert_eq!(replay.status(), 400);
        let problem = problem_of(replay).await;
        assert!(problem.is_kind("malformed"));
        assert!(problem.detail.unwrap().contains("invalid nonce"));
    }

    #[tokio::test]
    async fn test_url_header_tamper_rejected() {
        let server = spawn_server();
        let http = http();
        let key = AccountKey::generate();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();

        // Signed for new-app, delivered to new-reg.
        let nonce = head_nonce(&http, &server.directory_url()).await;
        let jws = key
            .sign(Some(&json!({ "contact": [] })), &nonce, &directory.new_app)
            .unwrap();
        let response = http
            .post(&directory.new_reg)
            .header("content-type", api::JOSE_JSON)
            .body(serde_json::to_vec(&jws).unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        assert!(problem_of(response).await.is_kind("malformed"));
    }

    #[tokio::test]
    async fn test_scheme_gate_rejects_explicit_http() {
        let config = ServerConfig {
            allow_insecure: false,
            ..test_config()
        };
        let server = spawn_server_with(config);
        let port = server_port(&server);

        // Only an absolute-form request can carry a scheme; the gate must
        // answer 500 malformed.
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!(
            "GET http://127.0.0.1:{port}/acme/directory HTTP/1.1\r\n\
             Host: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 500"), "got: {response}");
        assert!(response.contains("replay-nonce") || response.contains("Replay-Nonce"));
    }

    #[tokio::test]
    async fn test_fetch_semantics() {
        let server = spawn_server();
        let http = http();
        let base = server.base_url();

        let reg = http.get(format!("{base}/reg/anything")).send().await.unwrap();
        assert_eq!(reg.status(), 401);

        let missing = http.get(format!("{base}/app/unknown")).send().await.unwrap();
        assert_eq!(missing.status(), 404);

        let bogus = http.get(format!("{base}/widget/1")).send().await.unwrap();
        assert_eq!(bogus.status(), 404);

        let outside = http
            .get(format!("http://127.0.0.1:{}/other", server_port(&server)))
            .send()
            .await
            .unwrap();
        assert_eq!(outside.status(), 404);
    }

    #[tokio::test]
    async fn test_key_change_swaps_the_account_key() {
        let server = spawn_server();
        let http = http();
        let old_key = AccountKey::generate();
        let new_key = AccountKey::generate();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();

        let created = signed_post_fresh(
            &http,
            &old_key,
            &server,
            &directory.new_reg,
            &json!({ "contact": ["mailto:key@example.com"] }),
        )
        .await;
        assert_eq!(created.status(), 201);
        let reg_url = created.headers()["location"].to_str().unwrap().to_owned();

        let proof = json!({
            "account": reg_url,
            "oldKey": old_key.thumbprint().unwrap(),
            "newKey": new_key.thumbprint().unwrap(),
        });
        let nonce = head_nonce(&http, &server.directory_url()).await;
        let inner = old_key.sign(Some(&proof), &nonce, &directory.key_change).unwrap();
        let rolled =
            signed_post_fresh(&http, &new_key, &server, &directory.key_change, &inner).await;
        assert_eq!(rolled.status(), 200);

        // The old key no longer authenticates; the new key does.
        let with_old =
            signed_post_fresh(&http, &old_key, &server, &reg_url, &json!({ "contact": [] })).await;
        assert_eq!(with_old.status(), 401);
        let with_new =
            signed_post_fresh(&http, &new_key, &server, &reg_url, &json!({ "contact": [] })).await;
        assert_eq!(with_new.status(), 200);
    }

    #[tokio::test]
    async fn test_key_change_rejects_bad_proof() {
        let server = spawn_server();
        let http = http();
        let old_key = AccountKey::generate();
        let new_key = AccountKey::generate();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();

        let created = signed_post_fresh(
            &http,
            &old_key,
            &server,
            &directory.new_reg,
            &json!({ "contact": [] }),
        )
        .await;
        let reg_url = created.headers()["location"].to_str().unwrap().to_owned();

        // newKey names a third key, not the outer signer.
        let proof = json!({
            "account": reg_url,
            "oldKey": old_key.thumbprint().unwrap(),
            "newKey": AccountKey::generate().thumbprint().unwrap(),
        });
        let nonce = head_nonce(&http, &server.directory_url()).await;
        let inner = old_key.sign(Some(&proof), &nonce, &directory.key_change).unwrap();
        let rolled =
            signed_post_fresh(&http, &new_key, &server, &directory.key_change, &inner).await;
        assert_eq!(rolled.status(), 403);
        assert!(problem_of(rolled).await.is_kind("unauthorized"));
    }

    #[tokio::test]
    async fn test_authz_deactivation_blocks_challenge_updates() {
        let server = spawn_server();
        let http = http();
        let key = AccountKey::generate();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();

        signed_post_fresh(&http, &key, &server, &directory.new_reg, &json!({ "contact": [] }))
            .await;
        let app = signed_post_fresh(
            &http,
            &key,
            &server,
            &directory.new_app,
            &json!({ "csr": csr_b64(&["deact.not-example.com"]) }),
        )
        .await;
        assert_eq!(app.status(), 201);
        let body: Value = app.json().await.unwrap();
        let authz_url = body["requirements"][0]["url"].as_str().unwrap().to_owned();

        let deactivated = signed_post_fresh(
            &http,
            &key,
            &server,
            &authz_url,
            &json!({ "status": "deactivated" }),
        )
        .await;
        assert_eq!(deactivated.status(), 200);
        let body: Value = deactivated.json().await.unwrap();
        assert_eq!(body["status"], "deactivated");

        // Once terminal, challenge updates are refused.
        let challenge_url = format!("{authz_url}/0");
        let refused = signed_post_fresh(
            &http,
            &key,
            &server,
            &challenge_url,
            &json!({ "type": "auto", "keyAuthorization": "x" }),
        )
        .await;
        assert_eq!(refused.status(), 403);
    }

    #[tokio::test]
    async fn test_bad_challenge_response_invalidates() {
        let server = spawn_server();
        let http = http();
        let key = AccountKey::generate();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();

        signed_post_fresh(&http, &key, &server, &directory.new_reg, &json!({ "contact": [] }))
            .await;
        let app = signed_post_fresh(
            &http,
            &key,
            &server,
            &directory.new_app,
            &json!({ "csr": csr_b64(&["bad.not-example.com"]) }),
        )
        .await;
        let app_url = app.headers()["location"].to_str().unwrap().to_owned();
        let body: Value = app.json().await.unwrap();
        let authz_url = body["requirements"][0]["url"].as_str().unwrap().to_owned();

        let updated = signed_post_fresh(
            &http,
            &key,
            &server,
            &format!("{authz_url}/0"),
            &json!({ "type": "auto", "keyAuthorization": "wrong.thumb" }),
        )
        .await;
        assert_eq!(updated.status(), 200);
        let challenge: Value = updated.json().await.unwrap();
        assert_eq!(challenge["status"], "invalid");

        let authz: Value = http.get(&authz_url).send().await.unwrap().json().await.unwrap();
        assert_eq!(authz["status"], "invalid");
        let app: Value = http.get(&app_url).send().await.unwrap().json().await.unwrap();
        assert_eq!(app["status"], "invalid");
    }

    #[tokio::test]
    async fn test_new_app_validates_dates_and_csr() {
        let server = spawn_server();
        let http = http();
        let key = AccountKey::generate();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();
        signed_post_fresh(&http, &key, &server, &directory.new_reg, &json!({ "contact": [] }))
            .await;

        let bad_csr = signed_post_fresh(
            &http,
            &key,
            &server,
            &directory.new_app,
            &json!({ "csr": util::base64url(b"not a csr") }),
        )
        .await;
        assert_eq!(bad_csr.status(), 400);

        let orphan_not_after = signed_post_fresh(
            &http,
            &key,
            &server,
            &directory.new_app,
            &json!({
                "csr": csr_b64(&["dates.not-example.com"]),
                "notAfter": "2026-06-01T00:00:00Z",
            }),
        )
        .await;
        assert_eq!(orphan_not_after.status(), 400);

        let excessive = signed_post_fresh(
            &http,
            &key,
            &server,
            &directory.new_app,
            &json!({
                "csr": csr_b64(&["dates.not-example.com"]),
                "notBefore": "2026-01-01T00:00:00Z",
                "notAfter": "2046-01-01T00:00:00Z",
            }),
        )
        .await;
        assert_eq!(excessive.status(), 400);
    }

    #[tokio::test]
    async fn test_unregistered_key_cannot_open_applications() {
        let server = spawn_server();
        let http = http();
        let directory: api::Directory =
            http.get(server.directory_url()).send().await.unwrap().json().await.unwrap();

        let response = signed_post_fresh(
            &http,
            &AccountKey::generate(),
            &server,
            &directory.new_app,
            &json!({ "csr": csr_b64(&["nobody.not-example.com"]) }),
        )
        .await;
        assert_eq!(response.status(), 401);
        assert!(problem_of(response).await.is_kind("unauthorized"));
    }
}
