//! Shared test support: an in-process server on an ephemeral port plus raw
//! signed-request helpers for exercising the transport directly.

use serde_json::Value;

use crate::jws::AccountKey;
use crate::pki::Ca;
use crate::server::{AcmeServer, RunningServer, ServerConfig};

pub(crate) const TERMS_URL: &str = "https://ca.example/terms";

/// A free TCP port on the loopback interface.
///
/// The probing listener is closed before the port is handed out; tests bind
/// it again immediately.
pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("no free port on loopback")
}

/// Test server defaults: loopback, plain http, deterministic challenges,
/// terms configured, no rate limit.
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        allow_insecure: true,
        challenge_types: vec!["auto".to_owned()],
        terms_of_service: Some(TERMS_URL.to_owned()),
        ..ServerConfig::default()
    }
}

pub(crate) fn spawn_server() -> RunningServer {
    spawn_server_with(test_config())
}

pub(crate) fn spawn_server_with(config: ServerConfig) -> RunningServer {
    AcmeServer::new(config, Ca::new())
        .bind()
        .expect("failed to start test server")
}

/// The port a running test server is bound to.
pub(crate) fn server_port(server: &RunningServer) -> u16 {
    server
        .base_url()
        .split('/')
        .nth(2)
        .and_then(|authority| authority.rsplit(':').next())
        .and_then(|port| port.parse().ok())
        .expect("base url carries no port")
}

/// HEAD any server URL and return the attached `Replay-Nonce`.
pub(crate) async fn head_nonce(http: &reqwest::Client, url: &str) -> String {
    http.head(url)
        .send()
        .await
        .expect("preflight failed")
        .headers()
        .get("replay-nonce")
        .and_then(|v| v.to_str().ok())
        .expect("no Replay-Nonce header")
        .to_owned()
}

/// Sign `payload` for `url` (with an explicit nonce) and POST it raw.
pub(crate) async fn signed_post(
    http: &reqwest::Client,
    key: &AccountKey,
    url: &str,
    nonce: &str,
    payload: &Value,
) -> reqwest::Response {
    let jws = key.sign(Some(payload), nonce, url).expect("signing failed");
    http.post(url)
        .header("content-type", crate::api::JOSE_JSON)
        .body(serde_json::to_vec(&jws).unwrap())
        .send()
        .await
        .expect("POST failed")
}

/// Sign and POST, fetching a fresh nonce first.
pub(crate) async fn signed_post_fresh(
    http: &reqwest::Client,
    key: &AccountKey,
    server: &RunningServer,
    url: &str,
    payload: &Value,
) -> reqwest::Response {
    let nonce = head_nonce(http, &server.directory_url()).await;
    signed_post(http, key, url, &nonce, payload).await
}
