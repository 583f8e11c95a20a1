//! `http-01`: the applicant serves the key authorization over plain HTTP at
//! a well-known path derived from the token.

use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;

use actix_http::{HttpService, Request, Response, StatusCode};
use async_trait::async_trait;
use serde_json::Value;

use crate::api;
use crate::challenges::{ChallengeKind, ChallengeState, ProbeEnv, Validation, ValidationEnv};

pub(crate) const WELL_KNOWN: &str = "/.well-known/acme-challenge";

pub struct Http01Challenge;

#[async_trait]
impl ChallengeKind for Http01Challenge {
    fn name(&self) -> &'static str {
        "http-01"
    }

    async fn probe(&self, state: &ChallengeState, env: &ProbeEnv) -> eyre::Result<()> {
        let authority = if env.http_port == 80 {
            state.identifier.clone()
        } else {
            format!("{}:{}", state.identifier, env.http_port)
        };
        let url = format!("http://{authority}{WELL_KNOWN}/{}", state.token);
        log::debug!("http-01 probe: GET {url}");

        let response = tokio::time::timeout(env.timeout, env.http.get(&url).send())
            .await
            .map_err(|_| eyre::eyre!("http-01 probe timed out"))??;
        eyre::ensure!(
            response.status().is_success(),
            "http-01 probe got HTTP {}",
            response.status()
        );

        let body = tokio::time::timeout(env.timeout, response.text())
            .await
            .map_err(|_| eyre::eyre!("http-01 probe timed out"))??;
        // Trailing whitespace is ignored; the content must match exactly
        // otherwise.
        eyre::ensure!(
            body.trim_end() == state.key_authorization,
            "http-01 probe body does not match the key authorization"
        );
        Ok(())
    }
}

pub struct Http01Validation;

#[async_trait]
impl Validation for Http01Validation {
    fn name(&self) -> &'static str {
        "http-01"
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
            .ok_or_else(|| eyre::eyre!("response carries no key authorization"))?
            .to_owned();
        let path = format!("{WELL_KNOWN}/{}", challenge.token);

        let listener = std::net::TcpListener::bind((env.bind, env.http_port))?;
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let served = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let server = actix_server::Server::build()
            .listen("acme-http-01", listener, {
                let path = path.clone();
                move || {
                    let path = path.clone();
                    let key_auth = key_auth.clone();
                    let served = Arc::clone(&served);
                    HttpService::build()
                        .finish(move |req: Request| {
                            let response = if req.path() == path {
                                if let Some(tx) = served.lock().take() {
                                    let _ = tx.send(());
                                }
                                Response::build(StatusCode::OK)
                                    .content_type("text/plain")
                                    .body(key_auth.clone())
                                    .map_into_boxed_body()
                            } else {
                                Response::build(StatusCode::NOT_FOUND)
                                    .finish()
                                    .map_into_boxed_body()
                            };
                            ready(Ok::<_, Infallible>(response))
                        })
                        .tcp()
                }
            })?
            .workers(1)
            .run();
        let handle = server.handle();
        tokio::spawn(server);

        let outcome = tokio::time::timeout(env.timeout, rx).await;
        handle.stop(true).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(eyre::eyre!("http-01 listener dropped")),
            Err(_) => Err(eyre::eyre!("http-01 listener was never probed")),
        }
    }
}
