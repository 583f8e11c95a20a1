//! `oob-01`: out-of-band page view. The server exposes a random URL and the
//! challenge succeeds once anything fetches it.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::api;
use crate::challenges::{ChallengeKind, ChallengeState, ProbeEnv, Validation, ValidationEnv};
use crate::jws::AccountKey;
use crate::util;

pub struct Oob01Challenge;

#[async_trait]
impl ChallengeKind for Oob01Challenge {
    fn name(&self) -> &'static str {
        "oob-01"
    }

    fn offer(&self, identifier: &str, thumbprint: &str) -> ChallengeState {
        let mut state = ChallengeState::new(self.name(), identifier, thumbprint);
        // Page token; the server wires it into a URL when it serves the
        // authorization.
        state.secrets = vec![util::random_token()];
        state
    }

    /// The page view is the proof; no key authorization is expected.
    fn accept(&self, _state: &ChallengeState, response: &Value) -> bool {
        response["type"] == *self.name()
    }

    async fn probe(&self, state: &ChallengeState, env: &ProbeEnv) -> eyre::Result<()> {
        let token = state
            .secrets
            .first()
            .ok_or_else(|| eyre::eyre!("oob-01 challenge is missing its page token"))?;
        env.oob.expose(token);

        let rx = env.oob.wait(token);
        tokio::time::timeout(env.timeout, rx)
            .await
            .map_err(|_| eyre::eyre!("oob-01 page was never viewed"))?
            .map_err(|_| eyre::eyre!("oob-01 wait was abandoned"))
    }
}

pub struct Oob01Validation;

#[async_trait]
impl Validation for Oob01Validation {
    fn name(&self) -> &'static str {
        "oob-01"
    }

    /// Out-of-band responses carry the type alone.
    fn make_response(&self, _key: &AccountKey, _challenge: &api::Challenge) -> eyre::Result<Value> {
        Ok(json!({ "type": self.name() }))
    }

    async fn respond(
        &self,
        _identifier: &str,
        challenge: &api::Challenge,
        _response: &Value,
        env: &ValidationEnv,
    ) -> eyre::Result<()> {
        let url = challenge
            .url
            .as_deref()
            .ok_or_else(|| eyre::eyre!("oob-01 challenge carries no URL"))?;
        log::debug!("oob-01 page view: GET {url}");

        let client = reqwest::Client::builder().timeout(env.timeout).build()?;
        let response = tokio::time::timeout(env.timeout, client.get(url).send())
            .await
            .map_err(|_| eyre::eyre!("oob-01 page view timed out"))??;
        eyre::ensure!(
            response.status().is_success(),
            "oob-01 page view got HTTP {}",
            response.status()
        );
        Ok(())
    }
}
