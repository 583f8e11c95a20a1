//! `auto`: a deterministic challenge whose probe always succeeds.
//!
//! Meant for test rigs and local development, where standing up real
//! listeners on privileged ports is not an option.

use async_trait::async_trait;
use serde_json::Value;

use crate::api;
use crate::challenges::{ChallengeKind, ChallengeState, ProbeEnv, Validation, ValidationEnv};

pub struct AutoChallenge;

#[async_trait]
impl ChallengeKind for AutoChallenge {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn probe(&self, _state: &ChallengeState, _env: &ProbeEnv) -> eyre::Result<()> {
        Ok(())
    }
}

pub struct AutoValidation;

#[async_trait]
impl Validation for AutoValidation {
    fn name(&self) -> &'static str {
        "auto"
    }

    async fn respond(
        &self,
        _identifier: &str,
        _challenge: &api::Challenge,
        _response: &Value,
        _env: &ValidationEnv,
    ) -> eyre::Result<()> {
        Ok(())
    }
}
