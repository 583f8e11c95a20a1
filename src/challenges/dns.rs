//! `dns-01`: the applicant publishes base64url(SHA-256(key authorization))
//! in a TXT record under `_acme-challenge.{name}`, looked up over TCP.

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata::TXT;
use trust_dns_proto::rr::{RData, Record, RecordType};
use trust_dns_resolver::config::{
    NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts,
};
use trust_dns_resolver::TokioAsyncResolver;

use crate::api;
use crate::challenges::{ChallengeKind, ChallengeState, ProbeEnv, Validation, ValidationEnv};
use crate::util;

fn txt_value(key_authorization: &str) -> String {
    util::base64url(&Sha256::digest(key_authorization.as_bytes()))
}

fn challenge_record(identifier: &str) -> String {
    format!("_acme-challenge.{}.", identifier.trim_end_matches('.'))
}

pub struct Dns01Challenge;

#[async_trait]
impl ChallengeKind for Dns01Challenge {
    fn name(&self) -> &'static str {
        "dns-01"
    }

    async fn probe(&self, state: &ChallengeState, env: &ProbeEnv) -> eyre::Result<()> {
        let expected = txt_value(&state.key_authorization);
        let name = challenge_record(&state.identifier);
        log::debug!("dns-01 probe: TXT {name}");

        let resolver = match env.dns_server {
            Some(addr) => {
                let mut opts = ResolverOpts::default();
                opts.timeout = env.timeout;
                let nameserver = NameServerConfig::new(addr, Protocol::Tcp);
                let config = ResolverConfig::from_parts(
                    None,
                    vec![],
                    NameServerConfigGroup::from(vec![nameserver]),
                );
                TokioAsyncResolver::tokio(config, opts)
            }
            None => TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|err| eyre::eyre!("no usable DNS configuration: {err}"))?,
        };

        let lookup = tokio::time::timeout(env.timeout, resolver.txt_lookup(name.clone()))
            .await
            .map_err(|_| eyre::eyre!("dns-01 probe timed out"))?
            .map_err(|err| eyre::eyre!("TXT lookup for {name} failed: {err}"))?;

        let matched = lookup.iter().any(|txt| {
            txt.txt_data()
                .iter()
                .any(|chunk| chunk.as_ref() == expected.as_bytes())
        });
        eyre::ensure!(matched, "no TXT record for {name} matches the key authorization");
        Ok(())
    }
}

pub struct Dns01Validation;

#[async_trait]
impl Validation for Dns01Validation {
    fn name(&self) -> &'static str {
        "dns-01"
    }

    async fn respond(
        &self,
        _identifier: &str,
        _challenge: &api::Challenge,
        response: &Value,
        env: &ValidationEnv,
    ) -> eyre::Result<()> {
        let key_auth = response["keyAuthorization"]
            .as_str()
            .ok_or_else(|| eyre::eyre!("response carries no key authorization"))?;
        let value = txt_value(key_auth);

        let listener = tokio::net::TcpListener::bind((env.bind, env.dns_port)).await?;
        let work = async {
            loop {
                let (stream, _) = listener.accept().await?;
                match serve_txt(stream, &value).await {
                    Ok(true) => return Ok::<_, eyre::Report>(()),
                    Ok(false) => continue,
                    Err(err) => {
                        log::debug!("dns-01 responder connection failed: {err}");
                        continue;
                    }
                }
            }
        };
        tokio::time::timeout(env.timeout, work)
            .await
            .map_err(|_| eyre::eyre!("dns-01 listener was never probed"))?
    }
}

/// Answer one TCP DNS query; returns true once a TXT question was served.
async fn serve_txt(mut stream: tokio::net::TcpStream, value: &str) -> eyre::Result<bool> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut buf).await?;
    let query = Message::from_vec(&buf)?;

    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true)
        .set_recursion_desired(query.recursion_desired())
        .set_response_code(ResponseCode::NoError);

    let mut answered = false;
    for question in query.queries() {
        reply.add_query(question.clone());
        if question.query_type() == RecordType::TXT {
            let record = Record::from_rdata(
                question.name().clone(),
                0,
                RData::TXT(TXT::new(vec![value.to_owned()])),
            );
            reply.add_answer(record);
            answered = true;
        }
    }

    let bytes = reply.to_vec()?;
    stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(answered)
}
