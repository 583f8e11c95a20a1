//! Resource handlers and the issuance state machine.
//!
//! Every handler runs after the transport gates: the body is a verified JWS
//! and the nonce has been consumed. Handlers capture failures as problem
//! documents and commit no partial state.

use serde_json::json;

use crate::api::{
    self, ApplicationStatus, AuthorizationStatus, Identifier, Problem, Requirement,
};
use crate::challenges::ChallengeState;
use crate::pki;
use crate::server::transport::{Reply, VerifiedPost};
use crate::server::ServerShared;
use crate::store::{Application, Authorization, Certificate, OobSubject, Registration, Store};
use crate::util;

/// new-reg: create a registration unless the key is already registered.
pub(crate) fn new_reg(shared: &ServerShared, post: VerifiedPost) -> Result<Reply, Problem> {
    let payload = registration_payload(&post)?;

    let mut store = shared.store.lock();
    if let Some(existing) = store.reg_by_thumbprint(&post.thumbprint) {
        return Err(Problem::conflict("registration already exists for this key")
            .with_location(shared.url_for("reg", &existing.id)));
    }

    let agreement = check_agreement(shared, payload.agreement)?;
    let reg = Registration {
        id: store.fresh_id(),
        key: post.key,
        thumbprint: post.thumbprint,
        contact: payload.contact.unwrap_or_default(),
        agreement,
    };
    let url = shared.url_for("reg", &reg.id);
    log::debug!("new registration {} ({})", reg.id, reg.thumbprint);
    let body = reg.marshal();
    store.insert_registration(reg);

    Ok(Reply::created(body)
        .location(url)
        .terms_link(shared.config.terms_of_service.clone()))
}

/// update-reg: contact/agreement updates and account deactivation.
pub(crate) fn update_reg(
    shared: &ServerShared,
    id: &str,
    post: VerifiedPost,
) -> Result<Reply, Problem> {
    let payload = registration_payload(&post)?;

    let mut store = shared.store.lock();
    let reg = store.registration(id).ok_or_else(Problem::not_found)?;
    if reg.thumbprint != post.thumbprint {
        return Err(Problem::unauthorized("account key does not own this registration"));
    }

    if payload.is_deactivation() {
        log::debug!("deactivating registration {id}");
        store.remove_registration(id);
        return Ok(Reply::json(json!({ "status": "deactivated" })));
    }

    let agreement = check_agreement(shared, payload.agreement)?;
    let reg = store
        .registration_mut(id)
        .ok_or_else(Problem::server_internal)?;
    if let Some(contact) = payload.contact {
        reg.contact = contact;
    }
    if agreement.is_some() {
        reg.agreement = agreement;
    }
    Ok(Reply::json(reg.marshal()))
}

/// new-app: create an application, its requirements and any missing
/// authorizations, then try immediate issuance.
pub(crate) fn new_app(shared: &ServerShared, post: VerifiedPost) -> Result<Reply, Problem> {
    let payload: api::NewApplication = serde_json::from_value(post.payload.clone())
        .map_err(|err| Problem::malformed(format!("bad application: {err}")))?;

    let csr = pki::parse_csr(&payload.csr).map_err(|err| Problem::malformed(err.to_string()))?;
    let names = pki::check_csr(&csr).map_err(|err| Problem::malformed(err.to_string()))?;
    check_requested_validity(shared, &payload)?;

    let mut store = shared.store.lock();
    let (reg_id, thumbprint) = {
        let reg = store
            .reg_by_thumbprint(&post.thumbprint)
            .ok_or_else(|| Problem::unauthorized("unknown account key"))?;
        (reg.id.clone(), reg.thumbprint.clone())
    };

    let mut requirements = Vec::new();
    for name in &names {
        let (authz_id, status) = match store.authz_for(&reg_id, name) {
            Some(authz) => (authz.id.clone(), authz.status),
            None => create_authorization(shared, &mut store, &reg_id, &thumbprint, name),
        };
        requirements.push(Requirement::Authorization {
            url: shared.url_for("authz", &authz_id),
            status,
        });
    }
    for handler in &shared.config.oob_handlers {
        let subject = OobSubject {
            id: store.fresh_id(),
            reg_id: reg_id.clone(),
            status: AuthorizationStatus::Pending,
        };
        log::debug!("out-of-band requirement {} via {handler}", subject.id);
        requirements.push(Requirement::OutOfBand {
            url: shared.url_for("oob", &subject.id),
            status: subject.status,
        });
        store.insert_oob_subject(subject);
    }

    let app = Application {
        id: store.fresh_id(),
        reg_id,
        csr: payload.csr,
        not_before: payload.not_before,
        not_after: payload.not_after,
        status: ApplicationStatus::Pending,
        requirements,
        certificate: None,
    };
    let app_id = app.id.clone();
    let url = shared.url_for("app", &app_id);
    store.insert_application(app);

    issue_if_ready(shared, &mut store, &app_id)?;
    let app = store
        .application(&app_id)
        .ok_or_else(Problem::server_internal)?;
    Ok(Reply::created(app.marshal()).location(url))
}

/// update-authz without a challenge index: deactivation only.
pub(crate) fn deactivate_authz(
    shared: &ServerShared,
    id: &str,
    post: VerifiedPost,
) -> Result<Reply, Problem> {
    let mut store = shared.store.lock();
    let authz = store.authorization(id).ok_or_else(Problem::not_found)?;
    owner_of(&store, &post)
        .filter(|reg_id| *reg_id == authz.reg_id)
        .ok_or_else(|| Problem::unauthorized("account does not own this authorization"))?;

    let payload = registration_payload(&post)?;
    if !payload.is_deactivation() {
        return Err(Problem::malformed(
            "authorization updates only support deactivation",
        ));
    }

    let authz = store
        .authorization_mut(id)
        .ok_or_else(Problem::server_internal)?;
    authz.status = AuthorizationStatus::Deactivated;
    let body = authz.marshal();
    propagate_authz(shared, &mut store, id)?;
    Ok(Reply::json(body))
}

/// update-authz on a challenge: drive the challenge, then recompute the
/// authorization and every application depending on it.
pub(crate) async fn update_challenge(
    shared: &ServerShared,
    id: &str,
    index: usize,
    post: VerifiedPost,
) -> Result<Reply, Problem> {
    // Snapshot under the lock; probe without it.
    let (state, kind) = {
        let store = shared.store.lock();
        let authz = store.authorization(id).ok_or_else(Problem::not_found)?;
        owner_of(&store, &post)
            .filter(|reg_id| *reg_id == authz.reg_id)
            .ok_or_else(|| Problem::unauthorized("account does not own this authorization"))?;
        if authz.status != AuthorizationStatus::Pending {
            return Err(Problem::forbidden("authorization is no longer pending"));
        }
        let state = authz
            .challenges
            .get(index)
            .ok_or_else(Problem::not_found)?
            .clone();
        let kind = shared
            .kind(&state.kind)
            .ok_or_else(Problem::server_internal)?;
        (state, kind)
    };

    let valid = if kind.accept(&state, &post.payload) {
        match kind.probe(&state, &shared.probe_env).await {
            Ok(()) => true,
            Err(err) => {
                log::debug!("{} probe for {} failed: {err}", state.kind, state.identifier);
                false
            }
        }
    } else {
        log::debug!("{} response for {} rejected", state.kind, state.identifier);
        false
    };

    // Commit and coordinate.
    let mut store = shared.store.lock();
    let authz = store
        .authorization_mut(id)
        .ok_or_else(Problem::not_found)?;
    let challenge = authz
        .challenges
        .get_mut(index)
        .ok_or_else(Problem::not_found)?;
    challenge.responded = true;
    challenge.status = if valid {
        api::ChallengeStatus::Valid
    } else {
        api::ChallengeStatus::Invalid
    };
    let body = challenge.to_json();

    if authz.status == AuthorizationStatus::Pending {
        authz.status = if valid {
            AuthorizationStatus::Valid
        } else {
            AuthorizationStatus::Invalid
        };
    }
    propagate_authz(shared, &mut store, id)?;
    Ok(Reply::json(body))
}

/// key-change: inner JWS signed by the old key proves the rollover.
pub(crate) fn key_change(shared: &ServerShared, post: VerifiedPost) -> Result<Reply, Problem> {
    let inner = crate::jws::verify(&post.payload)
        .map_err(|err| Problem::forbidden(format!("inner JWS: {err}")))?;
    if inner.header.url != post.url {
        return Err(Problem::forbidden("inner JWS url does not match the request"));
    }

    let proof: api::KeyChange = serde_json::from_value(inner.payload)
        .map_err(|err| Problem::forbidden(format!("bad key-change payload: {err}")))?;
    if inner.thumbprint != proof.old_key {
        return Err(Problem::forbidden("inner JWS is not signed by the old key"));
    }
    if proof.new_key != post.thumbprint {
        return Err(Problem::forbidden("outer JWS is not signed by the new key"));
    }

    let mut store = shared.store.lock();
    let reg_id = store
        .reg_by_thumbprint(&proof.old_key)
        .map(|reg| reg.id.clone())
        .ok_or_else(|| Problem::forbidden("old key does not name a registration"))?;
    if proof.account != shared.url_for("reg", &reg_id) {
        return Err(Problem::forbidden("account URL does not match the registration"));
    }

    let reg = store
        .registration_mut(&reg_id)
        .ok_or_else(Problem::server_internal)?;
    log::debug!("key-change for registration {reg_id}");
    reg.key = post.key;
    reg.thumbprint = post.thumbprint;
    Ok(Reply::json(reg.marshal()))
}

/// revoke-cert: any of three ownership proofs suffices.
pub(crate) fn revoke_cert(shared: &ServerShared, post: VerifiedPost) -> Result<Reply, Problem> {
    let payload: api::Revocation = serde_json::from_value(post.payload.clone())
        .map_err(|err| Problem::malformed(format!("bad revocation: {err}")))?;
    let der = util::base64url_decode(&payload.certificate)
        .map_err(|err| Problem::malformed(format!("certificate is not base64url: {err}")))?;

    let mut store = shared.store.lock();
    let (cert_id, owner_reg_id) = {
        let cert = store
            .cert_by_value(&der)
            .ok_or_else(Problem::not_found)?;
        (cert.id.clone(), cert.reg_id.clone())
    };

    let submitter_reg_id = owner_of(&store, &post);
    let owns_account = submitter_reg_id.as_deref() == Some(owner_reg_id.as_str());
    let owns_names = submitter_reg_id
        .as_deref()
        .map(|reg_id| {
            let names = pki::sans_from_der(&der).unwrap_or_default();
            !names.is_empty() && store.authorized_for(reg_id, &names)
        })
        .unwrap_or(false);
    let owns_cert_key = pki::cert_key_thumbprint(&der)
        .map(|thumbprint| thumbprint == post.thumbprint)
        .unwrap_or(false);
    if !(owns_account || owns_names || owns_cert_key) {
        return Err(Problem::forbidden("no proof of authority over this certificate"));
    }

    let reason = payload.reason.unwrap_or(0).clamp(0, 255) as u8;
    let cert = store
        .certificate_mut(&cert_id)
        .ok_or_else(Problem::server_internal)?;
    log::debug!("revoking certificate {cert_id} (reason {reason})");
    cert.revoked = true;
    cert.revocation_reason = Some(reason);
    Ok(Reply::json(json!({})))
}

/// fetch: unauthenticated GET of a public resource.
pub(crate) fn fetch(shared: &ServerShared, kind: &str, id: &str) -> Result<Reply, Problem> {
    let store = shared.store.lock();
    match kind {
        "reg" => Err(Problem::unauthorized(
            "registrations are only served to an authenticated POST",
        )),
        "app" => {
            let app = store.application(id).ok_or_else(Problem::not_found)?;
            Ok(Reply::json(app.marshal()))
        }
        "authz" => {
            let authz = store.authorization(id).ok_or_else(Problem::not_found)?;
            Ok(Reply::json(authz.marshal()))
        }
        "cert" => {
            let cert = store.certificate(id).ok_or_else(Problem::not_found)?;
            let mut reply = Reply::binary(api::PKIX_CERT, cert.der.clone());
            if cert.revoked {
                reply.revocation_reason = Some(cert.revocation_reason.unwrap_or(0));
            }
            Ok(reply)
        }
        _ => Err(Problem::not_found()),
    }
}

/// GET on an OOB URL: either an oob-01 page view or an out-of-band
/// requirement subject.
pub(crate) fn oob_view(shared: &ServerShared, token: &str) -> Result<Reply, Problem> {
    if shared.probe_env.oob.page_view(token) {
        return Ok(Reply::json(json!({ "status": "visited" })));
    }

    let mut store = shared.store.lock();
    let subject = store
        .oob_subject_mut(token)
        .ok_or_else(Problem::not_found)?;
    if subject.status == AuthorizationStatus::Pending {
        subject.status = AuthorizationStatus::Valid;
    }
    let body = subject.marshal();
    let url = shared.url_for("oob", token);
    let reg_id = subject.reg_id.clone();
    propagate_requirement(shared, &mut store, &reg_id, &url, AuthorizationStatus::Valid)?;
    Ok(Reply::json(body))
}

fn registration_payload(post: &VerifiedPost) -> Result<api::Registration, Problem> {
    if post.payload.is_null() {
        return Ok(api::Registration::default());
    }
    serde_json::from_value(post.payload.clone())
        .map_err(|err| Problem::malformed(format!("bad registration payload: {err}")))
}

/// Registration id of the submitting account, if any.
fn owner_of(store: &Store, post: &VerifiedPost) -> Option<String> {
    store
        .reg_by_thumbprint(&post.thumbprint)
        .map(|reg| reg.id.clone())
}

/// An agreement, when present, must equal the configured terms URL exactly.
fn check_agreement(
    shared: &ServerShared,
    agreement: Option<String>,
) -> Result<Option<String>, Problem> {
    match agreement {
        None => Ok(None),
        Some(agreement) => match &shared.config.terms_of_service {
            Some(terms) if *terms == agreement => Ok(Some(agreement)),
            _ => Err(Problem::malformed(format!(
                "agreement {agreement:?} does not match the current terms of service"
            ))),
        },
    }
}

fn check_requested_validity(
    shared: &ServerShared,
    payload: &api::NewApplication,
) -> Result<(), Problem> {
    let parse = |field: &str, value: &str| {
        util::parse_rfc3339(value).map_err(|err| Problem::malformed(format!("{field}: {err}")))
    };
    match (&payload.not_before, &payload.not_after) {
        (None, None) => Ok(()),
        (None, Some(_)) => Err(Problem::malformed("notAfter requires notBefore")),
        (Some(not_before), None) => {
            parse("notBefore", not_before)?;
            Ok(())
        }
        (Some(not_before), Some(not_after)) => {
            let not_before = parse("notBefore", not_before)?;
            let not_after = parse("notAfter", not_after)?;
            if not_after <= not_before {
                return Err(Problem::malformed("notAfter precedes notBefore"));
            }
            let requested = (not_after - not_before).whole_seconds() as u64;
            if requested > shared.config.max_validity_secs {
                return Err(Problem::malformed(format!(
                    "requested validity of {requested}s exceeds the maximum of {}s",
                    shared.config.max_validity_secs
                )));
            }
            Ok(())
        }
    }
}

/// Create a pending authorization with one challenge per configured kind.
fn create_authorization(
    shared: &ServerShared,
    store: &mut Store,
    reg_id: &str,
    thumbprint: &str,
    name: &str,
) -> (String, AuthorizationStatus) {
    let challenges: Vec<ChallengeState> = shared
        .kinds
        .iter()
        .map(|kind| {
            let mut state = kind.offer(name, thumbprint);
            if state.kind == "oob-01" {
                if let Some(token) = state.secrets.first() {
                    shared.probe_env.oob.expose(token);
                    state.oob_url = Some(shared.url_for("oob", token));
                }
            }
            state
        })
        .collect();

    let authz = Authorization {
        id: store.fresh_id(),
        reg_id: reg_id.to_owned(),
        identifier: Identifier::dns(name),
        status: AuthorizationStatus::Pending,
        expires: util::format_rfc3339(util::now_plus_secs(shared.config.authz_expiry_secs)),
        challenges,
    };
    let id = authz.id.clone();
    log::debug!("new authorization {id} for {name}");
    store.insert_authorization(authz);
    (id, AuthorizationStatus::Pending)
}

/// Push an authorization's status into every application that references it.
pub(crate) fn propagate_authz(
    shared: &ServerShared,
    store: &mut Store,
    authz_id: &str,
) -> Result<(), Problem> {
    let (reg_id, status) = match store.authorization(authz_id) {
        Some(authz) => (authz.reg_id.clone(), authz.status),
        None => return Ok(()),
    };
    let url = shared.url_for("authz", authz_id);
    propagate_requirement(shared, store, &reg_id, &url, status)
}

/// Rewrite matching requirements across the registration's applications and
/// re-run issuance on everything touched.
fn propagate_requirement(
    shared: &ServerShared,
    store: &mut Store,
    reg_id: &str,
    url: &str,
    status: AuthorizationStatus,
) -> Result<(), Problem> {
    for app_id in store.application_ids_of(reg_id) {
        let mut touched = false;
        if let Some(app) = store.application_mut(&app_id) {
            for requirement in &mut app.requirements {
                let matches = requirement.url() == url;
                // Requirement statuses never revert from a terminal state.
                if matches && requirement.status() == AuthorizationStatus::Pending {
                    match requirement {
                        Requirement::Authorization { status: s, .. }
                        | Requirement::OutOfBand { status: s, .. } => *s = status,
                    }
                    touched = true;
                }
            }
        }
        if touched {
            issue_if_ready(shared, store, &app_id)?;
        }
    }
    Ok(())
}

/// Issue a certificate once every requirement is valid. Idempotent: a valid
/// application is left untouched.
pub(crate) fn issue_if_ready(
    shared: &ServerShared,
    store: &mut Store,
    app_id: &str,
) -> Result<(), Problem> {
    let app = match store.application(app_id) {
        Some(app) => app,
        None => return Ok(()),
    };
    if app.status != ApplicationStatus::Pending {
        return Ok(());
    }

    if app.requirements.iter().any(|req| {
        matches!(
            req.status(),
            AuthorizationStatus::Invalid | AuthorizationStatus::Deactivated
        )
    }) {
        let app = store
            .application_mut(app_id)
            .ok_or_else(Problem::server_internal)?;
        app.status = ApplicationStatus::Invalid;
        return Ok(());
    }
    if !app.requirements.iter().all(Requirement::is_valid) {
        return Ok(());
    }

    let csr = pki::parse_csr(&app.csr).map_err(|err| {
        log::warn!("stored CSR for application {app_id} failed to parse: {err}");
        Problem::server_internal()
    })?;
    let not_before = parse_stored_date(app.not_before.as_deref());
    let not_after = parse_stored_date(app.not_after.as_deref());
    let reg_id = app.reg_id.clone();

    let der = shared.ca.issue(&csr, not_before, not_after).map_err(|err| {
        log::warn!("issuance for application {app_id} failed: {err}");
        Problem::server_internal()
    })?;

    let cert = Certificate {
        id: store.fresh_id(),
        reg_id,
        der,
        revoked: false,
        revocation_reason: None,
    };
    let cert_url = shared.url_for("cert", &cert.id);
    log::debug!("issued certificate {} for application {app_id}", cert.id);
    store.insert_certificate(cert);

    let app = store
        .application_mut(app_id)
        .ok_or_else(Problem::server_internal)?;
    app.certificate = Some(cert_url);
    app.status = ApplicationStatus::Valid;
    Ok(())
}

fn parse_stored_date(value: Option<&str>) -> Option<time::OffsetDateTime> {
    value.and_then(|value| util::parse_rfc3339(value).ok())
}
