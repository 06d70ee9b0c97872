// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Http interface through which remote clients reach a podium server.
//!
//! Every route accepts form encoded fields and answers with JSON. Failures
//! are answered with `400` and either `{podiumError: true, code}` for coded
//! errors or `{error}` for anything else.

use crate::error::PodiumErr;
use crate::podium::Podium;
use crate::wallet::{EncryptedEntry, Identity};
use log::{debug, info};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

/// Context under which identity blobs sent to the server are encrypted
pub const KEYPAIR_CONTEXT: &str = "podium.server";

type Form = HashMap<String, String>;

/// Shared state of the http handlers.
#[derive(Clone)]
pub struct ServerState {
    podium: Podium,
    public_key: Arc<String>,
}

impl ServerState {
    pub fn new(podium: Podium, public_key: &str) -> Self {
        Self {
            podium,
            public_key: Arc::new(public_key.to_owned()),
        }
    }

    /// Identity sent along with a request, if any.
    fn requester(&self, form: &Form) -> Result<Option<Identity>, PodiumErr> {
        let Some(blob) = form.get("keyPair").filter(|b| !b.is_empty()) else {
            return Ok(None);
        };

        let identity = EncryptedEntry::from_blob(blob)
            .and_then(|entry| Identity::decrypt(&entry, &self.public_key, KEYPAIR_CONTEXT))
            .map_err(|_| PodiumErr::Permission)?;

        info!("Request from {}", identity.address());
        Ok(Some(identity))
    }
}

/// Bootstrap configuration handed to remote clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicConfig {
    pub application_id: String,
    pub universe: String,
    pub timeout: u64,
    pub lifetime: u64,
    pub quiet_period: u64,
    pub media_store: String,
    pub root_address: Option<String>,
    pub public_key: String,
}

impl PublicConfig {
    fn new(state: &ServerState) -> Self {
        let config = state.podium.config();

        Self {
            application_id: config.application_id.clone(),
            universe: config.universe.to_string(),
            timeout: config.timeout.map_or(0, |t| t.as_secs()),
            lifetime: config.lifetime.map_or(0, |l| l.as_millis() as u64),
            quiet_period: config.quiet_period.as_millis() as u64,
            media_store: config.media_store.clone(),
            root_address: config.root_address.map(|a| a.to_base58()),
            public_key: state.public_key.to_string(),
        }
    }
}

/// Every route of the http interface.
pub fn routes(
    state: ServerState,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone {
    let config = warp::get()
        .and(warp::path("config"))
        .and(warp::path::end())
        .and(with_state(state.clone()))
        .map(|state: ServerState| warp::reply::json(&PublicConfig::new(&state)).into_response());

    let user = warp::post()
        .and(warp::path("user"))
        .and(warp::path::end())
        .and(form_body())
        .and(with_state(state.clone()))
        .and_then(handle_create_user);

    let is_user = warp::post()
        .and(warp::path("isuser"))
        .and(warp::path::end())
        .and(form_body())
        .and(with_state(state.clone()))
        .and_then(handle_is_user);

    let search = warp::post()
        .and(warp::path("search"))
        .and(warp::path::end())
        .and(form_body())
        .and(with_state(state))
        .and_then(handle_search);

    config.or(user).unify().or(is_user).unify().or(search).unify()
}

/// Serves the http interface until `shutdown` resolves.
pub async fn serve(
    state: ServerState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) {
    let (bound, server) = warp::serve(routes(state)).bind_with_graceful_shutdown(addr, shutdown);
    info!(
        "Podium v{} http interface listening on {}",
        env!("CARGO_PKG_VERSION"),
        bound
    );
    server.await;
}

fn with_state(state: ServerState) -> impl Filter<Extract = (ServerState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn form_body() -> impl Filter<Extract = (Form,), Error = warp::Rejection> + Clone {
    // Reject huge payloads
    warp::body::content_length_limit(1024 * 64).and(warp::body::form::<Form>())
}

fn required<'a>(form: &'a Form, field: &str) -> Result<&'a str, String> {
    form.get(field)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("missing field {field}"))
}

fn optional<'a>(form: &'a Form, field: &str) -> Option<&'a str> {
    form.get(field).map(String::as_str).filter(|v| !v.is_empty())
}

fn error_reply(err: &PodiumErr) -> Response {
    let body = match err.code() {
        Some(code) => json!({ "podiumError": true, "code": code }),
        None => json!({ "error": err.to_string() }),
    };

    warp::reply::with_status(warp::reply::json(&body), StatusCode::BAD_REQUEST).into_response()
}

fn bad_request(message: String) -> Response {
    warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        StatusCode::BAD_REQUEST,
    )
    .into_response()
}

async fn handle_create_user(form: Form, state: ServerState) -> Result<Response, Infallible> {
    if let Err(err) = state.requester(&form) {
        return Ok(error_reply(&err));
    }

    let (id, password, name) = match (
        required(&form, "id"),
        required(&form, "pw"),
        required(&form, "name"),
    ) {
        (Ok(id), Ok(password), Ok(name)) => (id, password, name),
        (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => return Ok(bad_request(err)),
    };

    debug!("Creating user {}", id);
    let result = state
        .podium
        .create_user(
            id,
            password,
            name,
            optional(&form, "bio"),
            optional(&form, "picture"),
            optional(&form, "ext"),
        )
        .await;

    Ok(match result {
        Ok(identity) => warp::reply::json(&json!({ "address": identity.address() })).into_response(),
        Err(err) => error_reply(&err),
    })
}

async fn handle_is_user(form: Form, state: ServerState) -> Result<Response, Infallible> {
    if let Err(err) = state.requester(&form) {
        return Ok(error_reply(&err));
    }

    let id = match required(&form, "id") {
        Ok(id) => id,
        Err(err) => return Ok(bad_request(err)),
    };

    Ok(match state.podium.is_user(id).await {
        Ok(Some(address)) => warp::reply::json(&json!({ "result": address })).into_response(),
        Ok(None) => warp::reply::json(&json!({ "result": false })).into_response(),
        Err(err) => error_reply(&err),
    })
}

async fn handle_search(form: Form, state: ServerState) -> Result<Response, Infallible> {
    if let Err(err) = state.requester(&form) {
        return Ok(error_reply(&err));
    }

    let target = match required(&form, "target") {
        Ok(target) => target,
        Err(err) => return Ok(bad_request(err)),
    };

    Ok(match state.podium.search(target).await {
        Ok(results) => warp::reply::json(&results).into_response(),
        Err(err) => error_reply(&err),
    })
}
