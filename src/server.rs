//! HTTP inbox API.
//!
//! Routes:
//!   POST   /message                         create, Message JSON in/out
//!   LIST   /messages?channel=…              meta array, X-Signature required
//!   GET    /message/{keyID}/{channel}/{id}  raw envelope bytes, X-Signature required
//!   DELETE /message/{keyID}/{channel}/{id}  200 OK, X-Signature required
//!   GET    /statusz                         200 "OK", no auth
//!
//! The optional shared token (`X-Token`) gates cluster access; the
//! signature proves inbox ownership.  Both checks are independent: a
//! valid token without a valid signature never reads an inbox.

use crate::cfg::PeerConfig;
use crate::message::{self, clean_channel, Message, MessageError};
use crate::sign::{self, SignError};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::clog;
use crate::events::EventRouter;
use crate::persist::MessageStore;

#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Tls(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(error) => write!(f, "io error: {error}"),
            ServerError::Tls(message) => write!(f, "tls error: {message}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(error: std::io::Error) -> Self {
        ServerError::Io(error)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MessageStore>,
    pub router: Arc<EventRouter>,
    pub auth_token: Option<String>,
}

fn sign_error_response(error: SignError) -> Response {
    (StatusCode::BAD_REQUEST, error.to_string()).into_response()
}

fn message_error_response(error: MessageError) -> Response {
    match error {
        MessageError::NotFound => {
            (StatusCode::NOT_FOUND, error.to_string()).into_response()
        }
        MessageError::MissingField(_) => {
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
        other => {
            clog!(error, "server: internal error: {other}");
            (StatusCode::BAD_REQUEST, other.to_string()).into_response()
        }
    }
}

/// Verify the signature header and check inbox ownership against the
/// key id named in the path.
fn authorize(headers: &HeaderMap, key_id: &str) -> Result<String, Response> {
    let derived = verify_signature(headers)?;
    if derived != key_id {
        clog!(warn, "server: key id mismatch: {derived} != {key_id}");
        return Err((StatusCode::BAD_REQUEST, "key id mismatch").into_response());
    }
    Ok(derived)
}

fn verify_signature(headers: &HeaderMap) -> Result<String, Response> {
    let header = headers
        .get("x-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    sign::verify_header(header).map_err(sign_error_response)
}

async fn handle_create_message(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Response {
    let msg: Message = match serde_json::from_slice(&body) {
        Ok(msg) => msg,
        Err(error) => {
            return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
        }
    };
    match message::create(&state.store, &state.router, msg).await {
        Ok(stored) => Json(stored).into_response(),
        Err(error) => message_error_response(error),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    channel: Option<String>,
}

async fn handle_list_messages(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    if method.as_str() != "LIST" {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let key_id = match verify_signature(&headers) {
        Ok(key_id) => key_id,
        Err(response) => return response,
    };
    let channel = clean_channel(query.channel.as_deref().unwrap_or(""));
    match message::list(&state.store, &key_id, &channel) {
        Ok(meta) => Json(meta).into_response(),
        Err(error) => message_error_response(error),
    }
}

async fn handle_get_message(
    State(state): State<AppState>,
    Path((key_id, channel, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&headers, &key_id) {
        return response;
    }
    let channel = clean_channel(&channel);
    match message::get(&state.store, &key_id, &channel, &id) {
        Ok(msg) => msg.data.into_response(),
        Err(error) => message_error_response(error),
    }
}

async fn handle_delete_message(
    State(state): State<AppState>,
    Path((key_id, channel, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&headers, &key_id) {
        return response;
    }
    let channel = clean_channel(&channel);
    match message::delete(&state.store, &state.router, &key_id, &channel, &id, false).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => message_error_response(error),
    }
}

async fn handle_statusz() -> impl IntoResponse {
    "OK"
}

async fn auth_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(token) = &state.auth_token {
        let exempt = request.uri().path() == "/statusz";
        let presented = request
            .headers()
            .get("x-token")
            .and_then(|value| value.to_str().ok());
        if !exempt && presented != Some(token.as_str()) {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    next.run(request).await
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let list_method = Method::from_bytes(b"LIST").expect("static method");
    let layer = CorsLayer::new()
        .allow_methods(vec![
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PUT,
            list_method,
        ])
        .allow_headers(vec![
            HeaderName::from_static("x-token"),
            HeaderName::from_static("x-signature"),
            HeaderName::from_static("content-type"),
        ]);
    let wildcard = origins.is_empty() || origins.iter().any(|origin| origin == "*");
    if wildcard {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        layer.allow_origin(parsed)
    }
}

/// Build the router with auth and CORS applied.
pub fn app(state: AppState, cors: &[String]) -> Router {
    Router::new()
        .route("/message", post(handle_create_message))
        .route("/messages", any(handle_list_messages))
        .route(
            "/message/:keyID/:channel/:id",
            get(handle_get_message).delete(handle_delete_message),
        )
        .route("/statusz", get(handle_statusz))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(cors_layer(cors))
        .with_state(state)
}

/// Serve the inbox API, with TLS when both cert and key paths are set.
pub async fn serve(state: AppState, config: &PeerConfig) -> Result<(), ServerError> {
    let app = app(state, &config.server_cors);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let use_tls = !config.server_tls_cert_path.is_empty() && !config.server_tls_key_path.is_empty();
    if use_tls {
        clog!(info, "server: listening on {addr} (tls)");
        let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.server_tls_cert_path,
            &config.server_tls_key_path,
        )
        .await
        .map_err(|error| ServerError::Tls(error.to_string()))?;
        axum_server::bind_rustls(addr, rustls)
            .serve(app.into_make_service())
            .await?;
    } else {
        clog!(info, "server: listening on {addr}");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
    }
    Ok(())
}
