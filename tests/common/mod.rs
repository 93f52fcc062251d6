//! Shared fixtures: a mock controller, credential files and enrollment tokens

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{json, Value};

use zitirtc::identity::{
    credential_path, EnrollmentClaims, IdentityCredential, IdentityMaterial, PasswordCredential,
};

pub const SESSION_TOKEN: &str = "session-token-1";

/// What the mock controller has seen and how it should answer
pub struct ControllerState {
    pub token: Mutex<String>,
    pub reject_auth: AtomicBool,
    pub auth_calls: AtomicUsize,
    pub auth_methods: Mutex<Vec<String>>,
    pub keepalive_status: AtomicU16,
    pub keepalive_calls: AtomicUsize,
    pub session_headers: Mutex<Vec<String>>,
    pub identities: Mutex<HashMap<String, Value>>,
    pub next_identity: AtomicUsize,
    pub enrollments: Mutex<Vec<(String, String, String)>>,
    pub ca_pem: String,
    pub ca_requests: AtomicUsize,
    pub services: Value,
    pub routers: Value,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            token: Mutex::new(SESSION_TOKEN.to_string()),
            reject_auth: AtomicBool::new(false),
            auth_calls: AtomicUsize::new(0),
            auth_methods: Mutex::new(Vec::new()),
            keepalive_status: AtomicU16::new(200),
            keepalive_calls: AtomicUsize::new(0),
            session_headers: Mutex::new(Vec::new()),
            identities: Mutex::new(HashMap::new()),
            next_identity: AtomicUsize::new(1),
            enrollments: Mutex::new(Vec::new()),
            ca_pem: self_signed("ca.test").0,
            ca_requests: AtomicUsize::new(0),
            services: json!([
                {
                    "id": "svc-turn",
                    "name": "turn",
                    "permissions": ["Dial"],
                    "config": {
                        "intercept.v1": {
                            "protocols": ["udp", "tcp"],
                            "addresses": ["turn.ziti"],
                            "portRanges": [{"low": 3478, "high": 3478}]
                        }
                    }
                },
                {"id": "svc-api", "name": "api", "permissions": ["Dial", "Bind"]}
            ]),
            routers: json!([
                {"name": "er-1", "supportedProtocols": {"tls": "tls://127.0.0.1:1"}}
            ]),
        }
    }
}

/// Controller double on an ephemeral loopback port
pub struct MockController {
    pub url: String,
    pub state: Arc<ControllerState>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockController {
    pub async fn start() -> Self {
        let state = Arc::new(ControllerState::default());

        let app = Router::new()
            .route("/edge/management/v1/authenticate", post(authenticate))
            .route("/edge/client/v1/authenticate", post(authenticate))
            .route("/edge/management/v1/", get(keepalive))
            .route("/edge/management/v1/identities", post(create_identity))
            .route(
                "/edge/management/v1/identities/:id",
                get(get_identity)
                    .patch(update_identity)
                    .delete(delete_identity),
            )
            .route("/.well-known/est/cacerts", get(ca_bundle))
            .route("/edge/client/v1/enroll/:method", post(enroll))
            .route("/edge/client/v1/services", get(services))
            .route(
                "/edge/client/v1/current-identity/edge-routers",
                get(routers),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock controller");
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { url, state, handle }
    }

    /// Stop serving; later requests fail at the transport level
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for MockController {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("zt-session")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn authorized(state: &ControllerState, headers: &HeaderMap) -> bool {
    match session_header(headers) {
        Some(token) => {
            state.session_headers.lock().push(token.clone());
            token == *state.token.lock()
        }
        None => false,
    }
}

async fn authenticate(
    State(state): State<Arc<ControllerState>>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    state.auth_calls.fetch_add(1, Ordering::SeqCst);
    state
        .auth_methods
        .lock()
        .push(query.get("method").cloned().unwrap_or_default());

    if state.reject_auth.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"code": "INVALID_AUTH"}})),
        )
            .into_response();
    }
    if body.get("username").is_some() && body["password"] != "secret" {
        return (StatusCode::UNAUTHORIZED, "bad password").into_response();
    }

    let token = state.token.lock().clone();
    // no pooled connections, so a stopped controller is unreachable right away
    (
        [("zt-session", token.clone()), ("connection", "close".to_string())],
        Json(json!({"data": {"token": token, "identity": {"id": "ident-self"}}})),
    )
        .into_response()
}

async fn keepalive(State(state): State<Arc<ControllerState>>, headers: HeaderMap) -> Response {
    state.keepalive_calls.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let status = StatusCode::from_u16(state.keepalive_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::OK);
    (status, Json(json!({"data": {"apiVersions": {}}}))).into_response()
}

async fn create_identity(
    State(state): State<Arc<ControllerState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let id = format!("ident-{}", state.next_identity.fetch_add(1, Ordering::SeqCst));
    state.identities.lock().insert(id.clone(), body);
    (StatusCode::CREATED, Json(json!({"data": {"id": id}}))).into_response()
}

async fn get_identity(
    State(state): State<Arc<ControllerState>>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.identities.lock().get(&id) {
        Some(body) => Json(json!({
            "data": {
                "id": id,
                "name": body["name"],
                "isAdmin": body["isAdmin"],
                "roleAttributes": body["roleAttributes"],
                "enrollment": {"ott": {"jwt": format!("jwt-{}", id)}}
            }
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn update_identity(
    State(state): State<Arc<ControllerState>>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.identities.lock().get_mut(&id) {
        Some(existing) => {
            *existing = body;
            Json(json!({"data": {}})).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_identity(
    State(state): State<Arc<ControllerState>>,
    UrlPath(id): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.identities.lock().remove(&id) {
        Some(_) => Json(json!({"data": {}})).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ca_bundle(State(state): State<Arc<ControllerState>>) -> Response {
    state.ca_requests.fetch_add(1, Ordering::SeqCst);
    let certs: Vec<Vec<u8>> = zitirtc::identity::parse_certificates(&state.ca_pem)
        .unwrap()
        .into_iter()
        .map(|c| c.as_ref().to_vec())
        .collect();
    let body = base64::engine::general_purpose::STANDARD.encode(certs_only_pkcs7(&certs));
    ([("content-type", "application/pkcs7-mime")], body).into_response()
}

async fn enroll(
    State(state): State<Arc<ControllerState>>,
    UrlPath(method): UrlPath<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let token = query.get("token").cloned().unwrap_or_default();
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state
        .enrollments
        .lock()
        .push((method.clone(), token.clone(), content_type));

    if token == "rejected" {
        return (StatusCode::BAD_REQUEST, "token already used").into_response();
    }

    match method.as_str() {
        "ott" => {
            if !body.contains("CERTIFICATE REQUEST") {
                return (StatusCode::BAD_REQUEST, "expected a CSR").into_response();
            }
            let (cert, _) = self_signed("enrolled.test");
            Json(json!({"data": {"cert": cert, "ca": state.ca_pem}})).into_response()
        }
        "updb" => {
            let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            if request["username"].is_string() && request["password"].is_string() {
                Json(json!({"data": {}})).into_response()
            } else {
                (StatusCode::BAD_REQUEST, "missing credentials").into_response()
            }
        }
        _ => (StatusCode::NOT_FOUND, "unknown method").into_response(),
    }
}

async fn services(State(state): State<Arc<ControllerState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"data": state.services})).into_response()
}

async fn routers(State(state): State<Arc<ControllerState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"data": state.routers})).into_response()
}

/// Self-signed certificate and key PEM
pub fn self_signed(name: &str) -> (String, String) {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// Certs-only PKCS#7 SignedData wrapping the given DER certificates
pub fn certs_only_pkcs7(certs: &[Vec<u8>]) -> Vec<u8> {
    const ID_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];
    const ID_SIGNED_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];

    let signed_data = [
        der_tlv(0x02, &[1]),
        der_tlv(0x31, &[]),
        der_tlv(0x30, &der_tlv(0x06, ID_DATA)),
        der_tlv(0xa0, &certs.concat()),
        der_tlv(0x31, &[]),
    ]
    .concat();
    der_tlv(
        0x30,
        &[
            der_tlv(0x06, ID_SIGNED_DATA),
            der_tlv(0xa0, &der_tlv(0x30, &signed_data)),
        ]
        .concat(),
    )
}

fn der_tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    match body.len() {
        len if len < 0x80 => out.push(len as u8),
        len if len < 0x100 => out.extend_from_slice(&[0x81, len as u8]),
        len => out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]),
    }
    out.extend_from_slice(body);
    out
}

/// Write a password credential for `controller_url` next to `identity_path`
pub fn write_password_identity(identity_path: &Path, controller_url: &str, password: &str) {
    let credential = IdentityCredential {
        controller_url: controller_url.to_string(),
        controller_urls: None,
        id: IdentityMaterial::default(),
        config_types: None,
        updb: Some(PasswordCredential {
            username: "device-1".to_string(),
            password: password.to_string(),
        }),
    };
    credential.save(&credential_path(identity_path)).unwrap();
}

/// Enrollment token issued by `controller_url`
pub fn enrollment_jwt(controller_url: &str, method: &str, jti: &str, exp: Option<i64>) -> String {
    let claims = EnrollmentClaims {
        iss: controller_url.to_string(),
        sub: "device-1".to_string(),
        jti: jti.to_string(),
        em: method.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"controller-signing-key"),
    )
    .unwrap()
}
