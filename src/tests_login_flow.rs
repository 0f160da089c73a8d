//! End-to-end login scenarios against a stub identity service

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::api::{CredentialInput, IdentityApi, PasswordCredential};
use crate::auth::gateway::CsrfGateway;
use crate::auth::login::{LoginManager, LoginMode, LoginStatus};
use crate::auth::session::SessionManager;
use crate::config::ServiceConfig;
use crate::error::{AuthError, ErrorCode};

struct StubState {
    totp_enabled: bool,
    logged_in: Mutex<bool>,
    session_down: Mutex<bool>,
    session_bodies: Mutex<Vec<Value>>,
    login_bodies: Mutex<Vec<Value>>,
    login_csrf: Mutex<Vec<Option<String>>>,
}

fn encode_segment(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.encode(bytes)
}

fn make_bearer(sub: &str) -> String {
    let payload = json!({ "sub": sub, "iat": 1_700_000_000 }).to_string();
    format!(
        "{}.{}.{}",
        encode_segment(br#"{"alg":"HS256","typ":"JWT"}"#),
        encode_segment(payload.as_bytes()),
        encode_segment(b"sig")
    )
}

fn anonymous_bearer() -> String {
    let payload = json!({ "anon": true }).to_string();
    format!(
        "{}.{}.{}",
        encode_segment(br#"{"alg":"HS256","typ":"JWT"}"#),
        encode_segment(payload.as_bytes()),
        encode_segment(b"sig")
    )
}

async fn session_handler(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.session_bodies.lock().unwrap().push(body);

    if *state.session_down.lock().unwrap() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": { "code": "UNAVAILABLE", "message": "session service is down" }
            })),
        );
    }

    let bearer = if *state.logged_in.lock().unwrap() {
        make_bearer("acct:bob")
    } else {
        anonymous_bearer()
    };
    (
        StatusCode::OK,
        Json(json!({ "csrfToken": "csrf-test-1", "bearerToken": bearer })),
    )
}

async fn login_handler(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.login_csrf.lock().unwrap().push(
        headers
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    state.login_bodies.lock().unwrap().push(body.clone());

    let credential = &body["credential"];
    let password_ok = credential["password"]["email"] == "bob@bob.com"
        && credential["password"]["password"] == "hunter2";
    let oauth_ok = credential["oauthToken"].as_str().is_some();
    if !password_ok && !oauth_ok {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": { "code": "INVALID_CREDENTIALS", "message": "Wrong email or password" }
            })),
        );
    }

    if state.totp_enabled {
        match body["totpCode"].as_str() {
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": { "code": "TOTP_REQUIRED", "message": "A one-time code is required" }
                    })),
                );
            }
            Some("123456") | Some("ABCD-1234-WXYZ") => {}
            Some(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": { "code": "BAD_CODE", "message": "That code is not right" }
                    })),
                );
            }
        }
    }

    *state.logged_in.lock().unwrap() = true;
    (
        StatusCode::OK,
        Json(json!({ "bearerToken": make_bearer("acct:bob") })),
    )
}

async fn start_stub(totp_enabled: bool) -> (SocketAddr, Arc<StubState>) {
    let state = Arc::new(StubState {
        totp_enabled,
        logged_in: Mutex::new(false),
        session_down: Mutex::new(false),
        session_bodies: Mutex::new(Vec::new()),
        login_bodies: Mutex::new(Vec::new()),
        login_csrf: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/api/session", post(session_handler))
        .route("/api/login", post(login_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

struct Harness {
    session: SessionManager,
    api: IdentityApi,
}

async fn connect_to_stub(addr: SocketAddr) -> Harness {
    let config = ServiceConfig::new(&format!("http://{}", addr), "test-app").unwrap();
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let session = SessionManager::new(config.clone(), client.clone());
    session.bootstrap().await.unwrap();

    let api = IdentityApi::new(CsrfGateway::new(client, config, session.subscribe()));
    Harness { session, api }
}

fn bob_credential() -> CredentialInput {
    CredentialInput::Password(PasswordCredential {
        email: "bob@bob.com".to_string(),
        password: "hunter2".to_string(),
    })
}

#[tokio::test]
async fn password_login_end_to_end() {
    let (addr, state) = start_stub(false).await;
    let harness = connect_to_stub(addr).await;

    // Bootstrap announced the application and yielded the csrf token
    assert_eq!(
        state.session_bodies.lock().unwrap()[0]["applicationId"],
        "test-app"
    );
    let snapshot = harness.session.snapshot();
    assert!(snapshot.is_established());
    assert!(snapshot.subject_id().is_none(), "still anonymous");

    let mut manager = LoginManager::new(&harness.api, &harness.session);
    manager
        .submit_credential(bob_credential(), true)
        .await
        .unwrap();

    // The gated call carried the session's csrf token
    assert_eq!(
        state.login_csrf.lock().unwrap()[0].as_deref(),
        Some("csrf-test-1")
    );
    assert_eq!(state.login_bodies.lock().unwrap()[0]["stayLoggedIn"], true);

    // Mutation and session agree, so login completes exactly once
    let snapshot = harness.session.snapshot();
    assert_eq!(snapshot.subject_id(), Some("acct:bob"));
    assert_eq!(manager.flow().status(&snapshot), LoginStatus::Complete);
    assert!(manager.flow_mut().take_logged_in(&snapshot));
    assert!(!manager.flow_mut().take_logged_in(&snapshot));
}

#[tokio::test]
async fn refresh_failure_keeps_last_good_tokens() {
    let (addr, state) = start_stub(false).await;
    let harness = connect_to_stub(addr).await;

    let mut manager = LoginManager::new(&harness.api, &harness.session);
    manager
        .submit_credential(bob_credential(), false)
        .await
        .unwrap();

    let good = harness.session.snapshot();
    assert_eq!(good.subject_id(), Some("acct:bob"));

    // The service goes away; the next refresh fails
    *state.session_down.lock().unwrap() = true;
    let err = harness.session.refresh_now().await.unwrap_err();
    assert!(matches!(err, AuthError::Application { .. }));

    // The last successful snapshot is served unchanged, only the
    // diagnostic error slot records the failure
    let after = harness.session.snapshot();
    assert_eq!(after.csrf_token, good.csrf_token);
    assert_eq!(after.bearer_token, good.bearer_token);
    assert_eq!(after.subject_id(), Some("acct:bob"));
    assert!(after.error.is_some());

    // Login stays reported; the blip never signs the user out
    assert!(manager.flow_mut().take_logged_in(&after));

    // Once the service is back, a refresh clears the recorded error
    *state.session_down.lock().unwrap() = false;
    harness.session.refresh_now().await.unwrap();
    let recovered = harness.session.snapshot();
    assert_eq!(recovered.subject_id(), Some("acct:bob"));
    assert!(recovered.error.is_none());
}

#[tokio::test]
async fn totp_detour_preserves_the_attempt() {
    let (addr, state) = start_stub(true).await;
    let harness = connect_to_stub(addr).await;

    let mut manager = LoginManager::new(&harness.api, &harness.session);
    manager
        .submit_credential(bob_credential(), true)
        .await
        .unwrap();
    assert_eq!(manager.flow().mode(), LoginMode::Totp);
    assert!(manager.flow().error().is_none());

    manager.submit_second_factor("123456").await.unwrap();

    // The second call resent the original credential with the code attached
    let bodies = state.login_bodies.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0]["totpCode"].is_null());
    assert_eq!(bodies[1]["totpCode"], "123456");
    assert_eq!(bodies[1]["credential"]["password"]["email"], "bob@bob.com");
    assert_eq!(bodies[1]["stayLoggedIn"], true);
    drop(bodies);

    let snapshot = harness.session.snapshot();
    assert!(manager.flow_mut().take_logged_in(&snapshot));
}

#[tokio::test]
async fn wrong_password_surfaces_in_place() {
    let (addr, _state) = start_stub(false).await;
    let harness = connect_to_stub(addr).await;

    let mut manager = LoginManager::new(&harness.api, &harness.session);
    let err = manager
        .submit_credential(
            CredentialInput::Password(PasswordCredential {
                email: "eve@eve.com".to_string(),
                password: "guess".to_string(),
            }),
            false,
        )
        .await
        .unwrap_err();

    match &err {
        AuthError::Application { code, message } => {
            assert_eq!(*code, ErrorCode::Other("INVALID_CREDENTIALS".to_string()));
            assert_eq!(message, "Wrong email or password");
        }
        other => panic!("expected an application error, got {:?}", other),
    }

    // No state change: still on the primary form, error kept for display
    assert_eq!(manager.flow().mode(), LoginMode::Login);
    assert_eq!(manager.flow().error(), Some("Wrong email or password"));
    let snapshot = harness.session.snapshot();
    assert!(snapshot.subject_id().is_none());
    assert!(!manager.flow_mut().take_logged_in(&snapshot));

    // A corrected retry goes through
    manager
        .submit_credential(bob_credential(), false)
        .await
        .unwrap();
    assert!(manager.flow_mut().take_logged_in(&harness.session.snapshot()));
}

#[tokio::test]
async fn recovery_code_login_waits_for_dismissal() {
    let (addr, _state) = start_stub(true).await;
    let harness = connect_to_stub(addr).await;

    let mut manager = LoginManager::new(&harness.api, &harness.session);
    manager
        .submit_credential(bob_credential(), false)
        .await
        .unwrap();
    manager.submit_second_factor("ABCD-1234-WXYZ").await.unwrap();

    let snapshot = harness.session.snapshot();
    assert_eq!(snapshot.subject_id(), Some("acct:bob"));
    assert_eq!(manager.flow().status(&snapshot), LoginStatus::RecoveryNotice);
    assert!(
        !manager.flow_mut().take_logged_in(&snapshot),
        "not reported while the notice is up"
    );

    manager.flow_mut().dismiss_recovery_notice();
    assert!(manager.flow_mut().take_logged_in(&snapshot));
    assert!(!manager.flow_mut().take_logged_in(&snapshot));
}

#[tokio::test]
async fn invalid_second_factor_never_reaches_the_service() {
    let (addr, state) = start_stub(true).await;
    let harness = connect_to_stub(addr).await;

    let mut manager = LoginManager::new(&harness.api, &harness.session);
    manager
        .submit_credential(bob_credential(), false)
        .await
        .unwrap();
    assert_eq!(state.login_bodies.lock().unwrap().len(), 1);

    let err = manager.submit_second_factor("12345").await.unwrap_err();
    assert!(matches!(err, AuthError::Config(_)));
    assert_eq!(
        state.login_bodies.lock().unwrap().len(),
        1,
        "the malformed code was rejected locally"
    );

    manager.submit_second_factor("123456").await.unwrap();
    assert_eq!(state.login_bodies.lock().unwrap().len(), 2);
}
