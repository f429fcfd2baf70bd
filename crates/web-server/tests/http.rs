use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use configuration::Settings;
use database::MemoryStore;
use engine::{ControlPlane, ManualClock};
use events::BroadcastPublisher;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;
use web_server::{build_router, AppState};

fn app() -> Router {
    let publisher = BroadcastPublisher::new(64);
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap(),
    ));
    let control = ControlPlane::new(
        Settings::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(publisher.clone()),
        clock,
        None,
    )
    .unwrap();
    let state = Arc::new(AppState::new(Arc::new(control), publisher));
    build_router(state, 64 * 1024)
}

struct Call {
    method: Method,
    uri: String,
    user: Option<Uuid>,
    agent: Option<(String, String)>,
    body: Option<Value>,
}

impl Call {
    fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            user: None,
            agent: None,
            body: None,
        }
    }

    fn user(mut self, user: Uuid) -> Self {
        self.user = Some(user);
        self
    }

    fn agent(mut self, key: &str, secret: &str) -> Self {
        self.agent = Some((key.to_string(), secret.to_string()));
        self
    }

    fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    async fn send(self, app: &Router) -> (StatusCode, Value) {
        let (status, _, body) = self.send_raw(app).await;
        (status, body)
    }

    async fn send_raw(self, app: &Router) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut request = Request::builder().method(self.method).uri(self.uri);
        if let Some(user) = self.user {
            request = request.header("x-user-id", user.to_string());
        }
        if let Some((key, secret)) = self.agent {
            request = request.header("x-api-key", key).header("x-api-secret", secret);
        }
        let body = match self.body {
            Some(body) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, value)
    }
}

async fn register(app: &Router, user: Uuid) -> (String, String, String) {
    let (status, body) = Call::new(Method::POST, "/api/executors")
        .user(user)
        .json(json!({ "name": "London desk" }))
        .send(app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    (
        body["executor"]["id"].as_str().unwrap().to_string(),
        body["apiKey"].as_str().unwrap().to_string(),
        body["apiSecret"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn health_needs_no_identity() {
    let app = app();
    let (status, body) = Call::new(Method::GET, "/api/health").send(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn user_routes_require_a_well_formed_user_id() {
    let app = app();
    let (status, _) = Call::new(Method::GET, "/api/executors").send(&app).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/executors")
        .header("x-user-id", "not-a-uuid")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn registration_returns_the_secret_once_and_hides_the_hash() {
    let app = app();
    let user = Uuid::new_v4();
    let (id, key, _) = register(&app, user).await;
    assert!(key.starts_with("wk_"));

    let (status, body) = Call::new(Method::GET, format!("/api/executors/{id}"))
        .user(user)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isOnline"], false);
    assert!(body.get("apiSecret").is_none());
    assert!(body.get("secretHash").is_none());

    // Another user sees nothing at all.
    let (status, _) = Call::new(Method::GET, format!("/api/executors/{id}"))
        .user(Uuid::new_v4())
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blank_executor_name_is_unprocessable() {
    let app = app();
    let (status, body) = Call::new(Method::POST, "/api/executors")
        .user(Uuid::new_v4())
        .json(json!({ "name": "   " }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn command_round_trip_over_http() {
    let app = app();
    let user = Uuid::new_v4();
    let (id, key, secret) = register(&app, user).await;

    let (status, body) = Call::new(Method::POST, format!("/api/executors/{id}/commands"))
        .user(user)
        .json(json!({ "command": "GET_STATUS", "priority": "HIGH" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["delivery"]["mode"], "queued_for_heartbeat");
    assert_eq!(body["executorStatus"], "offline");
    let command_id = body["command"]["id"].as_str().unwrap().to_string();

    // An empty heartbeat body is a bare ping.
    let (status, body) = Call::new(Method::POST, format!("/api/executor/{id}/heartbeat"))
        .agent(&key, &secret)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["executorId"], id.as_str());
    assert_eq!(body["status"], "online");
    assert!(body["serverTime"].is_string());
    let pending = body["pendingCommands"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], command_id.as_str());
    assert_eq!(pending[0]["command"], "GET_STATUS");
    assert_eq!(pending[0]["priority"], "HIGH");
    assert!(pending[0]["expiresAt"].is_string());

    let status_uri = format!("/api/executor/{id}/commands/{command_id}/status");
    let (status, body) = Call::new(Method::POST, status_uri.clone())
        .agent(&key, &secret)
        .json(json!({ "status": "executed", "result": { "ok": true } }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "executed");

    let (status, body) = Call::new(Method::POST, status_uri)
        .agent(&key, &secret)
        .json(json!({ "status": "failed" }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["currentStatus"], "executed");

    let (status, body) = Call::new(Method::GET, format!("/api/executors/{id}/commands?status=executed"))
        .user(user)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_parameters_are_rejected_before_persistence() {
    let app = app();
    let user = Uuid::new_v4();
    let (id, _, _) = register(&app, user).await;

    let (status, _) = Call::new(Method::POST, format!("/api/executors/{id}/commands"))
        .user(user)
        .json(json!({ "command": "OPEN_POSITION", "parameters": { "symbol": "EURUSD" } }))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, body) = Call::new(Method::GET, format!("/api/executors/{id}/commands"))
        .user(user)
        .send(&app)
        .await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn heartbeat_with_wrong_secret_is_unauthorized() {
    let app = app();
    let user = Uuid::new_v4();
    let (id, key, _) = register(&app, user).await;

    let (status, _) = Call::new(Method::POST, format!("/api/executor/{id}/heartbeat"))
        .agent(&key, "ws_wrong")
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = Call::new(Method::POST, format!("/api/executor/{id}/heartbeat"))
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = Call::new(Method::GET, format!("/api/executors/{id}"))
        .user(user)
        .send(&app)
        .await;
    assert!(body["lastHeartbeat"].is_null());
}

#[tokio::test]
async fn heartbeat_flood_gets_retry_after() {
    let app = app();
    let user = Uuid::new_v4();
    let (id, key, secret) = register(&app, user).await;
    let uri = format!("/api/executor/{id}/heartbeat");

    for _ in 0..30 {
        let (status, _) = Call::new(Method::POST, uri.clone())
            .agent(&key, &secret)
            .send(&app)
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, body) = Call::new(Method::POST, uri)
        .agent(&key, &secret)
        .send_raw(&app)
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[header::RETRY_AFTER], "60");
    assert_eq!(body["retryAfterSecs"], 60);
}

#[tokio::test]
async fn emergency_stop_accepts_an_empty_body() {
    let app = app();
    let user = Uuid::new_v4();
    register(&app, user).await;
    register(&app, user).await;

    let (status, body) = Call::new(Method::POST, "/api/emergency-stop")
        .user(user)
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["executors"].as_array().unwrap().len(), 2);
    assert_eq!(body["commands"].as_array().unwrap().len(), 2);
    assert!(body["failed"].as_array().unwrap().is_empty());
    assert_eq!(body["commands"][0]["command"]["command"], "EMERGENCY_STOP");
    assert_eq!(body["commands"][0]["command"]["priority"], "URGENT");
}

#[tokio::test]
async fn exposure_for_a_user_without_executors_is_low_risk() {
    let app = app();
    let (status, body) = Call::new(Method::GET, "/api/risk/exposure")
        .user(Uuid::new_v4())
        .send(&app)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["riskLevel"], "LOW");
    assert!(body["violations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_route_is_a_json_404() {
    let app = app();
    let (status, body) = Call::new(Method::GET, "/api/nope").send(&app).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No such route");
}
