pub mod auth;

use self::auth::AuthKeys;
use crate::metrics::{BatchMetricResult, MetricQuery, MetricQueryRequest, MetricsError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::error;
use nms_shared::bus::{EntityError, EntityHandle};
use nms_shared::config::ServerConfig;
use nms_shared::crypto::PayloadCipher;
use nms_shared::entity::{
    CredentialProfile, Device, DeviceChanges, DiscoveryProfile, DiscoveryProfileChanges,
    NewCredentialProfile, NewDevice, NewDiscoveryProfile,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Everything the handlers need, cloned per request by axum.
#[derive(Clone)]
pub struct ApiState {
    pub entity: EntityHandle,
    pub metrics: mpsc::Sender<MetricQueryRequest>,
    pub cipher: PayloadCipher,
    pub auth: Arc<AuthKeys>,
    pub admin_username: String,
    pub admin_password: String,
}

impl ApiState {
    pub fn new(
        config: &ServerConfig,
        entity: EntityHandle,
        metrics: mpsc::Sender<MetricQueryRequest>,
        cipher: PayloadCipher,
    ) -> Self {
        ApiState {
            entity,
            metrics,
            cipher,
            auth: Arc::new(AuthKeys::new(&config.jwt_secret, config.jwt_ttl_minutes)),
            admin_username: config.admin_username.clone(),
            admin_password: config.admin_password.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<EntityError> for ApiError {
    fn from(e: EntityError) -> Self {
        let status = match &e {
            EntityError::NotFound { .. } => StatusCode::NOT_FOUND,
            EntityError::Invalid(_) | EntityError::Immutable(_) => StatusCode::BAD_REQUEST,
            EntityError::Duplicate { .. } => StatusCode::CONFLICT,
            EntityError::Database(inner) => {
                error!("api - database error: {}", inner);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EntityError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<MetricsError> for ApiError {
    fn from(e: MetricsError) -> Self {
        let status = match &e {
            MetricsError::InvalidPath(_) | MetricsError::InvalidLimit => StatusCode::BAD_REQUEST,
            MetricsError::Database(inner) => {
                error!("api - metrics database error: {}", inner);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            MetricsError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError::new(status, e.to_string())
    }
}

pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route(
            "/credential-profiles",
            get(list_credential_profiles).post(create_credential_profile),
        )
        .route(
            "/credential-profiles/{id}",
            get(get_credential_profile)
                .put(update_credential_profile)
                .delete(delete_credential_profile),
        )
        .route(
            "/discovery-profiles",
            get(list_discovery_profiles).post(create_discovery_profile),
        )
        .route(
            "/discovery-profiles/{id}",
            get(get_discovery_profile)
                .put(update_discovery_profile)
                .delete(delete_discovery_profile),
        )
        .route("/discovery-profiles/{id}/run", post(run_discovery_profile))
        .route("/devices", get(list_devices).post(create_device))
        .route(
            "/devices/{id}",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/devices/{id}/activate", post(activate_device))
        .route("/metrics/query", post(query_metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));
    Router::new()
        .route("/auth/login", post(login))
        .nest("/api", protected)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<ApiState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.admin_password.is_empty()
        || body.username != state.admin_username
        || body.password != state.admin_password
    {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid credentials"));
    }
    let token = state
        .auth
        .issue(&body.username)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "token": token })))
}

// ---- credential profiles ----

/// Create/update bodies carry the plaintext credential object; it is
/// encrypted here, at the boundary, so the core only ever sees ciphertext.
#[derive(Debug, Deserialize)]
struct CreateCredentialProfile {
    name: String,
    protocol: String,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct UpdateCredentialProfile {
    name: Option<String>,
    payload: Option<serde_json::Value>,
}

fn encrypt_payload(state: &ApiState, payload: &serde_json::Value) -> Result<String, ApiError> {
    let raw = serde_json::to_vec(payload)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    state
        .cipher
        .encrypt(&raw)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn list_credential_profiles(
    State(state): State<ApiState>,
) -> Result<Json<Vec<CredentialProfile>>, ApiError> {
    Ok(Json(state.entity.list_credential_profiles().await?))
}

async fn get_credential_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<CredentialProfile>, ApiError> {
    Ok(Json(state.entity.get_credential_profile(id).await?))
}

async fn create_credential_profile(
    State(state): State<ApiState>,
    Json(body): Json<CreateCredentialProfile>,
) -> Result<(StatusCode, Json<CredentialProfile>), ApiError> {
    let payload = encrypt_payload(&state, &body.payload)?;
    let profile = state
        .entity
        .create_credential_profile(NewCredentialProfile {
            name: body.name,
            protocol: body.protocol,
            payload,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn update_credential_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateCredentialProfile>,
) -> Result<Json<CredentialProfile>, ApiError> {
    let payload = match &body.payload {
        Some(payload) => Some(encrypt_payload(&state, payload)?),
        None => None,
    };
    let profile = state
        .entity
        .update_credential_profile(
            id,
            nms_shared::entity::CredentialProfileChanges {
                name: body.name,
                payload,
            },
        )
        .await?;
    Ok(Json(profile))
}

async fn delete_credential_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.entity.delete_credential_profile(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- discovery profiles ----

async fn list_discovery_profiles(
    State(state): State<ApiState>,
) -> Result<Json<Vec<DiscoveryProfile>>, ApiError> {
    Ok(Json(state.entity.list_discovery_profiles().await?))
}

async fn get_discovery_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<DiscoveryProfile>, ApiError> {
    Ok(Json(state.entity.get_discovery_profile(id).await?))
}

async fn create_discovery_profile(
    State(state): State<ApiState>,
    Json(body): Json<NewDiscoveryProfile>,
) -> Result<(StatusCode, Json<DiscoveryProfile>), ApiError> {
    let profile = state.entity.create_discovery_profile(body).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn update_discovery_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(body): Json<DiscoveryProfileChanges>,
) -> Result<Json<DiscoveryProfile>, ApiError> {
    Ok(Json(state.entity.update_discovery_profile(id, body).await?))
}

async fn delete_discovery_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.entity.delete_discovery_profile(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_discovery_profile(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> StatusCode {
    state.entity.trigger_discovery(id);
    StatusCode::ACCEPTED
}

// ---- devices ----

#[derive(Debug, Default, Deserialize)]
struct ActivateDeviceBody {
    polling_interval_seconds: Option<i64>,
}

async fn list_devices(State(state): State<ApiState>) -> Result<Json<Vec<Device>>, ApiError> {
    Ok(Json(state.entity.list_devices().await?))
}

async fn get_device(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(state.entity.get_device(id).await?))
}

async fn create_device(
    State(state): State<ApiState>,
    Json(body): Json<NewDevice>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let device = state.entity.create_device(body).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn update_device(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(body): Json<DeviceChanges>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(state.entity.update_device(id, body).await?))
}

async fn delete_device(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.entity.delete_device(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_device(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    body: axum::body::Bytes,
) -> StatusCode {
    // The body is optional; activation with defaults needs none.
    let interval = serde_json::from_slice::<ActivateDeviceBody>(&body)
        .ok()
        .and_then(|body| body.polling_interval_seconds);
    state.entity.activate_device(id, interval);
    StatusCode::ACCEPTED
}

// ---- metrics ----

#[derive(Debug, Deserialize)]
struct MetricQueryBody {
    device_ids: Vec<i64>,
    #[serde(flatten)]
    query: MetricQuery,
}

async fn query_metrics(
    State(state): State<ApiState>,
    Json(body): Json<MetricQueryBody>,
) -> Result<Json<Vec<BatchMetricResult>>, ApiError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .metrics
        .send(MetricQueryRequest {
            device_ids: body.device_ids,
            query: body.query,
            reply: reply_tx,
        })
        .await
        .map_err(|_| ApiError::from(MetricsError::Unavailable))?;
    let batches = reply_rx
        .await
        .map_err(|_| ApiError::from(MetricsError::Unavailable))??;
    Ok(Json(batches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use nms_shared::bus::{CredentialCommand, DeviceCommand, EntityRequest};
    use tower::ServiceExt;

    const TEST_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    /// Scripted entity service: answers just enough of the protocol for the
    /// handler tests.
    fn scripted_state(cipher: PayloadCipher) -> (ApiState, mpsc::Receiver<MetricQueryRequest>) {
        let (req_tx, mut req_rx) = mpsc::channel(16);
        let (ctl_tx, _ctl_rx) = mpsc::channel(16);
        let (metrics_tx, metrics_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                match request {
                    EntityRequest::Credential(CredentialCommand::Create { new, reply }) => {
                        let _ = reply.send(Ok(CredentialProfile {
                            id: 1,
                            name: new.name,
                            protocol: new.protocol,
                            payload: new.payload,
                            created_at: Utc::now(),
                            updated_at: Utc::now(),
                        }));
                    }
                    EntityRequest::Device(DeviceCommand::Get { id, reply }) => {
                        let _ = reply.send(Err(EntityError::NotFound { kind: "device", id }));
                    }
                    EntityRequest::Device(DeviceCommand::Update { reply, .. }) => {
                        let _ = reply.send(Err(EntityError::Immutable("credential_profile_id")));
                    }
                    _ => {}
                }
            }
        });
        let config = ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            jwt_secret: "test-secret".to_string(),
            jwt_ttl_minutes: 60,
            admin_username: "admin".to_string(),
            admin_password: "hunter2".to_string(),
        };
        let state = ApiState::new(
            &config,
            EntityHandle::new(req_tx, ctl_tx),
            metrics_tx,
            cipher,
        );
        (state, metrics_rx)
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_login_issues_token_and_rejects_bad_credentials() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let (state, _metrics_rx) = scripted_state(cipher);
        let app = router(state);

        let ok = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/login",
                None,
                serde_json::json!({"username": "admin", "password": "hunter2"}),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert!(body["token"].as_str().unwrap().contains('.'));

        let bad = app
            .oneshot(json_request(
                "POST",
                "/auth/login",
                None,
                serde_json::json!({"username": "admin", "password": "wrong"}),
            ))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_api_routes_require_bearer_token() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let (state, _metrics_rx) = scripted_state(cipher);
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/devices")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_credential_profile_encrypts_payload_and_masks_response() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let (state, _metrics_rx) = scripted_state(cipher.clone());
        let token = state.auth.issue("admin").unwrap();
        let app = router(state);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/credential-profiles",
                Some(&token),
                serde_json::json!({
                    "name": "lab",
                    "protocol": "winrm",
                    "payload": {"username": "admin", "password": "hunter2"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        // Serialized responses never leak the payload.
        assert_eq!(body["payload"], "********");
        assert_eq!(body["protocol"], "winrm");
    }

    #[tokio::test]
    async fn test_unknown_device_maps_to_404_and_immutable_to_400() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let (state, _metrics_rx) = scripted_state(cipher);
        let token = state.auth.issue("admin").unwrap();
        let app = router(state);

        let missing = app
            .clone()
            .oneshot(json_request(
                "GET",
                "/api/devices/7",
                Some(&token),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let immutable = app
            .oneshot(json_request(
                "PUT",
                "/api/devices/7",
                Some(&token),
                serde_json::json!({"credential_profile_id": 5}),
            ))
            .await
            .unwrap();
        assert_eq!(immutable.status(), StatusCode::BAD_REQUEST);
        let body = body_json(immutable).await;
        assert!(body["error"].as_str().unwrap().contains("credential_profile_id"));
    }

    #[tokio::test]
    async fn test_query_metrics_round_trip() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let (state, mut metrics_rx) = scripted_state(cipher);
        let token = state.auth.issue("admin").unwrap();
        // Scripted metrics reader.
        tokio::spawn(async move {
            while let Some(request) = metrics_rx.recv().await {
                assert_eq!(request.device_ids, vec![42]);
                assert_eq!(request.query.path.as_deref(), Some("cpu.total"));
                let _ = request.reply.send(Ok(vec![BatchMetricResult {
                    device_id: 42,
                    results: vec![],
                }]));
            }
        });
        let app = router(state);
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/metrics/query",
                Some(&token),
                serde_json::json!({"device_ids": [42], "path": "cpu.total", "limit": 10}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["device_id"], 42);
    }
}
