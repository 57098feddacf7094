//! Axum JSON API for PASTO.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use pasto_core::{
    Actor, GardenerProfile, Notification, PruningDifficulty, RatingSummary, ServiceCategory,
    ServiceParams, ServiceRequest, ServiceStatus, SystemClock, User, UserRole, CURRENCY,
};
use pasto_lifecycle::{EngineConfig, LifecycleEngine, LifecycleError, NewUser};
use pasto_notify::WebhookPush;
use pasto_storage::Stores;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pasto-web";

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[derive(Clone)]
pub struct AppState {
    pub engine: LifecycleEngine,
}

impl AppState {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self { engine }
    }
}

/// Process-level settings for the HTTP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PASTO_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self { port, database_url }
    }
}

/// Error body shared by every endpoint: `{"error": kind, "detail": message}`.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    /// Body that does not deserialize, including unknown enum labels.
    BadBody(String),
    Lifecycle(LifecycleError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadBody(rejection.body_text())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        Self::Lifecycle(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, detail) = match self {
            Self::Unauthorized(detail) => (StatusCode::UNAUTHORIZED, "unauthorized", detail),
            Self::BadBody(detail) => (StatusCode::BAD_REQUEST, "validation", detail),
            Self::Lifecycle(err) => {
                let status = match &err {
                    LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
                    LifecycleError::Forbidden(_) => StatusCode::FORBIDDEN,
                    LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
                    LifecycleError::Conflict(_) => StatusCode::CONFLICT,
                    LifecycleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let detail = if status.is_server_error() {
                    error!(error = %err, "request failed in the store");
                    "internal storage error".to_string()
                } else {
                    err.to_string()
                };
                (status, err.kind(), detail)
            }
        };
        (status, Json(json!({ "error": kind, "detail": detail }))).into_response()
    }
}

/// Caller identity, asserted by the fronting auth proxy in two headers.
#[derive(Debug, Clone, Copy)]
pub struct CurrentActor(pub Actor);

impl<S> FromRequestParts<S> for CurrentActor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_value(parts, ACTOR_ID_HEADER)?
            .parse::<Uuid>()
            .map_err(|_| ApiError::Unauthorized(format!("{ACTOR_ID_HEADER} is not a uuid")))?;
        let role = header_value(parts, ACTOR_ROLE_HEADER)?
            .parse::<UserRole>()
            .map_err(|err| ApiError::Unauthorized(err.to_string()))?;
        Ok(Self(Actor { user_id, role }))
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, ApiError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {name} header")))
}

/// `Json` whose rejections use the API error body.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

type ApiResult<T> = Result<T, ApiError>;
type SharedState = State<Arc<AppState>>;

/// What other users may see of an account; contact details stay private.
#[derive(Debug, Serialize)]
struct PublicProfile {
    user_id: Uuid,
    full_name: String,
    role: UserRole,
    rating: RatingSummary,
    gardener: Option<GardenerProfile>,
}

impl From<User> for PublicProfile {
    fn from(user: User) -> Self {
        Self {
            user_id: user.user_id,
            full_name: user.full_name,
            role: user.role,
            rating: user.rating,
            gardener: user.gardener,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EstimateBody {
    service_type: ServiceCategory,
    terrain_width: f64,
    terrain_length: f64,
    #[serde(default)]
    pruning_difficulty: Option<PruningDifficulty>,
}

#[derive(Debug, Deserialize)]
struct AvailabilityBody {
    is_available: bool,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: ServiceStatus,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RatingBody {
    rating: u8,
    #[serde(default)]
    review: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/users", post(register_handler))
        .route("/api/users/{id}", get(user_handler))
        .route("/api/gardeners/me/availability", put(availability_handler))
        .route("/api/services/estimate", post(estimate_handler))
        .route("/api/services/request", post(create_request_handler))
        .route("/api/services/available", get(available_handler))
        .route("/api/services/my-requests", get(my_requests_handler))
        .route("/api/services/my-jobs", get(my_jobs_handler))
        .route("/api/services/{id}", get(service_handler))
        .route("/api/services/{id}/accept", post(accept_handler))
        .route("/api/services/{id}/status", post(status_handler))
        .route("/api/services/{id}/cancel", post(cancel_handler))
        .route("/api/services/{id}/rate", post(rate_handler))
        .route("/api/notifications", get(notifications_handler))
        .route("/api/notifications/{id}/read", post(notification_read_handler))
        .with_state(Arc::new(state))
}

/// Wire the engine the way the server runs it: storage picked by
/// `DATABASE_URL`, tunables from `PASTO_*`, wall clock, optional webhook push.
pub async fn engine_from_env(server: &ServerConfig) -> anyhow::Result<LifecycleEngine> {
    let config = EngineConfig::from_env()?;
    let stores = Stores::from_database_url(server.database_url.as_deref()).await?;
    let mut engine = LifecycleEngine::new(stores, Arc::new(SystemClock), config.clone());
    if let Some(url) = &config.push_webhook_url {
        let push = WebhookPush::new(url.clone(), Duration::from_secs(config.push_timeout_secs))
            .context("building webhook push client")?;
        engine = engine.with_push(Arc::new(push));
        info!(%url, "webhook push enabled");
    }
    Ok(engine)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let server = ServerConfig::from_env();
    let engine = engine_from_env(&server).await?;
    let listener = TcpListener::bind(("0.0.0.0", server.port))
        .await
        .with_context(|| format!("binding port {}", server.port))?;
    info!(port = server.port, "pasto api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "pasto" }))
}

async fn register_handler(
    State(state): SharedState,
    ApiJson(body): ApiJson<NewUser>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = state.engine.register_user(body).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn user_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let user = state.engine.get_user(id).await?;
    if actor.user_id == id {
        Ok(Json(user).into_response())
    } else {
        Ok(Json(PublicProfile::from(user)).into_response())
    }
}

async fn availability_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    ApiJson(body): ApiJson<AvailabilityBody>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.engine.set_availability(&actor, body.is_available).await?))
}

async fn estimate_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    ApiJson(body): ApiJson<EstimateBody>,
) -> ApiResult<Json<Value>> {
    let quote = state
        .engine
        .estimate(
            &actor,
            body.service_type,
            body.terrain_width,
            body.terrain_length,
            body.pruning_difficulty,
        )
        .await?;
    Ok(Json(json!({
        "service_type": body.service_type,
        "terrain_area": quote.area,
        "estimated_price": quote.price,
        "estimated_duration": quote.duration_minutes,
        "currency": CURRENCY,
    })))
}

async fn create_request_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    ApiJson(params): ApiJson<ServiceParams>,
) -> ApiResult<(StatusCode, Json<ServiceRequest>)> {
    let request = state.engine.create_request(&actor, params).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn available_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Vec<ServiceRequest>>> {
    Ok(Json(state.engine.list_available(&actor).await?))
}

async fn my_requests_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Vec<ServiceRequest>>> {
    Ok(Json(state.engine.list_by_client(&actor, actor.user_id).await?))
}

async fn my_jobs_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Vec<ServiceRequest>>> {
    Ok(Json(state.engine.list_by_gardener(&actor, actor.user_id).await?))
}

async fn service_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ServiceRequest>> {
    Ok(Json(state.engine.get_request(&actor, id).await?))
}

async fn accept_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ServiceRequest>> {
    Ok(Json(state.engine.accept(id, &actor).await?))
}

async fn status_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
    ApiJson(body): ApiJson<StatusBody>,
) -> ApiResult<Json<ServiceRequest>> {
    let updated = state
        .engine
        .update_status(id, &actor, body.status, body.notes)
        .await?;
    Ok(Json(updated))
}

async fn cancel_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ServiceRequest>> {
    Ok(Json(state.engine.cancel(id, &actor).await?))
}

async fn rate_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
    ApiJson(body): ApiJson<RatingBody>,
) -> ApiResult<Json<ServiceRequest>> {
    Ok(Json(state.engine.rate(id, &actor, body.rating, body.review).await?))
}

async fn notifications_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
) -> ApiResult<Json<Vec<Notification>>> {
    Ok(Json(state.engine.list_notifications(actor.user_id).await?))
}

async fn notification_read_handler(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Notification>> {
    Ok(Json(
        state
            .engine
            .mark_notification_read(id, actor.user_id)
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use pasto_core::ManualClock;
    use tower::ServiceExt;

    fn engine() -> LifecycleEngine {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        LifecycleEngine::new(
            Stores::in_memory(),
            Arc::new(ManualClock::new(start)),
            EngineConfig::default(),
        )
    }

    async fn register(engine: &LifecycleEngine, email: &str, role: UserRole) -> Actor {
        let user = engine
            .register_user(NewUser {
                email: email.into(),
                full_name: "Test".into(),
                role,
                phone: None,
            })
            .await
            .unwrap();
        Actor {
            user_id: user.user_id,
            role,
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        actor: Option<Actor>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(actor) = actor {
            builder = builder
                .header(ACTOR_ID_HEADER, actor.user_id.to_string())
                .header(ACTOR_ROLE_HEADER, actor.role.as_str());
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn lawn_request() -> Value {
        json!({
            "category": "grass_cutting",
            "address": "Calle Falsa 123",
            "latitude": -34.6,
            "longitude": -58.4,
            "terrain_width": 10.0,
            "terrain_length": 10.0
        })
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = app(AppState::new(engine()));
        let (status, body) = call(&app, "GET", "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn missing_actor_headers_are_unauthorized() {
        let app = app(AppState::new(engine()));
        let (status, body) = call(&app, "GET", "/api/services/available", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn estimate_quotes_in_pesos() {
        let engine = engine();
        let client = register(&engine, "c@pasto.test", UserRole::Client).await;
        let app = app(AppState::new(engine));
        let (status, body) = call(
            &app,
            "POST",
            "/api/services/estimate",
            Some(client),
            Some(json!({"service_type": "grass_cutting", "terrain_width": 10.0, "terrain_length": 10.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["estimated_price"], 1000.0);
        assert_eq!(body["estimated_duration"], 60);
        assert_eq!(body["currency"], "ARS");
    }

    #[tokio::test]
    async fn gardeners_do_not_get_estimates() {
        let engine = engine();
        let gardener = register(&engine, "g@pasto.test", UserRole::Gardener).await;
        let app = app(AppState::new(engine));
        let (status, body) = call(
            &app,
            "POST",
            "/api/services/estimate",
            Some(gardener),
            Some(json!({"service_type": "cleaning", "terrain_width": 4.0, "terrain_length": 5.0})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
    }

    #[tokio::test]
    async fn contact_details_are_only_shown_to_their_owner() {
        let engine = engine();
        let client = register(&engine, "c@pasto.test", UserRole::Client).await;
        let gardener = register(&engine, "g@pasto.test", UserRole::Gardener).await;
        let app = app(AppState::new(engine));
        let uri = format!("/api/users/{}", gardener.user_id);

        let (status, seen_by_client) = call(&app, "GET", &uri, Some(client), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seen_by_client["role"], "gardener");
        assert!(seen_by_client.get("email").is_none());
        assert!(seen_by_client.get("phone").is_none());

        let (status, own) = call(&app, "GET", &uri, Some(gardener), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(own["email"], "g@pasto.test");
    }

    #[tokio::test]
    async fn unknown_category_is_a_validation_error() {
        let engine = engine();
        let client = register(&engine, "c@pasto.test", UserRole::Client).await;
        let app = app(AppState::new(engine));
        let (status, body) = call(
            &app,
            "POST",
            "/api/services/estimate",
            Some(client),
            Some(json!({"service_type": "landscaping", "terrain_width": 1.0, "terrain_length": 1.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn registration_then_duplicate_is_conflict() {
        let app = app(AppState::new(engine()));
        let user = json!({"email": "ana@pasto.test", "full_name": "Ana", "role": "gardener"});
        let (status, body) = call(&app, "POST", "/api/users", None, Some(user.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["gardener"]["is_available"], true);

        let (status, body) = call(&app, "POST", "/api/users", None, Some(user)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn request_accept_and_second_accept_conflicts() {
        let engine = engine();
        let client = register(&engine, "c@pasto.test", UserRole::Client).await;
        let first = register(&engine, "g1@pasto.test", UserRole::Gardener).await;
        let second = register(&engine, "g2@pasto.test", UserRole::Gardener).await;
        let app = app(AppState::new(engine));

        let (status, created) =
            call(&app, "POST", "/api/services/request", Some(client), Some(lawn_request())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        let id = created["service_id"].as_str().unwrap().to_string();

        let (status, open) = call(&app, "GET", "/api/services/available", Some(first), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(open.as_array().unwrap().len(), 1);

        let uri = format!("/api/services/{id}/accept");
        let (status, accepted) = call(&app, "POST", &uri, Some(first), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["status"], "accepted");

        let (status, body) = call(&app, "POST", &uri, Some(second), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");

        let (_, mine) = call(&app, "GET", "/api/services/my-requests", Some(client), None).await;
        assert_eq!(mine[0]["gardener_id"], json!(first.user_id));
    }

    #[tokio::test]
    async fn gardener_cannot_create_requests() {
        let engine = engine();
        let gardener = register(&engine, "g@pasto.test", UserRole::Gardener).await;
        let app = app(AppState::new(engine));
        let (status, body) =
            call(&app, "POST", "/api/services/request", Some(gardener), Some(lawn_request())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
    }

    #[tokio::test]
    async fn skipping_a_status_or_rating_early_is_conflict() {
        let engine = engine();
        let client = register(&engine, "c@pasto.test", UserRole::Client).await;
        let gardener = register(&engine, "g@pasto.test", UserRole::Gardener).await;
        let app = app(AppState::new(engine));

        let (_, created) =
            call(&app, "POST", "/api/services/request", Some(client), Some(lawn_request())).await;
        let id = created["service_id"].as_str().unwrap().to_string();
        call(&app, "POST", &format!("/api/services/{id}/accept"), Some(gardener), None).await;

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/services/{id}/status"),
            Some(gardener),
            Some(json!({"status": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/services/{id}/rate"),
            Some(client),
            Some(json!({"rating": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, updated) = call(
            &app,
            "POST",
            &format!("/api/services/{id}/status"),
            Some(gardener),
            Some(json!({"status": "on_way", "notes": "ten minutes out"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status_notes"], "ten minutes out");
    }

    #[tokio::test]
    async fn notifications_are_owner_scoped() {
        let engine = engine();
        let client = register(&engine, "c@pasto.test", UserRole::Client).await;
        let gardener = register(&engine, "g@pasto.test", UserRole::Gardener).await;
        let app = app(AppState::new(engine));
        call(&app, "POST", "/api/services/request", Some(client), Some(lawn_request())).await;

        let (status, inbox) = call(&app, "GET", "/api/notifications", Some(gardener), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(inbox[0]["kind"], "NEW_SERVICE_AVAILABLE");
        let id = inbox[0]["notification_id"].as_str().unwrap().to_string();
        let uri = format!("/api/notifications/{id}/read");

        let (status, _) = call(&app, "POST", &uri, Some(client), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, read) = call(&app, "POST", &uri, Some(gardener), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["is_read"], true);
    }
}
