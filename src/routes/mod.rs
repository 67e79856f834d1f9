//! HTTP surface.
//!
//! Owner and license routes read the caller's identity from the
//! `x-user-id` header set by the upstream auth layer. Guest routes (`/g`,
//! chat, history) are public and only ever expose published guides.

mod chat;
mod guides;
mod licenses;

use crate::chat::ChatOrchestrator;
use crate::db::DbError;
use crate::guide::{GuideError, GuideService};
use crate::license::{LicenseError, LicenseService};
use crate::vector_store::VectorStoreError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub guides: GuideService,
    pub licenses: LicenseService,
    pub chat: ChatOrchestrator,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/guides", post(guides::create).get(guides::list))
        .route(
            "/guides/:id",
            get(guides::detail)
                .patch(guides::update)
                .delete(guides::remove),
        )
        .route("/guides/:id/blocks", put(guides::replace_blocks))
        .route("/guides/:id/publish", post(guides::publish))
        .route("/g/:slug", get(guides::guest_view))
        .route("/guides/:id/ai/chat", post(chat::chat))
        .route("/guides/:id/ai/history", get(chat::history))
        .route("/licenses/activate", post(licenses::activate))
        .route("/licenses/verify", post(licenses::verify))
        .route("/licenses/me", get(licenses::me))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Authenticated caller.
pub struct Owner(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or_else(|| {
                ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", "missing user identity")
            })
    }
}

/// Error body: `{code, message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        tracing::error!(error = %error, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "code": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        Self::internal(e)
    }
}

impl From<LicenseError> for ApiError {
    fn from(e: LicenseError) -> Self {
        let message = e.to_string();
        match e {
            LicenseError::InvalidKeyFormat => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_KEY_FORMAT", message)
            }
            LicenseError::InvalidPlanCode(_) => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_PLAN_CODE", message)
            }
            LicenseError::KeyAlreadyUsed => {
                Self::new(StatusCode::CONFLICT, "KEY_ALREADY_USED", message)
            }
            LicenseError::InvalidPlan(_) | LicenseError::ExpirationOutOfRange | LicenseError::Db(_) => {
                Self::internal(e)
            }
        }
    }
}

impl From<GuideError> for ApiError {
    fn from(e: GuideError) -> Self {
        let message = e.to_string();
        match e {
            GuideError::NotFound => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
            GuideError::InvalidBlock { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_BLOCK", message)
            }
            GuideError::InvalidSlug(_) => Self::new(StatusCode::BAD_REQUEST, "INVALID_SLUG", message),
            GuideError::LimitExceeded { .. } => {
                Self::new(StatusCode::FORBIDDEN, "LIMIT_EXCEEDED", message)
            }
            GuideError::FeatureNotAvailable(_) => {
                Self::new(StatusCode::FORBIDDEN, "FEATURE_NOT_AVAILABLE", message)
            }
            GuideError::AiDisabled => Self::new(StatusCode::FORBIDDEN, "AI_DISABLED", message),
            GuideError::SlugTaken(_) => Self::new(StatusCode::CONFLICT, "SLUG_TAKEN", message),
            GuideError::VectorStore(VectorStoreError::Db(e)) => Self::internal(e),
            GuideError::VectorStore(e) => {
                tracing::warn!(error = %e, "embedding during save failed");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "EMBEDDING_ERROR",
                    "embedding service unavailable, try again later",
                )
            }
            GuideError::License(e) => e.into(),
            GuideError::Db(e) => Self::internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatSettings;
    use crate::db::Database;
    use crate::retrieval::HybridScorer;
    use crate::testing::{FakeCompletion, FakeEmbedder};
    use crate::vector_store::VectorStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(completion: FakeCompletion) -> Router {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let embedder = FakeEmbedder::new(4).with_rule("체크인", [1.0, 0.0, 0.0, 0.0]);
        let store = VectorStore::new(db.clone(), Arc::new(embedder));
        let licenses = LicenseService::new(db.clone());
        let state = AppState {
            guides: GuideService::new(db.clone(), store.clone(), licenses.clone()),
            licenses,
            chat: ChatOrchestrator::new(
                db,
                store,
                HybridScorer::default(),
                Arc::new(completion),
                ChatSettings::default(),
            ),
        };
        router(state)
    }

    fn request(method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, req).await;
        (status, serde_json::from_str(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = app(FakeCompletion::default());
        let (status, body) = send_json(&app, request(Method::GET, "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn owner_routes_need_identity() {
        let app = app(FakeCompletion::default());
        let (status, body) = send_json(&app, request(Method::GET, "/guides", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHENTICATED");
        let (status, _) = send_json(&app, request(Method::GET, "/licenses/me", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn license_endpoints() {
        let app = app(FakeCompletion::default());
        let activate = |key: &str, user: &str| {
            request(
                Method::POST,
                "/licenses/activate",
                Some(user),
                Some(json!({ "licenseKey": key })),
            )
        };

        let (status, body) = send_json(&app, activate("INVALID-KEY", "u1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_KEY_FORMAT");

        let (status, body) = send_json(&app, activate(" roomy-m123-abcd-ef01 ", "u1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["license"]["plan"], "monthly");
        assert_eq!(body["license"]["licenseKey"], "ROOMY-M123-ABCD-EF01");

        let (status, body) = send_json(&app, activate("ROOMY-M123-ABCD-EF01", "u2")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "KEY_ALREADY_USED");

        let (status, body) = send_json(
            &app,
            request(
                Method::POST,
                "/licenses/verify",
                Some("u2"),
                Some(json!({ "licenseKey": "ROOMY-X111-AAAA-BBBB" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "valid": false }));

        let (_, me) = send_json(&app, request(Method::GET, "/licenses/me", Some("u1"), None)).await;
        assert_eq!(me["plan"], "monthly");
        assert_eq!(me["features"]["aiConcierge"], true);
        let (_, me) = send_json(&app, request(Method::GET, "/licenses/me", Some("u2"), None)).await;
        assert_eq!(me["plan"], "free");
        assert_eq!(me["license"], Value::Null);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = app(FakeCompletion::default());
        let (status, body) = send_json(
            &app,
            request(Method::POST, "/guides", Some("u1"), Some(json!({ "name": 1 }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn guide_lifecycle_and_chat_stream() {
        let app = app(FakeCompletion::new(["체크인은 ", "15:00입니다."]));
        let host = Some("host");

        send_json(
            &app,
            request(
                Method::POST,
                "/licenses/activate",
                host,
                Some(json!({ "licenseKey": "ROOMY-A789-MNOP-QR45" })),
            ),
        )
        .await;

        let (status, guide) = send_json(
            &app,
            request(Method::POST, "/guides", host, Some(json!({ "title": "Ocean House" }))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = guide["id"].as_str().unwrap().to_string();
        assert_eq!(guide["slug"], "ocean-house");

        let (status, saved) = send_json(
            &app,
            request(
                Method::PUT,
                &format!("/guides/{id}/blocks"),
                host,
                Some(json!({ "blocks": [
                    { "type": "quick_info", "content": { "checkIn": "15:00", "maxGuests": "four" } },
                    { "type": "notice", "content": { "body": "비공개" }, "isVisible": false }
                ] })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(saved["droppedFields"][0]["field"], "maxGuests");
        let block_id = saved["blocks"][0]["id"].as_str().unwrap().to_string();

        let (status, _) = send_json(&app, request(Method::GET, "/g/ocean-house", None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(
            &app,
            request(
                Method::POST,
                &format!("/guides/{id}/ai/chat"),
                None,
                Some(json!({ "message": "체크인 시간이 언제예요?" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send_json(
            &app,
            request(
                Method::POST,
                &format!("/guides/{id}/publish"),
                host,
                Some(json!({ "published": true })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["published"], true);

        let (status, view) = send_json(&app, request(Method::GET, "/g/ocean-house", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["blocks"].as_array().unwrap().len(), 1);
        assert_eq!(view["watermark"], false);

        let (status, sse) = send(
            &app,
            request(
                Method::POST,
                &format!("/guides/{id}/ai/chat"),
                None,
                Some(json!({ "message": "체크인 시간이 언제예요?", "sessionId": "s1" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(sse.contains("event: message"));
        assert!(sse.contains("event: done"));
        assert!(sse.contains(&block_id));

        let (status, history) = send_json(
            &app,
            request(Method::GET, &format!("/guides/{id}/ai/history?sessionId=s1"), None, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let turns = history.as_array().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[1]["content"], "체크인은 15:00입니다.");

        let (status, _) = send(&app, request(Method::DELETE, &format!("/guides/{id}"), Some("intruder"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, request(Method::DELETE, &format!("/guides/{id}"), host, None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, request(Method::GET, &format!("/guides/{id}"), host, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_on_free_plan_is_forbidden() {
        let app = app(FakeCompletion::new(["x"]));
        let (_, guide) = send_json(
            &app,
            request(Method::POST, "/guides", Some("host"), Some(json!({ "title": "Cabin" }))),
        )
        .await;
        let id = guide["id"].as_str().unwrap().to_string();
        send(
            &app,
            request(
                Method::POST,
                &format!("/guides/{id}/publish"),
                Some("host"),
                Some(json!({ "published": true })),
            ),
        )
        .await;

        let (status, body) = send_json(
            &app,
            request(
                Method::POST,
                &format!("/guides/{id}/ai/chat"),
                None,
                Some(json!({ "message": "hi" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "AI_DISABLED");
    }

    #[tokio::test]
    async fn theme_update_is_gated() {
        let app = app(FakeCompletion::default());
        let (_, guide) = send_json(
            &app,
            request(Method::POST, "/guides", Some("host"), Some(json!({ "title": "Cabin" }))),
        )
        .await;
        let id = guide["id"].as_str().unwrap().to_string();
        let (status, body) = send_json(
            &app,
            request(
                Method::PATCH,
                &format!("/guides/{id}"),
                Some("host"),
                Some(json!({ "themeId": "forest" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "FEATURE_NOT_AVAILABLE");

        let (status, body) = send_json(
            &app,
            request(
                Method::PATCH,
                &format!("/guides/{id}"),
                Some("host"),
                Some(json!({ "aiInstructions": "조식은 8시부터" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["aiInstructions"], "조식은 8시부터");
    }

    #[test]
    fn embedding_failures_do_not_leak_upstream_text() {
        let upstream = crate::embedding::EmbeddingError::Api {
            status: 401,
            message: "invalid api key sk-live-1234".into(),
        };
        let err = ApiError::from(GuideError::VectorStore(upstream.into()));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.code, "EMBEDDING_ERROR");
        assert!(!err.message.contains("sk-live"));
        assert!(!err.message.contains("401"));
    }
}
