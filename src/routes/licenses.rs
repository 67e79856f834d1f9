use super::{ApiError, AppState, Owner};
use crate::license::{normalize_key, verify_key_format, Entitlement, KeyVerification};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBody {
    license_key: String,
}

pub async fn activate(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    payload: Result<Json<KeyBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = payload?;
    let license = state
        .licenses
        .activate(&user_id, &normalize_key(&body.license_key))?;
    Ok(Json(json!({ "license": license })))
}

pub async fn verify(
    Owner(_): Owner,
    payload: Result<Json<KeyBody>, JsonRejection>,
) -> Result<Json<KeyVerification>, ApiError> {
    let Json(body) = payload?;
    Ok(Json(verify_key_format(&normalize_key(&body.license_key))))
}

pub async fn me(
    State(state): State<AppState>,
    Owner(user_id): Owner,
) -> Result<Json<Entitlement>, ApiError> {
    Ok(Json(state.licenses.entitlement(&user_id)?))
}
