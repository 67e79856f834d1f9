use super::{ApiError, AppState, Owner};
use crate::db::models::Guide;
use crate::db::GuidePatch;
use crate::guide::{BlockInput, CreateGuide, GuestView, GuideDetail, SavedBlocks};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Deserializer};
use serde_json::json;

/// An absent key stays `None`; an explicit `null` becomes `Some(None)`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateGuide {
    title: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    accommodation_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    theme_id: Option<Option<String>>,
    theme_settings: Option<serde_json::Value>,
    ai_enabled: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    ai_instructions: Option<Option<String>>,
}

impl From<UpdateGuide> for GuidePatch {
    fn from(u: UpdateGuide) -> Self {
        GuidePatch {
            title: u.title,
            accommodation_name: u.accommodation_name,
            theme_id: u.theme_id,
            theme_settings: u.theme_settings,
            ai_enabled: u.ai_enabled,
            ai_instructions: u.ai_instructions,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplaceBlocks {
    blocks: Vec<BlockInput>,
}

#[derive(Debug, Deserialize)]
pub struct Publish {
    published: bool,
}

pub async fn create(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    payload: Result<Json<CreateGuide>, JsonRejection>,
) -> Result<(StatusCode, Json<Guide>), ApiError> {
    let Json(req) = payload?;
    if req.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    let guide = state.guides.create_guide(&user_id, &req)?;
    Ok((StatusCode::CREATED, Json(guide)))
}

pub async fn list(
    State(state): State<AppState>,
    Owner(user_id): Owner,
) -> Result<Json<Vec<Guide>>, ApiError> {
    Ok(Json(state.guides.list_guides(&user_id)?))
}

pub async fn detail(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path(id): Path<String>,
) -> Result<Json<GuideDetail>, ApiError> {
    Ok(Json(state.guides.guide_detail(&user_id, &id)?))
}

pub async fn update(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path(id): Path<String>,
    payload: Result<Json<UpdateGuide>, JsonRejection>,
) -> Result<Json<Guide>, ApiError> {
    let Json(update) = payload?;
    let guide = state.guides.update_guide(&user_id, &id, &update.into())?;
    Ok(Json(guide))
}

pub async fn remove(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.guides.delete_guide(&user_id, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn replace_blocks(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path(id): Path<String>,
    payload: Result<Json<ReplaceBlocks>, JsonRejection>,
) -> Result<Json<SavedBlocks>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(
        state.guides.replace_blocks(&user_id, &id, req.blocks).await?,
    ))
}

pub async fn publish(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path(id): Path<String>,
    payload: Result<Json<Publish>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = payload?;
    let guide = state.guides.toggle_publish(&user_id, &id, req.published)?;
    Ok(Json(json!({ "published": guide.is_published, "slug": guide.slug })))
}

pub async fn guest_view(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<GuestView>, ApiError> {
    Ok(Json(state.guides.guest_view(&slug)?))
}
