//! 播放凭证签发与视频流接口。

use axum::extract::{Extension, Json, Path, Query};
use axum::http::{HeaderMap, header};
use axum::response::{Json as JsonResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::Viewer;
use crate::capability::AccessTokenIssuer;
use crate::chunk_store::is_valid_identifier;
use crate::error::ApiError;
use crate::stream::RangeStreamServer;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    content_id: String,
    #[serde(default)]
    course_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    token: String,
    expires_in: u64,
    stream_url: String,
    content_id: String,
    course_id: String,
}

/// 为当前观看者签发播放凭证。
pub async fn issue_token(
    Extension(issuer): Extension<Arc<AccessTokenIssuer>>,
    Extension(viewer): Extension<Viewer>,
    Json(request): Json<TokenRequest>,
) -> Result<JsonResponse<TokenResponse>, ApiError> {
    if !is_valid_identifier(&request.content_id) {
        return Err(ApiError::BadRequest("contentId is invalid".into()));
    }
    let issued = issuer
        .issue(&viewer.id, &request.content_id, request.course_id.as_deref())
        .await?;
    let stream_url = format!("/video/stream/{}?token={}", issued.content_id, issued.token);
    Ok(JsonResponse(TokenResponse {
        token: issued.token,
        expires_in: issued.expires_in,
        stream_url,
        content_id: issued.content_id,
        course_id: issued.course_id,
    }))
}

#[derive(Deserialize)]
pub(crate) struct StreamQuery {
    #[serde(default)]
    token: Option<String>,
}

/// 按凭证与实时授权输出视频，支持 Range。
pub async fn stream_video(
    Extension(server): Extension<Arc<RangeStreamServer>>,
    Extension(viewer): Extension<Viewer>,
    Path(content_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !is_valid_identifier(&content_id) {
        return Err(ApiError::NotFound("content not found".into()));
    }
    server
        .stream(
            &content_id,
            query.token.as_deref(),
            &viewer.id,
            headers.get(header::RANGE),
        )
        .await
}
