//! 受保护的媒体流：每次请求都重新校验凭证与实时授权，并支持单段 Range。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use httpdate::fmt_http_date;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityError, CapabilitySigner};
use crate::entitlement::{SharedEntitlements, authorize};
use crate::error::ApiError;
use crate::range::parse_range;
use crate::storage::Storage;

const DEFAULT_VIDEO_MIME: &str = "video/mp4";

#[derive(Clone)]
pub struct RangeStreamServer {
    signer: Arc<CapabilitySigner>,
    entitlements: SharedEntitlements,
    media: Storage,
}

impl RangeStreamServer {
    pub fn new(signer: Arc<CapabilitySigner>, entitlements: SharedEntitlements, media: Storage) -> Self {
        Self {
            signer,
            entitlements,
            media,
        }
    }

    /// 校验凭证后返回完整文件或指定字节区间。
    pub async fn stream(
        &self,
        content_id: &str,
        token: Option<&str>,
        viewer_id: &str,
        range_header: Option<&HeaderValue>,
    ) -> Result<Response, ApiError> {
        let token = token
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("stream token is required".into()))?;
        let claims = self.signer.verify(token)?;
        if claims.cid != content_id {
            return Err(CapabilityError::ContentMismatch.into());
        }

        let (content, course) =
            match authorize(self.entitlements.as_ref(), &claims.sub, content_id, Utc::now()).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(content_id, viewer_id = claims.sub, error = %err, "stream refused");
                    return Err(err.into());
                }
            };
        if course.id != claims.crs {
            return Err(CapabilityError::ContentMismatch.into());
        }
        if claims.sub != viewer_id {
            warn!(content_id, token_viewer = claims.sub, viewer_id, "capability replay rejected");
            return Err(CapabilityError::ViewerMismatch.into());
        }

        let Some(asset_path) = content.asset_path.as_deref() else {
            return Err(ApiError::NotFound("asset not available".into()));
        };
        let (path, metadata) = self.media.asset_metadata(asset_path).await?;
        let file_size = metadata.len();

        let mut response_headers = protected_headers(asset_path)?;
        if let Ok(modified) = metadata.modified() {
            response_headers.insert(
                header::LAST_MODIFIED,
                HeaderValue::from_str(&fmt_http_date(modified))
                    .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
            );
        }

        let range = match range_header {
            Some(value) => {
                let value = value
                    .to_str()
                    .map_err(|_| ApiError::RangeNotSatisfiable(file_size))?;
                Some(parse_range(value, file_size).map_err(|err| {
                    debug!(content_id, range = value, error = %err, "range rejected");
                    ApiError::RangeNotSatisfiable(file_size)
                })?)
            }
            None => None,
        };

        let mut file = File::open(&path)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;

        if let Some(range) = range {
            let length = range.len();
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{}", range.start, range.end, file_size))
                    .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
            );
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            debug!(
                content_id,
                viewer_id,
                start = range.start,
                end = range.end,
                "range stream"
            );
            let stream = ReaderStream::new(file.take(length));
            return Ok((
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                AxumBody::from_stream(stream),
            )
                .into_response());
        }

        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
        info!(content_id, viewer_id, size = file_size, "full stream");
        let stream = ReaderStream::new(file);
        Ok((
            StatusCode::OK,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response())
    }
}

/// 禁止缓存、下载与嵌入的响应头。
fn protected_headers(asset_path: &str) -> Result<HeaderMap, ApiError> {
    let mime = mime_guess::from_path(asset_path)
        .first()
        .filter(|mime| mime.type_() == mime_guess::mime::VIDEO)
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_VIDEO_MIME.to_string());

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&mime).map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_static("inline"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    Ok(headers)
}
