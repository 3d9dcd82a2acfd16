//! 统一的 API 错误类型与领域错误转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use tracing::error;

use crate::capability::CapabilityError;
use crate::reassembler::AssemblyError;
use crate::storage::StorageError;
use crate::upload::UploadError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    RequestTimeout,
    Conflict(String),
    PayloadTooLarge(u64),
    UnsupportedMediaType(String),
    RangeNotSatisfiable(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized(msg) => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(r#"Bearer realm="lecture-vault""#),
                );
                (StatusCode::UNAUTHORIZED, headers, msg).into_response()
            }
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::RequestTimeout => {
                (StatusCode::REQUEST_TIMEOUT, "chunk upload timed out").into_response()
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(limit) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("chunk exceeds {limit} bytes"),
            )
                .into_response(),
            ApiError::UnsupportedMediaType(mime) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("unsupported media type: {mime}"),
            )
                .into_response(),
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    "range not satisfiable",
                )
                    .into_response()
            }
            ApiError::Internal(msg) => {
                error!(error = msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("asset not found".into()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::InvalidMediaType(mime) => ApiError::UnsupportedMediaType(mime),
            UploadError::InvalidIdentifier(field) => {
                ApiError::BadRequest(format!("{field} is invalid"))
            }
            UploadError::InvalidChunkIndex { .. }
            | UploadError::InvalidTotalChunks(_)
            | UploadError::TotalSizeExceeded(_) => ApiError::BadRequest(error.to_string()),
            UploadError::TotalChunksMismatch { .. } | UploadError::AssetExists(_) => {
                ApiError::Conflict(error.to_string())
            }
            UploadError::ChunkTooLarge(limit) => ApiError::PayloadTooLarge(limit),
            UploadError::Timeout => ApiError::RequestTimeout,
            UploadError::Body(msg) => ApiError::BadRequest(msg),
            UploadError::Assembly(err) => err.into(),
            UploadError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<AssemblyError> for ApiError {
    fn from(error: AssemblyError) -> Self {
        match error {
            AssemblyError::DestinationExists => ApiError::Conflict(error.to_string()),
            _ => ApiError::Internal(format!("assembly failed: {error}")),
        }
    }
}

impl From<CapabilityError> for ApiError {
    fn from(error: CapabilityError) -> Self {
        match error {
            CapabilityError::Invalid(_) | CapabilityError::Expired => {
                ApiError::Unauthorized(error.to_string())
            }
            CapabilityError::ContentMismatch
            | CapabilityError::ViewerMismatch
            | CapabilityError::EntitlementRevoked
            | CapabilityError::CourseNotServable => ApiError::Forbidden(error.to_string()),
            CapabilityError::UnknownContent => ApiError::NotFound(error.to_string()),
            CapabilityError::Signing(msg) => ApiError::Internal(msg),
        }
    }
}
