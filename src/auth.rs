//! 身份中间件：通过外部授权服务解析会话令牌为观看者。

use axum::extract::Extension;
use axum::http::Request;
use axum::{body::Body as AxumBody, middleware, response::Response};
use axum_extra::extract::{CookieJar, TypedHeader};
use axum_extra::headers::{Authorization, authorization::Bearer};
use tracing::debug;

use crate::config::SESSION_COOKIE_NAME;
use crate::entitlement::SharedEntitlements;
use crate::error::ApiError;

/// 已认证的观看者，由中间件写入请求扩展。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: String,
}

/// 认证中间件：校验 Bearer 令牌或会话 Cookie。
pub async fn identity_middleware(
    Extension(entitlements): Extension<SharedEntitlements>,
    jar: CookieJar,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let session = bearer
        .map(|TypedHeader(Authorization(bearer))| bearer.token().to_string())
        .or_else(|| jar.get(SESSION_COOKIE_NAME).map(|cookie| cookie.value().to_string()));
    let Some(session) = session else {
        return Err(ApiError::Unauthorized("authentication required".into()));
    };

    let Some(viewer_id) = entitlements.resolve_viewer(&session).await else {
        debug!(path = req.uri().path(), "unknown session");
        return Err(ApiError::Unauthorized("invalid session".into()));
    };
    req.extensions_mut().insert(Viewer { id: viewer_id });
    Ok(next.run(req).await)
}

fn is_auth_exempt_path(path: &str) -> bool {
    path == "/version"
}
