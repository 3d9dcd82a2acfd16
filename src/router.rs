//! 路由装配：接口、身份中间件、安全头、请求追踪与共享状态。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::identity_middleware;
use crate::capability::AccessTokenIssuer;
use crate::config::MULTIPART_OVERHEAD;
use crate::entitlement::SharedEntitlements;
use crate::http::{add_security_headers, build_cors_layer, resolve_client_ip};
use crate::reaper::{self, StaleUploadReaper};
use crate::stream::RangeStreamServer;
use crate::upload::{self, UploadCoordinator};
use crate::{version, video};

/// 路由所需的共享服务。
#[derive(Clone)]
pub struct AppServices {
    pub coordinator: Arc<UploadCoordinator>,
    pub reaper: Arc<StaleUploadReaper>,
    pub issuer: Arc<AccessTokenIssuer>,
    pub streamer: Arc<RangeStreamServer>,
    pub entitlements: SharedEntitlements,
}

pub fn build_router(services: AppServices, cors_origins: Option<&str>) -> Router {
    let chunk_body_limit = services
        .coordinator
        .config()
        .chunk_max_size
        .saturating_add(MULTIPART_OVERHEAD);
    let chunk_body_limit = usize::try_from(chunk_body_limit).unwrap_or(usize::MAX);

    let mut app = Router::new()
        .route(
            "/upload/chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::max(chunk_body_limit)),
        )
        .route("/upload/status", get(upload::upload_status))
        .route("/upload/cleanup", delete(reaper::cleanup_uploads))
        .route("/video/token", post(video::issue_token))
        .route("/video/stream/{content_id}", get(video::stream_video))
        .route("/version", get(version::get_version_info))
        .layer(middleware::from_fn(identity_middleware))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(services.coordinator))
        .layer(Extension(services.reaper))
        .layer(Extension(services.issuer))
        .layer(Extension(services.streamer))
        .layer(Extension(services.entitlements));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}
