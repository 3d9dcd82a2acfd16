//! HTTP 辅助工具：CORS、客户端 IP 解析与安全头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Method, Request, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::RANGE])
            .expose_headers([
                header::CONTENT_RANGE,
                header::ACCEPT_RANGES,
                header::CONTENT_LENGTH,
            ])
            .allow_credentials(true),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 综合转发头与连接信息计算客户端 IP。
pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    extract_forwarded_ip(headers).or(connect_ip)
}

/// 添加基础安全响应头；已由处理器设置的值保持不变。
pub async fn add_security_headers(request: Request<AxumBody>, next: middleware::Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers
        .entry(header::X_FRAME_OPTIONS)
        .or_insert(HeaderValue::from_static("DENY"));
    headers
        .entry(header::X_CONTENT_TYPE_OPTIONS)
        .or_insert(HeaderValue::from_static("nosniff"));
    headers
        .entry(header::REFERRER_POLICY)
        .or_insert(HeaderValue::from_static("no-referrer"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let connect: IpAddr = "127.0.0.1".parse().expect("ip");
        assert_eq!(
            resolve_client_ip(&headers, Some(connect)),
            "203.0.113.7".parse().ok()
        );
        assert_eq!(resolve_client_ip(&HeaderMap::new(), Some(connect)), Some(connect));
    }

    #[test]
    fn cors_requires_valid_origins() {
        assert!(build_cors_layer(None).is_none());
        assert!(build_cors_layer(Some(" , ")).is_none());
        assert!(build_cors_layer(Some("https://lectures.example")).is_some());
    }
}
