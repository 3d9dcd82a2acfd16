//! 播放凭证：签名的短期令牌，绑定观看者、内容与课程。
//!
//! 凭证只是必要条件。播放时仍需重新校验授权与课程状态，见 [`crate::stream`]。

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entitlement::{SharedEntitlements, authorize};

pub const STREAM_PURPOSE: &str = "stream";
/// 允许的时钟偏差（秒）。
const CLOCK_LEEWAY_SECS: u64 = 5;

/// 令牌载荷。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClaims {
    /// 观看者标识。
    pub sub: String,
    /// 内容标识。
    pub cid: String,
    /// 课程标识。
    pub crs: String,
    pub purpose: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("invalid capability: {0}")]
    Invalid(String),
    #[error("capability expired")]
    Expired,
    #[error("capability does not cover this content")]
    ContentMismatch,
    #[error("capability was issued to another viewer")]
    ViewerMismatch,
    #[error("viewer no longer holds access to this content")]
    EntitlementRevoked,
    #[error("course is not servable")]
    CourseNotServable,
    #[error("content not found")]
    UnknownContent,
    #[error("failed to sign capability: {0}")]
    Signing(String),
}

/// HMAC 签名与校验。
#[derive(Clone)]
pub struct CapabilitySigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for CapabilitySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilitySigner")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CapabilitySigner {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = CLOCK_LEEWAY_SECS;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 签发新令牌。
    pub fn sign(
        &self,
        viewer_id: &str,
        content_id: &str,
        course_id: &str,
    ) -> Result<(String, StreamClaims), CapabilityError> {
        let now = Utc::now().timestamp();
        let claims = StreamClaims {
            sub: viewer_id.to_string(),
            cid: content_id.to_string(),
            crs: course_id.to_string(),
            purpose: STREAM_PURPOSE.to_string(),
            iat: now,
            exp: now.saturating_add(self.ttl.as_secs() as i64),
            jti: Uuid::new_v4().to_string(),
        };
        let token = self.sign_claims(&claims)?;
        Ok((token, claims))
    }

    fn sign_claims(&self, claims: &StreamClaims) -> Result<String, CapabilityError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|err| CapabilityError::Signing(err.to_string()))
    }

    /// 校验签名、过期时间与用途。
    pub fn verify(&self, token: &str) -> Result<StreamClaims, CapabilityError> {
        let data = decode::<StreamClaims>(token, &self.decoding_key, &self.validation).map_err(
            |err| match err.kind() {
                JwtErrorKind::ExpiredSignature => CapabilityError::Expired,
                _ => CapabilityError::Invalid(err.to_string()),
            },
        )?;
        if data.claims.purpose != STREAM_PURPOSE {
            return Err(CapabilityError::Invalid("wrong purpose".into()));
        }
        Ok(data.claims)
    }
}

/// 已签发的凭证及其元数据。
#[derive(Debug, Clone)]
pub struct IssuedCapability {
    pub token: String,
    pub expires_in: u64,
    pub content_id: String,
    pub course_id: String,
}

/// 先查询授权服务，确认可访问后才签发凭证。
#[derive(Clone)]
pub struct AccessTokenIssuer {
    signer: Arc<CapabilitySigner>,
    entitlements: SharedEntitlements,
}

impl AccessTokenIssuer {
    pub fn new(signer: Arc<CapabilitySigner>, entitlements: SharedEntitlements) -> Self {
        Self {
            signer,
            entitlements,
        }
    }

    pub async fn issue(
        &self,
        viewer_id: &str,
        content_id: &str,
        course_id: Option<&str>,
    ) -> Result<IssuedCapability, CapabilityError> {
        let (content, course) =
            match authorize(self.entitlements.as_ref(), viewer_id, content_id, Utc::now()).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(viewer_id, content_id, error = %err, "capability refused");
                    return Err(err);
                }
            };
        if course_id.is_some_and(|requested| requested != course.id) {
            return Err(CapabilityError::ContentMismatch);
        }

        let (token, claims) = self.signer.sign(viewer_id, &content.id, &course.id)?;
        info!(
            viewer_id,
            content_id,
            course_id = course.id,
            jti = claims.jti,
            "capability issued"
        );
        Ok(IssuedCapability {
            token,
            expires_in: self.signer.ttl().as_secs(),
            content_id: content.id,
            course_id: course.id,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_signer() -> Arc<CapabilitySigner> {
    Arc::new(CapabilitySigner::new(
        b"test-secret-for-capabilities",
        Duration::from_secs(3600),
    ))
}
