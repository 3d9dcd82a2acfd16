//! 外部授权服务接口：身份解析、内容与课程记录、访问权判断。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::capability::CapabilityError;

pub type EntitlementFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type SharedEntitlements = Arc<dyn EntitlementService>;

/// 内容记录：所属课程、是否免费、合并后的资源路径。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    pub id: String,
    pub course_id: String,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub asset_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseStatus {
    Draft,
    Published,
    Archived,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRecord {
    pub id: String,
    pub status: CourseStatus,
    #[serde(default)]
    pub publish_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub publish_end: Option<DateTime<Utc>>,
}

impl CourseRecord {
    /// 已发布且处于发布窗口 `[start, end)` 内。
    pub fn servable_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != CourseStatus::Published {
            return false;
        }
        if self.publish_start.is_some_and(|start| now < start) {
            return false;
        }
        if self.publish_end.is_some_and(|end| now >= end) {
            return false;
        }
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("unknown content {0}")]
    UnknownContent(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 由外部系统提供的身份与授权信息。
pub trait EntitlementService: Send + Sync {
    /// 将会话令牌解析为观看者标识。
    fn resolve_viewer<'a>(&'a self, session: &'a str) -> EntitlementFuture<'a, Option<String>>;

    fn content<'a>(&'a self, content_id: &'a str) -> EntitlementFuture<'a, Option<ContentRecord>>;

    fn course<'a>(&'a self, course_id: &'a str) -> EntitlementFuture<'a, Option<CourseRecord>>;

    /// 观看者当前是否持有该内容的访问权（购买或免费）。
    fn holds_access<'a>(
        &'a self,
        viewer_id: &'a str,
        content: &'a ContentRecord,
    ) -> EntitlementFuture<'a, bool>;

    /// 在内容记录上登记合并后的资源路径。
    fn attach_asset<'a>(
        &'a self,
        content_id: &'a str,
        asset_path: &'a str,
    ) -> EntitlementFuture<'a, Result<(), EntitlementError>>;
}

/// 实时校验：内容存在、课程可播放、观看者持有访问权。
pub async fn authorize(
    service: &dyn EntitlementService,
    viewer_id: &str,
    content_id: &str,
    now: DateTime<Utc>,
) -> Result<(ContentRecord, CourseRecord), CapabilityError> {
    let content = service
        .content(content_id)
        .await
        .ok_or(CapabilityError::UnknownContent)?;
    let course = service
        .course(&content.course_id)
        .await
        .ok_or(CapabilityError::CourseNotServable)?;
    if !course.servable_at(now) {
        return Err(CapabilityError::CourseNotServable);
    }
    if !service.holds_access(viewer_id, &content).await {
        return Err(CapabilityError::EntitlementRevoked);
    }
    Ok((content, course))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn course(status: CourseStatus) -> CourseRecord {
        CourseRecord {
            id: "k1".into(),
            status,
            publish_start: None,
            publish_end: None,
        }
    }

    #[test]
    fn only_published_courses_are_servable() {
        let now = Utc::now();
        assert!(course(CourseStatus::Published).servable_at(now));
        assert!(!course(CourseStatus::Draft).servable_at(now));
        assert!(!course(CourseStatus::Archived).servable_at(now));
        assert!(!course(CourseStatus::Suspended).servable_at(now));
    }

    #[test]
    fn publish_window_is_half_open() {
        let now = Utc::now();
        let mut record = course(CourseStatus::Published);
        record.publish_start = Some(now - Duration::hours(1));
        record.publish_end = Some(now + Duration::hours(1));
        assert!(record.servable_at(now));
        assert!(!record.servable_at(now - Duration::hours(2)));
        assert!(!record.servable_at(now + Duration::hours(1)));
    }

    #[test]
    fn course_status_deserializes_lowercase() {
        let record: CourseRecord =
            serde_json::from_str(r#"{"id":"k1","status":"suspended"}"#).expect("parse");
        assert_eq!(record.status, CourseStatus::Suspended);
        assert!(record.publish_end.is_none());
    }
}
