//! 基于 JSON 文件的授权目录：观看者会话、课程、内容与购买记录。
//!
//! 外部系统可直接改写该文件；后台任务检测修改时间变化后重新加载，撤销与过期
//! 因此无需等待令牌过期即可生效。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::entitlement::{
    ContentRecord, CourseRecord, EntitlementError, EntitlementFuture, EntitlementService,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRecord {
    pub id: String,
    #[serde(default)]
    pub session_tokens: Vec<String>,
}

/// 观看者对某门课程的购买记录，可带过期时间。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRecord {
    pub viewer_id: String,
    pub course_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogData {
    #[serde(default)]
    pub viewers: Vec<ViewerRecord>,
    #[serde(default)]
    pub courses: Vec<CourseRecord>,
    #[serde(default)]
    pub contents: Vec<ContentRecord>,
    #[serde(default)]
    pub grants: Vec<GrantRecord>,
}

impl CatalogData {
    fn grant_active(&self, viewer_id: &str, course_id: &str, now: DateTime<Utc>) -> bool {
        self.grants.iter().any(|grant| {
            grant.viewer_id == viewer_id
                && grant.course_id == course_id
                && grant.expires_at.is_none_or(|expires| now < expires)
        })
    }
}

#[derive(Debug)]
pub struct Catalog {
    path: Option<PathBuf>,
    data: RwLock<CatalogData>,
    loaded_mtime: Mutex<Option<SystemTime>>,
}

impl Catalog {
    /// 不落盘的目录，用于未配置目录文件时。
    pub fn in_memory(data: CatalogData) -> Self {
        Self {
            path: None,
            data: RwLock::new(data),
            loaded_mtime: Mutex::new(None),
        }
    }

    /// 从文件加载；文件不存在时以空目录启动，首次写入时创建。
    pub async fn load(path: PathBuf) -> io::Result<Self> {
        let (data, mtime) = match read_catalog(&path).await {
            Ok(loaded) => loaded,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = ?path, "catalog file not found, starting empty");
                (CatalogData::default(), None)
            }
            Err(err) => return Err(err),
        };
        info!(
            path = ?path,
            viewers = data.viewers.len(),
            courses = data.courses.len(),
            contents = data.contents.len(),
            "catalog loaded"
        );
        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
            loaded_mtime: Mutex::new(mtime),
        })
    }

    /// 文件修改时间变化时重新加载，返回是否发生了重载。
    pub async fn refresh_if_changed(&self) -> io::Result<bool> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        let current = match fs::metadata(path).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        let mut loaded_mtime = self.loaded_mtime.lock().await;
        if current.is_some() && current == *loaded_mtime {
            return Ok(false);
        }
        let (data, mtime) = read_catalog(path).await?;
        *self.data.write().await = data;
        *loaded_mtime = mtime;
        info!(path = ?path, "catalog reloaded");
        Ok(true)
    }

    async fn persist(&self, data: &CatalogData) -> io::Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(data).map_err(io::Error::other)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let mut atomic = AtomicFile::new(path).await?;
        if let Err(err) = atomic.file_mut().write_all(&content).await {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await?;
        let mtime = fs::metadata(path).await?.modified().ok();
        *self.loaded_mtime.lock().await = mtime;
        Ok(())
    }

    #[cfg(test)]
    pub async fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut CatalogData),
    {
        let mut data = self.data.write().await;
        mutate(&mut data);
    }
}

async fn read_catalog(path: &Path) -> io::Result<(CatalogData, Option<SystemTime>)> {
    let bytes = fs::read(path).await?;
    let data: CatalogData = serde_json::from_slice(&bytes)
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    let mtime = fs::metadata(path).await?.modified().ok();
    Ok((data, mtime))
}

impl EntitlementService for Catalog {
    fn resolve_viewer<'a>(&'a self, session: &'a str) -> EntitlementFuture<'a, Option<String>> {
        Box::pin(async move {
            if session.is_empty() {
                return None;
            }
            let data = self.data.read().await;
            data.viewers
                .iter()
                .find(|viewer| viewer.session_tokens.iter().any(|token| token == session))
                .map(|viewer| viewer.id.clone())
        })
    }

    fn content<'a>(&'a self, content_id: &'a str) -> EntitlementFuture<'a, Option<ContentRecord>> {
        Box::pin(async move {
            let data = self.data.read().await;
            data.contents
                .iter()
                .find(|content| content.id == content_id)
                .cloned()
        })
    }

    fn course<'a>(&'a self, course_id: &'a str) -> EntitlementFuture<'a, Option<CourseRecord>> {
        Box::pin(async move {
            let data = self.data.read().await;
            data.courses
                .iter()
                .find(|course| course.id == course_id)
                .cloned()
        })
    }

    fn holds_access<'a>(
        &'a self,
        viewer_id: &'a str,
        content: &'a ContentRecord,
    ) -> EntitlementFuture<'a, bool> {
        Box::pin(async move {
            if content.free {
                return true;
            }
            let data = self.data.read().await;
            data.grant_active(viewer_id, &content.course_id, Utc::now())
        })
    }

    fn attach_asset<'a>(
        &'a self,
        content_id: &'a str,
        asset_path: &'a str,
    ) -> EntitlementFuture<'a, Result<(), EntitlementError>> {
        Box::pin(async move {
            let mut data = self.data.write().await;
            let content = data
                .contents
                .iter_mut()
                .find(|content| content.id == content_id)
                .ok_or_else(|| EntitlementError::UnknownContent(content_id.to_string()))?;
            content.asset_path = Some(asset_path.to_string());
            self.persist(&data).await?;
            info!(content_id, asset_path, "asset attached to content");
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) fn sample_catalog() -> CatalogData {
    use crate::entitlement::CourseStatus;

    CatalogData {
        viewers: vec![
            ViewerRecord {
                id: "viewer-a".into(),
                session_tokens: vec!["session-a".into()],
            },
            ViewerRecord {
                id: "viewer-b".into(),
                session_tokens: vec!["session-b".into()],
            },
        ],
        courses: vec![CourseRecord {
            id: "course-1".into(),
            status: CourseStatus::Published,
            publish_start: None,
            publish_end: None,
        }],
        contents: vec![
            ContentRecord {
                id: "content-x".into(),
                course_id: "course-1".into(),
                free: false,
                asset_path: None,
            },
            ContentRecord {
                id: "content-y".into(),
                course_id: "course-1".into(),
                free: false,
                asset_path: None,
            },
            ContentRecord {
                id: "content-free".into(),
                course_id: "course-1".into(),
                free: true,
                asset_path: None,
            },
        ],
        grants: vec![GrantRecord {
            viewer_id: "viewer-a".into(),
            course_id: "course-1".into(),
            expires_at: None,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn resolves_sessions_and_grants() {
        let catalog = Catalog::in_memory(sample_catalog());
        assert_eq!(
            catalog.resolve_viewer("session-a").await.as_deref(),
            Some("viewer-a")
        );
        assert!(catalog.resolve_viewer("bogus").await.is_none());
        assert!(catalog.resolve_viewer("").await.is_none());

        let content = catalog.content("content-x").await.expect("content");
        assert!(catalog.holds_access("viewer-a", &content).await);
        assert!(!catalog.holds_access("viewer-b", &content).await);

        let free = catalog.content("content-free").await.expect("free content");
        assert!(catalog.holds_access("viewer-b", &free).await);
    }

    #[tokio::test]
    async fn expired_grant_does_not_count() {
        let catalog = Catalog::in_memory(sample_catalog());
        catalog
            .update(|data| data.grants[0].expires_at = Some(Utc::now() - Duration::minutes(1)))
            .await;
        let content = catalog.content("content-x").await.expect("content");
        assert!(!catalog.holds_access("viewer-a", &content).await);
    }

    #[tokio::test]
    async fn attach_asset_persists_and_reloads() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("catalog.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&sample_catalog()).expect("serialize"),
        )
        .expect("seed catalog");

        let catalog = Catalog::load(path.clone()).await.expect("load");
        catalog
            .attach_asset("content-x", "content-x.mp4")
            .await
            .expect("attach");
        assert!(!catalog.refresh_if_changed().await.expect("refresh"));

        let reloaded = Catalog::load(path).await.expect("reload");
        let content = reloaded.content("content-x").await.expect("content");
        assert_eq!(content.asset_path.as_deref(), Some("content-x.mp4"));

        let result = reloaded.attach_asset("missing", "x.mp4").await;
        assert!(matches!(result, Err(EntitlementError::UnknownContent(_))));
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let temp = tempdir().expect("tempdir");
        let catalog = Catalog::load(temp.path().join("absent.json"))
            .await
            .expect("load");
        assert!(catalog.content("content-x").await.is_none());
        assert!(!catalog.refresh_if_changed().await.expect("refresh"));
    }
}
