//! 过期上传会话清理：删除长时间无写入的分片目录，跳过正在合并的会话。

use axum::extract::{Extension, Query};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::auth::Viewer;
use crate::chunk_store::ChunkStore;
use crate::error::ApiError;
use crate::registry::{UploadPhase, UploadRegistry};

pub struct StaleUploadReaper {
    store: ChunkStore,
    registry: Arc<UploadRegistry>,
    retention: Duration,
    min_age: Duration,
}

impl StaleUploadReaper {
    /// `min_age` 是任何清理都不会低于的下限，通常取分片超时。
    pub fn new(
        store: ChunkStore,
        registry: Arc<UploadRegistry>,
        retention: Duration,
        min_age: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            retention,
            min_age,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// 按配置的保留时长清理一次。
    pub async fn sweep(&self) -> io::Result<usize> {
        self.sweep_older_than(self.retention).await
    }

    /// 删除最后写入早于 `threshold` 的会话目录，返回删除数量。
    ///
    /// 保留时长为 0 表示关闭清理，此时直接返回 0；`threshold` 不低于 `min_age`。
    pub async fn sweep_older_than(&self, threshold: Duration) -> io::Result<usize> {
        if self.retention.is_zero() {
            debug!("upload retention disabled, sweep skipped");
            return Ok(0);
        }
        let threshold = threshold.max(self.min_age);
        let now = SystemTime::now();
        let mut cleaned = 0;
        for session in self.store.list_sessions().await? {
            let age = now.duration_since(session.modified).unwrap_or_default();
            if age < threshold {
                continue;
            }
            let upload_id = session.upload_id.as_str();

            let Some((entry, mut state)) = self.registry.try_claim(upload_id).await else {
                debug!(upload_id, "session busy, skipping sweep");
                continue;
            };
            if state.hydrated && state.touched.elapsed() < threshold {
                continue;
            }
            match self.store.remove_session(upload_id).await {
                Ok(()) => {
                    state.phase = UploadPhase::Reaped;
                    self.registry.forget(upload_id, &entry).await;
                    cleaned += 1;
                    info!(upload_id, age_secs = age.as_secs(), "removed stale upload session");
                }
                Err(err) => {
                    warn!(upload_id, error = %err, "failed to remove stale upload session");
                }
            }
        }

        let pruned = self.registry.prune_idle(threshold).await;
        if pruned > 0 {
            debug!(pruned, "dropped idle upload entries");
        }
        Ok(cleaned)
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CleanupQuery {
    older_than_secs: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    cleaned_count: usize,
}

/// 手动触发一次清理；`olderThanSecs` 低于分片超时按分片超时处理。
pub async fn cleanup_uploads(
    Extension(reaper): Extension<Arc<StaleUploadReaper>>,
    Extension(viewer): Extension<Viewer>,
    Query(query): Query<CleanupQuery>,
) -> Result<JsonResponse<CleanupResponse>, ApiError> {
    let threshold = query
        .older_than_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| reaper.retention());
    let cleaned_count = reaper
        .sweep_older_than(threshold)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(viewer = viewer.id, cleaned_count, "manual upload cleanup");
    Ok(JsonResponse(CleanupResponse { cleaned_count }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, sample_catalog};
    use crate::chunk_store::bytes_body;
    use crate::upload::{ChunkSubmission, UploadStatus, make_coordinator};
    use tempfile::tempdir;

    fn submission(upload_id: &str, index: u64, total: u64) -> ChunkSubmission {
        ChunkSubmission {
            upload_id: upload_id.to_string(),
            chunk_index: index,
            total_chunks: total,
            total_size: 0,
            mime_type: "video/mp4".into(),
            content_id: None,
            file_name: None,
        }
    }

    fn immediate_reaper(store: &ChunkStore, registry: &Arc<UploadRegistry>) -> StaleUploadReaper {
        StaleUploadReaper::new(
            store.clone(),
            registry.clone(),
            Duration::from_secs(3600),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn stale_session_is_removed_and_status_is_empty() {
        let temp = tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory(sample_catalog()));
        let (registry, store, _media, coordinator) = make_coordinator(temp.path(), catalog);
        coordinator
            .submit_chunk(submission("up1", 0, 3), bytes_body(b"first"))
            .await
            .expect("chunk");
        coordinator
            .submit_chunk(submission("fresh", 0, 2), bytes_body(b"fresh"))
            .await
            .expect("chunk");

        let reaper = StaleUploadReaper::new(
            store.clone(),
            registry.clone(),
            Duration::from_secs(3600),
            Duration::ZERO,
        );
        assert_eq!(reaper.sweep().await.expect("sweep"), 0);
        assert!(store.session_exists("up1").await);

        let cleaned = reaper.sweep_older_than(Duration::ZERO).await.expect("sweep");
        assert_eq!(cleaned, 2);
        assert!(!store.session_exists("up1").await);
        assert_eq!(
            coordinator.status("up1").await.expect("status"),
            UploadStatus::default()
        );

        // 清理后重新上传视为全新会话
        let outcome = coordinator
            .submit_chunk(submission("up1", 1, 3), bytes_body(b"again"))
            .await
            .expect("restart");
        assert_eq!(
            outcome,
            crate::upload::ChunkOutcome::Partial {
                received: 1,
                total: 3
            }
        );
    }

    #[tokio::test]
    async fn assembling_session_is_never_reaped() {
        let temp = tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory(sample_catalog()));
        let (registry, store, _media, _coordinator) = make_coordinator(temp.path(), catalog);
        store
            .write_chunk("busy", 0, bytes_body(b"payload"), 1024)
            .await
            .expect("chunk");
        let entry = registry.entry("busy").await;
        entry.lock().await.phase = UploadPhase::Assembling;

        let reaper = immediate_reaper(&store, &registry);
        assert_eq!(reaper.sweep_older_than(Duration::ZERO).await.expect("sweep"), 0);
        assert!(store.session_exists("busy").await);
        assert!(registry.get("busy").await.is_some());

        entry.lock().await.phase = UploadPhase::Receiving;
        assert_eq!(reaper.sweep_older_than(Duration::ZERO).await.expect("sweep"), 1);
        assert!(!store.session_exists("busy").await);
    }

    #[tokio::test]
    async fn locked_session_is_skipped() {
        let temp = tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory(sample_catalog()));
        let (registry, store, _media, _coordinator) = make_coordinator(temp.path(), catalog);
        store
            .write_chunk("held", 0, bytes_body(b"payload"), 1024)
            .await
            .expect("chunk");
        let entry = registry.entry("held").await;
        let guard = entry.lock().await;

        let reaper = immediate_reaper(&store, &registry);
        assert_eq!(reaper.sweep_older_than(Duration::ZERO).await.expect("sweep"), 0);
        assert!(store.session_exists("held").await);
        drop(guard);
    }

    #[tokio::test]
    async fn zero_retention_disables_every_sweep() {
        let temp = tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory(sample_catalog()));
        let (registry, store, _media, coordinator) = make_coordinator(temp.path(), catalog);
        coordinator
            .submit_chunk(submission("live", 0, 3), bytes_body(b"first"))
            .await
            .expect("chunk");

        let reaper = StaleUploadReaper::new(store.clone(), registry, Duration::ZERO, Duration::ZERO);
        assert_eq!(reaper.sweep().await.expect("sweep"), 0);
        assert_eq!(reaper.sweep_older_than(Duration::ZERO).await.expect("sweep"), 0);
        assert!(store.session_exists("live").await);
        assert_eq!(
            coordinator.status("live").await.expect("status").received_indices,
            vec![0]
        );
    }

    #[tokio::test]
    async fn override_below_floor_keeps_live_uploads() {
        let temp = tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory(sample_catalog()));
        let (registry, store, _media, coordinator) = make_coordinator(temp.path(), catalog);
        coordinator
            .submit_chunk(submission("live", 0, 2), bytes_body(b"first"))
            .await
            .expect("chunk");

        let reaper = StaleUploadReaper::new(
            store.clone(),
            registry,
            Duration::from_secs(3600),
            coordinator.config().chunk_timeout,
        );
        assert_eq!(reaper.sweep_older_than(Duration::ZERO).await.expect("sweep"), 0);
        assert!(store.session_exists("live").await);

        let outcome = coordinator
            .submit_chunk(submission("live", 1, 2), bytes_body(b"second"))
            .await
            .expect("last chunk");
        assert!(matches!(outcome, crate::upload::ChunkOutcome::Complete { .. }));
    }
}
