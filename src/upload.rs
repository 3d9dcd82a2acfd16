//! 分片上传：逐个接收分片、记录进度，集齐后交给合并队列。

use axum::extract::{Extension, Multipart, Query};
use axum::response::Json as JsonResponse;
use bytes::Bytes;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::auth::Viewer;
use crate::chunk_store::{ChunkStore, ChunkWriteError, SessionMeta, is_valid_identifier};
use crate::config::UploadConfig;
use crate::entitlement::SharedEntitlements;
use crate::error::ApiError;
use crate::reassembler::{AssemblyError, AssemblyPlan, AssemblyQueue};
use crate::registry::{UploadEntry, UploadPhase, UploadRegistry, UploadState};
use crate::storage::Storage;

const DEFAULT_EXTENSION: &str = "bin";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("unsupported media type {0}")]
    InvalidMediaType(String),
    #[error("{0} is invalid")]
    InvalidIdentifier(&'static str),
    #[error("chunk index {index} is outside 0..{total}")]
    InvalidChunkIndex { index: u64, total: u64 },
    #[error("totalChunks must be between 1 and {0}")]
    InvalidTotalChunks(u64),
    #[error("declared upload size exceeds {0} bytes")]
    TotalSizeExceeded(u64),
    #[error("totalChunks {submitted} does not match session total {expected}")]
    TotalChunksMismatch { expected: u64, submitted: u64 },
    #[error("asset {0} already exists")]
    AssetExists(String),
    #[error("chunk exceeds {0} bytes")]
    ChunkTooLarge(u64),
    #[error("chunk upload timed out")]
    Timeout,
    #[error("{0}")]
    Body(String),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<ChunkWriteError> for UploadError {
    fn from(error: ChunkWriteError) -> Self {
        match error {
            ChunkWriteError::TooLarge(limit) => UploadError::ChunkTooLarge(limit),
            ChunkWriteError::Body(msg) => UploadError::Body(msg),
            ChunkWriteError::Io(err) => UploadError::Io(err),
        }
    }
}

/// 一次分片提交的描述信息。
#[derive(Debug, Clone)]
pub struct ChunkSubmission {
    pub upload_id: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub total_size: u64,
    pub mime_type: String,
    pub content_id: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChunkOutcome {
    Partial {
        received: u64,
        total: u64,
    },
    Complete {
        #[serde(rename = "assetPath")]
        asset_path: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub received_indices: Vec<u64>,
    pub total: u64,
}

/// 接收分片并记录每个上传的进度，集齐后只触发一次合并。
pub struct UploadCoordinator {
    config: UploadConfig,
    store: ChunkStore,
    media: Storage,
    registry: Arc<UploadRegistry>,
    queue: AssemblyQueue,
    entitlements: SharedEntitlements,
}

impl UploadCoordinator {
    pub fn new(
        config: UploadConfig,
        store: ChunkStore,
        media: Storage,
        registry: Arc<UploadRegistry>,
        queue: AssemblyQueue,
        entitlements: SharedEntitlements,
    ) -> Self {
        Self {
            config,
            store,
            media,
            registry,
            queue,
            entitlements,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 写入一个分片；若这是最后一个缺失的分片，同步等待合并完成。
    pub async fn submit_chunk<S, E>(
        &self,
        submission: ChunkSubmission,
        body: S,
    ) -> Result<ChunkOutcome, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        self.validate(&submission)?;
        let upload_id = submission.upload_id.as_str();
        let index = submission.chunk_index;

        let mut state = self.lock_live(upload_id).await?;
        state.touched = Instant::now();
        if let UploadPhase::Assembled(asset_path) = &state.phase {
            debug!(upload_id, chunk_index = index, "chunk for completed upload ignored");
            return Ok(ChunkOutcome::Complete {
                asset_path: asset_path.clone(),
            });
        }
        let meta = self.ensure_meta(&mut state, &submission).await?;
        if state.phase == UploadPhase::Assembling {
            let entry = OwnedMutexGuard::mutex(&state).clone();
            drop(state);
            return self.finish(entry, upload_id, &meta, false).await;
        }
        drop(state);

        let write = self
            .store
            .write_chunk(upload_id, index, body, self.config.chunk_max_size);
        let written = match tokio::time::timeout(self.config.chunk_timeout, write).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(upload_id, chunk_index = index, "chunk body timed out");
                return Err(UploadError::Timeout);
            }
        };

        let mut state = self.lock_live(upload_id).await?;
        state.touched = Instant::now();
        if let UploadPhase::Assembled(asset_path) = &state.phase {
            // 合并已先一步完成，本次写入落在了新建的目录中
            let asset_path = asset_path.clone();
            drop(state);
            if let Err(err) = self.store.remove_session(upload_id).await {
                warn!(upload_id, error = %err, "failed to drop stray chunk dir");
            }
            return Ok(ChunkOutcome::Complete { asset_path });
        }
        let meta = self.ensure_meta(&mut state, &submission).await?;
        state.received.insert(index);
        let received = state.received.len() as u64;
        debug!(
            upload_id,
            chunk_index = index,
            bytes = written,
            received,
            total = meta.total_chunks,
            "chunk accepted"
        );

        let claimed = if state.phase == UploadPhase::Receiving && state.is_complete() {
            state.phase = UploadPhase::Assembling;
            true
        } else if state.phase == UploadPhase::Assembling {
            false
        } else {
            return Ok(ChunkOutcome::Partial {
                received,
                total: meta.total_chunks,
            });
        };
        let entry = OwnedMutexGuard::mutex(&state).clone();
        drop(state);
        self.finish(entry, upload_id, &meta, claimed).await
    }

    /// 查询已接收的分片索引；会话不存在时返回空结果。
    pub async fn status(&self, upload_id: &str) -> Result<UploadStatus, UploadError> {
        if !is_valid_identifier(upload_id) {
            return Err(UploadError::InvalidIdentifier("uploadId"));
        }
        if let Some(entry) = self.registry.get(upload_id).await {
            let state = entry.lock().await;
            match &state.phase {
                UploadPhase::Assembled(_) | UploadPhase::Reaped => {
                    return Ok(UploadStatus::default());
                }
                UploadPhase::Receiving | UploadPhase::Assembling if state.hydrated => {
                    return Ok(UploadStatus {
                        received_indices: state.received.iter().copied().collect(),
                        total: state.meta.as_ref().map_or(0, |meta| meta.total_chunks),
                    });
                }
                _ => {}
            }
        }

        let Some(indices) = self.store.list_indices(upload_id).await? else {
            return Ok(UploadStatus::default());
        };
        let total = self
            .store
            .read_meta(upload_id)
            .await?
            .map_or(0, |meta| meta.total_chunks);
        Ok(UploadStatus {
            received_indices: indices
                .into_iter()
                .filter(|index| total == 0 || *index < total)
                .collect(),
            total,
        })
    }

    fn validate(&self, submission: &ChunkSubmission) -> Result<(), UploadError> {
        if !is_valid_identifier(&submission.upload_id) {
            return Err(UploadError::InvalidIdentifier("uploadId"));
        }
        if let Some(content_id) = &submission.content_id
            && !is_valid_identifier(content_id)
        {
            return Err(UploadError::InvalidIdentifier("contentId"));
        }
        if !self.config.is_mime_allowed(&submission.mime_type) {
            return Err(UploadError::InvalidMediaType(submission.mime_type.clone()));
        }
        if submission.total_chunks == 0 || submission.total_chunks > self.config.max_chunks {
            return Err(UploadError::InvalidTotalChunks(self.config.max_chunks));
        }
        if submission.chunk_index >= submission.total_chunks {
            return Err(UploadError::InvalidChunkIndex {
                index: submission.chunk_index,
                total: submission.total_chunks,
            });
        }
        if self.config.max_total_size > 0 && submission.total_size > self.config.max_total_size {
            return Err(UploadError::TotalSizeExceeded(self.config.max_total_size));
        }
        Ok(())
    }

    /// 获取会话锁；遇到已被清理的旧条目时重新获取，并按需从磁盘恢复状态。
    async fn lock_live(&self, upload_id: &str) -> Result<OwnedMutexGuard<UploadState>, UploadError> {
        loop {
            let entry = self.registry.entry(upload_id).await;
            let mut state = entry.lock_owned().await;
            if state.phase == UploadPhase::Reaped {
                continue;
            }
            if !state.hydrated {
                state.meta = self.store.read_meta(upload_id).await?;
                state.received = self
                    .store
                    .list_indices(upload_id)
                    .await?
                    .unwrap_or_default();
                if let Some(total) = state.meta.as_ref().map(|meta| meta.total_chunks) {
                    state.received.retain(|index| *index < total);
                }
                state.hydrated = true;
            }
            return Ok(state);
        }
    }

    /// 首个分片写入会话元数据；之后的分片必须声明相同的分片总数。
    async fn ensure_meta(
        &self,
        state: &mut UploadState,
        submission: &ChunkSubmission,
    ) -> Result<SessionMeta, UploadError> {
        if let Some(meta) = &state.meta {
            if meta.total_chunks != submission.total_chunks {
                return Err(UploadError::TotalChunksMismatch {
                    expected: meta.total_chunks,
                    submitted: submission.total_chunks,
                });
            }
            return Ok(meta.clone());
        }

        let meta = SessionMeta {
            total_chunks: submission.total_chunks,
            total_size: submission.total_size,
            extension: resolve_extension(submission.file_name.as_deref(), &submission.mime_type),
            content_id: submission.content_id.clone(),
        };
        self.ensure_unpublished(&submission.upload_id, &meta).await?;
        self.store.write_meta(&submission.upload_id, &meta).await?;
        info!(
            upload_id = submission.upload_id,
            total_chunks = meta.total_chunks,
            total_size = meta.total_size,
            content_id = meta.content_id.as_deref().unwrap_or(""),
            "upload session started"
        );
        state.meta = Some(meta.clone());
        Ok(meta)
    }

    /// 已发布的资源只读：目标文件已存在或内容已关联资源时拒绝新会话。
    async fn ensure_unpublished(&self, upload_id: &str, meta: &SessionMeta) -> Result<(), UploadError> {
        let asset_path = asset_name(upload_id, meta);
        if tokio::fs::try_exists(self.media.root_path().join(&asset_path)).await? {
            warn!(upload_id, asset_path = %asset_path, "upload would replace a published asset");
            return Err(UploadError::AssetExists(asset_path));
        }
        if let Some(content_id) = meta.content_id.as_deref()
            && let Some(content) = self.entitlements.content(content_id).await
            && let Some(existing) = content.asset_path
        {
            warn!(upload_id, content_id, existing = %existing, "content already has an asset");
            return Err(UploadError::AssetExists(existing));
        }
        Ok(())
    }

    async fn finish(
        &self,
        entry: UploadEntry,
        upload_id: &str,
        meta: &SessionMeta,
        claimed: bool,
    ) -> Result<ChunkOutcome, UploadError> {
        let asset_path = asset_name(upload_id, meta);
        let plan = AssemblyPlan {
            upload_id: upload_id.to_string(),
            total_chunks: meta.total_chunks,
            expected_size: meta.total_size,
            destination: self.media.root_path().join(&asset_path),
        };
        let result = self.queue.submit(plan).await;

        let mut state = entry.lock().await;
        state.touched = Instant::now();
        match result {
            Ok(bytes) => {
                state.phase = UploadPhase::Assembled(asset_path.clone());
                state.received.clear();
                drop(state);
                if claimed {
                    info!(upload_id, asset_path, bytes, "upload complete");
                    if let Some(content_id) = meta.content_id.as_deref()
                        && let Err(err) = self
                            .entitlements
                            .attach_asset(content_id, &asset_path)
                            .await
                    {
                        warn!(upload_id, content_id, error = %err, "failed to record asset on content");
                    }
                }
                Ok(ChunkOutcome::Complete { asset_path })
            }
            Err(err) => {
                if state.phase == UploadPhase::Assembling {
                    state.phase = UploadPhase::Receiving;
                    state.hydrated = false;
                }
                warn!(upload_id, error = %err, "assembly failed");
                Err(err.into())
            }
        }
    }
}

/// 资源文件名：优先使用内容标识，其次上传标识。
fn asset_name(upload_id: &str, meta: &SessionMeta) -> String {
    let stem = meta.content_id.as_deref().unwrap_or(upload_id);
    format!("{stem}.{}", meta.extension)
}

fn resolve_extension(file_name: Option<&str>, mime: &str) -> String {
    let from_name = file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 8 && ext.bytes().all(|byte| byte.is_ascii_alphanumeric())
        });
    if let Some(ext) = from_name {
        return ext.to_ascii_lowercase();
    }
    let essence = mime
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|extensions| extensions.first())
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

#[derive(Default)]
struct ChunkForm {
    upload_id: Option<String>,
    chunk_index: Option<u64>,
    total_chunks: Option<u64>,
    total_size: Option<u64>,
    content_id: Option<String>,
    file_name: Option<String>,
    mime_type: Option<String>,
}

impl ChunkForm {
    fn into_submission(self, part_mime: Option<String>) -> Result<ChunkSubmission, ApiError> {
        let upload_id = self
            .upload_id
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::BadRequest("uploadId is required".into()))?;
        let chunk_index = self
            .chunk_index
            .ok_or_else(|| ApiError::BadRequest("chunkIndex is required".into()))?;
        let total_chunks = self
            .total_chunks
            .ok_or_else(|| ApiError::BadRequest("totalChunks is required".into()))?;
        let mime_type = self
            .mime_type
            .or(part_mime)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::UnsupportedMediaType("missing".into()))?;
        Ok(ChunkSubmission {
            upload_id,
            chunk_index,
            total_chunks,
            total_size: self.total_size.unwrap_or(0),
            mime_type,
            content_id: self.content_id.filter(|value| !value.is_empty()),
            file_name: self.file_name.filter(|value| !value.is_empty()),
        })
    }
}

fn parse_number(field: &str, value: &str) -> Result<u64, ApiError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest(format!("{field} must be a non-negative integer")))
}

/// 上传单个分片（multipart，文本字段需位于 `chunk` 字段之前）。
pub async fn upload_chunk(
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    Extension(viewer): Extension<Viewer>,
    mut multipart: Multipart,
) -> Result<JsonResponse<ChunkOutcome>, ApiError> {
    let mut form = ChunkForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "chunk" || name == "file" {
            let part_mime = field.content_type().map(str::to_string);
            if form.file_name.is_none() {
                form.file_name = field.file_name().map(str::to_string);
            }
            let submission = form.into_submission(part_mime)?;
            debug!(
                viewer = viewer.id,
                upload_id = submission.upload_id,
                chunk_index = submission.chunk_index,
                "chunk received"
            );
            let outcome = coordinator
                .submit_chunk(submission, Box::pin(field))
                .await?;
            return Ok(JsonResponse(outcome));
        }

        let value = field
            .text()
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?;
        match name.as_str() {
            "uploadId" => form.upload_id = Some(value.trim().to_string()),
            "chunkIndex" => form.chunk_index = Some(parse_number("chunkIndex", &value)?),
            "totalChunks" => form.total_chunks = Some(parse_number("totalChunks", &value)?),
            "totalSize" => form.total_size = Some(parse_number("totalSize", &value)?),
            "contentId" => form.content_id = Some(value.trim().to_string()),
            "fileName" => form.file_name = Some(value.trim().to_string()),
            "mimeType" => form.mime_type = Some(value.trim().to_string()),
            _ => debug!(field = name, "ignoring unknown multipart field"),
        }
    }
    Err(ApiError::BadRequest("chunk field is required".into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadStatusQuery {
    upload_id: String,
}

/// 查询上传进度，用于断点续传。
pub async fn upload_status(
    Extension(coordinator): Extension<Arc<UploadCoordinator>>,
    Query(UploadStatusQuery { upload_id }): Query<UploadStatusQuery>,
) -> Result<JsonResponse<UploadStatus>, ApiError> {
    let status = coordinator.status(&upload_id).await?;
    Ok(JsonResponse(status))
}

#[cfg(test)]
pub(crate) fn make_coordinator(
    root: &Path,
    entitlements: SharedEntitlements,
) -> (Arc<UploadRegistry>, ChunkStore, Storage, UploadCoordinator) {
    make_coordinator_with(crate::config::test_upload_config(root), entitlements)
}

#[cfg(test)]
pub(crate) fn make_coordinator_with(
    config: UploadConfig,
    entitlements: SharedEntitlements,
) -> (Arc<UploadRegistry>, ChunkStore, Storage, UploadCoordinator) {
    use crate::reassembler::Reassembler;

    let store = ChunkStore::new(config.scratch_root.clone());
    let media = Storage::new(config.media_root.clone());
    let registry = Arc::new(UploadRegistry::new());
    let queue = AssemblyQueue::spawn(Reassembler::new(store.clone()), 8);
    let coordinator = UploadCoordinator::new(
        config,
        store.clone(),
        media.clone(),
        registry.clone(),
        queue,
        entitlements,
    );
    (registry, store, media, coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, sample_catalog};
    use crate::chunk_store::bytes_body;
    use crate::entitlement::EntitlementService;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::fs;

    fn submission(upload_id: &str, index: u64, total: u64) -> ChunkSubmission {
        ChunkSubmission {
            upload_id: upload_id.to_string(),
            chunk_index: index,
            total_chunks: total,
            total_size: 0,
            mime_type: "video/mp4".into(),
            content_id: None,
            file_name: Some("lecture.mp4".into()),
        }
    }

    fn chunks() -> Vec<Vec<u8>> {
        (0..4u8).map(|index| vec![b'a' + index; 10 + index as usize]).collect()
    }

    fn setup() -> (tempfile::TempDir, Arc<Catalog>, ChunkStore, Storage, UploadCoordinator) {
        let temp = tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory(sample_catalog()));
        let (_registry, store, media, coordinator) = make_coordinator(temp.path(), catalog.clone());
        (temp, catalog, store, media, coordinator)
    }

    #[tokio::test]
    async fn any_order_reassembles_in_index_order() {
        let (_temp, _catalog, store, media, coordinator) = setup();
        let parts = chunks();
        let order = [3u64, 1, 0, 2];
        let mut outcome = None;
        for (position, index) in order.iter().enumerate() {
            let result = coordinator
                .submit_chunk(submission("up1", *index, 4), bytes_body(&parts[*index as usize]))
                .await
                .expect("submit");
            if position < 3 {
                assert_eq!(
                    result,
                    ChunkOutcome::Partial {
                        received: position as u64 + 1,
                        total: 4
                    }
                );
            }
            outcome = Some(result);
        }

        assert_eq!(
            outcome,
            Some(ChunkOutcome::Complete {
                asset_path: "up1.mp4".into()
            })
        );
        let assembled = fs::read(media.root_path().join("up1.mp4")).await.expect("asset");
        assert_eq!(assembled, parts.concat());
        assert!(!store.session_exists("up1").await);
    }

    #[tokio::test]
    async fn resubmitted_chunk_is_not_double_counted() {
        let (_temp, _catalog, _store, media, coordinator) = setup();
        let parts = chunks();
        coordinator
            .submit_chunk(submission("up1", 0, 2), bytes_body(&parts[0]))
            .await
            .expect("first");
        let again = coordinator
            .submit_chunk(submission("up1", 0, 2), bytes_body(&parts[0]))
            .await
            .expect("retry");
        assert_eq!(again, ChunkOutcome::Partial { received: 1, total: 2 });

        let status = coordinator.status("up1").await.expect("status");
        assert_eq!(status.received_indices, vec![0]);

        coordinator
            .submit_chunk(submission("up1", 1, 2), bytes_body(&parts[1]))
            .await
            .expect("last");
        let assembled = fs::read(media.root_path().join("up1.mp4")).await.expect("asset");
        assert_eq!(assembled, [parts[0].clone(), parts[1].clone()].concat());

        let late_retry = coordinator
            .submit_chunk(submission("up1", 1, 2), bytes_body(&parts[1]))
            .await
            .expect("late retry");
        assert_eq!(
            late_retry,
            ChunkOutcome::Complete {
                asset_path: "up1.mp4".into()
            }
        );
        let unchanged = fs::read(media.root_path().join("up1.mp4")).await.expect("asset");
        assert_eq!(unchanged, assembled);
    }

    #[tokio::test]
    async fn resume_reports_exact_indices_after_restart() {
        let temp = tempdir().expect("tempdir");
        let catalog: SharedEntitlements = Arc::new(Catalog::in_memory(sample_catalog()));
        let parts = chunks();
        {
            let (_registry, _store, _media, coordinator) =
                make_coordinator(temp.path(), catalog.clone());
            for index in [0u64, 2, 3] {
                coordinator
                    .submit_chunk(submission("up1", index, 4), bytes_body(&parts[index as usize]))
                    .await
                    .expect("submit");
            }
        }

        let (_registry, _store, media, coordinator) = make_coordinator(temp.path(), catalog);
        let status = coordinator.status("up1").await.expect("status");
        assert_eq!(status.received_indices, vec![0, 2, 3]);
        assert_eq!(status.total, 4);

        let outcome = coordinator
            .submit_chunk(submission("up1", 1, 4), bytes_body(&parts[1]))
            .await
            .expect("missing chunk");
        assert!(matches!(outcome, ChunkOutcome::Complete { .. }));
        let assembled = fs::read(media.root_path().join("up1.mp4")).await.expect("asset");
        assert_eq!(assembled, parts.concat());
    }

    #[tokio::test]
    async fn unknown_session_status_is_empty() {
        let (_temp, _catalog, _store, _media, coordinator) = setup();
        let status = coordinator.status("never-started").await.expect("status");
        assert_eq!(status, UploadStatus::default());
        assert!(matches!(
            coordinator.status("../etc").await,
            Err(UploadError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn rejects_unsupported_mime_and_bad_indices() {
        let (_temp, _catalog, store, _media, coordinator) = setup();
        let mut pdf = submission("up1", 0, 2);
        pdf.mime_type = "application/pdf".into();
        let result = coordinator.submit_chunk(pdf, bytes_body(b"x")).await;
        assert!(matches!(result, Err(UploadError::InvalidMediaType(_))));
        assert!(!store.session_exists("up1").await);

        let result = coordinator
            .submit_chunk(submission("up1", 2, 2), bytes_body(b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::InvalidChunkIndex { index: 2, total: 2 })));

        let result = coordinator
            .submit_chunk(submission("up1", 0, 0), bytes_body(b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::InvalidTotalChunks(_))));
    }

    #[tokio::test]
    async fn total_chunks_must_stay_consistent() {
        let (_temp, _catalog, _store, _media, coordinator) = setup();
        coordinator
            .submit_chunk(submission("up1", 0, 3), bytes_body(b"abc"))
            .await
            .expect("first");
        let result = coordinator
            .submit_chunk(submission("up1", 1, 5), bytes_body(b"def"))
            .await;
        assert!(matches!(
            result,
            Err(UploadError::TotalChunksMismatch {
                expected: 3,
                submitted: 5
            })
        ));
    }

    #[tokio::test]
    async fn size_mismatch_fails_and_allows_retry() {
        let (_temp, _catalog, store, media, coordinator) = setup();
        let mut first = submission("up1", 0, 1);
        first.total_size = 99;
        let result = coordinator.submit_chunk(first.clone(), bytes_body(b"abc")).await;
        assert!(matches!(
            result,
            Err(UploadError::Assembly(AssemblyError::SizeMismatch { .. }))
        ));
        assert!(fs::metadata(media.root_path().join("up1.mp4")).await.is_err());
        assert!(store.session_exists("up1").await);

        let status = coordinator.status("up1").await.expect("status");
        assert_eq!(status.received_indices, vec![0]);
    }

    #[tokio::test]
    async fn completion_attaches_asset_to_content() {
        let (_temp, catalog, _store, media, coordinator) = setup();
        let mut only = submission("up1", 0, 1);
        only.content_id = Some("content-x".into());
        let outcome = coordinator
            .submit_chunk(only, bytes_body(b"video-bytes"))
            .await
            .expect("submit");
        assert_eq!(
            outcome,
            ChunkOutcome::Complete {
                asset_path: "content-x.mp4".into()
            }
        );
        assert!(media.root_path().join("content-x.mp4").exists());
        let content = catalog.content("content-x").await.expect("content");
        assert_eq!(content.asset_path.as_deref(), Some("content-x.mp4"));
    }

    #[tokio::test]
    async fn concurrent_last_chunks_merge_once() {
        let (_temp, _catalog, _store, media, coordinator) = setup();
        let coordinator = Arc::new(coordinator);
        let parts = chunks();
        coordinator
            .submit_chunk(submission("up1", 0, 4), bytes_body(&parts[0]))
            .await
            .expect("chunk 0");
        coordinator
            .submit_chunk(submission("up1", 1, 4), bytes_body(&parts[1]))
            .await
            .expect("chunk 1");

        let (third, fourth) = tokio::join!(
            coordinator.submit_chunk(submission("up1", 2, 4), bytes_body(&parts[2])),
            coordinator.submit_chunk(submission("up1", 3, 4), bytes_body(&parts[3])),
        );
        let outcomes = [third.expect("chunk 2"), fourth.expect("chunk 3")];
        assert!(outcomes.iter().any(|outcome| matches!(outcome, ChunkOutcome::Complete { .. })));
        let assembled = fs::read(media.root_path().join("up1.mp4")).await.expect("asset");
        assert_eq!(assembled, parts.concat());
    }

    #[tokio::test]
    async fn published_content_asset_is_not_replaced() {
        let (_temp, _catalog, store, media, coordinator) = setup();
        let mut first = submission("up1", 0, 1);
        first.content_id = Some("content-x".into());
        coordinator
            .submit_chunk(first, bytes_body(b"ORIGINAL"))
            .await
            .expect("first upload");

        let mut second = submission("up2", 0, 1);
        second.content_id = Some("content-x".into());
        let result = coordinator.submit_chunk(second, bytes_body(b"REPLACED")).await;
        assert!(matches!(result, Err(UploadError::AssetExists(ref name)) if name == "content-x.mp4"));
        let asset = fs::read(media.root_path().join("content-x.mp4")).await.expect("asset");
        assert_eq!(asset, b"ORIGINAL");
        assert!(!store.session_exists("up2").await);
    }

    #[tokio::test]
    async fn upload_id_matching_published_asset_is_rejected() {
        let (_temp, _catalog, _store, media, coordinator) = setup();
        let mut first = submission("up1", 0, 1);
        first.content_id = Some("content-x".into());
        coordinator
            .submit_chunk(first, bytes_body(b"ORIGINAL"))
            .await
            .expect("first upload");

        let result = coordinator
            .submit_chunk(submission("content-x", 0, 1), bytes_body(b"REPLACED"))
            .await;
        assert!(matches!(result, Err(UploadError::AssetExists(_))));
        let asset = fs::read(media.root_path().join("content-x.mp4")).await.expect("asset");
        assert_eq!(asset, b"ORIGINAL");
    }

    #[tokio::test]
    async fn stalled_chunk_body_times_out() {
        let temp = tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory(sample_catalog()));
        let mut config = crate::config::test_upload_config(temp.path());
        config.chunk_timeout = Duration::from_millis(50);
        let (_registry, store, _media, coordinator) = make_coordinator_with(config, catalog);

        let body = futures_util::stream::pending::<Result<Bytes, io::Error>>();
        let result = coordinator.submit_chunk(submission("up1", 0, 2), body).await;
        assert!(matches!(result, Err(UploadError::Timeout)));
        let indices = store.list_indices("up1").await.expect("list");
        assert_eq!(indices.unwrap_or_default().len(), 0);
        let status = coordinator.status("up1").await.expect("status");
        assert!(status.received_indices.is_empty());
    }

    #[test]
    fn extension_prefers_file_name() {
        assert_eq!(resolve_extension(Some("Lecture 1.MOV"), "video/mp4"), "mov");
        assert_eq!(resolve_extension(Some("noext"), "application/x-unknown"), "bin");
        assert_eq!(resolve_extension(Some("bad.ex/t"), "application/x-unknown"), "bin");
        assert_eq!(resolve_extension(None, "video/webm"), "webm");
    }
}
