//! 分片暂存目录：每个上传标识一个目录，按索引保存分片文件。

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::atomic::{AtomicFile, is_temp_name};

const META_FILE: &str = "meta.json";
const PART_SUFFIX: &str = ".part";
const MAX_IDENTIFIER_LEN: usize = 128;

/// 上传会话的持久化描述，随第一个分片写入。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub total_chunks: u64,
    #[serde(default)]
    pub total_size: u64,
    pub extension: String,
    #[serde(default)]
    pub content_id: Option<String>,
}

/// 暂存根目录下的一个会话目录。
#[derive(Debug, Clone)]
pub struct SessionDir {
    pub upload_id: String,
    pub modified: SystemTime,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkWriteError {
    #[error("chunk exceeds {0} bytes")]
    TooLarge(u64),
    #[error("chunk body error: {0}")]
    Body(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 调用方必须先用 [`is_valid_identifier`] 校验标识。
    pub fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    pub fn chunk_path(&self, upload_id: &str, index: u64) -> PathBuf {
        self.session_dir(upload_id)
            .join(format!("{index}{PART_SUFFIX}"))
    }

    pub async fn session_exists(&self, upload_id: &str) -> bool {
        fs::metadata(self.session_dir(upload_id))
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }

    /// 写入会话元数据，会话目录按需创建。
    pub async fn write_meta(&self, upload_id: &str, meta: &SessionMeta) -> io::Result<()> {
        let dir = self.session_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let content = serde_json::to_vec(meta).map_err(io::Error::other)?;
        let mut atomic = AtomicFile::new(&dir.join(META_FILE)).await?;
        if let Err(err) = atomic.file_mut().write_all(&content).await {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await
    }

    /// 读取会话元数据；目录或元数据不存在时返回 `None`。
    pub async fn read_meta(&self, upload_id: &str) -> io::Result<Option<SessionMeta>> {
        match fs::read(self.session_dir(upload_id).join(META_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| io::Error::new(ErrorKind::InvalidData, err)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// 以流式方式写入分片，超出 `limit` 时放弃；同一索引重复提交会整体覆盖。
    pub async fn write_chunk<S, E>(
        &self,
        upload_id: &str,
        index: u64,
        mut body: S,
        limit: u64,
    ) -> Result<u64, ChunkWriteError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        fs::create_dir_all(self.session_dir(upload_id)).await?;
        let target = self.chunk_path(upload_id, index);
        let mut atomic = AtomicFile::new(&target).await?;

        let mut written: u64 = 0;
        let result: Result<(), ChunkWriteError> = async {
            while let Some(piece) = body.next().await {
                let piece = piece.map_err(|err| ChunkWriteError::Body(err.to_string()))?;
                if piece.is_empty() {
                    continue;
                }
                written += piece.len() as u64;
                if written > limit {
                    return Err(ChunkWriteError::TooLarge(limit));
                }
                atomic.file_mut().write_all(&piece).await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await?;
        debug!(upload_id, chunk_index = index, bytes = written, "chunk persisted");
        Ok(written)
    }

    /// 列出已持久化的分片索引；会话目录不存在时返回 `None`。
    pub async fn list_indices(&self, upload_id: &str) -> io::Result<Option<BTreeSet<u64>>> {
        let mut dir = match fs::read_dir(self.session_dir(upload_id)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut indices = BTreeSet::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_temp_name(&name) {
                continue;
            }
            if let Some(index) = name
                .strip_suffix(PART_SUFFIX)
                .and_then(|value| value.parse::<u64>().ok())
            {
                indices.insert(index);
            }
        }
        Ok(Some(indices))
    }

    /// 删除整个会话目录；目录已不存在视为成功。
    pub async fn remove_session(&self, upload_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.session_dir(upload_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// 枚举暂存根目录下的全部会话目录。
    pub async fn list_sessions(&self) -> io::Result<Vec<SessionDir>> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut sessions = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_valid_identifier(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            if !metadata.is_dir() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            sessions.push(SessionDir {
                upload_id: name,
                modified,
            });
        }
        Ok(sessions)
    }
}

/// 上传标识与内容标识只允许字母、数字、`-`、`_`。
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

#[cfg(test)]
pub(crate) fn bytes_body(
    data: &[u8],
) -> futures_util::stream::Iter<std::vec::IntoIter<Result<Bytes, io::Error>>> {
    let pieces: Vec<Result<Bytes, io::Error>> = data
        .chunks(7)
        .map(|piece| Ok(Bytes::copy_from_slice(piece)))
        .collect();
    futures_util::stream::iter(pieces)
}
