//! 内存中的上传会话表：每个上传标识一把异步锁，保护已接收索引集合与阶段。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::chunk_store::SessionMeta;

/// 单个上传会话的生命周期阶段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPhase {
    Receiving,
    Assembling,
    /// 合并完成，保存相对媒体根目录的资源路径。
    Assembled(String),
    /// 会话目录已被清理；持有旧句柄的请求需重新获取。
    Reaped,
}

#[derive(Debug)]
pub struct UploadState {
    pub hydrated: bool,
    pub meta: Option<SessionMeta>,
    pub received: BTreeSet<u64>,
    pub phase: UploadPhase,
    pub touched: Instant,
}

impl UploadState {
    fn new() -> Self {
        Self {
            hydrated: false,
            meta: None,
            received: BTreeSet::new(),
            phase: UploadPhase::Receiving,
            touched: Instant::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        match &self.meta {
            Some(meta) => self.received.len() as u64 == meta.total_chunks,
            None => false,
        }
    }
}

pub type UploadEntry = Arc<Mutex<UploadState>>;

/// 按上传标识索引的会话锁表。
#[derive(Debug, Default)]
pub struct UploadRegistry {
    sessions: Mutex<HashMap<String, UploadEntry>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 获取会话条目，不存在时创建。
    pub async fn entry(&self, upload_id: &str) -> UploadEntry {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(upload_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UploadState::new())))
            .clone()
    }

    pub async fn get(&self, upload_id: &str) -> Option<UploadEntry> {
        let sessions = self.sessions.lock().await;
        sessions.get(upload_id).cloned()
    }

    /// 为清理任务抢占会话锁；会话正忙或正在合并时返回 `None`。
    pub async fn try_claim(&self, upload_id: &str) -> Option<(UploadEntry, OwnedMutexGuard<UploadState>)> {
        let entry = self.entry(upload_id).await;
        let guard = entry.clone().try_lock_owned().ok()?;
        if guard.phase == UploadPhase::Assembling {
            return None;
        }
        Some((entry, guard))
    }

    /// 仅当表中仍是同一条目时移除。
    pub async fn forget(&self, upload_id: &str, entry: &UploadEntry) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(upload_id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            sessions.remove(upload_id);
        }
    }

    /// 丢弃长时间未触碰且未在合并的条目，返回移除数量。
    pub async fn prune_idle(&self, idle: Duration) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, entry| match entry.try_lock() {
            Ok(state) => {
                state.phase == UploadPhase::Assembling || state.touched.elapsed() < idle
            }
            Err(_) => true,
        });
        before - sessions.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entry_is_shared_per_upload() {
        let registry = UploadRegistry::new();
        let first = registry.entry("up1").await;
        let second = registry.entry("up1").await;
        assert!(Arc::ptr_eq(&first, &second));
        let other = registry.entry("up2").await;
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn claim_skips_assembling_and_locked_sessions() {
        let registry = UploadRegistry::new();
        let entry = registry.entry("up1").await;
        entry.lock().await.phase = UploadPhase::Assembling;
        assert!(registry.try_claim("up1").await.is_none());

        entry.lock().await.phase = UploadPhase::Receiving;
        let held = entry.lock().await;
        assert!(registry.try_claim("up1").await.is_none());
        drop(held);

        let (claimed, guard) = registry.try_claim("up1").await.expect("claim");
        drop(guard);
        registry.forget("up1", &claimed).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn forget_ignores_replaced_entry() {
        let registry = UploadRegistry::new();
        let stale = registry.entry("up1").await;
        registry.forget("up1", &stale).await;
        let fresh = registry.entry("up1").await;
        registry.forget("up1", &stale).await;
        assert!(Arc::ptr_eq(&registry.entry("up1").await, &fresh));
    }

    #[tokio::test]
    async fn prune_keeps_assembling_entries() {
        let registry = UploadRegistry::new();
        registry.entry("idle").await;
        let busy = registry.entry("busy").await;
        busy.lock().await.phase = UploadPhase::Assembling;

        let removed = registry.prune_idle(Duration::ZERO).await;
        assert_eq!(removed, 1);
        assert!(registry.get("busy").await.is_some());
        assert!(registry.get("idle").await.is_none());
    }
}
