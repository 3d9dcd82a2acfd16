//! 分片合并：按索引顺序流式拼接到临时文件，完成后原子改名并删除分片目录。
//!
//! 合并任务通过 [`AssemblyQueue`] 交给单独的工作任务执行。同一上传标识的重复
//! 任务会挂到正在进行的合并上，共享同一个结果。

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::atomic::AtomicFile;
use crate::chunk_store::ChunkStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("chunk {0} is missing")]
    MissingChunk(u64),
    #[error("upload session no longer exists")]
    SessionMissing,
    #[error("asset already exists")]
    DestinationExists,
    #[error("size mismatch: declared {expected} bytes, assembled {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("{context}: {message}")]
    Io {
        context: &'static str,
        message: String,
    },
    #[error("assembly worker unavailable")]
    WorkerGone,
}

impl AssemblyError {
    fn io(context: &'static str, err: std::io::Error) -> Self {
        AssemblyError::Io {
            context,
            message: err.to_string(),
        }
    }
}

pub type AssemblyResult = Result<u64, AssemblyError>;

/// 一次合并所需的全部输入。
#[derive(Debug, Clone)]
pub struct AssemblyPlan {
    pub upload_id: String,
    pub total_chunks: u64,
    /// 声明的总字节数，为 0 时不校验。
    pub expected_size: u64,
    pub destination: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Reassembler {
    store: ChunkStore,
}

impl Reassembler {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    /// 合并全部分片并返回写入的字节数。
    pub async fn assemble(&self, plan: &AssemblyPlan) -> AssemblyResult {
        let upload_id = plan.upload_id.as_str();
        if !self.store.session_exists(upload_id).await {
            // 目录已被先前的合并消费
            if let Ok(metadata) = fs::metadata(&plan.destination).await
                && metadata.is_file()
            {
                debug!(upload_id, "session already merged");
                return Ok(metadata.len());
            }
            return Err(AssemblyError::SessionMissing);
        }

        match fs::try_exists(&plan.destination).await {
            Ok(false) => {}
            Ok(true) => {
                warn!(upload_id, destination = ?plan.destination, "refusing to replace published asset");
                return Err(AssemblyError::DestinationExists);
            }
            Err(err) => return Err(AssemblyError::io("check destination", err)),
        }

        if let Some(parent) = plan.destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| AssemblyError::io("create media dir", err))?;
        }

        let mut atomic = AtomicFile::new(&plan.destination)
            .await
            .map_err(|err| AssemblyError::io("create temp asset", err))?;
        let write_result: AssemblyResult = async {
            let mut total_written: u64 = 0;
            for index in 0..plan.total_chunks {
                let path = self.store.chunk_path(upload_id, index);
                let mut part = match File::open(&path).await {
                    Ok(file) => file,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        return Err(AssemblyError::MissingChunk(index));
                    }
                    Err(err) => return Err(AssemblyError::io("open chunk", err)),
                };
                total_written += tokio::io::copy(&mut part, atomic.file_mut())
                    .await
                    .map_err(|err| AssemblyError::io("copy chunk", err))?;
            }
            Ok(total_written)
        }
        .await;

        let total_written = match write_result {
            Ok(value) => value,
            Err(err) => {
                warn!(upload_id, error = %err, "assembly aborted");
                atomic.cleanup().await;
                return Err(err);
            }
        };

        if plan.expected_size > 0 && total_written != plan.expected_size {
            warn!(
                upload_id,
                expected = plan.expected_size,
                actual = total_written,
                "size mismatch after merge"
            );
            atomic.cleanup().await;
            return Err(AssemblyError::SizeMismatch {
                expected: plan.expected_size,
                actual: total_written,
            });
        }
        atomic.finalize_new().await.map_err(|err| match err.kind() {
            ErrorKind::AlreadyExists => AssemblyError::DestinationExists,
            _ => AssemblyError::io("publish asset", err),
        })?;

        if let Err(err) = self.store.remove_session(upload_id).await {
            warn!(upload_id, error = %err, "failed to remove merged chunk dir");
        }

        info!(
            upload_id,
            chunks = plan.total_chunks,
            bytes = total_written,
            destination = ?plan.destination,
            "upload assembled"
        );
        Ok(total_written)
    }
}

struct AssemblyJob {
    plan: AssemblyPlan,
    reply: oneshot::Sender<AssemblyResult>,
}

/// 合并任务队列的发送端。
#[derive(Debug, Clone)]
pub struct AssemblyQueue {
    tx: mpsc::Sender<AssemblyJob>,
}

impl AssemblyQueue {
    /// 启动合并工作任务。必须在 Tokio 运行时内调用。
    pub fn spawn(reassembler: Reassembler, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        tokio::spawn(run_worker(reassembler, rx));
        Self { tx }
    }

    /// 提交合并并等待结果。
    pub async fn submit(&self, plan: AssemblyPlan) -> AssemblyResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AssemblyJob { plan, reply })
            .await
            .map_err(|_| AssemblyError::WorkerGone)?;
        rx.await.map_err(|_| AssemblyError::WorkerGone)?
    }
}

impl std::fmt::Debug for AssemblyJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyJob")
            .field("upload_id", &self.plan.upload_id)
            .finish()
    }
}

async fn run_worker(reassembler: Reassembler, mut rx: mpsc::Receiver<AssemblyJob>) {
    let mut in_flight: HashMap<String, Vec<oneshot::Sender<AssemblyResult>>> = HashMap::new();
    let mut tasks: JoinSet<(String, AssemblyResult)> = JoinSet::new();

    loop {
        tokio::select! {
            job = rx.recv() => {
                let Some(AssemblyJob { plan, reply }) = job else {
                    break;
                };
                if let Some(waiters) = in_flight.get_mut(&plan.upload_id) {
                    debug!(upload_id = plan.upload_id, "joining in-flight assembly");
                    waiters.push(reply);
                    continue;
                }
                in_flight.insert(plan.upload_id.clone(), vec![reply]);
                let reassembler = reassembler.clone();
                tasks.spawn(async move {
                    // 内层任务隔离 panic，外层保留上传标识以便回复等待者
                    let upload_id = plan.upload_id.clone();
                    let result = match tokio::spawn(async move { reassembler.assemble(&plan).await }).await {
                        Ok(result) => result,
                        Err(err) => Err(AssemblyError::Io {
                            context: "assembly task",
                            message: err.to_string(),
                        }),
                    };
                    (upload_id, result)
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                match joined {
                    Ok((upload_id, result)) => {
                        for waiter in in_flight.remove(&upload_id).unwrap_or_default() {
                            let _ = waiter.send(result.clone());
                        }
                    }
                    Err(err) => error!(error = %err, "assembly task join failed"),
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Ok((upload_id, result)) = joined {
            for waiter in in_flight.remove(&upload_id).unwrap_or_default() {
                let _ = waiter.send(result.clone());
            }
        }
    }
}
