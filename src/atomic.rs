//! 临时文件写入与原子改名。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 写入同目录临时文件，完成后改名为目标文件；读者只会看到完整内容。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}.tmp.{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃写入并删除临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 刷盘后原子替换目标文件。
    pub async fn finalize(mut self) -> io::Result<()> {
        self.sync_temp().await?;
        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        self.sync_parent().await;
        Ok(())
    }

    /// 刷盘后发布到目标路径；目标已存在时返回 `AlreadyExists`，不覆盖。
    pub async fn finalize_new(mut self) -> io::Result<()> {
        self.sync_temp().await?;
        let linked = fs::hard_link(&self.temp_path, &self.target).await;
        let _ = fs::remove_file(&self.temp_path).await;
        linked?;
        self.sync_parent().await;
        Ok(())
    }

    async fn sync_temp(&mut self) -> io::Result<()> {
        let synced = match self.file.flush().await {
            Ok(()) => self.file.sync_all().await,
            Err(err) => Err(err),
        };
        if let Err(err) = synced {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        Ok(())
    }

    async fn sync_parent(&self) {
        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
    }
}

/// 临时文件名以 `.` 开头并包含 `.tmp.`。
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let dir = std::fs::File::open(path)?;
            dir.sync_all()
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
