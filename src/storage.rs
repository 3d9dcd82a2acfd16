//! 媒体根目录：相对路径解析与符号链接防护。

use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 解析相对路径，拒绝越界与符号链接分量。
    pub async fn resolve_path_checked(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target).await?;
        Ok(target)
    }

    /// 打开资源前读取元数据；目录视为不存在。
    pub async fn asset_metadata(&self, relative: &str) -> Result<(PathBuf, Metadata), StorageError> {
        let target = self.resolve_path_checked(relative).await?;
        let metadata = fs::metadata(&target).await?;
        if !metadata.is_file() {
            return Err(StorageError::Io(io::Error::from(ErrorKind::NotFound)));
        }
        Ok((target, metadata))
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath);
        }

        Ok(self.root.join(normalized))
    }

    async fn ensure_no_symlink_components(&self, target: &Path) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}
