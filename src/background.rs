//! 过期上传清理与授权目录热加载的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::reaper::StaleUploadReaper;

/// 启动后台任务；间隔或保留时长为 0 时对应任务不启动。
pub fn spawn_background_tasks(
    reaper: Arc<StaleUploadReaper>,
    reaper_interval: Duration,
    catalog: Arc<Catalog>,
    catalog_refresh: Duration,
) {
    if !reaper.retention().is_zero() && !reaper_interval.is_zero() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper_interval);
            loop {
                interval.tick().await;
                match reaper.sweep().await {
                    Ok(0) => {}
                    Ok(cleaned) => info!(cleaned, "stale upload sweep finished"),
                    Err(err) => warn!(error = %err, "stale upload sweep failed"),
                }
            }
        });
    }

    if !catalog_refresh.is_zero() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(catalog_refresh);
            loop {
                interval.tick().await;
                if let Err(err) = catalog.refresh_if_changed().await {
                    warn!(error = %err, "catalog reload failed");
                }
            }
        });
    }
}
