//! CLI 参数、环境变量与默认配置。

use clap::Parser;
use shadow_rs::formatcp;
use std::path::PathBuf;
use std::time::Duration;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const SESSION_COOKIE_NAME: &str = "VV_SESSION";
pub const DEFAULT_CHUNK_MAX_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_CHUNK_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_UPLOAD_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 4 * 60 * 60;
pub const DEFAULT_CATALOG_REFRESH_SECS: u64 = 30;
pub const DEFAULT_UPLOAD_MIME_TYPES: &str = "video/mp4,video/webm,video/ogg,video/quicktime,video/x-matroska,video/x-msvideo,video/mpeg,video/x-m4v";
/// 多部分请求中除分片数据外的文本字段预留空间。
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;
pub const ASSEMBLY_QUEUE_DEPTH: usize = 64;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "lecture-vault", version = VERSION_INFO, about = "Chunked lecture upload and secure streaming server")]
pub struct Args {
    #[arg(
        long,
        env = "VV_SCRATCH_DIR",
        default_value = ".vault/chunks",
        help = "Scratch directory for in-progress chunk uploads"
    )]
    pub scratch_dir: String,
    #[arg(
        short = 'm',
        long,
        env = "VV_MEDIA_DIR",
        default_value = ".vault/media",
        help = "Directory for reassembled media assets"
    )]
    pub media_dir: String,
    #[arg(
        long,
        env = "VV_CATALOG",
        help = "Entitlement catalog JSON (viewers, courses, contents, grants)"
    )]
    pub catalog: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "VV_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "VV_HTTP_PORT",
        default_value_t = 7070,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "VV_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "VV_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "VV_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "VV_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "VV_CHUNK_MAX_SIZE",
        default_value_t = DEFAULT_CHUNK_MAX_SIZE,
        help = "Max bytes accepted for a single chunk"
    )]
    pub chunk_max_size: u64,
    #[arg(
        long,
        env = "VV_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max declared upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "VV_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "VV_CHUNK_TIMEOUT_SECS",
        default_value_t = DEFAULT_CHUNK_TIMEOUT_SECS,
        help = "Max seconds spent receiving one chunk body"
    )]
    pub chunk_timeout_secs: u64,
    #[arg(
        long,
        env = "VV_UPLOAD_MIME_TYPES",
        default_value = DEFAULT_UPLOAD_MIME_TYPES,
        help = "Comma separated mime types accepted for upload"
    )]
    pub upload_mime_types: String,
    #[arg(
        long,
        env = "VV_UPLOAD_RETENTION_SECS",
        default_value_t = DEFAULT_UPLOAD_RETENTION_SECS,
        help = "Abandoned upload sessions older than this are removed (0 to disable)"
    )]
    pub upload_retention_secs: u64,
    #[arg(
        long,
        env = "VV_REAPER_INTERVAL_SECS",
        default_value_t = DEFAULT_REAPER_INTERVAL_SECS,
        help = "Seconds between stale upload sweeps"
    )]
    pub reaper_interval_secs: u64,
    #[arg(
        long,
        env = "VV_TOKEN_SECRET",
        hide_env_values = true,
        help = "HMAC secret for stream capabilities"
    )]
    pub token_secret: Option<String>,
    #[arg(
        long,
        env = "VV_TOKEN_TTL_SECS",
        default_value_t = DEFAULT_TOKEN_TTL_SECS,
        help = "Stream capability lifetime in seconds"
    )]
    pub token_ttl_secs: u64,
    #[arg(
        long,
        env = "VV_CATALOG_REFRESH_SECS",
        default_value_t = DEFAULT_CATALOG_REFRESH_SECS,
        help = "Seconds between catalog change checks (0 to disable)"
    )]
    pub catalog_refresh_secs: u64,
}

/// 分片上传相关的运行时配置。
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub scratch_root: PathBuf,
    pub media_root: PathBuf,
    pub chunk_max_size: u64,
    pub max_total_size: u64,
    pub max_chunks: u64,
    pub chunk_timeout: Duration,
    pub allowed_mime_types: Vec<String>,
    pub retention: Duration,
}

impl UploadConfig {
    /// 从命令行参数构建上传配置。
    pub fn from_args(args: &Args) -> Self {
        Self {
            scratch_root: PathBuf::from(&args.scratch_dir),
            media_root: PathBuf::from(&args.media_dir),
            chunk_max_size: args.chunk_max_size,
            max_total_size: args.upload_max_size,
            max_chunks: args.upload_max_chunks,
            chunk_timeout: Duration::from_secs(args.chunk_timeout_secs),
            allowed_mime_types: parse_mime_list(&args.upload_mime_types),
            retention: Duration::from_secs(args.upload_retention_secs),
        }
    }

    /// 判断声明的 MIME 类型是否在允许列表中（忽略参数与大小写）。
    pub fn is_mime_allowed(&self, mime: &str) -> bool {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.allowed_mime_types.iter().any(|allowed| *allowed == essence)
    }
}

fn parse_mime_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
pub(crate) fn test_upload_config(root: &std::path::Path) -> UploadConfig {
    UploadConfig {
        scratch_root: root.join("chunks"),
        media_root: root.join("media"),
        chunk_max_size: DEFAULT_CHUNK_MAX_SIZE,
        max_total_size: DEFAULT_UPLOAD_MAX_SIZE,
        max_chunks: DEFAULT_UPLOAD_MAX_CHUNKS,
        chunk_timeout: Duration::from_secs(DEFAULT_CHUNK_TIMEOUT_SECS),
        allowed_mime_types: parse_mime_list(DEFAULT_UPLOAD_MIME_TYPES),
        retention: Duration::from_secs(DEFAULT_UPLOAD_RETENTION_SECS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_check_ignores_parameters_and_case() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = test_upload_config(temp.path());
        assert!(config.is_mime_allowed("video/mp4"));
        assert!(config.is_mime_allowed("Video/MP4; codecs=\"avc1\""));
        assert!(!config.is_mime_allowed("application/pdf"));
        assert!(!config.is_mime_allowed("application/octet-stream"));
    }
}
