use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use crate::errors::{Result, UploadError};

/// 固定分块大小 1 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// 单块最大尝试次数
pub const MAX_RETRIES: u32 = 3;

/// 退避上限
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// 完成后到清理台账记录的宽限时间，给 UI 展示 Completed 的机会
pub const CLEANUP_GRACE: Duration = Duration::from_secs(3);

/// 运行时参数
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// 分块大小
    pub chunk_size: u64,
    /// 单块最大尝试次数
    pub max_retries: u32,
    /// 完成后的清理宽限
    pub cleanup_grace: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: MAX_RETRIES,
            cleanup_grace: CLEANUP_GRACE,
        }
    }
}

/// 服务端连接配置，demo 二进制从 config.toml 读取
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub token: String,
    /// 台账文件路径，缺省用内存台账
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let config_str = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&config_str)
            .map_err(|err| UploadError::Config(format!("Can't parse {}: {}", path.as_ref().display(), err)))
    }
}
