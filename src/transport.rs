//! 分块传输 - 单块重试与协作式取消
//!
//! 瞬时失败在这里被完全吸收；只有重试耗尽才会作为终止性错误
//! 上抛。取消通过 `CancellationToken` 在挂起点观察，绝不抢占。

use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::api::UploadEndpoint;
use crate::config::{MAX_BACKOFF, MAX_RETRIES};
use crate::errors::{Result, UploadError};
use crate::types::UploadId;

/// 第 attempt 次尝试失败后的退避：min(2^attempt * 1000ms, 30000ms)
pub fn backoff_delay(attempt: u32) -> Duration {
    let millis = 1000u64.saturating_mul(1u64 << attempt.min(16));
    std::cmp::min(Duration::from_millis(millis), MAX_BACKOFF)
}

#[derive(Clone)]
pub struct ChunkTransport {
    endpoint: Arc<dyn UploadEndpoint>,
    max_retries: u32,
}

impl ChunkTransport {
    pub fn new(endpoint: Arc<dyn UploadEndpoint>, max_retries: u32) -> Self {
        Self { endpoint, max_retries }
    }

    pub fn with_default_retries(endpoint: Arc<dyn UploadEndpoint>) -> Self {
        Self::new(endpoint, MAX_RETRIES)
    }

    /// 传输一个分块，成功或失败作为整体
    ///
    /// 任何挂起点观察到取消都立即返回 `Cancelled`，不再重试。
    pub async fn transfer(
        &self,
        upload_id: UploadId,
        file_name: &str,
        chunk_index: u64,
        total_chunks: u64,
        bytes: Bytes,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut last_error: Option<UploadError> = None;

        for attempt in 1..=self.max_retries {
            if token.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let request = self.endpoint.submit_chunk(
                upload_id,
                file_name,
                chunk_index,
                total_chunks,
                bytes.clone(),
            );

            let result = tokio::select! {
                result = request => result,
                _ = token.cancelled() => return Err(UploadError::Cancelled),
            };

            match result {
                Ok(()) => {
                    debug!(%upload_id, chunk_index, attempt, "chunk acknowledged");
                    return Ok(());
                }
                Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
                Err(err) => {
                    warn!(%upload_id, chunk_index, attempt, error = %err, "chunk attempt failed");
                    last_error = Some(err);
                }
            }

            // 最后一次失败后不再等待
            if attempt < self.max_retries {
                tokio::select! {
                    _ = sleep(backoff_delay(attempt)) => {}
                    _ = token.cancelled() => return Err(UploadError::Cancelled),
                }
            }
        }

        Err(UploadError::TransferExhausted {
            chunk_index,
            attempts: self.max_retries,
            message: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no attempts were made".to_string()),
        })
    }
}
