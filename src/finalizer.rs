//! 收尾 - 全部分块确认后把上传物化为附件

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use crate::api::{AttachmentInfo, UploadEndpoint};
use crate::errors::{Result, UploadError};
use crate::ledger::Ledger;
use crate::types::{UploadId, UploadRecord};

pub struct Finalizer {
    endpoint: Arc<dyn UploadEndpoint>,
    ledger: Arc<dyn Ledger>,
    cleanup_grace: Duration,
}

impl Finalizer {
    pub fn new(
        endpoint: Arc<dyn UploadEndpoint>,
        ledger: Arc<dyn Ledger>,
        cleanup_grace: Duration,
    ) -> Self {
        Self { endpoint, ledger, cleanup_grace }
    }

    /// 调用远端 complete，只管网络不碰台账
    ///
    /// complete 不做隐式重试；失败上抛为终止性错误，记录保留为
    /// Failed 供调用方显式 resume 重试。
    pub async fn complete(&self, record: &UploadRecord) -> Result<AttachmentInfo> {
        debug_assert_eq!(record.uploaded_chunks, record.total_chunks);

        let attachment = self
            .endpoint
            .complete_upload(record.upload_id, &record.file_name, record.file_size, &record.card_id)
            .await
            .map_err(|err| UploadError::Finalize(err.to_string()))?;

        debug!(upload_id = %record.upload_id, attachment_id = %attachment.id, "upload finalized");

        Ok(attachment)
    }

    /// 宽限期后清掉记录，让 UI 有机会展示 Completed
    pub fn schedule_cleanup(&self, upload_id: UploadId) {
        let ledger = self.ledger.clone();
        let grace = self.cleanup_grace;
        tokio::spawn(async move {
            sleep(grace).await;
            if let Err(err) = ledger.delete(upload_id).await {
                warn!(%upload_id, error = %err, "ledger cleanup failed");
            }
        });
    }
}
