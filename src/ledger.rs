//! 持久化上传台账
//!
//! 台账是"这次上传到底传到哪了"的唯一事实来源。每条记录以
//! `upload_id` 为键；`get`/`delete` 对不存在的键不报错，`save`
//! 是原子 upsert。

use std::collections::HashMap;
use std::path::PathBuf;
use async_trait::async_trait;
use tokio::sync::Mutex;
use crate::errors::Result;
use crate::types::{UploadId, UploadRecord, UploadStatus};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// 保存记录（upsert，幂等）
    async fn save(&self, record: &UploadRecord) -> Result<()>;

    /// 读取记录
    async fn get(&self, upload_id: UploadId) -> Result<Option<UploadRecord>>;

    /// 列出所有记录，重启后用于恢复/展示
    async fn get_all(&self) -> Result<Vec<UploadRecord>>;

    /// 删除记录，键不存在时静默成功
    async fn delete(&self, upload_id: UploadId) -> Result<()>;
}

/// 内存台账 - 测试与不需要跨重启的场景
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<UploadId, UploadRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn save(&self, record: &UploadRecord) -> Result<()> {
        self.records.lock().await.insert(record.upload_id, record.clone());
        Ok(())
    }

    async fn get(&self, upload_id: UploadId) -> Result<Option<UploadRecord>> {
        Ok(self.records.lock().await.get(&upload_id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<UploadRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn delete(&self, upload_id: UploadId) -> Result<()> {
        self.records.lock().await.remove(&upload_id);
        Ok(())
    }
}

/// JSON 文件台账 - 单个文档存全部记录，跨进程重启存活
///
/// 写入先落临时文件再 rename，崩溃不会截断台账。
pub struct JsonFileLedger {
    path: PathBuf,
    records: Mutex<HashMap<UploadId, UploadRecord>>,
}

impl JsonFileLedger {
    /// 从磁盘恢复台账。文件不存在视为空台账。
    ///
    /// 记录里的文件句柄不可能跨进程存活，所以恢复出来的
    /// Uploading 记录降级为 Paused，等调用方显式 resume。
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut records = HashMap::new();

        if path.exists() {
            let data = tokio::fs::read_to_string(&path).await?;
            let stored: Vec<UploadRecord> = serde_json::from_str(&data)?;
            for mut record in stored {
                if record.status == UploadStatus::Uploading || record.status == UploadStatus::Pending {
                    record.status = UploadStatus::Paused;
                }
                records.insert(record.upload_id, record);
            }
        }

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn persist(&self, records: &HashMap<UploadId, UploadRecord>) -> Result<()> {
        let all: Vec<_> = records.values().collect();
        let data = serde_json::to_string_pretty(&all)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}

#[async_trait]
impl Ledger for JsonFileLedger {
    async fn save(&self, record: &UploadRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        records.insert(record.upload_id, record.clone());
        self.persist(&records).await
    }

    async fn get(&self, upload_id: UploadId) -> Result<Option<UploadRecord>> {
        Ok(self.records.lock().await.get(&upload_id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<UploadRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn delete(&self, upload_id: UploadId) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.remove(&upload_id).is_some() {
            self.persist(&records).await?;
        }
        Ok(())
    }
}
