use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use crate::api::AttachmentInfo;
use crate::errors::Result;

/// 上传任务唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UploadStatus {
    /// 已创建，分块循环尚未启动
    Pending,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

/// 上传记录 - 台账中唯一的持久化实体
///
/// `uploaded_chunks` 是游标：既是下一个要发送的分块下标，
/// 也是已确认分块的数量。只有传输层确认后才会推进。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    /// 上传 ID，创建后不再变化，绝不复用
    pub upload_id: UploadId,
    /// 文件名
    pub file_name: String,
    /// 文件大小（字节）
    pub file_size: u64,
    /// 源文件路径。句柄不持久化，恢复时按路径重新打开并校验
    pub file_path: PathBuf,
    /// 目标卡片 ID
    pub card_id: String,
    /// 分块总数 = ceil(file_size / chunk_size)
    pub total_chunks: u64,
    /// 已确认的分块数量（游标）
    pub uploaded_chunks: u64,
    /// 当前状态
    pub status: UploadStatus,
    /// 错误信息，仅在 Failed 时存在
    pub error: Option<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后一次写入时间
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(
        file_name: String,
        file_size: u64,
        file_path: PathBuf,
        card_id: String,
        total_chunks: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id: UploadId::new(),
            file_name,
            file_size,
            file_path,
            card_id,
            total_chunks,
            uploaded_chunks: 0,
            status: UploadStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 已确认的字节数（末块可能不满一个分块大小）
    pub fn uploaded_bytes(&self, chunk_size: u64) -> u64 {
        std::cmp::min(self.uploaded_chunks.saturating_mul(chunk_size), self.file_size)
    }
}

/// 上传进度 - 按需从台账记录计算出的快照，UI 只读
#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub upload_id: UploadId,
    pub file_name: String,
    pub file_size: u64,
    /// 已上传字节数
    pub uploaded_bytes: u64,
    /// 完成百分比
    pub percentage: f64,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl UploadProgress {
    pub fn from_record(record: &UploadRecord, chunk_size: u64) -> Self {
        let uploaded_bytes = record.uploaded_bytes(chunk_size);
        let percentage = if record.file_size == 0 {
            if record.status == UploadStatus::Completed { 100.0 } else { 0.0 }
        } else {
            uploaded_bytes as f64 / record.file_size as f64 * 100.0
        };

        Self {
            upload_id: record.upload_id,
            file_name: record.file_name.clone(),
            file_size: record.file_size,
            uploaded_bytes,
            percentage,
            status: record.status,
            error: record.error.clone(),
        }
    }
}

/// 上传事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 状态变更
    StateChanged {
        upload_id: UploadId,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 分块确认后的进度更新
    Progress {
        upload_id: UploadId,
        uploaded_chunks: u64,
        total_chunks: u64,
    },
    /// 任务完成
    Completed {
        upload_id: UploadId,
        attachment: AttachmentInfo,
    },
    /// 任务失败
    Failed {
        upload_id: UploadId,
        error: String,
    },
    /// 记录已删除（取消或完成清理）
    Removed {
        upload_id: UploadId,
    },
}

/// 编排器命令
pub enum OrchestratorCommand {
    /// 新建上传任务
    Start {
        file_path: PathBuf,
        card_id: String,
        reply: oneshot::Sender<Result<UploadId>>,
    },
    /// 暂停
    Pause {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// 恢复（Paused 或 Failed 均可）
    Resume {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// 取消并删除记录
    Cancel {
        upload_id: UploadId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// 获取进度快照
    GetProgress {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadProgress>>,
    },
    /// 获取记录
    GetRecord {
        upload_id: UploadId,
        reply: oneshot::Sender<Option<UploadRecord>>,
    },
    /// 获取所有记录
    GetAllRecords {
        reply: oneshot::Sender<Vec<UploadRecord>>,
    },
    /// 关闭编排器
    Shutdown,
}
