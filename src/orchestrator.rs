//! 上传编排器对外句柄

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use crate::api::UploadEndpoint;
use crate::config::UploadConfig;
use crate::errors::{Result, UploadError};
use crate::ledger::Ledger;
use crate::types::{OrchestratorCommand, UploadEvent, UploadId, UploadProgress, UploadRecord};
use crate::worker::OrchestratorWorker;

/// 可克隆的编排器句柄，命令经 mpsc 发给工作任务
#[derive(Clone)]
pub struct Orchestrator {
    command_tx: mpsc::Sender<OrchestratorCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
}

/// 编排器句柄 - 包含编排器和工作任务
pub struct OrchestratorHandle {
    pub orchestrator: Orchestrator,
    pub worker_handle: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// 显式发 Shutdown 命令：别的 Orchestrator 克隆还活着也能关闭
    pub async fn shutdown(self) -> Result<()> {
        let _ = self
            .orchestrator
            .command_tx
            .send(OrchestratorCommand::Shutdown)
            .await;
        drop(self.orchestrator);
        self.worker_handle
            .await
            .map_err(|err| UploadError::internal_error(format!("Worker panic: {}", err)))
    }
}

impl Orchestrator {
    pub fn new(
        endpoint: Arc<dyn UploadEndpoint>,
        ledger: Arc<dyn Ledger>,
        config: UploadConfig,
    ) -> OrchestratorHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        let worker_handle = tokio::spawn(OrchestratorWorker::run(
            endpoint,
            ledger,
            config,
            command_rx,
            event_tx.clone(),
        ));

        let orchestrator = Self {
            command_tx,
            event_tx,
        };

        OrchestratorHandle {
            orchestrator,
            worker_handle,
        }
    }

    async fn send_command<T>(
        &self,
        command: OrchestratorCommand,
        reply_rx: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| UploadError::Shutdown)?;

        reply_rx.await.map_err(|_| UploadError::Shutdown)
    }

    /// 新建上传：立刻返回 upload_id，分块循环在后台推进
    pub async fn start(
        &self,
        file_path: impl Into<PathBuf>,
        card_id: impl Into<String>,
    ) -> Result<UploadId> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(
            OrchestratorCommand::Start {
                file_path: file_path.into(),
                card_id: card_id.into(),
                reply,
            },
            reply_rx,
        )
        .await?
    }

    /// Pause upload
    pub async fn pause(&self, upload_id: UploadId) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::Pause { upload_id, reply }, reply_rx)
            .await?
    }

    /// Resume upload，从落账的游标继续，绝不重传已确认的块
    pub async fn resume(&self, upload_id: UploadId) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::Resume { upload_id, reply }, reply_rx)
            .await?
    }

    /// Cancel upload，无条件删除台账记录
    pub async fn cancel(&self, upload_id: UploadId) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::Cancel { upload_id, reply }, reply_rx)
            .await?
    }

    /// 按需从台账记录计算的进度快照
    pub async fn progress(&self, upload_id: UploadId) -> Result<Option<UploadProgress>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::GetProgress { upload_id, reply }, reply_rx)
            .await
    }

    /// Get record
    pub async fn record(&self, upload_id: UploadId) -> Result<Option<UploadRecord>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::GetRecord { upload_id, reply }, reply_rx)
            .await
    }

    /// Get all records
    pub async fn records(&self) -> Result<Vec<UploadRecord>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::GetAllRecords { reply }, reply_rx)
            .await
    }

    /// 订阅事件
    ///
    /// 注意：接收不及时可能丢事件（lagged error），每个订阅者
    /// 都会收到完整的事件副本
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }
}
