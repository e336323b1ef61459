//! 编排器工作任务
//!
//! 工作任务独占全部可变状态，也是台账在线记录的唯一写者：
//! 分块循环只读文件和台账，游标推进、完成、失败都以消息发回
//! 工作任务落账。同一条记录不存在两个并发写者。

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::api::{AttachmentInfo, UploadEndpoint};
use crate::config::UploadConfig;
use crate::errors::{Result, UploadError};
use crate::finalizer::Finalizer;
use crate::ledger::Ledger;
use crate::planner;
use crate::transport::ChunkTransport;
use crate::types::{
    OrchestratorCommand, UploadEvent, UploadId, UploadProgress, UploadRecord, UploadStatus,
};

/// 分块循环发回工作任务的消息，所有落账都由工作任务执行
enum LoopMessage {
    /// 某块拿到传输层确认
    ChunkAcked { upload_id: UploadId, acked_index: u64 },
    /// 远端 complete 成功
    Finished { upload_id: UploadId, attachment: AttachmentInfo },
    /// 终止性失败
    Failed { upload_id: UploadId, error: String },
    /// 循环任务退出（任何路径都最后发这条）
    Exited { upload_id: UploadId },
}

struct InflightUpload {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

pub(crate) struct OrchestratorWorker {
    endpoint: Arc<dyn UploadEndpoint>,
    ledger: Arc<dyn Ledger>,
    transport: ChunkTransport,
    finalizer: Arc<Finalizer>,
    config: UploadConfig,
    inflight: HashMap<UploadId, InflightUpload>,
    event_tx: broadcast::Sender<UploadEvent>,
    loop_tx: mpsc::UnboundedSender<LoopMessage>,
}

impl OrchestratorWorker {
    pub(crate) async fn run(
        endpoint: Arc<dyn UploadEndpoint>,
        ledger: Arc<dyn Ledger>,
        config: UploadConfig,
        mut command_rx: mpsc::Receiver<OrchestratorCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (loop_tx, mut loop_rx) = mpsc::unbounded_channel();
        let transport = ChunkTransport::new(endpoint.clone(), config.max_retries);
        let finalizer = Arc::new(Finalizer::new(
            endpoint.clone(),
            ledger.clone(),
            config.cleanup_grace,
        ));

        let mut worker = Self {
            endpoint,
            ledger,
            transport,
            finalizer,
            config,
            inflight: HashMap::new(),
            event_tx,
            loop_tx,
        };

        // 主事件循环。biased：先清空循环消息再处理命令，保证
        // 暂停后立即恢复时，迟到的游标确认先于 Resume 入账
        loop {
            tokio::select! {
                biased;
                Some(message) = loop_rx.recv() => {
                    worker.handle_loop_message(message).await;
                }
                command = command_rx.recv() => {
                    match command {
                        Some(OrchestratorCommand::Shutdown) | None => break,
                        Some(command) => worker.handle_command(command).await,
                    }
                }
            }
        }

        // 关闭时通知所有在途循环退出
        for (_, inflight) in worker.inflight.drain() {
            inflight.cancellation_token.cancel();
        }
    }

    /// 循环结束的通知可能晚于同一 ID 的新循环启动（暂停后立刻
    /// 恢复），只清理确实已结束的句柄
    fn reap_finished(&mut self, upload_id: UploadId) {
        let finished = self
            .inflight
            .get(&upload_id)
            .is_some_and(|inflight| inflight.join_handle.is_finished());
        if finished {
            self.inflight.remove(&upload_id);
        }
    }

    async fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::Start { file_path, card_id, reply } => {
                let result = self.start_upload(file_path, card_id).await;
                let _ = reply.send(result);
            }
            OrchestratorCommand::Pause { upload_id, reply } => {
                let result = self.pause_upload(upload_id).await;
                let _ = reply.send(result);
            }
            OrchestratorCommand::Resume { upload_id, reply } => {
                let result = self.resume_upload(upload_id).await;
                let _ = reply.send(result);
            }
            OrchestratorCommand::Cancel { upload_id, reply } => {
                let result = self.cancel_upload(upload_id).await;
                let _ = reply.send(result);
            }
            OrchestratorCommand::GetProgress { upload_id, reply } => {
                let progress = match self.ledger.get(upload_id).await {
                    Ok(record) => {
                        record.map(|record| UploadProgress::from_record(&record, self.config.chunk_size))
                    }
                    Err(err) => {
                        warn!(%upload_id, error = %err, "ledger read failed");
                        None
                    }
                };
                let _ = reply.send(progress);
            }
            OrchestratorCommand::GetRecord { upload_id, reply } => {
                let record = match self.ledger.get(upload_id).await {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(%upload_id, error = %err, "ledger read failed");
                        None
                    }
                };
                let _ = reply.send(record);
            }
            OrchestratorCommand::GetAllRecords { reply } => {
                let records = match self.ledger.get_all().await {
                    Ok(records) => records,
                    Err(err) => {
                        warn!(error = %err, "ledger read failed");
                        Vec::new()
                    }
                };
                let _ = reply.send(records);
            }
            // Shutdown 在主循环里直接 break
            OrchestratorCommand::Shutdown => {}
        }
    }

    async fn handle_loop_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::ChunkAcked { upload_id, acked_index } => {
                self.record_chunk_ack(upload_id, acked_index).await;
            }
            LoopMessage::Finished { upload_id, attachment } => {
                self.record_finished(upload_id, attachment).await;
            }
            LoopMessage::Failed { upload_id, error } => {
                self.record_failed(upload_id, error).await;
            }
            LoopMessage::Exited { upload_id } => {
                self.reap_finished(upload_id);
            }
        }
    }

    /// 游标入账。只改游标字段且只增不减：并发的暂停改了状态、
    /// 取消删了记录，确认迟到也不会覆盖或复活
    async fn record_chunk_ack(&mut self, upload_id: UploadId, acked_index: u64) {
        match self.ledger.get(upload_id).await {
            Ok(Some(mut record)) => {
                let next = acked_index + 1;
                if next <= record.uploaded_chunks {
                    return;
                }
                record.uploaded_chunks = next;
                record.updated_at = Utc::now();
                if let Err(err) = self.ledger.save(&record).await {
                    warn!(%upload_id, error = %err, "failed to persist cursor");
                    return;
                }
                let _ = self.event_tx.send(UploadEvent::Progress {
                    upload_id,
                    uploaded_chunks: record.uploaded_chunks,
                    total_chunks: record.total_chunks,
                });
            }
            // 已取消，确认丢弃
            Ok(None) => {}
            Err(err) => warn!(%upload_id, error = %err, "ledger read failed"),
        }
    }

    async fn record_finished(&mut self, upload_id: UploadId, attachment: AttachmentInfo) {
        match self.ledger.get(upload_id).await {
            Ok(Some(mut record)) => {
                let old_status = record.status;
                record.status = UploadStatus::Completed;
                record.error = None;
                record.updated_at = Utc::now();
                if let Err(err) = self.ledger.save(&record).await {
                    warn!(%upload_id, error = %err, "failed to persist completion");
                }
                self.emit_state_change(upload_id, old_status, UploadStatus::Completed);
                let _ = self.event_tx.send(UploadEvent::Completed { upload_id, attachment });
                self.finalizer.schedule_cleanup(upload_id);
            }
            // 取消赢了收尾这一跑，记录已删不再复活
            Ok(None) => {}
            Err(err) => warn!(%upload_id, error = %err, "ledger read failed"),
        }
    }

    async fn record_failed(&mut self, upload_id: UploadId, error: String) {
        match self.ledger.get(upload_id).await {
            Ok(Some(mut record)) => {
                let old_status = record.status;
                record.status = UploadStatus::Failed;
                record.error = Some(error.clone());
                record.updated_at = Utc::now();
                if let Err(err) = self.ledger.save(&record).await {
                    warn!(%upload_id, error = %err, "failed to persist failure");
                }
                self.emit_state_change(upload_id, old_status, UploadStatus::Failed);
                let _ = self.event_tx.send(UploadEvent::Failed { upload_id, error });
            }
            Ok(None) => {}
            Err(err) => warn!(%upload_id, error = %err, "ledger read failed"),
        }
    }

    async fn start_upload(&mut self, file_path: PathBuf, card_id: String) -> Result<UploadId> {
        let metadata = tokio::fs::metadata(&file_path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Param("Not a file".to_string()));
        }

        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::Param("Can't read filename".to_string()))?
            .to_string();

        let file_size = metadata.len();
        let total_chunks = planner::total_chunks(file_size, self.config.chunk_size);
        let record = UploadRecord::new(file_name, file_size, file_path, card_id, total_chunks);
        let upload_id = record.upload_id;

        self.ledger.save(&record).await?;
        self.begin_uploading(record).await?;

        Ok(upload_id)
    }

    async fn pause_upload(&mut self, upload_id: UploadId) -> Result<()> {
        let mut record = self
            .ledger
            .get(upload_id)
            .await?
            .ok_or(UploadError::UnknownUpload(upload_id))?;

        if record.status != UploadStatus::Uploading {
            return Err(UploadError::Param(format!(
                "Cannot pause upload in state {:?}",
                record.status
            )));
        }

        // 先发取消信号再落账；在途的那一块会被丢弃重传
        if let Some(inflight) = self.inflight.get(&upload_id) {
            inflight.cancellation_token.cancel();
        }

        record.status = UploadStatus::Paused;
        record.updated_at = Utc::now();
        self.ledger.save(&record).await?;
        self.emit_state_change(upload_id, UploadStatus::Uploading, UploadStatus::Paused);

        Ok(())
    }

    async fn resume_upload(&mut self, upload_id: UploadId) -> Result<()> {
        let record = self
            .ledger
            .get(upload_id)
            .await?
            .ok_or(UploadError::UnknownUpload(upload_id))?;

        // Failed 也可恢复：游标已到头时等于显式重试 finalize
        if record.status != UploadStatus::Paused && record.status != UploadStatus::Failed {
            return Err(UploadError::Param(format!(
                "Cannot resume upload in state {:?}",
                record.status
            )));
        }

        // 改状态之前先确认源文件还在且没变
        let metadata = tokio::fs::metadata(&record.file_path).await?;
        if metadata.len() != record.file_size {
            return Err(UploadError::SourceMismatch {
                expected: record.file_size,
                actual: metadata.len(),
            });
        }

        self.begin_uploading(record).await
    }

    /// 取消先清本地，远端删除放到后台尽力而为，绝不挡住命令循环
    async fn cancel_upload(&mut self, upload_id: UploadId) -> Result<()> {
        let record = self
            .ledger
            .get(upload_id)
            .await?
            .ok_or(UploadError::UnknownUpload(upload_id))?;

        if let Some(inflight) = self.inflight.remove(&upload_id) {
            inflight.cancellation_token.cancel();
        }

        self.ledger.delete(upload_id).await?;
        let _ = self.event_tx.send(UploadEvent::Removed { upload_id });

        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(err) = endpoint.cancel_upload(upload_id, &record.file_name).await {
                warn!(%upload_id, error = %err, "remote cancel failed");
            }
        });

        Ok(())
    }

    /// 置为 Uploading 并启动该上传的分块循环
    async fn begin_uploading(&mut self, mut record: UploadRecord) -> Result<()> {
        let upload_id = record.upload_id;
        let old_status = record.status;

        record.status = UploadStatus::Uploading;
        record.error = None;
        record.updated_at = Utc::now();
        self.ledger.save(&record).await?;
        self.emit_state_change(upload_id, old_status, UploadStatus::Uploading);

        let cancellation_token = CancellationToken::new();
        let chunk_loop = ChunkLoop {
            upload_id,
            ledger: self.ledger.clone(),
            transport: self.transport.clone(),
            finalizer: self.finalizer.clone(),
            chunk_size: self.config.chunk_size,
            token: cancellation_token.clone(),
            loop_tx: self.loop_tx.clone(),
        };

        let join_handle = tokio::spawn(chunk_loop.run());

        self.inflight.insert(upload_id, InflightUpload {
            cancellation_token,
            join_handle,
        });

        Ok(())
    }

    fn emit_state_change(&self, upload_id: UploadId, old_status: UploadStatus, new_status: UploadStatus) {
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            upload_id,
            old_status,
            new_status,
        });
    }
}

/// 单个上传的分块循环。只读台账和文件，进展一律发消息回
/// 工作任务入账
struct ChunkLoop {
    upload_id: UploadId,
    ledger: Arc<dyn Ledger>,
    transport: ChunkTransport,
    finalizer: Arc<Finalizer>,
    chunk_size: u64,
    token: CancellationToken,
    loop_tx: mpsc::UnboundedSender<LoopMessage>,
}

impl ChunkLoop {
    async fn run(self) {
        match self.drive().await {
            Ok(Some(attachment)) => {
                let _ = self.loop_tx.send(LoopMessage::Finished {
                    upload_id: self.upload_id,
                    attachment,
                });
            }
            // 暂停把状态落成 Paused、取消删了记录，这里安静退出
            Ok(None) => {}
            Err(err) if err.is_cancelled() => {
                debug!(upload_id = %self.upload_id, "chunk loop cancelled");
            }
            Err(err) => {
                let _ = self.loop_tx.send(LoopMessage::Failed {
                    upload_id: self.upload_id,
                    error: err.to_string(),
                });
            }
        }

        let _ = self.loop_tx.send(LoopMessage::Exited {
            upload_id: self.upload_id,
        });
    }

    /// 从落账游标串行推进到最后一块，然后调远端 complete。
    /// 游标在本循环内单调递增，重传只可能发生在确认丢失时
    async fn drive(&self) -> Result<Option<AttachmentInfo>> {
        let Some(record) = self.ledger.get(self.upload_id).await? else {
            return Ok(None);
        };
        if record.status != UploadStatus::Uploading {
            return Ok(None);
        }

        // 句柄不持久化：每次启动循环都按路径重新打开并校验长度
        let mut file = tokio::fs::File::open(&record.file_path).await?;
        let actual = file.metadata().await?.len();
        if actual != record.file_size {
            return Err(UploadError::SourceMismatch {
                expected: record.file_size,
                actual,
            });
        }

        let mut cursor = record.uploaded_chunks;
        while cursor < record.total_chunks {
            // 每轮重读状态；暂停写成 Paused 后循环就此收手
            let Some(current) = self.ledger.get(self.upload_id).await? else {
                return Ok(None);
            };
            if current.status != UploadStatus::Uploading {
                return Ok(None);
            }
            if self.token.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let range = planner::chunk_range(cursor, record.file_size, self.chunk_size);
            let mut buffer = vec![0u8; (range.end - range.start) as usize];
            file.seek(SeekFrom::Start(range.start)).await?;
            file.read_exact(&mut buffer).await?;

            self.transport
                .transfer(
                    self.upload_id,
                    &record.file_name,
                    cursor,
                    record.total_chunks,
                    buffer.into(),
                    &self.token,
                )
                .await?;

            let _ = self.loop_tx.send(LoopMessage::ChunkAcked {
                upload_id: self.upload_id,
                acked_index: cursor,
            });
            cursor += 1;
        }

        // 游标到头且仍为 Uploading 才收尾（0 块文件直接走到这里）
        let Some(mut current) = self.ledger.get(self.upload_id).await? else {
            return Ok(None);
        };
        if current.status != UploadStatus::Uploading {
            return Ok(None);
        }
        if self.token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        // 入账可能还在路上，complete 按本循环的游标报数
        current.uploaded_chunks = cursor;
        let attachment = self.finalizer.complete(&current).await?;
        Ok(Some(attachment))
    }
}
