//! 端到端生命周期测试：脚本化的模拟端点 + 内存台账

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use cardlift::{
    AttachmentInfo, Ledger, MemoryLedger, Orchestrator, OrchestratorHandle, Result,
    UploadConfig, UploadEndpoint, UploadError, UploadEvent, UploadId, UploadRecord,
    UploadStatus,
};

/// 可编排故障的模拟端点
struct MockEndpoint {
    /// 每次 submit 的虚拟网络耗时
    delay: Duration,
    /// 这个下标的块永远失败
    fail_chunk: Option<u64>,
    /// 前多少次 complete 调用失败
    fail_completes: AtomicU32,
    /// 远端取消的虚拟耗时
    cancel_delay: Duration,
    /// 每次 submit 尝试（含失败与被取消前已进入的）
    attempts: Mutex<Vec<u64>>,
    /// 已确认的 (下标, 字节数)
    acks: Mutex<Vec<(u64, usize)>>,
    completes: AtomicU32,
    cancels: AtomicU32,
}

impl MockEndpoint {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_chunk: None,
            fail_completes: AtomicU32::new(0),
            cancel_delay: Duration::ZERO,
            attempts: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            completes: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
        }
    }

    fn failing_chunk(mut self, chunk_index: u64) -> Self {
        self.fail_chunk = Some(chunk_index);
        self
    }

    fn failing_completes(self, count: u32) -> Self {
        self.fail_completes.store(count, Ordering::SeqCst);
        self
    }

    fn slow_cancel(mut self, delay: Duration) -> Self {
        self.cancel_delay = delay;
        self
    }

    fn acked_indices(&self) -> Vec<u64> {
        self.acks.lock().unwrap().iter().map(|(index, _)| *index).collect()
    }

    fn attempts_for(&self, chunk_index: u64) -> usize {
        self.attempts.lock().unwrap().iter().filter(|i| **i == chunk_index).count()
    }
}

#[async_trait]
impl UploadEndpoint for MockEndpoint {
    async fn submit_chunk(
        &self,
        _upload_id: UploadId,
        _file_name: &str,
        chunk_index: u64,
        _total_chunks: u64,
        bytes: Bytes,
    ) -> Result<()> {
        self.attempts.lock().unwrap().push(chunk_index);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.fail_chunk == Some(chunk_index) {
            return Err(UploadError::server_error(500, "injected failure"));
        }

        self.acks.lock().unwrap().push((chunk_index, bytes.len()));
        Ok(())
    }

    async fn complete_upload(
        &self,
        upload_id: UploadId,
        file_name: &str,
        _file_size: u64,
        _card_id: &str,
    ) -> Result<AttachmentInfo> {
        self.completes.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_completes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_completes.store(remaining - 1, Ordering::SeqCst);
            return Err(UploadError::server_error(500, "complete rejected"));
        }

        Ok(AttachmentInfo {
            id: format!("att-{}", upload_id),
            file_name: file_name.to_string(),
            url: None,
        })
    }

    async fn cancel_upload(&self, _upload_id: UploadId, _file_name: &str) -> Result<()> {
        if !self.cancel_delay.is_zero() {
            tokio::time::sleep(self.cancel_delay).await;
        }
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 游标入账的 save 额外拖一段时间，拉开写与后续命令的间隔
struct SlowCursorLedger {
    inner: MemoryLedger,
    delay: Duration,
}

impl SlowCursorLedger {
    fn new(delay: Duration) -> Self {
        Self { inner: MemoryLedger::new(), delay }
    }
}

#[async_trait]
impl Ledger for SlowCursorLedger {
    async fn save(&self, record: &UploadRecord) -> Result<()> {
        if record.status == UploadStatus::Uploading && record.uploaded_chunks > 0 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.save(record).await
    }

    async fn get(&self, upload_id: UploadId) -> Result<Option<UploadRecord>> {
        self.inner.get(upload_id).await
    }

    async fn get_all(&self) -> Result<Vec<UploadRecord>> {
        self.inner.get_all().await
    }

    async fn delete(&self, upload_id: UploadId) -> Result<()> {
        self.inner.delete(upload_id).await
    }
}

/// 读操作一律报错的台账
struct BrokenLedger;

#[async_trait]
impl Ledger for BrokenLedger {
    async fn save(&self, _record: &UploadRecord) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _upload_id: UploadId) -> Result<Option<UploadRecord>> {
        Err(UploadError::internal_error("ledger offline"))
    }

    async fn get_all(&self) -> Result<Vec<UploadRecord>> {
        Err(UploadError::internal_error("ledger offline"))
    }

    async fn delete(&self, _upload_id: UploadId) -> Result<()> {
        Ok(())
    }
}

struct Fixture {
    endpoint: Arc<MockEndpoint>,
    orchestrator: Orchestrator,
    handle: Option<OrchestratorHandle>,
    _dir: tempfile::TempDir,
}

impl Fixture {
    fn new(endpoint: MockEndpoint, chunk_size: u64) -> Self {
        Self::with_ledger(endpoint, Arc::new(MemoryLedger::new()), chunk_size)
    }

    fn with_ledger(endpoint: MockEndpoint, ledger: Arc<dyn Ledger>, chunk_size: u64) -> Self {
        let endpoint = Arc::new(endpoint);
        let config = UploadConfig {
            chunk_size,
            cleanup_grace: Duration::from_secs(3),
            ..Default::default()
        };
        let handle = Orchestrator::new(endpoint.clone(), ledger, config);
        let orchestrator = handle.orchestrator.clone();

        Self {
            endpoint,
            orchestrator,
            handle: Some(handle),
            _dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write_file(&self, name: &str, len: usize) -> PathBuf {
        let path = self._dir.path().join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn shutdown(mut self) {
        self.handle.take().unwrap().shutdown().await.unwrap();
    }
}

/// 等到匹配的事件出现为止
async fn wait_for<F>(events: &mut broadcast::Receiver<UploadEvent>, mut matches: F) -> UploadEvent
where
    F: FnMut(&UploadEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// 场景 1：2.5 MiB 文件按 1 MiB 分 3 块，末块半满
#[tokio::test(start_paused = true)]
async fn test_happy_path_two_and_a_half_chunks() {
    const MIB: usize = 1024 * 1024;
    let fixture = Fixture::new(MockEndpoint::new(Duration::from_millis(50)), MIB as u64);
    let path = fixture.write_file("big.bin", 2 * MIB + MIB / 2);

    let mut events = fixture.orchestrator.subscribe_events();
    let upload_id = fixture.orchestrator.start(&path, "card-1").await.unwrap();

    let record = fixture.orchestrator.record(upload_id).await.unwrap().unwrap();
    assert_eq!(record.total_chunks, 3);

    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;

    let acks = fixture.endpoint.acks.lock().unwrap().clone();
    assert_eq!(acks, vec![(0, MIB), (1, MIB), (2, MIB / 2)]);
    assert_eq!(fixture.endpoint.completes.load(Ordering::SeqCst), 1);

    let progress = fixture.orchestrator.progress(upload_id).await.unwrap().unwrap();
    assert_eq!(progress.status, UploadStatus::Completed);
    assert_eq!(progress.uploaded_bytes, 2 * MIB as u64 + MIB as u64 / 2);
    assert_eq!(progress.percentage, 100.0);

    fixture.shutdown().await;
}

// 场景 2：第 0 块确认后暂停，恢复后只发 1、2 两块
#[tokio::test(start_paused = true)]
async fn test_pause_resumes_from_cursor() {
    let fixture = Fixture::new(MockEndpoint::new(Duration::from_millis(100)), 4);
    let path = fixture.write_file("three.bin", 12);

    let mut events = fixture.orchestrator.subscribe_events();
    let upload_id = fixture.orchestrator.start(&path, "card-2").await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, UploadEvent::Progress { uploaded_chunks: 1, .. })
    })
    .await;

    fixture.orchestrator.pause(upload_id).await.unwrap();

    let record = fixture.orchestrator.record(upload_id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Paused);
    assert_eq!(record.uploaded_chunks, 1);

    // 暂停期间不占网络：不再产生新的尝试
    let attempts_at_pause = fixture.endpoint.attempts.lock().unwrap().len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fixture.endpoint.attempts.lock().unwrap().len(), attempts_at_pause);

    fixture.orchestrator.resume(upload_id).await.unwrap();
    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;

    // 第 0 块只被发送过一次，确认序列覆盖 0..3
    assert_eq!(fixture.endpoint.attempts_for(0), 1);
    assert_eq!(fixture.endpoint.acked_indices(), vec![0, 1, 2]);

    fixture.shutdown().await;
}

// 场景 3：第 2 块（共 5 块）每次都失败，重试 3 次后整单失败
#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_marks_failed() {
    let fixture = Fixture::new(
        MockEndpoint::new(Duration::from_millis(10)).failing_chunk(2),
        4,
    );
    let path = fixture.write_file("five.bin", 20);

    let mut events = fixture.orchestrator.subscribe_events();
    let upload_id = fixture.orchestrator.start(&path, "card-3").await.unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, UploadEvent::Failed { .. })).await;
    let UploadEvent::Failed { error, .. } = failed else { unreachable!() };
    assert!(error.contains("Chunk 2"), "error should name the chunk: {error}");

    let record = fixture.orchestrator.record(upload_id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Failed);
    // 前两块的确认保持入账
    assert_eq!(record.uploaded_chunks, 2);
    assert!(record.error.is_some());

    assert_eq!(fixture.endpoint.attempts_for(2), 3);
    assert_eq!(fixture.endpoint.acked_indices(), vec![0, 1]);
    assert_eq!(fixture.endpoint.completes.load(Ordering::SeqCst), 0);

    fixture.shutdown().await;
}

// 取消后台账记录无条件消失
#[tokio::test(start_paused = true)]
async fn test_cancel_removes_record() {
    let fixture = Fixture::new(MockEndpoint::new(Duration::from_millis(100)), 4);
    let path = fixture.write_file("cancel.bin", 12);

    let mut events = fixture.orchestrator.subscribe_events();
    let upload_id = fixture.orchestrator.start(&path, "card-4").await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, UploadEvent::Progress { uploaded_chunks: 1, .. })
    })
    .await;

    fixture.orchestrator.cancel(upload_id).await.unwrap();

    assert!(fixture.orchestrator.record(upload_id).await.unwrap().is_none());

    // 远端取消在后台跑，稍等片刻再看计数
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fixture.endpoint.cancels.load(Ordering::SeqCst), 1);

    // 取消后的暂停/恢复都报 LedgerMiss
    let err = fixture.orchestrator.pause(upload_id).await.unwrap_err();
    assert!(matches!(err, UploadError::UnknownUpload(_)));

    fixture.shutdown().await;
}

// 场景 4：分块全部确认但 complete 失败一次；显式恢复后补完收尾
#[tokio::test(start_paused = true)]
async fn test_finalize_failure_then_explicit_retry() {
    let fixture = Fixture::new(
        MockEndpoint::new(Duration::from_millis(10)).failing_completes(1),
        4,
    );
    let path = fixture.write_file("fin.bin", 8);

    let mut events = fixture.orchestrator.subscribe_events();
    let upload_id = fixture.orchestrator.start(&path, "card-5").await.unwrap();

    wait_for(&mut events, |e| matches!(e, UploadEvent::Failed { .. })).await;

    let record = fixture.orchestrator.record(upload_id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Failed);
    assert_eq!(record.uploaded_chunks, record.total_chunks);

    // 恢复时游标已到头，直接重试 finalize，不再发任何块
    let attempts_before = fixture.endpoint.attempts.lock().unwrap().len();
    fixture.orchestrator.resume(upload_id).await.unwrap();
    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;

    assert_eq!(fixture.endpoint.attempts.lock().unwrap().len(), attempts_before);
    assert_eq!(fixture.endpoint.completes.load(Ordering::SeqCst), 2);

    // 宽限期过后记录被清理
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(fixture.orchestrator.record(upload_id).await.unwrap().is_none());

    fixture.shutdown().await;
}

// 空文件：0 块，不发任何 submit，直接收尾
#[tokio::test(start_paused = true)]
async fn test_zero_byte_file_finalizes_immediately() {
    let fixture = Fixture::new(MockEndpoint::new(Duration::ZERO), 4);
    let path = fixture.write_file("empty.bin", 0);

    let mut events = fixture.orchestrator.subscribe_events();
    let upload_id = fixture.orchestrator.start(&path, "card-6").await.unwrap();

    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;

    assert!(fixture.endpoint.attempts.lock().unwrap().is_empty());
    assert_eq!(fixture.endpoint.completes.load(Ordering::SeqCst), 1);

    let progress = fixture.orchestrator.progress(upload_id).await.unwrap().unwrap();
    assert_eq!(progress.percentage, 100.0);

    fixture.shutdown().await;
}

// 未知 ID：不改任何状态，直接报 UnknownUpload
#[tokio::test]
async fn test_unknown_upload_id() {
    let fixture = Fixture::new(MockEndpoint::new(Duration::ZERO), 4);
    let bogus = UploadId::new();

    for result in [
        fixture.orchestrator.pause(bogus).await,
        fixture.orchestrator.resume(bogus).await,
        fixture.orchestrator.cancel(bogus).await,
    ] {
        assert!(matches!(result.unwrap_err(), UploadError::UnknownUpload(_)));
    }

    assert!(fixture.orchestrator.progress(bogus).await.unwrap().is_none());

    fixture.shutdown().await;
}

// 源文件在暂停期间被改动，恢复必须拒绝且不改状态
#[tokio::test(start_paused = true)]
async fn test_resume_rejects_changed_source() {
    let fixture = Fixture::new(MockEndpoint::new(Duration::from_millis(100)), 4);
    let path = fixture.write_file("mutate.bin", 12);

    let mut events = fixture.orchestrator.subscribe_events();
    let upload_id = fixture.orchestrator.start(&path, "card-7").await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, UploadEvent::Progress { uploaded_chunks: 1, .. })
    })
    .await;
    fixture.orchestrator.pause(upload_id).await.unwrap();

    // 文件长度变了
    std::fs::write(&path, b"short").unwrap();

    let err = fixture.orchestrator.resume(upload_id).await.unwrap_err();
    assert!(matches!(err, UploadError::SourceMismatch { expected: 12, actual: 5 }));

    let record = fixture.orchestrator.record(upload_id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Paused);
    assert_eq!(record.uploaded_chunks, 1);

    fixture.shutdown().await;
}

// 还有活着的 Orchestrator 克隆时 shutdown 也必须正常返回
#[tokio::test(start_paused = true)]
async fn test_shutdown_with_live_clone() {
    let mut fixture = Fixture::new(MockEndpoint::new(Duration::ZERO), 4);
    let survivor = fixture.orchestrator.clone();

    let handle = fixture.handle.take().unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("shutdown must not hang while clones are alive")
        .unwrap();

    // 工作任务已退出，克隆上的命令报 Shutdown
    let err = survivor.records().await.unwrap_err();
    assert!(matches!(err, UploadError::Shutdown));
}

// 暂停命令落在游标入账写到一半的时候：入账照常，但暂停
// 绝不能被迟到的写覆盖回 Uploading
#[tokio::test(start_paused = true)]
async fn test_pause_survives_inflight_cursor_write() {
    let ledger = Arc::new(SlowCursorLedger::new(Duration::from_millis(100)));
    let fixture = Fixture::with_ledger(MockEndpoint::new(Duration::from_millis(100)), ledger, 4);
    let path = fixture.write_file("slow.bin", 12);

    let mut events = fixture.orchestrator.subscribe_events();
    let upload_id = fixture.orchestrator.start(&path, "card-8").await.unwrap();

    // 第 0 块 100ms 拿到确认，入账的 save 再拖 100ms；
    // 150ms 时发暂停，正好撞进这次写的中间
    tokio::time::sleep(Duration::from_millis(150)).await;
    fixture.orchestrator.pause(upload_id).await.unwrap();

    let record = fixture.orchestrator.record(upload_id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Paused);
    assert!(record.uploaded_chunks >= 1);

    // 静置一段时间，状态必须保持 Paused，游标不回退
    let cursor_at_pause = record.uploaded_chunks;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let record = fixture.orchestrator.record(upload_id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Paused);
    assert!(record.uploaded_chunks >= cursor_at_pause);

    fixture.orchestrator.resume(upload_id).await.unwrap();
    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;

    // 第 0 块已确认入账，恢复后不会重发
    assert_eq!(fixture.endpoint.attempts_for(0), 1);
    assert_eq!(fixture.endpoint.completes.load(Ordering::SeqCst), 1);

    fixture.shutdown().await;
}

// 取消删掉的记录不能被迟到的游标入账复活
#[tokio::test(start_paused = true)]
async fn test_cancel_survives_inflight_cursor_write() {
    let ledger = Arc::new(SlowCursorLedger::new(Duration::from_millis(100)));
    let fixture = Fixture::with_ledger(MockEndpoint::new(Duration::from_millis(100)), ledger, 4);
    let path = fixture.write_file("slowcancel.bin", 12);

    let upload_id = fixture.orchestrator.start(&path, "card-9").await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    fixture.orchestrator.cancel(upload_id).await.unwrap();
    assert!(fixture.orchestrator.record(upload_id).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fixture.orchestrator.record(upload_id).await.unwrap().is_none());
    assert!(fixture.orchestrator.records().await.unwrap().is_empty());

    fixture.shutdown().await;
}

// 远端取消再慢也不能挡住取消本身和后续命令
#[tokio::test(start_paused = true)]
async fn test_cancel_does_not_block_on_remote() {
    let fixture = Fixture::new(
        MockEndpoint::new(Duration::from_millis(100)).slow_cancel(Duration::from_secs(3600)),
        4,
    );
    let path = fixture.write_file("stuck.bin", 12);

    let upload_id = fixture.orchestrator.start(&path, "card-10").await.unwrap();

    let started = tokio::time::Instant::now();
    fixture.orchestrator.cancel(upload_id).await.unwrap();
    assert!(fixture.orchestrator.record(upload_id).await.unwrap().is_none());
    assert!(
        started.elapsed() < Duration::from_secs(60),
        "cancel must not wait for the remote call"
    );

    fixture.shutdown().await;
}

// 台账读失败时查询退化为"未知"，不影响工作任务
#[tokio::test]
async fn test_query_with_failing_ledger_degrades() {
    let fixture = Fixture::with_ledger(MockEndpoint::new(Duration::ZERO), Arc::new(BrokenLedger), 4);
    let bogus = UploadId::new();

    assert!(fixture.orchestrator.progress(bogus).await.unwrap().is_none());
    assert!(fixture.orchestrator.record(bogus).await.unwrap().is_none());
    assert!(fixture.orchestrator.records().await.unwrap().is_empty());

    fixture.shutdown().await;
}

// 多个上传并行推进，互不影响
#[tokio::test(start_paused = true)]
async fn test_concurrent_uploads() {
    let fixture = Fixture::new(MockEndpoint::new(Duration::from_millis(20)), 4);

    let mut events = fixture.orchestrator.subscribe_events();
    let mut ids = Vec::new();
    for i in 0..3 {
        let path = fixture.write_file(&format!("multi_{i}.bin"), 8 + i * 4);
        ids.push(fixture.orchestrator.start(&path, format!("card-{i}")).await.unwrap());
    }

    let mut completed = std::collections::HashSet::new();
    while completed.len() < 3 {
        if let UploadEvent::Completed { upload_id, .. } =
            wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await
        {
            completed.insert(upload_id);
        }
    }

    for upload_id in ids {
        assert!(completed.contains(&upload_id));
    }
    assert_eq!(fixture.endpoint.completes.load(Ordering::SeqCst), 3);

    fixture.shutdown().await;
}
