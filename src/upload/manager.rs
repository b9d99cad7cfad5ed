use std::sync::Arc;
use tokio::sync::{oneshot, mpsc, broadcast};
use tokio::task::JoinHandle;
use super::channel::{NotificationSink, StatusOracle, TracingNotificationSink, TransferChannel};
use super::errors::{Result, UploadError};
use super::manager_worker::UploadManagerWorker;
use super::task::UploadTask;
use super::types::{
    EnqueueOutcome, ManagerCommand, MetadataUpdate, Payload, TaskId, UploadEvent, UploadPolicy,
    UploadSummary, UploadTimings,
};

#[derive(Clone)]
pub struct UploadManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
}

/// 上传管理器句柄 - 包含管理器和工作线程
pub struct UploadManagerHandle {
    pub manager: UploadManager,
    pub worker_handle: JoinHandle<()>,
}

impl UploadManagerHandle {
    /// Stops the worker once no other clone of the manager is alive.
    /// In-flight attempts are cancelled.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.manager);
        self.worker_handle.await
            .map_err(|err| UploadError::internal_error(format!("Worker panic: {}", err)))
    }
}

pub struct UploadManagerBuilder {
    channel: Arc<dyn TransferChannel>,
    oracle: Arc<dyn StatusOracle>,
    notifier: Arc<dyn NotificationSink>,
    timings: UploadTimings,
    command_buffer: usize,
    event_capacity: usize,
}

impl UploadManagerBuilder {
    /// Fails with [`UploadError::InvalidTimings`] for zero durations or a zero transfer limit.
    pub fn timings(mut self, timings: UploadTimings) -> Result<Self> {
        timings.validate().map_err(UploadError::InvalidTimings)?;
        self.timings = timings;
        Ok(self)
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// 事件缓存数量, 订阅者跟不上时会丢失旧事件
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn spawn(self) -> UploadManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(self.command_buffer);
        let (event_tx, _) = broadcast::channel(self.event_capacity);

        let worker_handle = tokio::spawn(UploadManagerWorker::run(
            self.channel,
            self.oracle,
            self.notifier,
            self.timings,
            command_rx,
            event_tx.clone(),
        ));

        let manager = UploadManager {
            command_tx,
            event_tx,
        };

        UploadManagerHandle {
            manager,
            worker_handle,
        }
    }
}

impl UploadManager {
    pub fn builder(channel: Arc<dyn TransferChannel>, oracle: Arc<dyn StatusOracle>) -> UploadManagerBuilder {
        UploadManagerBuilder {
            channel,
            oracle,
            notifier: Arc::new(TracingNotificationSink),
            timings: UploadTimings::default(),
            command_buffer: 100,
            // 最大缓存 256 个事件
            event_capacity: 256,
        }
    }

    /// Spawn with default timings and a logging notification sink.
    pub fn new(channel: Arc<dyn TransferChannel>, oracle: Arc<dyn StatusOracle>) -> UploadManagerHandle {
        Self::builder(channel, oracle).spawn()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| UploadError::ManagerShutdown)?;

        // 等待响应
        reply_rx
            .await
            .map_err(|_| UploadError::ManagerShutdown)
    }

    /// Validate and queue files.
    ///
    /// The whole batch fails only when it would exceed `max_file_count`;
    /// otherwise every file is accepted or rejected on its own.
    pub async fn enqueue(&self, files: Vec<Payload>, policy: UploadPolicy) -> Result<EnqueueOutcome> {
        self.request(|reply| ManagerCommand::Enqueue { files, policy, reply }).await?
    }

    /// Start every pending task. Returns the ids that were started.
    pub async fn start_all(&self) -> Result<Vec<TaskId>> {
        self.request(|reply| ManagerCommand::StartAll { reply }).await
    }

    /// Remove a task that is not uploading or processing.
    pub async fn remove(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Remove { task_id, reply }).await?
    }

    /// Same as [`remove`](Self::remove).
    pub async fn cancel_removal(&self, task_id: TaskId) -> Result<()> {
        self.remove(task_id).await
    }

    /// Remove every task that is not in flight. Returns how many were removed.
    pub async fn clear_all(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::ClearAll { reply }).await
    }

    pub async fn update_metadata(&self, task_id: TaskId, update: MetadataUpdate) -> Result<()> {
        self.request(|reply| ManagerCommand::UpdateMetadata { task_id, update, reply }).await?
    }

    /// Stop an uploading or processing task; it ends in `Error("cancelled")`.
    pub async fn abort(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Abort { task_id, reply }).await?
    }

    /// Re-validate a failed task and upload it again from scratch.
    pub async fn retry(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Retry { task_id, reply }).await?
    }

    /// Get task
    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<UploadTask>> {
        self.request(|reply| ManagerCommand::GetTask { task_id, reply }).await
    }

    /// Get all tasks, in submission order
    pub async fn get_all_tasks(&self) -> Result<Vec<UploadTask>> {
        self.request(|reply| ManagerCommand::GetAllTasks { reply }).await
    }

    pub async fn summary(&self) -> Result<UploadSummary> {
        self.request(|reply| ManagerCommand::Summary { reply }).await
    }

    /// 订阅事件
    ///
    /// 注意：
    /// - 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    /// - 每个订阅者都会收到完整的事件副本
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F> {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter
        }
    }
}

/// 过滤的事件接收器
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}
