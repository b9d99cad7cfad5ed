use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use super::channel::{Notice, NoticeLevel, NotificationSink, StatusOracle, TransferChannel};
use super::errors::{
    FailureKind, Result, TaskFailure, UploadError, ValidationError, ValidationReason,
};
use super::policy::{check_capacity, validate_file};
use super::task::UploadTask;
use super::types::{
    EnqueueOutcome, ManagerCommand, MetadataUpdate, Payload, TaskId, UploadEvent, UploadPolicy,
    UploadState, UploadSummary, UploadTimings, VideoMetadata,
};
use super::worker::{TaskUpdate, UpdateKind, UploadWorker};

struct TaskHandle {
    task: UploadTask,
    /// 入队时使用的策略, 重试时重新校验
    policy: Arc<UploadPolicy>,
    /// 占用一个上传并发名额
    holds_slot: bool,
    cancellation_token: Option<CancellationToken>,
}

impl TaskHandle {
    /// Cancelling is a no-op for a worker that already returned.
    fn release_attempt(&mut self) {
        if let Some(token) = self.cancellation_token.take() {
            token.cancel();
        }
    }
}

/// Owns every task. All state transitions happen here, one message at a time.
pub struct UploadManagerWorker {
    channel: Arc<dyn TransferChannel>,
    oracle: Arc<dyn StatusOracle>,
    notifier: Arc<dyn NotificationSink>,
    timings: UploadTimings,
    tasks: HashMap<TaskId, TaskHandle>,
    /// 提交顺序
    order: Vec<TaskId>,
    /// Uploading tasks waiting for a free transfer slot
    waiting: VecDeque<TaskId>,
    active_transfers: usize,

    event_tx: broadcast::Sender<UploadEvent>,
    update_tx: mpsc::UnboundedSender<TaskUpdate>,
}

impl UploadManagerWorker {
    pub(crate) async fn run(
        channel: Arc<dyn TransferChannel>,
        oracle: Arc<dyn StatusOracle>,
        notifier: Arc<dyn NotificationSink>,
        timings: UploadTimings,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let mut worker = Self {
            channel,
            oracle,
            notifier,
            timings,
            tasks: HashMap::new(),
            order: Vec::new(),
            waiting: VecDeque::new(),
            active_transfers: 0,
            event_tx,
            update_tx,
        };

        // 主事件循环, 循环等待命令和任务回报
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => worker.handle_command(command),
                    None => break,
                },
                Some(update) = update_rx.recv() => {
                    worker.handle_update(update);
                }
            }

            worker.process_queue();
        }

        worker.shutdown();
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Enqueue { files, policy, reply } => {
                let _ = reply.send(self.enqueue(files, policy));
            }
            ManagerCommand::StartAll { reply } => {
                let _ = reply.send(self.start_all());
            }
            ManagerCommand::Remove { task_id, reply } => {
                let _ = reply.send(self.remove(task_id));
            }
            ManagerCommand::ClearAll { reply } => {
                let _ = reply.send(self.clear_all());
            }
            ManagerCommand::UpdateMetadata { task_id, update, reply } => {
                let _ = reply.send(self.update_metadata(task_id, update));
            }
            ManagerCommand::Abort { task_id, reply } => {
                let _ = reply.send(self.abort(task_id));
            }
            ManagerCommand::Retry { task_id, reply } => {
                let _ = reply.send(self.retry(task_id));
            }
            ManagerCommand::GetTask { task_id, reply } => {
                let task = self.tasks
                    .get(&task_id)
                    .map(|handle| handle.task.clone());
                let _ = reply.send(task);
            }
            ManagerCommand::GetAllTasks { reply } => {
                let tasks = self.order
                    .iter()
                    .filter_map(|id| self.tasks.get(id))
                    .map(|handle| handle.task.clone())
                    .collect();
                let _ = reply.send(tasks);
            }
            ManagerCommand::Summary { reply } => {
                let _ = reply.send(self.summary());
            }
        }
    }

    fn enqueue(&mut self, files: Vec<Payload>, policy: UploadPolicy) -> Result<EnqueueOutcome> {
        if let Err(err) = check_capacity(self.order.len(), files.len(), &policy) {
            warn!(error = %err, "batch rejected");
            self.notifier.notify(Notice::new(NoticeLevel::Warning, "Too many files", err.reason.to_string()));
            return Err(err.into());
        }

        let policy = Arc::new(policy);
        let mut outcome = EnqueueOutcome::default();

        for payload in files {
            if let Err(err) = validate_file(&payload, &policy) {
                info!(error = %err, "file rejected");
                self.notifier.notify(Notice::new(NoticeLevel::Warning, "File rejected", err.to_string()));
                outcome.rejected.push(err);
                continue;
            }

            let metadata = VideoMetadata::for_file_name(&payload.file_name);
            let task = UploadTask::new(payload, metadata);
            let task_id = task.id;
            debug!(%task_id, file = %task.payload.file_name, size = task.payload.size, "task queued");

            self.tasks.insert(task_id, TaskHandle {
                task,
                policy: policy.clone(),
                holds_slot: false,
                cancellation_token: None,
            });
            self.order.push(task_id);
            outcome.accepted.push(task_id);
            let _ = self.event_tx.send(UploadEvent::TaskAdded { task_id });
        }

        Ok(outcome)
    }

    fn start_all(&mut self) -> Vec<TaskId> {
        let pending: Vec<_> = self.order
            .iter()
            .copied()
            .filter(|id| self.tasks.get(id).is_some_and(|h| h.task.state == UploadState::Pending))
            .collect();

        for task_id in &pending {
            self.start_task(*task_id);
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "uploads started");
        }
        pending
    }

    /// Pending -> Uploading. The transfer launches now or once a slot frees up.
    fn start_task(&mut self, task_id: TaskId) {
        let Some(handle) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if !handle.task.begin_attempt() {
            return;
        }

        self.emit_state_change(task_id, UploadState::Pending, UploadState::Uploading);
        if self.has_free_slot() {
            self.launch(task_id);
        } else {
            debug!(%task_id, "waiting for a transfer slot");
            self.waiting.push_back(task_id);
        }
    }

    fn has_free_slot(&self) -> bool {
        self.timings
            .max_concurrent_transfers
            .is_none_or(|max| self.active_transfers < max)
    }

    fn process_queue(&mut self) {
        while self.has_free_slot() {
            let Some(task_id) = self.waiting.pop_front() else {
                break;
            };

            let ready = self.tasks
                .get(&task_id)
                .is_some_and(|h| h.task.state == UploadState::Uploading && h.cancellation_token.is_none());
            if ready {
                self.launch(task_id);
            }
        }
    }

    fn launch(&mut self, task_id: TaskId) {
        let Some(handle) = self.tasks.get_mut(&task_id) else {
            return;
        };

        // 每次尝试一个取消令牌, 传输和轮询共用
        let cancellation_token = CancellationToken::new();
        let worker = UploadWorker {
            task_id,
            attempt: handle.task.attempts,
            channel: self.channel.clone(),
            oracle: self.oracle.clone(),
            timings: self.timings.clone(),
            cancellation_token: cancellation_token.clone(),
            updates: self.update_tx.clone(),
        };

        let payload = handle.task.payload.clone();
        let metadata = handle.task.metadata.clone();
        // 监督任务在 worker panic 时回报失败
        worker.spawn(payload, metadata);
        handle.cancellation_token = Some(cancellation_token);
        handle.holds_slot = true;
        self.active_transfers += 1;
    }

    fn handle_update(&mut self, update: TaskUpdate) {
        let TaskUpdate { task_id, attempt, kind } = update;
        let Some(handle) = self.tasks.get_mut(&task_id) else {
            debug!(%task_id, "update for removed task dropped");
            return;
        };

        if handle.task.attempts != attempt || handle.cancellation_token.is_none() {
            debug!(%task_id, attempt, "update from a stale attempt dropped");
            return;
        }

        match kind {
            UpdateKind::Progress(percent) => {
                if let Some(percent) = handle.task.apply_progress(percent) {
                    let _ = self.event_tx.send(UploadEvent::Progress { task_id, percent });
                }
            }
            UpdateKind::Accepted(remote_id) => {
                let previous = handle.task.progress;
                if !handle.task.accept(remote_id) {
                    return;
                }
                if handle.holds_slot {
                    handle.holds_slot = false;
                    self.active_transfers -= 1;
                }

                if previous != Some(100) {
                    let _ = self.event_tx.send(UploadEvent::Progress { task_id, percent: 100 });
                }
                self.emit_state_change(task_id, UploadState::Uploading, UploadState::Processing);
            }
            UpdateKind::Completed => {
                if !handle.task.complete() {
                    return;
                }
                handle.release_attempt();

                let remote_id = handle.task.remote_id.clone().unwrap_or_default();
                let file_name = handle.task.payload.file_name.clone();
                info!(%task_id, %remote_id, "upload completed");

                self.emit_state_change(task_id, UploadState::Processing, UploadState::Completed);
                let _ = self.event_tx.send(UploadEvent::Completed { task_id, remote_id });
                self.notifier.notify(Notice::new(
                    NoticeLevel::Success,
                    "Upload complete",
                    format!("{} is ready", file_name),
                ));
                self.check_all_settled();
            }
            UpdateKind::Failed(failure) => {
                let old_state = handle.task.state;
                self.fail_task(task_id, old_state, failure);
            }
        }
    }

    /// Uploading | Processing -> Error, releasing the slot and the attempt.
    fn fail_task(&mut self, task_id: TaskId, old_state: UploadState, failure: TaskFailure) {
        let Some(handle) = self.tasks.get_mut(&task_id) else {
            return;
        };
        if !handle.task.fail(failure.clone()) {
            return;
        }

        handle.release_attempt();
        if handle.holds_slot {
            handle.holds_slot = false;
            self.active_transfers -= 1;
        }
        self.waiting.retain(|id| *id != task_id);
        let file_name = handle.task.payload.file_name.clone();

        self.emit_state_change(task_id, old_state, UploadState::Error);
        let _ = self.event_tx.send(UploadEvent::Failed { task_id, failure: failure.clone() });

        let level = match failure.kind {
            FailureKind::Cancelled => NoticeLevel::Info,
            _ => NoticeLevel::Error,
        };
        self.notifier.notify(Notice::new(level, "Upload failed", format!("{}: {}", file_name, failure)));
        self.check_all_settled();
    }

    fn remove(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.tasks.get(&task_id).ok_or(UploadError::NotFound(task_id))?;
        if handle.task.state.is_in_flight() {
            return Err(UploadError::invalid_state(task_id, handle.task.state, "remove"));
        }

        self.tasks.remove(&task_id);
        self.order.retain(|id| *id != task_id);
        self.waiting.retain(|id| *id != task_id);
        debug!(%task_id, "task removed");
        let _ = self.event_tx.send(UploadEvent::Removed { task_id });

        Ok(())
    }

    fn clear_all(&mut self) -> usize {
        let removable: Vec<_> = self.order
            .iter()
            .copied()
            .filter(|id| self.tasks.get(id).is_some_and(|h| !h.task.state.is_in_flight()))
            .collect();

        removable
            .into_iter()
            .filter(|task_id| self.remove(*task_id).is_ok())
            .count()
    }

    fn update_metadata(&mut self, task_id: TaskId, update: MetadataUpdate) -> Result<()> {
        let handle = self.tasks.get_mut(&task_id).ok_or(UploadError::NotFound(task_id))?;
        handle.task.update_metadata(update)?;

        let _ = self.event_tx.send(UploadEvent::MetadataUpdated { task_id });
        Ok(())
    }

    fn abort(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.tasks.get(&task_id).ok_or(UploadError::NotFound(task_id))?;
        let state = handle.task.state;
        if !state.is_in_flight() {
            return Err(UploadError::invalid_state(task_id, state, "abort"));
        }

        info!(%task_id, ?state, "aborting upload");
        self.fail_task(task_id, state, TaskFailure::cancelled());
        Ok(())
    }

    fn retry(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.tasks.get_mut(&task_id).ok_or(UploadError::NotFound(task_id))?;
        if handle.task.state != UploadState::Error {
            return Err(UploadError::invalid_state(task_id, handle.task.state, "retry"));
        }

        // 文件型负载可能在磁盘上被修改过, 重新读取大小后再校验
        let mut payload = handle.task.payload.clone();
        if let Err(err) = payload.refresh_size() {
            let message = err.to_string();
            return Err(ValidationError::new(&payload.file_name, ValidationReason::Unreadable { message }).into());
        }
        validate_file(&payload, &handle.policy)?;
        handle.task.payload = payload;
        handle.task.reset_for_retry();
        info!(%task_id, attempt = handle.task.attempts + 1, "retrying upload");

        self.emit_state_change(task_id, UploadState::Error, UploadState::Pending);
        self.start_task(task_id);
        Ok(())
    }

    fn summary(&self) -> UploadSummary {
        UploadSummary::from_tasks(self.tasks.values().map(|handle| &handle.task))
    }

    fn check_all_settled(&self) {
        if self.tasks.values().any(|handle| handle.task.state.is_in_flight()) {
            return;
        }

        let summary = self.summary();
        let _ = self.event_tx.send(UploadEvent::AllSettled {
            total: summary.total,
            completed: summary.completed,
            errored: summary.errored,
        });
    }

    fn emit_state_change(&self, task_id: TaskId, old_state: UploadState, new_state: UploadState) {
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            task_id,
            old_state,
            new_state,
        });
    }

    fn shutdown(&mut self) {
        let mut cancelled = 0;
        for handle in self.tasks.values_mut() {
            if handle.cancellation_token.is_some() {
                handle.release_attempt();
                cancelled += 1;
            }
        }
        info!(cancelled, "upload manager stopped");
    }
}
