use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use super::channel::{StatusOracle, TransferChannel, TransferEvent};
use super::errors::{FailureKind, TaskFailure};
use super::poller::StatusPoller;
use super::types::{Payload, TaskId, UploadTimings, VideoMetadata};

/// Message from an attempt back to the manager worker.
#[derive(Debug)]
pub(crate) struct TaskUpdate {
    pub task_id: TaskId,
    /// 用于丢弃已中止或已重试的旧尝试发来的消息
    pub attempt: u32,
    pub kind: UpdateKind,
}

#[derive(Debug)]
pub(crate) enum UpdateKind {
    Progress(f64),
    /// 传输已完成, 服务端分配了 remote id
    Accepted(String),
    Completed,
    Failed(TaskFailure),
}

/// Why an attempt stopped before reaching its goal.
#[derive(Debug)]
pub(crate) enum Stop {
    Failed(TaskFailure),
    Cancelled,
}

enum TransferTick {
    Event(Option<TransferEvent>),
    Cancelled,
    TimedOut,
}

/// Drives one attempt of one task: transfer, then processing-status polling.
pub struct UploadWorker {
    pub(crate) task_id: TaskId,
    pub(crate) attempt: u32,
    pub(crate) channel: Arc<dyn TransferChannel>,
    pub(crate) oracle: Arc<dyn StatusOracle>,
    pub(crate) timings: UploadTimings,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) updates: mpsc::UnboundedSender<TaskUpdate>,
}

impl UploadWorker {
    /// Run the attempt on its own task, supervised: a panic inside the channel or
    /// oracle is reported to the manager as a failure instead of leaving the task in flight.
    pub(crate) fn spawn(self, payload: Payload, metadata: VideoMetadata) {
        let task_id = self.task_id;
        let attempt = self.attempt;
        let updates = self.updates.clone();
        let attempt_handle = tokio::spawn(self.run(payload, metadata));

        tokio::spawn(async move {
            let Err(err) = attempt_handle.await else {
                return;
            };
            if !err.is_panic() {
                return;
            }

            let reason = match err.into_panic().downcast::<String>() {
                Ok(message) => format!("worker panicked: {}", message),
                Err(panic) => match panic.downcast::<&'static str>() {
                    Ok(message) => format!("worker panicked: {}", message),
                    Err(_) => "worker panicked".to_string(),
                },
            };
            error!(%task_id, attempt, %reason, "upload attempt crashed");
            let _ = updates.send(TaskUpdate {
                task_id,
                attempt,
                kind: UpdateKind::Failed(TaskFailure::new(FailureKind::Transport, reason)),
            });
        });
    }

    pub async fn run(self, payload: Payload, metadata: VideoMetadata) {
        let remote_id = match self.transfer(payload, metadata).await {
            Ok(remote_id) => remote_id,
            Err(stop) => return self.finish(stop),
        };

        info!(task_id = %self.task_id, %remote_id, "transfer accepted, waiting for processing");
        self.report(UpdateKind::Accepted(remote_id.clone()));

        let poller = StatusPoller {
            task_id: self.task_id,
            oracle: self.oracle.as_ref(),
            timings: &self.timings,
            cancellation_token: &self.cancellation_token,
        };

        match poller.run(&remote_id).await {
            Ok(()) => self.report(UpdateKind::Completed),
            Err(stop) => self.finish(stop),
        }
    }

    async fn transfer(&self, payload: Payload, metadata: VideoMetadata) -> Result<String, Stop> {
        let deadline = Instant::now() + self.timings.upload_timeout;
        let timeout_failure = || {
            Stop::Failed(TaskFailure::new(
                FailureKind::UploadTimeout,
                format!("upload did not finish within {}s", self.timings.upload_timeout.as_secs()),
            ))
        };

        debug!(task_id = %self.task_id, attempt = self.attempt, file = %payload.file_name, "submitting transfer");
        let submitted = tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => return Err(Stop::Cancelled),
            _ = sleep_until(deadline) => return Err(timeout_failure()),
            result = self.channel.submit(payload, metadata) => result,
        };

        let mut subscription = submitted
            .map_err(|err| Stop::Failed(TaskFailure::new(FailureKind::Transport, err.to_string())))?;

        loop {
            let tick = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => TransferTick::Cancelled,
                _ = sleep_until(deadline) => TransferTick::TimedOut,
                event = subscription.next_event() => TransferTick::Event(event),
            };

            match tick {
                TransferTick::Cancelled => {
                    subscription.cancel();
                    return Err(Stop::Cancelled);
                }
                TransferTick::TimedOut => {
                    subscription.cancel();
                    return Err(timeout_failure());
                }
                TransferTick::Event(Some(TransferEvent::Progress(percent))) => {
                    self.report(UpdateKind::Progress(percent));
                }
                TransferTick::Event(Some(TransferEvent::Success(remote_id))) => return Ok(remote_id),
                TransferTick::Event(Some(TransferEvent::Failure(reason))) => {
                    return Err(Stop::Failed(TaskFailure::new(FailureKind::Transport, reason)));
                }
                TransferTick::Event(None) => {
                    return Err(Stop::Failed(TaskFailure::new(
                        FailureKind::Transport,
                        "transfer channel closed without a terminal event",
                    )));
                }
            }
        }
    }

    fn finish(&self, stop: Stop) {
        match stop {
            Stop::Failed(failure) => {
                warn!(task_id = %self.task_id, attempt = self.attempt, %failure, "attempt failed");
                self.report(UpdateKind::Failed(failure));
            }
            // 中止由管理器发起, 状态已经在那边更新
            Stop::Cancelled => debug!(task_id = %self.task_id, attempt = self.attempt, "attempt cancelled"),
        }
    }

    fn report(&self, kind: UpdateKind) {
        let _ = self.updates.send(TaskUpdate {
            task_id: self.task_id,
            attempt: self.attempt,
            kind,
        });
    }
}
