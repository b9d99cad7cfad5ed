use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use super::channel::{ProcessingStatus, StatusOracle};
use super::errors::{ChannelError, FailureKind, TaskFailure};
use super::types::{TaskId, UploadTimings};
use super::worker::Stop;

enum PollStep {
    Query,
    Cancelled,
    Expired,
}

enum QueryResult {
    Answered(Result<ProcessingStatus, ChannelError>),
    TimedOut,
    Cancelled,
}

/// Polls the status oracle until processing ends, the budget runs out, or the attempt is cancelled.
///
/// The interval timer lives on this stack frame, so every return path releases it.
pub(crate) struct StatusPoller<'a> {
    pub task_id: TaskId,
    pub oracle: &'a dyn StatusOracle,
    pub timings: &'a UploadTimings,
    pub cancellation_token: &'a CancellationToken,
}

impl StatusPoller<'_> {
    pub async fn run(&self, remote_id: &str) -> Result<(), Stop> {
        let started = Instant::now();
        let deadline = started + self.timings.processing_timeout;

        let mut ticker = interval_at(started + self.timings.poll_interval, self.timings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // 超时优先于查询, 到达截止时间后不会再发起查询
            let step = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => PollStep::Cancelled,
                _ = sleep_until(deadline) => PollStep::Expired,
                _ = ticker.tick() => PollStep::Query,
            };

            match step {
                PollStep::Cancelled => return Err(Stop::Cancelled),
                PollStep::Expired => return Err(self.expired()),
                PollStep::Query => {}
            }

            let query_deadline = std::cmp::min(Instant::now() + self.timings.query_timeout, deadline);
            let result = tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => QueryResult::Cancelled,
                answer = timeout_at(query_deadline, self.oracle.query(remote_id)) => match answer {
                    Ok(answer) => QueryResult::Answered(answer),
                    Err(_) => QueryResult::TimedOut,
                },
            };

            match result {
                QueryResult::Cancelled => return Err(Stop::Cancelled),
                QueryResult::Answered(Ok(ProcessingStatus::Completed)) => return Ok(()),
                QueryResult::Answered(Ok(ProcessingStatus::Failed(reason))) => {
                    return Err(Stop::Failed(TaskFailure::new(FailureKind::ProcessingFailed, reason)));
                }
                QueryResult::Answered(Ok(ProcessingStatus::Processing)) => {
                    debug!(task_id = %self.task_id, remote_id, "still processing");
                }
                // 网络抖动不算失败, 继续轮询直到预算耗尽
                QueryResult::Answered(Err(err)) => {
                    warn!(task_id = %self.task_id, remote_id, error = %err, "status query failed, will retry");
                }
                QueryResult::TimedOut => {
                    warn!(task_id = %self.task_id, remote_id, "status query timed out, will retry");
                }
            }
        }
    }

    fn expired(&self) -> Stop {
        Stop::Failed(TaskFailure::new(
            FailureKind::ProcessingTimeout,
            format!(
                "no result from the server after {}s",
                self.timings.processing_timeout.as_secs()
            ),
        ))
    }
}
