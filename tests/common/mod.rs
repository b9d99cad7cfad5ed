//! Scripted collaborators for exercising the manager without a backend.
//!
//! ```rust,ignore
//! let channel = ScriptedChannel::new(TransferScript::new().progress(50.0).success("abc123"));
//! let oracle = ScriptedOracle::new(vec![Ok(ProcessingStatus::Completed)]);
//! let handle = UploadManager::builder(Arc::new(channel), Arc::new(oracle)).spawn();
//! ```

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::Instant;
use upload_orchestrator::upload::{
    ChannelError, Notice, NotificationSink, Payload, ProcessingStatus, StatusOracle, Subscription,
    TransferChannel, VideoMetadata,
};

#[derive(Debug, Clone)]
enum ScriptStep {
    Progress(f64),
    Success(String),
    Failure(String),
    Delay(Duration),
    /// 直到订阅被取消
    Hang,
    /// 不发送终止事件直接关闭
    Close,
}

/// What a single submitted transfer does, step by step.
///
/// Steps run even after the subscriber cancelled, like a channel that ignores cancellation.
#[derive(Debug, Clone, Default)]
pub struct TransferScript {
    steps: Vec<ScriptStep>,
    reject_submit: Option<String>,
}

impl TransferScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(mut self, percent: f64) -> Self {
        self.steps.push(ScriptStep::Progress(percent));
        self
    }

    pub fn success(mut self, remote_id: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Success(remote_id.into()));
        self
    }

    pub fn failure(mut self, reason: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Failure(reason.into()));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(duration));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push(ScriptStep::Hang);
        self
    }

    pub fn close(mut self) -> Self {
        self.steps.push(ScriptStep::Close);
        self
    }

    /// `submit` itself fails.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            reject_submit: Some(reason.into()),
        }
    }
}

/// A recorded `submit` call.
#[derive(Debug, Clone)]
pub struct RecordedSubmit {
    pub file_name: String,
    pub metadata: VideoMetadata,
    pub at: Instant,
}

#[derive(Default)]
struct ChannelStats {
    active: AtomicUsize,
    max_active: AtomicUsize,
    cancellations: AtomicUsize,
}

/// Transfer channel that plays back [`TransferScript`]s, one per submit.
pub struct ScriptedChannel {
    scripts: Mutex<VecDeque<TransferScript>>,
    default_script: TransferScript,
    submits: Arc<Mutex<Vec<RecordedSubmit>>>,
    stats: Arc<ChannelStats>,
}

impl ScriptedChannel {
    /// Every submit without a queued script runs `default_script`.
    pub fn new(default_script: TransferScript) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            default_script,
            submits: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(ChannelStats::default()),
        }
    }

    /// Queue a script for the next submit.
    pub fn push_script(&self, script: TransferScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn submits(&self) -> Vec<RecordedSubmit> {
        self.submits.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }

    /// Subscriptions cancelled before the transfer sent its terminal event.
    pub fn cancellations(&self) -> usize {
        self.stats.cancellations.load(Ordering::SeqCst)
    }

    /// Highest number of transfers running at the same time.
    pub fn max_active(&self) -> usize {
        self.stats.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferChannel for ScriptedChannel {
    async fn submit(&self, payload: Payload, metadata: VideoMetadata) -> Result<Subscription, ChannelError> {
        self.submits.lock().unwrap().push(RecordedSubmit {
            file_name: payload.file_name.clone(),
            metadata,
            at: Instant::now(),
        });

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_script.clone());

        if let Some(reason) = script.reject_submit {
            return Err(ChannelError::InvalidResponse(reason));
        }

        let (reporter, subscription) = Subscription::pair(16);
        let stats = self.stats.clone();
        let active = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(active, Ordering::SeqCst);

        let terminal_sent = Arc::new(AtomicBool::new(false));
        tokio::spawn({
            let token = reporter.cancellation_token();
            let stats = stats.clone();
            let terminal_sent = terminal_sent.clone();
            async move {
                token.cancelled().await;
                if !terminal_sent.load(Ordering::SeqCst) {
                    stats.cancellations.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tokio::spawn(async move {
            for step in script.steps {
                match step {
                    ScriptStep::Progress(percent) => reporter.progress(percent).await,
                    ScriptStep::Success(remote_id) => {
                        terminal_sent.store(true, Ordering::SeqCst);
                        reporter.succeed(remote_id).await;
                    }
                    ScriptStep::Failure(reason) => {
                        terminal_sent.store(true, Ordering::SeqCst);
                        reporter.fail(reason).await;
                    }
                    ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Hang => reporter.cancelled().await,
                    ScriptStep::Close => break,
                }
            }
            stats.active.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(subscription)
    }
}

enum OracleFallback {
    Repeat(ProcessingStatus),
    Hang,
    Panic(String),
}

/// Status oracle answering from a queue, then falling back to a fixed behavior.
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<Result<ProcessingStatus, ChannelError>>>,
    fallback: OracleFallback,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedOracle {
    /// Once `responses` run out, keeps answering `Processing`.
    pub fn new(responses: Vec<Result<ProcessingStatus, ChannelError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: OracleFallback::Repeat(ProcessingStatus::Processing),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(status: ProcessingStatus) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: OracleFallback::Repeat(status),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every query hangs forever.
    pub fn unresponsive() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: OracleFallback::Hang,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every query panics, like a buggy oracle implementation.
    pub fn panicking(message: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: OracleFallback::Panic(message.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn queried_ids(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl StatusOracle for ScriptedOracle {
    async fn query(&self, remote_id: &str) -> Result<ProcessingStatus, ChannelError> {
        self.calls.lock().unwrap().push((remote_id.to_string(), Instant::now()));

        let next = self.responses.lock().unwrap().pop_front();
        if let Some(response) = next {
            return response;
        }

        match &self.fallback {
            OracleFallback::Repeat(status) => Ok(status.clone()),
            OracleFallback::Hang => std::future::pending().await,
            OracleFallback::Panic(message) => panic!("{}", message),
        }
    }
}

/// Notification sink that keeps every notice.
#[derive(Default)]
pub struct RecordingSink {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}
