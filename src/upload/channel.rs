use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use super::errors::ChannelError;
use super::types::{Payload, VideoMetadata};

/// Events emitted by a transfer: zero or more `Progress`, then exactly one terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// 百分比, 可能越界或乱序, 由管理器负责修正
    Progress(f64),
    Success(String),
    Failure(String),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// Caller side of a running transfer. Dropping it cancels the transfer.
pub struct Subscription {
    events: mpsc::Receiver<TransferEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<TransferEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Build a connected reporter/subscription pair for channel implementations.
    pub fn pair(buffer: usize) -> (TransferReporter, Subscription) {
        let (events_tx, events_rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        let reporter = TransferReporter {
            events: events_tx,
            cancel: cancel.clone(),
        };

        (reporter, Self::new(events_rx, cancel))
    }

    /// `None` once the channel side is gone.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Channel side of a running transfer.
#[derive(Clone)]
pub struct TransferReporter {
    events: mpsc::Sender<TransferEvent>,
    cancel: CancellationToken,
}

impl TransferReporter {
    pub async fn progress(&self, percent: f64) {
        let _ = self.events.send(TransferEvent::Progress(percent)).await;
    }

    pub async fn succeed(&self, remote_id: impl Into<String>) {
        let _ = self.events.send(TransferEvent::Success(remote_id.into())).await;
    }

    pub async fn fail(&self, reason: impl Into<String>) {
        let _ = self.events.send(TransferEvent::Failure(reason.into())).await;
    }

    /// Resolves once the subscriber cancelled (or dropped) the subscription.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token alone, for watchers that must not keep the event channel open.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// 传输通道 - 负责把文件字节发送到服务端
#[async_trait]
pub trait TransferChannel: Send + Sync {
    async fn submit(&self, payload: Payload, metadata: VideoMetadata) -> Result<Subscription, ChannelError>;
}

/// Coarse-grained server-side processing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingStatus {
    Processing,
    Completed,
    Failed(String),
}

/// 状态查询 - 每次调用相互独立
#[async_trait]
pub trait StatusOracle: Send + Sync {
    /// An `Err` means the oracle could not be reached, not that processing failed.
    async fn query(&self, remote_id: &str) -> Result<ProcessingStatus, ChannelError>;
}

/// Supplies the bearer token attached to backend requests.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self((!token.is_empty()).then_some(token))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing message (a toast, in a UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Default sink: writes notices to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => tracing::error!(title = %notice.title, "{}", notice.message),
            NoticeLevel::Warning => tracing::warn!(title = %notice.title, "{}", notice.message),
            NoticeLevel::Info | NoticeLevel::Success => {
                tracing::info!(title = %notice.title, "{}", notice.message)
            }
        }
    }
}
