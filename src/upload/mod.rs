mod errors;
mod manager;
mod manager_worker;
mod poller;
mod policy;
mod progress_stream;
mod task;
mod worker;
pub mod channel;
pub mod http;
pub mod types;

pub use channel::{
    CredentialProvider, Notice, NoticeLevel, NotificationSink, ProcessingStatus, StaticToken,
    StatusOracle, Subscription, TracingNotificationSink, TransferChannel, TransferEvent,
    TransferReporter,
};
pub use errors::{
    ChannelError, FailureKind, Result, TaskFailure, UploadError, ValidationError, ValidationReason,
};
pub use http::{HttpStatusOracle, HttpTransferChannel};
pub use manager::{FilteredEventReceiver, UploadManager, UploadManagerBuilder, UploadManagerHandle};
pub use policy::{check_capacity, validate_file};
pub use task::UploadTask;
pub use types::{
    EnqueueOutcome, MetadataUpdate, Payload, PayloadReader, PayloadSource, TaskId, UploadEvent,
    UploadPolicy, UploadState, UploadSummary, UploadTimings, VideoMetadata, Visibility,
};
