pub mod config;
pub mod upload;

// 重新导出核心类型
pub use upload::{
    UploadManager,
    UploadManagerHandle,
    UploadManagerBuilder,
    UploadTask,
    UploadState,
    UploadEvent,
    UploadPolicy,
    UploadTimings,
    UploadError,
    TaskId,
    Payload,
    Result,
};
