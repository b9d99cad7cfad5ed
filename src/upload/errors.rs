use std::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use super::types::{TaskId, UploadState};

/// 文件校验失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationReason {
    TooLarge {
        size: u64,
        limit: u64,
    },
    UnsupportedType {
        media_type: String,
    },
    EmptyFile,
    QueueFull {
        limit: usize,
    },
    /// 重试时文件已无法读取
    Unreadable {
        message: String,
    },
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { size, limit } => {
                write!(f, "exceeds size limit ({} bytes > {} bytes)", size, limit)
            }
            Self::UnsupportedType { media_type } => {
                write!(f, "unsupported file type '{}'", media_type)
            }
            Self::EmptyFile => write!(f, "file is empty"),
            Self::QueueFull { limit } => {
                write!(f, "too many files, at most {} can be queued", limit)
            }
            Self::Unreadable { message } => write!(f, "cannot read file: {}", message),
        }
    }
}

/// A file rejected before it ever became a task.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{file_name}: {reason}")]
pub struct ValidationError {
    pub file_name: String,
    pub reason: ValidationReason,
}

impl ValidationError {
    pub fn new(file_name: impl Into<String>, reason: ValidationReason) -> Self {
        Self {
            file_name: file_name.into(),
            reason,
        }
    }
}

/// 任务失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// 传输通道报告失败或连接错误
    Transport,
    /// 上传超时
    UploadTimeout,
    /// 服务端处理失败
    ProcessingFailed,
    /// 处理超时
    ProcessingTimeout,
    /// 被调用方中止
    Cancelled,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transport => "transport error",
            Self::UploadTimeout => "upload timeout",
            Self::ProcessingFailed => "processing failed",
            Self::ProcessingTimeout => "processing timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::UploadTimeout | Self::ProcessingTimeout)
    }
}

/// Failure stored on a task in the `Error` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled")
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == FailureKind::Cancelled {
            return write!(f, "cancelled");
        }
        write!(f, "{}: {}", self.kind.label(), self.reason)
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Cannot {operation} task {task_id} in state {state:?}")]
    InvalidState {
        task_id: TaskId,
        state: UploadState,
        operation: &'static str,
    },

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Manager shut down")]
    ManagerShutdown,

    #[error("Invalid timings: {0}")]
    InvalidTimings(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn invalid_state(task_id: TaskId, state: UploadState, operation: &'static str) -> Self {
        Self::InvalidState {
            task_id,
            state,
            operation,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Errors raised by the transfer channel and status oracle implementations.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("HTTP Request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    Server {
        status_code: u16,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Transfer was cancelled")]
    Cancelled,
}

impl ChannelError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            message: message.into(),
        }
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
