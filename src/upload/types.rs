use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use uuid::Uuid;
use super::errors::{Result, TaskFailure, ValidationError};
use super::task::UploadTask;

// 用于序列化 Duration
fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UploadState {
    /// 等待开始，元数据可编辑
    Pending,
    /// 上传中
    Uploading,
    /// 服务端处理中
    Processing,
    /// 已完成
    Completed,
    /// 失败
    Error,
}

impl UploadState {
    /// Uploading or Processing: the task owns a live transfer or poll timer.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Uploading | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Private => "private",
        }
    }
}

/// Where the bytes of a payload come from.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    Memory(Bytes),
    /// 上传时才打开, 流式读取
    File(PathBuf),
}

impl Default for PayloadSource {
    fn default() -> Self {
        Self::Memory(Bytes::new())
    }
}

/// Readable handle over a payload's bytes.
pub type PayloadReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// 待上传文件内容
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Payload {
    pub file_name: String,
    pub media_type: String,
    /// 声明的文件大小
    pub size: u64,
    #[serde(skip)]
    pub source: PayloadSource,
}

impl Payload {
    pub fn new(file_name: impl Into<String>, media_type: impl Into<String>, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            file_name: file_name.into(),
            media_type: media_type.into(),
            size: content.len() as u64,
            source: PayloadSource::Memory(content),
        }
    }

    /// Payload whose declared size differs from the bytes held in memory.
    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// File-backed payload; only its size is read now, the content is streamed at upload time.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{:?} is not a regular file", path),
            ));
        }

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload")
            .to_string();

        Ok(Self {
            file_name,
            media_type: media_type_for_path(path).to_string(),
            size: metadata.len(),
            source: PayloadSource::File(path.to_path_buf()),
        })
    }

    /// Bytes the transfer will actually send.
    pub fn content_length(&self) -> u64 {
        match &self.source {
            PayloadSource::Memory(content) => content.len() as u64,
            PayloadSource::File(_) => self.size,
        }
    }

    pub async fn open(&self) -> std::io::Result<PayloadReader> {
        match &self.source {
            PayloadSource::Memory(content) => Ok(Box::new(Cursor::new(content.clone()))),
            PayloadSource::File(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
        }
    }

    /// Re-read the size of a file-backed payload, which may have changed on disk since enqueue.
    pub(crate) fn refresh_size(&mut self) -> std::io::Result<()> {
        if let PayloadSource::File(path) = &self.source {
            self.size = std::fs::metadata(path)?.len();
        }
        Ok(())
    }
}

pub fn media_type_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

/// 用户可编辑的视频信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub visibility: Visibility,
    pub tags: Vec<String>,
}

impl VideoMetadata {
    /// Title defaults to the file name without its extension.
    pub fn for_file_name(file_name: &str) -> Self {
        let title = Path::new(file_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(file_name)
            .to_string();

        Self {
            title,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, update: MetadataUpdate) {
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(visibility) = update.visibility {
            self.visibility = visibility;
        }
        if let Some(tags) = update.tags {
            self.tags = normalize_tags(tags);
        }
    }
}

/// Tags are an ordered set: trimmed, blanks dropped, first occurrence wins.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut result: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if !tag.is_empty() && !result.iter().any(|existing| existing == tag) {
            result.push(tag.to_string());
        }
    }
    result
}

/// Partial metadata edit; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadPolicy {
    pub max_file_count: usize,
    pub max_file_size_bytes: u64,
    /// `video/*`, `video/mp4` or an extension such as `.mkv`
    pub allowed_mime_patterns: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_file_count: 5,
            max_file_size_bytes: 500 * 1024 * 1024, // 500MB
            allowed_mime_patterns: ["video/*", ".mp4", ".mov", ".avi", ".mkv", ".webm"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadTimings {
    /// 处理状态轮询间隔
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,

    /// 单次状态查询超时
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub query_timeout: Duration,

    /// 上传总时长上限
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub upload_timeout: Duration,

    /// 服务端处理等待上限
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub processing_timeout: Duration,

    /// 最大并发上传数, None 表示不限制
    pub max_concurrent_transfers: Option<usize>,
}

impl UploadTimings {
    /// Zero durations or a zero transfer limit would leave tasks in flight forever.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let durations = [
            ("poll_interval", self.poll_interval),
            ("query_timeout", self.query_timeout),
            ("upload_timeout", self.upload_timeout),
            ("processing_timeout", self.processing_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, duration)| duration.is_zero()) {
            return Err(format!("{} must be greater than zero", name));
        }

        if self.max_concurrent_transfers == Some(0) {
            return Err("max_concurrent_transfers must be at least 1 (omit it for no limit)".to_string());
        }
        Ok(())
    }
}

impl Default for UploadTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            query_timeout: Duration::from_secs(10),
            upload_timeout: Duration::from_secs(30 * 60),
            processing_timeout: Duration::from_secs(30 * 60),
            max_concurrent_transfers: None,
        }
    }
}

/// Result of a batch enqueue that passed the queue-size check.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOutcome {
    pub accepted: Vec<TaskId>,
    pub rejected: Vec<ValidationError>,
}

/// 汇总统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadSummary {
    pub total: usize,
    pub pending: usize,
    pub uploading: usize,
    pub processing: usize,
    pub completed: usize,
    pub errored: usize,
    /// completed / total * 100
    pub overall_progress_percent: f64,
}

impl UploadSummary {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a UploadTask>) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            summary.total += 1;
            match task.state {
                UploadState::Pending => summary.pending += 1,
                UploadState::Uploading => summary.uploading += 1,
                UploadState::Processing => summary.processing += 1,
                UploadState::Completed => summary.completed += 1,
                UploadState::Error => summary.errored += 1,
            }
        }

        if summary.total > 0 {
            summary.overall_progress_percent = summary.completed as f64 / summary.total as f64 * 100.0;
        }
        summary
    }
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 任务已加入队列
    TaskAdded {
        task_id: TaskId,
    },

    /// 任务状态变更
    StateChanged {
        task_id: TaskId,
        old_state: UploadState,
        new_state: UploadState,
    },

    /// 上传进度
    Progress {
        task_id: TaskId,
        percent: u8,
    },

    MetadataUpdated {
        task_id: TaskId,
    },

    /// 任务完成
    Completed {
        task_id: TaskId,
        remote_id: String,
    },

    /// 任务失败
    Failed {
        task_id: TaskId,
        failure: TaskFailure,
    },

    /// 任务被移除
    Removed {
        task_id: TaskId,
    },

    /// 所有进行中的任务都已结束
    AllSettled {
        total: usize,
        completed: usize,
        errored: usize,
    },
}

impl UploadEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskAdded { task_id }
            | Self::StateChanged { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::MetadataUpdated { task_id }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Removed { task_id } => Some(*task_id),
            Self::AllSettled { .. } => None,
        }
    }
}

/// 上传管理器命令
pub enum ManagerCommand {
    /// 批量添加
    Enqueue {
        files: Vec<Payload>,
        policy: UploadPolicy,
        reply: oneshot::Sender<Result<EnqueueOutcome>>,
    },

    /// 开始所有等待中的任务
    StartAll {
        reply: oneshot::Sender<Vec<TaskId>>,
    },

    /// 移除
    Remove {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 清除所有未在进行中的任务
    ClearAll {
        reply: oneshot::Sender<usize>,
    },

    UpdateMetadata {
        task_id: TaskId,
        update: MetadataUpdate,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 中止
    Abort {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 重试
    Retry {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 获取任务信息
    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<UploadTask>>,
    },

    /// 获取所有任务
    GetAllTasks {
        reply: oneshot::Sender<Vec<UploadTask>>,
    },

    Summary {
        reply: oneshot::Sender<UploadSummary>,
    },
}
