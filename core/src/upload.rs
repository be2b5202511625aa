use crate::error::ClientError;
use crate::notify::{Notice, Notifier};
use crate::pipeline::{RequestPipeline, RequestSpec};
use crate::transport::{FilePart, TransferProgress};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
const DOCUMENT_TYPES: &[&str] = &[
    "application/pdf",
    "text/plain",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];
const AUDIO_TYPES: &[&str] = &["audio/mpeg", "audio/wav", "audio/mp3"];
const VIDEO_TYPES: &[&str] = &["video/mp4", "video/avi", "video/mov"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Image,
    Document,
    Audio,
    Video,
    Custom,
}

impl FileCategory {
    /// Category of a MIME type. Unknown types are `Custom` when custom files
    /// are accepted and `Document` otherwise.
    pub fn classify(mime_type: &str, allow_custom: bool) -> Self {
        let mime_type = mime_type.to_ascii_lowercase();
        let mime_type = mime_type.as_str();
        if IMAGE_TYPES.contains(&mime_type) {
            Self::Image
        } else if DOCUMENT_TYPES.contains(&mime_type) {
            Self::Document
        } else if AUDIO_TYPES.contains(&mime_type) {
            Self::Audio
        } else if VIDEO_TYPES.contains(&mime_type) {
            Self::Video
        } else if allow_custom {
            Self::Custom
        } else {
            Self::Document
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Custom => "custom",
        }
    }
}

/// Renders a byte count the way users read it: `0 Bytes`, `1.5 KB`, `5 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadRejection {
    #[error("{name}: file type `{mime_type}` is not allowed")]
    TypeNotAllowed { name: String, mime_type: String },
    #[error("{name} is {} which exceeds the {} limit", format_file_size(*size), format_file_size(*limit))]
    TooLarge { name: String, size: u64, limit: u64 },
    #[error("at most {max} files can be attached")]
    TooManyFiles { max: usize },
}

impl UploadRejection {
    pub fn user_message(&self) -> String {
        match self {
            Self::TypeNotAllowed { name, .. } => format!("{name} cannot be uploaded: file type not supported."),
            Self::TooLarge { name, limit, .. } => {
                format!("{name} is too large. The limit is {}.", format_file_size(*limit))
            }
            Self::TooManyFiles { max } => format!("You can attach at most {max} files."),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub upload_path: String,
    pub image_limit: u64,
    pub document_limit: u64,
    pub audio_limit: u64,
    pub video_limit: u64,
    pub max_files: Option<usize>,
    pub allowed_types: Vec<FileCategory>,
    /// Lowercase, without the leading dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            upload_path: "files/upload".to_string(),
            image_limit: 5 * MIB,
            document_limit: 5 * MIB,
            audio_limit: 5 * MIB,
            video_limit: 5 * MIB,
            max_files: None,
            allowed_types: vec![
                FileCategory::Image,
                FileCategory::Document,
                FileCategory::Audio,
                FileCategory::Video,
            ],
            allowed_extensions: Vec::new(),
        }
    }
}

impl UploadSettings {
    pub fn limit_for(&self, category: FileCategory) -> u64 {
        match category {
            FileCategory::Image => self.image_limit,
            FileCategory::Document | FileCategory::Custom => self.document_limit,
            FileCategory::Audio => self.audio_limit,
            FileCategory::Video => self.video_limit,
        }
    }

    /// Checks `file` against the allow-lists and its category's size limit.
    /// `tracked` is the number of transfers already held.
    pub fn admit(&self, file: &LocalFile, tracked: usize) -> Result<FileCategory, UploadRejection> {
        if let Some(max) = self.max_files {
            if tracked >= max {
                return Err(UploadRejection::TooManyFiles { max });
            }
        }
        // Unknown types pass only when custom files or their extension are allowed.
        let known = FileCategory::classify(&file.mime_type, true);
        let extension_allowed = file
            .extension()
            .is_some_and(|ext| self.allowed_extensions.iter().any(|allowed| *allowed == ext));
        if !self.allowed_types.contains(&known) && !extension_allowed {
            return Err(UploadRejection::TypeNotAllowed {
                name: file.name.clone(),
                mime_type: file.mime_type.clone(),
            });
        }
        let category = FileCategory::classify(
            &file.mime_type,
            self.allowed_types.contains(&FileCategory::Custom),
        );
        let limit = self.limit_for(category);
        if file.size() > limit {
            return Err(UploadRejection::TooLarge {
                name: file.name.clone(),
                size: file.size(),
                limit,
            });
        }
        Ok(category)
    }
}

/// File contents picked by the user. The bytes are kept so a failed transfer
/// can be retried without reading the file again.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = path
            .extension()
            .map(|ext| mime_for_extension(&ext.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or("application/octet-stream");
        Ok(Self::new(name, mime_type, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn extension(&self) -> Option<String> {
        let (_, ext) = self.name.rsplit_once('.')?;
        (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "avi" => "video/avi",
        "mov" => "video/mov",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Uploading,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileTransfer {
    pub id: Uuid,
    pub name: String,
    pub byte_size: u64,
    pub mime_type: String,
    pub category: FileCategory,
    /// `-1` once failed, otherwise `0..=100`.
    pub progress: i8,
    pub status: TransferStatus,
    pub remote_id: Option<String>,
    pub url: Option<String>,
    pub error: Option<ClientError>,
    pub cancellable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadUpdate {
    /// The transfer started and can now be cancelled.
    CancelHandle,
    Progress(u8),
    Succeeded { remote_id: String, url: String },
    Failed { error: ClientError },
}

pub type UploadSubscription = UnboundedReceiver<UploadUpdate>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub id: String,
    pub url: String,
}

impl UploadReceipt {
    fn from_body(body: &Value) -> Result<Self, ClientError> {
        let body = body.get("data").filter(|data| data.is_object()).unwrap_or(body);
        let id = match body.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(ClientError::Decode("upload response has no `id`".to_string())),
        };
        let url = body
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Decode("upload response has no `url`".to_string()))?;
        Ok(Self {
            id,
            url: url.to_string(),
        })
    }
}

struct Entry {
    snapshot: FileTransfer,
    file: LocalFile,
    attempt: u64,
    cancel: Option<CancellationToken>,
    updates: Option<UnboundedSender<UploadUpdate>>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<Uuid, Entry>,
    order: Vec<Uuid>,
}

impl Table {
    fn live(&mut self, id: Uuid, attempt: u64) -> Option<&mut Entry> {
        self.entries.get_mut(&id).filter(|entry| {
            entry.attempt == attempt && entry.snapshot.status == TransferStatus::Uploading
        })
    }
}

/// Tracks file transfers by id. Each transfer runs in its own task and only
/// ever touches its own entry, so one failing never disturbs another.
#[derive(Clone)]
pub struct UploadManager {
    table: Arc<RwLock<Table>>,
    pipeline: Arc<RequestPipeline>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<UploadSettings>,
}

impl UploadManager {
    pub fn new(pipeline: Arc<RequestPipeline>, settings: UploadSettings) -> Self {
        let notifier = pipeline.notifier().clone();
        Self {
            table: Arc::new(RwLock::new(Table::default())),
            pipeline,
            notifier,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Admits `file` and starts uploading it. Rejected files are reported to
    /// the notifier and never tracked.
    pub fn add_local(&self, file: LocalFile) -> Result<(Uuid, UploadSubscription), UploadRejection> {
        let mut table = self.table.write();
        let category = match self.settings.admit(&file, table.entries.len()) {
            Ok(category) => category,
            Err(rejection) => {
                drop(table);
                warn!(file = %file.name, %rejection, "file rejected");
                self.notifier.notify(Notice::warning(rejection.user_message()));
                return Err(rejection);
            }
        };
        let id = Uuid::new_v4();
        info!(%id, file = %file.name, size = file.size(), category = category.as_str(), "file admitted");
        table.entries.insert(
            id,
            Entry {
                snapshot: FileTransfer {
                    id,
                    name: file.name.clone(),
                    byte_size: file.size(),
                    mime_type: file.mime_type.clone(),
                    category,
                    progress: 0,
                    status: TransferStatus::Pending,
                    remote_id: None,
                    url: None,
                    error: None,
                    cancellable: false,
                },
                file,
                attempt: 0,
                cancel: None,
                updates: None,
            },
        );
        table.order.push(id);
        let rx = self.start(&mut table, id);
        Ok((id, rx))
    }

    /// Aborts an in-flight transfer. It ends as failed with progress `-1`.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut table = self.table.write();
        let Some(entry) = table.entries.get_mut(&id) else {
            return false;
        };
        let Some(token) = entry.cancel.take() else {
            return false;
        };
        token.cancel();
        let error = ClientError::Transfer("cancelled".to_string());
        entry.snapshot.status = TransferStatus::Failed;
        entry.snapshot.progress = -1;
        entry.snapshot.cancellable = false;
        entry.snapshot.error = Some(error.clone());
        if let Some(updates) = entry.updates.take() {
            let _ = updates.send(UploadUpdate::Failed { error });
        }
        info!(%id, "upload cancelled");
        true
    }

    /// Restarts a failed transfer from zero with the same bytes.
    pub fn retry(&self, id: Uuid) -> Result<UploadSubscription, ClientError> {
        let mut table = self.table.write();
        let status = table.entries.get(&id).map(|entry| entry.snapshot.status);
        match status {
            None => Err(ClientError::InvalidState(format!("no transfer {id}"))),
            Some(TransferStatus::Failed) => {
                info!(%id, "retrying upload");
                Ok(self.start(&mut table, id))
            }
            Some(status) => Err(ClientError::InvalidState(format!(
                "transfer {id} is {status:?} and cannot be retried"
            ))),
        }
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut table = self.table.write();
        let Some(entry) = table.entries.remove(&id) else {
            return false;
        };
        if let Some(token) = entry.cancel {
            token.cancel();
        }
        table.order.retain(|tracked| *tracked != id);
        debug!(%id, "transfer removed");
        true
    }

    pub fn clear(&self) {
        let mut table = self.table.write();
        for (_, entry) in table.entries.drain() {
            if let Some(token) = entry.cancel {
                token.cancel();
            }
        }
        table.order.clear();
    }

    pub fn transfers(&self) -> Vec<FileTransfer> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|id| table.entries.get(id))
            .map(|entry| entry.snapshot.clone())
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<FileTransfer> {
        self.table.read().entries.get(&id).map(|entry| entry.snapshot.clone())
    }

    /// Remote ids of finished uploads, in the order the files were added.
    pub fn completed_remote_ids(&self) -> Vec<String> {
        self.transfers()
            .into_iter()
            .filter(|transfer| transfer.status == TransferStatus::Success)
            .filter_map(|transfer| transfer.remote_id)
            .collect()
    }

    fn start(&self, table: &mut Table, id: Uuid) -> UploadSubscription {
        let (tx, rx) = unbounded_channel();
        let Some(entry) = table.entries.get_mut(&id) else {
            return rx;
        };
        entry.attempt += 1;
        let attempt = entry.attempt;
        let cancel = CancellationToken::new();
        entry.cancel = Some(cancel.clone());
        entry.snapshot.status = TransferStatus::Uploading;
        entry.snapshot.progress = 0;
        entry.snapshot.error = None;
        entry.snapshot.cancellable = true;
        let _ = tx.send(UploadUpdate::CancelHandle);
        entry.updates = Some(tx);

        let part = FilePart {
            field: "file".to_string(),
            file_name: entry.file.name.clone(),
            mime_type: entry.file.mime_type.clone(),
            bytes: entry.file.bytes.clone(),
        };
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(id, attempt, part, cancel).await;
        });
        rx
    }

    async fn run(&self, id: Uuid, attempt: u64, part: FilePart, cancel: CancellationToken) {
        let (progress_tx, mut progress_rx) = unbounded_channel::<TransferProgress>();
        let spec = RequestSpec::upload(self.settings.upload_path.clone(), part).with_progress(progress_tx);
        let call = self.pipeline.execute(spec);
        tokio::pin!(call);
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                Some(progress) = progress_rx.recv() => self.record_progress(id, attempt, progress.percent()),
                result = &mut call => break result,
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.record_progress(id, attempt, progress.percent());
        }
        let outcome = match result {
            Ok(response) => match response.json::<Value>().await {
                Ok(body) => UploadReceipt::from_body(&body),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };
        self.finish(id, attempt, outcome);
    }

    fn record_progress(&self, id: Uuid, attempt: u64, percent: u8) {
        let mut table = self.table.write();
        let Some(entry) = table.live(id, attempt) else {
            return;
        };
        let percent = percent.min(100);
        if i16::from(percent) <= i16::from(entry.snapshot.progress) {
            return;
        }
        entry.snapshot.progress = percent as i8;
        if let Some(updates) = &entry.updates {
            let _ = updates.send(UploadUpdate::Progress(percent));
        }
    }

    fn finish(&self, id: Uuid, attempt: u64, outcome: Result<UploadReceipt, ClientError>) {
        let failure = {
            let mut table = self.table.write();
            let Some(entry) = table.live(id, attempt) else {
                return;
            };
            entry.cancel = None;
            entry.snapshot.cancellable = false;
            let updates = entry.updates.take();
            match outcome {
                Ok(receipt) => {
                    info!(%id, remote_id = %receipt.id, "upload finished");
                    entry.snapshot.status = TransferStatus::Success;
                    entry.snapshot.progress = 100;
                    entry.snapshot.remote_id = Some(receipt.id.clone());
                    entry.snapshot.url = Some(receipt.url.clone());
                    if let Some(updates) = updates {
                        let _ = updates.send(UploadUpdate::Succeeded {
                            remote_id: receipt.id,
                            url: receipt.url,
                        });
                    }
                    None
                }
                Err(error) => {
                    warn!(%id, %error, "upload failed");
                    entry.snapshot.status = TransferStatus::Failed;
                    entry.snapshot.progress = -1;
                    entry.snapshot.error = Some(error.clone());
                    if let Some(updates) = updates {
                        let _ = updates.send(UploadUpdate::Failed {
                            error: error.clone(),
                        });
                    }
                    Some(error)
                }
            }
        };
        if let Some(error) = failure.filter(|error| !error.is_auth()) {
            self.notifier.notify(Notice::error(error.user_message()));
        }
    }
}
