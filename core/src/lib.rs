pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod mock;
pub mod notify;
pub mod pipeline;
pub mod refresh;
pub mod sse;
pub mod telemetry;
pub mod transport;
pub mod upload;

pub use auth::{AuthClient, UserProfile};
pub use chat::{ChatMessage, ChatSession, ChatSubscription, ChatTurn, ChatUpdate, MessageRole, TurnStatus};
pub use client::{QuireClient, SetupError};
pub use config::{ClientConfig, ConfigError};
pub use credentials::{Credential, CredentialStore};
pub use error::ClientError;
pub use notify::{LoginRedirect, Notice, NoticeLevel, Notifier, TracingNotifier};
pub use pipeline::{RequestPipeline, RequestSpec};
pub use refresh::RefreshCoordinator;
pub use sse::{ContentMode, StreamDecoder, StreamEvent};
pub use transport::{ReqwestTransport, Transport};
pub use upload::{FileCategory, FileTransfer, LocalFile, TransferStatus, UploadManager, UploadUpdate};
