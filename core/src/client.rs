use crate::auth::AuthClient;
use crate::chat::{ChatSession, ChatSubscription};
use crate::config::ClientConfig;
use crate::credentials::{CredentialError, CredentialStore};
use crate::error::ClientError;
use crate::notify::{LoginRedirect, Notifier};
use crate::pipeline::RequestPipeline;
use crate::transport::{ReqwestTransport, Transport, TransportError};
use crate::upload::{LocalFile, UploadManager, UploadRejection, UploadSubscription};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("failed to build HTTP transport: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// Everything a front end talks to: one pipeline shared by auth, chat and
/// uploads.
#[derive(Clone)]
pub struct QuireClient {
    pipeline: Arc<RequestPipeline>,
    auth: AuthClient,
    chat: ChatSession,
    uploads: UploadManager,
}

impl QuireClient {
    pub fn new(
        config: &ClientConfig,
        store: CredentialStore,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        redirect: Arc<dyn LoginRedirect>,
    ) -> Self {
        let pipeline = Arc::new(RequestPipeline::new(
            transport,
            store,
            notifier,
            redirect,
            config.pipeline.clone(),
        ));
        Self {
            auth: AuthClient::new(pipeline.clone()),
            chat: ChatSession::new(pipeline.clone(), config.chat.clone()),
            uploads: UploadManager::new(pipeline.clone(), config.upload.clone()),
            pipeline,
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        notifier: Arc<dyn Notifier>,
        redirect: Arc<dyn LoginRedirect>,
    ) -> Result<Self, SetupError> {
        let transport = ReqwestTransport::new(config.base_url.clone())?;
        let store = CredentialStore::open(&config.credentials_dir)?;
        info!(base_url = %config.base_url, "client ready");
        Ok(Self::new(config, store, Arc::new(transport), notifier, redirect))
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    pub fn chat(&self) -> &ChatSession {
        &self.chat
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<ChatSubscription, ClientError> {
        self.chat.send(text)
    }

    pub fn cancel_chat(&self) -> bool {
        self.chat.cancel()
    }

    pub fn upload_file(&self, file: LocalFile) -> Result<(Uuid, UploadSubscription), UploadRejection> {
        self.uploads.add_local(file)
    }

    pub fn cancel_upload(&self, id: Uuid) -> bool {
        self.uploads.cancel(id)
    }

    pub fn retry_upload(&self, id: Uuid) -> Result<UploadSubscription, ClientError> {
        self.uploads.retry(id)
    }
}
