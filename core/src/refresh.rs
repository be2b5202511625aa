use crate::credentials::{Credential, CredentialStore};
use crate::error::ClientError;
use crate::notify::{LoginRedirect, Notice, Notifier};
use crate::transport::{HttpRequest, Method, RequestBody, ResponseKind, Transport};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const REFRESH_PATH: &str = "auth/refresh";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("no refresh credential available")]
    NoRefreshCredential,
    #[error("refresh rejected with HTTP {0}")]
    Rejected(u16),
    #[error("refresh response malformed: {0}")]
    Malformed(String),
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("failed to store refreshed credential: {0}")]
    Storage(String),
}

impl From<RefreshError> for ClientError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::NoRefreshCredential => ClientError::NoRefreshCredential,
            _ => ClientError::AuthExpired,
        }
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

struct InFlight {
    id: u64,
    future: RefreshFuture,
}

struct Inner {
    store: CredentialStore,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    redirect: Arc<dyn LoginRedirect>,
    timeout: Duration,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    exchanges: AtomicU64,
}

/// Exchanges the refresh credential for a new pair, at most once at a time.
///
/// Callers arriving while an exchange is running await the same result. The
/// slot is released when the exchange settles, so a later 401 starts afresh.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: CredentialStore,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        redirect: Arc<dyn LoginRedirect>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                notifier,
                redirect,
                timeout,
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(1),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        let future = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(flight) => {
                    debug!(refresh_id = flight.id, "joining in-flight refresh");
                    flight.future.clone()
                }
                None => {
                    let refresh_token = self
                        .inner
                        .store
                        .get()
                        .map(|credential| credential.refresh_token)
                        .ok_or(RefreshError::NoRefreshCredential)?;
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let inner = self.inner.clone();
                    // Runs on its own task so the exchange settles even when
                    // every waiter is cancelled.
                    let task = tokio::spawn(async move {
                        let result = inner.exchange(refresh_token).await;
                        inner.settle(id, &result);
                        result
                    });
                    let future = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(RefreshError::Network(format!("refresh task aborted: {err}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }

    pub fn exchanges(&self) -> u64 {
        self.inner.exchanges.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }
}

#[derive(Deserialize)]
struct RefreshEnvelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    data: Option<RefreshData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshData {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl Inner {
    async fn exchange(&self, refresh_token: String) -> Result<Credential, RefreshError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        info!("refreshing access token");
        let request = HttpRequest {
            method: Method::Post,
            path: REFRESH_PATH.to_string(),
            bearer: None,
            accept: ResponseKind::Json.accept(),
            body: RequestBody::Json(json!({ "refreshToken": refresh_token })),
            progress: None,
        };
        let envelope = match tokio::time::timeout(self.timeout, self.fetch(request)).await {
            Ok(envelope) => envelope?,
            Err(_) => return Err(RefreshError::Network("timed out".to_string())),
        };
        if envelope.status != "success" {
            return Err(RefreshError::Malformed(
                envelope
                    .message
                    .unwrap_or_else(|| format!("status `{}`", envelope.status)),
            ));
        }
        let data = envelope
            .data
            .ok_or_else(|| RefreshError::Malformed("missing data".to_string()))?;
        let credential = Credential::new(
            data.access_token,
            data.refresh_token.unwrap_or(refresh_token),
        );
        self.store
            .set(credential.clone())
            .map_err(|err| RefreshError::Storage(err.to_string()))?;
        Ok(credential)
    }

    async fn fetch(&self, request: HttpRequest) -> Result<RefreshEnvelope, RefreshError> {
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|err| RefreshError::Network(err.to_string()))?;
        if !response.is_success() {
            return Err(RefreshError::Rejected(response.status));
        }
        response
            .json()
            .await
            .map_err(|err| RefreshError::Malformed(err.to_string()))
    }

    fn settle(&self, id: u64, result: &Result<Credential, RefreshError>) {
        {
            let mut slot = self.in_flight.lock();
            if slot.as_ref().map(|flight| flight.id) == Some(id) {
                *slot = None;
            }
        }
        match result {
            Ok(_) => info!(refresh_id = id, "access token refreshed"),
            Err(err) => {
                warn!(refresh_id = id, %err, "token refresh failed");
                if let Err(err) = self.store.clear() {
                    error!(%err, "failed to clear credentials after refresh failure");
                }
                let reason = ClientError::AuthExpired;
                self.notifier.notify(Notice::error(reason.user_message()));
                self.redirect.redirect_to_login(&reason);
            }
        }
    }
}
