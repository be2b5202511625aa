use crate::credentials::{Credential, CredentialStore};
use crate::error::ClientError;
use crate::notify::{LoginRedirect, Notice, Notifier};
use crate::refresh::{RefreshCoordinator, RefreshError};
use crate::transport::{
    FilePart, HttpRequest, HttpResponse, Method, ProgressSender, RequestBody, ResponseKind,
    Transport, TransportError,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};

const NO_CONTENT_BODY: &str = r#"{"result":"success"}"#;

#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    pub expect: ResponseKind,
    /// Attach the access credential and recover from 401 through a refresh.
    pub authenticated: bool,
    pub progress: Option<ProgressSender>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            expect: ResponseKind::Json,
            authenticated: true,
            progress: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(RequestBody::Json(body))
    }

    pub fn upload(path: impl Into<String>, file: FilePart) -> Self {
        Self::new(Method::Post, path).with_body(RequestBody::File(file))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.expect = ResponseKind::Stream;
        self
    }

    pub fn binary(mut self) -> Self {
        self.expect = ResponseKind::Binary;
        self
    }

    /// No bearer header and no 401 recovery.
    pub fn public(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    fn to_http(&self, bearer: Option<String>) -> HttpRequest {
        HttpRequest {
            method: self.method,
            path: self.path.clone(),
            bearer,
            accept: self.expect.accept(),
            body: self.body.clone(),
            progress: self.progress.clone(),
        }
    }
}

/// Bounded retry of transient failures for idempotent reads. Independent of
/// the single replay after a credential refresh.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub limit: u32,
    pub backoff: Duration,
    pub statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 2,
            backoff: Duration::from_millis(300),
            statuses: vec![408, 413, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            limit: 0,
            ..Self::default()
        }
    }

    fn applies_to(&self, method: Method) -> bool {
        self.limit > 0 && method == Method::Get
    }

    fn is_transient(&self, outcome: &Result<HttpResponse, TransportError>) -> bool {
        match outcome {
            Ok(response) => self.statuses.contains(&response.status),
            Err(TransportError::Connect(_)) | Err(TransportError::Timeout) => true,
            Err(_) => false,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Per-attempt deadline covering the response head and, except for
    /// successful streams, the whole body.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(100),
            retry: RetryPolicy::default(),
        }
    }
}

/// Wraps every outbound call: credential attachment, 401 recovery with a
/// single replay, transient retry and failure classification.
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    refresh: RefreshCoordinator,
    redirect: Arc<dyn LoginRedirect>,
    notifier: Arc<dyn Notifier>,
    settings: PipelineSettings,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        notifier: Arc<dyn Notifier>,
        redirect: Arc<dyn LoginRedirect>,
        settings: PipelineSettings,
    ) -> Self {
        let refresh = RefreshCoordinator::new(
            store.clone(),
            transport.clone(),
            notifier.clone(),
            redirect.clone(),
            settings.timeout,
        );
        Self {
            transport,
            store,
            refresh,
            redirect,
            notifier,
            settings,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub async fn execute(&self, spec: RequestSpec) -> Result<HttpResponse, ClientError> {
        let mut bearer = if spec.authenticated {
            self.store.access_token()
        } else {
            None
        };
        let mut retried = false;
        loop {
            let response = self.send_with_retry(&spec, bearer.clone()).await?;
            if response.status != 401 || !spec.authenticated {
                return self.classify(&spec, response).await;
            }
            if retried {
                warn!(path = %spec.path, "still unauthorized after refresh");
                self.expire_session();
                return Err(ClientError::AuthExpired);
            }
            retried = true;
            bearer = Some(self.recover_credential(bearer.as_deref()).await?);
            debug!(path = %spec.path, "replaying request with refreshed credential");
        }
    }

    async fn recover_credential(&self, sent: Option<&str>) -> Result<String, ClientError> {
        if let Some(current) = self.store.access_token() {
            if sent != Some(current.as_str()) {
                debug!("credential changed while the request was in flight");
                return Ok(current);
            }
        }
        match self.refresh.refresh().await {
            Ok(Credential { access_token, .. }) => Ok(access_token),
            Err(RefreshError::NoRefreshCredential) => {
                let err = ClientError::NoRefreshCredential;
                self.sign_out(&err);
                Err(err)
            }
            // The coordinator already wiped the store, notified and redirected.
            Err(err) => Err(err.into()),
        }
    }

    fn expire_session(&self) {
        self.sign_out(&ClientError::AuthExpired);
    }

    fn sign_out(&self, reason: &ClientError) {
        if let Err(err) = self.store.clear() {
            error!(%err, "failed to clear credentials");
        }
        self.notifier.notify(Notice::error(reason.user_message()));
        self.redirect.redirect_to_login(reason);
    }

    async fn send_with_retry(
        &self,
        spec: &RequestSpec,
        bearer: Option<String>,
    ) -> Result<HttpResponse, ClientError> {
        let policy = &self.settings.retry;
        let retryable = policy.applies_to(spec.method);
        let mut attempt = 0;
        loop {
            let outcome = self.send_once(spec, bearer.clone()).await;
            if !retryable || attempt >= policy.limit || !policy.is_transient(&outcome) {
                return outcome.map_err(ClientError::from);
            }
            attempt += 1;
            let delay = policy.delay(attempt);
            warn!(path = %spec.path, attempt, ?delay, "transient failure, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(
        &self,
        spec: &RequestSpec,
        bearer: Option<String>,
    ) -> Result<HttpResponse, TransportError> {
        let request = spec.to_http(bearer);
        let deadline = Instant::now() + self.settings.timeout;
        let response = match timeout_at(deadline, self.transport.send(request)).await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(TransportError::Timeout),
        };
        if response.is_success() && spec.expect == ResponseKind::Stream {
            return Ok(response);
        }
        match timeout_at(deadline, response.buffer()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn classify(
        &self,
        spec: &RequestSpec,
        response: HttpResponse,
    ) -> Result<HttpResponse, ClientError> {
        if response.is_success() {
            return match spec.expect {
                ResponseKind::Json => self.finish_json(response),
                ResponseKind::Stream | ResponseKind::Binary => Ok(response),
            };
        }
        let status = response.status;
        let body = response.text().await.unwrap_or_default();
        if status == 403 && error_code(&body).as_deref() == Some("already_setup") {
            let err = ClientError::SetupCompleted;
            warn!(path = %spec.path, "setup already completed, sign-in required");
            self.sign_out(&err);
            return Err(err);
        }
        debug!(path = %spec.path, status, "request failed");
        Err(ClientError::Http { status, body })
    }

    fn finish_json(&self, mut response: HttpResponse) -> Result<HttpResponse, ClientError> {
        if response.status == 204 {
            response.content_type = Some("application/json".to_string());
            response.replace_body(NO_CONTENT_BODY);
            return Ok(response);
        }
        if let Some(credential) = response.body_bytes().and_then(|body| issued_credential(body)) {
            self.store
                .set(credential)
                .map_err(|err| ClientError::Storage(err.to_string()))?;
            debug!("stored credentials issued by response");
        }
        Ok(response)
    }
}

fn error_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("code")?.as_str().map(str::to_owned)
}

/// A `{data: {accessToken, refreshToken}}` pair carried by a successful response.
fn issued_credential(body: &[u8]) -> Option<Credential> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let data = value.get("data")?;
    let access = data.get("accessToken")?.as_str()?;
    let refresh = data.get("refreshToken")?.as_str()?;
    Some(Credential::new(access, refresh))
}
