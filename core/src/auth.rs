use crate::error::ClientError;
use crate::notify::{Notice, Notifier};
use crate::pipeline::{RequestPipeline, RequestSpec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub const LOGIN_PATH: &str = "auth/login";
pub const VERIFY_PATH: &str = "auth/verify";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "username")]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthEnvelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<AuthData>,
    #[serde(default)]
    user: Option<UserProfile>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthData {
    #[serde(default)]
    user: Option<UserProfile>,
}

impl AuthEnvelope {
    fn into_user(self) -> Option<UserProfile> {
        self.data.and_then(|data| data.user).or(self.user)
    }
}

/// Sign-in and session checks. Credentials issued by the login response are
/// stored by the request pipeline.
#[derive(Clone)]
pub struct AuthClient {
    pipeline: Arc<RequestPipeline>,
    notifier: Arc<dyn Notifier>,
}

impl AuthClient {
    pub fn new(pipeline: Arc<RequestPipeline>) -> Self {
        let notifier = pipeline.notifier().clone();
        Self { pipeline, notifier }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Option<UserProfile>, ClientError> {
        let result = self.try_login(email, password).await;
        match &result {
            Ok(_) => {
                info!(%email, "signed in");
                self.notifier.notify(Notice::success("Signed in."));
            }
            Err(err) => {
                warn!(%email, %err, "sign-in failed");
                self.notifier.notify(Notice::error(err.user_message()));
            }
        }
        result
    }

    async fn try_login(&self, email: &str, password: &str) -> Result<Option<UserProfile>, ClientError> {
        let spec = RequestSpec::post_json(LOGIN_PATH, json!({ "email": email, "password": password })).public();
        let envelope: AuthEnvelope = self.pipeline.execute(spec).await?.json().await?;
        if envelope.status != "success" {
            return Err(ClientError::LoginRejected(envelope.message.unwrap_or_else(|| {
                "Sign-in failed, check your email and password.".to_string()
            })));
        }
        if self.pipeline.credentials().get().is_none() {
            return Err(ClientError::Decode("login response carried no credentials".to_string()));
        }
        Ok(envelope.into_user())
    }

    /// Checks the stored session with the server. Goes through the refresh
    /// path when the access token has expired.
    pub async fn verify(&self) -> Result<Option<UserProfile>, ClientError> {
        let envelope: AuthEnvelope = self
            .pipeline
            .execute(RequestSpec::get(VERIFY_PATH))
            .await?
            .json()
            .await?;
        Ok(envelope.into_user())
    }

    pub fn logout(&self) -> Result<(), ClientError> {
        self.pipeline
            .credentials()
            .clear()
            .map_err(|err| ClientError::Storage(err.to_string()))?;
        info!("signed out");
        Ok(())
    }

    pub fn is_signed_in(&self) -> bool {
        self.pipeline.credentials().get().is_some()
    }
}
