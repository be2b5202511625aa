use crate::chat::ChatSettings;
use crate::pipeline::{PipelineSettings, RetryPolicy};
use crate::sse::ContentMode;
use crate::upload::{FileCategory, UploadSettings};
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const BASE_URL_ENV: &str = "QUIRE_BASE_URL";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub pipeline: PipelineSettings,
    pub chat: ChatSettings,
    pub upload: UploadSettings,
    pub credentials_dir: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("client not configured: create quire.yaml with an api base_url")]
    Missing,
    #[error("client configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing => {
                "Not configured. Create quire.yaml with `api.base_url` or set QUIRE_BASE_URL."
                    .to_string()
            }
            Self::Invalid(detail) => format!("Configuration invalid: {detail}. Update quire.yaml."),
        }
    }
}

impl ClientConfig {
    /// Loads the first `quire.yaml` found. With no file at all, a base URL
    /// from `QUIRE_BASE_URL` is enough to run on defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let env_url = std::env::var(BASE_URL_ENV).ok();
        match locate_config_file() {
            Some(path) => Self::from_path(&path, env_url),
            None => match env_url {
                Some(url) => resolve(QuireConfig::default(), Some(url)),
                None => Err(ConfigError::Missing),
            },
        }
    }

    pub fn from_path(path: &Path, base_url_override: Option<String>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_yaml(&contents, base_url_override)
    }

    pub fn from_yaml(contents: &str, base_url_override: Option<String>) -> Result<Self, ConfigError> {
        let config: QuireConfig = serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid quire.yaml: {err}")))?;
        resolve(config, base_url_override)
    }

    pub fn with_base_url(base_url: Url) -> Self {
        Self {
            base_url,
            pipeline: PipelineSettings::default(),
            chat: ChatSettings::default(),
            upload: UploadSettings::default(),
            credentials_dir: default_credentials_dir(),
        }
    }
}

fn resolve(config: QuireConfig, base_url_override: Option<String>) -> Result<ClientConfig, ConfigError> {
    let api = config.api.unwrap_or_default();
    let raw_url = base_url_override
        .filter(|url| !url.trim().is_empty())
        .or(api.base_url)
        .map(|url| url.trim().to_string())
        .unwrap_or_default();
    if raw_url.is_empty() {
        return Err(ConfigError::Invalid("missing `api.base_url`".to_string()));
    }
    let base_url = Url::parse(&raw_url)
        .map_err(|err| ConfigError::Invalid(format!("bad api.base_url `{raw_url}`: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "api.base_url must be http or https, got `{}`",
            base_url.scheme()
        )));
    }
    if api.timeout_secs == 0 {
        return Err(ConfigError::Invalid("api.timeout_secs must be positive".to_string()));
    }
    let pipeline = PipelineSettings {
        timeout: Duration::from_secs(api.timeout_secs),
        retry: RetryPolicy {
            limit: api.retry_limit,
            backoff: Duration::from_millis(api.retry_backoff_ms),
            ..RetryPolicy::default()
        },
    };

    let chat = config.chat.unwrap_or_default();
    if !(0.0..=2.0).contains(&chat.temperature) {
        return Err(ConfigError::Invalid(format!(
            "chat.temperature must be between 0 and 2, got {}",
            chat.temperature
        )));
    }
    if chat.max_tokens == 0 {
        return Err(ConfigError::Invalid("chat.max_tokens must be positive".to_string()));
    }
    let chat = ChatSettings {
        chat_path: chat.chat_path,
        stop_path: chat.stop_path,
        model: chat.model,
        temperature: chat.temperature,
        max_tokens: chat.max_tokens,
        content_mode: chat.content_mode,
    };

    let upload = config.upload.unwrap_or_default();
    let limits = [
        ("image_file_size_limit", upload.image_file_size_limit),
        ("file_size_limit", upload.file_size_limit),
        ("audio_file_size_limit", upload.audio_file_size_limit),
        ("video_file_size_limit", upload.video_file_size_limit),
    ];
    if let Some((name, _)) = limits.iter().find(|(_, limit)| *limit == 0) {
        return Err(ConfigError::Invalid(format!("upload.{name} must be positive")));
    }
    let upload = UploadSettings {
        upload_path: upload.upload_path,
        image_limit: upload.image_file_size_limit * MIB,
        document_limit: upload.file_size_limit * MIB,
        audio_limit: upload.audio_file_size_limit * MIB,
        video_limit: upload.video_file_size_limit * MIB,
        max_files: upload.max_files,
        allowed_types: upload.allowed_file_types,
        allowed_extensions: upload
            .allowed_file_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect(),
    };

    let credentials_dir = config
        .storage
        .and_then(|storage| storage.credentials_dir)
        .unwrap_or_else(default_credentials_dir);

    Ok(ClientConfig {
        base_url,
        pipeline,
        chat,
        upload,
        credentials_dir,
    })
}

fn default_credentials_dir() -> PathBuf {
    match BaseDirs::new() {
        Some(base) => base.data_dir().join("quire"),
        None => PathBuf::from(".quire"),
    }
}

fn locate_config_file() -> Option<PathBuf> {
    quire_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn quire_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("quire");
        paths.push(config_dir.join("quire.yaml"));
        paths.push(config_dir.join("quire.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".quire").join("quire.yaml"));
        paths.push(home_dir.join(".quire").join("quire.yml"));
    }
    paths.push(PathBuf::from("quire.yaml"));
    paths.push(PathBuf::from("quire.yml"));
    paths
}

#[derive(Debug, Default, Deserialize)]
struct QuireConfig {
    api: Option<ApiSection>,
    chat: Option<ChatSection>,
    upload: Option<UploadSection>,
    storage: Option<StorageSection>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ApiSection {
    base_url: Option<String>,
    timeout_secs: u64,
    retry_limit: u32,
    retry_backoff_ms: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 100,
            retry_limit: 2,
            retry_backoff_ms: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ChatSection {
    model: String,
    temperature: f32,
    max_tokens: u32,
    content_mode: ContentMode,
    chat_path: String,
    stop_path: String,
}

impl Default for ChatSection {
    fn default() -> Self {
        let defaults = ChatSettings::default();
        Self {
            model: defaults.model,
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            content_mode: defaults.content_mode,
            chat_path: defaults.chat_path,
            stop_path: defaults.stop_path,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UploadSection {
    image_file_size_limit: u64,
    file_size_limit: u64,
    audio_file_size_limit: u64,
    video_file_size_limit: u64,
    max_files: Option<usize>,
    allowed_file_types: Vec<FileCategory>,
    allowed_file_extensions: Vec<String>,
    upload_path: String,
}

impl Default for UploadSection {
    fn default() -> Self {
        let defaults = UploadSettings::default();
        Self {
            image_file_size_limit: 5,
            file_size_limit: 5,
            audio_file_size_limit: 5,
            video_file_size_limit: 5,
            max_files: None,
            allowed_file_types: defaults.allowed_types,
            allowed_file_extensions: Vec::new(),
            upload_path: defaults.upload_path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StorageSection {
    credentials_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_full_file() {
        let yaml = r#"
api:
  base_url: https://notebook.example.com/api/
  timeout_secs: 30
  retry_limit: 1
chat:
  model: local-model
  content_mode: incremental
upload:
  image_file_size_limit: 10
  max_files: 3
  allowed_file_types: [image, custom]
  allowed_file_extensions: [".ZIP", "csv"]
storage:
  credentials_dir: /tmp/quire-creds
"#;
        let config = ClientConfig::from_yaml(yaml, None).expect("config");
        assert_eq!(config.base_url.as_str(), "https://notebook.example.com/api/");
        assert_eq!(config.pipeline.timeout, Duration::from_secs(30));
        assert_eq!(config.pipeline.retry.limit, 1);
        assert_eq!(config.pipeline.retry.backoff, Duration::from_millis(300));
        assert_eq!(config.chat.model, "local-model");
        assert_eq!(config.chat.content_mode, ContentMode::Incremental);
        assert_eq!(config.chat.max_tokens, 2048);
        assert_eq!(config.upload.image_limit, 10 * MIB);
        assert_eq!(config.upload.document_limit, 5 * MIB);
        assert_eq!(config.upload.max_files, Some(3));
        assert_eq!(
            config.upload.allowed_types,
            vec![FileCategory::Image, FileCategory::Custom]
        );
        assert_eq!(config.upload.allowed_extensions, vec!["zip", "csv"]);
        assert_eq!(config.credentials_dir, PathBuf::from("/tmp/quire-creds"));
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = ClientConfig::from_yaml("api:\n  base_url: http://localhost:3000/api\n", None)
            .expect("config");
        assert_eq!(config.pipeline.timeout, Duration::from_secs(100));
        assert_eq!(config.pipeline.retry.limit, 2);
        assert_eq!(config.chat.chat_path, "llm/chat");
        assert_eq!(config.chat.content_mode, ContentMode::Cumulative);
        assert_eq!(config.upload.upload_path, "files/upload");
        assert_eq!(config.upload.video_limit, 5 * MIB);
    }

    #[test]
    fn override_wins_over_file() {
        let config = ClientConfig::from_yaml(
            "api:\n  base_url: http://localhost:3000/api\n",
            Some("https://staging.example.com/api".to_string()),
        )
        .expect("config");
        assert_eq!(config.base_url.host_str(), Some("staging.example.com"));
    }

    #[test]
    fn errors_without_base_url() {
        let err = ClientConfig::from_yaml("chat:\n  model: x\n", None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.user_message().contains("base_url"));
    }

    #[test]
    fn rejects_bad_values() {
        for yaml in [
            "api:\n  base_url: ftp://example.com\n",
            "api:\n  base_url: http://x\n  timeout_secs: 0\n",
            "api:\n  base_url: http://x\nchat:\n  temperature: 3.5\n",
            "api:\n  base_url: http://x\nupload:\n  file_size_limit: 0\n",
            "api: [not, a, map]\n",
        ] {
            assert!(
                matches!(ClientConfig::from_yaml(yaml, None), Err(ConfigError::Invalid(_))),
                "accepted {yaml:?}"
            );
        }
    }
}
