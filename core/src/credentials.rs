use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const CREDENTIAL_FILE: &str = "credentials.json";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode credentials: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Readers always see a whole pair: the cached value is swapped under a
/// write lock only after the file on disk has been replaced by rename.
#[derive(Clone)]
pub struct CredentialStore {
    root: PathBuf,
    current: Arc<RwLock<Option<Credential>>>,
}

impl CredentialStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CredentialError::Write {
            path: root.clone(),
            source,
        })?;
        let current = load(&root.join(CREDENTIAL_FILE));
        Ok(Self {
            root,
            current: Arc::new(RwLock::new(current)),
        })
    }

    pub fn in_memory() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("quire-credentials-{}", Uuid::new_v4()));
        fs::create_dir_all(&path).ok();
        Self {
            root: path,
            current: Arc::new(RwLock::new(None)),
        }
    }

    fn file_path(&self) -> PathBuf {
        self.root.join(CREDENTIAL_FILE)
    }

    pub fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|c| c.access_token.clone())
    }

    /// Replaces the live credential. Returns only after the pair is on disk.
    pub fn set(&self, credential: Credential) -> Result<(), CredentialError> {
        let mut current = self.current.write();
        let path = self.file_path();
        let staging = self.root.join(format!("{CREDENTIAL_FILE}.{}.tmp", Uuid::new_v4()));
        let serialized = serde_json::to_vec(&credential)?;
        write_private(&staging, &serialized).map_err(|source| CredentialError::Write {
            path: staging.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&staging, &path) {
            let _ = fs::remove_file(&staging);
            return Err(CredentialError::Write { path, source });
        }
        *current = Some(credential);
        Ok(())
    }

    /// Erases the credential. Clearing an empty store is a no-op.
    pub fn clear(&self) -> Result<(), CredentialError> {
        let mut current = self.current.write();
        let path = self.file_path();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(CredentialError::Remove { path, source }),
        }
        *current = None;
        Ok(())
    }
}

fn load(path: &Path) -> Option<Credential> {
    let contents = fs::read(path).ok()?;
    match serde_json::from_slice(&contents) {
        Ok(credential) => Some(credential),
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unreadable credential file");
            None
        }
    }
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
