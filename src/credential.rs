use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, trace};

use crate::types::{DeviceId, SecretKey};
use crate::util::fs::safe_write_all;

// IMPORTANT: be VERY careful making changes to the Credential struct.
// It is persisted to disk and a failure to deserialize it will cause
// the device *to lose identity* and stop connecting altogether. When
// making changes always consider how you'll migrate from an older
// version of this struct.

/// The identity a device uses to authenticate with the remote service.
///
/// The device id and host endpoint are fixed for the process lifetime;
/// the secret key changes only through a successful rotation and is
/// persisted immediately after.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Credential {
    pub device_id: DeviceId,
    pub host_endpoint: String,
    pub secret_key: SecretKey,
}

impl Credential {
    pub fn new<D, H, K>(device_id: D, host_endpoint: H, secret_key: K) -> Self
    where
        D: Into<DeviceId>,
        H: Into<String>,
        K: Into<SecretKey>,
    {
        Self {
            device_id: device_id.into(),
            host_endpoint: host_endpoint.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Whether all identity fields have been set.
    ///
    /// A default (zero-value) credential comes from a first run with no
    /// prior stored state and cannot be used to connect.
    pub fn is_initialized(&self) -> bool {
        !self.device_id.is_empty() && !self.host_endpoint.is_empty() && !self.secret_key.is_empty()
    }

    /// A copy of this credential with the secret key replaced
    pub fn with_secret_key<K: Into<SecretKey>>(&self, secret_key: K) -> Self {
        Self {
            secret_key: secret_key.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("credential storage is unavailable: {0}")]
    Unavailable(#[source] io::Error),

    #[error("stored credential is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("failed to persist credential: {0}")]
    WriteFailed(#[source] io::Error),
}

/// A filesystem backed store for the device credential
///
/// Writes are atomic but there is no concurrency control; the
/// connection supervisor is the single writer.
#[derive(Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored credential.
    ///
    /// Returns a zero-value credential if no prior state exists. Fails
    /// only if the backing file exists but is unreadable or corrupt.
    pub async fn load(&self) -> Result<Credential, CredentialStoreError> {
        trace!("reading {}", self.path.display());
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                // We have a previously saved credential
                let credential = serde_json::from_str::<Credential>(&contents)
                    .map_err(CredentialStoreError::Corrupt)?;
                Ok(credential)
            }
            Err(err) => match err.kind() {
                // We don't have a saved credential; first run
                io::ErrorKind::NotFound => Ok(Credential::default()),

                // We have a credential but failed to load it
                _ => Err(CredentialStoreError::Unavailable(err)),
            },
        }
    }

    /// Persist the credential, overwriting any prior state.
    ///
    /// The write is atomic: a crash mid-persist never leaves a
    /// partially-written credential observable on the next load.
    pub async fn persist(&self, credential: &Credential) -> Result<(), CredentialStoreError> {
        debug!("storing credential at {}", self.path.display());

        // pretty-print so the stored secret stays human-diffable
        let buf =
            serde_json::to_vec_pretty(credential).map_err(CredentialStoreError::Corrupt)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(CredentialStoreError::WriteFailed)?;
        }

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || safe_write_all(path, &buf))
            .await
            .expect("safe_write_all should not panic")
            .map_err(CredentialStoreError::WriteFailed)?;
        Ok(())
    }
}
