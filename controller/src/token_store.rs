use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use fireplace_common::Credential;
use tracing::{debug, warn};

use crate::error::Result;

/// Owns the persisted credential pair. Every accepted mutation is written through.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    credential: Credential,
}

impl TokenStore {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let credential = Self::load(&path).await;
        Self { path, credential }
    }

    /// Missing or unreadable records yield an empty credential.
    pub async fn load(path: &Path) -> Credential {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no credential at {}", path.display());
                return Credential::default();
            }
            Err(err) => {
                warn!("failed to read credential {}: {err}", path.display());
                return Credential::default();
            }
        };

        match serde_json::from_slice::<Credential>(&raw) {
            Ok(mut credential) => {
                credential.normalize();
                credential
            }
            Err(err) => {
                warn!("ignoring corrupt credential {}: {err}", path.display());
                Credential::default()
            }
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub async fn set_auth_code(&mut self, code: Option<&str>) -> Result<()> {
        let mut next = self.credential.clone();
        if next.set_auth_code(code) {
            self.commit(next).await?;
        }
        Ok(())
    }

    pub async fn set_refresh_token(&mut self, token: Option<&str>) -> Result<()> {
        let mut next = self.credential.clone();
        if next.set_refresh_token(token) {
            self.commit(next).await?;
        }
        Ok(())
    }

    /// Writes `next` and adopts it only once it is on disk.
    async fn commit(&mut self, next: Credential) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(&next)?;

        // Rename over the old record so a crash never leaves a half-written file.
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, payload).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        self.credential = next;
        Ok(())
    }
}
