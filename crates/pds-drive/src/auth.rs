use crate::{DriveClient, DriveError, LocalFsDriveClient};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Yields an authenticated [`DriveClient`]. A real SRP/OpenPGP-backed
/// provider is out of scope (§6); the engine retries `login` with
/// exponential backoff (1s, 4s, 16s, 64s, 256s) on a connection failure and
/// treats any other error as fatal to startup.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn login(&self) -> Result<Arc<dyn DriveClient>, DriveError>;
}

/// A no-op provider for local testing: hands back a
/// [`LocalFsDriveClient`] rooted at a directory instead of a real API
/// session.
pub struct NoOpAuthProvider {
    root: PathBuf,
}

impl NoOpAuthProvider {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl AuthProvider for NoOpAuthProvider {
    async fn login(&self) -> Result<Arc<dyn DriveClient>, DriveError> {
        Ok(Arc::new(LocalFsDriveClient::new(self.root.clone())))
    }
}
