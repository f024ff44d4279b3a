use crate::error::StreamError;
use async_trait::async_trait;
use std::path::PathBuf;

/// Supplies the upstream session cookie for one outbound call.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    async fn load(&self) -> Result<String, StreamError>;
}

/// Reads the cookie from disk on every call so a rotated file is picked up
/// without restarting.
#[derive(Debug, Clone)]
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for CookieFile {
    async fn load(&self) -> Result<String, StreamError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            tracing::error!(path = %self.path.display(), "failed to read cookie file: {err}");
            StreamError::CredentialUnavailable(format!("{}: {}", self.path.display(), err))
        })?;
        let cookie = raw.trim();
        if cookie.is_empty() {
            return Err(StreamError::CredentialUnavailable(format!(
                "{}: empty",
                self.path.display()
            )));
        }
        Ok(cookie.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StaticCredential(pub String);

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn load(&self) -> Result<String, StreamError> {
        if self.0.trim().is_empty() {
            return Err(StreamError::CredentialUnavailable("empty".to_string()));
        }
        Ok(self.0.clone())
    }
}
