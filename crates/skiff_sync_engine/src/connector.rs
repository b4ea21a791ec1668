//! Application-provided backend integration.

use crate::error::{SyncError, SyncResult, UploadError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use skiff_storage::BucketStorage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Credentials for the sync service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Service base URL, without a trailing slash.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
    /// When the token expires, if known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Creates credentials without an expiry.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            expires_at: None,
        }
    }

    /// Sets the expiry.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Checks that the endpoint can be joined with request paths.
    pub fn validate(&self) -> SyncResult<()> {
        if self.endpoint.is_empty() {
            return Err(SyncError::InvalidCredentials("empty endpoint".into()));
        }
        if self.endpoint.ends_with('/') {
            return Err(SyncError::InvalidCredentials(format!(
                "endpoint must not end with a slash: {}",
                self.endpoint
            )));
        }
        Ok(())
    }

    /// Returns the time left until the token should be refreshed.
    ///
    /// `None` if the token has no expiry.
    pub fn refresh_in(&self, margin: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let expires_at = self.expires_at?;
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        let left = expires_at - margin - now;
        Some(left.to_std().unwrap_or(Duration::ZERO))
    }
}

/// Connects the engine to the application backend.
///
/// `upload_data` reads pending writes from the queue, applies them to the
/// backend and completes them. Returning a [`UploadError`] with
/// [`crate::UploadErrorKind::Fatal`] makes the engine discard the failing
/// transaction.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns credentials, or `None` if the user is not signed in.
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>>;

    /// Uploads pending local writes.
    async fn upload_data(&self, storage: &Arc<BucketStorage>) -> Result<(), UploadError>;
}

/// Caches credentials until shortly before they expire.
pub struct CredentialsCache {
    connector: Arc<dyn Connector>,
    margin: Duration,
    cached: Mutex<Option<Credentials>>,
}

impl CredentialsCache {
    /// Creates an empty cache.
    pub fn new(connector: Arc<dyn Connector>, margin: Duration) -> Self {
        Self {
            connector,
            margin,
            cached: Mutex::new(None),
        }
    }

    /// Returns cached credentials or fetches fresh ones.
    pub async fn get(&self) -> SyncResult<Option<Credentials>> {
        let now = Utc::now();
        let cached = self.cached.lock().clone();
        if let Some(cached) = cached {
            if cached.refresh_in(self.margin, now) != Some(Duration::ZERO) {
                return Ok(Some(cached));
            }
        }

        let fetched = self.connector.fetch_credentials().await?;
        if let Some(credentials) = &fetched {
            credentials.validate()?;
            debug!(endpoint = %credentials.endpoint, "fetched credentials");
        }
        *self.cached.lock() = fetched.clone();
        Ok(fetched)
    }

    /// Forces the next [`CredentialsCache::get`] to fetch.
    pub fn invalidate(&self) {
        if self.cached.lock().take().is_some() {
            debug!("invalidated credentials");
        }
    }

    /// Returns the time until the cached credentials should be refreshed.
    pub fn refresh_in(&self) -> Option<Duration> {
        self.cached
            .lock()
            .as_ref()
            .and_then(|c| c.refresh_in(self.margin, Utc::now()))
    }
}

impl std::fmt::Debug for CredentialsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsCache")
            .field("margin", &self.margin)
            .field("cached", &self.cached.lock().is_some())
            .finish()
    }
}

type UploadHandler = Box<dyn FnMut(&Arc<BucketStorage>) -> Result<(), UploadError> + Send>;

/// In-memory connector for tests.
///
/// Uploads complete the next queued transaction unless a result was
/// scripted with [`MockConnector::push_upload_result`].
pub struct MockConnector {
    credentials: Mutex<Option<Credentials>>,
    upload_results: Mutex<VecDeque<Result<(), UploadError>>>,
    handler: Mutex<Option<UploadHandler>>,
    fetches: AtomicUsize,
    uploads: AtomicUsize,
}

impl MockConnector {
    /// Creates a connector that returns the given credentials.
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials: Mutex::new(credentials),
            upload_results: Mutex::new(VecDeque::new()),
            handler: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Creates a connector with non-expiring credentials for `endpoint`.
    pub fn signed_in(endpoint: &str) -> Self {
        Self::new(Some(Credentials::new(endpoint, "token")))
    }

    /// Replaces the credentials.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.lock() = credentials;
    }

    /// Queues the result of the next upload. The queue is not touched.
    pub fn push_upload_result(&self, result: Result<(), UploadError>) {
        self.upload_results.lock().push_back(result);
    }

    /// Replaces the default upload behavior.
    pub fn set_upload_handler(
        &self,
        handler: impl FnMut(&Arc<BucketStorage>) -> Result<(), UploadError> + Send + 'static,
    ) {
        *self.handler.lock() = Some(Box::new(handler));
    }

    /// Returns how often credentials were fetched.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Returns how often uploads were attempted.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credentials>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.credentials.lock().clone())
    }

    async fn upload_data(&self, storage: &Arc<BucketStorage>) -> Result<(), UploadError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.upload_results.lock().pop_front() {
            return result;
        }
        if let Some(handler) = self.handler.lock().as_mut() {
            return handler(storage);
        }
        if let Some(transaction) = storage.next_crud_transaction()? {
            transaction.complete(None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_validation() {
        assert!(Credentials::new("https://sync.example.com", "t").validate().is_ok());
        assert!(matches!(
            Credentials::new("https://sync.example.com/", "t").validate(),
            Err(SyncError::InvalidCredentials(_))
        ));
        assert!(Credentials::new("", "t").validate().is_err());
    }

    #[test]
    fn refresh_window() {
        let now = Utc::now();
        let creds = Credentials::new("https://a", "t")
            .with_expires_at(now + chrono::Duration::seconds(90));
        let left = creds.refresh_in(Duration::from_secs(30), now).unwrap();
        assert_eq!(left, Duration::from_secs(60));

        let expired = Credentials::new("https://a", "t")
            .with_expires_at(now + chrono::Duration::seconds(10));
        assert_eq!(
            expired.refresh_in(Duration::from_secs(30), now),
            Some(Duration::ZERO)
        );
        assert_eq!(Credentials::new("https://a", "t").refresh_in(Duration::ZERO, now), None);
    }

    #[tokio::test]
    async fn cache_reuses_until_invalidated() {
        let connector = Arc::new(MockConnector::signed_in("https://a"));
        let cache = CredentialsCache::new(connector.clone(), Duration::from_secs(30));

        assert!(cache.get().await.unwrap().is_some());
        assert!(cache.get().await.unwrap().is_some());
        assert_eq!(connector.fetch_count(), 1);

        cache.invalidate();
        cache.get().await.unwrap();
        assert_eq!(connector.fetch_count(), 2);
    }

    #[tokio::test]
    async fn cache_refetches_expiring_credentials() {
        let connector = Arc::new(MockConnector::new(Some(
            Credentials::new("https://a", "t").with_expires_at(Utc::now() + chrono::Duration::seconds(5)),
        )));
        let cache = CredentialsCache::new(connector.clone(), Duration::from_secs(30));

        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(connector.fetch_count(), 2);
    }

    #[tokio::test]
    async fn cache_rejects_trailing_slash() {
        let connector = Arc::new(MockConnector::signed_in("https://a/"));
        let cache = CredentialsCache::new(connector, Duration::from_secs(30));
        assert!(matches!(cache.get().await, Err(SyncError::InvalidCredentials(_))));
    }
}
