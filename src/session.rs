// VecShelf — session.rs
// Explicit backend session: open, shared by every component, closed on exit.
// Author: d65v <https://github.com/d65v>

use std::time::Duration;

use crate::backend::VectorBackend;
use crate::local::LocalBackend;
use crate::{Result, ShelfConfig, ShelfError};

// ── Retry Policy ──────────────────────────────────────────────────────────────

/// Backoff for operations that are safe to re-issue after a transient failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries)
    pub max_retries: usize,
    /// Base delay in milliseconds, doubled per attempt
    pub base_delay_ms: u64,
    /// Upper bound on a single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63);
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    backend: Box<dyn VectorBackend>,
    uri: String,
    retry: RetryPolicy,
    closed: bool,
}

impl Session {
    /// Open a session on a built-in backend.
    ///
    /// `memory://` starts an ephemeral backend; `local://<dir>` a persistent
    /// one rooted at `<dir>`.
    ///
    /// # Errors
    /// `ShelfError::Config` for any other scheme; backend errors from connect.
    pub fn open(uri: &str, token: &str) -> Result<Self> {
        let backend: Box<dyn VectorBackend> = if uri == "memory://" {
            Box::new(LocalBackend::in_memory())
        } else if let Some(dir) = uri.strip_prefix("local://") {
            if dir.is_empty() {
                return Err(ShelfError::Config(format!("'{}' names no directory", uri)));
            }
            Box::new(LocalBackend::open(dir)?)
        } else {
            return Err(ShelfError::Config(format!(
                "unsupported backend uri '{}': use local://<dir> or memory://, \
                 or hand a VectorBackend to Session::with_backend",
                uri
            )));
        };
        Self::with_backend(uri, backend, token, RetryPolicy::default())
    }

    /// Open a session from config (uri, token, retry count).
    pub fn from_config(config: &ShelfConfig) -> Result<Self> {
        let mut session = Self::open(&config.uri, &config.token)?;
        session.retry.max_retries = config.max_retries;
        Ok(session)
    }

    /// Wrap an already-constructed backend and authenticate.
    pub fn with_backend(
        uri: &str,
        backend: Box<dyn VectorBackend>,
        token: &str,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut session = Self {
            backend,
            uri: uri.to_string(),
            retry,
            closed: false,
        };
        session.retrying("connect", |b| b.connect(token))?;
        log::info!("session opened on {}", session.uri);
        Ok(session)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn backend(&self) -> &dyn VectorBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn VectorBackend {
        self.backend.as_mut()
    }

    /// Run `f`, re-issuing it on transient errors per the retry policy.
    /// Only pass operations that are idempotent.
    pub fn retrying<T, F>(&mut self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&mut dyn VectorBackend) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match f(self.backend.as_mut()) {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    log::warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        op,
                        e,
                        attempt + 1,
                        self.retry.max_retries,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Close the backend connection.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        log::info!("session on {} closed", self.uri);
        self.backend.close()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.backend.close() {
                log::warn!("closing session on {}: {}", self.uri, e);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{
        BackendHit, CollectionInfo, InsertOutcome, LoadState, SearchRequest,
    };
    use crate::schema::{CollectionSchema, IndexSpec, Row};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Wraps a LocalBackend and fails the first `failures` calls of the
    /// chosen operation with a transient error.
    pub(crate) struct FlakyBackend {
        pub inner: LocalBackend,
        pub op: &'static str,
        pub failures: Arc<AtomicUsize>,
    }

    impl FlakyBackend {
        pub(crate) fn new(op: &'static str, failures: usize) -> (Self, Arc<AtomicUsize>) {
            let counter = Arc::new(AtomicUsize::new(failures));
            (
                Self {
                    inner: LocalBackend::in_memory(),
                    op,
                    failures: counter.clone(),
                },
                counter,
            )
        }

        fn trip(&self, op: &'static str) -> Result<()> {
            if op == self.op
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(ShelfError::Transient {
                    op,
                    reason: "connection reset by peer".into(),
                });
            }
            Ok(())
        }
    }

    impl VectorBackend for FlakyBackend {
        fn connect(&mut self, token: &str) -> Result<()> {
            self.trip("connect")?;
            self.inner.connect(token)
        }
        fn list_databases(&self) -> Result<Vec<String>> {
            self.trip("list_databases")?;
            self.inner.list_databases()
        }
        fn create_database(&mut self, name: &str) -> Result<()> {
            self.trip("create_database")?;
            self.inner.create_database(name)
        }
        fn drop_database(&mut self, name: &str) -> Result<()> {
            self.trip("drop_database")?;
            self.inner.drop_database(name)
        }
        fn use_database(&mut self, name: &str) -> Result<()> {
            self.trip("use_database")?;
            self.inner.use_database(name)
        }
        fn current_database(&self) -> Option<String> {
            self.inner.current_database()
        }
        fn list_collections(&self) -> Result<Vec<String>> {
            self.trip("list_collections")?;
            self.inner.list_collections()
        }
        fn has_collection(&self, name: &str) -> Result<bool> {
            self.trip("has_collection")?;
            self.inner.has_collection(name)
        }
        fn create_collection(
            &mut self,
            name: &str,
            schema: &CollectionSchema,
            indexes: &[IndexSpec],
        ) -> Result<()> {
            self.trip("create_collection")?;
            self.inner.create_collection(name, schema, indexes)
        }
        fn describe_collection(&self, name: &str) -> Result<CollectionInfo> {
            self.inner.describe_collection(name)
        }
        fn drop_collection(&mut self, name: &str) -> Result<()> {
            self.trip("drop_collection")?;
            self.inner.drop_collection(name)
        }
        fn get_load_state(&self, collection: &str) -> Result<LoadState> {
            self.trip("get_load_state")?;
            self.inner.get_load_state(collection)
        }
        fn load_collection(&mut self, collection: &str) -> Result<()> {
            self.inner.load_collection(collection)
        }
        fn release_collection(&mut self, collection: &str) -> Result<()> {
            self.inner.release_collection(collection)
        }
        fn insert(&mut self, collection: &str, rows: &[Row]) -> Result<InsertOutcome> {
            self.trip("insert")?;
            self.inner.insert(collection, rows)
        }
        fn flush(&mut self, collection: &str) -> Result<()> {
            self.trip("flush")?;
            self.inner.flush(collection)
        }
        fn row_count(&self, collection: &str) -> Result<usize> {
            self.inner.row_count(collection)
        }
        fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<Vec<BackendHit>>> {
            self.trip("search")?;
            self.inner.search(request)
        }
        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
    }

    pub(crate) fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn test_open_memory_session() {
        let session = Session::open("memory://", "root:Milvus").unwrap();
        assert_eq!(session.uri(), "memory://");
        assert!(session.backend().list_databases().is_ok());
        session.close().unwrap();
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let err = Session::open("http://localhost:19530", "root:Milvus").err().unwrap();
        assert!(matches!(err, ShelfError::Config(_)));
    }

    #[test]
    fn test_retry_recovers_from_transient_connect() {
        let (flaky, left) = FlakyBackend::new("connect", 2);
        let session =
            Session::with_backend("test://", Box::new(flaky), "t", quick_retry()).unwrap();
        assert_eq!(left.load(Ordering::SeqCst), 0);
        assert!(session.backend().list_databases().is_ok());
    }

    #[test]
    fn test_retry_gives_up_after_budget() {
        let (flaky, _) = FlakyBackend::new("connect", 10);
        let err = Session::with_backend("test://", Box::new(flaky), "t", quick_retry())
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_no_retry_fails_on_first_transient() {
        let (flaky, left) = FlakyBackend::new("connect", 1);
        let err = Session::with_backend("test://", Box::new(flaky), "t", RetryPolicy::no_retry())
            .err()
            .unwrap();
        assert!(err.is_retryable());
        assert_eq!(left.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_from_config_sets_retry_budget() {
        let cfg = ShelfConfig {
            uri: "memory://".into(),
            max_retries: 7,
            ..ShelfConfig::default()
        };
        let session = Session::from_config(&cfg).unwrap();
        assert_eq!(session.retry_policy().max_retries, 7);
        assert_eq!(RetryPolicy::no_retry().max_retries, 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(10), Duration::from_millis(1_000));
    }
}
