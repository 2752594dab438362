//! Document stores: where page documents live.
//!
//! Two stores back each deployment: the private workspace (mutable,
//! no-cache) and the public one (read-only copies behind a CDN). Both
//! speak the same trait; the kernel never cares which object store is
//! underneath.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use snafu::{Location, ResultExt as _, Snafu};
use tracing::debug;

const LOG_TARGET: &str = "aide::store";

pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";
pub const WORKSPACE_CACHE_CONTROL: &str = "no-cache";
pub const PUBLIC_CACHE_CONTROL: &str = "public, max-age=60";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    pub body: String,
    pub content_type: &'static str,
    pub cache_control: &'static str,
}

impl Document {
    pub fn workspace_html(body: String) -> Self {
        Self {
            body,
            content_type: CONTENT_TYPE_HTML,
            cache_control: WORKSPACE_CACHE_CONTROL,
        }
    }

    pub fn public_html(body: String) -> Self {
        Self {
            body,
            content_type: CONTENT_TYPE_HTML,
            cache_control: PUBLIC_CACHE_CONTROL,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("I/O error on `{key}`"))]
    Io {
        key: String,
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Invalid store key `{key}`"))]
    InvalidKey { key: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Document>>;
    async fn put(&self, key: &str, document: Document) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Filesystem-backed store. Writes go to a sibling temp file first and
/// land with a rename, so readers never observe a torn document.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|seg| seg == "..") {
            return InvalidKeySnafu { key }.fail();
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl DocumentStore for FsStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Document>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(Document::workspace_html(body))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(IoSnafu { key }),
        }
    }

    async fn put(&self, key: &str, document: Document) -> StoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(IoSnafu { key })?;
        }
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, document.body.as_bytes())
            .await
            .context(IoSnafu { key })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context(IoSnafu { key })?;
        debug!(target: LOG_TARGET, key, bytes = document.body.len(), "Stored document");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(IoSnafu { key }),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// In-memory store for tests and single-process development.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("Locking failed")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Document>> {
        Ok(self.inner.lock().expect("Locking failed").get(key).cloned())
    }

    async fn put(&self, key: &str, document: Document) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("Locking failed")
            .insert(key.to_owned(), document);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.lock().expect("Locking failed").remove(key);
        Ok(())
    }
}

/// A store that fails the first `n` writes; exercises the save retry.
#[cfg(test)]
pub(crate) struct FlakyStore {
    pub inner: MemoryStore,
    pub failures_left: Mutex<u32>,
}

#[cfg(test)]
#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Document>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, document: Document) -> StoreResult<()> {
        {
            let mut left = self.failures_left.lock().expect("Locking failed");
            if 0 < *left {
                *left -= 1;
                return Err(std::io::Error::other("injected failure"))
                    .context(IoSnafu { key });
            }
        }
        self.inner.put(key, document).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }
}
