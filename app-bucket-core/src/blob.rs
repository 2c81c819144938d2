//! Object-storage backends and small helpers over [`ObjectStore`].
//!
//! Two backends ship with the crate: [`MemoryStore`] for tests and demos, and
//! [`FileStore`] which maps keys onto files below a root directory.
//! [`UrlOpener`] picks one of them from a bucket's connection string.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::contract::{ObjectReader, ObjectStore, ObjectWriter, StoreOpener};
use crate::error::{GatewayError, StoreError};

/// Writes `bytes` to `key` and commits the object.
pub async fn put_object(
    store: &dyn ObjectStore,
    key: &str,
    content_type: &str,
    bytes: &[u8],
) -> Result<(), StoreError> {
    let mut writer = store.write(key, content_type).await?;
    writer
        .write_all(bytes)
        .await
        .map_err(|e| StoreError::io(key, e))?;
    writer.shutdown().await.map_err(|e| StoreError::io(key, e))?;
    Ok(())
}

/// Reads the whole object at `key` into memory. Only used for small objects.
pub async fn read_object(store: &dyn ObjectStore, key: &str) -> Result<Vec<u8>, StoreError> {
    let mut reader = store.read(key).await?;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| StoreError::io(key, e))?;
    Ok(buf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: BTreeMap<String, StoredObject>,
    writes: usize,
    deletes: usize,
}

/// In-memory object store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        // A panic while holding the lock cannot leave the map half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seeds an object without counting it as a write.
    pub fn insert(&self, key: impl Into<String>, content_type: &str, bytes: impl Into<Vec<u8>>) {
        self.lock().objects.insert(
            key.into(),
            StoredObject {
                content_type: content_type.to_string(),
                bytes: bytes.into(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Number of committed writes since creation.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Number of successful deletes since creation.
    pub fn delete_count(&self) -> usize {
        self.lock().deletes
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<ObjectReader, StoreError> {
        let bytes = self
            .lock()
            .objects
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StoreError::not_found(key))?;
        Ok(Box::pin(io::Cursor::new(bytes)))
    }

    async fn write(&self, key: &str, content_type: &str) -> Result<ObjectWriter, StoreError> {
        Ok(Box::pin(MemoryWriter {
            key: key.to_string(),
            content_type: content_type.to_string(),
            buf: Vec::new(),
            inner: Arc::clone(&self.inner),
            committed: false,
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.objects.remove(key) {
            Some(_) => {
                inner.deletes += 1;
                Ok(())
            }
            None => Err(StoreError::not_found(key)),
        }
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, StoreError>> {
        let keys: Vec<String> = self
            .lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        stream::iter(keys.into_iter().map(Ok)).boxed()
    }
}

struct MemoryWriter {
    key: String,
    content_type: String,
    buf: Vec<u8>,
    inner: Arc<Mutex<MemoryInner>>,
    committed: bool,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.committed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        this.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.committed {
            let mut inner = this
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.objects.insert(
                this.key.clone(),
                StoredObject {
                    content_type: this.content_type.clone(),
                    bytes: std::mem::take(&mut this.buf),
                },
            );
            inner.writes += 1;
            this.committed = true;
        }
        Poll::Ready(Ok(()))
    }
}

/// Filesystem-backed object store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        if key.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::Backend(format!("invalid object key {key:?}")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn read(&self, key: &str) -> Result<ObjectReader, StoreError> {
        let path = self.path_for(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        Ok(Box::pin(file))
    }

    async fn write(&self, key: &str, _content_type: &str) -> Result<ObjectWriter, StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(key, e))?;
        }
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| StoreError::io(key, e))
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, StoreError>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        stream::once(async move {
            tokio::task::spawn_blocking(move || walk_keys(&root))
                .await
                .map_err(|e| StoreError::Backend(format!("list task failed: {e}")))?
        })
        .flat_map(move |res| match res {
            Ok(keys) => {
                let prefix = prefix.clone();
                stream::iter(
                    keys.into_iter()
                        .filter(move |k| k.starts_with(&prefix))
                        .map(Ok),
                )
                .boxed()
            }
            Err(e) => stream::iter(vec![Err(e)]).boxed(),
        })
        .boxed()
    }
}

fn walk_keys(root: &Path) -> Result<Vec<String>, StoreError> {
    fn visit_dir(dir: &Path, root: &Path, keys: &mut Vec<String>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                visit_dir(&path, root, keys)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }

    let mut keys = Vec::new();
    match visit_dir(root, root, &mut keys) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(StoreError::io(root.display().to_string(), e)),
    }
    keys.sort();
    Ok(keys)
}

/// Opens stores from `mem://<name>` and `file:///<root>` URLs.
///
/// In-memory stores are registered per opener, so every bucket that resolves
/// to the same `mem://` name shares one store.
#[derive(Debug, Clone, Default)]
pub struct UrlOpener {
    memory: Arc<Mutex<BTreeMap<String, MemoryStore>>>,
}

impl UrlOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the in-memory store registered under `name`, creating it if absent.
    pub fn memory(&self, name: &str) -> MemoryStore {
        self.memory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl StoreOpener for UrlOpener {
    async fn open(&self, url: &str) -> Result<Arc<dyn ObjectStore>, GatewayError> {
        let url = url.trim();
        if let Some(name) = url.strip_prefix("mem://") {
            if name.is_empty() {
                return Err(GatewayError::InvalidSpec(format!(
                    "{url}: missing store name"
                )));
            }
            return Ok(Arc::new(self.memory(name)));
        }
        if let Some(root) = url.strip_prefix("file://") {
            if !root.starts_with('/') {
                return Err(GatewayError::InvalidSpec(format!(
                    "{url}: file URLs must carry an absolute path"
                )));
            }
            let store = FileStore::new(root);
            tokio::fs::create_dir_all(store.root())
                .await
                .map_err(|e| GatewayError::Open {
                    url: url.to_string(),
                    source: StoreError::io(root, e),
                })?;
            return Ok(Arc::new(store));
        }
        Err(GatewayError::UnsupportedScheme(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn memory_store_commits_on_shutdown() {
        let store = MemoryStore::new();
        let mut writer = store.write("a/b.png", "image/png").await.unwrap();
        writer.write_all(b"abc").await.unwrap();
        assert!(!store.contains("a/b.png"));
        writer.shutdown().await.unwrap();

        let object = store.get("a/b.png").unwrap();
        assert_eq!(object.bytes, b"abc");
        assert_eq!(object.content_type, "image/png");
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn file_store_round_trip_and_sorted_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        put_object(&store, "ns/b/two.png", "image/png", b"2").await.unwrap();
        put_object(&store, "ns/a/one.png", "image/png", b"1").await.unwrap();
        put_object(&store, "other/x", "text/plain", b"x").await.unwrap();

        assert_eq!(read_object(&store, "ns/a/one.png").await.unwrap(), b"1");
        let keys: Vec<String> = store.list("ns/").try_collect().await.unwrap();
        assert_eq!(keys, vec!["ns/a/one.png", "ns/b/two.png"]);

        store.delete("ns/a/one.png").await.unwrap();
        assert!(store.delete("ns/a/one.png").await.unwrap_err().is_not_found());
        assert!(store.read("ns/a/one.png").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn file_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.write("../etc/passwd", "text/plain").await.is_err());
    }

    #[tokio::test]
    async fn opener_shares_named_memory_stores() {
        let opener = UrlOpener::new();
        let store = opener.open("mem://bucket").await.unwrap();
        put_object(store.as_ref(), "k", "text/plain", b"v").await.unwrap();
        assert!(opener.memory("bucket").contains("k"));
        assert!(matches!(
            opener.open("s3://bucket").await,
            Err(GatewayError::UnsupportedScheme(_))
        ));
    }
}
