//! In-process backend double, used by tests of layers that wrap a `Backend`
//! (crypto/compression wrapping, block cache, metadata lifecycle) so they
//! don't need a temp directory per test.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Backend, BackendError, ObjectMetadata, ReadHandle, Result, WriteHandle};

struct Object {
    metadata: ObjectMetadata,
    body: Vec<u8>,
}

struct VecReader {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for VecReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let remaining = &this.data[this.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Buffers a write in memory, committing it to the store on shutdown so
/// that a write which never completes never becomes visible.
struct PendingWrite {
    key: String,
    metadata: ObjectMetadata,
    buf: Vec<u8>,
    store: std::sync::Weak<Mutex<HashMap<String, Object>>>,
}

impl AsyncWrite for PendingWrite {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(store) = this.store.upgrade() {
            let mut guard = store.lock().unwrap();
            guard.insert(
                this.key.clone(),
                Object {
                    metadata: std::mem::take(&mut this.metadata),
                    body: std::mem::take(&mut this.buf),
                },
            );
        }
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    objects: std::sync::Arc<Mutex<HashMap<String, Object>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn lookup(&self, key: &str) -> Result<ObjectMetadata> {
        let guard = self.objects.lock().unwrap();
        guard
            .get(key)
            .map(|o| o.metadata.clone())
            .ok_or_else(|| BackendError::NoSuchObject(key.to_string()))
    }

    async fn open_read(&self, key: &str) -> Result<ReadHandle> {
        let guard = self.objects.lock().unwrap();
        let obj = guard
            .get(key)
            .ok_or_else(|| BackendError::NoSuchObject(key.to_string()))?;
        Ok(ReadHandle {
            metadata: obj.metadata.clone(),
            stream: Box::pin(VecReader {
                data: obj.body.clone(),
                pos: 0,
            }),
        })
    }

    async fn open_write(&self, key: &str, metadata: ObjectMetadata) -> Result<WriteHandle> {
        Ok(WriteHandle {
            stream: Box::pin(PendingWrite {
                key: key.to_string(),
                metadata,
                buf: Vec::new(),
                store: std::sync::Arc::downgrade(&self.objects),
            }),
        })
    }

    async fn delete(&self, key: &str, force: bool) -> Result<()> {
        let mut guard = self.objects.lock().unwrap();
        if guard.remove(key).is_some() || force {
            Ok(())
        } else {
            Err(BackendError::NoSuchObject(key.to_string()))
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let guard = self.objects.lock().unwrap();
        Ok(guard.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let mut guard = self.objects.lock().unwrap();
        let obj = guard
            .get(src)
            .map(|o| Object {
                metadata: o.metadata.clone(),
                body: o.body.clone(),
            })
            .ok_or_else(|| BackendError::NoSuchObject(src.to_string()))?;
        guard.insert(dst.to_string(), obj);
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let mut guard = self.objects.lock().unwrap();
        let obj = guard
            .remove(src)
            .ok_or_else(|| BackendError::NoSuchObject(src.to_string()))?;
        guard.insert(dst.to_string(), obj);
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn is_get_consistent(&self) -> bool {
        true
    }

    fn is_list_create_consistent(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let backend = MemoryBackend::new();
        let mut wh = backend.open_write("k", ObjectMetadata::new()).await.unwrap();
        wh.stream.write_all(b"payload").await.unwrap();
        wh.stream.shutdown().await.unwrap();

        let mut rh = backend.open_read("k").await.unwrap();
        let mut got = Vec::new();
        rh.stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"payload");
    }

    #[tokio::test]
    async fn dropped_write_never_commits() {
        let backend = MemoryBackend::new();
        {
            let mut wh = backend.open_write("k", ObjectMetadata::new()).await.unwrap();
            wh.stream.write_all(b"payload").await.unwrap();
            // dropped without shutdown
        }
        assert!(!backend.contains("k").await.unwrap());
    }

    #[tokio::test]
    async fn rename_moves_object() {
        let backend = MemoryBackend::new();
        let mut wh = backend.open_write("a", ObjectMetadata::new()).await.unwrap();
        wh.stream.shutdown().await.unwrap();
        backend.rename("a", "b").await.unwrap();
        assert!(!backend.contains("a").await.unwrap());
        assert!(backend.contains("b").await.unwrap());
    }
}
