//! Compressing, encrypting backend wrapper.
//!
//! Wraps any [`Backend`] so that object bodies are compressed then encrypted
//! on the way out, and decrypted then decompressed on the way in. The
//! chosen algorithm and the fact that the body is encrypted are recorded in
//! the object's metadata map (`compression`, `encrypted`) so a reader never
//! needs out-of-band knowledge of how a given object was stored.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::{Backend, BackendError, ObjectMetadata, ReadHandle, Result, WriteHandle};
use crate::compression::{self, Algorithm};
use crate::crypto::DataKey;

/// Buffers an entire object body in memory and compresses + encrypts it on
/// shutdown before handing it to the inner backend. Objects in this
/// filesystem are bounded by `max_obj_size`, so buffering is deliberate, not
/// an oversight.
struct EncryptingWriter {
    inner_backend: Arc<dyn Backend>,
    key: DataKey,
    algo: Algorithm,
    key_name: String,
    metadata: ObjectMetadata,
    buf: Vec<u8>,
}

impl AsyncWrite for EncryptingWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Compression/encryption/upload all happen here because AsyncWrite
        // gives no other hook that fires exactly once, when the caller
        // declares the body complete.
        let this = self.get_mut();
        let compressed = compression::compress(&this.buf, this.algo)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let ciphertext = this
            .key
            .encrypt(&compressed)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        this.metadata.insert("compression".into(), this.algo.as_str().to_string());
        this.metadata.insert("encrypted".into(), "aes256-gcm".into());

        let backend = this.inner_backend.clone();
        let key_name = this.key_name.clone();
        let metadata = this.metadata.clone();

        let fut = async move {
            let mut wh = backend
                .open_write(&key_name, metadata)
                .await
                .map_err(to_io_error)?;
            wh.stream.write_all(&ciphertext).await?;
            wh.stream.shutdown().await
        };
        let mut fut = Box::pin(fut);
        fut.as_mut().poll(cx)
    }
}

fn to_io_error(e: BackendError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

struct PlaintextReader {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for PlaintextReader {
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

pub struct EncryptingBackend {
    inner: Arc<dyn Backend>,
    key: DataKey,
    algo: Algorithm,
}

impl EncryptingBackend {
    pub fn new(inner: Arc<dyn Backend>, key: DataKey, algo: Algorithm) -> Self {
        EncryptingBackend { inner, key, algo }
    }
}

#[async_trait]
impl Backend for EncryptingBackend {
    async fn lookup(&self, key: &str) -> Result<ObjectMetadata> {
        self.inner.lookup(key).await
    }

    async fn open_read(&self, key: &str) -> Result<ReadHandle> {
        let mut rh = self.inner.open_read(key).await?;
        let mut ciphertext = Vec::new();
        rh.stream
            .read_to_end(&mut ciphertext)
            .await
            .map_err(BackendError::Io)?;

        let algo = rh
            .metadata
            .get("compression")
            .map(|s| Algorithm::parse(s))
            .transpose()
            .map_err(|e| BackendError::Permanent(e.to_string()))?
            .unwrap_or_default();

        let compressed = self
            .key
            .decrypt(&ciphertext)
            .map_err(|e| BackendError::Permanent(e.to_string()))?;
        let plaintext = compression::decompress(&compressed, algo)
            .map_err(|e| BackendError::Permanent(e.to_string()))?;

        Ok(ReadHandle {
            metadata: rh.metadata,
            stream: Box::pin(PlaintextReader { data: plaintext, pos: 0 }),
        })
    }

    async fn open_write(&self, key: &str, metadata: ObjectMetadata) -> Result<WriteHandle> {
        Ok(WriteHandle {
            stream: Box::pin(EncryptingWriter {
                inner_backend: self.inner.clone(),
                key: self.key.clone(),
                algo: self.algo,
                key_name: key.to_string(),
                metadata,
                buf: Vec::new(),
            }),
        })
    }

    async fn delete(&self, key: &str, force: bool) -> Result<()> {
        self.inner.delete(key, force).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.copy(src, dst).await
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.rename(src, dst).await
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        self.inner.contains(key).await
    }

    fn is_get_consistent(&self) -> bool {
        self.inner.is_get_consistent()
    }

    fn is_list_create_consistent(&self) -> bool {
        self.inner.is_list_create_consistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn round_trips_through_compression_and_encryption() {
        let inner = Arc::new(MemoryBackend::new());
        let key = DataKey::generate();
        let backend = EncryptingBackend::new(inner.clone(), key, Algorithm::Zlib);

        let mut wh = backend.open_write("s3ql_data_abc", ObjectMetadata::new()).await.unwrap();
        wh.stream.write_all(b"plaintext block body").await.unwrap();
        wh.stream.shutdown().await.unwrap();

        let mut rh = backend.open_read("s3ql_data_abc").await.unwrap();
        let mut got = Vec::new();
        rh.stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"plaintext block body");
    }

    #[tokio::test]
    async fn stores_ciphertext_not_plaintext_in_inner_backend() {
        let inner = Arc::new(MemoryBackend::new());
        let key = DataKey::generate();
        let backend = EncryptingBackend::new(inner.clone(), key, Algorithm::None);

        let mut wh = backend.open_write("k", ObjectMetadata::new()).await.unwrap();
        wh.stream.write_all(b"sensitive data").await.unwrap();
        wh.stream.shutdown().await.unwrap();

        let mut raw = inner.open_read("k").await.unwrap();
        let mut bytes = Vec::new();
        raw.stream.read_to_end(&mut bytes).await.unwrap();
        assert_ne!(bytes, b"sensitive data");
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decrypt() {
        let inner = Arc::new(MemoryBackend::new());
        let backend_a = EncryptingBackend::new(inner.clone(), DataKey::generate(), Algorithm::None);
        let backend_b = EncryptingBackend::new(inner.clone(), DataKey::generate(), Algorithm::None);

        let mut wh = backend_a.open_write("k", ObjectMetadata::new()).await.unwrap();
        wh.stream.write_all(b"secret").await.unwrap();
        wh.stream.shutdown().await.unwrap();

        assert!(backend_b.open_read("k").await.is_err());
    }
}
