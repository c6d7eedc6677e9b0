//! Local-directory backend.
//!
//! Stores each object as a regular file under a root directory. Grounded in
//! original_source's `backends/local.py`, including the `s3ql_data_` key
//! sharding into 3-hex-digit subdirectories and the `=`/`/`/`#` escaping of
//! `util::escape`. Departs from the source in one place (SPEC_FULL.md §9,
//! Open Question): writes go to a temp file that is fully written and
//! closed *before* the atomic rename into place, not the reverse.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::{Backend, BackendError, ObjectMetadata, ReadHandle, Result, WriteHandle};
use crate::util::escape::{escape, unescape};

/// Reads an in-memory buffer as an `AsyncRead`, used for object bodies that
/// are small enough to fit comfortably in memory (blocks and metadata
/// snapshots both are, by construction).
struct BufReader {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for BufReader {
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

/// Writes into a temp file, renaming it into place on shutdown.
struct TempFileWriter {
    file: tokio::fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    renamed: bool,
}

impl AsyncWrite for TempFileWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                if !this.renamed {
                    if let Some(parent) = this.final_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(&this.tmp_path, &this.final_path)?;
                    this.renamed = true;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(LocalBackend { root })
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let escaped = escape(key);

        if let Some(suffix) = escaped.strip_prefix("s3ql_data_") {
            // Shard by 3-hex-digit prefixes to bound directory fan-out.
            let mut path = self.root.join("s3ql_data_");
            let mut i = 0;
            while i < suffix.len() {
                let end = (i + 3).min(suffix.len());
                path = path.join(&suffix[i..end]);
                i = end;
            }
            path.join(escaped)
        } else {
            self.root.join(escaped)
        }
    }

    fn decode_object(bytes: &[u8]) -> io::Result<(ObjectMetadata, Vec<u8>)> {
        if bytes.len() < 4 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated object header"));
        }
        let header_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if bytes.len() < 4 + header_len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated object header"));
        }
        let metadata: ObjectMetadata = bincode::deserialize(&bytes[4..4 + header_len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let body = bytes[4 + header_len..].to_vec();
        Ok((metadata, body))
    }

    async fn read_object(path: &Path) -> Result<(ObjectMetadata, Vec<u8>)> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BackendError::NoSuchObject(path.display().to_string())
            } else {
                BackendError::Io(e)
            }
        })?;
        Self::decode_object(&bytes).map_err(BackendError::Io)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn lookup(&self, key: &str) -> Result<ObjectMetadata> {
        let path = self.key_to_path(key);
        let (metadata, _) = Self::read_object(&path).await?;
        Ok(metadata)
    }

    async fn open_read(&self, key: &str) -> Result<ReadHandle> {
        let path = self.key_to_path(key);
        let (metadata, body) = Self::read_object(&path).await?;
        Ok(ReadHandle {
            metadata,
            stream: Box::pin(BufReader { data: body, pos: 0 }),
        })
    }

    async fn open_write(&self, key: &str, metadata: ObjectMetadata) -> Result<WriteHandle> {
        let path = self.key_to_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));

        // Write-and-close the temp file fully before the rename (see
        // module docs: the opposite of original_source's ordering).
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;

        let header = bincode::serialize(&metadata).map_err(|e| BackendError::Permanent(e.to_string()))?;
        file.write_all(&(header.len() as u32).to_le_bytes()).await?;
        file.write_all(&header).await?;

        Ok(WriteHandle {
            stream: Box::pin(TempFileWriter {
                file,
                tmp_path,
                final_path: path,
                renamed: false,
            }),
        })
    }

    async fn delete(&self, key: &str, force: bool) -> Result<()> {
        let path = self.key_to_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if force {
                    Ok(())
                } else {
                    Err(BackendError::NoSuchObject(key.to_string()))
                }
            }
            Err(e) => Err(BackendError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BackendError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    let key = unescape(name);
                    if key.starts_with(prefix) {
                        out.push(key);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let src_path = self.key_to_path(src);
        let dst_path = self.key_to_path(dst);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src_path, &dst_path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BackendError::NoSuchObject(src.to_string())
            } else {
                BackendError::Io(e)
            }
        })?;
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let src_path = self.key_to_path(src);
        let dst_path = self.key_to_path(dst);
        if !tokio::fs::try_exists(&src_path).await.unwrap_or(false) {
            return Err(BackendError::NoSuchObject(src.to_string()));
        }
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src_path, &dst_path).await?;
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.key_to_path(key)).await.unwrap_or(false))
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
    use tokio::io::AsyncReadExt;

    async fn roundtrip(key: &str, body: &[u8]) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();

        let mut meta = ObjectMetadata::new();
        meta.insert("compression".into(), "none".into());

        let mut wh = backend.open_write(key, meta.clone()).await.unwrap();
        wh.stream.write_all(body).await.unwrap();
        wh.stream.shutdown().await.unwrap();

        let mut rh = backend.open_read(key).await.unwrap();
        let mut got = Vec::new();
        rh.stream.read_to_end(&mut got).await.unwrap();

        assert_eq!(got, body);
        assert_eq!(rh.metadata.get("compression"), Some(&"none".to_string()));
    }

    #[tokio::test]
    async fn writes_and_reads_a_plain_key() {
        roundtrip("s3ql_metadata", b"hello world").await;
    }

    #[tokio::test]
    async fn shards_data_keys_by_prefix() {
        roundtrip("s3ql_data_deadbeefcafe", b"block payload").await;
    }

    #[tokio::test]
    async fn missing_key_is_no_such_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        let err = backend.lookup("nope").await.unwrap_err();
        assert!(matches!(err, BackendError::NoSuchObject(_)));
    }

    #[tokio::test]
    async fn delete_force_swallows_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        assert!(backend.delete("nope", false).await.is_err());
        assert!(backend.delete("nope", true).await.is_ok());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        for key in ["s3ql_seq_no_1", "s3ql_seq_no_2", "s3ql_metadata"] {
            let mut wh = backend.open_write(key, ObjectMetadata::new()).await.unwrap();
            wh.stream.shutdown().await.unwrap();
        }
        let mut keys = backend.list("s3ql_seq_no_").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["s3ql_seq_no_1", "s3ql_seq_no_2"]);
    }

    #[tokio::test]
    async fn overwrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        roundtrip("k", b"first").await;

        let backend2 = LocalBackend::new(dir.path()).unwrap();
        let mut wh = backend2.open_write("k", ObjectMetadata::new()).await.unwrap();
        wh.stream.write_all(b"second").await.unwrap();
        wh.stream.shutdown().await.unwrap();

        let mut rh = backend.open_read("k").await.unwrap();
        let mut got = Vec::new();
        rh.stream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"second");
    }
}
