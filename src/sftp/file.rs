//! `SftpFile`: a handle-lifetime-safe remote file, and the `OpenOptions`
//! builder that creates one.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use derive_destructure2::destructure;

use crate::config::SFTP_MAX_WRITE_LEN;
use crate::error::Result;

use super::attrs::SftpAttributes;
use super::client::SftpClient;
use super::protocol::{
    SSH_FXF_APPEND, SSH_FXF_CREAT, SSH_FXF_EXCL, SSH_FXF_READ, SSH_FXF_TRUNC, SSH_FXF_WRITE,
};

/// Builds the `pflags` bitmask an `OPEN` request sends, mirroring
/// `std::fs::OpenOptions`'s chaining shape.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    truncate: bool,
    create_new: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, value: bool) -> &mut Self {
        self.read = value;
        self
    }

    pub fn write(&mut self, value: bool) -> &mut Self {
        self.write = value;
        self
    }

    pub fn append(&mut self, value: bool) -> &mut Self {
        self.append = value;
        self
    }

    pub fn create(&mut self, value: bool) -> &mut Self {
        self.create = value;
        self
    }

    pub fn truncate(&mut self, value: bool) -> &mut Self {
        self.truncate = value;
        self
    }

    pub fn create_new(&mut self, value: bool) -> &mut Self {
        self.create_new = value;
        self
    }

    fn pflags(&self) -> u32 {
        let mut flags = 0;
        if self.read {
            flags |= SSH_FXF_READ;
        }
        if self.write {
            flags |= SSH_FXF_WRITE;
        }
        if self.append {
            flags |= SSH_FXF_APPEND;
        }
        if self.truncate {
            flags |= SSH_FXF_TRUNC;
        }
        if self.create_new {
            flags |= SSH_FXF_CREAT | SSH_FXF_EXCL;
        } else if self.create {
            flags |= SSH_FXF_CREAT;
        }
        flags
    }

    pub async fn open(&self, client: &SftpClient, path: &str) -> Result<SftpFile> {
        let handle = client
            .open_handle(path, self.pflags(), &SftpAttributes::default())
            .await?;
        Ok(SftpFile::from_parts(client.clone(), handle))
    }
}

/// A remote file opened over SFTP.
///
/// `close` consumes `self`, so the type system rules out any operation on an
/// already-closed handle; a handle dropped without `close` is logged as a
/// leak rather than silently reclaimed (closing it would need a network
/// round trip this type can't make from `Drop`). A handle that is still
/// open but whose connection has died is a separate, dynamically-checked
/// case: the underlying [`SftpClient`] fails such calls immediately with
/// [`Error::FileHandleInvalid`](crate::error::Error::FileHandleInvalid)
/// rather than attempting a round trip.
#[derive(destructure)]
pub struct SftpFile {
    client: SftpClient,
    handle: Bytes,
    position: AtomicU64,
}

impl SftpFile {
    pub(crate) fn from_parts(client: SftpClient, handle: Bytes) -> Self {
        Self {
            client,
            handle,
            position: AtomicU64::new(0),
        }
    }

    /// The handle's current read/write cursor.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    /// Move the cursor. Takes effect on the next `read`/`write`; SFTP reads
    /// and writes are always explicitly offset, so this has no network
    /// effect until then.
    pub fn seek(&self, offset: u64) {
        self.position.store(offset, Ordering::Relaxed);
    }

    /// Read up to `max_len` bytes at the current position, advancing it by
    /// however many bytes came back. Returns an empty buffer on EOF.
    pub async fn read(&self, max_len: u32) -> Result<Bytes> {
        let offset = self.position.load(Ordering::Relaxed);
        match self.client.read_chunk(&self.handle, offset, max_len).await? {
            Some(data) => {
                self.position
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(data)
            }
            None => Ok(Bytes::new()),
        }
    }

    /// Read from the current position to EOF. Uses the file's advertised
    /// size (via `FSTAT`) to bound the loop when available; otherwise reads
    /// until a zero-byte/`EOF` reply.
    pub async fn read_all(&self) -> Result<Bytes> {
        let size_hint = self
            .client
            .fstat(&self.handle)
            .await
            .ok()
            .and_then(|a| a.size);

        let mut out = BytesMut::new();
        loop {
            let offset = self.position.load(Ordering::Relaxed);
            if let Some(size) = size_hint {
                if offset >= size {
                    break;
                }
            }

            match self.client.read_chunk(&self.handle, offset, u32::MAX).await? {
                Some(data) if !data.is_empty() => {
                    self.position
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    out.extend_from_slice(&data);
                }
                _ => break,
            }
        }
        Ok(out.freeze())
    }

    /// Write `data` at the current position, slicing into frames no larger
    /// than [`SFTP_MAX_WRITE_LEN`] and sending them sequentially so offsets
    /// stay contiguous.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let chunk_len = data.len().min(SFTP_MAX_WRITE_LEN);
            let (chunk, rest) = data.split_at(chunk_len);

            let offset = self.position.load(Ordering::Relaxed);
            self.client.write_chunk(&self.handle, offset, chunk).await?;
            self.position
                .fetch_add(chunk_len as u64, Ordering::Relaxed);

            data = rest;
        }
        Ok(())
    }

    pub async fn metadata(&self) -> Result<SftpAttributes> {
        self.client.fstat(&self.handle).await
    }

    pub async fn set_metadata(&self, attrs: &SftpAttributes) -> Result<()> {
        self.client.fsetstat(&self.handle, attrs).await
    }

    /// Close the handle, sending exactly one `CLOSE`.
    pub async fn close(self) -> Result<()> {
        let (client, handle, _position) = self.destructure();
        client.close_handle(&handle).await
    }
}

impl std::fmt::Debug for SftpFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpFile")
            .field("position", &self.position())
            .finish()
    }
}

impl Drop for SftpFile {
    fn drop(&mut self) {
        tracing::warn!("sftp file handle dropped without being closed");
    }
}
