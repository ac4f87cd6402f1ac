//! SFTP server core: the inverse of [`super::client`]. Parses inbound
//! requests, dispatches them to a pluggable [`SftpFilesystem`] delegate, and
//! replies on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::{Channel, ChannelMessage};
use crate::error::{Error, Result};

use super::attrs::SftpAttributes;
use super::client::DirEntry;
use super::protocol::{
    put_string, Frame, Reader, SftpCodec, StatusCode, SSH2_FILEXFER_VERSION, SSH_FXP_ATTRS,
    SSH_FXP_CLOSE, SSH_FXP_DATA, SSH_FXP_EXTENDED, SSH_FXP_FSETSTAT, SSH_FXP_FSTAT,
    SSH_FXP_HANDLE, SSH_FXP_INIT, SSH_FXP_LSTAT, SSH_FXP_MKDIR, SSH_FXP_NAME, SSH_FXP_OPEN,
    SSH_FXP_OPENDIR, SSH_FXP_READ, SSH_FXP_READDIR, SSH_FXP_READLINK, SSH_FXP_REALPATH,
    SSH_FXP_REMOVE, SSH_FXP_RENAME, SSH_FXP_RMDIR, SSH_FXP_SETSTAT, SSH_FXP_STAT, SSH_FXP_STATUS,
    SSH_FXP_SYMLINK, SSH_FXP_VERSION, SSH_FXP_WRITE,
};

/// The capability set a server-side filesystem delegate exposes.
///
/// Every method defaults to [`Error::Unsupported`] (mapped to
/// `SSH_FX_OP_UNSUPPORTED` on the wire), so a delegate only needs to
/// implement the operations it actually supports.
#[async_trait::async_trait]
pub trait SftpFilesystem: Send + Sync {
    async fn open_file(
        &self,
        _path: &str,
        _pflags: u32,
        _attrs: &SftpAttributes,
    ) -> Result<Box<dyn FileHandle>> {
        Err(Error::Unsupported)
    }

    async fn open_directory(&self, _path: &str) -> Result<Box<dyn DirHandle>> {
        Err(Error::Unsupported)
    }

    async fn file_attributes(&self, _path: &str, _follow_symlinks: bool) -> Result<SftpAttributes> {
        Err(Error::Unsupported)
    }

    async fn set_file_attributes(&self, _path: &str, _attrs: &SftpAttributes) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn remove_file(&self, _path: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn create_directory(&self, _path: &str, _attrs: &SftpAttributes) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn remove_directory(&self, _path: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn real_path(&self, _path: &str) -> Result<String> {
        Err(Error::Unsupported)
    }

    async fn add_symlink(&self, _target_path: &str, _link_path: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    async fn read_symlink(&self, _path: &str) -> Result<String> {
        Err(Error::Unsupported)
    }

    async fn rename(&self, _old_path: &str, _new_path: &str) -> Result<()> {
        Err(Error::Unsupported)
    }
}

/// A server-side open file, returned by [`SftpFilesystem::open_file`].
#[async_trait::async_trait]
pub trait FileHandle: Send + Sync {
    /// Read up to `len` bytes at `offset`. `None` signals EOF.
    async fn read(&mut self, offset: u64, len: u32) -> Result<Option<Bytes>>;

    async fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    async fn attributes(&self) -> Result<SftpAttributes> {
        Err(Error::Unsupported)
    }

    async fn set_attributes(&mut self, _attrs: &SftpAttributes) -> Result<()> {
        Err(Error::Unsupported)
    }
}

/// A server-side open directory, returned by [`SftpFilesystem::open_directory`].
#[async_trait::async_trait]
pub trait DirHandle: Send + Sync {
    /// Return the next batch of entries, or `None` once exhausted.
    async fn next_batch(&mut self) -> Result<Option<Vec<DirEntry>>>;
}

enum OpenHandle {
    File(Box<dyn FileHandle>),
    Dir(Box<dyn DirHandle>),
}

/// Dispatches SFTP requests arriving on one subsystem channel to a
/// [`SftpFilesystem`] delegate and writes the replies.
pub struct SftpServer {
    channel: Channel,
    filesystem: Arc<dyn SftpFilesystem>,
    handles: Mutex<HashMap<Bytes, OpenHandle>>,
    next_handle_id: AtomicU64,
}

impl SftpServer {
    pub fn new(channel: Channel, filesystem: Arc<dyn SftpFilesystem>) -> Self {
        Self {
            channel,
            filesystem,
            handles: Mutex::new(HashMap::new()),
            next_handle_id: AtomicU64::new(0),
        }
    }

    /// Serve requests until the channel reports EOF/close or the transport
    /// disconnects.
    pub async fn run(self) -> Result<()> {
        let mut buf = BytesMut::new();
        let mut codec = SftpCodec;

        loop {
            match self.channel.recv().await {
                Some(ChannelMessage::Data(data)) => {
                    buf.extend_from_slice(&data);
                    loop {
                        match codec.decode(&mut buf)? {
                            Some(frame) => self.handle_frame(frame).await?,
                            None => break,
                        }
                    }
                }
                Some(ChannelMessage::Eof) | Some(ChannelMessage::Closed) | None => return Ok(()),
                Some(ChannelMessage::ExtendedData { .. }) | Some(ChannelMessage::Request { .. }) => {}
            }
        }
    }

    fn alloc_handle(&self) -> Bytes {
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        Bytes::copy_from_slice(&id.to_be_bytes())
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut codec = SftpCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf)?;
        self.channel.send_data(buf.freeze()).await
    }

    async fn send_status(&self, id: u32, code: StatusCode, message: &str) -> Result<()> {
        use bytes::BufMut;
        let mut payload = BytesMut::new();
        payload.put_u32(code.to_wire());
        put_string(&mut payload, message);
        put_string(&mut payload, "");
        self.send_frame(Frame {
            kind: SSH_FXP_STATUS,
            id,
            payload: payload.freeze(),
        })
        .await
    }

    async fn send_ok(&self, id: u32) -> Result<()> {
        self.send_status(id, StatusCode::Ok, "").await
    }

    fn error_status(e: &Error) -> (StatusCode, String) {
        match e {
            Error::SftpStatus { code, message } => (*code, message.clone()),
            Error::Unsupported => (StatusCode::OpUnsupported, "operation not supported".into()),
            Error::FileHandleInvalid => (StatusCode::Failure, "invalid file handle".into()),
            other => (StatusCode::Failure, other.to_string()),
        }
    }

    async fn handle_frame(&self, frame: Frame) -> Result<()> {
        match frame.kind {
            SSH_FXP_INIT => self.handle_init().await,
            SSH_FXP_OPEN => self.handle_open(frame).await,
            SSH_FXP_CLOSE => self.handle_close(frame).await,
            SSH_FXP_READ => self.handle_read(frame).await,
            SSH_FXP_WRITE => self.handle_write(frame).await,
            SSH_FXP_FSTAT => self.handle_fstat(frame).await,
            SSH_FXP_FSETSTAT => self.handle_fsetstat(frame).await,
            SSH_FXP_LSTAT => self.handle_stat(frame, false).await,
            SSH_FXP_STAT => self.handle_stat(frame, true).await,
            SSH_FXP_SETSTAT => self.handle_setstat(frame).await,
            SSH_FXP_OPENDIR => self.handle_opendir(frame).await,
            SSH_FXP_READDIR => self.handle_readdir(frame).await,
            SSH_FXP_REMOVE => self.handle_remove(frame).await,
            SSH_FXP_MKDIR => self.handle_mkdir(frame).await,
            SSH_FXP_RMDIR => self.handle_rmdir(frame).await,
            SSH_FXP_REALPATH => self.handle_realpath(frame).await,
            SSH_FXP_RENAME => self.handle_rename(frame).await,
            SSH_FXP_READLINK => self.handle_readlink(frame).await,
            SSH_FXP_SYMLINK => self.handle_symlink(frame).await,
            SSH_FXP_EXTENDED => {
                self.send_status(frame.id, StatusCode::OpUnsupported, "no extensions registered")
                    .await
            }
            other => {
                tracing::warn!(kind = other, "unrecognized sftp request type");
                self.send_status(frame.id, StatusCode::BadMessage, "unrecognized request")
                    .await
            }
        }
    }

    async fn handle_init(&self) -> Result<()> {
        use bytes::BufMut;
        let mut payload = BytesMut::new();
        payload.put_u32(SSH2_FILEXFER_VERSION);
        self.send_frame(Frame {
            kind: SSH_FXP_VERSION,
            id: 0,
            payload: payload.freeze(),
        })
        .await
    }

    async fn handle_open(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;
        let pflags = r.u32()?;
        let attrs = SftpAttributes::decode(&mut r)?;

        match self.filesystem.open_file(&path, pflags, &attrs).await {
            Ok(file) => {
                let handle = self.alloc_handle();
                self.handles
                    .lock()
                    .await
                    .insert(handle.clone(), OpenHandle::File(file));
                let mut payload = BytesMut::new();
                super::protocol::put_bytes(&mut payload, &handle);
                self.send_frame(Frame {
                    kind: SSH_FXP_HANDLE,
                    id: frame.id,
                    payload: payload.freeze(),
                })
                .await
            }
            Err(e) => {
                let (code, message) = Self::error_status(&e);
                self.send_status(frame.id, code, &message).await
            }
        }
    }

    async fn handle_opendir(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;

        match self.filesystem.open_directory(&path).await {
            Ok(dir) => {
                let handle = self.alloc_handle();
                self.handles
                    .lock()
                    .await
                    .insert(handle.clone(), OpenHandle::Dir(dir));
                let mut payload = BytesMut::new();
                super::protocol::put_bytes(&mut payload, &handle);
                self.send_frame(Frame {
                    kind: SSH_FXP_HANDLE,
                    id: frame.id,
                    payload: payload.freeze(),
                })
                .await
            }
            Err(e) => {
                let (code, message) = Self::error_status(&e);
                self.send_status(frame.id, code, &message).await
            }
        }
    }

    async fn handle_close(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let handle = r.bytes()?;
        self.handles.lock().await.remove(&handle);
        self.send_ok(frame.id).await
    }

    async fn handle_read(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let handle = r.bytes()?;
        let offset = r.u64()?;
        let len = r.u32()?;

        let mut handles = self.handles.lock().await;
        let Some(OpenHandle::File(file)) = handles.get_mut(&handle) else {
            drop(handles);
            return self
                .send_status(frame.id, StatusCode::Failure, "invalid file handle")
                .await;
        };
        let result = file.read(offset, len).await;
        drop(handles);

        match result {
            Ok(Some(data)) => {
                let mut payload = BytesMut::new();
                super::protocol::put_bytes(&mut payload, &data);
                self.send_frame(Frame {
                    kind: SSH_FXP_DATA,
                    id: frame.id,
                    payload: payload.freeze(),
                })
                .await
            }
            Ok(None) => self.send_status(frame.id, StatusCode::Eof, "eof").await,
            Err(e) => {
                let (code, message) = Self::error_status(&e);
                self.send_status(frame.id, code, &message).await
            }
        }
    }

    async fn handle_write(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let handle = r.bytes()?;
        let offset = r.u64()?;
        let data = r.bytes()?;

        let mut handles = self.handles.lock().await;
        let Some(OpenHandle::File(file)) = handles.get_mut(&handle) else {
            drop(handles);
            return self
                .send_status(frame.id, StatusCode::Failure, "invalid file handle")
                .await;
        };
        let result = file.write(offset, &data).await;
        drop(handles);

        self.send_ok_or_error(frame.id, result).await
    }

    async fn handle_fstat(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let handle = r.bytes()?;

        let handles = self.handles.lock().await;
        let Some(OpenHandle::File(file)) = handles.get(&handle) else {
            drop(handles);
            return self
                .send_status(frame.id, StatusCode::Failure, "invalid file handle")
                .await;
        };
        let result = file.attributes().await;
        drop(handles);
        self.send_attrs_or_error(frame.id, result).await
    }

    async fn handle_fsetstat(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let handle = r.bytes()?;
        let attrs = SftpAttributes::decode(&mut r)?;

        let mut handles = self.handles.lock().await;
        let Some(OpenHandle::File(file)) = handles.get_mut(&handle) else {
            drop(handles);
            return self
                .send_status(frame.id, StatusCode::Failure, "invalid file handle")
                .await;
        };
        let result = file.set_attributes(&attrs).await;
        drop(handles);
        self.send_ok_or_error(frame.id, result).await
    }

    async fn handle_readdir(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let handle = r.bytes()?;

        let mut handles = self.handles.lock().await;
        let Some(OpenHandle::Dir(dir)) = handles.get_mut(&handle) else {
            drop(handles);
            return self
                .send_status(frame.id, StatusCode::Failure, "invalid file handle")
                .await;
        };
        let result = dir.next_batch().await;
        drop(handles);

        match result {
            Ok(Some(entries)) => {
                use bytes::BufMut;
                let mut payload = BytesMut::new();
                payload.put_u32(entries.len() as u32);
                for entry in &entries {
                    put_string(&mut payload, &entry.filename);
                    put_string(&mut payload, &entry.longname);
                    entry.attrs.encode(&mut payload);
                }
                self.send_frame(Frame {
                    kind: SSH_FXP_NAME,
                    id: frame.id,
                    payload: payload.freeze(),
                })
                .await
            }
            Ok(None) => self.send_status(frame.id, StatusCode::Eof, "eof").await,
            Err(e) => {
                let (code, message) = Self::error_status(&e);
                self.send_status(frame.id, code, &message).await
            }
        }
    }

    async fn handle_stat(&self, frame: Frame, follow_symlinks: bool) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;
        let result = self.filesystem.file_attributes(&path, follow_symlinks).await;
        self.send_attrs_or_error(frame.id, result).await
    }

    async fn handle_setstat(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;
        let attrs = SftpAttributes::decode(&mut r)?;
        let result = self.filesystem.set_file_attributes(&path, &attrs).await;
        self.send_ok_or_error(frame.id, result).await
    }

    async fn handle_remove(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;
        let result = self.filesystem.remove_file(&path).await;
        self.send_ok_or_error(frame.id, result).await
    }

    async fn handle_mkdir(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;
        let attrs = SftpAttributes::decode(&mut r)?;
        let result = self.filesystem.create_directory(&path, &attrs).await;
        self.send_ok_or_error(frame.id, result).await
    }

    async fn handle_rmdir(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;
        let result = self.filesystem.remove_directory(&path).await;
        self.send_ok_or_error(frame.id, result).await
    }

    async fn handle_realpath(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;
        match self.filesystem.real_path(&path).await {
            Ok(resolved) => {
                use bytes::BufMut;
                let mut payload = BytesMut::new();
                payload.put_u32(1);
                put_string(&mut payload, &resolved);
                put_string(&mut payload, &resolved);
                SftpAttributes::default().encode(&mut payload);
                self.send_frame(Frame {
                    kind: SSH_FXP_NAME,
                    id: frame.id,
                    payload: payload.freeze(),
                })
                .await
            }
            Err(e) => {
                let (code, message) = Self::error_status(&e);
                self.send_status(frame.id, code, &message).await
            }
        }
    }

    async fn handle_rename(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let old_path = r.string()?;
        let new_path = r.string()?;
        let result = self.filesystem.rename(&old_path, &new_path).await;
        self.send_ok_or_error(frame.id, result).await
    }

    async fn handle_readlink(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        let path = r.string()?;
        match self.filesystem.read_symlink(&path).await {
            Ok(target) => {
                use bytes::BufMut;
                let mut payload = BytesMut::new();
                payload.put_u32(1);
                put_string(&mut payload, &target);
                put_string(&mut payload, &target);
                SftpAttributes::default().encode(&mut payload);
                self.send_frame(Frame {
                    kind: SSH_FXP_NAME,
                    id: frame.id,
                    payload: payload.freeze(),
                })
                .await
            }
            Err(e) => {
                let (code, message) = Self::error_status(&e);
                self.send_status(frame.id, code, &message).await
            }
        }
    }

    async fn handle_symlink(&self, frame: Frame) -> Result<()> {
        let mut r = Reader::new(&frame.payload);
        // Wire order per SSH_FXP_SYMLINK is linkpath then targetpath.
        let link_path = r.string()?;
        let target_path = r.string()?;
        let result = self.filesystem.add_symlink(&target_path, &link_path).await;
        self.send_ok_or_error(frame.id, result).await
    }

    async fn send_ok_or_error(&self, id: u32, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.send_ok(id).await,
            Err(e) => {
                let (code, message) = Self::error_status(&e);
                self.send_status(id, code, &message).await
            }
        }
    }

    async fn send_attrs_or_error(&self, id: u32, result: Result<SftpAttributes>) -> Result<()> {
        match result {
            Ok(attrs) => {
                let mut payload = BytesMut::new();
                attrs.encode(&mut payload);
                self.send_frame(Frame {
                    kind: SSH_FXP_ATTRS,
                    id,
                    payload: payload.freeze(),
                })
                .await
            }
            Err(e) => {
                let (code, message) = Self::error_status(&e);
                self.send_status(id, code, &message).await
            }
        }
    }
}
