//! SFTP client core: opens the `sftp` subsystem on a session channel, frames
//! messages, and correlates request/response by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::{Channel, ChannelMessage};
use crate::error::{Error, Result};

use super::attrs::SftpAttributes;
use super::protocol::{
    put_string, Frame, Reader, SftpCodec, StatusCode, SSH2_FILEXFER_VERSION, SSH_FXP_ATTRS,
    SSH_FXP_CLOSE, SSH_FXP_DATA, SSH_FXP_EXTENDED, SSH_FXP_FSETSTAT, SSH_FXP_FSTAT,
    SSH_FXP_HANDLE, SSH_FXP_INIT, SSH_FXP_LSTAT, SSH_FXP_MKDIR, SSH_FXP_NAME, SSH_FXP_OPEN,
    SSH_FXP_OPENDIR, SSH_FXP_READ, SSH_FXP_READDIR, SSH_FXP_READLINK, SSH_FXP_REALPATH,
    SSH_FXP_REMOVE, SSH_FXP_RENAME, SSH_FXP_RMDIR, SSH_FXP_SETSTAT, SSH_FXP_STAT, SSH_FXP_STATUS,
    SSH_FXP_SYMLINK, SSH_FXP_VERSION, SSH_FXP_WRITE,
};

/// A single entry in an `SSH_FXP_NAME` reply (directory listing, realpath).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: SftpAttributes,
}

/// How many `REALPATH` round trips [`SftpClient::list_directory`] will make
/// looking for a fixpoint before giving up and using the last answer.
const MAX_REALPATH_ITERATIONS: usize = 8;

/// A single in-flight request's outcome: either a reply frame or the
/// connection going away while we waited.
type Pending = oneshot::Sender<Result<Frame>>;

/// Removes a request's entry from the pending table on drop. Covers both
/// the ordinary completion paths (where removal is a harmless no-op, the
/// entry already having been taken by `dispatch_frame` or `fail_all`) and
/// the case where the awaiting future itself is dropped before a reply
/// arrives, which would otherwise leak the table entry forever.
struct PendingGuard {
    pending: Arc<Mutex<HashMap<u32, Pending>>>,
    id: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

struct Inner {
    channel: Arc<Channel>,
    next_id: AtomicU32,
    pending: Arc<Mutex<HashMap<u32, Pending>>>,
    reader_task: tokio::task::JoinHandle<()>,
    /// Set by `reader_loop` right before it exits, so `request` can fail
    /// fast instead of handing a frame to a channel nothing reads from.
    closed: Arc<AtomicBool>,
}

/// Correlates SFTP requests with their replies over one `sftp` subsystem
/// channel.
///
/// Cheaply `Clone`-able, mirroring [`crate::channel::ChannelRegistry`]: every
/// [`super::file::SftpFile`] holds a clone so it can issue its own requests.
#[derive(Clone)]
pub struct SftpClient(Arc<Inner>);

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient")
            .field("pending", &self.0.pending.lock().len())
            .finish()
    }
}

impl SftpClient {
    /// Perform the `INIT`/`VERSION` handshake over `channel` (already
    /// carrying a successful `subsystem "sftp"` request) and start the
    /// background reader that demultiplexes replies by id.
    pub async fn connect(channel: Channel, handshake_timeout: std::time::Duration) -> Result<Self> {
        let channel = Arc::new(channel);
        let pending: Arc<Mutex<HashMap<u32, Pending>>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (version_tx, version_rx) = oneshot::channel();

        let reader_channel = channel.clone();
        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_task = tokio::spawn(Self::reader_loop(
            reader_channel,
            reader_pending,
            version_tx,
            reader_closed,
        ));

        let mut init_payload = BytesMut::new();
        {
            use bytes::BufMut;
            init_payload.put_u32(SSH2_FILEXFER_VERSION);
        }
        Self::encode_and_send(
            &channel,
            Frame {
                kind: SSH_FXP_INIT,
                id: 0,
                payload: init_payload.freeze(),
            },
        )
        .await?;

        let version = timeout(handshake_timeout, version_rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::ConnectionClosed)??;

        if version < SSH2_FILEXFER_VERSION {
            reader_task.abort();
            return Err(Error::UnsupportedVersion(version));
        }

        Ok(Self(Arc::new(Inner {
            channel,
            next_id: AtomicU32::new(1),
            pending,
            reader_task,
            closed,
        })))
    }

    async fn reader_loop(
        channel: Arc<Channel>,
        pending: Arc<Mutex<HashMap<u32, Pending>>>,
        version_tx: oneshot::Sender<Result<u32>>,
        closed: Arc<AtomicBool>,
    ) {
        let mut buf = BytesMut::new();
        let mut codec = SftpCodec;
        let mut version_tx = Some(version_tx);

        loop {
            match channel.recv().await {
                Some(ChannelMessage::Data(data)) => {
                    buf.extend_from_slice(&data);
                    loop {
                        match codec.decode(&mut buf) {
                            Ok(Some(frame)) => {
                                Self::dispatch_frame(frame, &pending, &mut version_tx)
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(?e, "sftp protocol violation, tearing down");
                                closed.store(true, Ordering::Release);
                                Self::fail_all(&pending, Error::ProtocolViolation(e.to_string()));
                                return;
                            }
                        }
                    }
                }
                Some(ChannelMessage::Eof) | Some(ChannelMessage::Closed) | None => {
                    closed.store(true, Ordering::Release);
                    Self::fail_all(&pending, Error::ConnectionClosed);
                    return;
                }
                Some(ChannelMessage::ExtendedData { .. }) | Some(ChannelMessage::Request { .. }) => {
                    // The sftp subsystem channel carries no stderr or
                    // peer-initiated channel-requests; ignore defensively.
                }
            }
        }
    }

    fn dispatch_frame(
        frame: Frame,
        pending: &Mutex<HashMap<u32, Pending>>,
        version_tx: &mut Option<oneshot::Sender<Result<u32>>>,
    ) {
        if frame.kind == SSH_FXP_VERSION {
            if let Some(tx) = version_tx.take() {
                let mut r = Reader::new(&frame.payload);
                let _ = tx.send(r.u32());
            }
            return;
        }

        let Some(tx) = pending.lock().remove(&frame.id) else {
            tracing::error!(id = frame.id, kind = frame.kind, "stray sftp reply id");
            return;
        };
        let _ = tx.send(Ok(frame));
    }

    fn fail_all(pending: &Mutex<HashMap<u32, Pending>>, err_factory: Error) {
        for (_, tx) in pending.lock().drain() {
            let e = match &err_factory {
                Error::ConnectionClosed => Error::ConnectionClosed,
                Error::ProtocolViolation(d) => Error::ProtocolViolation(d.clone()),
                _ => Error::ConnectionClosed,
            };
            let _ = tx.send(Err(e));
        }
    }

    async fn encode_and_send(channel: &Channel, frame: Frame) -> Result<()> {
        let mut codec = SftpCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf)?;
        channel.send_data(buf.freeze()).await
    }

    fn next_id(&self) -> u32 {
        self.0.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `true` once `reader_loop` has observed the channel go away. Checked
    /// up front so a request issued after that point fails immediately
    /// instead of waiting on a reply nothing will ever send.
    fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Send a request and await its correlated reply.
    async fn request(&self, kind: u8, payload: Bytes) -> Result<Frame> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.0.pending.lock().insert(id, tx);
        let _cleanup = PendingGuard {
            pending: self.0.pending.clone(),
            id,
        };

        Self::encode_and_send(&self.0.channel, Frame { kind, id, payload }).await?;

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    fn parse_status(payload: &[u8]) -> Result<()> {
        let mut r = Reader::new(payload);
        let code = StatusCode::from_wire(r.u32()?);
        let message = r.string().unwrap_or_default();
        match code {
            StatusCode::Ok => Ok(()),
            StatusCode::Eof => Ok(()),
            other => Err(Error::SftpStatus {
                code: other,
                message,
            }),
        }
    }

    fn expect_status(frame: Frame) -> Result<()> {
        match frame.kind {
            SSH_FXP_STATUS => Self::parse_status(&frame.payload),
            _ => Err(Error::InvalidResponse),
        }
    }

    fn expect_handle(frame: Frame) -> Result<Bytes> {
        match frame.kind {
            SSH_FXP_HANDLE => {
                let mut r = Reader::new(&frame.payload);
                r.bytes()
            }
            SSH_FXP_STATUS => Err(Self::parse_status(&frame.payload).unwrap_err_or_invalid()),
            _ => Err(Error::InvalidResponse),
        }
    }

    fn expect_attrs(frame: Frame) -> Result<SftpAttributes> {
        match frame.kind {
            SSH_FXP_ATTRS => {
                let mut r = Reader::new(&frame.payload);
                SftpAttributes::decode(&mut r)
            }
            SSH_FXP_STATUS => Err(Self::parse_status(&frame.payload).unwrap_err_or_invalid()),
            _ => Err(Error::InvalidResponse),
        }
    }

    fn expect_name_one(frame: Frame) -> Result<String> {
        match frame.kind {
            SSH_FXP_NAME => {
                let mut r = Reader::new(&frame.payload);
                let count = r.u32()?;
                if count == 0 {
                    return Err(Error::InvalidResponse);
                }
                let filename = r.string()?;
                Ok(filename)
            }
            SSH_FXP_STATUS => Err(Self::parse_status(&frame.payload).unwrap_err_or_invalid()),
            _ => Err(Error::InvalidResponse),
        }
    }

    fn expect_name_all(frame: Frame) -> Result<Vec<DirEntry>> {
        match frame.kind {
            SSH_FXP_NAME => {
                let mut r = Reader::new(&frame.payload);
                let count = r.u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let filename = r.string()?;
                    let longname = r.string()?;
                    let attrs = SftpAttributes::decode(&mut r)?;
                    entries.push(DirEntry {
                        filename,
                        longname,
                        attrs,
                    });
                }
                Ok(entries)
            }
            SSH_FXP_STATUS => Err(Self::parse_status(&frame.payload).unwrap_err_or_invalid()),
            _ => Err(Error::InvalidResponse),
        }
    }

    // -- file-handle-scoped operations, used by `SftpFile` --

    pub(crate) async fn open_handle(
        &self,
        path: &str,
        pflags: u32,
        attrs: &SftpAttributes,
    ) -> Result<Bytes> {
        use bytes::BufMut;
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        payload.put_u32(pflags);
        attrs.encode(&mut payload);

        let frame = self.request(SSH_FXP_OPEN, payload.freeze()).await?;
        Self::expect_handle(frame)
    }

    pub(crate) async fn close_handle(&self, handle: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::FileHandleInvalid);
        }
        let mut payload = BytesMut::new();
        super::protocol::put_bytes(&mut payload, handle);

        let frame = self.request(SSH_FXP_CLOSE, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub(crate) async fn read_chunk(
        &self,
        handle: &[u8],
        offset: u64,
        len: u32,
    ) -> Result<Option<Bytes>> {
        if self.is_closed() {
            return Err(Error::FileHandleInvalid);
        }
        use bytes::BufMut;
        let mut payload = BytesMut::new();
        super::protocol::put_bytes(&mut payload, handle);
        payload.put_u64(offset);
        payload.put_u32(len);

        let frame = self.request(SSH_FXP_READ, payload.freeze()).await?;
        match frame.kind {
            SSH_FXP_DATA => {
                let mut r = Reader::new(&frame.payload);
                Ok(Some(r.bytes()?))
            }
            SSH_FXP_STATUS => {
                let mut r = Reader::new(&frame.payload);
                let code = StatusCode::from_wire(r.u32()?);
                if code == StatusCode::Eof {
                    Ok(None)
                } else {
                    let message = r.string().unwrap_or_default();
                    Err(Error::SftpStatus { code, message })
                }
            }
            _ => Err(Error::InvalidResponse),
        }
    }

    pub(crate) async fn write_chunk(&self, handle: &[u8], offset: u64, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::FileHandleInvalid);
        }
        use bytes::BufMut;
        let mut payload = BytesMut::new();
        super::protocol::put_bytes(&mut payload, handle);
        payload.put_u64(offset);
        super::protocol::put_bytes(&mut payload, data);

        let frame = self.request(SSH_FXP_WRITE, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub(crate) async fn fstat(&self, handle: &[u8]) -> Result<SftpAttributes> {
        if self.is_closed() {
            return Err(Error::FileHandleInvalid);
        }
        let mut payload = BytesMut::new();
        super::protocol::put_bytes(&mut payload, handle);

        let frame = self.request(SSH_FXP_FSTAT, payload.freeze()).await?;
        Self::expect_attrs(frame)
    }

    pub(crate) async fn fsetstat(&self, handle: &[u8], attrs: &SftpAttributes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::FileHandleInvalid);
        }
        let mut payload = BytesMut::new();
        super::protocol::put_bytes(&mut payload, handle);
        attrs.encode(&mut payload);

        let frame = self.request(SSH_FXP_FSETSTAT, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub(crate) async fn opendir_handle(&self, path: &str) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);

        let frame = self.request(SSH_FXP_OPENDIR, payload.freeze()).await?;
        Self::expect_handle(frame)
    }

    pub(crate) async fn readdir_chunk(&self, handle: &[u8]) -> Result<Option<Vec<DirEntry>>> {
        if self.is_closed() {
            return Err(Error::FileHandleInvalid);
        }
        let mut payload = BytesMut::new();
        super::protocol::put_bytes(&mut payload, handle);

        let frame = self.request(SSH_FXP_READDIR, payload.freeze()).await?;
        match frame.kind {
            SSH_FXP_NAME => Self::expect_name_all(frame).map(Some),
            SSH_FXP_STATUS => {
                let mut r = Reader::new(&frame.payload);
                let code = StatusCode::from_wire(r.u32()?);
                if code == StatusCode::Eof {
                    Ok(None)
                } else {
                    let message = r.string().unwrap_or_default();
                    Err(Error::SftpStatus { code, message })
                }
            }
            _ => Err(Error::InvalidResponse),
        }
    }

    // -- path-scoped operations --

    pub async fn lstat(&self, path: &str) -> Result<SftpAttributes> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        let frame = self.request(SSH_FXP_LSTAT, payload.freeze()).await?;
        Self::expect_attrs(frame)
    }

    pub async fn stat(&self, path: &str) -> Result<SftpAttributes> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        let frame = self.request(SSH_FXP_STAT, payload.freeze()).await?;
        Self::expect_attrs(frame)
    }

    pub async fn setstat(&self, path: &str, attrs: &SftpAttributes) -> Result<()> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        attrs.encode(&mut payload);
        let frame = self.request(SSH_FXP_SETSTAT, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        let frame = self.request(SSH_FXP_REMOVE, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub async fn mkdir(&self, path: &str, attrs: &SftpAttributes) -> Result<()> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        attrs.encode(&mut payload);
        let frame = self.request(SSH_FXP_MKDIR, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        let frame = self.request(SSH_FXP_RMDIR, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, old_path);
        put_string(&mut payload, new_path);
        let frame = self.request(SSH_FXP_RENAME, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub async fn readlink(&self, path: &str) -> Result<String> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        let frame = self.request(SSH_FXP_READLINK, payload.freeze()).await?;
        Self::expect_name_one(frame)
    }

    pub async fn symlink(&self, target_path: &str, link_path: &str) -> Result<()> {
        let mut payload = BytesMut::new();
        // Wire order per SSH_FXP_SYMLINK is linkpath then targetpath.
        put_string(&mut payload, link_path);
        put_string(&mut payload, target_path);
        let frame = self.request(SSH_FXP_SYMLINK, payload.freeze()).await?;
        Self::expect_status(frame)
    }

    pub async fn realpath(&self, path: &str) -> Result<String> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, path);
        let frame = self.request(SSH_FXP_REALPATH, payload.freeze()).await?;
        Self::expect_name_one(frame)
    }

    /// Resolve `path` to a fixpoint (`realpath(realpath(p)) == realpath(p)`)
    /// before the caller opens a directory handle on it, then list every
    /// entry.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut resolved = self.realpath(path).await?;
        for _ in 0..MAX_REALPATH_ITERATIONS {
            let next = self.realpath(&resolved).await?;
            if next == resolved {
                break;
            }
            resolved = next;
        }

        let handle = self.opendir_handle(&resolved).await?;
        let mut entries = Vec::new();
        loop {
            match self.readdir_chunk(&handle).await {
                Ok(Some(chunk)) => entries.extend(chunk),
                Ok(None) => break,
                Err(e) => {
                    let _ = self.close_handle(&handle).await;
                    return Err(e);
                }
            }
        }
        self.close_handle(&handle).await?;
        Ok(entries)
    }

    /// Send an `SSH_FXP_EXTENDED` request and return the raw response
    /// payload, stripping `STATUS`/`DATA` framing. An escape hatch for
    /// server-specific extensions this client has no first-class API for.
    pub async fn extended(&self, name: &str, payload: Bytes) -> Result<Bytes> {
        let mut body = BytesMut::new();
        put_string(&mut body, name);
        body.extend_from_slice(&payload);

        let frame = self.request(SSH_FXP_EXTENDED, body.freeze()).await?;
        match frame.kind {
            SSH_FXP_STATUS => {
                Self::parse_status(&frame.payload)?;
                Ok(Bytes::new())
            }
            _ => Ok(frame.payload),
        }
    }

    /// Close the underlying subsystem channel. Outstanding requests fail
    /// with [`Error::ConnectionClosed`].
    pub async fn close(self) -> Result<()> {
        self.0.reader_task.abort();
        self.0.channel.close().await
    }
}

trait StatusResultExt {
    fn unwrap_err_or_invalid(self) -> Error;
}

impl StatusResultExt for Result<()> {
    fn unwrap_err_or_invalid(self) -> Error {
        match self {
            Err(e) => e,
            Ok(()) => Error::InvalidResponse,
        }
    }
}
