//! SFTP version 3 wire framing: message type constants, the length-prefixed
//! codec, and the status/attribute flag bits.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

pub const SSH2_FILEXFER_VERSION: u32 = 3;

pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSTAT: u8 = 8;
pub const SSH_FXP_SETSTAT: u8 = 9;
pub const SSH_FXP_FSETSTAT: u8 = 10;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_READLINK: u8 = 19;
pub const SSH_FXP_SYMLINK: u8 = 20;
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;
pub const SSH_FXP_EXTENDED: u8 = 200;
pub const SSH_FXP_EXTENDED_REPLY: u8 = 201;

pub const SSH_FXF_READ: u32 = 0x1;
pub const SSH_FXF_WRITE: u32 = 0x2;
pub const SSH_FXF_APPEND: u32 = 0x4;
pub const SSH_FXF_CREAT: u32 = 0x8;
pub const SSH_FXF_TRUNC: u32 = 0x10;
pub const SSH_FXF_EXCL: u32 = 0x20;

pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x1;
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x2;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x4;
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x8;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x80000000;

/// Status codes carried in an `SSH_FXP_STATUS` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StatusCode {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    Other(u32),
}

impl StatusCode {
    pub(crate) fn from_wire(code: u32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Eof,
            2 => StatusCode::NoSuchFile,
            3 => StatusCode::PermissionDenied,
            4 => StatusCode::Failure,
            5 => StatusCode::BadMessage,
            6 => StatusCode::NoConnection,
            7 => StatusCode::ConnectionLost,
            8 => StatusCode::OpUnsupported,
            other => StatusCode::Other(other),
        }
    }

    pub(crate) fn to_wire(self) -> u32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Eof => 1,
            StatusCode::NoSuchFile => 2,
            StatusCode::PermissionDenied => 3,
            StatusCode::Failure => 4,
            StatusCode::BadMessage => 5,
            StatusCode::NoConnection => 6,
            StatusCode::ConnectionLost => 7,
            StatusCode::OpUnsupported => 8,
            StatusCode::Other(v) => v,
        }
    }
}

/// A decoded SFTP frame: everything after the 4-byte length prefix.
///
/// `INIT`/`VERSION` carry no request id on the wire; this type folds that
/// leading `u32` into `id` as `0` for those two types and callers special-case
/// them by `kind` rather than trusting `id`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub id: u32,
    pub payload: Bytes,
}

/// A [`tokio_util::codec`] framer for the `length:u32 ‖ type:u8 ‖ [id:u32] ‖
/// payload` wire format. `INIT`/`VERSION` omit the id field; every other
/// message type carries one.
#[derive(Debug, Default)]
pub struct SftpCodec;

impl Decoder for SftpCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[0..4].try_into().unwrap()) as usize;
        if len == 0 {
            return Err(Error::ProtocolViolation("zero-length sftp frame".into()));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut body = src.split_to(len);
        let kind = body.get_u8();

        let id = if kind == SSH_FXP_INIT || kind == SSH_FXP_VERSION {
            0
        } else {
            if body.len() < 4 {
                return Err(Error::ProtocolViolation("sftp frame missing id".into()));
            }
            body.get_u32()
        };

        Ok(Some(Frame {
            kind,
            id,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for SftpCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let has_id = frame.kind != SSH_FXP_INIT && frame.kind != SSH_FXP_VERSION;
        let body_len = 1 + if has_id { 4 } else { 0 } + frame.payload.len();

        dst.reserve(4 + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u8(frame.kind);
        if has_id {
            dst.put_u32(frame.id);
        }
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// A small cursor over a decoded payload, for pulling out SFTP's
/// length-prefixed strings and fixed-width integers without pulling in a
/// separate parser combinator dependency.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        if self.buf.is_empty() {
            return Err(Error::InvalidResponse);
        }
        let v = self.buf[0];
        self.buf = &self.buf[1..];
        Ok(v)
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        if self.buf.len() < 4 {
            return Err(Error::InvalidResponse);
        }
        let v = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
        self.buf = &self.buf[4..];
        Ok(v)
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        if self.buf.len() < 8 {
            return Err(Error::InvalidResponse);
        }
        let v = u64::from_be_bytes(self.buf[0..8].try_into().unwrap());
        self.buf = &self.buf[8..];
        Ok(v)
    }

    pub(crate) fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        if self.buf.len() < len {
            return Err(Error::InvalidResponse);
        }
        let v = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf = &self.buf[len..];
        Ok(v)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidResponse)
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        self.buf
    }
}

/// Appends a length-prefixed string (or raw byte string) the way every SFTP
/// message field does.
pub(crate) fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}
