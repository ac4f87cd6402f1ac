//! The length-prefixed string encoding shared by channel-request and
//! global-request payloads (the same shape `sftp::protocol` uses for its
//! own frames, just without a dedicated codec wrapped around it).

use bytes::{BufMut, BytesMut};

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}
