//! `SftpAttributes`: the flag-governed `ATTRS` record shared by `STAT`,
//! `LSTAT`, `FSTAT`, `SETSTAT`, `FSETSTAT`, and the per-entry attrs inside a
//! `NAME` reply.

use bytes::{Bytes, BytesMut};

use crate::error::Result;

use super::protocol::{
    Reader, SSH_FILEXFER_ATTR_ACMODTIME, SSH_FILEXFER_ATTR_EXTENDED, SSH_FILEXFER_ATTR_PERMISSIONS,
    SSH_FILEXFER_ATTR_SIZE, SSH_FILEXFER_ATTR_UIDGID,
};

/// File metadata as carried on the wire. Every field is optional; which
/// fields are present is recorded in a leading flags bitset, not inferred
/// from e.g. a sentinel value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SftpAttributes {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    pub atime_mtime: Option<(u32, u32)>,
    pub extended: Vec<(String, String)>,
}

impl SftpAttributes {
    /// A bare attributes record carrying only a size, the common case for
    /// `SETSTAT` truncation requests.
    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    /// A bare attributes record carrying only permission bits.
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Self::default()
        }
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime_mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= SSH_FILEXFER_ATTR_EXTENDED;
        }
        flags
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        use bytes::BufMut;
        use super::protocol::put_string;

        buf.put_u32(self.flags());
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(perm) = self.permissions {
            buf.put_u32(perm);
        }
        if let Some((atime, mtime)) = self.atime_mtime {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            buf.put_u32(self.extended.len() as u32);
            for (k, v) in &self.extended {
                put_string(buf, k);
                put_string(buf, v);
            }
        }
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let flags = r.u32()?;
        let mut attrs = Self::default();

        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(r.u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid_gid = Some((r.u32()?, r.u32()?));
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(r.u32()?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime_mtime = Some((r.u32()?, r.u32()?));
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = r.u32()?;
            for _ in 0..count {
                let k = r.string()?;
                let v = r.string()?;
                attrs.extended.push((k, v));
            }
        }

        Ok(attrs)
    }

    pub(crate) fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_wire_format() {
        let attrs = SftpAttributes {
            size: Some(4096),
            uid_gid: Some((1000, 1000)),
            permissions: Some(0o644),
            atime_mtime: Some((1000, 2000)),
            extended: vec![("foo".into(), "bar".into())],
        };

        let bytes = attrs.to_bytes();
        let mut reader = Reader::new(&bytes);
        let decoded = SftpAttributes::decode(&mut reader).unwrap();

        assert_eq!(decoded, attrs);
    }

    #[test]
    fn empty_attributes_have_zero_flags() {
        let attrs = SftpAttributes::default();
        let bytes = attrs.to_bytes();
        // Just the 4-byte flags field, all zero.
        assert_eq!(bytes.len(), 4);
    }
}
