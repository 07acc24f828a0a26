//! Qid, Stat and open-mode types shared by requests and responses.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use super::wire_format::QID_SIZE;
use crate::error::{NineError, Result};

bitflags! {
    /// Bits in `Qid.qtype`.
    ///
    /// Unknown bits are retained so a qid always compares equal to itself
    /// after a round trip.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QidType: u8 {
        const DIR = 0x80;
        const APPEND = 0x40;
        const EXCL = 0x20;
        const MOUNT = 0x10;
        const AUTH = 0x08;
        const TMP = 0x04;
    }
}

/// Server-assigned identity of a file instance. Compared, never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qid {
    pub qtype: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub fn new(qtype: QidType, version: u32, path: u64) -> Self {
        Self {
            qtype,
            version,
            path,
        }
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.qtype.bits());
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.path);
    }

    pub(crate) fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure_remaining(buf, QID_SIZE, "qid")?;
        Ok(Self {
            qtype: QidType::from_bits_retain(buf.get_u8()),
            version: buf.get_u32_le(),
            path: buf.get_u64_le(),
        })
    }
}

/// Mode byte for Topen/Tcreate.
///
/// The low two bits select the access mode; `TRUNC` and `RCLOSE` are
/// or-ed on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(0);
    pub const WRITE: OpenMode = OpenMode(1);
    pub const RDWR: OpenMode = OpenMode(2);
    pub const EXEC: OpenMode = OpenMode(3);
    pub const TRUNC: OpenMode = OpenMode(0x10);
    pub const RCLOSE: OpenMode = OpenMode(0x40);

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        OpenMode(bits)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// Permission bits for Tcreate and `Stat.mode`.
pub mod perm {
    /// Directory.
    pub const DMDIR: u32 = 0x8000_0000;
    /// Append only.
    pub const DMAPPEND: u32 = 0x4000_0000;
    /// Exclusive use.
    pub const DMEXCL: u32 = 0x2000_0000;
    /// Non-backed-up file.
    pub const DMTMP: u32 = 0x0400_0000;
}

/// Bytes taken by the fixed-width part of a stat, after its own size field,
/// including the four string length prefixes.
///
/// type[2] dev[4] qid[13] mode[4] atime[4] mtime[4] length[8] + 4 * len[2]
const STAT_FIXED_SIZE: usize = 2 + 4 + QID_SIZE + 4 + 4 + 4 + 8 + 4 * 2;

/// File metadata as carried by Rstat and Twstat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stat {
    /// Byte count of the stat after this field. Recomputed on encode.
    pub size: u16,
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Stat {
    /// A stat whose every field means "leave unchanged" in Twstat.
    pub fn dont_touch() -> Self {
        Self {
            size: 0,
            typ: u16::MAX,
            dev: u32::MAX,
            qid: Qid::new(QidType::from_bits_retain(u8::MAX), u32::MAX, u64::MAX),
            mode: u32::MAX,
            atime: u32::MAX,
            mtime: u32::MAX,
            length: u64::MAX,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
        .sized()
    }

    /// Value the size field must hold for the current strings.
    pub fn computed_size(&self) -> usize {
        STAT_FIXED_SIZE + self.name.len() + self.uid.len() + self.gid.len() + self.muid.len()
    }

    /// Return the stat with `size` set to match its contents.
    pub fn sized(mut self) -> Self {
        self.size = self.computed_size() as u16;
        self
    }

    /// Total encoded length, size field included.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        2 + self.computed_size()
    }

    /// Largest `size` whose enclosing `n[2]` (size field included) still
    /// fits in 16 bits.
    pub const MAX_SIZE: usize = u16::MAX as usize - 2;

    /// Write the stat prefixed by its `n[2]` byte count, as Rstat and
    /// Twstat carry it.
    pub(crate) fn encode_counted<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let n = u16::try_from(self.encoded_len()).map_err(|_| {
            NineError::InvalidArgument(format!(
                "stat of {} bytes does not fit in a 16-bit count",
                self.encoded_len()
            ))
        })?;
        buf.put_u16_le(n);
        self.encode(buf)
    }

    pub(crate) fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let size = self.computed_size();
        if size > Self::MAX_SIZE {
            return Err(NineError::InvalidArgument(format!(
                "stat of {} bytes does not fit in a 16-bit size",
                size
            )));
        }
        buf.put_u16_le(size as u16);
        buf.put_u16_le(self.typ);
        buf.put_u32_le(self.dev);
        self.qid.encode(buf);
        buf.put_u32_le(self.mode);
        buf.put_u32_le(self.atime);
        buf.put_u32_le(self.mtime);
        buf.put_u64_le(self.length);
        put_str(buf, &self.name)?;
        put_str(buf, &self.uid)?;
        put_str(buf, &self.gid)?;
        put_str(buf, &self.muid)?;
        Ok(())
    }

    pub(crate) fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure_remaining(buf, 2, "stat size")?;
        let size = buf.get_u16_le();
        if (size as usize) < STAT_FIXED_SIZE {
            return Err(NineError::Decode(format!("stat size {} too small", size)));
        }
        ensure_remaining(buf, size as usize, "stat")?;
        let before = buf.remaining();

        let stat = Self {
            size,
            typ: buf.get_u16_le(),
            dev: buf.get_u32_le(),
            qid: Qid::decode(buf)?,
            mode: buf.get_u32_le(),
            atime: buf.get_u32_le(),
            mtime: buf.get_u32_le(),
            length: buf.get_u64_le(),
            name: get_str_lossy(buf)?,
            uid: get_str_lossy(buf)?,
            gid: get_str_lossy(buf)?,
            muid: get_str_lossy(buf)?,
        };

        let consumed = before - buf.remaining();
        if consumed != size as usize {
            return Err(NineError::Decode(format!(
                "stat size {} disagrees with {} bytes of content",
                size, consumed
            )));
        }
        Ok(stat)
    }
}

/// Check there are at least `n` readable bytes left.
pub(crate) fn ensure_remaining<B: Buf>(buf: &B, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(NineError::Decode(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Write a 9P string: u16 length + raw bytes, no terminator.
pub(crate) fn put_str<B: BufMut>(buf: &mut B, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(NineError::InvalidArgument(format!(
            "string of {} bytes exceeds 16-bit length",
            s.len()
        )));
    }
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_raw_str<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    ensure_remaining(buf, 2, "string length")?;
    let len = buf.get_u16_le() as usize;
    ensure_remaining(buf, len, "string")?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(raw)
}

/// Read a 9P string that must be UTF-8 (version, names in requests).
pub(crate) fn get_str<B: Buf>(buf: &mut B) -> Result<String> {
    String::from_utf8(get_raw_str(buf)?)
        .map_err(|e| NineError::Decode(format!("invalid UTF-8 string: {}", e)))
}

/// Read server-supplied text (error strings, stat names). Invalid UTF-8 is
/// replaced rather than rejected; the length prefix alone decides framing.
pub(crate) fn get_str_lossy<B: Buf>(buf: &mut B) -> Result<String> {
    let raw = get_raw_str(buf)?;
    Ok(match String::from_utf8(raw) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}
