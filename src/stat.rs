//! `Stat` / `Stat.u` codec: the file-metadata record carried by `Rstat` and
//! `Twstat`, and the sentinel-based merge ("wstat") algorithm.
//!
//! The plain record is a 2-byte inner-size envelope followed by 39 bytes of
//! fixed fields and four length-prefixed strings. 9P2000.u appends a fifth
//! string (`extension`) and three 4-byte integers (`n_uid`, `n_gid`,
//! `n_muid`). Both forms share one Rust type; the `.u` fields live in an
//! `Option` so a plain-dialect connection never allocates them.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;
use crate::fcall::Qid;
use crate::utils::Result;

/// "Don't touch this field" sentinel for `u16`-width stat fields.
pub const SENTINEL_U16: u16 = !0;
/// "Don't touch this field" sentinel for `u32`-width stat fields.
pub const SENTINEL_U32: u32 = !0;
/// "Don't touch this field" sentinel for `u64`-width stat fields.
pub const SENTINEL_U64: u64 = !0;

/// Mask isolating the QID-type byte (bits 24-31) within `Stat.mode`.
///
/// The source this crate is modeled on instead masks with `0o7777000`,
/// which straddles the permission/type boundary and lets some permission
/// changes spuriously collide with the type-change check (and lets some
/// real type changes slip through). `0xFFFF_0000` is the correct mask: it
/// isolates exactly the bits `Qid.typ` occupies when shifted into `mode`.
pub const MODE_TYPE_MASK: u32 = 0xFFFF_0000;

/// The 9P2000.u extension fields of a stat record.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatExt {
    pub extension: String,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

impl StatExt {
    fn sentinel() -> StatExt {
        StatExt {
            extension: String::new(),
            n_uid: SENTINEL_U32,
            n_gid: SENTINEL_U32,
            n_muid: SENTINEL_U32,
        }
    }
}

/// A file-metadata record. `ext` is `Some` exactly when this value
/// originated on (or is destined for) a 9P2000.u connection.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
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
    pub ext: Option<StatExt>,
}

impl Stat {
    /// A stat value whose every field is the "don't touch" sentinel, used
    /// as the identity element for [`Stat::merge`].
    pub fn sentinel(is_u: bool) -> Stat {
        Stat {
            typ: SENTINEL_U16,
            dev: SENTINEL_U32,
            qid: Qid {
                typ: crate::fcall::QidType::empty(),
                version: SENTINEL_U32,
                path: SENTINEL_U64,
            },
            mode: SENTINEL_U32,
            atime: SENTINEL_U32,
            mtime: SENTINEL_U32,
            length: SENTINEL_U64,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
            ext: if is_u { Some(StatExt::sentinel()) } else { None },
        }
    }

    fn string_bytes(&self) -> usize {
        let base = self.name.len() + self.uid.len() + self.gid.len() + self.muid.len();
        match &self.ext {
            Some(ext) => base + ext.extension.len(),
            None => base,
        }
    }

    /// Value of the inner 2-byte size field: the byte length of the stat
    /// body (fixed fields, string-length prefixes, and string/int payload)
    /// not counting the size field itself.
    pub fn inner_size(&self) -> usize {
        let fixed = if self.ext.is_some() { 61 } else { 47 };
        fixed + self.string_bytes()
    }

    /// Total serialized length, including the outer 2-byte envelope:
    /// `inner_size() + 4` (2 for the size field itself, 2 for the outer
    /// envelope).
    pub fn size(&self) -> u32 {
        (self.inner_size() + 4) as u32
    }

    /// Parse a stat body. `buf` starts at the inner 2-byte size field (no
    /// outer envelope). `is_u` selects the 9P2000.u layout.
    pub fn from_bytes(buf: &[u8], is_u: bool) -> Result<Stat> {
        if buf.len() < 41 {
            return Err(Error::Protocol("Truncated"));
        }
        let typ = LittleEndian::read_u16(&buf[2..4]);
        let dev = LittleEndian::read_u32(&buf[4..8]);
        let qid = crate::serialize::decode_qid(&buf[8..21])?;
        let mode = LittleEndian::read_u32(&buf[21..25]);
        let atime = LittleEndian::read_u32(&buf[25..29]);
        let mtime = LittleEndian::read_u32(&buf[29..33]);
        let length = LittleEndian::read_u64(&buf[33..41]);

        let nstrings = if is_u { 5 } else { 4 };
        let mut off = 41;
        let mut strings = Vec::with_capacity(nstrings);
        for _ in 0..nstrings {
            if buf.len() < off + 2 {
                return Err(Error::Protocol("Truncated"));
            }
            let len = LittleEndian::read_u16(&buf[off..off + 2]) as usize;
            off += 2;
            if buf.len() < off + len {
                return Err(Error::Protocol("Truncated"));
            }
            strings.push(String::from_utf8_lossy(&buf[off..off + len]).into_owned());
            off += len;
        }

        let ext = if is_u {
            if buf.len() < off + 12 {
                return Err(Error::Protocol("Truncated"));
            }
            let n_uid = LittleEndian::read_u32(&buf[off..off + 4]);
            let n_gid = LittleEndian::read_u32(&buf[off + 4..off + 8]);
            let n_muid = LittleEndian::read_u32(&buf[off + 8..off + 12]);
            Some(StatExt {
                extension: strings.pop().unwrap(),
                n_uid,
                n_gid,
                n_muid,
            })
        } else {
            None
        };

        let mut strings = strings.into_iter();
        let name = strings.next().unwrap_or_default();
        let uid = strings.next().unwrap_or_default();
        let gid = strings.next().unwrap_or_default();
        let muid = strings.next().unwrap_or_default();

        Ok(Stat {
            typ,
            dev,
            qid,
            mode,
            atime,
            mtime,
            length,
            name,
            uid,
            gid,
            muid,
            ext,
        })
    }

    /// Format this stat. When `with_envelope` is set, the outer 2-byte
    /// envelope (`inner_size() + 2`) is prepended.
    pub fn to_bytes(&self, with_envelope: bool) -> Vec<u8> {
        let inner = self.inner_size();
        let mut out = Vec::with_capacity(inner + 4);

        if with_envelope {
            write_u16(&mut out, (inner + 2) as u16);
        }
        write_u16(&mut out, inner as u16);
        write_u16(&mut out, self.typ);
        write_u32(&mut out, self.dev);
        out.extend_from_slice(&crate::serialize::encode_qid(&self.qid));
        write_u32(&mut out, self.mode);
        write_u32(&mut out, self.atime);
        write_u32(&mut out, self.mtime);
        write_u64(&mut out, self.length);
        write_str(&mut out, &self.name);
        write_str(&mut out, &self.uid);
        write_str(&mut out, &self.gid);
        write_str(&mut out, &self.muid);
        if let Some(ext) = &self.ext {
            write_str(&mut out, &ext.extension);
            write_u32(&mut out, ext.n_uid);
            write_u32(&mut out, ext.n_gid);
            write_u32(&mut out, ext.n_muid);
        }
        out
    }

    /// Merge `delta` onto `self`: every field in `delta` that is not its
    /// sentinel replaces the corresponding field in `self`. Fails with
    /// [`Error::ModeConflict`] if `delta.mode` is set and its type bits
    /// (`mode & MODE_TYPE_MASK`) differ from `self.mode`'s.
    pub fn merge(&self, delta: &Stat) -> Result<Stat> {
        if delta.mode != SENTINEL_U32 && (self.mode & MODE_TYPE_MASK) != (delta.mode & MODE_TYPE_MASK) {
            return Err(Error::ModeConflict);
        }

        let mut out = self.clone();
        if delta.typ != SENTINEL_U16 {
            out.typ = delta.typ;
        }
        if delta.dev != SENTINEL_U32 {
            out.dev = delta.dev;
        }
        if delta.mode != SENTINEL_U32 {
            out.mode = delta.mode;
        }
        if delta.atime != SENTINEL_U32 {
            out.atime = delta.atime;
        }
        if delta.mtime != SENTINEL_U32 {
            out.mtime = delta.mtime;
        }
        if delta.length != SENTINEL_U64 {
            out.length = delta.length;
        }
        if !delta.name.is_empty() {
            out.name = delta.name.clone();
        }
        if !delta.uid.is_empty() {
            out.uid = delta.uid.clone();
        }
        if !delta.gid.is_empty() {
            out.gid = delta.gid.clone();
        }
        if !delta.muid.is_empty() {
            out.muid = delta.muid.clone();
        }
        if let (Some(out_ext), Some(delta_ext)) = (out.ext.as_mut(), delta.ext.as_ref()) {
            if !delta_ext.extension.is_empty() {
                out_ext.extension = delta_ext.extension.clone();
            }
            if delta_ext.n_uid != SENTINEL_U32 {
                out_ext.n_uid = delta_ext.n_uid;
            }
            if delta_ext.n_gid != SENTINEL_U32 {
                out_ext.n_gid = delta_ext.n_gid;
            }
            if delta_ext.n_muid != SENTINEL_U32 {
                out_ext.n_muid = delta_ext.n_muid;
            }
        }
        Ok(out)
    }
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    out.extend_from_slice(&b);
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    out.extend_from_slice(&b);
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(is_u: bool) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: Qid {
                typ: crate::fcall::QidType::FILE,
                version: 1,
                path: 42,
            },
            mode: 0o644,
            atime: 1000,
            mtime: 2000,
            length: 5,
            name: "hello".into(),
            uid: "glenda".into(),
            gid: "glenda".into(),
            muid: "glenda".into(),
            ext: if is_u {
                Some(StatExt {
                    extension: String::new(),
                    n_uid: 1000,
                    n_gid: 1000,
                    n_muid: 1000,
                })
            } else {
                None
            },
        }
    }

    #[test]
    fn round_trip_plain() {
        let s = sample(false);
        let bytes = s.to_bytes(true);
        assert_eq!(bytes.len(), s.size() as usize);
        let parsed = Stat::from_bytes(&bytes[2..], false).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn round_trip_u() {
        let s = sample(true);
        let bytes = s.to_bytes(true);
        assert_eq!(bytes.len(), s.size() as usize);
        let parsed = Stat::from_bytes(&bytes[2..], true).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn merge_with_all_sentinel_delta_is_identity() {
        let s = sample(false);
        let delta = Stat::sentinel(false);
        assert_eq!(s.merge(&delta).unwrap(), s);
    }

    #[test]
    fn merge_rejects_type_bit_change() {
        let s = sample(false);
        let mut delta = Stat::sentinel(false);
        delta.mode = s.mode ^ MODE_TYPE_MASK;
        assert!(s.merge(&delta).is_err());
    }

    #[test]
    fn merge_allows_permission_only_change() {
        let s = sample(false);
        let mut delta = Stat::sentinel(false);
        delta.mode = (s.mode & MODE_TYPE_MASK) | 0o600;
        let merged = s.merge(&delta).unwrap();
        assert_eq!(merged.mode, delta.mode);
    }

    #[test]
    fn inner_size_matches_written_field() {
        let s = sample(true);
        let bytes = s.to_bytes(false);
        let inner = LittleEndian::read_u16(&bytes[0..2]) as usize;
        assert_eq!(inner, s.inner_size());
    }
}
