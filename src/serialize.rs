//! Wire primitives and the 9P message codec.
//!
//! Low-level encode/decode of fixed-width integers and length-prefixed
//! strings follows the teacher's `Encodable`/`Decodable` + operator-overload
//! idiom. Message-body codec (`encode_msg`/`decode_msg`) is dialect-aware:
//! `Tauth`, `Tattach`, `Tcreate`, `Tstat`, `Twstat`, and `Rerror` read/write
//! a different shape depending on whether the connection negotiated plain
//! 9P2000 or 9P2000.u (component F).

use std::io::Result;
use std::mem;
use std::ops::{Shl, Shr};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

use crate::dialect::Dialect;
use crate::fcall::{FCall, MsgType, Qid, QidType};
use crate::stat::Stat;
use crate::io_err;

fn read_exact<R: std::io::Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing-specific result, to overload `<<`/`>>` on something other
/// than a bare `Result`.
pub struct SResult<T>(Result<T>);

/// Wraps a `WriteBytesExt`; `<<` serializes its right-hand side.
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Append an already-formatted byte run (used by the stat codec, whose
    /// envelope logic lives in `crate::stat` rather than `Encodable`).
    pub fn encode_raw(&mut self, raw: &[u8]) -> Result<usize> {
        self.writer.write_all(raw)?;
        self.bytes += raw.len();
        Ok(raw.len())
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Wraps a `ReadBytesExt`; `>>` deserializes into its right-hand side.
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A type that can be serialized to binary (component A: wire primitives).
pub trait Encodable {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

/// A type that can be deserialized from binary (component A: wire primitives).
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self.iter().fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s) {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// `Rread`/`Twrite` payload: a raw byte blob, length-prefixed with `u32`
/// rather than `Vec<u8>`'s `u16` (counts can exceed 64KiB up to `msize`).
struct Data<'a>(&'a [u8]);

impl<'a> Encodable for Data<'a> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(self.0)?;
        Ok(bytes)
    }
}

fn decode_data<R: ReadBytesExt>(r: &mut R) -> Result<Vec<u8>> {
    let len: u32 = Decodable::decode(r)?;
    read_exact(r, len as usize)
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?).map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: QidType::from_bits_truncate(Decodable::decode(r)?),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Encode a bare QID (used by the stat codec, which has its own envelope).
pub(crate) fn encode_qid(qid: &Qid) -> [u8; 13] {
    let mut buf = [0u8; 13];
    buf[0] = qid.typ.bits();
    LittleEndian::write_u32(&mut buf[1..5], qid.version);
    LittleEndian::write_u64(&mut buf[5..13], qid.path);
    buf
}

/// Decode a bare 13-byte QID.
pub(crate) fn decode_qid(buf: &[u8]) -> crate::utils::Result<Qid> {
    if buf.len() < 13 {
        return Err(crate::error::Error::Protocol("Truncated"));
    }
    Ok(Qid {
        typ: QidType::from_bits_truncate(buf[0]),
        version: LittleEndian::read_u32(&buf[1..5]),
        path: LittleEndian::read_u64(&buf[5..13]),
    })
}

fn decode_stat<R: ReadBytesExt>(r: &mut R, is_u: bool) -> Result<Stat> {
    let outer_len: u16 = Decodable::decode(r)?;
    let body = read_exact(r, outer_len as usize)?;
    Stat::from_bytes(&body, is_u).map_err(|_| io_err!(Other, "Truncated stat"))
}

/// Format a message body for the wire. Returns the body bytes only (no
/// `size`/`type`/`tag` header; the framer in `srv` prepends that).
pub fn encode_body(body: &FCall, dialect: Dialect) -> Result<Vec<u8>> {
    let mut w: Vec<u8> = Vec::new();
    let is_u = dialect == Dialect::ExtendedU;

    let buf = match body {
        FCall::Tversion { msize, version } => Encoder::new(&mut w) << msize << version,
        FCall::Rversion { msize, version } => Encoder::new(&mut w) << msize << version,
        FCall::Tauth { afid, uname, aname, n_uname } => {
            let enc = Encoder::new(&mut w) << afid << uname << aname;
            if is_u { enc << n_uname } else { enc }
        }
        FCall::Rauth { aqid } => Encoder::new(&mut w) << aqid,
        FCall::Rerror { ename, errno } => {
            let enc = Encoder::new(&mut w) << ename;
            if is_u { enc << errno } else { enc }
        }
        FCall::Tattach { fid, afid, uname, aname, n_uname } => {
            let enc = Encoder::new(&mut w) << fid << afid << uname << aname;
            if is_u { enc << n_uname } else { enc }
        }
        FCall::Rattach { qid } => Encoder::new(&mut w) << qid,
        FCall::Tflush { oldtag } => Encoder::new(&mut w) << oldtag,
        FCall::Rflush => SResult(Ok(Encoder::new(&mut w))),
        FCall::Twalk { fid, newfid, wnames } => Encoder::new(&mut w) << fid << newfid << wnames,
        FCall::Rwalk { wqids } => Encoder::new(&mut w) << wqids,
        FCall::Topen { fid, mode } => Encoder::new(&mut w) << fid << mode,
        FCall::Ropen { qid, iounit } => Encoder::new(&mut w) << qid << iounit,
        FCall::Tcreate { fid, name, perm, mode, extension } => {
            let enc = Encoder::new(&mut w) << fid << name << perm << mode;
            if is_u { enc << extension } else { enc }
        }
        FCall::Rcreate { qid, iounit } => Encoder::new(&mut w) << qid << iounit,
        FCall::Tread { fid, offset, count } => Encoder::new(&mut w) << fid << offset << count,
        FCall::Rread { data } => Encoder::new(&mut w) << &Data(data),
        FCall::Twrite { fid, offset, data } => Encoder::new(&mut w) << fid << offset << &Data(data),
        FCall::Rwrite { count } => Encoder::new(&mut w) << count,
        FCall::Tclunk { fid } => Encoder::new(&mut w) << fid,
        FCall::Rclunk => SResult(Ok(Encoder::new(&mut w))),
        FCall::Tremove { fid } => Encoder::new(&mut w) << fid,
        FCall::Rremove => SResult(Ok(Encoder::new(&mut w))),
        FCall::Tstat { fid } => Encoder::new(&mut w) << fid,
        FCall::Rstat { stat } => {
            let mut enc = Encoder::new(&mut w);
            match enc.encode_raw(&stat.to_bytes(true)) {
                Ok(_) => SResult(Ok(enc)),
                Err(e) => SResult(Err(e)),
            }
        }
        FCall::Twstat { fid, stat } => {
            let mut enc = Encoder::new(&mut w);
            let r = enc.encode(fid).and_then(|_| enc.encode_raw(&stat.to_bytes(true)));
            match r {
                Ok(_) => SResult(Ok(enc)),
                Err(e) => SResult(Err(e)),
            }
        }
        FCall::Rwstat => SResult(Ok(Encoder::new(&mut w))),
    };

    match buf {
        SResult(Ok(_)) => Ok(w),
        SResult(Err(e)) => Err(e),
    }
}

/// Parse a message body given its already-decoded type and tag.
pub fn decode_body(typ: MsgType, dialect: Dialect, buf: &[u8]) -> crate::utils::Result<FCall> {
    let is_u = dialect == Dialect::ExtendedU;
    let mut r = std::io::Cursor::new(buf);
    let trunc = |_| crate::error::Error::Protocol("Truncated");

    let fcall = match typ {
        MsgType::Tversion => FCall::Tversion {
            msize: Decodable::decode(&mut r).map_err(trunc)?,
            version: Decodable::decode(&mut r).map_err(trunc)?,
        },
        MsgType::Tauth => {
            let afid = Decodable::decode(&mut r).map_err(trunc)?;
            let uname = Decodable::decode(&mut r).map_err(trunc)?;
            let aname = Decodable::decode(&mut r).map_err(trunc)?;
            let n_uname = if is_u { Decodable::decode(&mut r).map_err(trunc)? } else { crate::fcall::NONUNAME };
            FCall::Tauth { afid, uname, aname, n_uname }
        }
        MsgType::Tattach => {
            let fid = Decodable::decode(&mut r).map_err(trunc)?;
            let afid = Decodable::decode(&mut r).map_err(trunc)?;
            let uname = Decodable::decode(&mut r).map_err(trunc)?;
            let aname = Decodable::decode(&mut r).map_err(trunc)?;
            let n_uname = if is_u { Decodable::decode(&mut r).map_err(trunc)? } else { crate::fcall::NONUNAME };
            FCall::Tattach { fid, afid, uname, aname, n_uname }
        }
        MsgType::Tflush => FCall::Tflush {
            oldtag: Decodable::decode(&mut r).map_err(trunc)?,
        },
        MsgType::Twalk => FCall::Twalk {
            fid: Decodable::decode(&mut r).map_err(trunc)?,
            newfid: Decodable::decode(&mut r).map_err(trunc)?,
            wnames: Decodable::decode(&mut r).map_err(trunc)?,
        },
        MsgType::Topen => FCall::Topen {
            fid: Decodable::decode(&mut r).map_err(trunc)?,
            mode: Decodable::decode(&mut r).map_err(trunc)?,
        },
        MsgType::Tcreate => {
            let fid = Decodable::decode(&mut r).map_err(trunc)?;
            let name = Decodable::decode(&mut r).map_err(trunc)?;
            let perm = Decodable::decode(&mut r).map_err(trunc)?;
            let mode = Decodable::decode(&mut r).map_err(trunc)?;
            let extension = if is_u { Decodable::decode(&mut r).map_err(trunc)? } else { String::new() };
            FCall::Tcreate { fid, name, perm, mode, extension }
        }
        MsgType::Tread => FCall::Tread {
            fid: Decodable::decode(&mut r).map_err(trunc)?,
            offset: Decodable::decode(&mut r).map_err(trunc)?,
            count: Decodable::decode(&mut r).map_err(trunc)?,
        },
        MsgType::Twrite => {
            let fid = Decodable::decode(&mut r).map_err(trunc)?;
            let offset = Decodable::decode(&mut r).map_err(trunc)?;
            let data = decode_data(&mut r).map_err(trunc)?;
            FCall::Twrite { fid, offset, data }
        }
        MsgType::Tclunk => FCall::Tclunk {
            fid: Decodable::decode(&mut r).map_err(trunc)?,
        },
        MsgType::Tremove => FCall::Tremove {
            fid: Decodable::decode(&mut r).map_err(trunc)?,
        },
        MsgType::Tstat => FCall::Tstat {
            fid: Decodable::decode(&mut r).map_err(trunc)?,
        },
        MsgType::Twstat => {
            let fid = Decodable::decode(&mut r).map_err(trunc)?;
            let stat = decode_stat(&mut r, is_u).map_err(trunc)?;
            FCall::Twstat { fid, stat }
        }
        _ => return Err(crate::error::Error::Unimplemented),
    };

    Ok(fcall)
}

impl MsgType {
    /// Numeric wire code, via the `enum_primitive`-derived repr.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<MsgType> {
        MsgType::from_u8(code)
    }
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    use std::io::Cursor;

    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    loop {
        match Decodable::decode(&mut decoder) {
            Ok(i) => actual.push(i),
            Err(_) => break,
        }
    }
    assert_eq!(expected, actual);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::NOFID;

    #[test]
    fn tversion_round_trips_plain() {
        let body = FCall::Tversion { msize: 8192, version: crate::fcall::P92000.to_owned() };
        let bytes = encode_body(&body, Dialect::Plain).unwrap();
        let decoded = decode_body(MsgType::Tversion, Dialect::Plain, &bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn tattach_drops_n_uname_on_plain_wire() {
        let body = FCall::Tattach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".into(),
            aname: "".into(),
            n_uname: 1000,
        };
        let bytes = encode_body(&body, Dialect::Plain).unwrap();
        // fid(4) + afid(4) + uname(2+6) + aname(2+0), no n_uname suffix.
        assert_eq!(bytes.len(), 4 + 4 + 8 + 2);
        let decoded = decode_body(MsgType::Tattach, Dialect::Plain, &bytes).unwrap();
        match decoded {
            FCall::Tattach { n_uname, .. } => assert_eq!(n_uname, crate::fcall::NONUNAME),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tattach_round_trips_u() {
        let body = FCall::Tattach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".into(),
            aname: "".into(),
            n_uname: 1000,
        };
        let bytes = encode_body(&body, Dialect::ExtendedU).unwrap();
        let decoded = decode_body(MsgType::Tattach, Dialect::ExtendedU, &bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn rerror_carries_errno_only_under_u() {
        let body = FCall::Rerror { ename: "No such file!".into(), errno: 2 };
        let plain = encode_body(&body, Dialect::Plain).unwrap();
        let u = encode_body(&body, Dialect::ExtendedU).unwrap();
        assert_eq!(u.len(), plain.len() + 4);
    }
}
