//! Serialize/deserialize 9P2000 messages into/from binary.

use crate::fcall::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

fn invalid_data(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing-specific result, to overload operators on `Result`.
pub struct SResult<T>(Result<T>);

/// A wrapper around `WriteBytesExt` providing `<<` chaining for
/// serialization: `encoder << &field << &field`.
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

    pub fn into_inner(self) -> W {
        self.writer
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

/// A wrapper around `ReadBytesExt` providing `>>` chaining for
/// deserialization.
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
    pub fn into_inner(self) -> R {
        self.reader
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

/// A type which can be serialized into binary.
pub trait Encodable {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
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

/// Encodes the "inner" stat form: `size[2]` (the value returned by
/// `Stat::size`) followed by the fields it counts. Callers that embed a
/// stat inside `Rstat`/`Twstat` additionally prefix this with an outer
/// `size[2]` equal to `2 + stat.size()` (see `Msg::encode`).
impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > MAX_WALK {
            return Err(invalid_data(format!(
                "too many elements for a 9P2000 array: {} > {}",
                self.len(),
                MAX_WALK
            )));
        }
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use FCall::*;

        let typ = self.body.msg_type();
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match &self.body {
            Tversion { msize, version } => buf << msize << version,
            Rversion { msize, version } => buf << msize << version,
            Tauth { afid, uname, aname } => buf << afid << uname << aname,
            Rauth { aqid } => buf << aqid,
            Rerror { ename } => buf << ename,
            Tflush { oldtag } => buf << oldtag,
            Rflush => buf,
            Tattach { fid, afid, uname, aname } => buf << fid << afid << uname << aname,
            Rattach { qid } => buf << qid,
            Twalk { fid, newfid, wnames } => buf << fid << newfid << wnames,
            Rwalk { wqids } => buf << wqids,
            Topen { fid, mode } => buf << fid << mode,
            Ropen { qid, iounit } => buf << qid << iounit,
            Tcreate { fid, name, perm, mode } => buf << fid << name << perm << mode,
            Rcreate { qid, iounit } => buf << qid << iounit,
            Tread { fid, offset, count } => buf << fid << offset << count,
            Rread { data } => buf << data,
            Twrite { fid, offset, data } => buf << fid << offset << data,
            Rwrite { count } => buf << count,
            Tclunk { fid } => buf << fid,
            Rclunk => buf,
            Tremove { fid } => buf << fid,
            Rremove => buf,
            Tstat { fid } => buf << fid,
            Rstat { stat } => {
                let outer = stat.size() + 2;
                buf << &outer << stat
            }
            Twstat { fid, stat } => {
                let outer = stat.size() + 2;
                buf << fid << &outer << stat
            }
            Rwstat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// A type which can be deserialized from binary.
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
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
        String::from_utf8(read_exact(r, len as usize)?).map_err(|_| invalid_data("invalid UTF-8 in 9P string"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let bits: u8 = Decodable::decode(r)?;
        Ok(Qid {
            typ: QidType::from_bits_truncate(bits),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let _size: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        if len as usize > MAX_WALK {
            return Err(invalid_data(format!(
                "too many elements for a 9P2000 array: {} > {}",
                len, MAX_WALK
            )));
        }
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag: u16 = decode!(buf);
        let body = match msg_type {
            Some(MsgType::Tversion) => FCall::Tversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(MsgType::Rversion) => FCall::Rversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(MsgType::Tauth) => FCall::Tauth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(MsgType::Rauth) => FCall::Rauth { aqid: decode!(buf) },
            Some(MsgType::Rerror) => FCall::Rerror { ename: decode!(buf) },
            Some(MsgType::Tflush) => FCall::Tflush { oldtag: decode!(buf) },
            Some(MsgType::Rflush) => FCall::Rflush,
            Some(MsgType::Tattach) => FCall::Tattach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(MsgType::Rattach) => FCall::Rattach { qid: decode!(buf) },
            Some(MsgType::Twalk) => FCall::Twalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(MsgType::Rwalk) => FCall::Rwalk { wqids: decode!(buf) },
            Some(MsgType::Topen) => FCall::Topen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(MsgType::Ropen) => FCall::Ropen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(MsgType::Tcreate) => FCall::Tcreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(MsgType::Rcreate) => FCall::Rcreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(MsgType::Tread) => FCall::Tread {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(MsgType::Rread) => FCall::Rread { data: decode!(buf) },
            Some(MsgType::Twrite) => FCall::Twrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(MsgType::Rwrite) => FCall::Rwrite { count: decode!(buf) },
            Some(MsgType::Tclunk) => FCall::Tclunk { fid: decode!(buf) },
            Some(MsgType::Rclunk) => FCall::Rclunk,
            Some(MsgType::Tremove) => FCall::Tremove { fid: decode!(buf) },
            Some(MsgType::Rremove) => FCall::Rremove,
            Some(MsgType::Tstat) => FCall::Tstat { fid: decode!(buf) },
            Some(MsgType::Rstat) => {
                let _outer: u16 = decode!(buf);
                FCall::Rstat { stat: decode!(buf) }
            }
            Some(MsgType::Twstat) => {
                let fid = decode!(buf);
                let _outer: u16 = decode!(buf);
                FCall::Twstat { fid, stat: decode!(buf) }
            }
            Some(MsgType::Rwstat) => FCall::Rwstat,
            None => return Err(invalid_data("invalid 9P message type byte")),
        };

        Ok(Msg { tag, body })
    }
}

/// Reads a 9P message body (`type[1] tag[2] ...`) from a byte stream.
/// The caller is expected to have already stripped the outer `size[4]`
/// frame (see `dial.rs`'s use of `LengthDelimitedCodec`).
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Writes a 9P message body, not including the outer `size[4]` frame.
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10u8 {
            i.encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn msg_encode_decode_rversion() {
        let expected = Msg {
            tag: 0xdead,
            body: FCall::Rversion { msize: 8192, version: P92000.to_owned() },
        };
        let mut buf = Vec::new();
        expected.encode(&mut buf).unwrap();

        let mut readbuf = Cursor::new(buf);
        let actual: Msg = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn msg_encode_decode_rstat_roundtrips_double_length_prefix() {
        let mut stat = Stat::unchanged();
        stat.name = "hello".into();
        stat.typ = 0;
        let expected = Msg { tag: 1, body: FCall::Rstat { stat } };
        let mut buf = Vec::new();
        expected.encode(&mut buf).unwrap();

        let mut readbuf = Cursor::new(buf);
        let actual: Msg = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn twalk_rejects_more_than_max_walk_names() {
        let wnames: Vec<String> = (0..(MAX_WALK + 1)).map(|i| i.to_string()).collect();
        let msg = Msg { tag: 1, body: FCall::Twalk { fid: 1, newfid: 2, wnames } };
        let mut buf = Vec::new();
        assert!(msg.encode(&mut buf).is_err());
    }
}
