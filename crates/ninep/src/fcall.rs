//! 9P2000 protocol data types and constants.
//!
//! # Protocol
//! 9P2000 (no `.u` or `.L` extensions — see the workspace's non-goals).

use bitflags::bitflags;

/// 9P2000 version string.
pub const P92000: &str = "9P2000";

/// The version string a server replies with when it doesn't understand
/// the client's proposed version.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which `Tversion`/`Rversion` must use as `tag`.
pub const NOTAG: u16 = !0;

/// Special value which `Tattach`/`Tauth` with no auth must use as `afid`.
pub const NOFID: u32 = !0;

/// Maximum number of path components in a single `Twalk`/`Rwalk`.
pub const MAX_WALK: usize = 16;

/// Ample room for a `Tread`/`Twrite` header: `size[4] type[1] tag[2]
/// fid[4] offset[8] count[4]`.
pub const IOHDRSZ: u32 = 23;

bitflags! {
    /// Bits in `Qid.typ`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for non-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<std::fs::FileType> for QidType {
    fn from(typ: std::fs::FileType) -> Self {
        let mut t = QidType::FILE;
        if typ.is_dir() {
            t.insert(QidType::DIR);
        }
        t
    }
}

bitflags! {
    /// High bits in `Dir.mode` (the low 9 bits are plain POSIX
    /// permission bits and are not modeled as flags here).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DirMode: u32 {
        const DIR       = 0x8000_0000;
        const APPEND    = 0x4000_0000;
        const EXCL      = 0x2000_0000;
        const AUTH      = 0x0800_0000;
        const TMP       = 0x0400_0000;
        const READ      = 0x4;
        const WRITE     = 0x2;
        const EXEC      = 0x1;
    }
}

/// `Topen`/`Tcreate` mode byte.
pub mod om {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const RDWR: u8 = 2;
    pub const EXEC: u8 = 3;
    pub const TRUNC: u8 = 0x10;
    pub const RCLOSE: u8 = 0x40;
}

/// Server-assigned file identity.
///
/// Two qids are equal iff all three fields match; equal qids denote the
/// same file across the session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qid {
    pub typ: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    /// Encoded size in bytes: `type[1] version[4] path[8]`.
    pub const SIZE: u32 = 13;
}

/// Namespace metadata record ("stat" / "Dir" in Plan 9 terms).
///
/// A field equal to its type's max value means "leave unchanged" on
/// `Twstat` (the "don't-touch" sentinel from spec.md §3).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
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
}

impl Stat {
    /// A stat record with every field set to its don't-touch sentinel,
    /// suitable as a starting point for a `Twstat` that only changes one
    /// field.
    pub fn unchanged() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: Qid { typ: QidType::empty(), version: !0, path: !0 },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// Encoded size of the stat body, not counting its own leading
    /// `size[2]` field.
    pub fn size(&self) -> u16 {
        (2 + 4 + Qid::SIZE as usize
            + 4
            + 4
            + 4
            + 8
            + (2 + self.name.len())
            + (2 + self.uid.len())
            + (2 + self.gid.len())
            + (2 + self.muid.len())) as u16
    }
}

/// Data carried by `Rread`/`Twrite`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

/// 9P2000 message type tags, values 100..127 per spec.md §6.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MsgType {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    // Terror is reserved and never sent on the wire.
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<MsgType> {
        use MsgType::*;
        Some(match v {
            100 => Tversion,
            101 => Rversion,
            102 => Tauth,
            103 => Rauth,
            104 => Tattach,
            105 => Rattach,
            107 => Rerror,
            108 => Tflush,
            109 => Rflush,
            110 => Twalk,
            111 => Rwalk,
            112 => Topen,
            113 => Ropen,
            114 => Tcreate,
            115 => Rcreate,
            116 => Tread,
            117 => Rread,
            118 => Twrite,
            119 => Rwrite,
            120 => Tclunk,
            121 => Rclunk,
            122 => Tremove,
            123 => Rremove,
            124 => Tstat,
            125 => Rstat,
            126 => Twstat,
            127 => Rwstat,
            _ => return None,
        })
    }
}

/// A data type encapsulating the various 9P2000 message bodies.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    Tversion { msize: u32, version: String },
    Rversion { msize: u32, version: String },
    Tauth { afid: u32, uname: String, aname: String },
    Rauth { aqid: Qid },
    Rerror { ename: String },
    Tflush { oldtag: u16 },
    Rflush,
    Tattach { fid: u32, afid: u32, uname: String, aname: String },
    Rattach { qid: Qid },
    Twalk { fid: u32, newfid: u32, wnames: Vec<String> },
    Rwalk { wqids: Vec<Qid> },
    Topen { fid: u32, mode: u8 },
    Ropen { qid: Qid, iounit: u32 },
    Tcreate { fid: u32, name: String, perm: u32, mode: u8 },
    Rcreate { qid: Qid, iounit: u32 },
    Tread { fid: u32, offset: u64, count: u32 },
    Rread { data: Data },
    Twrite { fid: u32, offset: u64, data: Data },
    Rwrite { count: u32 },
    Tclunk { fid: u32 },
    Rclunk,
    Tremove { fid: u32 },
    Rremove,
    Tstat { fid: u32 },
    Rstat { stat: Stat },
    Twstat { fid: u32, stat: Stat },
    Rwstat,
}

impl FCall {
    pub fn msg_type(&self) -> MsgType {
        use FCall::*;
        match self {
            Tversion { .. } => MsgType::Tversion,
            Rversion { .. } => MsgType::Rversion,
            Tauth { .. } => MsgType::Tauth,
            Rauth { .. } => MsgType::Rauth,
            Rerror { .. } => MsgType::Rerror,
            Tflush { .. } => MsgType::Tflush,
            Rflush => MsgType::Rflush,
            Tattach { .. } => MsgType::Tattach,
            Rattach { .. } => MsgType::Rattach,
            Twalk { .. } => MsgType::Twalk,
            Rwalk { .. } => MsgType::Rwalk,
            Topen { .. } => MsgType::Topen,
            Ropen { .. } => MsgType::Ropen,
            Tcreate { .. } => MsgType::Tcreate,
            Rcreate { .. } => MsgType::Rcreate,
            Tread { .. } => MsgType::Tread,
            Rread { .. } => MsgType::Rread,
            Twrite { .. } => MsgType::Twrite,
            Rwrite { .. } => MsgType::Rwrite,
            Tclunk { .. } => MsgType::Tclunk,
            Rclunk => MsgType::Rclunk,
            Tremove { .. } => MsgType::Tremove,
            Rremove => MsgType::Rremove,
            Tstat { .. } => MsgType::Tstat,
            Rstat { .. } => MsgType::Rstat,
            Twstat { .. } => MsgType::Twstat,
            Rwstat => MsgType::Rwstat,
        }
    }

    /// The fid this message operates on, if any. For `Tattach`, this is
    /// the optional existing `afid` established by a prior `Tauth`, not
    /// the new fid being attached (see `newfid`).
    pub fn fid(&self) -> Option<u32> {
        use FCall::*;
        match *self {
            Tattach { afid, .. } if afid != NOFID => Some(afid),
            Twalk { fid, .. } => Some(fid),
            Topen { fid, .. } => Some(fid),
            Tcreate { fid, .. } => Some(fid),
            Tread { fid, .. } => Some(fid),
            Twrite { fid, .. } => Some(fid),
            Tclunk { fid } => Some(fid),
            Tremove { fid } => Some(fid),
            Tstat { fid } => Some(fid),
            Twstat { fid, .. } => Some(fid),
            _ => None,
        }
    }

    /// The new fid this message introduces into the fid table, if any:
    /// `Twalk.newfid`, `Tauth.afid`, or `Tattach.fid`.
    pub fn newfid(&self) -> Option<u32> {
        match *self {
            FCall::Twalk { newfid, .. } => Some(newfid),
            FCall::Tauth { afid, .. } => Some(afid),
            FCall::Tattach { fid, .. } => Some(fid),
            _ => None,
        }
    }
}

/// Envelope for 9P2000 messages: `tag` plus the message body. The outer
/// `size[4]` is handled by the framed transport, not this type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    pub tag: u16,
    pub body: FCall,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qid_type_from_file_type_marks_directories() {
        let dir_meta = std::fs::metadata(".").unwrap();
        let qt = QidType::from(dir_meta.file_type());
        assert!(qt.contains(QidType::DIR));
    }

    #[test]
    fn stat_unchanged_fields_are_all_max_sentinels() {
        let s = Stat::unchanged();
        assert_eq!(s.mode, u32::MAX);
        assert_eq!(s.atime, u32::MAX);
        assert_eq!(s.length, u64::MAX);
        assert_eq!(s.qid.path, u64::MAX);
    }
}
