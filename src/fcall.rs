//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000 / 9P2000.u

use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::*;

/// Plain 9P2000 version string.
pub const P92000: &str = "9P2000";

/// 9P2000.u version string.
pub const P92000U: &str = "9P2000.u";

/// The version string `Rversion` carries when the server does not recognize
/// the client's requested version.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which `Tversion`/`Rversion` must use as `tag`.
pub const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`.
pub const NOFID: u32 = !0;

/// Special uid which `Tauth`/`Tattach` under 9P2000.u use as `n_uname` to
/// indicate no numeric uid is specified.
pub const NONUNAME: u32 = !0;

/// Open mode bits, shared by `Topen` and `Tcreate`.
pub mod om {
    /// Open for read.
    pub const READ: u8 = 0;
    /// Open for write.
    pub const WRITE: u8 = 1;
    /// Open for read and write.
    pub const RDWR: u8 = 2;
    /// Open for execute (like read, but checks exec permission).
    pub const EXEC: u8 = 3;
}

bitflags! {
    /// Bits in `Qid.typ` and (shifted left by 24) in `Stat.mode`.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QidType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append-only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive-use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for historic (backward-compatible mount) files"]
        const HISTORIC  = 0x10;
        #[doc = "Type bit for authentication files"]
        const AUTH      = 0x08;
        #[doc = "Type bit for non-backed-up (temporary) files"]
        const TMP       = 0x04;
        #[doc = "Type bit for symbolic links (9P2000.u)"]
        const SYMLINK   = 0x02;
        #[doc = "Type bit for hard links (9P2000.u)"]
        const LINK      = 0x01;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

/// Bits in `Stat.mode`; each is the corresponding [`QidType`] bit shifted
/// left by 24, plus the low permission bits.
pub mod dm {
    pub const DIR: u32 = 0x80000000;
    pub const APPEND: u32 = 0x40000000;
    pub const EXCL: u32 = 0x20000000;
    pub const HISTORIC: u32 = 0x10000000;
    pub const AUTH: u32 = 0x08000000;
    pub const TMP: u32 = 0x04000000;
    pub const READ: u32 = 0x4;
    pub const WRITE: u32 = 0x2;
    pub const EXEC: u32 = 0x1;
}

/// Extra 9P2000.u mode bits for device/socket/pipe/setuid/setgid files.
/// Recognized but never interpreted by the core; the backend decides what
/// they mean.
pub mod u_dm {
    pub const DEVICE: u32 = 1 << 23;
    pub const NAMEDPIPE: u32 = 1 << 21;
    pub const SOCKET: u32 = 1 << 20;
    pub const SETUID: u32 = 1 << 19;
    pub const SETGID: u32 = 1 << 18;
}

/// Server-chosen, stable identity of a filesystem node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qid {
    /// Directory, append-only, exclusive-use, auth, tmp, symlink, link, or plain file.
    pub typ: QidType,
    /// Incremented by the backend whenever the node's content changes.
    pub version: u32,
    /// Unique and stable for the node's lifetime.
    pub path: u64,
}

impl Qid {
    /// Serialized size of a QID: always 13 bytes.
    pub fn size(&self) -> u32 {
        (size_of::<u8>() + size_of::<u32>() + size_of::<u64>()) as u32
    }

    /// Build a QID from a mode's upper (type) byte, a path, and a version.
    ///
    /// Mirrors the reference `mkqid` helper: the QID type is simply
    /// `mode >> 24`.
    pub fn from_mode(mode: u32, path: u64, version: u32) -> Qid {
        Qid {
            typ: QidType::from_bits_truncate((mode >> 24) as u8),
            version,
            path,
        }
    }
}

enum_from_primitive! {
    /// 9P message type. Codes 100-127 are the plain 9P2000 set this crate
    /// dispatches; codes 6-76 are the 9P2000.L set, recognized for their
    /// numeric value (so a well-formed frame carrying one decodes cleanly)
    /// but never routed to a backend operation.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        // 9P2000.L, recognized-but-unhandled (see spec's constant table).
        TlError         = 6,
        RlError,
        TStatFs         = 8,
        RStatFs,
        TlOpen          = 12,
        RlOpen,
        TlCreate        = 14,
        RlCreate,
        TSymlink        = 16,
        RSymlink,
        TMkNod          = 18,
        RMkNod,
        TRename         = 20,
        RRename,
        TReadLink       = 22,
        RReadLink,
        TGetAttr        = 24,
        RGetAttr,
        TSetAttr        = 26,
        RSetAttr,
        TxAttrWalk      = 30,
        RxAttrWalk,
        TxAttrCreate    = 32,
        RxAttrCreate,
        TReadDir        = 40,
        RReadDir,
        TFSync          = 50,
        RFSync,
        TLock           = 52,
        RLock,
        TGetLock        = 54,
        RGetLock,
        TLink           = 70,
        RLink,
        TMkDir          = 72,
        RMkDir,
        TRenameAt       = 74,
        RRenameAt,
        TUnlinkAt       = 76,
        RUnlinkAt,

        // 9P2000 / 9P2000.u, dispatched by this crate.
        Tversion        = 100,
        Rversion,
        Tauth           = 102,
        Rauth,
        Tattach         = 104,
        Rattach,
        // Terror = 106, Rerror = 107: Terror is illegal, never sent.
        Rerror          = 107,
        Tflush          = 108,
        Rflush,
        Twalk           = 110,
        Rwalk,
        Topen           = 112,
        Ropen,
        Tcreate         = 114,
        Rcreate,
        Tread           = 116,
        Rread,
        Twrite          = 118,
        Rwrite,
        Tclunk          = 120,
        Rclunk,
        Tremove         = 122,
        Rremove,
        Tstat           = 124,
        Rstat,
        Twstat          = 126,
        Rwstat,
    }
}

impl MsgType {
    /// True for T-messages (client requests).
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// True for R-messages (server replies).
    pub fn is_r(&self) -> bool {
        use MsgType::*;
        matches!(
            *self,
            RlError
                | RStatFs
                | RlOpen
                | RlCreate
                | RSymlink
                | RMkNod
                | RRename
                | RReadLink
                | RGetAttr
                | RSetAttr
                | RxAttrWalk
                | RxAttrCreate
                | RReadDir
                | RFSync
                | RLock
                | RGetLock
                | RLink
                | RMkDir
                | RRenameAt
                | RUnlinkAt
                | Rversion
                | Rauth
                | Rattach
                | Rerror
                | Rflush
                | Rwalk
                | Ropen
                | Rcreate
                | Rread
                | Rwrite
                | Rclunk
                | Rremove
                | Rstat
                | Rwstat
        )
    }
}

/// A data type encapsulating every 9P2000/9P2000.u message body this crate
/// dispatches. `Tauth`/`Tattach` carry `n_uname` unconditionally; the plain
/// dialect's codec simply never reads it off the wire and leaves it at
/// [`NONUNAME`]. Likewise `Tcreate`'s `extension` is empty outside `.u`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    Tversion {
        msize: u32,
        version: String,
    },
    Rversion {
        msize: u32,
        version: String,
    },
    Tauth {
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    Rauth {
        aqid: Qid,
    },
    Rerror {
        ename: String,
        /// Only meaningful (and only serialized) under 9P2000.u.
        errno: u32,
    },
    Tattach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
        n_uname: u32,
    },
    Rattach {
        qid: Qid,
    },
    Tflush {
        oldtag: u16,
    },
    Rflush,
    Twalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    Rwalk {
        wqids: Vec<Qid>,
    },
    Topen {
        fid: u32,
        mode: u8,
    },
    Ropen {
        qid: Qid,
        iounit: u32,
    },
    Tcreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
        extension: String,
    },
    Rcreate {
        qid: Qid,
        iounit: u32,
    },
    Tread {
        fid: u32,
        offset: u64,
        count: u32,
    },
    Rread {
        data: Vec<u8>,
    },
    Twrite {
        fid: u32,
        offset: u64,
        data: Vec<u8>,
    },
    Rwrite {
        count: u32,
    },
    Tclunk {
        fid: u32,
    },
    Rclunk,
    Tremove {
        fid: u32,
    },
    Rremove,
    Tstat {
        fid: u32,
    },
    Rstat {
        stat: crate::stat::Stat,
    },
    Twstat {
        fid: u32,
        stat: crate::stat::Stat,
    },
    Rwstat,
}

impl FCall {
    /// The FIDs this message mentions, for tracing/logging purposes.
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            FCall::Tattach { fid, .. } => vec![fid],
            FCall::Twalk { fid, newfid, .. } => vec![fid, newfid],
            FCall::Topen { fid, .. } => vec![fid],
            FCall::Tcreate { fid, .. } => vec![fid],
            FCall::Tread { fid, .. } => vec![fid],
            FCall::Twrite { fid, .. } => vec![fid],
            FCall::Tclunk { fid } => vec![fid],
            FCall::Tremove { fid } => vec![fid],
            FCall::Tstat { fid } => vec![fid],
            FCall::Twstat { fid, .. } => vec![fid],
            _ => vec![],
        }
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::Tversion { .. } => MsgType::Tversion,
            FCall::Rversion { .. } => MsgType::Rversion,
            FCall::Tauth { .. } => MsgType::Tauth,
            FCall::Rauth { .. } => MsgType::Rauth,
            FCall::Rerror { .. } => MsgType::Rerror,
            FCall::Tattach { .. } => MsgType::Tattach,
            FCall::Rattach { .. } => MsgType::Rattach,
            FCall::Tflush { .. } => MsgType::Tflush,
            FCall::Rflush => MsgType::Rflush,
            FCall::Twalk { .. } => MsgType::Twalk,
            FCall::Rwalk { .. } => MsgType::Rwalk,
            FCall::Topen { .. } => MsgType::Topen,
            FCall::Ropen { .. } => MsgType::Ropen,
            FCall::Tcreate { .. } => MsgType::Tcreate,
            FCall::Rcreate { .. } => MsgType::Rcreate,
            FCall::Tread { .. } => MsgType::Tread,
            FCall::Rread { .. } => MsgType::Rread,
            FCall::Twrite { .. } => MsgType::Twrite,
            FCall::Rwrite { .. } => MsgType::Rwrite,
            FCall::Tclunk { .. } => MsgType::Tclunk,
            FCall::Rclunk => MsgType::Rclunk,
            FCall::Tremove { .. } => MsgType::Tremove,
            FCall::Rremove => MsgType::Rremove,
            FCall::Tstat { .. } => MsgType::Tstat,
            FCall::Rstat { .. } => MsgType::Rstat,
            FCall::Twstat { .. } => MsgType::Twstat,
            FCall::Rwstat => MsgType::Rwstat,
        }
    }
}

/// A full message: its tag and its typed body. `typ` is derivable from
/// `body` but kept alongside it because a decoded message's `MsgType` may
/// be one of the recognized-but-unhandled 9P2000.L codes that has no
/// corresponding `FCall` variant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    pub tag: u16,
    pub body: FCall,
}
