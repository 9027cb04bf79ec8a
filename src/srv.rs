//! Asynchronous server side 9P2000 / 9P2000.u library.
//!
//! # Protocol
//! 9P2000 and its 9P2000.u extension.
//!
//! This module owns the framing and connection lifecycle (components D and
//! E): it splits the byte stream into frames, maintains the per-connection
//! fid table and in-flight tag table, negotiates the dialect on `Tversion`,
//! and implements `Tflush` cancellation. A [`Filesystem`] implementation
//! supplies everything the protocol itself does not know how to do.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use log::{debug, error, info};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, UnixListener},
    sync::{Mutex, RwLock},
    task::AbortHandle,
};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::{
    dialect::{self, Dialect},
    error::{self, errno::*},
    fcall::{FCall, MsgType, NOFID, P92000, Qid},
    io_err, serialize,
    stat::Stat,
    utils::Result,
};

/// The server's default ceiling on `msize`, used until `Tversion`
/// negotiates a (possibly smaller) value for the connection.
pub const DEFAULT_MSIZE: u32 = 8192;

/// Represents a fid of clients holding associated `Filesystem::FId`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Filesystem::FId` associated with this fid.
    ///
    /// Backends that need to mutate state reachable from an existing fid
    /// (for example, a file gaining content after `Tcreate`) should give
    /// `T` interior mutability; the core never replaces this value once a
    /// fid is bound.
    pub aux: T,
}

impl<T> FId<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

/// The filesystem backend a 9P server dispatches to (component G).
///
/// One `async fn` per T-message this crate dispatches, except `Tversion`
/// (which asks only for the backend's supported version string; `msize`
/// negotiation and dialect selection are the core's job) and `Tflush`
/// (handled entirely by the in-flight table, with no backend hook at all).
/// Every method defaults to `EOPNOTSUPP`, so a backend only implements the
/// operations its filesystem actually supports.
#[async_trait]
pub trait Filesystem: Send {
    /// User defined fid type to be associated with a client's fid.
    type FId: Send + Sync + Default;

    /// Report the version string this backend supports, given the
    /// client's requested version. The core takes whichever of this or
    /// `"unknown"` is actually negotiated (see [`dialect::negotiate`]).
    async fn rversion(&self, _client_version: &str) -> Result<String> {
        Ok(P92000.to_owned())
    }

    /// Begin authentication (`Tauth`). Most filesystems require none and
    /// leave this at its default.
    async fn rauth(
        &self,
        _afid: &FId<Self::FId>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<Qid> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Attach to the filesystem root (`Tattach`).
    async fn rattach(
        &self,
        _fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<Qid> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Walk `wnames` from `fid`, binding `newfid` to the result (`Twalk`).
    /// Returns the qids actually reached; an empty `wnames` is an alias
    /// request (bind `newfid` to the same node as `fid`) and should return
    /// an empty vec, which the core treats as a full match.
    async fn rwalk(
        &self,
        _fid: &FId<Self::FId>,
        _newfid: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<Vec<Qid>> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Open a fid for I/O (`Topen`). Returns the qid and a hint for the
    /// largest single read/write the backend prefers.
    async fn ropen(&self, _fid: &FId<Self::FId>, _mode: u8) -> Result<(Qid, u32)> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create `name` below `fid` and open it (`Tcreate`). `extension` is
    /// the empty string outside 9P2000.u.
    async fn rcreate(
        &self,
        _fid: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
        _extension: &str,
    ) -> Result<(Qid, u32)> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read up to `count` bytes from `fid` at `offset` (`Tread`). A
    /// directory fid returns whole stat records concatenated; `count=0` is
    /// a legal reply meaning end of directory.
    async fn rread(&self, _fid: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Write `data` to `fid` at `offset` (`Twrite`). Returns the number of
    /// bytes actually written.
    async fn rwrite(&self, _fid: &FId<Self::FId>, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Forget `fid` without destroying the node (`Tclunk`). The core
    /// removes the fid from its table regardless of the outcome.
    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<()> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Remove the node `fid` refers to, then clunk it (`Tremove`).
    async fn rremove(&self, _fid: &FId<Self::FId>) -> Result<()> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Fetch the current stat of `fid` (`Tstat`).
    async fn rstat(&self, _fid: &FId<Self::FId>) -> Result<Stat> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Apply a sentinel-encoded stat delta to `fid` (`Twstat`). The
    /// backend is responsible for merging against its current stat (see
    /// [`Stat::merge`]) and rejecting a `ModeConflict`.
    async fn rwstat(&self, _fid: &FId<Self::FId>, _delta: &Stat) -> Result<()> {
        Err(error::Error::No(EOPNOTSUPP))
    }
}

/// One decoded frame off the wire: header fields plus an undecoded body.
struct Frame {
    typ: u8,
    tag: u16,
    body: BytesMut,
}

/// Splits a byte stream into 9P frames and reassembles replies into frames
/// (component D): `size(4) | type(1) | tag(2) | body(size-7)`, all
/// little-endian. A declared `size < 7` or `size > msize` is a fatal
/// framing error.
struct FrameCodec {
    msize: u32,
}

impl FrameCodec {
    fn new(msize: u32) -> FrameCodec {
        FrameCodec { msize }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = LittleEndian::read_u32(&src[0..4]);
        if size < 7 {
            return Err(io_err!(InvalidData, "frame smaller than the 7-byte header"));
        }
        if size > self.msize {
            return Err(io_err!(InvalidData, "frame exceeds negotiated msize"));
        }
        if (src.len() as u32) < size {
            return Ok(None);
        }

        let mut frame = src.split_to(size as usize);
        frame.advance(4);
        let typ = frame.get_u8();
        let tag = frame.get_u16_le();
        Ok(Some(Frame { typ, tag, body: frame }))
    }
}

impl Encoder<(u8, u16, Vec<u8>)> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: (u8, u16, Vec<u8>), dst: &mut BytesMut) -> std::io::Result<()> {
        let (typ, tag, body) = item;
        let size = 7usize + body.len();
        dst.reserve(size);
        dst.put_u32_le(size as u32);
        dst.put_u8(typ);
        dst.put_u16_le(tag);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

type SharedWriter<W> = Arc<Mutex<FramedWrite<W, FrameCodec>>>;

async fn send_reply<W>(out: &SharedWriter<W>, tag: u16, body: FCall, dialect: Dialect) -> Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let typ = MsgType::from(&body).code();
    let payload = serialize::encode_body(&body, dialect)?;
    debug!("\t-> tag={} type={:?} ({} bytes)", tag, MsgType::from(&body), payload.len());
    out.lock().await.send((typ, tag, payload)).await?;
    Ok(())
}

async fn send_error<W>(out: &SharedWriter<W>, tag: u16, err: &error::Error, dialect: Dialect)
where
    W: AsyncWrite + Send + Unpin,
{
    let body = FCall::Rerror { ename: err.to_string(), errno: err.errno() as u32 };
    if let Err(e) = send_reply(out, tag, body, dialect).await {
        error!("failed to send Rerror for tag {}: {}", tag, e);
    }
}

/// Run one request to completion: parse arguments out of `body`, invoke the
/// matching backend operation, and update the fid table. `body` must be one
/// of the T-message variants this crate dispatches (`Tversion` and
/// `Tflush` are handled by the caller and never reach this function).
async fn dispatch_once<Fs>(
    body: FCall,
    fs: &Fs,
    fids: &RwLock<HashMap<u32, FId<Fs::FId>>>,
) -> Result<FCall>
where
    Fs: Filesystem + Send + Sync,
{
    use FCall::*;

    let bind_fid = match &body {
        Tauth { afid, .. } => Some(*afid),
        Tattach { fid, .. } => Some(*fid),
        Twalk { newfid, .. } => Some(*newfid),
        _ => None,
    };
    let pending = bind_fid.map(|fid| FId { fid, aux: Default::default() });
    let wname_count = if let Twalk { wnames, .. } = &body { Some(wnames.len()) } else { None };

    let reply = {
        let map = fids.read().await;
        let get = |fid: u32| map.get(&fid).ok_or(error::Error::BadFid);

        match &body {
            Tauth { uname, aname, n_uname, .. } => {
                let newfid = pending.as_ref().unwrap();
                let aqid = fs.rauth(newfid, uname, aname, *n_uname).await?;
                Rauth { aqid }
            }
            Tattach { afid, uname, aname, n_uname, .. } => {
                let newfid = pending.as_ref().unwrap();
                let auth = if *afid == NOFID { None } else { Some(get(*afid)?) };
                let qid = fs.rattach(newfid, auth, uname, aname, *n_uname).await?;
                Rattach { qid }
            }
            Twalk { fid, wnames, .. } => {
                let cur = get(*fid)?;
                let newfid = pending.as_ref().unwrap();
                let wqids = fs.rwalk(cur, newfid, wnames).await?;
                if !wnames.is_empty() && wqids.is_empty() {
                    return Err(error::Error::NoSuchFile);
                }
                Rwalk { wqids }
            }
            Topen { fid, mode } => {
                let cur = get(*fid)?;
                let (qid, iounit) = fs.ropen(cur, *mode).await?;
                Ropen { qid, iounit }
            }
            Tcreate { fid, name, perm, mode, extension } => {
                let cur = get(*fid)?;
                let (qid, iounit) = fs.rcreate(cur, name, *perm, *mode, extension).await?;
                Rcreate { qid, iounit }
            }
            Tread { fid, offset, count } => {
                let cur = get(*fid)?;
                let data = fs.rread(cur, *offset, *count).await?;
                Rread { data }
            }
            Twrite { fid, offset, data } => {
                let cur = get(*fid)?;
                let count = fs.rwrite(cur, *offset, data).await?;
                Rwrite { count }
            }
            Tclunk { fid } => {
                let cur = get(*fid)?;
                fs.rclunk(cur).await?;
                Rclunk
            }
            Tremove { fid } => {
                let cur = get(*fid)?;
                fs.rremove(cur).await?;
                Rremove
            }
            Tstat { fid } => {
                let cur = get(*fid)?;
                let stat = fs.rstat(cur).await?;
                Rstat { stat }
            }
            Twstat { fid, stat } => {
                let cur = get(*fid)?;
                fs.rwstat(cur, stat).await?;
                Rwstat
            }
            _ => return Err(error::Error::Unimplemented),
        }
    };

    match &body {
        Tclunk { fid } | Tremove { fid } => {
            fids.write().await.remove(fid);
        }
        _ => {}
    }

    if let (Some(fid), Some(newfid)) = (bind_fid, pending) {
        let bound = match (&reply, wname_count) {
            (Rwalk { wqids }, Some(n)) => wqids.len() == n,
            _ => true,
        };
        if bound {
            fids.write().await.insert(fid, newfid);
        }
    }

    Ok(reply)
}

/// Drive one connection to completion (components D and E): frame the
/// byte stream, negotiate the dialect on `Tversion`, maintain the in-flight
/// tag table, and dispatch each request to `filesystem`.
pub async fn dispatch<Fs, Reader, Writer>(
    filesystem: Fs,
    reader: Reader,
    writer: Writer,
    max_msize: u32,
) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    Reader: 'static + AsyncRead + Send + Unpin,
    Writer: 'static + AsyncWrite + Send + Unpin,
{
    let fids: Arc<RwLock<HashMap<u32, FId<Fs::FId>>>> = Arc::new(RwLock::new(HashMap::new()));
    let filesystem = Arc::new(filesystem);

    // tag -> (generation, abort handle). The generation guards against a
    // task whose tag slot was reused (after a Tflush) from emitting a
    // reply after the fact; see the dispatch algorithm doc on Tflush.
    let inflight: Arc<Mutex<HashMap<u16, (u64, Option<AbortHandle>)>>> = Arc::new(Mutex::new(HashMap::new()));
    let next_gen = Arc::new(AtomicU64::new(0));

    let mut framedread = FramedRead::new(reader, FrameCodec::new(max_msize));
    let framedwrite: SharedWriter<Writer> = Arc::new(Mutex::new(FramedWrite::new(writer, FrameCodec::new(max_msize))));

    let mut dialect = Dialect::Plain;

    while let Some(frame) = framedread.next().await {
        let frame = frame?;
        let tag = frame.tag;

        let msg_type = match MsgType::from_code(frame.typ) {
            Some(t) => t,
            None => {
                send_error(&framedwrite, tag, &error::Error::Unimplemented, dialect).await;
                continue;
            }
        };
        debug!("\t<- tag={} type={:?} ({} bytes)", tag, msg_type, frame.body.len());

        if msg_type == MsgType::Tflush {
            let oldtag = match serialize::decode_body(MsgType::Tflush, dialect, &frame.body) {
                Ok(FCall::Tflush { oldtag }) => oldtag,
                _ => return Err(error::Error::Protocol("MalformedFrame")),
            };
            if let Some((_, handle)) = inflight.lock().await.remove(&oldtag) {
                if let Some(h) = handle {
                    h.abort();
                }
            }
            send_reply(&framedwrite, tag, FCall::Rflush, dialect).await?;
            continue;
        }

        if msg_type == MsgType::Tversion {
            let (client_msize, client_version) = match serialize::decode_body(MsgType::Tversion, dialect, &frame.body) {
                Ok(FCall::Tversion { msize, version }) => (msize, version),
                _ => return Err(error::Error::Protocol("MalformedFrame")),
            };

            // I4: Tversion abandons every outstanding request on the
            // connection; none of their replies may be sent afterward.
            {
                let mut table = inflight.lock().await;
                for (_, (_, handle)) in table.drain() {
                    if let Some(h) = handle {
                        h.abort();
                    }
                }
            }

            let msize = client_msize.min(max_msize);
            let backend_version = filesystem
                .rversion(&client_version)
                .await
                .unwrap_or_else(|_| P92000.to_owned());
            let (version, negotiated) = dialect::negotiate(&client_version, &backend_version);
            dialect = negotiated;
            framedread.decoder_mut().msize = msize;
            framedwrite.lock().await.encoder_mut().msize = msize;
            info!("version negotiated: {} msize={}", version, msize);

            send_reply(&framedwrite, tag, FCall::Rversion { msize, version }, dialect).await?;
            continue;
        }

        let body = match serialize::decode_body(msg_type, dialect, &frame.body) {
            Ok(body) => body,
            Err(e) if !e.is_fatal() => {
                send_error(&framedwrite, tag, &e, dialect).await;
                continue;
            }
            Err(e) => {
                error!("framing error on tag {}: {}", tag, e);
                return Err(e);
            }
        };

        {
            let table = inflight.lock().await;
            if table.contains_key(&tag) {
                error!("duplicate tag {}", tag);
                return Err(error::Error::Protocol("DuplicateTag"));
            }
        }

        let gen = next_gen.fetch_add(1, Ordering::Relaxed);
        inflight.lock().await.insert(tag, (gen, None));

        let fs = filesystem.clone();
        let fids_for_task = fids.clone();
        let inflight_for_task = inflight.clone();
        let writer_for_task = framedwrite.clone();

        let handle = tokio::spawn(async move {
            let result = dispatch_once(body, &*fs, &fids_for_task).await;

            {
                let mut table = inflight_for_task.lock().await;
                match table.get(&tag) {
                    Some((g, _)) if *g == gen => {
                        table.remove(&tag);
                    }
                    // Superseded by a Tflush (and possibly a tag reuse):
                    // drop the result, emitting nothing.
                    _ => return,
                }
            }

            let reply = result.unwrap_or_else(|e| {
                error!("dispatch error on tag {}: {}", tag, e);
                FCall::Rerror { ename: e.to_string(), errno: e.errno() as u32 }
            });
            if let Err(e) = send_reply(&writer_for_task, tag, reply, dialect).await {
                error!("failed to send reply for tag {}: {}", tag, e);
            }
        });

        if let Some(entry) = inflight.lock().await.get_mut(&tag) {
            if entry.0 == gen {
                entry.1 = Some(handle.abort_handle());
            }
        }
    }

    Ok(())
}

async fn srv_async_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let res = dispatch(fs, readhalf, writehalf, DEFAULT_MSIZE).await;
            if let Err(e) = res {
                error!("connection error: {}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl std::ops::DerefMut for DeleteOnDrop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!("Warning: failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

async fn srv_async_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = DeleteOnDrop::bind(addr)?;

    loop {
        let (stream, _) = listener.accept().await?;
        info!("accepted unix connection");

        let fs = filesystem.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = tokio::io::split(stream);
            let res = dispatch(fs, readhalf, writehalf, DEFAULT_MSIZE).await;
            if let Err(e) = res {
                error!("connection error: {}", e);
            }
        });
    }
}

/// Accept connections on a `proto!addr!port` listen spec (e.g.
/// `"tcp!0.0.0.0!564"` or `"unix!/tmp/n9p.sock!0"`) and dispatch each to
/// `filesystem`. Runs until the listener errors.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let (proto, host, port) = crate::utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "invalid protocol or address"))?;

    match proto {
        "tcp" => srv_async_tcp(filesystem, &format!("{}:{}", host, port)).await,
        "unix" => srv_async_unix(filesystem, host).await,
        _ => Err(io_err!(InvalidInput, "protocol not supported").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_a_full_frame() {
        let mut codec = FrameCodec::new(8192);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(&[100]);
        // Only one of the two tag bytes so far: not a complete frame yet.
        buf.extend_from_slice(&[0]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, 0xAB]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.typ, 100);
        assert_eq!(frame.tag, 0);
        assert_eq!(&frame.body[..], &[0xAB]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_a_frame_below_the_header_size() {
        let mut codec = FrameCodec::new(8192);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&6u32.to_le_bytes());
        buf.extend_from_slice(&[0, 0, 0]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn decode_rejects_a_frame_over_msize() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&17u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 13]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_prepends_the_seven_byte_header() {
        let mut codec = FrameCodec::new(8192);
        let mut buf = BytesMut::new();
        codec.encode((100, 7, vec![1, 2, 3]), &mut buf).unwrap();
        assert_eq!(buf.len(), 10);
        assert_eq!(LittleEndian::read_u32(&buf[0..4]), 10);
        assert_eq!(buf[4], 100);
        assert_eq!(&buf[5..7], &7u16.to_le_bytes());
        assert_eq!(&buf[7..10], &[1, 2, 3]);
    }
}
