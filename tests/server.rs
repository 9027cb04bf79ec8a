//! End-to-end tests driving `n9p::srv::dispatch` over an in-memory duplex
//! pipe, standing in for a real socket, against a small in-memory
//! filesystem double.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use n9p::dialect::Dialect;
use n9p::error::{self, errno::EROFS};
use n9p::fcall::{FCall, MsgType, NOFID, NONUNAME, Qid, QidType};
use n9p::srv::{FId, Filesystem, dispatch};
use n9p::stat::Stat;
use n9p::utils::Result;

fn root_qid() -> Qid {
    Qid { typ: QidType::DIR, version: 0, path: 0 }
}

fn hello_qid() -> Qid {
    Qid { typ: QidType::FILE, version: 0, path: 1 }
}

fn slow_qid() -> Qid {
    Qid { typ: QidType::FILE, version: 0, path: 2 }
}

fn stat_for(qid: Qid, name: &str, length: u64) -> Stat {
    Stat {
        typ: 0,
        dev: 0,
        qid,
        mode: if qid.typ.contains(QidType::DIR) { 0o755 } else { 0o644 },
        atime: 0,
        mtime: 0,
        length,
        name: name.to_owned(),
        uid: "glenda".into(),
        gid: "glenda".into(),
        muid: "glenda".into(),
        ext: None,
    }
}

/// Node `0` is the root directory, `1` is a plain read/write file, `2`
/// blocks its `Tread` on a `Notify` so tests can exercise `Tflush`.
#[derive(Clone)]
struct MemFs {
    hello: Arc<Mutex<Vec<u8>>>,
    block: Arc<Notify>,
}

impl MemFs {
    fn new() -> MemFs {
        MemFs { hello: Arc::new(Mutex::new(Vec::new())), block: Arc::new(Notify::new()) }
    }
}

#[async_trait]
impl Filesystem for MemFs {
    type FId = Mutex<u64>;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<Qid> {
        *fid.aux.lock().unwrap() = 0;
        Ok(root_qid())
    }

    async fn rwalk(&self, fid: &FId<Self::FId>, newfid: &FId<Self::FId>, wnames: &[String]) -> Result<Vec<Qid>> {
        let cur = *fid.aux.lock().unwrap();
        if wnames.is_empty() {
            *newfid.aux.lock().unwrap() = cur;
            return Ok(vec![]);
        }
        if cur == 0 && wnames.len() == 1 {
            match wnames[0].as_str() {
                "hello" => {
                    *newfid.aux.lock().unwrap() = 1;
                    return Ok(vec![hello_qid()]);
                }
                "slow" => {
                    *newfid.aux.lock().unwrap() = 2;
                    return Ok(vec![slow_qid()]);
                }
                _ => {}
            }
        }
        Ok(vec![])
    }

    async fn ropen(&self, fid: &FId<Self::FId>, _mode: u8) -> Result<(Qid, u32)> {
        match *fid.aux.lock().unwrap() {
            0 => Ok((root_qid(), 0)),
            1 => Ok((hello_qid(), 8192)),
            2 => Ok((slow_qid(), 8192)),
            _ => Err(error::Error::BadFid),
        }
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<Vec<u8>> {
        match *fid.aux.lock().unwrap() {
            0 => {
                if offset != 0 {
                    return Ok(vec![]);
                }
                let bytes = stat_for(hello_qid(), "hello", self.hello.lock().unwrap().len() as u64).to_bytes(true);
                Ok(bytes.into_iter().take(count as usize).collect())
            }
            1 => {
                let buf = self.hello.lock().unwrap();
                let start = (offset as usize).min(buf.len());
                let end = (start + count as usize).min(buf.len());
                Ok(buf[start..end].to_vec())
            }
            2 => {
                self.block.notified().await;
                Ok(vec![])
            }
            _ => Err(error::Error::BadFid),
        }
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, offset: u64, data: &[u8]) -> Result<u32> {
        match *fid.aux.lock().unwrap() {
            1 => {
                let mut buf = self.hello.lock().unwrap();
                let start = offset as usize;
                if buf.len() < start + data.len() {
                    buf.resize(start + data.len(), 0);
                }
                buf[start..start + data.len()].copy_from_slice(data);
                Ok(data.len() as u32)
            }
            _ => Err(error::Error::No(EROFS)),
        }
    }

    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<()> {
        Ok(())
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<Stat> {
        match *fid.aux.lock().unwrap() {
            0 => Ok(stat_for(root_qid(), "/", 0)),
            1 => Ok(stat_for(hello_qid(), "hello", self.hello.lock().unwrap().len() as u64)),
            _ => Err(error::Error::BadFid),
        }
    }
}

fn frame(typ: u8, tag: u16, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + body.len());
    out.extend_from_slice(&(7 + body.len() as u32).to_le_bytes());
    out.push(typ);
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

async fn send(client: &mut DuplexStream, tag: u16, body: &FCall, dialect: Dialect) {
    let typ = MsgType::from(body).code();
    let payload = n9p::serialize::encode_body(body, dialect).unwrap();
    client.write_all(&frame(typ, tag, payload)).await.unwrap();
}

async fn recv(client: &mut DuplexStream, dialect: Dialect) -> (u16, FCall) {
    let mut hdr = [0u8; 4];
    client.read_exact(&mut hdr).await.unwrap();
    let size = u32::from_le_bytes(hdr) as usize;
    let mut rest = vec![0u8; size - 4];
    client.read_exact(&mut rest).await.unwrap();
    let typ = MsgType::from_code(rest[0]).unwrap();
    let tag = u16::from_le_bytes([rest[1], rest[2]]);
    let body = n9p::serialize::decode_body(typ, dialect, &rest[3..]).unwrap();
    (tag, body)
}

async fn try_recv(client: &mut DuplexStream, dialect: Dialect, timeout: Duration) -> Option<(u16, FCall)> {
    tokio::time::timeout(timeout, recv(client, dialect)).await.ok()
}

fn spawn_server(fs: MemFs) -> DuplexStream {
    let _ = env_logger::builder().is_test(true).try_init();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(server);
    tokio::spawn(async move {
        let _ = dispatch(fs, reader, writer, 8192).await;
    });
    client
}

async fn negotiate(client: &mut DuplexStream, client_version: &str) -> FCall {
    send(
        client,
        NOTAG_TEST,
        &FCall::Tversion { msize: 8192, version: client_version.to_owned() },
        Dialect::Plain,
    )
    .await;
    let (tag, reply) = recv(client, Dialect::Plain).await;
    assert_eq!(tag, NOTAG_TEST);
    reply
}

const NOTAG_TEST: u16 = n9p::fcall::NOTAG;

#[tokio::test]
async fn version_downgrades_when_backend_does_not_speak_dot_u() {
    let mut client = spawn_server(MemFs::new());
    let reply = negotiate(&mut client, "9P2000.u").await;
    match reply {
        FCall::Rversion { msize, version } => {
            assert_eq!(version, "9P2000");
            assert_eq!(msize, 8192);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn attach_returns_root_qid() {
    let mut client = spawn_server(MemFs::new());
    negotiate(&mut client, "9P2000").await;

    send(
        &mut client,
        1,
        &FCall::Tattach { fid: 0, afid: NOFID, uname: "glenda".into(), aname: "".into(), n_uname: NONUNAME },
        Dialect::Plain,
    )
    .await;
    let (tag, reply) = recv(&mut client, Dialect::Plain).await;
    assert_eq!(tag, 1);
    match reply {
        FCall::Rattach { qid } => assert_eq!(qid, root_qid()),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn walk_to_nonexistent_name_fails() {
    let mut client = spawn_server(MemFs::new());
    negotiate(&mut client, "9P2000").await;
    send(
        &mut client,
        1,
        &FCall::Tattach { fid: 0, afid: NOFID, uname: "glenda".into(), aname: "".into(), n_uname: NONUNAME },
        Dialect::Plain,
    )
    .await;
    recv(&mut client, Dialect::Plain).await;

    send(
        &mut client,
        2,
        &FCall::Twalk { fid: 0, newfid: 1, wnames: vec!["nope".into()] },
        Dialect::Plain,
    )
    .await;
    let (tag, reply) = recv(&mut client, Dialect::Plain).await;
    assert_eq!(tag, 2);
    match reply {
        FCall::Rerror { ename, .. } => assert_eq!(ename, "No such file!"),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn read_directory_lists_its_entry() {
    let mut client = spawn_server(MemFs::new());
    negotiate(&mut client, "9P2000").await;
    send(
        &mut client,
        1,
        &FCall::Tattach { fid: 0, afid: NOFID, uname: "glenda".into(), aname: "".into(), n_uname: NONUNAME },
        Dialect::Plain,
    )
    .await;
    recv(&mut client, Dialect::Plain).await;

    send(&mut client, 2, &FCall::Topen { fid: 0, mode: n9p::fcall::om::READ }, Dialect::Plain).await;
    recv(&mut client, Dialect::Plain).await;

    send(&mut client, 3, &FCall::Tread { fid: 0, offset: 0, count: 4096 }, Dialect::Plain).await;
    let (_, reply) = recv(&mut client, Dialect::Plain).await;
    match reply {
        FCall::Rread { data } => {
            let stat = Stat::from_bytes(&data[2..], false).unwrap();
            assert_eq!(stat.name, "hello");
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let mut client = spawn_server(MemFs::new());
    negotiate(&mut client, "9P2000").await;
    send(
        &mut client,
        1,
        &FCall::Tattach { fid: 0, afid: NOFID, uname: "glenda".into(), aname: "".into(), n_uname: NONUNAME },
        Dialect::Plain,
    )
    .await;
    recv(&mut client, Dialect::Plain).await;

    send(&mut client, 2, &FCall::Twalk { fid: 0, newfid: 1, wnames: vec!["hello".into()] }, Dialect::Plain).await;
    recv(&mut client, Dialect::Plain).await;

    send(&mut client, 3, &FCall::Topen { fid: 1, mode: n9p::fcall::om::RDWR }, Dialect::Plain).await;
    recv(&mut client, Dialect::Plain).await;

    send(&mut client, 4, &FCall::Twrite { fid: 1, offset: 0, data: b"hi there".to_vec() }, Dialect::Plain).await;
    let (_, reply) = recv(&mut client, Dialect::Plain).await;
    assert_eq!(reply, FCall::Rwrite { count: 8 });

    send(&mut client, 5, &FCall::Tread { fid: 1, offset: 0, count: 8 }, Dialect::Plain).await;
    let (_, reply) = recv(&mut client, Dialect::Plain).await;
    assert_eq!(reply, FCall::Rread { data: b"hi there".to_vec() });
}

#[tokio::test]
async fn flush_drops_the_cancelled_reply_but_leaves_the_connection_usable() {
    let fs = MemFs::new();
    let block = fs.block.clone();
    let mut client = spawn_server(fs);
    negotiate(&mut client, "9P2000").await;
    send(
        &mut client,
        1,
        &FCall::Tattach { fid: 0, afid: NOFID, uname: "glenda".into(), aname: "".into(), n_uname: NONUNAME },
        Dialect::Plain,
    )
    .await;
    recv(&mut client, Dialect::Plain).await;

    send(&mut client, 2, &FCall::Twalk { fid: 0, newfid: 1, wnames: vec!["slow".into()] }, Dialect::Plain).await;
    recv(&mut client, Dialect::Plain).await;

    send(&mut client, 3, &FCall::Topen { fid: 1, mode: n9p::fcall::om::READ }, Dialect::Plain).await;
    recv(&mut client, Dialect::Plain).await;

    // This Tread blocks on `block` until notified; flush it before that happens.
    send(&mut client, 5, &FCall::Tread { fid: 1, offset: 0, count: 8 }, Dialect::Plain).await;
    send(&mut client, 6, &FCall::Tflush { oldtag: 5 }, Dialect::Plain).await;

    let (tag, reply) = recv(&mut client, Dialect::Plain).await;
    assert_eq!(tag, 6);
    assert_eq!(reply, FCall::Rflush);

    // Unblock the aborted (or, at worst, still-running) task and confirm its
    // reply never arrives.
    block.notify_waiters();
    let stray = try_recv(&mut client, Dialect::Plain, Duration::from_millis(200)).await;
    assert!(stray.is_none(), "flushed request must not produce a reply: {:?}", stray);

    // The connection itself must still be healthy afterward.
    send(&mut client, 7, &FCall::Tstat { fid: 0 }, Dialect::Plain).await;
    let (tag, reply) = recv(&mut client, Dialect::Plain).await;
    assert_eq!(tag, 7);
    assert!(matches!(reply, FCall::Rstat { .. }));
}
