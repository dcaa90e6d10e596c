//! Asynchronous server side 9P2000 library.
//!
//! # Protocol
//! 9P2000
//!
//! # Concurrency
//! Requests on a single connection are serviced one at a time, in the
//! order they arrive, matching 9P's fid-table semantics (a later
//! request may depend on a fid a prior request just created). Separate
//! connections run fully in parallel, each on its own `tokio::spawn`.

use crate::{
    dial::{Conn, Dial, Listener},
    error::{self, errno::*, string},
    fcall::*,
    serialize,
    utils::Result,
};
use async_trait::async_trait;
use bytes::buf::{Buf, BufMut};
use futures::sink::SinkExt;
use log::{error, info};
use std::{
    collections::HashMap,
    sync::Arc,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, RwLock},
};
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;

/// The largest message size a server will negotiate, absent a smaller
/// client proposal. `Tversion` negotiates the minimum of this and the
/// client's proposed `msize`.
pub const DEFAULT_MSIZE: u32 = 8192;

/// A client fid together with server-defined per-fid state.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FId<T> {
    fid: u32,
    pub aux: T,
}

impl<T> FId<T> {
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

impl<T: Default> FId<T> {
    /// Builds a fid with freshly-defaulted aux state, as the dispatch
    /// loop does for every fid introduced by `Tauth`/`Tattach`/`Twalk`.
    /// Exposed for `Filesystem` implementors' own tests, which need to
    /// construct fids without going through the wire dispatch loop.
    pub fn new(fid: u32) -> FId<T> {
        FId { fid, aux: Default::default() }
    }
}

/// Filesystem server trait for implementing 9P2000 servers.
///
/// Implementors return `Err(error::Error::no(errno, msg))` for failures; the
/// dispatch loop converts that into `Rerror` automatically. Methods
/// default to `EOPNOTSUPP`, except `rversion` and `rflush`, which have
/// protocol-mandated defaults.
#[async_trait]
pub trait Filesystem: Send {
    /// Per-fid state, created with `Default` when a fid is introduced
    /// by `Tauth`/`Tattach`/`Twalk` and dropped on `Tclunk`.
    type FId: Send + Sync + Default;

    /// Start an authentication conversation (`Tauth`). Implementations
    /// that don't require authentication should leave this at its
    /// default, which rejects with `EOPNOTSUPP` so the client knows to
    /// skip straight to `Tattach` with `afid = NOFID`.
    async fn rauth(&self, _afid: &FId<Self::FId>, _uname: &str, _aname: &str) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Attach to the filesystem root, optionally presenting a
    /// previously authenticated `afid`.
    async fn rattach(
        &self,
        _fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Walk from `fid` through `wnames`, populating `newfid` with the
    /// result. A partial walk (fewer qids than names) is not itself an
    /// error at this layer; the dispatch loop only drops `newfid` from
    /// the table when this call itself returns `Err`.
    async fn rwalk(
        &self,
        _fid: &FId<Self::FId>,
        _newfid: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Open the file named by `fid` in the given mode.
    async fn ropen(&self, _fid: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Create `name` inside the directory named by `fid`; afterwards
    /// `fid` refers to the newly created file, open in `mode`.
    async fn rcreate(
        &self,
        _fid: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Read up to `count` bytes from `fid` at `offset`.
    async fn rread(&self, _fid: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Write `data` to `fid` at `offset`.
    async fn rwrite(&self, _fid: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Release a fid. Must always succeed from the client's point of
    /// view: `rclunk` runs even when a prior operation on the fid
    /// failed, and the dispatch loop removes the fid from the table
    /// regardless of what this returns.
    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::Rclunk)
    }

    /// Remove the file named by `fid`, then clunk it.
    async fn rremove(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Fetch the stat record for `fid`.
    async fn rstat(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Apply `stat` to `fid`. Fields set to their don't-touch sentinel
    /// (see `Stat::unchanged`) must be left alone.
    async fn rwstat(&self, _fid: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP))
    }

    /// Negotiate the protocol version and message size. `msize` has
    /// already been capped to the server's configured maximum by the
    /// dispatch loop.
    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        Ok(FCall::Rversion {
            msize,
            version: match ver {
                P92000 => ver.to_owned(),
                _ => VERSION_UNKNOWN.to_owned(),
            },
        })
    }

    /// Acknowledge a flush request. `Tflush` is a pure acknowledgment
    /// here: because requests on a connection are serviced strictly one
    /// at a time, by the time a `Tflush` is read there is never another
    /// request still in flight to cancel.
    async fn rflush(&self, _oldtag: u16) -> Result<FCall> {
        Ok(FCall::Rflush)
    }
}

async fn dispatch_once<Fs, FsFId>(
    msg: &Msg,
    fs: &Fs,
    fsfids: &RwLock<HashMap<u32, FId<FsFId>>>,
    max_msize: u32,
) -> Result<FCall>
where
    Fs: Filesystem<FId = FsFId> + Send + Sync,
    FsFId: Send + Sync + Default,
{
    use FCall::*;

    if let Tversion { msize, ref version } = msg.body {
        fsfids.write().await.clear();
        return fs.rversion(msize.min(max_msize), version).await;
    }

    let newfid = msg.body.newfid().map(|f| FId { fid: f, aux: Default::default() });

    // Built as its own `async` block (not inlined with `?` directly in
    // `dispatch_once`) so a handler error doesn't short-circuit past the
    // Tclunk/Tremove fid-table cleanup below: `Tremove` must drop the fid
    // from the table even when the backend's unlink/rmdir both fail
    // (spec.md §4.4/§8: "always clunks the fid regardless of outcome").
    let result: Result<FCall> = {
        let fids = fsfids.read().await;
        let get_fid = |fid: &u32| fids.get(fid).ok_or_else(|| error::Error::no(EBADF, string::EBADF_FID));
        let get_newfid = || newfid.as_ref().ok_or_else(|| error::Error::no(EPROTO, string::EPROTO));

        async {
            match msg.body {
                Tauth { afid: _, ref uname, ref aname } => fs.rauth(get_newfid()?, uname, aname).await,
                Tattach { fid: _, afid, ref uname, ref aname } => {
                    let auth_fid = if afid == NOFID { None } else { Some(get_fid(&afid)?) };
                    fs.rattach(get_newfid()?, auth_fid, uname, aname).await
                }
                Tflush { oldtag } => fs.rflush(oldtag).await,
                Twalk { fid, newfid: _, ref wnames } => fs.rwalk(get_fid(&fid)?, get_newfid()?, wnames).await,
                Topen { fid, mode } => fs.ropen(get_fid(&fid)?, mode).await,
                Tcreate { fid, ref name, perm, mode } => fs.rcreate(get_fid(&fid)?, name, perm, mode).await,
                Tread { fid, offset, count } => fs.rread(get_fid(&fid)?, offset, count).await,
                Twrite { fid, offset, ref data } => fs.rwrite(get_fid(&fid)?, offset, data).await,
                Tclunk { fid } => fs.rclunk(get_fid(&fid)?).await,
                Tremove { fid } => fs.rremove(get_fid(&fid)?).await,
                Tstat { fid } => fs.rstat(get_fid(&fid)?).await,
                Twstat { fid, ref stat } => fs.rwstat(get_fid(&fid)?, stat).await,
                _ => Err(error::Error::no(EOPNOTSUPP, string::EOPNOTSUPP)),
            }
        }
        .await
    };

    if let Tclunk { fid } | Tremove { fid } = msg.body {
        fsfids.write().await.remove(&fid);
    }

    let response = result?;

    // A partial Twalk (fewer returned qids than requested names) reports
    // success on the wire but must leave newfid unbound (spec.md §4.3/§8):
    // a later operation on it is expected to fail with "unknown fid".
    let should_bind = match (&msg.body, &response) {
        (Twalk { ref wnames, .. }, Rwalk { ref wqids }) => wqids.len() == wnames.len(),
        _ => true,
    };

    if should_bind {
        if let Some(newfid) = newfid {
            fsfids.write().await.insert(newfid.fid, newfid);
        }
    }

    Ok(response)
}

async fn dispatch<Fs, Reader, Writer>(
    filesystem: Fs,
    reader: Reader,
    writer: Writer,
    max_msize: u32,
) -> Result<()>
where
    Fs: Filesystem + Send + Sync,
    Reader: AsyncRead + Send + Unpin,
    Writer: AsyncWrite + Send + Unpin,
{
    let fsfids = RwLock::new(HashMap::new());

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let mut framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);

    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;

        let msg = match serialize::read_msg(&mut bytes.reader()) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("malformed 9P message: {:?}", e);
                return Err(e.into());
            }
        };
        info!("\t← {:?}", msg);

        let response_fcall = dispatch_once(&msg, &filesystem, &fsfids, max_msize)
            .await
            .unwrap_or_else(|e| {
                error!("{:?}: error: {}", msg.body.msg_type(), e);
                FCall::Rerror { ename: e.wire_message() }
            });

        let response = Msg { tag: msg.tag, body: response_fcall };

        let mut buf = bytes::BytesMut::with_capacity(4096).writer();
        if let Err(e) = serialize::write_msg(&mut buf, &response) {
            error!("failed to serialize response for tag {}: {:?}", msg.tag, e);
            continue;
        }

        if let Err(e) = framedwrite.send(buf.into_inner().freeze()).await {
            error!("failed to send response for tag {}: {:?}", msg.tag, e);
            return Err(e.into());
        }
        info!("\t→ {:?}", response);
    }

    Ok(())
}

/// Accept connections on `dial` and service each with `filesystem`,
/// running the dispatch loop of every connection concurrently (one
/// `tokio::spawn` per accepted connection) while requests within a
/// single connection run strictly in sequence.
pub async fn srv_async<Fs>(filesystem: Fs, dial: &Dial) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    srv_async_msize(filesystem, dial, DEFAULT_MSIZE).await
}

pub async fn srv_async_msize<Fs>(filesystem: Fs, dial: &Dial, max_msize: u32) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = dial.listen().await?;

    match listener {
        Listener::Tcp(tcp) => loop {
            let (stream, peer) = tcp.accept().await?;
            info!("accepted: {:?}", peer);
            let fs = filesystem.clone();
            tokio::spawn(async move {
                let (r, w) = stream.into_split();
                if let Err(e) = dispatch(fs, r, w, max_msize).await {
                    error!("connection error: {:?}", e);
                }
            });
        },
        Listener::Unix(unix, path) => {
            info!("listening on unix socket {:?}", path);
            loop {
                let (stream, _) = unix.accept().await?;
                info!("accepted unix connection");
                let fs = filesystem.clone();
                tokio::spawn(async move {
                    let (r, w) = tokio::io::split(stream);
                    if let Err(e) = dispatch(fs, r, w, max_msize).await {
                        error!("connection error: {:?}", e);
                    }
                });
            }
        }
    }
}

/// Service a single already-established connection (as returned by
/// `Dial::connect`'s peer, or any direct accept), without running an
/// accept loop. Useful for tests and for programs that already own the
/// socket.
pub async fn srv_conn<Fs>(filesystem: Fs, conn: Conn, max_msize: u32) -> Result<()>
where
    Fs: Filesystem + Send + Sync,
{
    match conn {
        Conn::Tcp(stream) => {
            let (r, w) = stream.into_split();
            dispatch(filesystem, r, w, max_msize).await
        }
        Conn::Unix(stream) => {
            let (r, w) = tokio::io::split(stream);
            dispatch(filesystem, r, w, max_msize).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct MockFs;

    #[derive(Default)]
    struct MockFId;

    #[async_trait]
    impl Filesystem for MockFs {
        type FId = MockFId;

        async fn rattach(
            &self,
            _fid: &FId<Self::FId>,
            _afid: Option<&FId<Self::FId>>,
            _uname: &str,
            _aname: &str,
        ) -> Result<FCall> {
            Ok(FCall::Rattach { qid: Qid { typ: QidType::DIR, version: 0, path: 0 } })
        }

        async fn rwalk(
            &self,
            _fid: &FId<Self::FId>,
            _newfid: &FId<Self::FId>,
            wnames: &[String],
        ) -> Result<FCall> {
            if wnames.is_empty() {
                return Ok(FCall::Rwalk { wqids: Vec::new() });
            }
            // Only ever resolves the first component, to exercise partial walks.
            Ok(FCall::Rwalk { wqids: vec![Qid { typ: QidType::FILE, version: 0, path: 1 }] })
        }

        async fn rremove(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
            Err(error::Error::no(EIO, string::EIO))
        }
    }

    async fn attach_fid(fs: &MockFs, fsfids: &RwLock<HashMap<u32, FId<MockFId>>>, fid: u32) {
        let msg = Msg { tag: 1, body: FCall::Tattach { fid, afid: NOFID, uname: "me".into(), aname: "".into() } };
        dispatch_once(&msg, fs, fsfids, DEFAULT_MSIZE).await.unwrap();
    }

    #[tokio::test]
    async fn partial_walk_does_not_bind_newfid() {
        let fs = MockFs;
        let fsfids: RwLock<HashMap<u32, FId<MockFId>>> = RwLock::new(HashMap::new());
        attach_fid(&fs, &fsfids, 0).await;

        let msg =
            Msg { tag: 2, body: FCall::Twalk { fid: 0, newfid: 1, wnames: vec!["a".into(), "b".into()] } };
        let response = dispatch_once(&msg, &fs, &fsfids, DEFAULT_MSIZE).await.unwrap();
        match response {
            FCall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
            _ => panic!("expected Rwalk"),
        }
        assert!(!fsfids.read().await.contains_key(&1));
    }

    #[tokio::test]
    async fn full_walk_binds_newfid() {
        let fs = MockFs;
        let fsfids: RwLock<HashMap<u32, FId<MockFId>>> = RwLock::new(HashMap::new());
        attach_fid(&fs, &fsfids, 0).await;

        let msg = Msg { tag: 2, body: FCall::Twalk { fid: 0, newfid: 1, wnames: vec!["a".into()] } };
        dispatch_once(&msg, &fs, &fsfids, DEFAULT_MSIZE).await.unwrap();
        assert!(fsfids.read().await.contains_key(&1));
    }

    #[tokio::test]
    async fn tremove_clunks_fid_even_on_backend_error() {
        let fs = MockFs;
        let fsfids: RwLock<HashMap<u32, FId<MockFId>>> = RwLock::new(HashMap::new());
        attach_fid(&fs, &fsfids, 0).await;
        assert!(fsfids.read().await.contains_key(&0));

        let msg = Msg { tag: 3, body: FCall::Tremove { fid: 0 } };
        let result = dispatch_once(&msg, &fs, &fsfids, DEFAULT_MSIZE).await;
        assert!(result.is_err());
        assert!(!fsfids.read().await.contains_key(&0));
    }
}
