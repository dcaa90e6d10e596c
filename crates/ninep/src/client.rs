//! Asynchronous 9P2000 client session.
//!
//! Mirrors `srv.rs`'s use of `LengthDelimitedCodec` from the other end
//! of the wire: a background task drains the framed reader and routes
//! each reply to the caller awaiting its tag, while callers serialize
//! writes through a single mutex (multiple requests may be outstanding
//! at once; only the write side is exclusive).

use crate::{
    dial::Conn,
    error::{self, errno::*},
    fcall::*,
    serialize,
    utils::Result,
};
use bytes::buf::{Buf, BufMut};
use futures::sink::SinkExt;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU16, AtomicU32, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;

/// The fid conventionally used for the attached root.
pub const ROOT_FID: u32 = 0;

type PendingMap = Mutex<HashMap<u16, oneshot::Sender<Msg>>>;

struct Shared<W> {
    writer: Mutex<tokio_util::codec::FramedWrite<W, LengthDelimitedCodec>>,
    pending: PendingMap,
    next_tag: AtomicU16,
    next_fid: AtomicU32,
    msize: AtomicU32,
}

/// A 9P2000 client session over one connection.
///
/// Cloning a `Client` shares the underlying connection; all clones see
/// the same fid/tag allocators.
#[derive(Clone)]
pub struct Client<W> {
    shared: Arc<Shared<W>>,
}

impl<W: AsyncWrite + Send + Unpin + 'static> Client<W> {
    /// Wraps an already-connected reader/writer pair in a client
    /// session. Spawns a background task that drains `reader` and
    /// dispatches replies to outstanding calls; the task exits when the
    /// connection closes.
    pub fn new<R>(reader: R, writer: W) -> Client<W>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: PendingMap = Mutex::new(HashMap::new());
        let framedwrite = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .new_write(writer);

        let shared = Arc::new(Shared {
            writer: Mutex::new(framedwrite),
            pending,
            next_tag: AtomicU16::new(0),
            next_fid: AtomicU32::new(1),
            msize: AtomicU32::new(crate::srv::DEFAULT_MSIZE),
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut framedread = LengthDelimitedCodec::builder()
                .length_field_offset(0)
                .length_field_length(4)
                .length_adjustment(-4)
                .little_endian()
                .new_read(reader);

            while let Some(bytes) = framedread.next().await {
                let bytes = match bytes {
                    Ok(b) => b,
                    Err(_) => break,
                };
                let msg = match serialize::read_msg(&mut bytes.reader()) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                let mut pending = reader_shared.pending.lock().await;
                if let Some(tx) = pending.remove(&msg.tag) {
                    let _ = tx.send(msg);
                }
            }
        });

        Client { shared }
    }

    fn alloc_tag(&self) -> u16 {
        loop {
            let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
            if tag != NOTAG {
                return tag;
            }
        }
    }

    /// Allocates a fresh fid. Never returns `NOFID`.
    pub fn alloc_fid(&self) -> u32 {
        loop {
            let fid = self.shared.next_fid.fetch_add(1, Ordering::Relaxed);
            if fid != NOFID {
                return fid;
            }
        }
    }

    async fn call(&self, tag: u16, body: FCall) -> Result<FCall> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(tag, tx);

        let msg = Msg { tag, body };
        let mut buf = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut buf, &msg)?;

        {
            let mut writer = self.shared.writer.lock().await;
            writer.send(buf.into_inner().freeze()).await?;
        }

        let reply = rx
            .await
            .map_err(|_| error::Error::protocol("connection closed while awaiting reply"))?;

        match reply.body {
            FCall::Rerror { ename } => Err(error::Error::no(EIO, ename)),
            other => Ok(other),
        }
    }

    /// `Tversion`/`Rversion`: negotiate `msize` and the protocol
    /// version. Must be the first call on a fresh connection.
    pub async fn version(&self, msize: u32, version: &str) -> Result<(u32, String)> {
        let reply = self.call(NOTAG, FCall::Tversion { msize, version: version.to_owned() }).await?;
        match reply {
            FCall::Rversion { msize, version } => {
                self.shared.msize.store(msize, Ordering::Relaxed);
                Ok((msize, version))
            }
            _ => Err(error::Error::protocol("unexpected reply to Tversion")),
        }
    }

    /// `Tauth`/`Rauth`: start an auth conversation on a fresh fid.
    pub async fn auth(&self, afid: u32, uname: &str, aname: &str) -> Result<Qid> {
        let reply = self
            .call(self.alloc_tag(), FCall::Tauth { afid, uname: uname.to_owned(), aname: aname.to_owned() })
            .await?;
        match reply {
            FCall::Rauth { aqid } => Ok(aqid),
            _ => Err(error::Error::protocol("unexpected reply to Tauth")),
        }
    }

    /// `Tattach`/`Rattach`: attach `fid` to the filesystem root, using
    /// `afid` if a `Tauth` conversation was completed (pass `NOFID`
    /// otherwise).
    pub async fn attach(&self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<Qid> {
        let reply = self
            .call(
                self.alloc_tag(),
                FCall::Tattach { fid, afid, uname: uname.to_owned(), aname: aname.to_owned() },
            )
            .await?;
        match reply {
            FCall::Rattach { qid } => Ok(qid),
            _ => Err(error::Error::protocol("unexpected reply to Tattach")),
        }
    }

    /// Convenience combining `version` and `attach`: negotiates the
    /// protocol then attaches a freshly allocated fid to the root,
    /// returning that fid and its qid.
    pub async fn mount(&self, uname: &str, aname: &str) -> Result<(u32, Qid)> {
        self.version(crate::srv::DEFAULT_MSIZE, P92000).await?;
        let fid = self.alloc_fid();
        let qid = self.attach(fid, NOFID, uname, aname).await?;
        Ok((fid, qid))
    }

    /// `Twalk`/`Rwalk`: walk `wnames` from `fid` into a freshly
    /// allocated `newfid`. A result shorter than `wnames` means the
    /// walk stopped partway (the usual 9P partial-walk semantics); the
    /// newfid is only valid if the returned vector is the same length
    /// as `wnames`.
    pub async fn walk(&self, fid: u32, wnames: &[String]) -> Result<(u32, Vec<Qid>)> {
        if wnames.len() > MAX_WALK {
            return Err(error::Error::protocol(format!(
                "walk of {} names exceeds MAX_WALK={}",
                wnames.len(),
                MAX_WALK
            )));
        }
        let newfid = self.alloc_fid();
        let reply = self
            .call(
                self.alloc_tag(),
                FCall::Twalk { fid, newfid, wnames: wnames.to_vec() },
            )
            .await?;
        match reply {
            FCall::Rwalk { wqids } => Ok((newfid, wqids)),
            _ => Err(error::Error::protocol("unexpected reply to Twalk")),
        }
    }

    /// `Topen`/`Ropen`.
    pub async fn open(&self, fid: u32, mode: u8) -> Result<(Qid, u32)> {
        let reply = self.call(self.alloc_tag(), FCall::Topen { fid, mode }).await?;
        match reply {
            FCall::Ropen { qid, iounit } => Ok((qid, iounit)),
            _ => Err(error::Error::protocol("unexpected reply to Topen")),
        }
    }

    /// `Tcreate`/`Rcreate`.
    pub async fn create(&self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<(Qid, u32)> {
        let reply = self
            .call(self.alloc_tag(), FCall::Tcreate { fid, name: name.to_owned(), perm, mode })
            .await?;
        match reply {
            FCall::Rcreate { qid, iounit } => Ok((qid, iounit)),
            _ => Err(error::Error::protocol("unexpected reply to Tcreate")),
        }
    }

    /// `Tread`/`Rread`: a single read, not necessarily satisfying the
    /// full `count` (see `pread`).
    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let reply = self.call(self.alloc_tag(), FCall::Tread { fid, offset, count }).await?;
        match reply {
            FCall::Rread { data } => Ok(data.0),
            _ => Err(error::Error::protocol("unexpected reply to Tread")),
        }
    }

    /// `Twrite`/`Rwrite`: a single write, returning the count actually
    /// written (see `pwrite`).
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let reply = self
            .call(self.alloc_tag(), FCall::Twrite { fid, offset, data: Data(data.to_vec()) })
            .await?;
        match reply {
            FCall::Rwrite { count } => Ok(count),
            _ => Err(error::Error::protocol("unexpected reply to Twrite")),
        }
    }

    /// Reads until `count` bytes have been gathered or the server
    /// returns a short read (end of file).
    pub async fn pread(&self, fid: u32, mut offset: u64, count: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count as usize);
        while (out.len() as u32) < count {
            let want = count - out.len() as u32;
            let chunk = self.read(fid, offset, want).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Writes all of `data`, looping over short writes.
    pub async fn pwrite(&self, fid: u32, mut offset: u64, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let n = self.write(fid, offset, &data[written..]).await? as usize;
            if n == 0 {
                return Err(error::Error::no(EIO, "short write with no progress"));
            }
            written += n;
            offset += n as u64;
        }
        Ok(())
    }

    /// `Tclunk`/`Rclunk`.
    pub async fn clunk(&self, fid: u32) -> Result<()> {
        match self.call(self.alloc_tag(), FCall::Tclunk { fid }).await? {
            FCall::Rclunk => Ok(()),
            _ => Err(error::Error::protocol("unexpected reply to Tclunk")),
        }
    }

    /// `Tremove`/`Rremove`. Removes the file and clunks the fid whether
    /// or not the removal succeeds, per spec semantics.
    pub async fn remove(&self, fid: u32) -> Result<()> {
        match self.call(self.alloc_tag(), FCall::Tremove { fid }).await? {
            FCall::Rremove => Ok(()),
            _ => Err(error::Error::protocol("unexpected reply to Tremove")),
        }
    }

    /// `Tstat`/`Rstat`.
    pub async fn stat(&self, fid: u32) -> Result<Stat> {
        match self.call(self.alloc_tag(), FCall::Tstat { fid }).await? {
            FCall::Rstat { stat } => Ok(stat),
            _ => Err(error::Error::protocol("unexpected reply to Tstat")),
        }
    }

    /// `Twstat`/`Rwstat`.
    pub async fn wstat(&self, fid: u32, stat: Stat) -> Result<()> {
        match self.call(self.alloc_tag(), FCall::Twstat { fid, stat }).await? {
            FCall::Rwstat => Ok(()),
            _ => Err(error::Error::protocol("unexpected reply to Twstat")),
        }
    }

    /// `Tflush`/`Rflush`: ask the server to abandon `oldtag`.
    pub async fn flush(&self, oldtag: u16) -> Result<()> {
        match self.call(self.alloc_tag(), FCall::Tflush { oldtag }).await? {
            FCall::Rflush => Ok(()),
            _ => Err(error::Error::protocol("unexpected reply to Tflush")),
        }
    }
}

/// Splits a dialed connection into its async read/write halves and
/// wraps them in a `Client`. The concrete `Client<W>` type varies by
/// transport; callers that need a single type across transports should
/// match on `conn` themselves and keep the resulting `Client` alongside
/// its originating branch.
pub fn client_from_conn(conn: Conn) -> ClientConn {
    match conn {
        Conn::Tcp(stream) => {
            let (r, w) = stream.into_split();
            ClientConn::Tcp(Client::new(r, w))
        }
        Conn::Unix(stream) => {
            let (r, w) = tokio::io::split(stream);
            ClientConn::Unix(Client::new(r, w))
        }
    }
}

/// A transport-erased client, returned by [`client_from_conn`].
pub enum ClientConn {
    Tcp(Client<tokio::net::tcp::OwnedWriteHalf>),
    Unix(Client<tokio::io::WriteHalf<tokio::net::UnixStream>>),
}
