//! The `ninepfs` filesystem backend: a plain 9P2000
//! [`ninep::srv::Filesystem`] serving a host directory tree, with a
//! `tmp` subtree of the export root backed entirely by [`crate::inmem`]
//! instead of the host disk.
//!
//! Grounded on `rs9p-rs9p/crates/unpfs`'s `Unpfs`/`UnpfsFId` (per-fid
//! `RwLock`-guarded path, `Mutex<Option<fs::File>>` open handle),
//! generalized from 9P2000.L's split getattr/setattr/readdir calls back
//! to plain 9P2000's single stat/wstat/read-as-directory-listing, per
//! spec.md's Non-goals. The dual storage routing and the directory-read
//! pagination algorithm are grounded on `original_source/9p/fs.c`.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;

use async_trait::async_trait;
use filetime::FileTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use ninep::error::{self, errno::*, string};
use ninep::fcall::*;
use ninep::srv::{FId, Filesystem};
use ninep::Result;

use crate::inmem::{MemTree, ROOT_HANDLE};
use crate::path;

const TMP_COMPONENT: &str = "tmp";

#[derive(Clone, Debug)]
enum NodeRef {
    /// Path relative to the export root; `""` is the root itself.
    Host(String),
    Mem(u64),
}

impl Default for NodeRef {
    fn default() -> Self {
        NodeRef::Host(String::new())
    }
}

#[derive(Default)]
pub struct NinepFsFId {
    node: RwLock<NodeRef>,
    open_file: Mutex<Option<fs::File>>,
}

/// `rattach`/`rwalk` generalize `unpfs`'s realpath tracking to also
/// cover the in-memory `tmp` subtree: walking into `tmp` switches a fid
/// from [`NodeRef::Host`] to [`NodeRef::Mem`], and there's no walking
/// back out (`tmp` has no parent pointer in [`MemTree`] visible to 9P
/// clients, matching `fs9p_path_is_safe` rejecting `..`).
#[derive(Clone)]
pub struct NinepFs {
    root: PathBuf,
    readonly: bool,
    mem: RwLock<MemTree>,
}

impl NinepFs {
    pub fn new(root: PathBuf, readonly: bool, uid: &str, gid: &str) -> NinepFs {
        NinepFs { root, readonly, mem: RwLock::new(MemTree::new(uid, gid)) }
    }

    fn readonly_check(&self) -> Result<()> {
        if self.readonly {
            return Err(error::Error::no(EROFS, string::EROFS));
        }
        Ok(())
    }
}

fn uid_name(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string())
}

fn gid_name(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| gid.to_string())
}

fn host_stat(relative: &str, meta: &std::fs::Metadata) -> Stat {
    let mut mode = meta.mode() & 0o777;
    let mut typ = QidType::FILE;
    if meta.is_dir() {
        mode |= DirMode::DIR.bits();
        typ.insert(QidType::DIR);
    }
    let name = relative.rsplit('/').next().unwrap_or(relative).to_owned();
    Stat {
        typ: 0,
        dev: 0,
        qid: Qid { typ, version: meta.mtime() as u32, path: meta.ino() },
        mode,
        atime: meta.atime() as u32,
        mtime: meta.mtime() as u32,
        length: meta.size(),
        name,
        uid: uid_name(meta.uid()),
        gid: gid_name(meta.gid()),
        muid: uid_name(meta.uid()),
    }
}

fn mem_stat(name: &str, node: &crate::inmem::Node, handle: u64) -> Stat {
    Stat {
        typ: 0,
        dev: 0,
        qid: node.qid(handle),
        mode: node.mode,
        atime: node.atime,
        mtime: node.mtime,
        length: node.len(),
        name: name.to_owned(),
        uid: node.uid.clone(),
        gid: node.gid.clone(),
        muid: node.muid.clone(),
    }
}

/// Packs `stats` into at most `count` bytes, skipping any prefix of
/// entries whose cumulative encoded length has already passed `offset`.
/// An entry that would only partially fit is never split; the read
/// simply ends early and the client asks again at the advanced offset.
/// This is `fs9p_readdir`'s rewind-and-walk-forward algorithm: every
/// `Tread` against a directory fid re-walks the whole listing from
/// entry zero, which is quadratic for large directories — an
/// intentionally preserved behavior, not something to optimize away
/// (see DESIGN.md).
fn encode_dir_page(stats: &[Stat], offset: u64, count: u32) -> Vec<u8> {
    let mut position: u64 = 0;
    let mut out = Vec::new();
    for stat in stats {
        let mut encoded = Vec::new();
        if ninep::serialize::Encodable::encode(stat, &mut encoded).is_err() {
            continue;
        }
        let entry_len = encoded.len() as u64;
        if position + entry_len <= offset {
            position += entry_len;
            continue;
        }
        if out.len() as u64 + entry_len > count as u64 {
            break;
        }
        out.extend_from_slice(&encoded);
        position += entry_len;
    }
    out
}

#[async_trait]
impl Filesystem for NinepFs {
    type FId = NinepFsFId;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        *fid.aux.node.write().await = NodeRef::Host(String::new());
        let meta = fs::symlink_metadata(&self.root).await?;
        Ok(FCall::Rattach { qid: host_stat("", &meta).qid })
    }

    async fn rwalk(&self, fid: &FId<Self::FId>, newfid: &FId<Self::FId>, wnames: &[String]) -> Result<FCall> {
        let start = fid.aux.node.read().await.clone();
        let mut wqids = Vec::new();
        let mut current = start;

        for (i, name) in wnames.iter().enumerate() {
            let step = walk_one(&self.root, &self.mem, &current, name).await;
            match step {
                Ok((next, qid)) => {
                    current = next;
                    wqids.push(qid);
                }
                Err(e) => {
                    if i == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        *newfid.aux.node.write().await = current;
        Ok(FCall::Rwalk { wqids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, mode: u8) -> Result<FCall> {
        let node = fid.aux.node.read().await.clone();
        match node {
            NodeRef::Host(relative) => {
                let meta = fs::symlink_metadata(path::host_path(&self.root, &relative)).await?;
                let stat = host_stat(&relative, &meta);
                if !stat.qid.typ.contains(QidType::DIR) {
                    let truncate = mode & om::TRUNC != 0;
                    let want_write = matches!(mode & 0x3, om::WRITE | om::RDWR);
                    let file = fs::OpenOptions::new()
                        .read(true)
                        .write(want_write)
                        .truncate(truncate)
                        .open(path::host_path(&self.root, &relative))
                        .await?;
                    *fid.aux.open_file.lock().await = Some(file);
                }
                Ok(FCall::Ropen { qid: stat.qid, iounit: 0 })
            }
            NodeRef::Mem(handle) => {
                let tree = self.mem.read().await;
                let n = tree.get(handle)?;
                Ok(FCall::Ropen { qid: n.qid(handle), iounit: 0 })
            }
        }
    }

    async fn rcreate(&self, fid: &FId<Self::FId>, name: &str, perm: u32, _mode: u8) -> Result<FCall> {
        self.readonly_check()?;
        path::validate_component(name)?;
        let node = fid.aux.node.read().await.clone();
        let is_dir = DirMode::from_bits_truncate(perm).contains(DirMode::DIR);

        match node {
            NodeRef::Host(relative) => {
                let child = path::join(&relative, name);
                let host_child = path::host_path(&self.root, &child);
                if is_dir {
                    fs::create_dir(&host_child).await?;
                } else {
                    let file = fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create_new(true)
                        .open(&host_child)
                        .await?;
                    fs::set_permissions(&host_child, std::fs::Permissions::from_mode(perm & 0o777)).await?;
                    *fid.aux.open_file.lock().await = Some(file);
                }
                let meta = fs::symlink_metadata(&host_child).await?;
                let stat = host_stat(&child, &meta);
                *fid.aux.node.write().await = NodeRef::Host(child);
                Ok(FCall::Rcreate { qid: stat.qid, iounit: 0 })
            }
            NodeRef::Mem(dir) => {
                let uid = self.mem.read().await.get(dir)?.uid.clone();
                let gid = self.mem.read().await.get(dir)?.gid.clone();
                let mut tree = self.mem.write().await;
                let handle = tree.create(dir, name, is_dir, perm & 0o777, &uid, &gid)?;
                let qid = tree.get(handle)?.qid(handle);
                drop(tree);
                *fid.aux.node.write().await = NodeRef::Mem(handle);
                Ok(FCall::Rcreate { qid, iounit: 0 })
            }
        }
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        let node = fid.aux.node.read().await.clone();
        match node {
            NodeRef::Host(relative) => {
                let host_path = path::host_path(&self.root, &relative);
                let meta = fs::symlink_metadata(&host_path).await?;
                if meta.is_dir() {
                    let mut entries = fs::read_dir(&host_path).await?;
                    let mut stats = Vec::new();
                    while let Some(entry) = entries.next_entry().await? {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        let child = path::join(&relative, &name);
                        let child_meta = entry.metadata().await?;
                        stats.push(host_stat(&child, &child_meta));
                    }
                    return Ok(FCall::Rread { data: Data(encode_dir_page(&stats, offset, count)) });
                }

                let mut guard = fid.aux.open_file.lock().await;
                let file = guard.as_mut().ok_or_else(|| error::Error::no(EBADF, string::EBADF))?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; count as usize];
                let n = file.read(&mut buf).await?;
                buf.truncate(n);
                Ok(FCall::Rread { data: Data(buf) })
            }
            NodeRef::Mem(handle) => {
                let tree = self.mem.read().await;
                let node = tree.get(handle)?;
                if node.is_dir() {
                    let mut stats = Vec::new();
                    for (name, h) in tree.children(handle)? {
                        stats.push(mem_stat(&name, tree.get(h)?, h));
                    }
                    return Ok(FCall::Rread { data: Data(encode_dir_page(&stats, offset, count)) });
                }
                Ok(FCall::Rread { data: Data(tree.read(handle, offset, count)?) })
            }
        }
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, offset: u64, data: &Data) -> Result<FCall> {
        self.readonly_check()?;
        let node = fid.aux.node.read().await.clone();
        match node {
            NodeRef::Host(_) => {
                let mut guard = fid.aux.open_file.lock().await;
                let file = guard.as_mut().ok_or_else(|| error::Error::no(EBADF, string::EBADF))?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let n = file.write(&data.0).await?;
                Ok(FCall::Rwrite { count: n as u32 })
            }
            NodeRef::Mem(handle) => {
                let mut tree = self.mem.write().await;
                Ok(FCall::Rwrite { count: tree.write(handle, offset, &data.0)? })
            }
        }
    }

    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::Rclunk)
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        self.readonly_check()?;
        let node = fid.aux.node.read().await.clone();
        match node {
            NodeRef::Host(relative) => {
                if relative.is_empty() {
                    return Err(error::Error::no(EPERM, string::EPERM));
                }
                let host_child = path::host_path(&self.root, &relative);
                let meta = fs::symlink_metadata(&host_child).await?;
                if meta.is_dir() {
                    fs::remove_dir(&host_child).await?;
                } else {
                    fs::remove_file(&host_child).await?;
                }
            }
            NodeRef::Mem(handle) => {
                self.mem.write().await.remove(handle)?;
            }
        }
        Ok(FCall::Rremove)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let node = fid.aux.node.read().await.clone();
        let stat = match node {
            NodeRef::Host(relative) => {
                let meta = fs::symlink_metadata(path::host_path(&self.root, &relative)).await?;
                host_stat(&relative, &meta)
            }
            NodeRef::Mem(handle) => {
                let tree = self.mem.read().await;
                let node = tree.get(handle)?;
                mem_stat(&node.name, node, handle)
            }
        };
        Ok(FCall::Rstat { stat })
    }

    async fn rwstat(&self, fid: &FId<Self::FId>, stat: &Stat) -> Result<FCall> {
        self.readonly_check()?;
        let node = fid.aux.node.read().await.clone();
        match node {
            NodeRef::Host(relative) => apply_host_wstat(&self.root, &relative, stat).await,
            NodeRef::Mem(handle) => {
                let mut tree = self.mem.write().await;
                if stat.length != Stat::unchanged().length {
                    tree.truncate(handle, stat.length)?;
                }
                if !stat.name.is_empty() {
                    tree.rename(handle, &stat.name)?;
                }
                Ok(())
            }
        }?;
        Ok(FCall::Rwstat)
    }
}

async fn walk_one(
    root: &std::path::Path,
    mem: &RwLock<MemTree>,
    current: &NodeRef,
    name: &str,
) -> Result<(NodeRef, Qid)> {
    match current {
        NodeRef::Host(relative) => {
            if name == TMP_COMPONENT && relative.is_empty() {
                let tree = mem.read().await;
                let root_node = tree.get(ROOT_HANDLE)?;
                return Ok((NodeRef::Mem(ROOT_HANDLE), root_node.qid(ROOT_HANDLE)));
            }
            path::validate_component(name)?;
            let child = path::join(relative, name);
            path::verify_under_root(root, &child).await?;
            let meta = fs::symlink_metadata(path::host_path(root, &child))
                .await
                .map_err(|_| error::Error::no(ENOENT, string::ENOENT_FILE))?;
            Ok((NodeRef::Host(child.clone()), host_stat(&child, &meta).qid))
        }
        NodeRef::Mem(dir) => {
            let tree = mem.read().await;
            let handle = tree.lookup(*dir, name)?;
            let node = tree.get(handle)?;
            Ok((NodeRef::Mem(handle), node.qid(handle)))
        }
    }
}

async fn apply_host_wstat(root: &std::path::Path, relative: &str, stat: &Stat) -> Result<()> {
    let sentinel = Stat::unchanged();
    let host_child = path::host_path(root, relative);

    if stat.mode != sentinel.mode {
        fs::set_permissions(&host_child, std::fs::Permissions::from_mode(stat.mode & 0o777)).await?;
    }

    if stat.length != sentinel.length {
        fs::OpenOptions::new().write(true).open(&host_child).await?.set_len(stat.length).await?;
    }

    if stat.atime != sentinel.atime || stat.mtime != sentinel.mtime {
        let meta = fs::metadata(&host_child).await?;
        let atime = if stat.atime != sentinel.atime {
            FileTime::from_unix_time(stat.atime as i64, 0)
        } else {
            FileTime::from_last_access_time(&meta)
        };
        let mtime = if stat.mtime != sentinel.mtime {
            FileTime::from_unix_time(stat.mtime as i64, 0)
        } else {
            FileTime::from_last_modification_time(&meta)
        };
        let path_for_blocking = host_child.clone();
        let _ = tokio::task::spawn_blocking(move || filetime::set_file_times(path_for_blocking, atime, mtime))
            .await;
    }

    if !stat.name.is_empty() {
        let parent = host_child.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| root.to_path_buf());
        path::validate_component(&stat.name)?;
        fs::rename(&host_child, parent.join(&stat.name)).await?;
    }

    if !stat.uid.is_empty() || !stat.gid.is_empty() {
        let uid = if !stat.uid.is_empty() {
            nix::unistd::User::from_name(&stat.uid)?.map(|u| u.uid)
        } else {
            None
        };
        let gid = if !stat.gid.is_empty() {
            nix::unistd::Group::from_name(&stat.gid)?.map(|g| g.gid)
        } else {
            None
        };
        let path_for_blocking = host_child.clone();
        tokio::task::spawn_blocking(move || nix::unistd::chown(&path_for_blocking, uid, gid))
            .await
            .map_err(|_| error::Error::no(EIO, string::EIO))??;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ninep::fcall::NOFID;

    async fn fixture() -> (tempfile_dir::TempDir, NinepFs) {
        let dir = tempfile_dir::TempDir::new();
        let fs = NinepFs::new(dir.path().to_path_buf(), false, "glenda", "glenda");
        (dir, fs)
    }

    async fn attach(fs: &NinepFs) -> FId<NinepFsFId> {
        let fid = FId::new(0);
        fs.rattach(&fid, None, "glenda", "").await.unwrap();
        fid
    }

    #[tokio::test]
    async fn walk_into_tmp_switches_to_memory_backend() {
        let (_dir, fs) = fixture().await;
        let root_fid = attach(&fs).await;
        let new_fid = FId::new(1);
        let result = fs.rwalk(&root_fid, &new_fid, &["tmp".to_string()]).await.unwrap();
        match result {
            FCall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
            _ => panic!("expected Rwalk"),
        }
        let node = new_fid.aux.node.read().await.clone();
        assert!(matches!(node, NodeRef::Mem(h) if h == ROOT_HANDLE));
        let _ = NOFID;
    }

    #[tokio::test]
    async fn create_read_write_roundtrip_in_tmp() {
        let (_dir, fs) = fixture().await;
        let root_fid = attach(&fs).await;
        let tmp_fid = FId::new(1);
        fs.rwalk(&root_fid, &tmp_fid, &["tmp".to_string()]).await.unwrap();

        let file_fid = FId::new(2);
        *file_fid.aux.node.write().await = tmp_fid.aux.node.read().await.clone();
        fs.rcreate(&file_fid, "hello.txt", 0o644, om::RDWR).await.unwrap();
        fs.rwrite(&file_fid, 0, &Data(b"hi there".to_vec())).await.unwrap();

        let read = fs.rread(&file_fid, 0, 100).await.unwrap();
        match read {
            FCall::Rread { data } => assert_eq!(data.0, b"hi there"),
            _ => panic!("expected Rread"),
        }
    }

    #[tokio::test]
    async fn readonly_backend_rejects_write() {
        let dir = tempfile_dir::TempDir::new();
        let fs = NinepFs::new(dir.path().to_path_buf(), true, "glenda", "glenda");
        let root_fid = attach(&fs).await;
        let tmp_fid = FId::new(1);
        fs.rwalk(&root_fid, &tmp_fid, &["tmp".to_string()]).await.unwrap();
        assert!(fs.rcreate(&tmp_fid, "x", 0o644, om::RDWR).await.is_err());
    }

    mod tempfile_dir {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);
        impl TempDir {
            pub fn new() -> TempDir {
                let path = std::env::temp_dir()
                    .join(format!("ninepfs-backend-test-{}-{}", std::process::id(), rand_suffix()));
                std::fs::create_dir_all(&path).unwrap();
                TempDir(path)
            }
            pub fn path(&self) -> &Path {
                &self.0
            }
        }
        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
        fn rand_suffix() -> u64 {
            use std::sync::atomic::{AtomicU64, Ordering};
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            COUNTER.fetch_add(1, Ordering::Relaxed)
        }
    }
}
