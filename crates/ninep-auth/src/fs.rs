//! The auth coprocessor's own 9P file surface (spec.md §4.7): `/ctl`,
//! `/rpc`, `/log`, `/key`, all direct children of the root directory.
//!
//! Grounded on `original_source/auth/fs.c`'s dispatch-by-file-identity
//! shape: a fid is tagged with which file it names at walk time, and
//! every subsequent `Tread`/`Twrite` dispatches on that tag. The four
//! files plus the root directory are the entire namespace; there is no
//! further nesting.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use ninep::error::{self, errno::*, string};
use ninep::fcall::*;
use ninep::srv::{FId, Filesystem};
use ninep::Result;

use crate::core::{AuthError, AuthProto, Conv, Key};
use crate::rpc::{self, Command, Engine};

const QID_ROOT: u64 = 0;
const QID_CTL: u64 = 1;
const QID_RPC: u64 = 2;
const QID_LOG: u64 = 3;
const QID_KEY: u64 = 4;

/// Which of the four files (or the root directory) a fid currently
/// names. `original_source/auth/fs.h`'s `Auth_File_Type` enum has no
/// `Key` variant even though `fs.c`'s directory listing and spec.md
/// §4.7 both require a `/key` file; `Key` here is a spec-driven
/// addition, not a teacher-derived one (see DESIGN.md).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileTag {
    Root,
    Ctl,
    Rpc,
    Log,
    Key,
}

impl Default for FileTag {
    fn default() -> Self {
        FileTag::Root
    }
}

impl FileTag {
    fn named(name: &str) -> Option<FileTag> {
        match name {
            "ctl" => Some(FileTag::Ctl),
            "rpc" => Some(FileTag::Rpc),
            "log" => Some(FileTag::Log),
            "key" => Some(FileTag::Key),
            _ => None,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            FileTag::Root => "/",
            FileTag::Ctl => "ctl",
            FileTag::Rpc => "rpc",
            FileTag::Log => "log",
            FileTag::Key => "key",
        }
    }

    fn qid_path(self) -> u64 {
        match self {
            FileTag::Root => QID_ROOT,
            FileTag::Ctl => QID_CTL,
            FileTag::Rpc => QID_RPC,
            FileTag::Log => QID_LOG,
            FileTag::Key => QID_KEY,
        }
    }

    fn qid(self) -> Qid {
        let typ = if self == FileTag::Root { QidType::DIR } else { QidType::FILE };
        Qid { typ, version: 0, path: self.qid_path() }
    }

    fn mode(self) -> u32 {
        match self {
            FileTag::Root => DirMode::DIR.bits() | 0o555,
            FileTag::Ctl => 0o222,
            FileTag::Rpc => 0o666,
            FileTag::Log => 0o444,
            FileTag::Key => 0o444,
        }
    }
}

/// Per-fid state: which file the fid names, plus (for `/rpc` fids
/// only) the conversation it owns. `fs.h`'s "closing the fid destroys
/// the conv" is just this struct being dropped on `Tclunk`, per
/// [`Conv`]'s own doc comment.
#[derive(Default)]
pub struct AuthFId {
    tag: RwLock<FileTag>,
    conv: Mutex<Option<Conv>>,
}

#[derive(Clone)]
pub struct AuthFs {
    engine: Arc<Engine>,
    uid: String,
    gid: String,
}

impl AuthFs {
    pub fn new(engine: Arc<Engine>, uid: &str, gid: &str) -> AuthFs {
        AuthFs { engine, uid: uid.to_owned(), gid: gid.to_owned() }
    }

    fn stat_for(&self, tag: FileTag) -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: tag.qid(),
            mode: tag.mode(),
            atime: 0,
            mtime: 0,
            length: 0,
            name: tag.file_name().to_owned(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            muid: self.uid.clone(),
        }
    }
}

/// Slices `content` the same skip-then-pack way `ninepfs`'s directory
/// pagination does, generalized here to a plain byte buffer: any
/// `Tread` can arrive at an arbitrary offset and must return at most
/// `count` bytes starting there.
fn read_slice(content: &[u8], offset: u64, count: u32) -> Vec<u8> {
    let offset = offset as usize;
    if offset >= content.len() {
        return Vec::new();
    }
    let end = (offset + count as usize).min(content.len());
    content[offset..end].to_vec()
}

/// Packs the four file entries' stats into a directory listing the
/// same way `ninepfs::backend::encode_dir_page` does, reimplemented
/// here rather than shared since the two crates have no common
/// dependency on each other.
fn encode_root_listing(stats: &[Stat], offset: u64, count: u32) -> Vec<u8> {
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
impl Filesystem for AuthFs {
    type FId = AuthFId;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        *fid.aux.tag.write().await = FileTag::Root;
        Ok(FCall::Rattach { qid: FileTag::Root.qid() })
    }

    async fn rwalk(&self, fid: &FId<Self::FId>, newfid: &FId<Self::FId>, wnames: &[String]) -> Result<FCall> {
        let start = *fid.aux.tag.read().await;
        let mut current = start;
        let mut wqids = Vec::new();

        for (i, name) in wnames.iter().enumerate() {
            if current != FileTag::Root {
                if i == 0 {
                    return Err(error::Error::no(ENOTDIR, string::ENOTDIR));
                }
                break;
            }
            match FileTag::named(name) {
                Some(tag) => {
                    current = tag;
                    wqids.push(tag.qid());
                }
                None => {
                    if i == 0 {
                        return Err(error::Error::no(ENOENT, string::ENOENT_FILE));
                    }
                    break;
                }
            }
        }

        *newfid.aux.tag.write().await = current;
        Ok(FCall::Rwalk { wqids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        let tag = *fid.aux.tag.read().await;
        Ok(FCall::Ropen { qid: tag.qid(), iounit: 0 })
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        let tag = *fid.aux.tag.read().await;
        let data = match tag {
            FileTag::Root => {
                let stats: Vec<Stat> = [FileTag::Ctl, FileTag::Rpc, FileTag::Log, FileTag::Key]
                    .into_iter()
                    .map(|t| self.stat_for(t))
                    .collect();
                encode_root_listing(&stats, offset, count)
            }
            FileTag::Ctl => return Err(error::Error::no(EPERM, string::EPERM)),
            FileTag::Log => read_slice(&self.engine.log_snapshot().await, offset, count),
            FileTag::Key => read_slice(&self.engine.key_snapshot().await, offset, count),
            FileTag::Rpc => {
                let mut conv = fid.aux.conv.lock().await;
                let response = self.engine.execute(&mut conv, Command::Read).await;
                if !response.success {
                    return Err(error::Error::no(EIO, response.error.unwrap_or_default()));
                }
                read_slice(&response.data, offset, count)
            }
        };
        Ok(FCall::Rread { data: Data(data) })
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, _offset: u64, data: &Data) -> Result<FCall> {
        let tag = *fid.aux.tag.read().await;
        match tag {
            FileTag::Ctl => {
                self.handle_ctl(&data.0).await?;
                Ok(FCall::Rwrite { count: data.0.len() as u32 })
            }
            FileTag::Rpc => {
                let mut conv = fid.aux.conv.lock().await;
                let command = rpc::parse(&data.0);
                let response = self.engine.execute(&mut conv, command).await;
                if !response.success {
                    return Err(error::Error::no(EIO, response.error.unwrap_or_default()));
                }
                Ok(FCall::Rwrite { count: data.0.len() as u32 })
            }
            FileTag::Log | FileTag::Key | FileTag::Root => Err(error::Error::no(EPERM, string::EPERM)),
        }
    }

    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::Rclunk)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let tag = *fid.aux.tag.read().await;
        Ok(FCall::Rstat { stat: self.stat_for(tag) })
    }
}

impl AuthFs {
    /// Dispatches a `/ctl` command line, per spec.md §6's "Auth control
    /// commands": `register`, `remove`, `save`.
    async fn handle_ctl(&self, raw: &[u8]) -> std::result::Result<(), error::Error> {
        let text = std::str::from_utf8(raw).map_err(|_| error::Error::no(EINVAL, string::EINVAL))?;
        let line = text.trim();
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or("");

        let result = match verb {
            "register" => self.ctl_register(tokens).await,
            "remove" => self.ctl_remove(tokens).await,
            "save" => match self.engine.persist_keyring().await {
                Ok(()) => {
                    self.engine.log("save".to_owned()).await;
                    Ok(())
                }
                Err(e) => Err(AuthError::rejected(e.to_string())),
            },
            _ => Err(AuthError::rejected(format!("auth: unknown ctl command {verb:?}"))),
        };

        result.map_err(|e| error::Error::no(EINVAL, e.to_string()))
    }

    async fn ctl_register<'a>(
        &self,
        tokens: impl Iterator<Item = &'a str>,
    ) -> std::result::Result<(), AuthError> {
        let mut user = String::new();
        let mut auth_id = String::new();
        let mut proto_name = String::new();
        let mut credential_id_hex = String::new();
        let mut pubkey_hex = String::new();

        for token in tokens {
            let Some((key, value)) = token.split_once('=') else { continue };
            match key {
                "user" => user = value.to_owned(),
                "auth-id" => auth_id = value.to_owned(),
                "proto" => proto_name = value.to_owned(),
                "credential-id" => credential_id_hex = value.to_owned(),
                "pubkey" => pubkey_hex = value.to_owned(),
                _ => {}
            }
        }

        let proto = AuthProto::from_name(&proto_name)
            .ok_or_else(|| AuthError::rejected("auth: unsupported protocol"))?;
        let credential_id = hex::decode(&credential_id_hex).unwrap_or_default();
        let public_key =
            hex::decode(&pubkey_hex).map_err(|_| AuthError::rejected("auth: malformed pubkey hex"))?;

        let log_line = format!("register user={user} auth-id={auth_id} proto={proto_name}");
        let key = Key { proto, user, auth_id, credential_id, public_key, private_key: None };
        self.engine.keyring().await.add(key)?;
        self.engine.log(log_line).await;
        Ok(())
    }

    /// `/ctl`'s `remove` verb carries no `proto=` field (spec.md §6),
    /// but [`crate::core::KeyRing::remove`] takes one explicitly (see
    /// its own doc comment on why). Resolved by looking the key up
    /// first to discover its protocol; if more than one protocol is
    /// registered under the same `(user, auth_id)` the first match
    /// wins, same as an unqualified [`crate::core::KeyRing::lookup`]
    /// (see DESIGN.md).
    async fn ctl_remove<'a>(&self, tokens: impl Iterator<Item = &'a str>) -> std::result::Result<(), AuthError> {
        let mut user = String::new();
        let mut auth_id = String::new();
        let mut proto_name: Option<String> = None;

        for token in tokens {
            let Some((key, value)) = token.split_once('=') else { continue };
            match key {
                "user" => user = value.to_owned(),
                "auth-id" => auth_id = value.to_owned(),
                "proto" => proto_name = Some(value.to_owned()),
                _ => {}
            }
        }

        let mut ring = self.engine.keyring().await;
        let proto = match proto_name {
            Some(name) => {
                AuthProto::from_name(&name).ok_or_else(|| AuthError::rejected("auth: unsupported protocol"))?
            }
            None => ring
                .lookup(&user, &auth_id, None)
                .map(|k| k.proto)
                .ok_or_else(|| AuthError::rejected("auth: no credential found"))?,
        };

        if !ring.remove(&user, &auth_id, proto) {
            return Err(AuthError::rejected("auth: no credential found"));
        }
        drop(ring);
        self.engine.log(format!("remove user={user} auth-id={auth_id} proto={}", proto.as_name())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KeyRing;
    use crate::crypto::fido2::MockFido2;

    fn fs() -> AuthFs {
        let engine = Arc::new(Engine::new(KeyRing::new(), None, Arc::new(MockFido2)));
        AuthFs::new(engine, "auth", "auth")
    }

    async fn attach(fs: &AuthFs) -> FId<AuthFId> {
        let fid = FId::new(0);
        fs.rattach(&fid, None, "auth", "").await.unwrap();
        fid
    }

    #[tokio::test]
    async fn walk_to_each_file_resolves_the_right_tag() {
        let auth_fs = fs();
        let root = attach(&auth_fs).await;
        for (name, expected) in [("ctl", FileTag::Ctl), ("rpc", FileTag::Rpc), ("log", FileTag::Log), ("key", FileTag::Key)]
        {
            let target = FId::new(1);
            let result = auth_fs.rwalk(&root, &target, &[name.to_string()]).await.unwrap();
            match result {
                FCall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
                _ => panic!("expected Rwalk"),
            }
            assert_eq!(*target.aux.tag.read().await, expected);
        }
    }

    #[tokio::test]
    async fn walk_to_unknown_name_is_rejected() {
        let auth_fs = fs();
        let root = attach(&auth_fs).await;
        let target = FId::new(1);
        assert!(auth_fs.rwalk(&root, &target, &["nope".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn register_then_key_listing_shows_the_new_entry() {
        let auth_fs = fs();
        let root = attach(&auth_fs).await;
        let ctl = FId::new(1);
        auth_fs.rwalk(&root, &ctl, &["ctl".to_string()]).await.unwrap();

        let mut cmd = b"register user=alice auth-id=laptop proto=ed25519 pubkey=".to_vec();
        cmd.extend_from_slice(hex::encode([7u8; 32]).as_bytes());
        auth_fs.rwrite(&ctl, 0, &Data(cmd)).await.unwrap();

        let key = FId::new(2);
        auth_fs.rwalk(&root, &key, &["key".to_string()]).await.unwrap();
        let read = auth_fs.rread(&key, 0, 4096).await.unwrap();
        match read {
            FCall::Rread { data } => {
                let text = String::from_utf8(data.0).unwrap();
                assert!(text.contains("alice laptop"));
            }
            _ => panic!("expected Rread"),
        }
    }

    #[tokio::test]
    async fn ctl_is_write_only() {
        let auth_fs = fs();
        let root = attach(&auth_fs).await;
        let ctl = FId::new(1);
        auth_fs.rwalk(&root, &ctl, &["ctl".to_string()]).await.unwrap();
        assert!(auth_fs.rread(&ctl, 0, 16).await.is_err());
    }

    #[tokio::test]
    async fn rpc_round_trips_a_server_start_and_read() {
        let auth_fs = fs();
        let root = attach(&auth_fs).await;
        let ctl = FId::new(1);
        auth_fs.rwalk(&root, &ctl, &["ctl".to_string()]).await.unwrap();
        let mut cmd = b"register user=alice auth-id=laptop proto=ed25519 pubkey=".to_vec();
        cmd.extend_from_slice(hex::encode([9u8; 32]).as_bytes());
        auth_fs.rwrite(&ctl, 0, &Data(cmd)).await.unwrap();

        let rpc_fid = FId::new(2);
        auth_fs.rwalk(&root, &rpc_fid, &["rpc".to_string()]).await.unwrap();
        let start = b"start user=alice auth-id=laptop proto=ed25519 role=server".to_vec();
        auth_fs.rwrite(&rpc_fid, 0, &Data(start)).await.unwrap();

        let read = auth_fs.rread(&rpc_fid, 0, 64).await.unwrap();
        match read {
            FCall::Rread { data } => assert_eq!(data.0.len(), 36),
            _ => panic!("expected Rread"),
        }
    }
}
