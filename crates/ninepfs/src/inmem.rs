//! The in-memory `/tmp` subtree.
//!
//! Grounded on `original_source/9p/fs.c`'s `temp9p_node_lookup` and
//! spec.md §9's design note: the C source keeps temp nodes in an
//! intrusive pointer tree; this uses an arena (`Vec<Option<Node>>`
//! indexed by a stable `u64` handle) instead, which is the idiomatic
//! Rust shape for a self-referential tree and also gives every node a
//! natural, stable `Qid.path`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ninep::error::{self, errno::*, string};
use ninep::fcall::{DirMode, Qid, QidType};

pub const ROOT_HANDLE: u64 = 0;

#[derive(Clone, Debug)]
pub enum Content {
    Dir(HashMap<String, u64>),
    File(Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub parent: Option<u64>,
    pub content: Content,
    pub version: u32,
    pub mode: u32,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub atime: u32,
    pub mtime: u32,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.content, Content::Dir(_))
    }

    pub fn qid(&self, handle: u64) -> Qid {
        let typ = if self.is_dir() { QidType::DIR } else { QidType::FILE };
        Qid { typ, version: self.version, path: handle }
    }

    pub fn len(&self) -> u64 {
        match &self.content {
            Content::Dir(entries) => entries.len() as u64,
            Content::File(data) => data.len() as u64,
        }
    }
}

fn now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

/// Arena-backed tree. Handles are stable for the node's lifetime; a
/// removed slot becomes `None` and is never reused, so a `Qid.path`
/// never refers to a different file after that file is gone.
#[derive(Clone, Debug)]
pub struct MemTree {
    nodes: Vec<Option<Node>>,
}

impl MemTree {
    pub fn new(uid: &str, gid: &str) -> MemTree {
        let root = Node {
            name: String::new(),
            parent: None,
            content: Content::Dir(HashMap::new()),
            version: 0,
            mode: DirMode::DIR.bits() | 0o755,
            uid: uid.to_owned(),
            gid: gid.to_owned(),
            muid: uid.to_owned(),
            atime: now(),
            mtime: now(),
        };
        MemTree { nodes: vec![Some(root)] }
    }

    pub fn get(&self, handle: u64) -> Result<&Node, error::Error> {
        self.nodes
            .get(handle as usize)
            .and_then(|n| n.as_ref())
            .ok_or_else(|| error::Error::no(ENOENT, string::ENOENT_FILE))
    }

    pub fn get_mut(&mut self, handle: u64) -> Result<&mut Node, error::Error> {
        self.nodes
            .get_mut(handle as usize)
            .and_then(|n| n.as_mut())
            .ok_or_else(|| error::Error::no(ENOENT, string::ENOENT_FILE))
    }

    pub fn lookup(&self, dir: u64, name: &str) -> Result<u64, error::Error> {
        let node = self.get(dir)?;
        match &node.content {
            Content::Dir(entries) => {
                entries.get(name).copied().ok_or_else(|| error::Error::no(ENOENT, string::ENOENT_FILE))
            }
            Content::File(_) => Err(error::Error::no(ENOTDIR, string::ENOTDIR)),
        }
    }

    pub fn children(&self, dir: u64) -> Result<Vec<(String, u64)>, error::Error> {
        match &self.get(dir)?.content {
            Content::Dir(entries) => {
                let mut out: Vec<_> = entries.iter().map(|(n, h)| (n.clone(), *h)).collect();
                out.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(out)
            }
            Content::File(_) => Err(error::Error::no(ENOTDIR, string::ENOTDIR)),
        }
    }

    pub fn create(
        &mut self,
        dir: u64,
        name: &str,
        is_dir: bool,
        mode: u32,
        uid: &str,
        gid: &str,
    ) -> Result<u64, error::Error> {
        {
            let parent = self.get(dir)?;
            if !parent.is_dir() {
                return Err(error::Error::no(ENOTDIR, string::ENOTDIR));
            }
            if let Content::Dir(entries) = &parent.content {
                if entries.contains_key(name) {
                    return Err(error::Error::no(EEXIST, string::EEXIST));
                }
            }
        }
        let content = if is_dir { Content::Dir(HashMap::new()) } else { Content::File(Vec::new()) };
        let mode = if is_dir { mode | DirMode::DIR.bits() } else { mode };
        let node = Node {
            name: name.to_owned(),
            parent: Some(dir),
            content,
            version: 0,
            mode,
            uid: uid.to_owned(),
            gid: gid.to_owned(),
            muid: uid.to_owned(),
            atime: now(),
            mtime: now(),
        };
        let handle = self.nodes.len() as u64;
        self.nodes.push(Some(node));
        if let Content::Dir(entries) = &mut self.get_mut(dir)?.content {
            entries.insert(name.to_owned(), handle);
        }
        Ok(handle)
    }

    pub fn remove(&mut self, handle: u64) -> Result<(), error::Error> {
        if handle == ROOT_HANDLE {
            return Err(error::Error::no(EPERM, string::EPERM));
        }
        let (parent, name, has_children) = {
            let node = self.get(handle)?;
            let has_children = matches!(&node.content, Content::Dir(e) if !e.is_empty());
            (node.parent, node.name.clone(), has_children)
        };
        if has_children {
            return Err(error::Error::no(ENOTEMPTY, string::ENOTEMPTY));
        }
        if let Some(parent) = parent {
            if let Content::Dir(entries) = &mut self.get_mut(parent)?.content {
                entries.remove(&name);
            }
        }
        self.nodes[handle as usize] = None;
        Ok(())
    }

    pub fn read(&self, handle: u64, offset: u64, count: u32) -> Result<Vec<u8>, error::Error> {
        match &self.get(handle)?.content {
            Content::File(data) => {
                let offset = offset as usize;
                if offset >= data.len() {
                    return Ok(Vec::new());
                }
                let end = (offset + count as usize).min(data.len());
                Ok(data[offset..end].to_vec())
            }
            Content::Dir(_) => Err(error::Error::no(EISDIR, string::EISDIR)),
        }
    }

    pub fn write(&mut self, handle: u64, offset: u64, data: &[u8]) -> Result<u32, error::Error> {
        let node = self.get_mut(handle)?;
        match &mut node.content {
            Content::File(buf) => {
                let offset = offset as usize;
                if buf.len() < offset + data.len() {
                    buf.resize(offset + data.len(), 0);
                }
                buf[offset..offset + data.len()].copy_from_slice(data);
                node.version = node.version.wrapping_add(1);
                node.mtime = now();
                Ok(data.len() as u32)
            }
            Content::Dir(_) => Err(error::Error::no(EISDIR, string::EISDIR)),
        }
    }

    pub fn truncate(&mut self, handle: u64, size: u64) -> Result<(), error::Error> {
        let node = self.get_mut(handle)?;
        match &mut node.content {
            Content::File(buf) => {
                buf.resize(size as usize, 0);
                node.version = node.version.wrapping_add(1);
                node.mtime = now();
                Ok(())
            }
            Content::Dir(_) => Err(error::Error::no(EISDIR, string::EISDIR)),
        }
    }

    pub fn rename(&mut self, handle: u64, new_name: &str) -> Result<(), error::Error> {
        let parent = self.get(handle)?.parent;
        if let Some(parent) = parent {
            let old_name = self.get(handle)?.name.clone();
            if let Content::Dir(entries) = &mut self.get_mut(parent)?.content {
                if entries.contains_key(new_name) {
                    return Err(error::Error::no(EEXIST, string::EEXIST));
                }
                entries.remove(&old_name);
                entries.insert(new_name.to_owned(), handle);
            }
        }
        self.get_mut(handle)?.name = new_name.to_owned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_and_remove_roundtrip() {
        let mut tree = MemTree::new("glenda", "glenda");
        let file = tree.create(ROOT_HANDLE, "hello", false, 0o644, "glenda", "glenda").unwrap();
        assert_eq!(tree.lookup(ROOT_HANDLE, "hello").unwrap(), file);
        tree.write(file, 0, b"hi").unwrap();
        assert_eq!(tree.read(file, 0, 10).unwrap(), b"hi");
        tree.remove(file).unwrap();
        assert!(tree.lookup(ROOT_HANDLE, "hello").is_err());
    }

    #[test]
    fn remove_refuses_nonempty_directory() {
        let mut tree = MemTree::new("glenda", "glenda");
        let dir = tree.create(ROOT_HANDLE, "d", true, 0o755, "glenda", "glenda").unwrap();
        tree.create(dir, "child", false, 0o644, "glenda", "glenda").unwrap();
        assert!(tree.remove(dir).is_err());
    }

    #[test]
    fn write_past_end_zero_fills() {
        let mut tree = MemTree::new("glenda", "glenda");
        let file = tree.create(ROOT_HANDLE, "f", false, 0o644, "glenda", "glenda").unwrap();
        tree.write(file, 4, b"x").unwrap();
        assert_eq!(tree.read(file, 0, 5).unwrap(), vec![0, 0, 0, 0, b'x']);
    }
}
