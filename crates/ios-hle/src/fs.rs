//! The NAND filesystem handle shared by `/dev/fs` and the kernel.
//!
//! The handle outlives kernel instances: reloading into another IOS keeps the same NAND.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::rc::Rc;

use ios_snapshot::{expect_marker, write_marker, ReadLeExt, SnapshotError, WriteLeExt};
use thiserror::Error;

use crate::ipc::{
    FS_EACCESS, FS_EDIRDEPTH, FS_EEXIST, FS_EFBIG, FS_EINVAL, FS_ENAMELEN, FS_ENOENT,
};

pub type SharedFileSystem = Rc<RefCell<dyn FileSystem>>;

/// Longest path the filesystem accepts, excluding the terminator.
pub const MAX_PATH_LEN: usize = 63;
pub const MAX_PATH_DEPTH: usize = 8;
pub const CLUSTER_SIZE: u32 = 0x4000;
pub const TOTAL_CLUSTERS: u32 = 0x6E00;
pub const TOTAL_INODES: u32 = 0x17FF;
/// Largest single file.
pub const MAX_FILE_SIZE: usize = 0x0400_0000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("invalid path {0:?}")]
    InvalidPath(String),
    #[error("path too long")]
    NameTooLong,
    #[error("path too deep")]
    TooDeep,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("access denied to {0}")]
    AccessDenied(String),
    #[error("file too large")]
    FileTooBig,
}

impl FsError {
    /// Reply code the guest sees for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidPath(_) => FS_EINVAL,
            Self::NameTooLong => FS_ENAMELEN,
            Self::TooDeep => FS_EDIRDEPTH,
            Self::NotFound(_) => FS_ENOENT,
            Self::AlreadyExists(_) => FS_EEXIST,
            Self::AccessDenied(_) => FS_EACCESS,
            Self::FileTooBig => FS_EFBIG,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Usage counters reported by `/dev/fs` `GetStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandStats {
    pub cluster_size: u32,
    pub free_clusters: u32,
    pub used_clusters: u32,
    pub bad_clusters: u32,
    pub reserved_clusters: u32,
    pub free_inodes: u32,
    pub used_inodes: u32,
}

impl NandStats {
    pub const ENCODED_LEN: usize = 28;

    /// Guest layout: seven big-endian words.
    pub fn to_be_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let words = [
            self.cluster_size,
            self.free_clusters,
            self.used_clusters,
            self.bad_clusters,
            self.reserved_clusters,
            self.free_inodes,
            self.used_inodes,
        ];
        let mut out = [0u8; Self::ENCODED_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    pub owner: Owner,
    pub size: u32,
}

pub trait FileSystem {
    fn create_file(&mut self, path: &str, owner: Owner) -> FsResult<()>;
    fn create_directory(&mut self, path: &str, owner: Owner) -> FsResult<()>;
    /// Delete a file or a directory and everything below it.
    fn delete(&mut self, path: &str) -> FsResult<()>;
    /// Move `from` to `to`, replacing a file already at `to`.
    fn rename(&mut self, from: &str, to: &str) -> FsResult<()>;
    fn metadata(&self, path: &str) -> FsResult<Metadata>;
    /// Read from a file at `offset`, returning the number of bytes copied.
    fn read_at(&self, path: &str, offset: u32, buf: &mut [u8]) -> FsResult<usize>;
    /// Write to a file at `offset`, growing it as needed.
    fn write_at(&mut self, path: &str, offset: u32, data: &[u8]) -> FsResult<usize>;
    fn stats(&self) -> NandStats;

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()>;
    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    owner: Owner,
    data: Option<Vec<u8>>,
}

impl Node {
    fn kind(&self) -> NodeKind {
        if self.data.is_some() {
            NodeKind::File
        } else {
            NodeKind::Directory
        }
    }
}

/// An in-memory NAND with the standard top-level directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryNand {
    nodes: BTreeMap<String, Node>,
}

const ROOT_OWNER: Owner = Owner { uid: 0, gid: 0 };
const DEFAULT_DIRECTORIES: &[&str] = &[
    "/import", "/meta", "/shared1", "/shared2", "/sys", "/ticket", "/title", "/tmp",
];

impl Default for MemoryNand {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNand {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        for dir in DEFAULT_DIRECTORIES {
            nodes.insert(
                dir.to_string(),
                Node {
                    owner: ROOT_OWNER,
                    data: None,
                },
            );
        }
        Self { nodes }
    }

    pub fn into_shared(self) -> SharedFileSystem {
        Rc::new(RefCell::new(self))
    }

    fn node(&self, path: &str) -> FsResult<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    fn file_mut(&mut self, path: &str) -> FsResult<&mut Vec<u8>> {
        match self.nodes.get_mut(path) {
            Some(Node { data: Some(data), .. }) => Ok(data),
            Some(_) => Err(FsError::AccessDenied(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    fn check_parent(&self, path: &str) -> FsResult<()> {
        let parent = parent_of(path);
        if parent == "/" {
            return Ok(());
        }
        match self.node(parent)?.kind() {
            NodeKind::Directory => Ok(()),
            NodeKind::File => Err(FsError::NotFound(parent.to_string())),
        }
    }

    fn create(&mut self, path: &str, owner: Owner, data: Option<Vec<u8>>) -> FsResult<()> {
        validate_path(path)?;
        if path == "/" || self.nodes.contains_key(path) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        self.check_parent(path)?;
        self.nodes.insert(path.to_string(), Node { owner, data });
        Ok(())
    }

    fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl FileSystem for MemoryNand {
    fn create_file(&mut self, path: &str, owner: Owner) -> FsResult<()> {
        self.create(path, owner, Some(Vec::new()))
    }

    fn create_directory(&mut self, path: &str, owner: Owner) -> FsResult<()> {
        self.create(path, owner, None)
    }

    fn delete(&mut self, path: &str) -> FsResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(FsError::AccessDenied(path.to_string()));
        }
        self.node(path)?;
        for child in self.descendants(path) {
            self.nodes.remove(&child);
        }
        self.nodes.remove(path);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> FsResult<()> {
        validate_path(from)?;
        validate_path(to)?;
        if from == "/" || to == "/" || to.starts_with(&format!("{from}/")) {
            return Err(FsError::AccessDenied(to.to_string()));
        }
        let kind = self.node(from)?.kind();
        self.check_parent(to)?;
        if from == to {
            return Ok(());
        }
        match self.nodes.get(to).map(Node::kind) {
            Some(existing) if existing != kind => {
                return Err(FsError::AlreadyExists(to.to_string()))
            }
            Some(_) => self.delete(to)?,
            None => {}
        }

        let moved: Vec<String> = std::iter::once(from.to_string())
            .chain(self.descendants(from))
            .collect();
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                self.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn metadata(&self, path: &str) -> FsResult<Metadata> {
        validate_path(path)?;
        let node = self.node(path)?;
        Ok(Metadata {
            kind: node.kind(),
            owner: node.owner,
            size: node.data.as_ref().map_or(0, |d| d.len() as u32),
        })
    }

    fn read_at(&self, path: &str, offset: u32, buf: &mut [u8]) -> FsResult<usize> {
        let data = match self.node(path)? {
            Node { data: Some(data), .. } => data,
            _ => return Err(FsError::AccessDenied(path.to_string())),
        };
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write_at(&mut self, path: &str, offset: u32, data: &[u8]) -> FsResult<usize> {
        let file = self.file_mut(path)?;
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(FsError::FileTooBig)?;
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn stats(&self) -> NandStats {
        let used_clusters: u32 = self
            .nodes
            .values()
            .filter_map(|n| n.data.as_ref())
            .map(|d| (d.len() as u32).div_ceil(CLUSTER_SIZE))
            .sum();
        // The root directory always takes an inode.
        let used_inodes = self.nodes.len() as u32 + 1;
        NandStats {
            cluster_size: CLUSTER_SIZE,
            free_clusters: TOTAL_CLUSTERS.saturating_sub(used_clusters),
            used_clusters,
            bad_clusters: 0,
            reserved_clusters: 0,
            free_inodes: TOTAL_INODES.saturating_sub(used_inodes),
            used_inodes,
        }
    }

    fn save_state(&self, w: &mut dyn Write) -> ios_snapshot::Result<()> {
        write_marker(w, "NAND")?;
        w.write_count_u32(self.nodes.len())?;
        for (path, node) in &self.nodes {
            w.write_string_u32(path)?;
            w.write_u32_le(node.owner.uid)?;
            w.write_u16_le(node.owner.gid)?;
            match &node.data {
                Some(data) => {
                    w.write_bool(true)?;
                    w.write_len_prefixed_bytes_u32(data)?;
                }
                None => w.write_bool(false)?,
            }
        }
        Ok(())
    }

    fn load_state(&mut self, r: &mut dyn Read) -> ios_snapshot::Result<()> {
        expect_marker(r, "NAND")?;
        let count = r.read_u32_le()?;
        let mut nodes = BTreeMap::new();
        for _ in 0..count {
            let path = r.read_string_u32()?;
            let owner = Owner {
                uid: r.read_u32_le()?,
                gid: r.read_u16_le()?,
            };
            let data = if r.read_bool()? {
                Some(r.read_len_prefixed_bytes_u32(MAX_FILE_SIZE)?)
            } else {
                None
            };
            if nodes.insert(path, Node { owner, data }).is_some() {
                return Err(SnapshotError::Corrupt("duplicate NAND path"));
            }
        }
        self.nodes = nodes;
        Ok(())
    }
}

/// Paths are absolute, without a trailing separator or empty components.
pub fn validate_path(path: &str) -> FsResult<()> {
    if path.len() > MAX_PATH_LEN {
        return Err(FsError::NameTooLong);
    }
    if path == "/" {
        return Ok(());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(FsError::InvalidPath(path.to_string()));
    };
    if rest.split('/').any(str::is_empty) {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    if rest.split('/').count() > MAX_PATH_DEPTH {
        return Err(FsError::TooDeep);
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}
