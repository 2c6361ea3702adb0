//! The `Flare`: in-memory representation of one POSIX object.

use crate::hash::{self, Key};
use crate::wire::WireStat;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlareType {
    Regular,
    Directory,
    Symlink,
    CharDev,
    BlockDev,
    Fifo,
    Socket,
    Unknown,
}

impl FlareType {
    /// Infer from `st_mode`'s type bits (`S_IFMT`).
    pub fn from_mode(mode: u32) -> FlareType {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FlareType::Regular,
            libc::S_IFDIR => FlareType::Directory,
            libc::S_IFLNK => FlareType::Symlink,
            libc::S_IFCHR => FlareType::CharDev,
            libc::S_IFBLK => FlareType::BlockDev,
            libc::S_IFIFO => FlareType::Fifo,
            libc::S_IFSOCK => FlareType::Socket,
            _ => FlareType::Unknown,
        }
    }

    pub fn mode_bits(self) -> u32 {
        match self {
            FlareType::Regular => libc::S_IFREG,
            FlareType::Directory => libc::S_IFDIR,
            FlareType::Symlink => libc::S_IFLNK,
            FlareType::CharDev => libc::S_IFCHR,
            FlareType::BlockDev => libc::S_IFBLK,
            FlareType::Fifo => libc::S_IFIFO,
            FlareType::Socket => libc::S_IFSOCK,
            FlareType::Unknown => 0,
        }
    }

    pub fn is_directory(self) -> bool {
        matches!(self, FlareType::Directory)
    }
}

/// One POSIX object: a path, its identity hashes, its on-disk location,
/// and its cached stat image.
#[derive(Debug, Clone)]
pub struct Flare {
    pub path: String,
    pub ty: FlareType,
    pub binhash: [u8; 20],
    pub hash: Key,
    pub parent_path: String,
    pub parent_binhash: [u8; 20],
    pub parent_hash: Key,

    pub stat: WireStat,
    /// Set once `ty` has been determined from either on-disk content or a
    /// catalog row, rather than assumed from a fresh `mknod`.
    pub is_upcasted: bool,

    pub commit_path: Option<String>,
    pub commit_time: Option<u64>,
    pub commit_url: Option<String>,

    pub last_access: SystemTime,
}

impl Flare {
    /// A brand-new, un-upcasted flare for `path`, as `search_or_create`
    /// builds before consulting disk or catalog.
    pub fn new(path: &str) -> Flare {
        let key = Key::of_path(path);
        let (parent_path, _name) = crate::path::split_parent(path);
        let parent_key = Key::of_path(&parent_path);
        Flare {
            path: path.to_string(),
            ty: FlareType::Unknown,
            binhash: key.to_bytes(),
            hash: key,
            parent_binhash: parent_key.to_bytes(),
            parent_hash: parent_key,
            parent_path,
            stat: WireStat::default(),
            is_upcasted: false,
            commit_path: None,
            commit_time: None,
            commit_url: None,
            last_access: SystemTime::now(),
        }
    }

    /// The on-disk location of this flare's contents: `hashpath/hash`.
    pub fn contents_path(&self, hashpath: &std::path::Path) -> PathBuf {
        hashpath.join(hash::armour(&self.binhash))
    }

    pub fn is_directory(&self) -> bool {
        self.ty.is_directory()
    }

    pub fn touch(&mut self) {
        self.last_access = SystemTime::now();
    }
}
