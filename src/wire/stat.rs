//! Fixed wire schema for a `stat` image, independent of the host's
//! `struct stat` layout so a 32-bit and a 64-bit node agree on the bytes.

use super::codec::{Reader, Writer};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireStat {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl WireStat {
    pub fn write(&self, w: &mut Writer) {
        w.u64(self.dev);
        w.u64(self.ino);
        w.u64(self.nlink);
        w.u64(self.rdev);
        w.u64(self.size);
        w.u64(self.blksize);
        w.u64(self.blocks);
        w.u64(self.atime);
        w.u64(self.ctime);
        w.u64(self.mtime);
        w.u32(self.mode);
        w.u32(self.uid);
        w.u32(self.gid);
    }

    pub fn read(r: &mut Reader) -> Result<WireStat> {
        Ok(WireStat {
            dev: r.u64()?,
            ino: r.u64()?,
            nlink: r.u64()?,
            rdev: r.u64()?,
            size: r.u64()?,
            blksize: r.u64()?,
            blocks: r.u64()?,
            atime: r.u64()?,
            ctime: r.u64()?,
            mtime: r.u64()?,
            mode: r.u32()?,
            uid: r.u32()?,
            gid: r.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_roundtrip() {
        let s = WireStat {
            dev: 1,
            ino: 2,
            nlink: 3,
            rdev: 0,
            size: 4096,
            blksize: 4096,
            blocks: 8,
            atime: 100,
            ctime: 100,
            mtime: 100,
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
        };
        let mut w = Writer::new();
        s.write(&mut w);
        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert_eq!(WireStat::read(&mut r).unwrap(), s);
    }
}
