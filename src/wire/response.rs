//! Response header plus the per-operation reply bodies.

use super::codec::{Reader, Writer};
use super::stat::WireStat;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub errno: u16,
    pub result: i32,
    pub transaction_id: u16,
}

impl ResponseHeader {
    pub fn ok(result: i32, transaction_id: u16) -> ResponseHeader {
        ResponseHeader { errno: 0, result, transaction_id }
    }

    pub fn err(errno: libc::c_int, transaction_id: u16) -> ResponseHeader {
        ResponseHeader { errno: errno as u16, result: -1, transaction_id }
    }

    pub fn is_ok(&self) -> bool {
        self.errno == 0
    }

    pub fn write(&self, w: &mut Writer) {
        w.u16(self.errno);
        w.i32(self.result);
        w.u16(self.transaction_id);
    }

    pub fn read(r: &mut Reader) -> Result<ResponseHeader> {
        Ok(ResponseHeader { errno: r.u16()?, result: r.i32()?, transaction_id: r.u16()? })
    }
}

/// One entry of an extended-readdir chunk: a name plus its stat image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: WireStat,
}

impl DirEntry {
    fn write(&self, w: &mut Writer) {
        w.str(&self.name);
        self.stat.write(w);
    }

    fn read(r: &mut Reader) -> Result<DirEntry> {
        let name = r.str()?;
        let stat = WireStat::read(r)?;
        Ok(DirEntry { name, stat })
    }
}

/// Body carried alongside a [`ResponseHeader`], keyed by what the request
/// asked for. Operations whose whole answer fits in `(errno, result)` (an
/// `unlink`, a `chmod`, ...) carry [`ResponseBody::None`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    None,
    Stat(WireStat),
    Data(Vec<u8>),
    Path(String),
    Statfs { blocks: u64, bfree: u64, bavail: u64, files: u64, ffree: u64, bsize: u32 },
    /// Extended readdir: up to 50 entries, the new offset, and whether the
    /// directory is exhausted.
    Dirents { entries: Vec<DirEntry>, next_offset: u32, exhausted: bool },
    /// `opendir`/legacy remote-read chunk: a slab of the raw NUL-separated
    /// directory contents plus the directory's total size.
    DirChunk { chunk: Vec<u8>, total_size: u64 },
    /// `transmit_topology` chunk: a slab of serialized node profiles, the
    /// count it carries, and whether more remain.
    TopologyChunk { profiles: Vec<Vec<u8>>, more: bool },
    /// `join_network` answer: the interval assigned to the joiner.
    Interval { start_key: [u8; 20], stop_key: [u8; 20] },
    /// `transmit_key` answer: the offset to resume from.
    NextOffset(u64),
}

impl ResponseBody {
    pub fn write(&self, w: &mut Writer) {
        match self {
            ResponseBody::None => {}
            ResponseBody::Stat(s) => s.write(w),
            ResponseBody::Data(d) => w.bytes(d),
            ResponseBody::Path(p) => w.str(p),
            ResponseBody::Statfs { blocks, bfree, bavail, files, ffree, bsize } => {
                w.u64(*blocks);
                w.u64(*bfree);
                w.u64(*bavail);
                w.u64(*files);
                w.u64(*ffree);
                w.u32(*bsize);
            }
            ResponseBody::Dirents { entries, next_offset, exhausted } => {
                w.u32(entries.len() as u32);
                for e in entries {
                    e.write(w);
                }
                w.u32(*next_offset);
                w.u8(*exhausted as u8);
            }
            ResponseBody::DirChunk { chunk, total_size } => {
                w.bytes(chunk);
                w.u64(*total_size);
            }
            ResponseBody::TopologyChunk { profiles, more } => {
                w.u32(profiles.len() as u32);
                for p in profiles {
                    w.bytes(p);
                }
                w.u8(*more as u8);
            }
            ResponseBody::Interval { start_key, stop_key } => {
                w.fixed20(start_key);
                w.fixed20(stop_key);
            }
            ResponseBody::NextOffset(off) => w.u64(*off),
        }
    }
}

/// Decoding a body requires knowing which operation it answers; there is
/// no body-type tag on the wire (the transaction table already knows what
/// it sent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    None,
    Stat,
    Data,
    Path,
    Statfs,
    Dirents,
    DirChunk,
    TopologyChunk,
    Interval,
    NextOffset,
}

pub fn decode_body(shape: ResponseShape, r: &mut Reader) -> Result<ResponseBody> {
    Ok(match shape {
        ResponseShape::None => ResponseBody::None,
        ResponseShape::Stat => ResponseBody::Stat(WireStat::read(r)?),
        ResponseShape::Data => ResponseBody::Data(r.bytes()?),
        ResponseShape::Path => ResponseBody::Path(r.str()?),
        ResponseShape::Statfs => ResponseBody::Statfs {
            blocks: r.u64()?,
            bfree: r.u64()?,
            bavail: r.u64()?,
            files: r.u64()?,
            ffree: r.u64()?,
            bsize: r.u32()?,
        },
        ResponseShape::Dirents => {
            let count = r.u32()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                entries.push(DirEntry::read(r)?);
            }
            let next_offset = r.u32()?;
            let exhausted = r.u8()? != 0;
            ResponseBody::Dirents { entries, next_offset, exhausted }
        }
        ResponseShape::DirChunk => {
            ResponseBody::DirChunk { chunk: r.bytes()?, total_size: r.u64()? }
        }
        ResponseShape::TopologyChunk => {
            let count = r.u32()?;
            let mut profiles = Vec::with_capacity(count as usize);
            for _ in 0..count {
                profiles.push(r.bytes()?);
            }
            let more = r.u8()? != 0;
            ResponseBody::TopologyChunk { profiles, more }
        }
        ResponseShape::Interval => {
            ResponseBody::Interval { start_key: r.fixed20()?, stop_key: r.fixed20()? }
        }
        ResponseShape::NextOffset => ResponseBody::NextOffset(r.u64()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let h = ResponseHeader::ok(0, 42);
        let mut w = Writer::new();
        h.write(&mut w);
        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert_eq!(ResponseHeader::read(&mut r).unwrap(), h);
    }

    #[test]
    fn err_header_carries_negative_result() {
        let h = ResponseHeader::err(libc::ENOENT, 7);
        assert!(!h.is_ok());
        assert_eq!(h.result, -1);
        assert_eq!(h.errno, libc::ENOENT as u16);
    }

    #[test]
    fn dirents_roundtrip() {
        let body = ResponseBody::Dirents {
            entries: vec![
                DirEntry { name: ".".into(), stat: WireStat::default() },
                DirEntry { name: "f".into(), stat: WireStat { mode: 0o100644, ..Default::default() } },
            ],
            next_offset: 2,
            exhausted: true,
        };
        let mut w = Writer::new();
        body.write(&mut w);
        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert_eq!(decode_body(ResponseShape::Dirents, &mut r).unwrap(), body);
    }

    #[test]
    fn topology_chunk_roundtrip() {
        let body = ResponseBody::TopologyChunk { profiles: vec![vec![1, 2], vec![3, 4, 5]], more: true };
        let mut w = Writer::new();
        body.write(&mut w);
        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert_eq!(decode_body(ResponseShape::TopologyChunk, &mut r).unwrap(), body);
    }
}
