//! `transmit_key`: whole-object state transfer, used both for a joining
//! node's bulk catch-up and for the per-operation replica path of
//! mutating ops that aren't cheaply re-executable as a forwarded request.

use crate::error::Result;
use crate::flare::{Flare, FlareType};
use crate::transport::RW_CHUNK;
use crate::wire::{Reader, Writer};

/// One `transmit_key` chunk: `(path, offset, mode, uid, gid, chunk)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChunk {
    pub path: String,
    pub offset: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub chunk: Vec<u8>,
}

impl KeyChunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.str(&self.path);
        w.u64(self.offset);
        w.u32(self.mode);
        w.u32(self.uid);
        w.u32(self.gid);
        w.bytes(&self.chunk);
        w.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<KeyChunk> {
        let mut r = Reader::new(buf);
        Ok(KeyChunk {
            path: r.str()?,
            offset: r.u64()?,
            mode: r.u32()?,
            uid: r.u32()?,
            gid: r.u32()?,
            chunk: r.bytes()?,
        })
    }
}

/// Receiver side: upcast `flare`'s type from `mode` if not yet upcasted,
/// write `chunk` at `offset`, and return the new offset. `first_time` is
/// true exactly when `offset == 0`, per the source's convention that the
/// first chunk of a transfer also creates the catalog row.
pub fn apply_chunk(flare: &mut Flare, chunk: &KeyChunk) -> (bool, u64) {
    if !flare.is_upcasted {
        flare.ty = FlareType::from_mode(chunk.mode);
        flare.stat.mode = chunk.mode;
        flare.stat.uid = chunk.uid;
        flare.stat.gid = chunk.gid;
        flare.is_upcasted = true;
    }
    let first_time = chunk.offset == 0;
    let new_offset = chunk.offset + chunk.chunk.len() as u64;
    (first_time, new_offset)
}

/// Sender side: the sequence of `(offset, chunk_bytes)` pairs covering
/// `data` in fixed [`RW_CHUNK`]-sized pieces, as `transmit_key`'s sender
/// loop produces them from `0` to `stat.st_size`.
pub fn chunks_for(data: &[u8]) -> impl Iterator<Item = (u64, &[u8])> {
    data.chunks(RW_CHUNK).scan(0u64, |offset, chunk| {
        let at = *offset;
        *offset += chunk.len() as u64;
        Some((at, chunk))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_roundtrip() {
        let c = KeyChunk {
            path: "/f".to_string(),
            offset: 0,
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            chunk: vec![1, 2, 3, 4],
        };
        let encoded = c.encode();
        assert_eq!(KeyChunk::decode(&encoded).unwrap(), c);
    }

    #[test]
    fn apply_chunk_upcasts_once_and_advances_offset() {
        let mut flare = Flare::new("/f");
        let c = KeyChunk {
            path: "/f".to_string(),
            offset: 0,
            mode: 0o100644,
            uid: 7,
            gid: 7,
            chunk: vec![0; 10],
        };
        let (first_time, next) = apply_chunk(&mut flare, &c);
        assert!(first_time);
        assert_eq!(next, 10);
        assert_eq!(flare.ty, FlareType::Regular);

        let c2 = KeyChunk { offset: 10, chunk: vec![0; 5], ..c };
        let (first_time2, next2) = apply_chunk(&mut flare, &c2);
        assert!(!first_time2);
        assert_eq!(next2, 15);
    }

    #[test]
    fn chunks_for_covers_data_in_fixed_size_pieces() {
        let data = vec![7u8; RW_CHUNK * 2 + 13];
        let pieces: Vec<_> = chunks_for(&data).collect();
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].0, 0);
        assert_eq!(pieces[1].0, RW_CHUNK as u64);
        assert_eq!(pieces[2].0, (RW_CHUNK * 2) as u64);
        assert_eq!(pieces[2].1.len(), 13);
    }
}
