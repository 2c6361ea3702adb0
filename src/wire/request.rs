//! Request header and the tagged-enum `Operation` dispatch.
//!
//! The source dispatches on an `optype` byte through a function-pointer
//! table; here the byte is parsed straight into a `Operation` variant so
//! an unknown optype is a decode error rather than a null pointer call.

use super::codec::{Reader, Writer};
use crate::error::{Error, Result};

/// Client requests enter the ring with this TTL; forwarded requests carry
/// [`TTL_TERMINAL`] so the owner never forwards a forward.
pub const TTL_DEFAULT: u8 = 2;
pub const TTL_TERMINAL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub optype: u8,
    pub ttl: u8,
    pub transaction_id: u16,
    pub uid: u32,
    pub gid: u32,
}

impl RequestHeader {
    pub fn write(&self, w: &mut Writer) {
        w.u8(self.optype);
        w.u8(self.ttl);
        w.u16(self.transaction_id);
        w.u32(self.uid);
        w.u32(self.gid);
    }

    pub fn read(r: &mut Reader) -> Result<RequestHeader> {
        Ok(RequestHeader {
            optype: r.u8()?,
            ttl: r.u8()?,
            transaction_id: r.u16()?,
            uid: r.u32()?,
            gid: r.u32()?,
        })
    }

    /// Is this request allowed to forward, or must it be handled locally
    /// (or fail) right here?
    pub fn may_forward(&self) -> bool {
        self.ttl > TTL_TERMINAL
    }

    /// The header to use when forwarding this request on to its owner.
    pub fn forwarded(&self) -> RequestHeader {
        RequestHeader { ttl: TTL_TERMINAL, ..*self }
    }
}

/// One byte per operation, matching the order operations are introduced
/// in the POSIX layer contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Optype {
    Getattr = 1,
    Mknod = 2,
    Mkdir = 3,
    Read = 4,
    Write = 5,
    Unlink = 6,
    Rmdir = 7,
    Symlink = 8,
    Readlink = 9,
    Rename = 10,
    Chmod = 11,
    Chown = 12,
    Truncate = 13,
    Utime = 14,
    Statfs = 15,
    Opendir = 16,
    Readdir = 17,
    TransmitTopology = 18,
    JoinNetwork = 19,
    FinishJoinNetwork = 20,
    TransmitKey = 21,
    Heartbeat = 22,
    NetworkBuilt = 23,
    Shutdown = 24,
    AddToParent = 25,
    RemoveFromParent = 26,
}

impl Optype {
    pub fn from_byte(b: u8) -> Result<Optype> {
        use Optype::*;
        Ok(match b {
            1 => Getattr,
            2 => Mknod,
            3 => Mkdir,
            4 => Read,
            5 => Write,
            6 => Unlink,
            7 => Rmdir,
            8 => Symlink,
            9 => Readlink,
            10 => Rename,
            11 => Chmod,
            12 => Chown,
            13 => Truncate,
            14 => Utime,
            15 => Statfs,
            16 => Opendir,
            17 => Readdir,
            18 => TransmitTopology,
            19 => JoinNetwork,
            20 => FinishJoinNetwork,
            21 => TransmitKey,
            22 => Heartbeat,
            23 => NetworkBuilt,
            24 => Shutdown,
            25 => AddToParent,
            26 => RemoveFromParent,
            other => return Err(Error::Protocol(format!("unknown optype {other}"))),
        })
    }

    /// Mutating operations that are result-cached and replicated, per the
    /// per-operation contracts.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Optype::Mknod
                | Optype::Mkdir
                | Optype::Unlink
                | Optype::Rmdir
                | Optype::Symlink
                | Optype::Chmod
                | Optype::Chown
                | Optype::Truncate
                | Optype::Utime
                | Optype::Write
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Getattr { path: String },
    Mknod { path: String, mode: u32, rdev: u32 },
    Mkdir { path: String, mode: u32 },
    Read { path: String, offset: u64, size: u32 },
    Write { path: String, offset: u64, data: Vec<u8> },
    Unlink { path: String },
    Rmdir { path: String },
    Symlink { target: String, path: String },
    Readlink { path: String },
    Rename { from: String, to: String },
    Chmod { path: String, mode: u32 },
    Chown { path: String, uid: u32, gid: u32 },
    Truncate { path: String, size: u64 },
    Utime { path: String, atime: u64, mtime: u64 },
    Statfs,
    Opendir { path: String, offset: u32 },
    Readdir { path: String, offset: u32 },
    TransmitTopology { offset: u32 },
    JoinNetwork { profile: Vec<u8> },
    FinishJoinNetwork { profile: Vec<u8>, participants: u32 },
    TransmitKey { path: String, offset: u64, mode: u32, uid: u32, gid: u32, chunk: Vec<u8> },
    Heartbeat,
    NetworkBuilt,
    Shutdown,
    /// Sent by a node that isn't the parent path's owner/redundant owner
    /// when it needs `name` added to `parent`'s directory listing, per
    /// `magma_add_flare_to_parent`'s remote-parent branch.
    AddToParent { parent: String, name: String },
    RemoveFromParent { parent: String, name: String },
}

impl Operation {
    pub fn optype(&self) -> Optype {
        match self {
            Operation::Getattr { .. } => Optype::Getattr,
            Operation::Mknod { .. } => Optype::Mknod,
            Operation::Mkdir { .. } => Optype::Mkdir,
            Operation::Read { .. } => Optype::Read,
            Operation::Write { .. } => Optype::Write,
            Operation::Unlink { .. } => Optype::Unlink,
            Operation::Rmdir { .. } => Optype::Rmdir,
            Operation::Symlink { .. } => Optype::Symlink,
            Operation::Readlink { .. } => Optype::Readlink,
            Operation::Rename { .. } => Optype::Rename,
            Operation::Chmod { .. } => Optype::Chmod,
            Operation::Chown { .. } => Optype::Chown,
            Operation::Truncate { .. } => Optype::Truncate,
            Operation::Utime { .. } => Optype::Utime,
            Operation::Statfs => Optype::Statfs,
            Operation::Opendir { .. } => Optype::Opendir,
            Operation::Readdir { .. } => Optype::Readdir,
            Operation::TransmitTopology { .. } => Optype::TransmitTopology,
            Operation::JoinNetwork { .. } => Optype::JoinNetwork,
            Operation::FinishJoinNetwork { .. } => Optype::FinishJoinNetwork,
            Operation::TransmitKey { .. } => Optype::TransmitKey,
            Operation::Heartbeat => Optype::Heartbeat,
            Operation::NetworkBuilt => Optype::NetworkBuilt,
            Operation::Shutdown => Optype::Shutdown,
            Operation::AddToParent { .. } => Optype::AddToParent,
            Operation::RemoveFromParent { .. } => Optype::RemoveFromParent,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Operation::Getattr { path }
            | Operation::Mknod { path, .. }
            | Operation::Mkdir { path, .. }
            | Operation::Read { path, .. }
            | Operation::Write { path, .. }
            | Operation::Unlink { path }
            | Operation::Rmdir { path }
            | Operation::Symlink { path, .. }
            | Operation::Readlink { path }
            | Operation::Chmod { path, .. }
            | Operation::Chown { path, .. }
            | Operation::Truncate { path, .. }
            | Operation::Utime { path, .. }
            | Operation::Opendir { path, .. }
            | Operation::Readdir { path, .. }
            | Operation::TransmitKey { path, .. } => Some(path),
            Operation::Rename { from, .. } => Some(from),
            _ => None,
        }
    }

    pub fn encode(&self, w: &mut Writer) {
        match self {
            Operation::Getattr { path } => w.str(path),
            Operation::Mknod { path, mode, rdev } => {
                w.str(path);
                w.u32(*mode);
                w.u32(*rdev);
            }
            Operation::Mkdir { path, mode } => {
                w.str(path);
                w.u32(*mode);
            }
            Operation::Read { path, offset, size } => {
                w.str(path);
                w.u64(*offset);
                w.u32(*size);
            }
            Operation::Write { path, offset, data } => {
                w.str(path);
                w.u64(*offset);
                w.bytes(data);
            }
            Operation::Unlink { path } => w.str(path),
            Operation::Rmdir { path } => w.str(path),
            Operation::Symlink { target, path } => {
                w.str(target);
                w.str(path);
            }
            Operation::Readlink { path } => w.str(path),
            Operation::Rename { from, to } => {
                w.str(from);
                w.str(to);
            }
            Operation::Chmod { path, mode } => {
                w.str(path);
                w.u32(*mode);
            }
            Operation::Chown { path, uid, gid } => {
                w.str(path);
                w.u32(*uid);
                w.u32(*gid);
            }
            Operation::Truncate { path, size } => {
                w.str(path);
                w.u64(*size);
            }
            Operation::Utime { path, atime, mtime } => {
                w.str(path);
                w.u64(*atime);
                w.u64(*mtime);
            }
            Operation::Statfs => {}
            Operation::Opendir { path, offset } => {
                w.str(path);
                w.u32(*offset);
            }
            Operation::Readdir { path, offset } => {
                w.str(path);
                w.u32(*offset);
            }
            Operation::TransmitTopology { offset } => w.u32(*offset),
            Operation::JoinNetwork { profile } => w.bytes(profile),
            Operation::FinishJoinNetwork { profile, participants } => {
                w.bytes(profile);
                w.u32(*participants);
            }
            Operation::TransmitKey { path, offset, mode, uid, gid, chunk } => {
                w.str(path);
                w.u64(*offset);
                w.u32(*mode);
                w.u32(*uid);
                w.u32(*gid);
                w.bytes(chunk);
            }
            Operation::Heartbeat => {}
            Operation::NetworkBuilt => {}
            Operation::Shutdown => {}
            Operation::AddToParent { parent, name } => {
                w.str(parent);
                w.str(name);
            }
            Operation::RemoveFromParent { parent, name } => {
                w.str(parent);
                w.str(name);
            }
        }
    }

    pub fn decode(optype: Optype, r: &mut Reader) -> Result<Operation> {
        Ok(match optype {
            Optype::Getattr => Operation::Getattr { path: r.str()? },
            Optype::Mknod => Operation::Mknod { path: r.str()?, mode: r.u32()?, rdev: r.u32()? },
            Optype::Mkdir => Operation::Mkdir { path: r.str()?, mode: r.u32()? },
            Optype::Read => Operation::Read { path: r.str()?, offset: r.u64()?, size: r.u32()? },
            Optype::Write => Operation::Write { path: r.str()?, offset: r.u64()?, data: r.bytes()? },
            Optype::Unlink => Operation::Unlink { path: r.str()? },
            Optype::Rmdir => Operation::Rmdir { path: r.str()? },
            Optype::Symlink => Operation::Symlink { target: r.str()?, path: r.str()? },
            Optype::Readlink => Operation::Readlink { path: r.str()? },
            Optype::Rename => Operation::Rename { from: r.str()?, to: r.str()? },
            Optype::Chmod => Operation::Chmod { path: r.str()?, mode: r.u32()? },
            Optype::Chown => Operation::Chown { path: r.str()?, uid: r.u32()?, gid: r.u32()? },
            Optype::Truncate => Operation::Truncate { path: r.str()?, size: r.u64()? },
            Optype::Utime => Operation::Utime { path: r.str()?, atime: r.u64()?, mtime: r.u64()? },
            Optype::Statfs => Operation::Statfs,
            Optype::Opendir => Operation::Opendir { path: r.str()?, offset: r.u32()? },
            Optype::Readdir => Operation::Readdir { path: r.str()?, offset: r.u32()? },
            Optype::TransmitTopology => Operation::TransmitTopology { offset: r.u32()? },
            Optype::JoinNetwork => Operation::JoinNetwork { profile: r.bytes()? },
            Optype::FinishJoinNetwork => {
                Operation::FinishJoinNetwork { profile: r.bytes()?, participants: r.u32()? }
            }
            Optype::TransmitKey => Operation::TransmitKey {
                path: r.str()?,
                offset: r.u64()?,
                mode: r.u32()?,
                uid: r.u32()?,
                gid: r.u32()?,
                chunk: r.bytes()?,
            },
            Optype::Heartbeat => Operation::Heartbeat,
            Optype::NetworkBuilt => Operation::NetworkBuilt,
            Optype::Shutdown => Operation::Shutdown,
            Optype::AddToParent => Operation::AddToParent { parent: r.str()?, name: r.str()? },
            Optype::RemoveFromParent => Operation::RemoveFromParent { parent: r.str()?, name: r.str()? },
        })
    }
}

/// A decoded request: header plus the operation it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub op: Operation,
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.header.write(&mut w);
        self.op.encode(&mut w);
        w.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Request> {
        let mut r = Reader::new(buf);
        let header = RequestHeader::read(&mut r)?;
        let optype = Optype::from_byte(header.optype)?;
        let op = Operation::decode(optype, &mut r)?;
        Ok(Request { header, op })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip_for_every_optype() {
        let ops = vec![
            Operation::Getattr { path: "/a".into() },
            Operation::Mknod { path: "/a".into(), mode: 0o100644, rdev: 0 },
            Operation::Mkdir { path: "/d".into(), mode: 0o40755 },
            Operation::Read { path: "/a".into(), offset: 10, size: 64 },
            Operation::Write { path: "/a".into(), offset: 0, data: vec![1, 2, 3] },
            Operation::Unlink { path: "/a".into() },
            Operation::Rmdir { path: "/d".into() },
            Operation::Symlink { target: "/a".into(), path: "/b".into() },
            Operation::Readlink { path: "/b".into() },
            Operation::Rename { from: "/a".into(), to: "/b".into() },
            Operation::Chmod { path: "/a".into(), mode: 0o644 },
            Operation::Chown { path: "/a".into(), uid: 1, gid: 1 },
            Operation::Truncate { path: "/a".into(), size: 0 },
            Operation::Utime { path: "/a".into(), atime: 1, mtime: 2 },
            Operation::Statfs,
            Operation::Opendir { path: "/d".into(), offset: 0 },
            Operation::Readdir { path: "/d".into(), offset: 0 },
            Operation::TransmitTopology { offset: 0 },
            Operation::JoinNetwork { profile: vec![9; 12] },
            Operation::FinishJoinNetwork { profile: vec![9; 12], participants: 3 },
            Operation::TransmitKey {
                path: "/a".into(),
                offset: 0,
                mode: 0o100644,
                uid: 0,
                gid: 0,
                chunk: vec![7; 32],
            },
            Operation::Heartbeat,
            Operation::NetworkBuilt,
            Operation::Shutdown,
            Operation::AddToParent { parent: "/d".into(), name: "a".into() },
            Operation::RemoveFromParent { parent: "/d".into(), name: "a".into() },
        ];

        for (i, op) in ops.into_iter().enumerate() {
            let header = RequestHeader {
                optype: op.optype() as u8,
                ttl: TTL_DEFAULT,
                transaction_id: i as u16 + 1,
                uid: 1000,
                gid: 1000,
            };
            let req = Request { header, op };
            let encoded = req.encode();
            let decoded = Request::decode(&encoded).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn unknown_optype_is_a_decode_error() {
        let mut w = Writer::new();
        RequestHeader { optype: 200, ttl: TTL_DEFAULT, transaction_id: 1, uid: 0, gid: 0 }
            .write(&mut w);
        let buf = w.into_bytes();
        assert!(Request::decode(&buf).is_err());
    }

    #[test]
    fn forwarded_header_drops_to_terminal_ttl() {
        let h = RequestHeader { optype: 1, ttl: TTL_DEFAULT, transaction_id: 5, uid: 0, gid: 0 };
        assert!(h.may_forward());
        let f = h.forwarded();
        assert_eq!(f.ttl, TTL_TERMINAL);
        assert!(!f.may_forward());
    }
}
