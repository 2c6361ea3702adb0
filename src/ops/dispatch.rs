//! The per-operation contract: compute the owner and redundant owner,
//! decide whether to execute locally or forward, cache mutating results
//! for dedup, and enqueue replica tasks on success.

use super::context::NodeContext;
use super::handlers;
use crate::error::{Error, Result};
use crate::path;
use crate::replication::ReplicaTask;
use crate::ring::{route_path, Volcano};
use crate::transport::{CachedResult, ResultKey};
use crate::wire::{
    decode_body, DirEntry, Operation, Optype, Request, RequestHeader, ResponseBody, ResponseHeader,
    ResponseShape, WireStat, TTL_TERMINAL,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

fn stat_to_dirent(name: &str, stat: WireStat) -> DirEntry {
    DirEntry { name: name.to_string(), stat }
}

fn response_shape(optype: Optype) -> ResponseShape {
    match optype {
        Optype::Getattr => ResponseShape::Stat,
        Optype::Mknod | Optype::Mkdir | Optype::Symlink => ResponseShape::Stat,
        Optype::Read => ResponseShape::Data,
        Optype::Readlink => ResponseShape::Path,
        Optype::Statfs => ResponseShape::Statfs,
        Optype::Readdir | Optype::Opendir => ResponseShape::Dirents,
        _ => ResponseShape::None,
    }
}

/// Top-level entry point for a decoded POSIX request arriving from a
/// client or another node. Membership/replication optypes are not
/// handled here; callers route those to the membership module first.
pub fn dispatch(ctx: &NodeContext, header: RequestHeader, op: &Operation, peer: SocketAddr) -> (ResponseHeader, ResponseBody) {
    let optype = op.optype();
    let Some(path) = op.path() else {
        return match op {
            Operation::Statfs => answer_statfs(ctx, header.transaction_id),
            Operation::Rename { .. } => {
                (ResponseHeader::err(Error::CrossDevice.to_errno(), header.transaction_id), ResponseBody::None)
            }
            Operation::AddToParent { parent, name } => answer_add_to_parent(ctx, header.transaction_id, parent, name),
            Operation::RemoveFromParent { parent, name } => {
                answer_remove_from_parent(ctx, header.transaction_id, parent, name)
            }
            _ => (
                ResponseHeader::err(libc::EIO, header.transaction_id),
                ResponseBody::None,
            ),
        };
    };
    let simplified = path::simplify(path);

    let lava = ctx.ring.snapshot();
    let owner_idx = match route_path(&lava, &simplified) {
        Ok(idx) => idx,
        Err(_) => return (ResponseHeader::err(libc::EIO, header.transaction_id), ResponseBody::None),
    };
    let owner = lava.get(owner_idx).clone();
    let is_owner = ctx.is_self(owner.ip, owner.port);
    let is_redundant_owner = !is_owner && is_self_redundant_owner(ctx, &lava, owner_idx);

    // Mirror `magma_getattr`'s `im_owner || im_red_owner` guard: only
    // forward when neither the owner nor its redundant replica is us.
    if !is_owner && !is_redundant_owner && header.may_forward() {
        return forward(ctx, header, op, owner);
    }

    // Either we are the owner, or this is a terminal (already-forwarded)
    // request the owner must answer locally regardless.
    let peer_ip = match peer {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    let key = ResultKey { peer_ip, peer_port: peer.port(), transaction_id: header.transaction_id };

    if optype.is_mutation() {
        if let Some(cached) = ctx.result_cache.get(key) {
            return (
                ResponseHeader { errno: cached.errno, result: cached.result, transaction_id: header.transaction_id },
                ResponseBody::None,
            );
        }
    }

    let (resp_header, body) = execute_local(ctx, &simplified, op, header.transaction_id, header.uid, header.gid);

    if optype.is_mutation() {
        ctx.result_cache.insert(
            key,
            CachedResult { result: resp_header.result, errno: resp_header.errno },
        );
        if resp_header.is_ok() && header.may_forward() {
            enqueue_replicas(ctx, &lava, owner_idx, op, &header);
        }
    }

    (resp_header, body)
}

/// Is this node the redundant owner (`owner.next`, wrapping) of `owner_idx`?
fn is_self_redundant_owner(ctx: &NodeContext, lava: &crate::ring::Lava, owner_idx: usize) -> bool {
    match crate::ring::redundant_owner(lava, owner_idx) {
        Ok(red_idx) => {
            let red = lava.get(red_idx);
            ctx.is_self(red.ip, red.port)
        }
        Err(_) => false,
    }
}

fn answer_add_to_parent(ctx: &NodeContext, tid: u16, parent: &str, name: &str) -> (ResponseHeader, ResponseBody) {
    match handlers::add_to_parent(ctx, parent, name) {
        Ok(()) => (ResponseHeader::ok(0, tid), ResponseBody::None),
        Err(e) => (ResponseHeader::err(e.to_errno(), tid), ResponseBody::None),
    }
}

fn answer_remove_from_parent(ctx: &NodeContext, tid: u16, parent: &str, name: &str) -> (ResponseHeader, ResponseBody) {
    match handlers::remove_from_parent(ctx, parent, name) {
        Ok(()) => (ResponseHeader::ok(0, tid), ResponseBody::None),
        Err(e) => (ResponseHeader::err(e.to_errno(), tid), ResponseBody::None),
    }
}

fn answer_statfs(ctx: &NodeContext, tid: u16) -> (ResponseHeader, ResponseBody) {
    match handlers::statfs(ctx) {
        Ok(s) => (
            ResponseHeader::ok(0, tid),
            ResponseBody::Statfs {
                blocks: s.blocks,
                bfree: s.bfree,
                bavail: s.bavail,
                files: s.files,
                ffree: s.ffree,
                bsize: s.bsize,
            },
        ),
        Err(e) => (ResponseHeader::err(e.to_errno(), tid), ResponseBody::None),
    }
}

fn execute_local(
    ctx: &NodeContext,
    path: &str,
    op: &Operation,
    tid: u16,
    uid: u32,
    gid: u32,
) -> (ResponseHeader, ResponseBody) {
    let result = match op {
        Operation::Getattr { .. } => handlers::getattr(ctx, path).map(ResponseBody::Stat),
        Operation::Mknod { mode, rdev, .. } => {
            let res = handlers::mknod(ctx, path, *mode, *rdev, uid, gid);
            if res.is_ok() {
                let (parent, name) = path::split_parent(path);
                fan_out_parent(ctx, &parent, &name, true, uid, gid);
            }
            res.map(ResponseBody::Stat)
        }
        Operation::Mkdir { mode, .. } => {
            let res = handlers::mkdir(ctx, path, *mode, uid, gid);
            if res.is_ok() {
                let (parent, name) = path::split_parent(path);
                fan_out_parent(ctx, &parent, &name, true, uid, gid);
            }
            res.map(ResponseBody::Stat)
        }
        Operation::Read { offset, size, .. } => {
            handlers::read(ctx, path, *offset, *size, uid, gid).map(ResponseBody::Data)
        }
        Operation::Write { offset, data, .. } => {
            handlers::write(ctx, path, *offset, data, uid, gid).map(|n| ResponseBody::NextOffset(n as u64))
        }
        Operation::Unlink { .. } => {
            let res = handlers::unlink(ctx, path, uid, gid);
            if res.is_ok() {
                let (parent, name) = path::split_parent(path);
                fan_out_parent(ctx, &parent, &name, false, uid, gid);
            }
            res.map(|_| ResponseBody::None)
        }
        Operation::Rmdir { .. } => {
            let res = handlers::rmdir(ctx, path, uid, gid);
            if res.is_ok() {
                let (parent, name) = path::split_parent(path);
                fan_out_parent(ctx, &parent, &name, false, uid, gid);
            }
            res.map(|_| ResponseBody::None)
        }
        Operation::Symlink { target, .. } => {
            let res = handlers::symlink(ctx, target, path, uid, gid);
            if res.is_ok() {
                let (parent, name) = path::split_parent(path);
                fan_out_parent(ctx, &parent, &name, true, uid, gid);
            }
            res.map(ResponseBody::Stat)
        }
        Operation::Readlink { .. } => handlers::readlink(ctx, path).map(ResponseBody::Path),
        Operation::Rename { to, .. } => handlers::rename(ctx, path, to).map(|_| ResponseBody::None),
        Operation::Chmod { mode, .. } => handlers::chmod(ctx, path, *mode, uid, gid).map(|_| ResponseBody::None),
        Operation::Chown { uid: new_uid, gid: new_gid, .. } => {
            handlers::chown(ctx, path, *new_uid, *new_gid, uid).map(|_| ResponseBody::None)
        }
        Operation::Truncate { size, .. } => {
            handlers::truncate(ctx, path, *size, uid, gid).map(|_| ResponseBody::None)
        }
        Operation::Utime { atime, mtime, .. } => {
            handlers::utime(ctx, path, *atime, *mtime, uid, gid).map(|_| ResponseBody::None)
        }
        Operation::Opendir { offset, .. } | Operation::Readdir { offset, .. } => {
            readdir_extended(ctx, path, *offset)
        }
        _ => Err(Error::Protocol("optype not handled by the POSIX dispatcher".to_string())),
    };

    match result {
        Ok(body) => (ResponseHeader::ok(0, tid), body),
        Err(e) => (ResponseHeader::err(e.to_errno(), tid), ResponseBody::None),
    }
}

fn readdir_extended(ctx: &NodeContext, path: &str, offset: u32) -> Result<ResponseBody> {
    use crate::flare::directory::{next_entry, READDIR_BATCH};
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let flare = entry.read().expect("flare lock poisoned");
    if !flare.is_directory() {
        return Err(Error::NotADirectory(path.to_string()));
    }
    let body = crate::flare::directory::load_body(&flare.contents_path(&ctx.hashpath))?;
    drop(flare);

    let mut entries = Vec::with_capacity(READDIR_BATCH);
    let mut cursor = offset as usize;
    let mut exhausted = false;
    while entries.len() < READDIR_BATCH {
        match next_entry(&body, cursor) {
            Some((name, next)) => {
                let child_path = if path == "/" { format!("/{name}") } else { format!("{path}/{name}") };
                let stat = if name == "." || name == ".." {
                    WireStat { mode: libc::S_IFDIR | 0o755, ..Default::default() }
                } else {
                    handlers::getattr(ctx, &child_path).unwrap_or_default()
                };
                entries.push(stat_to_dirent(&name, stat));
                cursor = next;
            }
            None => {
                exhausted = true;
                break;
            }
        }
    }
    Ok(ResponseBody::Dirents { entries, next_offset: cursor as u32, exhausted })
}

fn forward(
    ctx: &NodeContext,
    header: RequestHeader,
    op: &Operation,
    owner: Volcano,
) -> (ResponseHeader, ResponseBody) {
    let forwarded = Request { header: header.forwarded(), op: op.clone() };
    let target = SocketAddr::V4(owner.address());
    let optype = op.optype();
    let shape = response_shape(optype);

    let expected_tid = forwarded.header.transaction_id;
    let result = ctx.node_transport.send_and_await(&forwarded.encode(), target, |buf, _peer| {
        let mut r = crate::wire::Reader::new(buf);
        matches!(ResponseHeader::read(&mut r), Ok(h) if h.transaction_id == expected_tid)
    });

    match result {
        Ok(buf) => {
            let mut r = crate::wire::Reader::new(&buf);
            match (ResponseHeader::read(&mut r), decode_body(shape, &mut r)) {
                (Ok(h), Ok(body)) => (h, body),
                _ => (ResponseHeader::err(libc::EIO, header.transaction_id), ResponseBody::None),
            }
        }
        Err(_) => (ResponseHeader::err(libc::EIO, header.transaction_id), ResponseBody::None),
    }
}

static PARENT_TID: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(1);

fn next_parent_tid() -> u16 {
    loop {
        let v = PARENT_TID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if v != 0 {
            return v;
        }
    }
}

/// Add/remove `name` in `parent`'s directory listing, routing to the
/// parent path's real owner or redundant owner over the wire when this
/// node is neither, per `magma_add_flare_to_parent`'s remote-parent branch
/// (a file's parent may hash to a different node than the file itself).
fn fan_out_parent(ctx: &NodeContext, parent: &str, name: &str, add: bool, uid: u32, gid: u32) {
    let lava = ctx.ring.snapshot();
    let owner_idx = match route_path(&lava, parent) {
        Ok(idx) => idx,
        Err(_) => return,
    };
    let owner = lava.get(owner_idx).clone();
    let is_owner = ctx.is_self(owner.ip, owner.port);
    let is_redundant_owner = !is_owner && is_self_redundant_owner(ctx, &lava, owner_idx);

    if is_owner || is_redundant_owner {
        let result =
            if add { handlers::add_to_parent(ctx, parent, name) } else { handlers::remove_from_parent(ctx, parent, name) };
        if let Err(e) = result {
            tracing::debug!(target: "dispatcher", parent, name, error = %e, "local parent update failed");
        }
        return;
    }

    let op = if add {
        Operation::AddToParent { parent: parent.to_string(), name: name.to_string() }
    } else {
        Operation::RemoveFromParent { parent: parent.to_string(), name: name.to_string() }
    };
    send_parent_op(ctx, &owner, op, uid, gid);
}

fn send_parent_op(ctx: &NodeContext, owner: &Volcano, op: Operation, uid: u32, gid: u32) {
    let header = RequestHeader { optype: op.optype() as u8, ttl: TTL_TERMINAL, transaction_id: next_parent_tid(), uid, gid };
    let request = Request { header, op };
    let target = SocketAddr::V4(owner.address());
    let expected_tid = header.transaction_id;
    let result = ctx.node_transport.send_and_await(&request.encode(), target, |buf, _peer| {
        let mut r = crate::wire::Reader::new(buf);
        matches!(ResponseHeader::read(&mut r), Ok(h) if h.transaction_id == expected_tid)
    });
    if let Err(e) = result {
        tracing::debug!(target: "dispatcher", %target, error = %e, "parent fan-out request failed");
    }
}

fn enqueue_replicas(
    ctx: &NodeContext,
    lava: &crate::ring::Lava,
    owner_idx: usize,
    op: &Operation,
    header: &RequestHeader,
) {
    let red_idx = match crate::ring::redundant_owner(lava, owner_idx) {
        Ok(idx) => idx,
        Err(_) => return,
    };
    let red = lava.get(red_idx);
    if !ctx.is_self(red.ip, red.port) {
        enqueue_one(ctx, op, header, red.address());
    }
    if let Some(joining) = *ctx.joining_node.lock().expect("joining_node lock poisoned") {
        enqueue_one(ctx, op, header, joining);
    }
}

fn enqueue_one(ctx: &NodeContext, op: &Operation, header: &RequestHeader, target: SocketAddrV4) {
    let task = match op {
        Operation::Unlink { .. } | Operation::Rmdir { .. } | Operation::Truncate { .. } => {
            ReplicaTask::Forward {
                request: Request { header: header.forwarded(), op: op.clone() },
                target,
            }
        }
        _ => ReplicaTask::TransferObject { path: op.path().unwrap_or_default().to_string(), target },
    };
    ctx.replica_queue.enqueue(task);
}
