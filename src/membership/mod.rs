//! Membership: bootstrap, two-phase join, coordinated boot from catalog,
//! and the server side of the membership/replication optypes that sit
//! outside the POSIX dispatch contract in [`crate::ops::dispatch`].

pub mod boot;
pub mod bootstrap;
pub mod join;

pub use boot::{broadcast_ready, is_coordinator, load_ring_from_catalog, verify_heartbeats};
pub use bootstrap::{bootstrap, is_loopback_bootstrap};
pub use join::{finish_join_network, join, join_network, transmit_topology};

use crate::error::Error;
use crate::ops::NodeContext;
use crate::wire::{Operation, ResponseBody, ResponseHeader};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::net::SocketAddr;

/// Server-side entry point for every optype `ops::dispatch::dispatch`
/// declines to handle. Like that dispatcher, this one never forwards:
/// membership requests are answered by whoever receives them.
pub fn dispatch(ctx: &NodeContext, tid: u16, op: &Operation, _peer: SocketAddr) -> (ResponseHeader, ResponseBody) {
    match op {
        Operation::TransmitTopology { offset } => {
            let (profiles, more) = join::transmit_topology_response(ctx, *offset);
            (ResponseHeader::ok(profiles.len() as i32, tid), ResponseBody::TopologyChunk { profiles, more })
        }
        Operation::JoinNetwork { profile } => answer_join_network(ctx, tid, profile),
        Operation::FinishJoinNetwork { profile, .. } => answer_finish_join_network(ctx, tid, profile),
        Operation::TransmitKey { path, offset, mode, uid, gid, chunk } => {
            answer_transmit_key(ctx, tid, path, *offset, *mode, *uid, *gid, chunk)
        }
        Operation::Heartbeat => answer_heartbeat(ctx, tid),
        Operation::NetworkBuilt => {
            *ctx.joining_node.lock().expect("joining_node lock poisoned") = None;
            (ResponseHeader::ok(0, tid), ResponseBody::None)
        }
        Operation::Shutdown => {
            ctx.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
            (ResponseHeader::ok(0, tid), ResponseBody::None)
        }
        _ => (ResponseHeader::err(libc::EIO, tid), ResponseBody::None),
    }
}

fn answer_join_network(ctx: &NodeContext, tid: u16, profile: &[u8]) -> (ResponseHeader, ResponseBody) {
    let text = match std::str::from_utf8(profile) {
        Ok(t) => t,
        Err(_) => return (ResponseHeader::err(libc::EINVAL, tid), ResponseBody::None),
    };
    let Some(parsed) = crate::dht_profile::NodeProfile::parse(text) else {
        return (ResponseHeader::err(libc::EINVAL, tid), ResponseBody::None);
    };
    match join::join_network_response(ctx, &parsed) {
        Ok((start, stop)) => {
            *ctx.joining_node.lock().expect("joining_node lock poisoned") =
                Some(std::net::SocketAddrV4::new(parsed.ip, parsed.port));
            (
                ResponseHeader::ok(0, tid),
                ResponseBody::Interval { start_key: start.to_bytes(), stop_key: stop.to_bytes() },
            )
        }
        Err(_) => (ResponseHeader::err(libc::EEXIST, tid), ResponseBody::None),
    }
}

fn answer_finish_join_network(ctx: &NodeContext, tid: u16, profile: &[u8]) -> (ResponseHeader, ResponseBody) {
    let text = match std::str::from_utf8(profile) {
        Ok(t) => t,
        Err(_) => return (ResponseHeader::err(libc::EINVAL, tid), ResponseBody::None),
    };
    let Some(parsed) = crate::dht_profile::NodeProfile::parse(text) else {
        return (ResponseHeader::err(libc::EINVAL, tid), ResponseBody::None);
    };
    match join::finish_join_network_response(ctx, &parsed) {
        Ok(participants) => {
            *ctx.joining_node.lock().expect("joining_node lock poisoned") = None;
            (ResponseHeader::ok(participants as i32, tid), ResponseBody::None)
        }
        Err(_) => (ResponseHeader::err(libc::EIO, tid), ResponseBody::None),
    }
}

/// Apply one `transmit_key` chunk: write `chunk` at `offset` into the
/// target path's contents, upcasting the flare's type from `mode` on the
/// first chunk, and answer with the offset to resume from.
fn answer_transmit_key(
    ctx: &NodeContext,
    tid: u16,
    path: &str,
    offset: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    chunk: &[u8],
) -> (ResponseHeader, ResponseBody) {
    let result = (|| -> crate::error::Result<u64> {
        let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
        let mut flare = entry.write().expect("flare lock poisoned");
        let key_chunk = crate::replication::KeyChunk {
            path: path.to_string(),
            offset,
            mode,
            uid,
            gid,
            chunk: chunk.to_vec(),
        };
        let (first_time, new_offset) = crate::replication::apply_chunk(&mut flare, &key_chunk);
        crate::flare::store::init(&flare, &ctx.hashpath)?;
        let contents = flare.contents_path(&ctx.hashpath);
        let mut file = OpenOptions::new().write(true).open(&contents)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(chunk)?;
        file.sync_data()?;
        flare.touch();
        crate::flare::store::save(&mut flare, &ctx.hashpath, &ctx.catalog, first_time)?;
        Ok(new_offset)
    })();
    match result {
        Ok(new_offset) => (ResponseHeader::ok(0, tid), ResponseBody::NextOffset(new_offset)),
        Err(e) => (ResponseHeader::err(e.to_errno(), tid), ResponseBody::None),
    }
}

/// Answer a coordinated-boot heartbeat: ok only if this node's live
/// ring still agrees with what the catalog recorded at boot.
fn answer_heartbeat(ctx: &NodeContext, tid: u16) -> (ResponseHeader, ResponseBody) {
    let live = ctx.ring.snapshot();
    let idx = match live.find_by_address(ctx.node_ip, ctx.node_port) {
        Some(idx) => idx,
        None => return (ResponseHeader::err(libc::EIO, tid), ResponseBody::None),
    };
    let recorded = match load_ring_from_catalog(ctx) {
        Ok(lava) => lava,
        Err(_) => return (ResponseHeader::err(libc::EIO, tid), ResponseBody::None),
    };
    let Some(recorded_idx) = recorded.find_by_address(ctx.node_ip, ctx.node_port) else {
        return (ResponseHeader::err(libc::EIO, tid), ResponseBody::None);
    };
    let node = live.get(idx);
    let catalog_node = recorded.get(recorded_idx);
    if node.start_key == catalog_node.start_key && node.stop_key == catalog_node.stop_key {
        (ResponseHeader::ok(0, tid), ResponseBody::None)
    } else {
        (ResponseHeader::err(Error::Membership("interval mismatch".to_string()).to_errno(), tid), ResponseBody::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::flare::{FlareCache, GroupCache};
    use crate::replication::ReplicaQueue;
    use crate::ring::{Lava, RingHandle};
    use crate::transport::{ResultCache, UdpTransport};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::{Arc, Mutex};

    fn test_context(dir: &std::path::Path) -> NodeContext {
        let transport =
            Arc::new(UdpTransport::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).unwrap());
        NodeContext {
            nickname: "a".to_string(),
            hashpath: dir.to_path_buf(),
            node_ip: Ipv4Addr::LOCALHOST,
            node_port: 12001,
            secretkey: "s".to_string(),
            ring: RingHandle::new(Lava::empty()),
            cache: FlareCache::new(),
            catalog: Catalog::in_memory().unwrap(),
            groups: GroupCache::new(),
            result_cache: ResultCache::default(),
            replica_queue: ReplicaQueue::spawn(|_| {}),
            node_transport: transport,
            joining_node: Mutex::new(None),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    #[test]
    fn transmit_key_writes_bytes_and_reports_next_offset() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (header, body) = answer_transmit_key(&ctx, 1, "/f", 0, libc::S_IFREG | 0o644, 0, 0, b"hello");
        assert!(header.is_ok());
        assert_eq!(body, ResponseBody::NextOffset(5));

        let entry = ctx.cache.search_or_create("/f", &ctx.hashpath, &ctx.catalog).unwrap();
        let contents = entry.read().unwrap().contents_path(&ctx.hashpath);
        assert_eq!(std::fs::read(&contents).unwrap(), b"hello");
    }

    #[test]
    fn network_built_clears_joining_node() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        *ctx.joining_node.lock().unwrap() = Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 12002));
        let (header, _) = dispatch(&ctx, 1, &Operation::NetworkBuilt, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 12002)));
        assert!(header.is_ok());
        assert!(ctx.joining_node.lock().unwrap().is_none());
    }

    #[test]
    fn shutdown_trips_the_local_flag() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (header, _) = dispatch(&ctx, 1, &Operation::Shutdown, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 12002)));
        assert!(header.is_ok());
        assert!(ctx.shutdown.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[test]
    fn heartbeat_fails_when_self_is_not_in_the_live_ring() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let (header, _) = answer_heartbeat(&ctx, 1);
        assert!(!header.is_ok());
    }
}
