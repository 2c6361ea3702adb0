//! Two-phase join: bulk topology transfer, interval assignment, and the
//! three-way handshake that installs the joiner into the ring.

use crate::dht_profile::NodeProfile;
use crate::error::{Error, Result};
use crate::hash::Key;
use crate::ops::NodeContext;
use crate::ring::{Lava, Volcano};
use crate::wire::{Operation, Request, RequestHeader, ResponseBody, ResponseHeader, TTL_DEFAULT};
use std::net::{SocketAddr, SocketAddrV4};

const TOPOLOGY_BATCH: usize = 32;
static NEXT_TID: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(1);

fn next_tid() -> u16 {
    loop {
        let v = NEXT_TID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if v != 0 {
            return v;
        }
    }
}

fn call(ctx: &NodeContext, target: SocketAddrV4, op: Operation) -> Result<(ResponseHeader, Vec<u8>)> {
    let header = RequestHeader { optype: op.optype() as u8, ttl: TTL_DEFAULT, transaction_id: next_tid(), uid: 0, gid: 0 };
    let request = Request { header, op };
    let expected_tid = header.transaction_id;
    let reply = ctx
        .node_transport
        .send_and_await(&request.encode(), SocketAddr::V4(target), |buf, _| {
            let mut r = crate::wire::Reader::new(buf);
            matches!(ResponseHeader::read(&mut r), Ok(h) if h.transaction_id == expected_tid)
        })
        .map_err(|_| Error::Membership("bootserver did not answer".to_string()))?;
    let mut r = crate::wire::Reader::new(&reply);
    let h = ResponseHeader::read(&mut r)?;
    Ok((h, reply))
}

/// Phase 1: pull the whole ring from `bootserver` in batches until the
/// "more waiting" flag clears.
pub fn transmit_topology(ctx: &NodeContext, bootserver: SocketAddrV4) -> Result<Vec<NodeProfile>> {
    let mut all = Vec::new();
    let mut offset = 0u32;
    loop {
        let (header, reply) = call(ctx, bootserver, Operation::TransmitTopology { offset })?;
        if !header.is_ok() {
            return Err(Error::Membership("transmit_topology failed".to_string()));
        }
        let mut r = crate::wire::Reader::new(&reply);
        let _ = ResponseHeader::read(&mut r)?;
        let body = crate::wire::decode_body(crate::wire::ResponseShape::TopologyChunk, &mut r)?;
        let ResponseBody::TopologyChunk { profiles, more } = body else {
            return Err(Error::Membership("malformed topology chunk".to_string()));
        };
        let count = profiles.len();
        for raw in profiles {
            let text = String::from_utf8(raw).map_err(|_| Error::Membership("non-utf8 profile".to_string()))?;
            let profile = NodeProfile::parse(&text).ok_or_else(|| Error::Membership("malformed profile".to_string()))?;
            all.push(profile);
        }
        offset += count as u32;
        if !more {
            break;
        }
    }
    Ok(all)
}

/// Phase 2: ask `bootserver` for an interval assignment.
pub fn join_network(ctx: &NodeContext, bootserver: SocketAddrV4, self_profile: &NodeProfile) -> Result<(Key, Key)> {
    let (header, reply) = call(ctx, bootserver, Operation::JoinNetwork { profile: self_profile.to_lines().into_bytes() })?;
    if !header.is_ok() {
        return Err(Error::Membership("join_network rejected (nickname/fqdn/address collision)".to_string()));
    }
    let mut r = crate::wire::Reader::new(&reply);
    let _ = ResponseHeader::read(&mut r)?;
    let body = crate::wire::decode_body(crate::wire::ResponseShape::Interval, &mut r)?;
    let ResponseBody::Interval { start_key, stop_key } = body else {
        return Err(Error::Membership("malformed interval response".to_string()));
    };
    Ok((
        Key::from_hex(&crate::hash::armour(&start_key)).expect("armoured hash is valid hex"),
        Key::from_hex(&crate::hash::armour(&stop_key)).expect("armoured hash is valid hex"),
    ))
}

/// Phase 3: tell `bootserver` to clone, insert, verify and install the
/// joiner, streaming the new node's keyspace in the process.
pub fn finish_join_network(ctx: &NodeContext, bootserver: SocketAddrV4, self_profile: &NodeProfile) -> Result<u32> {
    let (header, _reply) = call(
        ctx,
        bootserver,
        Operation::FinishJoinNetwork { profile: self_profile.to_lines().into_bytes(), participants: 0 },
    )?;
    if !header.is_ok() {
        return Err(Error::Membership("finish_join_network aborted".to_string()));
    }
    Ok(header.result.max(0) as u32)
}

/// Full client-side join sequence run by a node started with
/// `--bootserver`.
pub fn join(ctx: &NodeContext, bootserver: SocketAddrV4, self_profile: &NodeProfile) -> Result<()> {
    let profiles = transmit_topology(ctx, bootserver)?;
    let (start_key, stop_key) = join_network(ctx, bootserver, self_profile)?;

    let mut lava = Lava::empty();
    for p in &profiles {
        lava.insert_sorted(volcano_from_profile(p));
    }
    let mut joiner = volcano_from_profile(self_profile);
    joiner.start_key = start_key;
    joiner.stop_key = stop_key;
    lava.insert_sorted(joiner);
    lava.verify_partition()?;
    ctx.ring.install(lava);

    finish_join_network(ctx, bootserver, self_profile)?;
    Ok(())
}

fn volcano_from_profile(p: &NodeProfile) -> Volcano {
    Volcano {
        nickname: p.nickname.clone(),
        fqdn: p.fqdn.clone(),
        ip: p.ip,
        port: p.port,
        bandwidth: p.bandwidth,
        storage: p.storage,
        free_storage: 0,
        total_keys: 0,
        alive: true,
        load: p.load,
        start_key: Key::from_hex(&p.start_key).unwrap_or_else(Key::min),
        stop_key: Key::from_hex(&p.stop_key).unwrap_or_else(Key::max),
        prev: None,
        next: None,
        joining_node: None,
        last_access: std::time::SystemTime::now(),
    }
}

/// Server side of phase 1: serialize the ring starting at `offset`, in
/// batches of [`TOPOLOGY_BATCH`] profiles, with a "more waiting" flag.
pub fn transmit_topology_response(ctx: &NodeContext, offset: u32) -> (Vec<Vec<u8>>, bool) {
    let lava = ctx.ring.snapshot();
    let all: Vec<Vec<u8>> = lava
        .iter()
        .map(|(_, n)| NodeProfile::from_volcano(n).to_lines().into_bytes())
        .collect();
    let start = offset as usize;
    if start >= all.len() {
        return (Vec::new(), false);
    }
    let end = (start + TOPOLOGY_BATCH).min(all.len());
    let more = end < all.len();
    (all[start..end].to_vec(), more)
}

/// Server side of phase 2: validate no nickname/FQDN/(ip,port) collision,
/// then carve `[inc(max_used_key), self.stop_key]` off this node for the
/// joiner.
pub fn join_network_response(ctx: &NodeContext, profile: &NodeProfile) -> Result<(Key, Key)> {
    if profile.secretkey != ctx.secretkey {
        return Err(Error::Membership("secretkey does not match".to_string()));
    }
    let lava = ctx.ring.snapshot();
    if lava.find_by_nickname(&profile.nickname).is_some()
        || lava.find_by_fqdn(&profile.fqdn).is_some()
        || lava.find_by_address(profile.ip, profile.port).is_some()
    {
        return Err(Error::Membership("nickname, fqdn or address already in use".to_string()));
    }
    let max_idx = lava.max_used_key_index().ok_or_else(|| Error::Membership("empty ring".to_string()))?;
    let max_node = lava.get(max_idx);
    let new_start = max_node.stop_key.inc().ok_or_else(|| Error::Membership("ring is already full".to_string()))?;
    let self_idx = lava.find_by_address(ctx.node_ip, ctx.node_port).ok_or_else(|| Error::Membership("self not in ring".to_string()))?;
    let new_stop = lava.get(self_idx).stop_key.clone();
    Ok((new_start, new_stop))
}

/// Server side of phase 3: clone the ring, insert the joiner, verify the
/// split, stream the joiner's new keyspace to it, install, and persist.
/// Any mismatch leaves the live ring untouched.
pub fn finish_join_network_response(ctx: &NodeContext, profile: &NodeProfile) -> Result<u32> {
    let (new_start, new_stop) = join_network_response(ctx, profile)?;
    let expected_self_stop = new_start.dec().unwrap_or_else(Key::max);

    let mut clone = ctx.ring.snapshot();
    let mut joiner = volcano_from_profile(profile);
    joiner.start_key = new_start.clone();
    joiner.stop_key = new_stop;
    clone.insert_sorted(joiner);

    // Indices shift on insert; re-resolve both nodes by identity rather
    // than trusting indices captured before the insertion.
    let self_idx = clone
        .find_by_address(ctx.node_ip, ctx.node_port)
        .ok_or_else(|| Error::Membership("self not in ring".to_string()))?;
    let joiner_idx = clone
        .find_by_address(profile.ip, profile.port)
        .ok_or_else(|| Error::Membership("joiner vanished after insert".to_string()))?;

    if clone.get(self_idx).stop_key != *expected_self_stop.as_str() {
        return Err(Error::Membership("joiner's assigned interval does not narrow our own cleanly".to_string()));
    }
    clone.verify_partition()?;

    let joiner_stop = clone.get(joiner_idx).stop_key.clone();
    stream_keyspace(ctx, &new_start, &joiner_stop, clone.get(joiner_idx).address());

    let participants = clone.participants() as u32;
    ctx.catalog.upsert_node(clone.get(self_idx))?;
    ctx.catalog.upsert_node(clone.get(joiner_idx))?;
    ctx.ring.install(clone);
    Ok(participants)
}

/// Whether `key` falls in the closed `[start, stop]` interval, wrapping
/// the same way `Volcano::owns` does.
fn key_in_range(key: &Key, start: &Key, stop: &Key) -> bool {
    if start <= stop {
        key >= start && key <= stop
    } else {
        key >= start || key <= stop
    }
}

/// Stream every flare this node owns whose key now belongs to the
/// joiner's new `[start, stop]` interval, via the replica queue's
/// whole-object transfer path (the mechanism is the same `transmit_key`
/// primitive a per-op replica uses, just run once per key at join time).
/// The catalog has no start/stop_key index, so this is a linear scan over
/// every flare row, filtering by key membership.
fn stream_keyspace(ctx: &NodeContext, start: &Key, stop: &Key, target: SocketAddrV4) {
    let rows = match ctx.catalog.all_flares() {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!(target: "membership", error = %e, "could not read catalog for keyspace streaming");
            return;
        }
    };
    for row in rows {
        let Some(key) = Key::from_hex(&row.hash) else { continue };
        if key_in_range(&key, start, stop) {
            ctx.replica_queue.enqueue(crate::replication::ReplicaTask::TransferObject { path: row.path, target });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, FlareRow};
    use crate::flare::{FlareCache, GroupCache};
    use crate::ring::{Lava, RingHandle};
    use crate::transport::{ResultCache, UdpTransport};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::{Arc, Mutex};

    #[test]
    fn volcano_from_profile_preserves_interval() {
        let v = Volcano::bootstrap("a".to_string(), "a.example".to_string(), std::net::Ipv4Addr::LOCALHOST, 12001);
        let p = NodeProfile::from_volcano(&v);
        let back = volcano_from_profile(&p);
        assert_eq!(back.start_key, v.start_key);
        assert_eq!(back.stop_key, v.stop_key);
        assert_eq!(back.nickname, v.nickname);
    }

    #[test]
    fn key_in_range_handles_wraparound() {
        let lo = Key::from_hex(&"1".repeat(40)).unwrap();
        let hi = Key::from_hex(&"8".repeat(40)).unwrap();
        let mid = Key::from_hex(&"5".repeat(40)).unwrap();
        let outside = Key::from_hex(&"f".repeat(40)).unwrap();
        assert!(key_in_range(&mid, &lo, &hi));
        assert!(!key_in_range(&outside, &lo, &hi));
        // wrapped interval: hi..lo covers everything outside (lo, hi)
        assert!(key_in_range(&outside, &hi, &lo));
        assert!(!key_in_range(&mid, &hi, &lo));
    }

    fn test_context(seen: Arc<Mutex<Vec<String>>>) -> NodeContext {
        let transport =
            Arc::new(UdpTransport::bind(SocketAddr::V4(std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).unwrap());
        NodeContext {
            nickname: "a".to_string(),
            hashpath: std::path::PathBuf::from("/tmp"),
            node_ip: Ipv4Addr::LOCALHOST,
            node_port: 12001,
            secretkey: "s".to_string(),
            ring: RingHandle::new(Lava::empty()),
            cache: FlareCache::new(),
            catalog: Catalog::in_memory().unwrap(),
            groups: GroupCache::new(),
            result_cache: ResultCache::default(),
            replica_queue: crate::replication::ReplicaQueue::spawn(move |task| {
                if let crate::replication::ReplicaTask::TransferObject { path, .. } = task {
                    seen.lock().unwrap().push(path);
                }
            }),
            node_transport: transport,
            joining_node: Mutex::new(None),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    #[test]
    fn stream_keyspace_enqueues_only_keys_in_range() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ctx = test_context(seen.clone());
        let in_range = Key::from_hex(&"5".repeat(40)).unwrap();
        let out_of_range = Key::from_hex(&"e".repeat(40)).unwrap();
        ctx.catalog
            .insert_flare(&FlareRow {
                hash: in_range.as_str().to_string(),
                path: "/in".to_string(),
                flare_type: 1,
                uid: 0,
                gid: 0,
                commit_path: None,
                commit_time: None,
                commit_url: None,
            })
            .unwrap();
        ctx.catalog
            .insert_flare(&FlareRow {
                hash: out_of_range.as_str().to_string(),
                path: "/out".to_string(),
                flare_type: 1,
                uid: 0,
                gid: 0,
                commit_path: None,
                commit_time: None,
                commit_url: None,
            })
            .unwrap();
        let start = Key::from_hex(&"1".repeat(40)).unwrap();
        let stop = Key::from_hex(&"8".repeat(40)).unwrap();
        let target = std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, 12002);
        stream_keyspace(&ctx, &start, &stop, target);
        drop(ctx);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["/in".to_string()]);
    }
}
