//! Coordinated boot from catalog: after loading the stored ring, the
//! node owning `hash("/.dht")` pings every peer and only proceeds once
//! everyone agrees on their catalog-recorded interval.

use crate::error::{Error, Result};
use crate::hash::Key;
use crate::ops::NodeContext;
use crate::ring::{route, Lava, Volcano};
use crate::wire::{Operation, Request, RequestHeader, ResponseHeader, TTL_DEFAULT};
use std::net::SocketAddr;

/// Rebuild a `Lava` from the catalog's persisted node rows.
pub fn load_ring_from_catalog(ctx: &NodeContext) -> Result<Lava> {
    let rows = ctx.catalog.load_nodes()?;
    if rows.is_empty() {
        return Err(Error::Membership("no node rows in catalog to boot from".to_string()));
    }
    let mut lava = Lava::empty();
    for row in rows {
        let ip: std::net::Ipv4Addr =
            row.ip.parse().map_err(|_| Error::Membership(format!("bad catalog ip {}", row.ip)))?;
        let start_key = Key::from_hex(&row.start_key)
            .ok_or_else(|| Error::Membership("bad catalog start_key".to_string()))?;
        let stop_key = Key::from_hex(&row.stop_key)
            .ok_or_else(|| Error::Membership("bad catalog stop_key".to_string()))?;
        lava.insert_sorted(Volcano {
            start_key,
            stop_key,
            bandwidth: row.bandwidth,
            storage: row.storage,
            ..Volcano::bootstrap(row.nickname, row.fqdn, ip, row.port)
        });
    }
    lava.verify_partition()?;
    Ok(lava)
}

/// Is this node the coordinator: does its interval contain `hash("/.dht")`?
pub fn is_coordinator(ctx: &NodeContext, lava: &Lava) -> Result<bool> {
    let idx = route(lava, &Key::of_path("/.dht"))?;
    let node = lava.get(idx);
    Ok(ctx.is_self(node.ip, node.port))
}

/// Ping every other node and require its reported interval to match the
/// catalog. Any mismatch aborts the boot.
pub fn verify_heartbeats(ctx: &NodeContext, lava: &Lava) -> Result<()> {
    for (_, node) in lava.iter() {
        if ctx.is_self(node.ip, node.port) {
            continue;
        }
        let header = RequestHeader { optype: Operation::Heartbeat.optype() as u8, ttl: TTL_DEFAULT, transaction_id: 1, uid: 0, gid: 0 };
        let request = Request { header, op: Operation::Heartbeat };
        let target = SocketAddr::V4(node.address());
        let reply = ctx
            .node_transport
            .send_and_await(&request.encode(), target, |buf, _| buf.len() >= 8)
            .map_err(|_| Error::Membership(format!("{} did not answer coordinated-boot heartbeat", node.nickname)))?;
        let mut r = crate::wire::Reader::new(&reply);
        let h = ResponseHeader::read(&mut r)?;
        if !h.is_ok() {
            return Err(Error::Membership(format!("{} reports a key mismatch on boot", node.nickname)));
        }
    }
    Ok(())
}

/// Broadcast `network_built(ready)` to every peer once all heartbeats
/// agree.
pub fn broadcast_ready(ctx: &NodeContext, lava: &Lava) {
    for (_, node) in lava.iter() {
        if ctx.is_self(node.ip, node.port) {
            continue;
        }
        let header = RequestHeader { optype: Operation::NetworkBuilt.optype() as u8, ttl: TTL_DEFAULT, transaction_id: 1, uid: 0, gid: 0 };
        let request = Request { header, op: Operation::NetworkBuilt };
        let _ = ctx.node_transport.send_to(&request.encode(), SocketAddr::V4(node.address()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_an_empty_catalog_is_a_membership_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = std::sync::Arc::new(
            crate::transport::UdpTransport::bind(SocketAddr::V4(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::LOCALHOST,
                0,
            )))
            .unwrap(),
        );
        let ctx = NodeContext {
            nickname: "a".to_string(),
            hashpath: dir.path().to_path_buf(),
            node_ip: std::net::Ipv4Addr::LOCALHOST,
            node_port: 12001,
            secretkey: "s".to_string(),
            ring: crate::ring::RingHandle::new(Lava::empty()),
            cache: crate::flare::FlareCache::new(),
            catalog: crate::catalog::Catalog::in_memory().unwrap(),
            groups: crate::flare::GroupCache::new(),
            result_cache: crate::transport::ResultCache::default(),
            replica_queue: crate::replication::ReplicaQueue::spawn(|_| {}),
            node_transport: transport,
            joining_node: std::sync::Mutex::new(None),
            shutdown: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        };
        assert!(load_ring_from_catalog(&ctx).is_err());
    }
}
