//! Key replication: the `transmit_key` whole-object transfer primitive
//! and the asynchronous single-consumer replica queue built on it.

pub mod keytransfer;
pub mod queue;

pub use keytransfer::{apply_chunk, chunks_for, KeyChunk};
pub use queue::{ReplicaQueue, ReplicaTask};

use crate::ops::NodeContext;
use crate::wire::{Operation, Reader, Request, RequestHeader, ResponseHeader, TTL_DEFAULT};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};

static NEXT_TID: AtomicU16 = AtomicU16::new(1);

fn next_tid() -> u16 {
    NEXT_TID.fetch_add(1, Ordering::Relaxed).max(1)
}

/// Runs one [`ReplicaTask`] to completion against its target, retrying
/// internally through the transport's own send-and-await. Failures are
/// logged and dropped rather than returned, so a bad target never blocks
/// the queue behind it.
pub fn execute(ctx: &NodeContext, task: ReplicaTask) {
    match task {
        ReplicaTask::TransferObject { path, target } => transfer_object(ctx, &path, target),
        ReplicaTask::Forward { request, target } => forward(ctx, &request, target),
    }
}

fn transfer_object(ctx: &NodeContext, path: &str, target: std::net::SocketAddrV4) {
    let entry = match ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(target: "replication", %path, error = %e, "transfer_object: flare lookup failed");
            return;
        }
    };
    let (mode, uid, gid, contents) = {
        let flare = entry.read().expect("flare lock poisoned");
        (flare.stat.mode, flare.stat.uid, flare.stat.gid, flare.contents_path(&ctx.hashpath))
    };
    let data = match std::fs::read(&contents) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(target: "replication", %path, error = %e, "transfer_object: read failed");
            return;
        }
    };

    for (offset, chunk) in chunks_for(&data) {
        let op = Operation::TransmitKey {
            path: path.to_string(),
            offset,
            mode,
            uid,
            gid,
            chunk: chunk.to_vec(),
        };
        if send_and_expect_ok(ctx, op, target).is_none() {
            tracing::warn!(target: "replication", %path, %offset, "transfer_object: chunk not acknowledged");
            return;
        }
    }

    if data.is_empty() {
        let op = Operation::TransmitKey { path: path.to_string(), offset: 0, mode, uid, gid, chunk: Vec::new() };
        if send_and_expect_ok(ctx, op, target).is_none() {
            tracing::warn!(target: "replication", %path, "transfer_object: empty-object chunk not acknowledged");
        }
    }
}

fn forward(ctx: &NodeContext, request: &Request, target: std::net::SocketAddrV4) {
    let path = request.op.path().unwrap_or_default().to_string();
    let expected_tid = request.header.transaction_id;
    let result = ctx.node_transport.send_and_await(
        &request.encode(),
        SocketAddr::V4(target),
        |buf, _peer| {
            let mut r = Reader::new(buf);
            matches!(ResponseHeader::read(&mut r), Ok(h) if h.transaction_id == expected_tid)
        },
    );
    if result.is_err() {
        tracing::warn!(target: "replication", %path, "forward: replica target did not answer");
    }
}

fn send_and_expect_ok(ctx: &NodeContext, op: Operation, target: std::net::SocketAddrV4) -> Option<()> {
    let header = RequestHeader { optype: op.optype() as u8, ttl: TTL_DEFAULT, transaction_id: next_tid(), uid: 0, gid: 0 };
    let request = Request { header, op };
    let expected_tid = header.transaction_id;
    let reply = ctx
        .node_transport
        .send_and_await(&request.encode(), SocketAddr::V4(target), |buf, _peer| {
            let mut r = Reader::new(buf);
            matches!(ResponseHeader::read(&mut r), Ok(h) if h.transaction_id == expected_tid)
        })
        .ok()?;
    let mut r = Reader::new(&reply);
    let resp = ResponseHeader::read(&mut r).ok()?;
    resp.is_ok().then_some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::flare::{FlareCache, GroupCache};
    use crate::ring::{Lava, RingHandle};
    use crate::transport::{ResultCache, UdpTransport};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::AtomicBool;
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

    /// Runs `receiver`'s membership dispatcher against its own transport
    /// until `stop` flips, answering transmit_key/forward requests the
    /// way a live node would.
    fn spawn_receiver(receiver: Arc<NodeContext>, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let Ok(Some((buf, peer))) = receiver.node_transport.recv_timeout(std::time::Duration::from_millis(50))
                else {
                    continue;
                };
                let Ok(request) = Request::decode(&buf) else { continue };
                let (resp_header, body) =
                    crate::membership::dispatch(&receiver, request.header.transaction_id, &request.op, peer);
                let mut w = crate::wire::Writer::new();
                resp_header.write(&mut w);
                body.write(&mut w);
                receiver.node_transport.send_to(&w.into_bytes(), peer).unwrap();
            }
        })
    }

    #[test]
    fn transfer_object_replicates_bytes_to_the_target() {
        let sender_dir = tempfile::tempdir().unwrap();
        let receiver_dir = tempfile::tempdir().unwrap();
        let sender = test_context(sender_dir.path());
        let receiver = Arc::new(test_context(receiver_dir.path()));
        let target = match receiver.node_transport.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };

        let entry = sender.cache.search_or_create("/f", &sender.hashpath, &sender.catalog).unwrap();
        {
            let mut flare = entry.write().unwrap();
            flare.ty = crate::flare::types::FlareType::Regular;
            flare.stat.mode = libc::S_IFREG | 0o644;
            crate::flare::store::save(&mut flare, &sender.hashpath, &sender.catalog, true).unwrap();
        }
        std::fs::write(entry.read().unwrap().contents_path(&sender.hashpath), b"replicated bytes").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_receiver(receiver.clone(), stop.clone());

        transfer_object(&sender, "/f", target);

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let received = receiver.cache.search_or_create("/f", &receiver.hashpath, &receiver.catalog).unwrap();
        let contents = received.read().unwrap().contents_path(&receiver.hashpath);
        assert_eq!(std::fs::read(&contents).unwrap(), b"replicated bytes");
    }

    #[test]
    fn next_tid_never_yields_zero() {
        for _ in 0..10 {
            assert_ne!(next_tid(), 0);
        }
    }
}
