//! Single-node ring creation: `--bootstrap` assigns the whole keyspace to
//! this node and seeds the root directory and the hidden DHT directory.

use crate::error::Result;
use crate::hash::Key;
use crate::ops::{handlers, NodeContext};
use crate::ring::{Lava, Volcano};
use std::net::Ipv4Addr;

pub fn bootstrap(ctx: &NodeContext, fqdn: &str, bandwidth: u64, storage: u64) -> Result<()> {
    let mut node = Volcano::bootstrap(ctx.nickname.clone(), fqdn.to_string(), ctx.node_ip, ctx.node_port);
    node.bandwidth = bandwidth;
    node.storage = storage;
    node.start_key = Key::min();
    node.stop_key = Key::max();

    ctx.ring.install(Lava::single(node.clone()));
    ctx.catalog.upsert_node(&node)?;

    handlers::init_root(ctx)?;
    handlers::mkdir(ctx, "/.dht", libc::S_IFDIR | 0o755, 0, 0)?;
    let (parent, name) = crate::path::split_parent("/.dht");
    handlers::add_to_parent(ctx, &parent, &name)?;
    Ok(())
}

pub fn is_loopback_bootstrap(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::flare::{FlareCache, GroupCache};
    use crate::replication::ReplicaQueue;
    use crate::ring::RingHandle;
    use crate::transport::{ResultCache, UdpTransport};
    use std::net::{SocketAddr, SocketAddrV4};
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
    fn bootstrap_creates_root_and_dht_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        bootstrap(&ctx, "a.example", 0, 0).unwrap();

        assert_eq!(ctx.ring.snapshot().participants(), 1);
        let root = handlers::getattr(&ctx, "/").unwrap();
        assert_eq!(root.mode & libc::S_IFMT, libc::S_IFDIR);
        let dht = handlers::getattr(&ctx, "/.dht").unwrap();
        assert_eq!(dht.mode & libc::S_IFMT, libc::S_IFDIR);
    }
}
