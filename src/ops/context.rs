//! Shared state every operation handler needs: this node's identity, the
//! ring, the flare cache and store, the catalog, the permission groups
//! cache, the result cache, and the replica queue.

use crate::catalog::Catalog;
use crate::flare::{FlareCache, GroupCache};
use crate::replication::ReplicaQueue;
use crate::ring::RingHandle;
use crate::transport::{ResultCache, UdpTransport};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct NodeContext {
    pub nickname: String,
    pub hashpath: PathBuf,
    pub node_ip: Ipv4Addr,
    pub node_port: u16,
    /// Shared secret compared by equality against a joiner's presented
    /// profile before `join_network` carves out an interval for it.
    pub secretkey: String,

    pub ring: RingHandle,
    pub cache: FlareCache,
    pub catalog: Catalog,
    pub groups: GroupCache,
    pub result_cache: ResultCache,
    pub replica_queue: ReplicaQueue,
    /// The inter-node UDP socket, used both to forward requests to an
    /// owner and by the replica queue to stream `transmit_key` chunks.
    pub node_transport: Arc<UdpTransport>,
    /// Set while this node is mid-join: the joining node also receives
    /// parent-add fan-out and replica tasks until the join completes.
    pub joining_node: std::sync::Mutex<Option<std::net::SocketAddrV4>>,
    /// Tripped by a local console `shutdown` or a received
    /// `Operation::Shutdown`; the main loop polls this to exit.
    pub shutdown: Arc<AtomicBool>,
}

impl NodeContext {
    pub fn is_self(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.node_ip == ip && self.node_port == port
    }
}
