//! A single ring participant.

use crate::hash::Key;
use std::time::SystemTime;

/// A node record. The ring links nodes by index into a [`super::lava::Lava`]
/// arena rather than by pointer, so `prev`/`next`/`joining_node` are plain
/// `Option<usize>` offsets instead of a cyclic `Rc<RefCell<_>>` graph.
#[derive(Debug, Clone)]
pub struct Volcano {
    pub nickname: String,
    pub fqdn: String,
    pub ip: std::net::Ipv4Addr,
    pub port: u16,

    pub bandwidth: u64,
    pub storage: u64,
    pub free_storage: u64,
    pub total_keys: u64,

    pub alive: bool,
    pub load: f64,

    pub start_key: Key,
    pub stop_key: Key,

    /// Index of the neighbor with the next-lower start_key, wrapping.
    pub prev: Option<usize>,
    /// Index of the neighbor with the next-higher start_key, wrapping.
    pub next: Option<usize>,
    /// Set on the node coordinating this volcano's join while the new
    /// interval is still being streamed.
    pub joining_node: Option<usize>,

    pub last_access: SystemTime,
}

impl Volcano {
    /// A single-node bootstrap volcano owning the whole keyspace.
    pub fn bootstrap(nickname: String, fqdn: String, ip: std::net::Ipv4Addr, port: u16) -> Volcano {
        Volcano {
            nickname,
            fqdn,
            ip,
            port,
            bandwidth: 0,
            storage: 0,
            free_storage: 0,
            total_keys: 0,
            alive: true,
            load: 0.0,
            start_key: Key::min(),
            stop_key: Key::max(),
            prev: None,
            next: None,
            joining_node: None,
            last_access: SystemTime::now(),
        }
    }

    /// Whether `key` falls in this node's closed `[start_key, stop_key]`
    /// interval. The interval wraps when `start_key > stop_key`.
    pub fn owns(&self, key: &Key) -> bool {
        if self.start_key <= self.stop_key {
            *key >= self.start_key && *key <= self.stop_key
        } else {
            *key >= self.start_key || *key <= self.stop_key
        }
    }

    /// Two volcanoes are "equal" iff they share both interval endpoints.
    pub fn same_interval(&self, other: &Volcano) -> bool {
        self.start_key == other.start_key && self.stop_key == other.stop_key
    }

    pub fn address(&self) -> std::net::SocketAddrV4 {
        std::net::SocketAddrV4::new(self.ip, self.port)
    }
}
