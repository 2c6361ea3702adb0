//! UDP transport: the socket wrapper, the receiver/worker-pool dispatcher,
//! and the operation-result dedup cache.

pub mod dispatch;
pub mod resultcache;
pub mod udp;

pub use dispatch::Dispatcher;
pub use resultcache::{CachedResult, ResultCache, ResultKey};
pub use udp::{UdpTransport, AGAIN_LIMIT, MAX_DATAGRAM, RETRY_LIMIT, RW_CHUNK};
