//! The consistent-hash ring: volcano records, the lava arena that links
//! them, and the router built on top.

pub mod lava;
pub mod router;
pub mod volcano;

pub use lava::{Lava, RingHandle};
pub use router::{redundant_owner, route, route_path, route_with_redundant};
pub use volcano::Volcano;
