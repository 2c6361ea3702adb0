//! `route(path)`: find the volcano whose interval owns `hash(path)`.

use super::lava::Lava;
use super::volcano::Volcano;
use crate::error::{Error, Result};
use crate::hash::Key;

/// The node that owns `key`, found by a linear scan from the ring's first
/// node. The source recurses toward `prev`/`next` from an arbitrary
/// starting node; a full ring is small enough in practice (low hundreds
/// of volcanoes) that a direct scan is simpler and just as correct.
pub fn route(lava: &Lava, key: &Key) -> Result<usize> {
    if lava.participants() == 0 {
        return Err(Error::Routing("no volcano owns any key: ring is empty".to_string()));
    }
    lava.iter()
        .find(|(_, node)| node.owns(key))
        .map(|(idx, _)| idx)
        .ok_or_else(|| Error::Routing(format!("no volcano interval contains key {key}")))
}

pub fn route_path(lava: &Lava, path: &str) -> Result<usize> {
    route(lava, &Key::of_path(path))
}

/// The redundant owner: `owner.next`, wrapping to the ring's first node
/// (which is the same thing once the ring is a proper cycle).
pub fn redundant_owner(lava: &Lava, owner_idx: usize) -> Result<usize> {
    lava.get(owner_idx)
        .next
        .or_else(|| lava.first_index())
        .ok_or_else(|| Error::Routing("no redundant owner in an empty ring".to_string()))
}

/// Convenience: resolve both the owner and the redundant owner for `key`
/// in one call, as every per-operation handler needs both.
pub fn route_with_redundant<'a>(
    lava: &'a Lava,
    key: &Key,
) -> Result<(usize, &'a Volcano, usize, &'a Volcano)> {
    let owner_idx = route(lava, key)?;
    let red_idx = redundant_owner(lava, owner_idx)?;
    Ok((owner_idx, lava.get(owner_idx), red_idx, lava.get(red_idx)))
}

#[cfg(test)]
mod tests {
    use super::super::volcano::Volcano;
    use super::*;
    use std::net::Ipv4Addr;

    fn node(nick: &str, start: &str, stop: &str) -> Volcano {
        Volcano {
            start_key: Key::from_hex(start).unwrap(),
            stop_key: Key::from_hex(stop).unwrap(),
            ..Volcano::bootstrap(nick.to_string(), format!("{nick}.example"), Ipv4Addr::LOCALHOST, 12001)
        }
    }

    fn three_node_ring() -> Lava {
        let mut lava = Lava::empty();
        lava.insert_sorted(node(
            "a",
            "0000000000000000000000000000000000000000",
            "5555555555555555555555555555555555555555",
        ));
        lava.insert_sorted(node(
            "b",
            "5555555555555555555555555555555555555556",
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        ));
        lava.insert_sorted(node(
            "c",
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab",
            "ffffffffffffffffffffffffffffffffffffffff",
        ));
        lava
    }

    #[test]
    fn routing_is_total_over_the_whole_keyspace() {
        let lava = three_node_ring();
        for path in ["/a", "/b/c", "/deeply/nested/path", "/", "/.dht/node-a"] {
            let idx = route_path(&lava, path).unwrap();
            assert!(lava.get(idx).owns(&Key::of_path(path)));
        }
    }

    #[test]
    fn routing_endpoints_resolve_to_their_owning_node() {
        let lava = three_node_ring();
        let a = lava.find_by_nickname("a").unwrap();
        assert_eq!(route(&lava, &Key::min()).unwrap(), a);
        let c = lava.find_by_nickname("c").unwrap();
        assert_eq!(route(&lava, &Key::max()).unwrap(), c);
    }

    #[test]
    fn redundant_owner_wraps_from_last_to_first() {
        let lava = three_node_ring();
        let c = lava.find_by_nickname("c").unwrap();
        let a = lava.find_by_nickname("a").unwrap();
        assert_eq!(redundant_owner(&lava, c).unwrap(), a);
    }

    #[test]
    fn route_on_empty_ring_is_a_routing_error() {
        let lava = Lava::empty();
        assert!(route(&lava, &Key::min()).is_err());
    }
}
