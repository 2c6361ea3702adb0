//! The ring: an arena of volcanoes linked by index, swapped atomically.
//!
//! Exactly one lava exists process-wide, held behind an `RwLock` so readers
//! (routing) never block on writers (membership changes), and writers build
//! a full clone, mutate it, then swap it in rather than mutating live state
//! other threads may be routing against.

use super::volcano::Volcano;
use crate::error::{Error, Result};
use crate::hash::Key;
use std::sync::RwLock;

/// An arena of nodes plus the index of the lowest-`start_key` entry (the
/// ring has no true "first" node, but iteration needs a starting point).
#[derive(Debug, Clone, Default)]
pub struct Lava {
    nodes: Vec<Volcano>,
    first: Option<usize>,
}

impl Lava {
    pub fn empty() -> Lava {
        Lava { nodes: Vec::new(), first: None }
    }

    /// A single-node ring, as created at bootstrap.
    pub fn single(node: Volcano) -> Lava {
        Lava { nodes: vec![node], first: Some(0) }
    }

    pub fn participants(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, idx: usize) -> &Volcano {
        &self.nodes[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Volcano {
        &mut self.nodes[idx]
    }

    pub fn first_index(&self) -> Option<usize> {
        self.first
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Volcano)> {
        self.nodes.iter().enumerate()
    }

    pub fn find_by_nickname(&self, nickname: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.nickname == nickname)
    }

    pub fn find_by_fqdn(&self, fqdn: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.fqdn == fqdn)
    }

    pub fn find_by_address(&self, ip: std::net::Ipv4Addr, port: u16) -> Option<usize> {
        self.nodes.iter().position(|n| n.ip == ip && n.port == port)
    }

    /// The node with the highest `stop_key` currently in use.
    pub fn max_used_key_index(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| crate::hash::compare(a.stop_key.as_str(), b.stop_key.as_str()))
            .map(|(i, _)| i)
    }

    /// Insert `node` in sorted position by `start_key`, narrowing the
    /// predecessor's `stop_key` to `dec(node.start_key)` and relinking
    /// `prev`/`next` on both sides. Returns the new node's index.
    pub fn insert_sorted(&mut self, mut node: Volcano) -> usize {
        let insert_at = self
            .nodes
            .iter()
            .position(|n| crate::hash::compare(node.start_key.as_str(), n.start_key.as_str())
                == std::cmp::Ordering::Less)
            .unwrap_or(self.nodes.len());

        if self.nodes.is_empty() {
            self.nodes.push(node);
            self.first = Some(0);
            self.relink();
            return 0;
        }

        let pred_idx = if insert_at == 0 { self.nodes.len() - 1 } else { insert_at - 1 };
        if let Some(new_stop) = node.start_key.dec() {
            self.nodes[pred_idx].stop_key = new_stop;
        } else {
            self.nodes[pred_idx].stop_key = Key::max();
        }
        node.prev = None;
        node.next = None;
        self.nodes.insert(insert_at, node);
        self.relink();
        insert_at
    }

    /// Recompute every `prev`/`next` link and `first` from `start_key`
    /// order. Cheap relative to membership-change frequency and keeps the
    /// invariants trivially easy to re-establish after any mutation.
    fn relink(&mut self) {
        if self.nodes.is_empty() {
            self.first = None;
            return;
        }
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|&a, &b| {
            crate::hash::compare(self.nodes[a].start_key.as_str(), self.nodes[b].start_key.as_str())
        });
        let n = order.len();
        for pos in 0..n {
            let idx = order[pos];
            let prev = order[(pos + n - 1) % n];
            let next = order[(pos + 1) % n];
            self.nodes[idx].prev = Some(prev);
            self.nodes[idx].next = Some(next);
        }
        self.first = Some(order[0]);
    }

    /// Verify the whole-ring invariant: intervals partition `[0..0, f..f]`
    /// with no gap and no overlap when walked in `start_key` order.
    pub fn verify_partition(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Routing("empty ring".to_string()));
        }
        let mut order: Vec<&Volcano> = self.nodes.iter().collect();
        order.sort_by(|a, b| crate::hash::compare(a.start_key.as_str(), b.start_key.as_str()));

        if order.len() == 1 {
            let n = order[0];
            return if n.start_key == *Key::min().as_str() && n.stop_key == *Key::max().as_str() {
                Ok(())
            } else {
                Err(Error::Routing("single node does not own the whole ring".to_string()))
            };
        }

        for w in order.windows(2) {
            let expected = w[0].stop_key.inc().ok_or_else(|| {
                Error::Routing("non-wrapping node claims the top of the ring".to_string())
            })?;
            if expected != *w[1].start_key.as_str() {
                return Err(Error::Routing(format!(
                    "gap or overlap between {} and {}",
                    w[0].nickname, w[1].nickname
                )));
            }
        }
        let last = order.last().unwrap();
        let first = order.first().unwrap();
        let wrap_expected = last.stop_key.inc();
        let wraps_cleanly = match wrap_expected {
            Some(k) => k == *first.start_key.as_str(),
            None => first.start_key == *Key::min().as_str(),
        };
        if !wraps_cleanly {
            return Err(Error::Routing("ring does not wrap cleanly at f...f -> 0...0".to_string()));
        }
        Ok(())
    }
}

/// Process-wide holder for the current ring. Membership code builds a
/// clone via [`Lava::clone`], mutates the clone, calls [`RingHandle::install`],
/// and the old `Lava` is dropped once the last reader using it finishes.
pub struct RingHandle {
    inner: RwLock<Lava>,
}

impl RingHandle {
    pub fn new(lava: Lava) -> RingHandle {
        RingHandle { inner: RwLock::new(lava) }
    }

    pub fn snapshot(&self) -> Lava {
        self.inner.read().expect("lava lock poisoned").clone()
    }

    /// Atomically replace the ring. The old value is dropped when this
    /// returns and no other reader still holds it.
    pub fn install(&self, lava: Lava) {
        let mut guard = self.inner.write().expect("lava lock poisoned");
        *guard = lava;
    }

    pub fn with_read<T>(&self, f: impl FnOnce(&Lava) -> T) -> T {
        let guard = self.inner.read().expect("lava lock poisoned");
        f(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn node(nick: &str, start: &str, stop: &str) -> Volcano {
        Volcano {
            start_key: Key::from_hex(start).unwrap(),
            stop_key: Key::from_hex(stop).unwrap(),
            ..Volcano::bootstrap(nick.to_string(), format!("{nick}.example"), Ipv4Addr::LOCALHOST, 12001)
        }
    }

    #[test]
    fn single_node_owns_whole_ring() {
        let lava = Lava::single(Volcano::bootstrap(
            "a".into(),
            "a.example".into(),
            Ipv4Addr::LOCALHOST,
            12001,
        ));
        lava.verify_partition().unwrap();
    }

    #[test]
    fn insert_sorted_splits_the_predecessor_interval() {
        let mut lava = Lava::single(Volcano::bootstrap(
            "a".into(),
            "a.example".into(),
            Ipv4Addr::LOCALHOST,
            12001,
        ));
        let mid = Key::from_hex("8000000000000000000000000000000000000000").unwrap();
        let b = node("b", mid.as_str(), Key::max().as_str());
        lava.insert_sorted(b);
        lava.verify_partition().unwrap();
        assert_eq!(lava.participants(), 2);
    }

    #[test]
    fn relink_produces_a_consistent_cycle() {
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
        lava.verify_partition().unwrap();

        let a = lava.find_by_nickname("a").unwrap();
        let b = lava.find_by_nickname("b").unwrap();
        let c = lava.find_by_nickname("c").unwrap();
        assert_eq!(lava.get(a).next, Some(b));
        assert_eq!(lava.get(b).next, Some(c));
        assert_eq!(lava.get(c).next, Some(a));
        assert_eq!(lava.get(a).prev, Some(c));
    }

    #[test]
    fn verify_partition_rejects_a_gap() {
        let mut lava = Lava::empty();
        lava.insert_sorted(node(
            "a",
            "0000000000000000000000000000000000000000",
            "5555555555555555555555555555555555555555",
        ));
        lava.insert_sorted(node(
            "b",
            "6666666666666666666666666666666666666666",
            "ffffffffffffffffffffffffffffffffffffffff",
        ));
        assert!(lava.verify_partition().is_err());
    }

    #[test]
    fn ring_handle_install_replaces_snapshot() {
        let handle = RingHandle::new(Lava::single(Volcano::bootstrap(
            "a".into(),
            "a.example".into(),
            Ipv4Addr::LOCALHOST,
            12001,
        )));
        assert_eq!(handle.snapshot().participants(), 1);
        let mut next = handle.snapshot();
        next.insert_sorted(node(
            "b",
            "8000000000000000000000000000000000000000",
            "ffffffffffffffffffffffffffffffffffffffff",
        ));
        handle.install(next);
        assert_eq!(handle.snapshot().participants(), 2);
    }
}
