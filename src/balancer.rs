//! Periodic load/liveness refresh. Runs in its own thread, waking every
//! [`CHECK_LOAD_TIMEOUT`]: refreshes `total_keys` from the catalog,
//! `free_storage`/`storage` from `statfs`, heartbeats every peer when the
//! ring has more than one node, and persists this node's profile row.
//!
//! Load redistribution is not performed here (per the balancer's scope):
//! the log-scaled load metric is computed and logged, matching the
//! source's disabled rebalancing branches.

use crate::ops::{handlers, NodeContext};
use crate::wire::{Operation, Request, RequestHeader, ResponseHeader, TTL_DEFAULT};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const CHECK_LOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// A log-scaled load figure: heavier nodes (more keys relative to
/// storage) report a higher number. Not acted upon, only reported.
pub fn compute_load(total_keys: u64, storage: u64) -> f64 {
    if storage == 0 {
        return 0.0;
    }
    let density = (total_keys as f64 + 1.0) / (storage as f64 + 1.0);
    density.ln().max(0.0)
}

/// One balancer tick: refresh self's figures, heartbeat peers, persist.
pub fn tick(ctx: &NodeContext) {
    let lava = ctx.ring.snapshot();
    let Some(idx) = lava.find_by_address(ctx.node_ip, ctx.node_port) else {
        tracing::warn!(target: "balancer", "self not found in the live ring, skipping tick");
        return;
    };

    let total_keys = ctx.catalog.flare_count().unwrap_or_else(|e| {
        tracing::warn!(target: "balancer", error = %e, "failed to refresh total_keys");
        lava.get(idx).total_keys
    });

    let (free_storage, storage) = match handlers::statfs(ctx) {
        Ok(s) => (s.bfree * s.bsize as u64, s.blocks * s.bsize as u64),
        Err(e) => {
            tracing::warn!(target: "balancer", error = %e, "statfs failed");
            (lava.get(idx).free_storage, lava.get(idx).storage)
        }
    };

    let mut mine = lava.get(idx).clone();
    mine.total_keys = total_keys;
    mine.free_storage = free_storage;
    mine.storage = storage;
    mine.load = compute_load(total_keys, storage);
    tracing::debug!(target: "balancer", keys = total_keys, storage, load = mine.load, "refreshed self");

    if lava.participants() > 1 {
        heartbeat_peers(ctx, &lava);
    }

    if let Err(e) = ctx.catalog.upsert_node(&mine) {
        tracing::warn!(target: "balancer", error = %e, "failed to persist node profile");
    }
}

fn heartbeat_peers(ctx: &NodeContext, lava: &crate::ring::Lava) {
    for (_, node) in lava.iter() {
        if ctx.is_self(node.ip, node.port) {
            continue;
        }
        let header = RequestHeader { optype: Operation::Heartbeat.optype() as u8, ttl: TTL_DEFAULT, transaction_id: 1, uid: 0, gid: 0 };
        let request = Request { header, op: Operation::Heartbeat };
        let reply = ctx.node_transport.send_and_await(&request.encode(), SocketAddr::V4(node.address()), |buf, _| {
            let mut r = crate::wire::Reader::new(buf);
            ResponseHeader::read(&mut r).is_ok()
        });
        if reply.is_err() {
            tracing::warn!(target: "balancer", peer = %node.nickname, "heartbeat did not answer");
        }
    }
}

/// Spawns the balancer loop thread. Ticks immediately, then every
/// [`CHECK_LOAD_TIMEOUT`], until `stop` is called.
pub struct Balancer {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Balancer {
    pub fn spawn(ctx: Arc<NodeContext>) -> Balancer {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop_flag = shutdown.clone();
        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                tick(&ctx);
                let mut waited = Duration::ZERO;
                while waited < CHECK_LOAD_TIMEOUT {
                    if stop_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    let step = Duration::from_millis(200).min(CHECK_LOAD_TIMEOUT - waited);
                    std::thread::sleep(step);
                    waited += step;
                }
            }
        });
        Balancer { shutdown, handle: Some(handle) }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_is_zero_for_an_empty_store() {
        assert_eq!(compute_load(0, 1_000_000), 0.0);
    }

    #[test]
    fn load_increases_with_key_density() {
        let light = compute_load(10, 1_000_000);
        let heavy = compute_load(900_000, 1_000_000);
        assert!(heavy > light);
    }

    #[test]
    fn load_never_goes_negative() {
        assert!(compute_load(0, 1) >= 0.0);
    }
}
