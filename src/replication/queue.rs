//! Replica queue: a single consumer thread executes replication tasks
//! against a target volcano, either via whole-object `transmit_key`
//! transfer or by re-forwarding the original request with a decremented
//! TTL. Because the queue may reorder relative to other clients' ops,
//! every task it runs is idempotent when keyed by `(peer, tid)` through
//! the result cache on the receiving side.

use crate::wire::Request;
use std::net::SocketAddrV4;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

/// Operations replicated by whole-object transfer rather than by
/// re-forwarding the request, per the per-operation contracts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaTask {
    /// mknod / mkdir / symlink / chmod / chown / utime / write: stream
    /// the object's current bytes and metadata to the target.
    TransferObject { path: String, target: SocketAddrV4 },
    /// unlink / rmdir / truncate: forward the original request, TTL
    /// already decremented by the caller.
    Forward { request: Request, target: SocketAddrV4 },
}

/// Spawns the single replication worker thread. `execute` performs one
/// task (talking to the target over UDP) and is expected to retry
/// internally via the transport's own send-and-await; a task that still
/// fails is logged and dropped rather than blocking the queue.
pub struct ReplicaQueue {
    sender: Sender<ReplicaTask>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ReplicaQueue {
    pub fn spawn<F>(execute: F) -> ReplicaQueue
    where
        F: Fn(ReplicaTask) + Send + 'static,
    {
        let (sender, receiver): (Sender<ReplicaTask>, Receiver<ReplicaTask>) = mpsc::channel();
        let worker = thread::spawn(move || {
            while let Ok(task) = receiver.recv() {
                execute(task);
            }
        });
        ReplicaQueue { sender, worker: Some(worker) }
    }

    pub fn enqueue(&self, task: ReplicaTask) {
        // The queue outliving its worker only happens during shutdown;
        // a dropped receiver just means the task is silently skipped.
        let _ = self.sender.send(task);
    }
}

impl Drop for ReplicaQueue {
    fn drop(&mut self) {
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tasks_are_executed_in_enqueue_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let queue = ReplicaQueue::spawn(move |task| {
            if let ReplicaTask::TransferObject { path, .. } = task {
                seen_clone.lock().unwrap().push(path);
            }
        });

        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 12001);
        for i in 0..5 {
            queue.enqueue(ReplicaTask::TransferObject { path: format!("/f{i}"), target });
        }
        drop(queue);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["/f0", "/f1", "/f2", "/f3", "/f4"]);
    }
}
