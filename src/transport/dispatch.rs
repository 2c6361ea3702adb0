//! Receiver loop plus a fixed worker pool: one thread drains a UDP socket
//! and hands `(peer, buffer)` to idle workers, which decode the request,
//! call the optype handler, and send back a single response datagram.

use super::udp::UdpTransport;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RECEIVER_POLL: Duration = Duration::from_millis(250);

/// A decoded unit of work: the raw datagram and who sent it. Decoding
/// happens in the worker, not the receiver, so a malformed datagram never
/// stalls the receive loop.
struct Job {
    buf: Vec<u8>,
    peer: SocketAddr,
}

/// Spawns a receiver thread and a fixed pool of worker threads. `handle`
/// is called with each datagram's bytes and sender; its return value, if
/// any, is sent back to `peer` on the same socket.
pub struct Dispatcher {
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    receiver: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn<F>(transport: Arc<UdpTransport>, worker_count: usize, handle: F) -> Dispatcher
    where
        F: Fn(&[u8], SocketAddr) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let handle = Arc::new(handle);
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(std::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count.max(1) {
            let rx = rx.clone();
            let transport = transport.clone();
            let handle = handle.clone();
            workers.push(thread::spawn(move || loop {
                let job = {
                    let rx = rx.lock().expect("dispatch queue poisoned");
                    rx.recv()
                };
                match job {
                    Ok(job) => {
                        if let Some(response) = handle(&job.buf, job.peer) {
                            let _ = transport.send_to(&response, job.peer);
                        }
                    }
                    Err(_) => break,
                }
            }));
        }

        let recv_transport = transport.clone();
        let recv_shutdown = shutdown.clone();
        let receiver = thread::spawn(move || {
            while !recv_shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                match recv_transport.recv_timeout(RECEIVER_POLL) {
                    Ok(Some((buf, peer))) => {
                        let _ = tx.send(Job { buf, peer });
                    }
                    Ok(None) => {}
                    Err(_) => break,
                }
            }
        });

        Dispatcher { shutdown, receiver: Some(receiver), workers }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(r) = self.receiver.take() {
            let _ = r.join();
        }
        // Workers block on `rx.recv()`, which only ever ends when every
        // sender (the receiver's `tx`) is dropped; joining here is
        // best-effort and is skipped at shutdown in favor of process exit.
        self.workers.clear();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loopback_any() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn dispatcher_answers_with_the_handler_response() {
        let server = Arc::new(UdpTransport::bind(loopback_any()).unwrap());
        let server_addr = server.local_addr().unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        let handled_clone = handled.clone();

        let mut dispatcher = Dispatcher::spawn(server, 2, move |buf, _peer| {
            handled_clone.fetch_add(1, Ordering::SeqCst);
            Some(buf.to_vec())
        });

        let client = UdpTransport::bind(loopback_any()).unwrap();
        let reply = client.send_and_await(b"echo", server_addr, |buf, _| buf == b"echo");
        assert_eq!(reply.unwrap(), b"echo");
        assert!(handled.load(Ordering::SeqCst) >= 1);
        dispatcher.stop();
    }
}
