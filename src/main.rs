//! `magmad`: the ring-node daemon. Parses `Cli` into a validated `Config`,
//! builds this node's [`NodeContext`], bootstraps or joins the ring,
//! then serves the client and node UDP protocols alongside the operator
//! console and balancer loop until asked to shut down.

use clap::Parser;
use magmad::config::{Cli, Config, JoinMode};
use magmad::console::{Console, DebugTargets};
use magmad::dht_profile::NodeProfile;
use magmad::ops::NodeContext;
use magmad::replication::ReplicaQueue;
use magmad::ring::{Lava, RingHandle};
use magmad::transport::{Dispatcher, ResultCache, UdpTransport};
use magmad::wire::{Optype, Request, ResponseBody, ResponseHeader, Writer};
use magmad::{balancer::Balancer, catalog::Catalog, membership};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const WORKER_COUNT: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("magmad: {e}");
            std::process::exit(1);
        }
    };

    let debug_targets = Arc::new(DebugTargets::default());
    for chan in &config.debug_channels {
        debug_targets.set(chan, true);
    }
    let (filter_layer, reload_handle) = tracing_subscriber::reload::Layer::new(
        tracing_subscriber::EnvFilter::new(debug_directive(&config.debug_channels)),
    );
    tracing_subscriber::registry().with(filter_layer).with(tracing_subscriber::fmt::layer()).init();
    debug_targets.attach_reload(reload_handle);

    if let Err(e) = std::fs::create_dir_all(&config.hashpath) {
        error!("failed to create hashpath {:?}: {e}", config.hashpath);
        std::process::exit(1);
    }

    let catalog = match Catalog::open(&config.hashpath.join("catalog.sqlite3")) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to open catalog: {e}");
            std::process::exit(1);
        }
    };

    let client_addr = SocketAddr::V4(SocketAddrV4::new(config.ip, config.client_port));
    let node_addr = SocketAddr::V4(SocketAddrV4::new(config.ip, config.node_port));
    let console_addr = SocketAddr::V4(SocketAddrV4::new(config.ip, config.console_port));

    let client_transport = match UdpTransport::bind(client_addr) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("failed to bind client port {client_addr}: {e}");
            std::process::exit(1);
        }
    };
    let node_transport = match UdpTransport::bind(node_addr) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("failed to bind node port {node_addr}: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));

    // `ReplicaQueue`'s worker needs a handle to the very `NodeContext` it
    // is a field of; `new_cyclic` hands the closure a `Weak` it upgrades
    // at task time, rather than requiring the context to already exist.
    let ctx = Arc::new_cyclic(|weak: &Weak<NodeContext>| {
        let weak = weak.clone();
        let replica_queue = ReplicaQueue::spawn(move |task| {
            if let Some(ctx) = weak.upgrade() {
                magmad::replication::execute(&ctx, task);
            }
        });
        NodeContext {
            nickname: config.nickname.clone(),
            hashpath: config.hashpath.clone(),
            node_ip: config.ip,
            node_port: config.node_port,
            secretkey: config.secretkey.clone(),
            ring: RingHandle::new(Lava::empty()),
            cache: magmad::flare::FlareCache::new(),
            catalog,
            groups: magmad::flare::GroupCache::new(),
            result_cache: ResultCache::default(),
            replica_queue,
            node_transport: node_transport.clone(),
            joining_node: Mutex::new(None),
            shutdown: shutdown.clone(),
        }
    });

    match &config.join {
        JoinMode::Bootstrap => {
            if let Err(e) = membership::bootstrap(&ctx, &config.fqdn, config.bandwidth, config.storage) {
                error!("bootstrap failed: {e}");
                std::process::exit(1);
            }
            info!(nickname = %config.nickname, "bootstrapped a new ring");
        }
        JoinMode::Join(bootserver) => {
            let profile = NodeProfile {
                nickname: config.nickname.clone(),
                fqdn: config.fqdn.clone(),
                ip: config.ip,
                port: config.node_port,
                bandwidth: config.bandwidth,
                storage: config.storage,
                start_key: String::new(),
                stop_key: String::new(),
                secretkey: config.secretkey.clone(),
            };
            if let Err(e) = membership::join(&ctx, *bootserver, &profile) {
                error!("join failed: {e}");
                std::process::exit(1);
            }
            info!(nickname = %config.nickname, %bootserver, "joined the ring");
        }
    }

    let lava = ctx.ring.snapshot();
    match membership::is_coordinator(&ctx, &lava) {
        Ok(true) => {
            if let Err(e) = membership::verify_heartbeats(&ctx, &lava) {
                error!("coordinated boot failed: {e}");
                std::process::exit(1);
            }
            membership::broadcast_ready(&ctx, &lava);
            info!("coordinated boot verified, ring is ready");
        }
        Ok(false) => {}
        Err(e) => {
            error!("failed to determine boot coordinator: {e}");
            std::process::exit(1);
        }
    }

    let mut client_dispatcher = Dispatcher::spawn(client_transport, WORKER_COUNT, {
        let ctx = ctx.clone();
        move |buf, peer| Some(handle_request(&ctx, buf, peer))
    });
    let mut node_dispatcher = Dispatcher::spawn(node_transport.clone(), WORKER_COUNT, {
        let ctx = ctx.clone();
        move |buf, peer| Some(handle_request(&ctx, buf, peer))
    });

    let mut console = match Console::spawn(ctx.clone(), console_addr, debug_targets.clone(), shutdown.clone()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to bind console port {console_addr}: {e}");
            std::process::exit(1);
        }
    };
    let mut balancer = Balancer::spawn(ctx.clone());

    let ctrlc_shutdown = shutdown.clone();
    if let Err(e) =
        ctrlc::set_handler(move || { ctrlc_shutdown.store(true, Ordering::SeqCst); })
    {
        error!("failed to install signal handler: {e}");
        std::process::exit(1);
    }

    info!(nickname = %config.nickname, %client_addr, %node_addr, %console_addr, "magmad is running");
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(POLL_INTERVAL);
    }

    info!("shutting down");
    balancer.stop();
    console.stop();
    client_dispatcher.stop();
    node_dispatcher.stop();
}

fn debug_directive(channels: &[String]) -> String {
    let mut directives = vec!["info".to_string()];
    for chan in channels {
        directives.push(format!("{chan}=debug"));
    }
    directives.join(",")
}

/// Optypes 18-24: membership and replication, answered outside the
/// owner/forward/replicate POSIX contract.
fn is_membership_optype(optype: Optype) -> bool {
    matches!(
        optype,
        Optype::TransmitTopology
            | Optype::JoinNetwork
            | Optype::FinishJoinNetwork
            | Optype::TransmitKey
            | Optype::Heartbeat
            | Optype::NetworkBuilt
            | Optype::Shutdown
    )
}

fn handle_request(ctx: &NodeContext, buf: &[u8], peer: SocketAddr) -> Vec<u8> {
    let request = match Request::decode(buf) {
        Ok(r) => r,
        Err(_) => return encode_response(ResponseHeader::err(libc::EINVAL, 0), ResponseBody::None),
    };
    let optype = request.op.optype();
    let (header, body) = if is_membership_optype(optype) {
        membership::dispatch(ctx, request.header.transaction_id, &request.op, peer)
    } else {
        magmad::ops::dispatch(ctx, request.header, &request.op, peer)
    };
    encode_response(header, body)
}

fn encode_response(header: ResponseHeader, body: ResponseBody) -> Vec<u8> {
    let mut w = Writer::new();
    header.write(&mut w);
    body.write(&mut w);
    w.into_bytes()
}
