//! Operator console: a TCP, line-oriented admin protocol, one thread per
//! connection, following the accept-loop shape `network/peer.rs` uses for
//! the inter-node TCP listener.

use crate::ops::{handlers, NodeContext};
use crate::wire::{Operation, Request, RequestHeader, TTL_DEFAULT};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// The reloadable filter layer `main.rs` installs at startup, held so
/// `debug on`/`debug off` can push a new directive string without
/// restarting the process.
pub type FilterReload = tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;

/// Named logging targets the `debug on`/`debug off` commands toggle, one
/// per subsystem module, replacing the source's static bitmask with a
/// runtime-checked set backed by a live `tracing_subscriber::EnvFilter`.
pub struct DebugTargets {
    enabled: Mutex<HashMap<&'static str, bool>>,
    reload: Mutex<Option<FilterReload>>,
}

const KNOWN_TARGETS: &[&str] =
    &["router", "transport", "dispatcher", "store", "membership", "balancer", "console"];

impl Default for DebugTargets {
    fn default() -> Self {
        DebugTargets {
            enabled: Mutex::new(KNOWN_TARGETS.iter().map(|t| (*t, false)).collect()),
            reload: Mutex::new(None),
        }
    }
}

impl DebugTargets {
    /// Wire the live filter handle in, once the subscriber is installed.
    pub fn attach_reload(&self, handle: FilterReload) {
        *self.reload.lock().expect("debug targets lock poisoned") = Some(handle);
    }

    pub fn set(&self, chan: &str, on: bool) -> bool {
        let changed = {
            let mut map = self.enabled.lock().expect("debug targets lock poisoned");
            match KNOWN_TARGETS.iter().find(|t| **t == chan) {
                Some(name) => {
                    map.insert(name, on);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.apply_filter();
        }
        changed
    }

    pub fn snapshot(&self) -> Vec<(&'static str, bool)> {
        let map = self.enabled.lock().expect("debug targets lock poisoned");
        KNOWN_TARGETS.iter().map(|t| (*t, map[t])).collect()
    }

    fn apply_filter(&self) {
        let directive = self.directive_string();
        let reload = self.reload.lock().expect("debug targets lock poisoned");
        if let Some(handle) = reload.as_ref() {
            let _ = handle.modify(|filter| {
                *filter = tracing_subscriber::EnvFilter::new(directive.clone());
            });
        }
    }

    fn directive_string(&self) -> String {
        let map = self.enabled.lock().expect("debug targets lock poisoned");
        let mut directives = vec!["info".to_string()];
        for target in KNOWN_TARGETS {
            if map[target] {
                directives.push(format!("{target}=debug"));
            }
        }
        directives.join(",")
    }
}

/// Spawns the console's accept loop in its own thread. Returns a handle
/// whose `Drop` stops accepting once the listening socket is closed.
pub struct Console {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Console {
    pub fn spawn(
        ctx: Arc<NodeContext>,
        bind: std::net::SocketAddr,
        debug_targets: Arc<DebugTargets>,
        node_shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<Console> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();

        let handle = thread::spawn(move || {
            tracing::info!(target: "console", %bind, "console listening");
            loop {
                if stop_clone.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, peer)) => {
                        tracing::debug!(target: "console", %peer, "console connection accepted");
                        let ctx = ctx.clone();
                        let debug_targets = debug_targets.clone();
                        let node_shutdown = node_shutdown.clone();
                        thread::spawn(move || {
                            if let Err(e) = serve(stream, &ctx, &debug_targets, &node_shutdown) {
                                tracing::debug!(target: "console", error = %e, "console connection ended");
                            }
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(std::time::Duration::from_millis(100));
                    }
                    Err(e) => {
                        tracing::warn!(target: "console", error = %e, "console accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Console { shutdown: stop, handle: Some(handle) })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(
    stream: TcpStream,
    ctx: &NodeContext,
    debug_targets: &DebugTargets,
    node_shutdown: &AtomicBool,
) -> std::io::Result<()> {
    let mut out = stream.try_clone()?;
    let reader = BufReader::new(stream);
    let mut cwd = String::from("/");

    write!(out, "magmad console ({})\n> ", ctx.nickname)?;
    out.flush()?;

    for line in reader.lines() {
        let line = line?;
        let reply = run_command(line.trim(), &mut cwd, ctx, debug_targets, node_shutdown);
        match reply {
            CommandOutcome::Text(text) => {
                writeln!(out, "{text}")?;
            }
            CommandOutcome::Close => {
                out.flush()?;
                return Ok(());
            }
        }
        write!(out, "> ")?;
        out.flush()?;
    }
    Ok(())
}

enum CommandOutcome {
    Text(String),
    Close,
}

fn resolve(cwd: &str, arg: &str) -> String {
    if arg.starts_with('/') {
        crate::path::simplify(arg)
    } else if cwd == "/" {
        crate::path::simplify(&format!("/{arg}"))
    } else {
        crate::path::simplify(&format!("{cwd}/{arg}"))
    }
}

fn run_command(
    line: &str,
    cwd: &mut String,
    ctx: &NodeContext,
    debug_targets: &DebugTargets,
    node_shutdown: &AtomicBool,
) -> CommandOutcome {
    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    let text = match cmd {
        "ls" => cmd_ls(ctx, &resolve(cwd, if rest.is_empty() { "." } else { rest })),
        "cd" => {
            if rest.is_empty() {
                "usage: cd <path>".to_string()
            } else {
                let target = resolve(cwd, rest);
                match handlers::getattr(ctx, &target) {
                    Ok(stat) if stat.mode & libc::S_IFMT == libc::S_IFDIR => {
                        *cwd = target;
                        format!("cwd is now {cwd}")
                    }
                    Ok(_) => format!("{target}: not a directory"),
                    Err(e) => format!("{target}: {e}"),
                }
            }
        }
        "pwd" => cwd.clone(),
        "cat" => cmd_cat(ctx, &resolve(cwd, rest)),
        "erase" => cmd_erase(ctx, &resolve(cwd, rest)),
        "inspect" => cmd_inspect(ctx, &resolve(cwd, rest)),
        "lava" => cmd_lava(ctx),
        "cache" if rest == "load" => format!("{} flares cached", ctx.cache.len()),
        "print" if rest == "cache" => format!("{} flares cached", ctx.cache.len()),
        "print" if rest == "acl" => "policy: AllowAll (POSIX mode bits only)".to_string(),
        "print" if rest == "debug" => cmd_print_debug(debug_targets),
        "debug" if rest.starts_with("on ") => cmd_debug_toggle(debug_targets, &rest[3..], true),
        "debug" if rest.starts_with("off ") => cmd_debug_toggle(debug_targets, &rest[4..], false),
        "shutdown" => {
            broadcast_shutdown(ctx);
            node_shutdown.store(true, Ordering::Relaxed);
            "shutting down".to_string()
        }
        "exit" | "quit" => return CommandOutcome::Close,
        "help" => HELP_TEXT.to_string(),
        "" => String::new(),
        other => format!("unknown command: {other} (try 'help')"),
    };
    CommandOutcome::Text(text)
}

const HELP_TEXT: &str = "ls <path>, cd <path>, pwd, cat <path>, erase <path>, inspect <path>, \
lava, cache load, print cache, print acl, print debug, debug on <chan>, debug off <chan>, \
shutdown, exit, quit, help";

fn cmd_ls(ctx: &NodeContext, path: &str) -> String {
    let entry = match ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog) {
        Ok(e) => e,
        Err(e) => return format!("{path}: {e}"),
    };
    let flare = entry.read().expect("flare lock poisoned");
    if !flare.is_directory() {
        return format!("{path}: not a directory");
    }
    let contents = flare.contents_path(&ctx.hashpath);
    drop(flare);
    match crate::flare::directory::load_body(&contents) {
        Ok(body) => crate::flare::directory::iter_entries(&body).collect::<Vec<_>>().join("  "),
        Err(e) => format!("{path}: {e}"),
    }
}

fn cmd_cat(ctx: &NodeContext, path: &str) -> String {
    const MAX_PREVIEW: u32 = 64 * 1024;
    match handlers::read(ctx, path, 0, MAX_PREVIEW, 0, 0) {
        Ok(data) => String::from_utf8_lossy(&data).into_owned(),
        Err(e) => format!("{path}: {e}"),
    }
}

fn cmd_erase(ctx: &NodeContext, path: &str) -> String {
    match handlers::getattr(ctx, path) {
        Ok(stat) if stat.mode & libc::S_IFMT == libc::S_IFDIR => match handlers::rmdir(ctx, path, 0, 0) {
            Ok(()) => format!("{path}: removed"),
            Err(e) => format!("{path}: {e}"),
        },
        Ok(_) => match handlers::unlink(ctx, path, 0, 0) {
            Ok(()) => format!("{path}: removed"),
            Err(e) => format!("{path}: {e}"),
        },
        Err(e) => format!("{path}: {e}"),
    }
}

fn cmd_inspect(ctx: &NodeContext, path: &str) -> String {
    match handlers::getattr(ctx, path) {
        Ok(stat) => format!(
            "path={path} mode={:o} uid={} gid={} size={} mtime={}",
            stat.mode, stat.uid, stat.gid, stat.size, stat.mtime
        ),
        Err(e) => format!("{path}: {e}"),
    }
}

/// Tell every other node to shut down too, mirroring
/// `membership::boot::broadcast_ready`'s best-effort, no-wait fan-out.
fn broadcast_shutdown(ctx: &NodeContext) {
    let lava = ctx.ring.snapshot();
    for (_, node) in lava.iter() {
        if ctx.is_self(node.ip, node.port) {
            continue;
        }
        let header = RequestHeader { optype: Operation::Shutdown.optype() as u8, ttl: TTL_DEFAULT, transaction_id: 1, uid: 0, gid: 0 };
        let request = Request { header, op: Operation::Shutdown };
        let _ = ctx.node_transport.send_to(&request.encode(), SocketAddr::V4(node.address()));
    }
}

fn cmd_lava(ctx: &NodeContext) -> String {
    let lava = ctx.ring.snapshot();
    let mut lines = Vec::new();
    for (_, node) in lava.iter() {
        lines.push(format!(
            "{}\t{}:{}\t[{}..{}]\talive={}",
            node.nickname, node.ip, node.port, node.start_key, node.stop_key, node.alive
        ));
    }
    lines.join("\n")
}

fn cmd_print_debug(debug_targets: &DebugTargets) -> String {
    debug_targets
        .snapshot()
        .into_iter()
        .map(|(name, on)| format!("{name}={on}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn cmd_debug_toggle(debug_targets: &DebugTargets, chan: &str, on: bool) -> String {
    let chan = chan.trim();
    if debug_targets.set(chan, on) {
        format!("{chan}: debug {}", if on { "on" } else { "off" })
    } else {
        format!("{chan}: unknown channel")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_handles_absolute_and_relative_paths() {
        assert_eq!(resolve("/", "a"), "/a");
        assert_eq!(resolve("/a", "b"), "/a/b");
        assert_eq!(resolve("/a", "/b"), "/b");
        assert_eq!(resolve("/a/b", ".."), "/a");
    }

    #[test]
    fn debug_targets_rejects_unknown_channel() {
        let targets = DebugTargets::default();
        assert!(!targets.set("not-a-real-channel", true));
        assert!(targets.set("router", true));
        assert!(targets.snapshot().iter().any(|(n, on)| *n == "router" && *on));
    }
}
