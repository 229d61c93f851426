//! Common test utilities.
//!
//! An in-process mock server speaking enough RESP2 (and optionally the
//! `HELLO` handshake) to exercise the client end-to-end: strings, watch
//! based transactions, pub/sub, redirects, and authentication.
//! Import with `mod common;` in test files.
#![allow(dead_code)]

use braid::command::RedisKey;
use braid::routing;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Mock server behavior switches.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Accept `HELLO 3` (RESP3-capable server).
    pub hello: bool,
    /// Require this password via `AUTH` / `HELLO AUTH`.
    pub password: Option<String>,
    /// Version reported in `INFO` and `HELLO`.
    pub version: String,
    /// Redirect every keyed data command to this `host:port`.
    pub moved_to: Option<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            hello: false,
            password: None,
            version: "7.2.4".to_string(),
            moved_to: None,
        }
    }
}

#[derive(Default)]
struct SharedState {
    kv: HashMap<Vec<u8>, Vec<u8>>,
    versions: HashMap<Vec<u8>, u64>,
    subs: HashMap<Vec<u8>, Vec<(usize, mpsc::UnboundedSender<Vec<u8>>)>>,
    counts: HashMap<String, u64>,
    /// Loaded script bodies; the tests use the body bytes as their own sha.
    scripts: HashSet<Vec<u8>>,
    /// One-shot: after serving `GET key`, apply this external write.
    post_get_write: Option<(Vec<u8>, Vec<u8>)>,
}

impl SharedState {
    fn bump(&mut self, key: &[u8]) {
        *self.versions.entry(key.to_vec()).or_insert(0) += 1;
    }

    fn count(&mut self, name: String) {
        *self.counts.entry(name).or_insert(0) += 1;
    }
}

/// A scripted in-process server.
pub struct MockServer {
    addr: String,
    shared: Arc<Mutex<SharedState>>,
    cfg: Arc<MockConfig>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    /// Bind on an ephemeral port and start serving.
    pub async fn start(cfg: MockConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let shared = Arc::new(Mutex::new(SharedState::default()));
        let cfg = Arc::new(cfg);
        let conn_ids = Arc::new(AtomicUsize::new(0));

        let accept_shared = shared.clone();
        let accept_cfg = cfg.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let id = conn_ids.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve_conn(
                    stream,
                    accept_shared.clone(),
                    accept_cfg.clone(),
                    id,
                ));
            }
        });

        Self {
            addr,
            shared,
            cfg,
            accept_task,
        }
    }

    /// `host:port` the server listens on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Times a command (by name, or `"NAME arg0"`) was served.
    pub fn count(&self, name: &str) -> u64 {
        self.shared.lock().counts.get(name).copied().unwrap_or(0)
    }

    /// Externally write a key (the "concurrent modifier").
    pub fn set_value(&self, key: &[u8], value: &[u8]) {
        let mut shared = self.shared.lock();
        shared.kv.insert(key.to_vec(), value.to_vec());
        shared.bump(key);
    }

    /// Read a key's current value.
    pub fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.shared.lock().kv.get(key).cloned()
    }

    /// Arrange for an external write right after the next `GET key`.
    pub fn write_after_get(&self, key: &[u8], value: &[u8]) {
        self.shared.lock().post_get_write = Some((key.to_vec(), value.to_vec()));
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ---------------------------------------------------------------------------
// RESP encoding helpers
// ---------------------------------------------------------------------------

pub fn simple(s: &str) -> Vec<u8> {
    format!("+{}\r\n", s).into_bytes()
}

pub fn err(s: &str) -> Vec<u8> {
    format!("-{}\r\n", s).into_bytes()
}

pub fn int(n: i64) -> Vec<u8> {
    format!(":{}\r\n", n).into_bytes()
}

pub fn bulk(b: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", b.len()).into_bytes();
    out.extend_from_slice(b);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn nil_array() -> Vec<u8> {
    b"*-1\r\n".to_vec()
}

pub fn array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

/// The slot braid computes for a key, for scripting `MOVED` replies.
pub fn slot_of(key: &[u8]) -> u16 {
    routing::hash_slot(&RedisKey::from(key))
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

struct ConnState {
    authed: bool,
    resp3: bool,
    watched: Vec<(Vec<u8>, u64)>,
    multi: Option<Vec<Vec<Vec<u8>>>>,
    subscribed: HashSet<Vec<u8>>,
}

async fn serve_conn(
    stream: TcpStream,
    shared: Arc<Mutex<SharedState>>,
    cfg: Arc<MockConfig>,
    conn_id: usize,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnState {
        authed: cfg.password.is_none(),
        resp3: false,
        watched: Vec::new(),
        multi: None,
        subscribed: HashSet::new(),
    };
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let Ok(n) = read_half.read(&mut chunk).await else {
            break;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        while let Some((cmd, consumed)) = parse_command(&buf) {
            buf.drain(..consumed);
            let reply = handle_command(&shared, &cfg, &mut conn, conn_id, &out_tx, &cmd);
            if out_tx.send(reply).is_err() {
                break;
            }
        }
    }

    // Unregister this connection's subscriptions.
    let mut state = shared.lock();
    for channel in conn.subscribed {
        if let Some(subs) = state.subs.get_mut(&channel) {
            subs.retain(|(id, _)| *id != conn_id);
        }
    }
    drop(state);
    writer.abort();
}

/// Parse one `*N` command frame; `None` while incomplete.
fn parse_command(buf: &[u8]) -> Option<(Vec<Vec<u8>>, usize)> {
    let mut pos = 0;
    let line = read_line(buf, &mut pos)?;
    if line.first() != Some(&b'*') {
        // Tolerate nothing but command arrays.
        return None;
    }
    let argc: usize = std::str::from_utf8(&line[1..]).ok()?.parse().ok()?;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        let header = read_line(buf, &mut pos)?;
        if header.first() != Some(&b'$') {
            return None;
        }
        let len: usize = std::str::from_utf8(&header[1..]).ok()?.parse().ok()?;
        if buf.len() < pos + len + 2 {
            return None;
        }
        args.push(buf[pos..pos + len].to_vec());
        pos += len + 2;
    }
    Some((args, pos))
}

fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let rest = &buf[*pos..];
    let at = rest.windows(2).position(|w| w == b"\r\n")?;
    let line = &rest[..at];
    *pos += at + 2;
    Some(line)
}

fn handle_command(
    shared: &Arc<Mutex<SharedState>>,
    cfg: &MockConfig,
    conn: &mut ConnState,
    conn_id: usize,
    out_tx: &mpsc::UnboundedSender<Vec<u8>>,
    cmd: &[Vec<u8>],
) -> Vec<u8> {
    let Some(name) = cmd.first() else {
        return err("ERR empty command");
    };
    let name = String::from_utf8_lossy(name).to_uppercase();
    let args = &cmd[1..];

    {
        let mut state = shared.lock();
        state.count(name.clone());
        if let Some(first) = args.first() {
            state.count(format!("{} {}", name, String::from_utf8_lossy(first)));
        }
    }

    if !conn.authed && name != "AUTH" && name != "HELLO" && name != "QUIT" {
        return err("NOAUTH Authentication required.");
    }

    // Transaction queueing intercepts data commands.
    if conn.multi.is_some() && is_data_command(&name) {
        conn.multi.as_mut().expect("in multi").push(cmd.to_vec());
        return simple("QUEUED");
    }

    match name.as_str() {
        "HELLO" => {
            if let Some(required) = &cfg.password {
                // HELLO 3 AUTH <user> <pass>
                let auth_at = args
                    .iter()
                    .position(|a| a.eq_ignore_ascii_case(b"AUTH"));
                match auth_at {
                    Some(i) if args.len() > i + 2 => {
                        if args[i + 2] != required.as_bytes() {
                            return err(
                                "WRONGPASS invalid username-password pair or user is disabled.",
                            );
                        }
                        conn.authed = true;
                    }
                    _ => return err("NOAUTH HELLO must be called with the client already authenticated, otherwise the HELLO <proto> AUTH <user> <pass> option can be used to authenticate the client and select the RESP protocol version at the same time"),
                }
            }
            if !cfg.hello {
                return err("ERR unknown command 'HELLO'");
            }
            conn.resp3 = true;
            let mut out = b"%7\r\n".to_vec();
            out.extend_from_slice(&bulk(b"server"));
            out.extend_from_slice(&bulk(b"redis"));
            out.extend_from_slice(&bulk(b"version"));
            out.extend_from_slice(&bulk(cfg.version.as_bytes()));
            out.extend_from_slice(&bulk(b"proto"));
            out.extend_from_slice(&int(3));
            out.extend_from_slice(&bulk(b"id"));
            out.extend_from_slice(&int(conn_id as i64));
            out.extend_from_slice(&bulk(b"mode"));
            out.extend_from_slice(&bulk(b"standalone"));
            out.extend_from_slice(&bulk(b"role"));
            out.extend_from_slice(&bulk(b"master"));
            out.extend_from_slice(&bulk(b"modules"));
            out.extend_from_slice(b"*0\r\n");
            out
        }
        "AUTH" => {
            let supplied = args.last();
            match (&cfg.password, supplied) {
                (Some(required), Some(given)) if given == &required.as_bytes().to_vec() => {
                    conn.authed = true;
                    simple("OK")
                }
                (Some(_), _) => {
                    err("WRONGPASS invalid username-password pair or user is disabled.")
                }
                (None, _) => err("ERR Client sent AUTH, but no password is set."),
            }
        }
        "PING" => simple("PONG"),
        "QUIT" => simple("OK"),
        "SELECT" => simple("OK"),
        "CLIENT" => simple("OK"),
        "INFO" => {
            let text = format!(
                "# Server\r\nredis_version:{}\r\nredis_mode:standalone\r\n# Replication\r\nrole:master\r\nconnected_slaves:0\r\n",
                cfg.version
            );
            bulk(text.as_bytes())
        }
        "CLUSTER" => err("ERR This instance has cluster support disabled"),
        "SCRIPT" => {
            // SCRIPT LOAD <body>; the body doubles as its sha for tests.
            let Some(body) = args.get(1) else {
                return err("ERR wrong number of arguments for 'script' command");
            };
            shared.lock().scripts.insert(body.clone());
            bulk(body)
        }
        "EVALSHA" => {
            let Some(sha) = args.first() else {
                return err("ERR wrong number of arguments for 'evalsha' command");
            };
            if shared.lock().scripts.contains(sha) {
                int(7)
            } else {
                err("NOSCRIPT No matching script. Please use EVAL.")
            }
        }
        "EVAL" => int(7),
        "WATCH" => {
            let state = shared.lock();
            for key in args {
                let version = state.versions.get(key).copied().unwrap_or(0);
                conn.watched.push((key.clone(), version));
            }
            simple("OK")
        }
        "UNWATCH" => {
            conn.watched.clear();
            simple("OK")
        }
        "MULTI" => {
            conn.multi = Some(Vec::new());
            simple("OK")
        }
        "DISCARD" => {
            conn.multi = None;
            conn.watched.clear();
            simple("OK")
        }
        "EXEC" => {
            let queued = match conn.multi.take() {
                Some(queued) => queued,
                None => return err("ERR EXEC without MULTI"),
            };
            let mut state = shared.lock();
            let dirty = conn.watched.iter().any(|(key, version)| {
                state.versions.get(key).copied().unwrap_or(0) != *version
            });
            conn.watched.clear();
            if dirty {
                return nil_array();
            }
            let replies: Vec<Vec<u8>> = queued
                .iter()
                .map(|queued_cmd| {
                    let queued_name =
                        String::from_utf8_lossy(&queued_cmd[0]).to_uppercase();
                    run_data_command(&mut state, cfg, &queued_name, &queued_cmd[1..])
                })
                .collect();
            array(&replies)
        }
        "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE" => {
            let mut out = Vec::new();
            let event = name.to_lowercase();
            for channel in args {
                conn.subscribed.insert(channel.clone());
                shared
                    .lock()
                    .subs
                    .entry(channel.clone())
                    .or_default()
                    .push((conn_id, out_tx.clone()));
                out.extend_from_slice(&array(&[
                    bulk(event.as_bytes()),
                    bulk(channel),
                    int(conn.subscribed.len() as i64),
                ]));
            }
            out
        }
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "SUNSUBSCRIBE" => {
            let mut out = Vec::new();
            let event = name.to_lowercase();
            for channel in args {
                conn.subscribed.remove(channel);
                if let Some(subs) = shared.lock().subs.get_mut(channel) {
                    subs.retain(|(id, _)| *id != conn_id);
                }
                out.extend_from_slice(&array(&[
                    bulk(event.as_bytes()),
                    bulk(channel),
                    int(conn.subscribed.len() as i64),
                ]));
            }
            out
        }
        "PUBLISH" | "SPUBLISH" => {
            if args.len() != 2 {
                return err("ERR wrong number of arguments for 'publish' command");
            }
            let delivery = array(&[bulk(b"message"), bulk(&args[0]), bulk(&args[1])]);
            let state = shared.lock();
            let mut receivers = 0;
            if let Some(subs) = state.subs.get(&args[0]) {
                for (_, tx) in subs {
                    if tx.send(delivery.clone()).is_ok() {
                        receivers += 1;
                    }
                }
            }
            int(receivers)
        }
        _ if is_data_command(&name) => {
            if let Some(target) = &cfg.moved_to {
                if let Some(key) = args.first() {
                    return err(&format!("MOVED {} {}", slot_of(key), target));
                }
            }
            let mut state = shared.lock();
            run_data_command(&mut state, cfg, &name, args)
        }
        _ => err(&format!("ERR unknown command '{}'", name)),
    }
}

fn is_data_command(name: &str) -> bool {
    matches!(
        name,
        "GET" | "SET" | "DEL" | "EXISTS" | "INCR" | "INCRBY" | "DECR" | "STRLEN" | "HLEN"
    )
}

fn run_data_command(
    state: &mut SharedState,
    _cfg: &MockConfig,
    name: &str,
    args: &[Vec<u8>],
) -> Vec<u8> {
    match name {
        "GET" => {
            let Some(key) = args.first() else {
                return err("ERR wrong number of arguments for 'get' command");
            };
            let reply = match state.kv.get(key) {
                Some(value) => bulk(value),
                None => nil(),
            };
            if let Some((hook_key, new_value)) = state.post_get_write.take() {
                if &hook_key == key {
                    state.kv.insert(hook_key.clone(), new_value);
                    state.bump(&hook_key);
                } else {
                    state.post_get_write = Some((hook_key, new_value));
                }
            }
            reply
        }
        "SET" => {
            if args.len() < 2 {
                return err("ERR wrong number of arguments for 'set' command");
            }
            state.kv.insert(args[0].clone(), args[1].clone());
            state.bump(&args[0]);
            simple("OK")
        }
        "DEL" => {
            let mut removed = 0;
            for key in args {
                if state.kv.remove(key).is_some() {
                    removed += 1;
                    state.bump(key);
                }
            }
            int(removed)
        }
        "EXISTS" => {
            let found = args.iter().filter(|k| state.kv.contains_key(*k)).count();
            int(found as i64)
        }
        "INCR" | "DECR" => {
            let Some(key) = args.first() else {
                return err("ERR wrong number of arguments");
            };
            let current: i64 = state
                .kv
                .get(key)
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let next = if name == "INCR" {
                current + 1
            } else {
                current - 1
            };
            state.kv.insert(key.clone(), next.to_string().into_bytes());
            state.bump(key);
            int(next)
        }
        "STRLEN" => {
            let len = args
                .first()
                .and_then(|k| state.kv.get(k))
                .map(|v| v.len())
                .unwrap_or(0);
            int(len as i64)
        }
        "HLEN" => int(0),
        _ => err("ERR unknown data command"),
    }
}
