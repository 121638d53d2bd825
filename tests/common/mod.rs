// Copyright 2020 Joyent, Inc.

//! An in-process memcached speaking just enough of the binary protocol for
//! the integration tests to exercise the client end to end.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const HEADER_SIZE: usize = 24;
const REQUEST_MAGIC: u8 = 0x80;
const RESPONSE_MAGIC: u8 = 0x81;

#[derive(Clone)]
struct Entry {
    flags: u32,
    data: Vec<u8>,
    cas: u64,
}

struct ServerState {
    store: Mutex<HashMap<Vec<u8>, Entry>>,
    cas_counter: AtomicU64,
    running: AtomicBool,
    accepted: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
    response_delay: Mutex<Duration>,
    credentials: Option<(String, String)>,
}

pub struct FakeMemcached {
    addr: SocketAddr,
    state: Arc<ServerState>,
    accept_handle: Option<thread::JoinHandle<()>>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl FakeMemcached {
    pub fn start() -> FakeMemcached {
        Self::bind("127.0.0.1:0".parse().unwrap(), None)
    }

    pub fn with_credentials(username: &str, password: &str) -> FakeMemcached {
        Self::bind(
            "127.0.0.1:0".parse().unwrap(),
            Some((username.to_string(), password.to_string())),
        )
    }

    pub fn bind(
        addr: SocketAddr,
        credentials: Option<(String, String)>,
    ) -> FakeMemcached {
        let listener = TcpListener::bind(addr).expect("bind fake memcached");
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(ServerState {
            store: Mutex::new(HashMap::new()),
            cas_counter: AtomicU64::new(0),
            running: AtomicBool::new(true),
            accepted: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            response_delay: Mutex::new(Duration::from_millis(0)),
            credentials,
        });

        let workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let accept_state = Arc::clone(&state);
        let accept_workers = Arc::clone(&workers);
        let accept_handle = thread::spawn(move || {
            for conn in listener.incoming() {
                if !accept_state.running.load(Ordering::SeqCst) {
                    break;
                }
                match conn {
                    Ok(stream) => {
                        let conn_state = Arc::clone(&accept_state);
                        let worker = thread::spawn(move || {
                            handle_conn(stream, conn_state)
                        });
                        accept_workers.lock().unwrap().push(worker);
                    }
                    Err(_) => break,
                }
            }
        });

        FakeMemcached {
            addr,
            state,
            accept_handle: Some(accept_handle),
            workers,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Total connections accepted over the server's lifetime.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections observed.
    pub fn peak_connections(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Delay injected before every response, to keep connections busy.
    pub fn set_response_delay(&self, delay: Duration) {
        *self.state.response_delay.lock().unwrap() = delay;
    }

    /// Shuts the server down, closing the listener and every open
    /// connection.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // unblock the accept loop
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let workers: Vec<_> =
            self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for FakeMemcached {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Fills `buf` completely, polling the shutdown flag between reads. Returns
// false when the connection closed or the server is stopping.
fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    state: &ServerState,
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        if !state.running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn handle_conn(mut stream: TcpStream, state: Arc<ServerState>) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(50)));
    let _ = stream.set_nodelay(true);

    state.accepted.fetch_add(1, Ordering::SeqCst);
    let live = state.live.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak.fetch_max(live, Ordering::SeqCst);

    loop {
        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut stream, &mut header, &state) {
            Ok(true) => {}
            _ => break,
        }
        if header[0] != REQUEST_MAGIC {
            break;
        }

        let opcode = header[1];
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let body_len = u32::from_be_bytes([
            header[8], header[9], header[10], header[11],
        ]) as usize;
        let opaque = u32::from_be_bytes([
            header[12], header[13], header[14], header[15],
        ]);
        let cas = u64::from_be_bytes([
            header[16], header[17], header[18], header[19], header[20],
            header[21], header[22], header[23],
        ]);

        let mut body = vec![0u8; body_len];
        match read_full(&mut stream, &mut body, &state) {
            Ok(true) => {}
            _ => break,
        }

        let extras = &body[..extras_len];
        let key = &body[extras_len..extras_len + key_len];
        let value = &body[extras_len + key_len..];

        let delay = *state.response_delay.lock().unwrap();
        if delay > Duration::from_millis(0) {
            thread::sleep(delay);
        }

        let mut out = Vec::new();
        dispatch(&state, opcode, extras, key, value, opaque, cas, &mut out);
        if !out.is_empty() && stream.write_all(&out).is_err() {
            break;
        }
    }

    state.live.fetch_sub(1, Ordering::SeqCst);
}

fn frame(
    out: &mut Vec<u8>,
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) {
    let total = extras.len() + key.len() + value.len();
    out.push(RESPONSE_MAGIC);
    out.push(opcode);
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.push(extras.len() as u8);
    out.push(0);
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&opaque.to_be_bytes());
    out.extend_from_slice(&cas.to_be_bytes());
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    state: &ServerState,
    opcode: u8,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    opaque: u32,
    cas: u64,
    out: &mut Vec<u8>,
) {
    match opcode {
        // get / getq
        0x00 | 0x09 => {
            let store = state.store.lock().unwrap();
            match store.get(key) {
                Some(entry) => frame(
                    out,
                    opcode,
                    0,
                    opaque,
                    entry.cas,
                    &entry.flags.to_be_bytes(),
                    b"",
                    &entry.data,
                ),
                None => {
                    // quiet gets stay silent on a miss
                    if opcode == 0x00 {
                        frame(out, opcode, 0x0001, opaque, 0, b"", b"", b"Not found");
                    }
                }
            }
        }
        // set / add / replace
        0x01 | 0x02 | 0x03 => {
            let flags = u32::from_be_bytes([
                extras[0], extras[1], extras[2], extras[3],
            ]);
            let mut store = state.store.lock().unwrap();
            let existing = store.get(key).cloned();

            let status = if opcode == 0x02 && existing.is_some() {
                0x0002
            } else if opcode == 0x03 && existing.is_none() {
                0x0001
            } else if cas != 0 {
                match &existing {
                    Some(entry) if entry.cas == cas => 0,
                    Some(_) => 0x0002,
                    None => 0x0001,
                }
            } else {
                0
            };

            if status == 0 {
                let new_cas = state.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;
                store.insert(
                    key.to_vec(),
                    Entry {
                        flags,
                        data: value.to_vec(),
                        cas: new_cas,
                    },
                );
                frame(out, opcode, 0, opaque, new_cas, b"", b"", b"");
            } else {
                frame(out, opcode, status, opaque, 0, b"", b"", b"Data exists for key.");
            }
        }
        // delete
        0x04 => {
            let mut store = state.store.lock().unwrap();
            if store.remove(key).is_some() {
                frame(out, opcode, 0, opaque, 0, b"", b"", b"");
            } else {
                frame(out, opcode, 0x0001, opaque, 0, b"", b"", b"Not found");
            }
        }
        // increment / decrement
        0x05 | 0x06 => {
            let delta = u64::from_be_bytes([
                extras[0], extras[1], extras[2], extras[3], extras[4],
                extras[5], extras[6], extras[7],
            ]);
            let initial = u64::from_be_bytes([
                extras[8], extras[9], extras[10], extras[11], extras[12],
                extras[13], extras[14], extras[15],
            ]);
            let expiration = u32::from_be_bytes([
                extras[16], extras[17], extras[18], extras[19],
            ]);

            let mut store = state.store.lock().unwrap();
            let next = match store.get(key).cloned() {
                Some(entry) => {
                    match std::str::from_utf8(&entry.data)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        Some(current) => {
                            if opcode == 0x05 {
                                Some(current.wrapping_add(delta))
                            } else {
                                Some(current.saturating_sub(delta))
                            }
                        }
                        None => {
                            frame(out, opcode, 0x0006, opaque, 0, b"", b"", b"Non-numeric value");
                            None
                        }
                    }
                }
                None => {
                    // all-ones expiration means "do not create"
                    if expiration == u32::max_value() {
                        frame(out, opcode, 0x0001, opaque, 0, b"", b"", b"Not found");
                        None
                    } else {
                        Some(initial)
                    }
                }
            };

            if let Some(next) = next {
                let new_cas = state.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;
                store.insert(
                    key.to_vec(),
                    Entry {
                        flags: 0,
                        data: next.to_string().into_bytes(),
                        cas: new_cas,
                    },
                );
                frame(out, opcode, 0, opaque, new_cas, b"", b"", &next.to_be_bytes());
            }
        }
        // append / prepend
        0x0e | 0x0f => {
            let mut store = state.store.lock().unwrap();
            match store.get(key).cloned() {
                Some(entry) => {
                    if cas != 0 && entry.cas != cas {
                        frame(out, opcode, 0x0002, opaque, 0, b"", b"", b"Data exists for key.");
                    } else {
                        let mut data = entry.data;
                        if opcode == 0x0e {
                            data.extend_from_slice(value);
                        } else {
                            let mut prefixed = value.to_vec();
                            prefixed.extend_from_slice(&data);
                            data = prefixed;
                        }
                        let new_cas =
                            state.cas_counter.fetch_add(1, Ordering::SeqCst) + 1;
                        store.insert(
                            key.to_vec(),
                            Entry {
                                flags: entry.flags,
                                data,
                                cas: new_cas,
                            },
                        );
                        frame(out, opcode, 0, opaque, new_cas, b"", b"", b"");
                    }
                }
                None => {
                    frame(out, opcode, 0x0005, opaque, 0, b"", b"", b"Not stored.");
                }
            }
        }
        // noop
        0x0a => frame(out, opcode, 0, opaque, 0, b"", b"", b""),
        // version
        0x0b => frame(out, opcode, 0, opaque, 0, b"", b"", b"1.6.21"),
        // stat
        0x10 => {
            let count = state.store.lock().unwrap().len().to_string();
            frame(out, opcode, 0, opaque, 0, b"", b"uptime", b"1234");
            frame(out, opcode, 0, opaque, 0, b"", b"version", b"1.6.21");
            frame(out, opcode, 0, opaque, 0, b"", b"curr_items", count.as_bytes());
            frame(out, opcode, 0, opaque, 0, b"", b"", b"");
        }
        // sasl auth
        0x21 => match &state.credentials {
            None => frame(out, opcode, 0, opaque, 0, b"", b"", b"Authenticated"),
            Some((user, pass)) => {
                let expected = format!("\0{}\0{}", user, pass);
                if key == b"PLAIN" && value == expected.as_bytes() {
                    frame(out, opcode, 0, opaque, 0, b"", b"", b"Authenticated");
                } else {
                    frame(out, opcode, 0x0020, opaque, 0, b"", b"", b"Auth failure");
                }
            }
        },
        // sasl step: PLAIN never continues
        0x22 => frame(out, opcode, 0x0020, opaque, 0, b"", b"", b"Auth failure"),
        _ => frame(out, opcode, 0x0081, opaque, 0, b"", b"", b"Unknown command"),
    }
}
