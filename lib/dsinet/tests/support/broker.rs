//! In-process servicebroker. Serves the broker frame protocol on a unique
//! abstract name and delivers pulses by connecting to the subscribers'
//! notification acceptors. One instance per test.

use byteorder::{ByteOrder, LittleEndian};
use dsinet::broker::{proto, Pulse};
use dsinet::sys;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

static BROKER_SERIAL: AtomicU32 = AtomicU32::new(0);

const CODE_SERVER_AVAILABLE: i32 = 100;
const CODE_SERVER_DISCONNECT: i32 = 101;
const CODE_CLIENT_DETACHED: i32 = 102;

#[derive(Clone)]
struct PulseTarget {
    pid: u32,
    chid: i32,
    value: i32,
}

struct Service {
    name: String,
    major: u32,
    server_id: u64,
    pid: u32,
    chid: i32,
}

struct TcpService {
    name: String,
    major: u32,
    server_id: u64,
    ip: u32,
    port: u32,
}

struct Watch {
    id: u32,
    target: PulseTarget,
    key: WatchKey,
}

enum WatchKey {
    ServerAvailable(String, u32),
    ServerDisconnect(u64),
    ClientDetach(u64),
}

#[derive(Default)]
struct BrokerState {
    services: Vec<Service>,
    tcp_services: Vec<TcpService>,
    watches: Vec<Watch>,
    next_party: u64,
    next_watch: u32,
}

impl BrokerState {
    fn fresh_party(&mut self) -> u64 {
        self.next_party += 1;
        (1 << 32) | self.next_party
    }

    fn fresh_watch(&mut self) -> u32 {
        self.next_watch += 1;
        self.next_watch
    }
}

fn send_pulse(target: &PulseTarget, code: i32) {
    let name = sys::local_name(target.pid, target.chid);

    if let Ok(mut stream) = sys::connect_abstract(&name) {
        let pulse = Pulse {
            code,
            value: target.value,
        };
        let _ = stream.write_all(&pulse.encode());
    }
}

fn read_str(body: &[u8], at: &mut usize) -> String {
    let len = LittleEndian::read_u32(&body[*at..]) as usize;
    *at += 4;
    let text = String::from_utf8_lossy(&body[*at..*at + len]).into_owned();
    *at += len;
    text
}

fn read_u32(body: &[u8], at: &mut usize) -> u32 {
    let value = LittleEndian::read_u32(&body[*at..]);
    *at += 4;
    value
}

fn read_i32(body: &[u8], at: &mut usize) -> i32 {
    let value = LittleEndian::read_i32(&body[*at..]);
    *at += 4;
    value
}

fn read_u64(body: &[u8], at: &mut usize) -> u64 {
    let value = LittleEndian::read_u64(&body[*at..]);
    *at += 8;
    value
}

fn reply(status: u32, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 4 + body.len()];
    LittleEndian::write_u32(&mut out[..4], status);
    out[4..].copy_from_slice(body);
    out
}

fn handle_request(state: &Mutex<BrokerState>, op: u32, body: &[u8]) -> Vec<u8> {
    let mut at = 0;
    let mut state = state.lock().unwrap();

    match op {
        proto::REGISTER_INTERFACE => {
            let name = read_str(body, &mut at);
            let major = read_u32(body, &mut at);
            let _minor = read_u32(body, &mut at);
            let pid = read_u32(body, &mut at);
            let chid = read_i32(body, &mut at);
            let _group = read_str(body, &mut at);

            let server_id = state.fresh_party();
            state.services.push(Service {
                name: name.clone(),
                major,
                server_id,
                pid,
                chid,
            });

            // fire pending server-available watches, they are one-shot
            let mut fired = Vec::new();
            state.watches.retain(|watch| match &watch.key {
                WatchKey::ServerAvailable(wname, wmajor) if *wname == name && *wmajor == major => {
                    fired.push(watch.target.clone());
                    false
                }
                _ => true,
            });
            drop(state);

            for target in fired {
                send_pulse(&target, CODE_SERVER_AVAILABLE);
            }

            let mut out = [0u8; 8];
            LittleEndian::write_u64(&mut out, server_id);
            reply(0, &out)
        }

        proto::REGISTER_INTERFACE_TCP => {
            let name = read_str(body, &mut at);
            let major = read_u32(body, &mut at);
            let _minor = read_u32(body, &mut at);
            let ip = read_u32(body, &mut at);
            let port = read_u32(body, &mut at);

            let server_id = state.fresh_party();
            state.tcp_services.push(TcpService {
                name,
                major,
                server_id,
                ip,
                port,
            });

            let mut out = [0u8; 8];
            LittleEndian::write_u64(&mut out, server_id);
            reply(0, &out)
        }

        proto::UNREGISTER_INTERFACE => {
            let server_id = read_u64(body, &mut at);

            state.services.retain(|service| service.server_id != server_id);
            state.tcp_services.retain(|service| service.server_id != server_id);

            let mut fired = Vec::new();
            state.watches.retain(|watch| match &watch.key {
                WatchKey::ServerDisconnect(id) if *id == server_id => {
                    fired.push(watch.target.clone());
                    false
                }
                _ => true,
            });
            drop(state);

            for target in fired {
                send_pulse(&target, CODE_SERVER_DISCONNECT);
            }

            reply(0, &[])
        }

        proto::ATTACH_INTERFACE => {
            let name = read_str(body, &mut at);
            let major = read_u32(body, &mut at);

            let found = state
                .services
                .iter()
                .find(|service| service.name == name && service.major == major)
                .map(|service| (service.server_id, service.pid, service.chid));

            match found {
                Some((server_id, pid, chid)) => {
                    let client_id = state.fresh_party();

                    let mut out = [0u8; 28];
                    LittleEndian::write_u64(&mut out[..8], client_id);
                    LittleEndian::write_u64(&mut out[8..16], server_id);
                    LittleEndian::write_u32(&mut out[16..20], pid);
                    LittleEndian::write_i32(&mut out[20..24], chid);
                    LittleEndian::write_u32(&mut out[24..28], 0);
                    reply(0, &out)
                }
                None => reply(1, &[0u8; 28]),
            }
        }

        proto::ATTACH_INTERFACE_TCP => {
            let name = read_str(body, &mut at);
            let major = read_u32(body, &mut at);

            let found = state
                .tcp_services
                .iter()
                .find(|service| service.name == name && service.major == major)
                .map(|service| (service.server_id, service.ip, service.port));

            match found {
                Some((server_id, ip, port)) => {
                    let client_id = state.fresh_party();

                    let mut out = [0u8; 24];
                    LittleEndian::write_u64(&mut out[..8], client_id);
                    LittleEndian::write_u64(&mut out[8..16], server_id);
                    LittleEndian::write_u32(&mut out[16..20], ip);
                    LittleEndian::write_u32(&mut out[20..24], port);
                    reply(0, &out)
                }
                None => reply(1, &[0u8; 24]),
            }
        }

        proto::DETACH_INTERFACE => {
            let client_id = read_u64(body, &mut at);

            let mut fired = Vec::new();
            state.watches.retain(|watch| match &watch.key {
                WatchKey::ClientDetach(id) if *id == client_id => {
                    fired.push(watch.target.clone());
                    false
                }
                _ => true,
            });
            drop(state);

            for target in fired {
                send_pulse(&target, CODE_CLIENT_DETACHED);
            }

            reply(0, &[])
        }

        proto::SET_SERVER_AVAILABLE_NOTIFICATION => {
            let name = read_str(body, &mut at);
            let major = read_u32(body, &mut at);
            let _minor = read_u32(body, &mut at);
            let pid = read_u32(body, &mut at);
            let chid = read_i32(body, &mut at);
            let value = read_i32(body, &mut at);

            let id = state.fresh_watch();
            let target = PulseTarget { pid, chid, value };

            let available = state
                .services
                .iter()
                .any(|service| service.name == name && service.major == major);

            if available {
                // already there, fire right away
                drop(state);
                send_pulse(&target, CODE_SERVER_AVAILABLE);
            } else {
                state.watches.push(Watch {
                    id,
                    target,
                    key: WatchKey::ServerAvailable(name, major),
                });
            }

            let mut out = [0u8; 4];
            LittleEndian::write_u32(&mut out, id);
            reply(0, &out)
        }

        proto::SET_SERVER_DISCONNECT_NOTIFICATION => {
            let server_id = read_u64(body, &mut at);
            let pid = read_u32(body, &mut at);
            let chid = read_i32(body, &mut at);
            let value = read_i32(body, &mut at);

            let id = state.fresh_watch();
            state.watches.push(Watch {
                id,
                target: PulseTarget { pid, chid, value },
                key: WatchKey::ServerDisconnect(server_id),
            });

            let mut out = [0u8; 4];
            LittleEndian::write_u32(&mut out, id);
            reply(0, &out)
        }

        proto::SET_CLIENT_DETACH_NOTIFICATION => {
            let client_id = read_u64(body, &mut at);
            let pid = read_u32(body, &mut at);
            let chid = read_i32(body, &mut at);
            let value = read_i32(body, &mut at);

            let id = state.fresh_watch();
            state.watches.push(Watch {
                id,
                target: PulseTarget { pid, chid, value },
                key: WatchKey::ClientDetach(client_id),
            });

            let mut out = [0u8; 4];
            LittleEndian::write_u32(&mut out, id);
            reply(0, &out)
        }

        proto::CLEAR_NOTIFICATION => {
            let id = read_u32(body, &mut at);
            state.watches.retain(|watch| watch.id != id);
            reply(0, &[])
        }

        _ => reply(1, &[]),
    }
}

fn serve_connection(state: Arc<Mutex<BrokerState>>, mut stream: UnixStream) {
    loop {
        let mut head = [0u8; 8];
        if stream.read_exact(&mut head).is_err() {
            return;
        }

        let op = LittleEndian::read_u32(&head[..4]);
        let body_len = LittleEndian::read_u32(&head[4..]) as usize;

        let mut body = vec![0u8; body_len];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        let response = handle_request(&state, op, &body);

        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

/// A broker instance bound to a unique abstract name. The accept loop runs
/// until the test process exits.
pub struct TestBroker {
    path: String,
}

impl TestBroker {
    pub fn start() -> TestBroker {
        let serial = BROKER_SERIAL.fetch_add(1, Ordering::SeqCst);
        let path = format!("dsi/test/broker/{}/{}", process::id(), serial);

        let listener = sys::abstract_listener(&path).expect("broker listener");
        let state = Arc::new(Mutex::new(BrokerState::default()));

        thread::spawn(move || loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    let state = state.clone();
                    thread::spawn(move || serve_connection(state, stream));
                }
                Err(_) => return,
            }
        });

        TestBroker { path }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}
