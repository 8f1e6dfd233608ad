//! The communication engine: a single-threaded event loop serving all DSI
//! clients and servers added to it. The engine owns the acceptors, the
//! channel caches and the servicebroker handle and routes every inbound
//! message to the party it addresses.

use crate::broker::{Pulse, Servicebroker, PULSE_SIZE};
use crate::channel::{ChannelRef, LocalChannel, TcpChannel, Transport};
use crate::client::{self, ClientState, Proxy};
use crate::config::Config;
use crate::connect::{self, Progress};
use crate::dispatch::{Dispatcher, StopHandle};
use crate::error::ErrorUtils;
use crate::frame;
use crate::server::{self, ServerCtx, ServerState, Stub};
use crate::sys;
use crate::EndpointId;
use dsibase::logging::{self, Logger};
use dsibase::wire::{
    Command, ConnectRequestInfo, MessageHeader, TcpConnectRequestInfo, CONNECT_INFO_SIZE,
    HEADER_SIZE, MESSAGE_MAGIC,
};
use dsibase::{PartyId, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use hashbrown::HashMap;
use indexmap::IndexMap;
use mio::unix::UnixReady;
use mio::Ready;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::rc::Rc;
use std::time::Duration;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Readiness interest of a generic device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataDirection {
    In,
    Out,
    InOut,
}

/// What happened on a generic device.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoResult {
    DataAvailable,
    CanWriteNow,
    DeviceHungup,
    InvalidFileDescriptor,
    GenericError,
}

type GenericHandler = Box<dyn FnMut(IoResult, &mut CommEngine) -> bool>;

struct GenericDevice {
    handler: GenericHandler,
}

enum ConnKey {
    Local(String),
    Tcp(SocketAddrV4),
    Anonymous,
}

struct Connection {
    channel: ChannelRef,
    key: ConnKey,
}

/// Engine internals shared with client and server callbacks through the
/// context objects: the dispatcher, the broker handle, the acceptors and
/// the channel caches.
pub struct EngineCore {
    pub log: Logger,
    pub cfg: Config,
    pub dispatch: Dispatcher,
    pub broker: Servicebroker,
    pub(crate) active: bool,
    next_id: i32,
    notify_acceptor: UnixListener,
    notify_chid: i32,
    local_acceptor: Option<UnixListener>,
    local_chid: i32,
    tcp_acceptor: Option<TcpListener>,
    connections: HashMap<RawFd, Connection>,
    local_cache: IndexMap<String, RawFd>,
    tcp_cache: IndexMap<SocketAddrV4, RawFd>,
    pulse_socks: HashMap<RawFd, UnixStream>,
    pending_connects: HashMap<RawFd, EndpointId>,
}

impl EngineCore {
    pub fn new(cfg: Config, log: Logger) -> std::io::Result<EngineCore> {
        let dispatch = Dispatcher::new()?;

        let (notify_acceptor, notify_chid) = sys::local_acceptor()?;
        dispatch.register_fd(notify_chid, Ready::readable())?;

        let broker = Servicebroker::new(&cfg.broker, &log);

        Ok(EngineCore {
            log,
            cfg,
            dispatch,
            broker,
            active: false,
            next_id: 1,
            notify_acceptor,
            notify_chid,
            local_acceptor: None,
            local_chid: 0,
            tcp_acceptor: None,
            connections: HashMap::new(),
            local_cache: IndexMap::new(),
            tcp_cache: IndexMap::new(),
            pulse_socks: HashMap::new(),
            pending_connects: HashMap::new(),
        })
    }

    /// Fresh id from the engine-wide monotonic counter. Used for sequence
    /// numbers, connection ids, session ids and unblock handles.
    #[inline]
    pub fn next_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Channel id of the servicebroker notification acceptor.
    #[inline]
    pub fn notify_chid(&self) -> i32 {
        self.notify_chid
    }

    /// Channel id of the local transport acceptor.
    #[inline]
    pub fn local_chid(&self) -> i32 {
        self.local_chid
    }

    /// Port of the TCP acceptor, starting it on first use.
    pub(crate) fn ensure_tcp_port(&mut self) -> Option<u16> {
        if self.tcp_acceptor.is_none() {
            match sys::tcp_acceptor(self.cfg.tcp_port) {
                Ok(listener) => {
                    if let Err(err) = self.dispatch.register_fd(listener.as_raw_fd(), Ready::readable()) {
                        logging::error!(self.log, "cannot register tcp acceptor"; "error" => %err);
                        return None;
                    }

                    logging::debug!(self.log, "tcp acceptor started";
                                    "port" => listener.local_addr().map(|a| a.port()).unwrap_or(0));
                    self.tcp_acceptor = Some(listener);
                }
                Err(err) => {
                    logging::error!(self.log, "cannot bind tcp acceptor"; "error" => %err);
                    return None;
                }
            }
        }

        self.tcp_acceptor
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Attach to (or reuse) the local channel of the process/channel pair.
    pub(crate) fn attach_local(&mut self, pid: u32, chid: i32) -> Option<ChannelRef> {
        let name = sys::local_name(pid, chid);

        if let Some(&fd) = self.local_cache.get(&name) {
            if let Some(conn) = self.connections.get(&fd) {
                logging::debug!(self.log, "local channel found in cache"; "name" => &name);
                return Some(conn.channel.clone());
            }
        }

        match sys::connect_abstract(&name) {
            Ok(stream) => {
                let channel = match LocalChannel::new(stream, &self.cfg, &self.log) {
                    Ok(channel) => Rc::new(channel),
                    Err(err) => {
                        logging::error!(self.log, "cannot set up local channel"; "error" => %err);
                        return None;
                    }
                };

                logging::debug!(self.log, "connected to local channel"; "name" => &name);

                let channel: ChannelRef = channel;
                self.insert_connection(channel.clone(), ConnKey::Local(name));
                Some(channel)
            }
            Err(err) => {
                logging::error!(self.log, "failed to connect local channel";
                                "name" => &name, "error" => %err);
                None
            }
        }
    }

    /// Attach to (or reuse) a TCP channel. A private channel bypasses the
    /// cache and the engine's reader; the caller owns it exclusively.
    pub(crate) fn attach_tcp(&mut self, ip: u32, port: u16, private: bool) -> Option<ChannelRef> {
        let addr = SocketAddrV4::new(Ipv4Addr::from(ip), port);

        if !private {
            if let Some(&fd) = self.tcp_cache.get(&addr) {
                if let Some(conn) = self.connections.get(&fd) {
                    logging::debug!(self.log, "tcp channel found in cache"; "addr" => %addr);
                    return Some(conn.channel.clone());
                }
            }
        }

        match TcpStream::connect_timeout(&SocketAddr::V4(addr), TCP_CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);

                let channel = match TcpChannel::new(stream, &self.cfg, &self.log) {
                    Ok(channel) => Rc::new(channel),
                    Err(err) => {
                        logging::error!(self.log, "cannot set up tcp channel"; "error" => %err);
                        return None;
                    }
                };

                logging::debug!(self.log, "connected to tcp channel"; "addr" => %addr);

                let channel: ChannelRef = channel;

                if !private {
                    self.insert_connection(channel.clone(), ConnKey::Tcp(addr));
                }

                Some(channel)
            }
            Err(err) => {
                logging::error!(self.log, "failed to connect tcp channel";
                                "addr" => %addr, "error" => %err);
                None
            }
        }
    }

    fn insert_connection(&mut self, channel: ChannelRef, key: ConnKey) {
        let fd = channel.fd();

        if let Err(err) = self.dispatch.register_fd(fd, Ready::readable()) {
            logging::error!(self.log, "cannot register channel"; "error" => %err);
        }

        match &key {
            ConnKey::Local(name) => {
                self.local_cache.insert(name.clone(), fd);
            }
            ConnKey::Tcp(addr) => {
                self.tcp_cache.insert(*addr, fd);
            }
            ConnKey::Anonymous => (),
        }

        self.connections.insert(fd, Connection { channel, key });
    }

    /// Drop a connection: deregister, close and uncache. Returns the
    /// channel so callers can fan out detach handling.
    fn remove_connection(&mut self, fd: RawFd) -> Option<ChannelRef> {
        let conn = self.connections.remove(&fd)?;

        let _ = self.dispatch.deregister_fd(fd);

        match &conn.key {
            ConnKey::Local(name) => {
                self.local_cache.shift_remove(name);
            }
            ConnKey::Tcp(addr) => {
                self.tcp_cache.shift_remove(addr);
            }
            ConnKey::Anonymous => (),
        }

        conn.channel.close();
        Some(conn.channel)
    }

    pub(crate) fn add_pending_connect(&mut self, fd: RawFd, endpoint: EndpointId) {
        if let Err(err) = self.dispatch.register_fd(fd, Ready::readable()) {
            logging::error!(self.log, "cannot register connect channel"; "error" => %err);
        }

        self.pending_connects.insert(fd, endpoint);
    }

    pub(crate) fn cancel_pending_connect(&mut self, fd: RawFd) {
        if self.pending_connects.remove(&fd).is_some() {
            let _ = self.dispatch.deregister_fd(fd);
        }
    }
}

struct ClientEntry {
    state: ClientState,
    proxy: Box<dyn Proxy>,
}

struct ServerEntry {
    state: ServerState,
    stub: Box<dyn Stub>,
}

/// A communication engine serving all clients and servers added to it.
/// `run` enters the event loop; endpoints may be added before or from
/// within callbacks.
///
/// A server and a client of the same interface cannot share one engine:
/// the client's attach handshake sends blocking connect traffic the server
/// half would have to answer on the same thread.
pub struct CommEngine {
    core: EngineCore,
    clients: Vec<Option<ClientEntry>>,
    servers: Vec<Option<ServerEntry>>,
    client_cache: HashMap<PartyId, EndpointId>,
    server_cache: HashMap<PartyId, EndpointId>,
    generic: HashMap<RawFd, GenericDevice>,
}

impl CommEngine {
    pub fn new(cfg: Config, log: Logger) -> std::io::Result<CommEngine> {
        Ok(CommEngine {
            core: EngineCore::new(cfg, log)?,
            clients: Vec::new(),
            servers: Vec::new(),
            client_cache: HashMap::new(),
            server_cache: HashMap::new(),
            generic: HashMap::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.core.cfg
    }

    /// Handle for stopping the loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.core.dispatch.stop_handle()
    }

    /// Break the event loop; `run` returns the given exit code.
    pub fn stop(&self, exitcode: i32) {
        self.core.dispatch.stop(exitcode);
    }

    /// Add a client (proxy). Once the engine runs, a server-available
    /// notification is armed and the attach handshake starts as soon as a
    /// server registers.
    pub fn add_client(&mut self, mut state: ClientState, proxy: Box<dyn Proxy>) -> EndpointId {
        state.log = self.core.log.new(logging::o!("client" => state.desc.name.clone()));
        state.id = self.core.next_id();

        logging::debug!(state.log, "client added"; "internal_id" => state.id);

        if self.core.active {
            client::set_server_available_notification(&mut state, &mut self.core);
        }

        self.clients.push(Some(ClientEntry { state, proxy }));
        self.clients.len() - 1
    }

    /// Add a server (stub). Once the engine runs, the interface is
    /// registered with the servicebroker immediately.
    pub fn add_server(&mut self, mut state: ServerState, stub: Box<dyn Stub>) -> EndpointId {
        state.log = self.core.log.new(logging::o!("server" => state.desc.name.clone()));
        state.id = self.core.next_id();

        logging::debug!(state.log, "server added"; "internal_id" => state.id);

        if self.core.active {
            server::register_interface(&mut state, &mut self.core);
        }

        self.servers.push(Some(ServerEntry { state, stub }));
        self.servers.len() - 1
    }

    /// Remove a client. Outstanding state is detached; no callbacks fire
    /// for this endpoint afterwards.
    pub fn remove_client(&mut self, endpoint: EndpointId) -> bool {
        let entry = match self.clients.get_mut(endpoint).and_then(Option::take) {
            Some(entry) => entry,
            None => return false,
        };

        let mut entry = entry;

        if self.core.active {
            client::detach_interface(&mut *entry.proxy, &mut entry.state, &mut self.core, false);
            client::remove_notification(&mut entry.state, &mut self.core);
        }

        self.client_cache.retain(|_, id| *id != endpoint);
        true
    }

    /// Remove a server: all clients are dropped and the interface leaves
    /// the registry.
    pub fn remove_server(&mut self, endpoint: EndpointId) -> bool {
        let entry = match self.servers.get_mut(endpoint).and_then(Option::take) {
            Some(entry) => entry,
            None => return false,
        };

        let mut entry = entry;

        if self.core.active {
            server::unregister_interface(&mut entry.state, &mut self.core);
        }

        self.server_cache.retain(|_, id| *id != endpoint);
        true
    }

    /// Run an operation against a server's stub and context, e.g. from a
    /// generic device callback resuming an unblocked request.
    pub fn with_server_ctx<R>(
        &mut self,
        endpoint: EndpointId,
        op: impl FnOnce(&mut dyn Stub, &mut ServerCtx) -> R,
    ) -> Option<R> {
        let CommEngine { core, servers, .. } = self;
        let entry = servers.get_mut(endpoint)?.as_mut()?;

        let mut ctx = ServerCtx {
            core,
            state: &mut entry.state,
        };

        Some(op(&mut *entry.stub, &mut ctx))
    }

    /// Run an operation against a client's proxy and context.
    pub fn with_client_ctx<R>(
        &mut self,
        endpoint: EndpointId,
        op: impl FnOnce(&mut dyn Proxy, &mut client::ClientCtx) -> R,
    ) -> Option<R> {
        let CommEngine { core, clients, .. } = self;
        let entry = clients.get_mut(endpoint)?.as_mut()?;

        let mut ctx = client::ClientCtx {
            core,
            state: &mut entry.state,
        };

        Some(op(&mut *entry.proxy, &mut ctx))
    }

    /// Add an external pollable descriptor to the loop. The handler keeps
    /// the device armed by returning true. The same fd cannot be added
    /// twice.
    pub fn add_generic_device<H>(&mut self, fd: RawFd, dir: DataDirection, handler: H) -> bool
    where
        H: FnMut(IoResult, &mut CommEngine) -> bool + 'static,
    {
        if self.generic.contains_key(&fd) || self.core.connections.contains_key(&fd) {
            logging::error!(self.core.log, "descriptor already registered"; "fd" => fd);
            return false;
        }

        let interest = match dir {
            DataDirection::In => Ready::readable(),
            DataDirection::Out => Ready::writable(),
            DataDirection::InOut => Ready::readable() | Ready::writable(),
        };

        if let Err(err) = self.core.dispatch.register_fd(fd, interest) {
            logging::error!(self.core.log, "cannot register generic device";
                            "fd" => fd, "error" => %err);
            return false;
        }

        self.generic.insert(
            fd,
            GenericDevice {
                handler: Box::new(handler),
            },
        );
        true
    }

    /// Remove a previously added descriptor from the loop.
    pub fn remove_generic_device(&mut self, fd: RawFd) {
        if self.generic.remove(&fd).is_some() {
            let _ = self.core.dispatch.deregister_fd(fd);
        }
    }

    /// Run the event loop until `stop` is called. Returns the exit code
    /// handed to `stop`, or -1 on setup failures and unhandled panics in
    /// handlers.
    pub fn run(&mut self) -> i32 {
        if self.core.local_acceptor.is_some() {
            logging::error!(self.core.log, "engine is already running");
            return -1;
        }

        let (acceptor, chid) = match sys::local_acceptor() {
            Ok(acceptor) => acceptor,
            Err(err) => {
                logging::error!(self.core.log, "error creating the communication engine";
                                "error" => %err);
                return -1;
            }
        };

        if self.core.dispatch.register_fd(chid, Ready::readable()).is_err() {
            return -1;
        }

        self.core.local_acceptor = Some(acceptor);
        self.core.local_chid = chid;

        logging::debug!(self.core.log, "engine running";
                        "pid" => process::id(), "local_chid" => chid);

        // registry registration for servers and clients
        {
            let CommEngine { core, servers, clients, .. } = self;

            for entry in servers.iter_mut().flatten() {
                server::register_interface(&mut entry.state, core);
            }

            for entry in clients.iter_mut().flatten() {
                client::set_server_available_notification(&mut entry.state, core);
            }
        }

        self.core.active = true;
        let exitcode = self.event_loop();
        self.core.active = false;

        {
            let CommEngine { core, servers, clients, .. } = self;

            for entry in clients.iter_mut().flatten() {
                client::detach_interface(&mut *entry.proxy, &mut entry.state, core, false);
                client::remove_notification(&mut entry.state, core);
            }

            for entry in servers.iter_mut().flatten() {
                server::unregister_interface(&mut entry.state, core);
            }
        }

        self.teardown();

        exitcode
    }

    fn event_loop(&mut self) -> i32 {
        loop {
            if let Some(exitcode) = self.core.dispatch.exit_code() {
                return exitcode;
            }

            let events = match self.core.dispatch.wait() {
                Ok(events) => events,
                Err(err) => {
                    logging::crit!(self.core.log, "poll failed"; "error" => %err);
                    return -1;
                }
            };

            for event in events {
                let fd = event.token().0 as RawFd;
                let readiness = event.readiness();

                // a panicking user handler exits the loop instead of
                // unwinding through it
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| self.handle_event(fd, readiness)));

                if outcome.is_err() {
                    logging::crit!(self.core.log, "unhandled panic in handler"; "fd" => fd);
                    return -1;
                }
            }
        }
    }

    fn teardown(&mut self) {
        let fds: Vec<RawFd> = self.core.connections.keys().copied().collect();
        for fd in fds {
            self.core.remove_connection(fd);
        }

        let fds: Vec<RawFd> = self.core.pulse_socks.keys().copied().collect();
        for fd in fds {
            let _ = self.core.dispatch.deregister_fd(fd);
            self.core.pulse_socks.remove(&fd);
        }

        if let Some(acceptor) = self.core.local_acceptor.take() {
            let _ = self.core.dispatch.deregister_fd(acceptor.as_raw_fd());
        }
        self.core.local_chid = 0;

        if let Some(acceptor) = self.core.tcp_acceptor.take() {
            let _ = self.core.dispatch.deregister_fd(acceptor.as_raw_fd());
        }

        // rearm the dispatcher for a later run
        self.core.dispatch.reset();
    }

    fn handle_event(&mut self, fd: RawFd, readiness: Ready) {
        if fd == self.core.notify_chid {
            self.accept_notification();
            return;
        }

        if Some(fd) == self.core.local_acceptor.as_ref().map(|a| a.as_raw_fd()) {
            self.accept_local();
            return;
        }

        if Some(fd) == self.core.tcp_acceptor.as_ref().map(|a| a.as_raw_fd()) {
            self.accept_tcp();
            return;
        }

        if self.core.pulse_socks.contains_key(&fd) {
            if let Some(pulse) = self.read_pulse(fd) {
                self.handle_pulse(pulse);
            }
            return;
        }

        if let Some(&endpoint) = self.core.pending_connects.get(&fd) {
            self.core.cancel_pending_connect(fd);
            self.finish_tcp_attach(endpoint);
            return;
        }

        if self.generic.contains_key(&fd) {
            self.handle_generic_device(fd, readiness);
            return;
        }

        if self.core.connections.contains_key(&fd) {
            self.handle_channel_readable(fd);
        }
    }

    fn accept_notification(&mut self) {
        match self.core.notify_acceptor.accept() {
            Ok((stream, _)) => {
                let fd = stream.as_raw_fd();

                if self.core.dispatch.register_fd(fd, Ready::readable()).is_ok() {
                    self.core.pulse_socks.insert(fd, stream);
                }
            }
            Err(err) => {
                logging::warn!(self.core.log, "notification accept failed"; "error" => %err);
            }
        }
    }

    fn accept_local(&mut self) {
        let accepted = match self.core.local_acceptor.as_ref() {
            Some(acceptor) => acceptor.accept(),
            None => return,
        };

        match accepted {
            Ok((stream, _)) => {
                match LocalChannel::new(stream, &self.core.cfg, &self.core.log) {
                    Ok(channel) => {
                        let channel: ChannelRef = Rc::new(channel);
                        self.core.insert_connection(channel, ConnKey::Anonymous);
                    }
                    Err(err) => {
                        logging::warn!(self.core.log, "local accept setup failed"; "error" => %err);
                    }
                }
            }
            Err(err) => {
                logging::warn!(self.core.log, "local accept failed"; "error" => %err);
            }
        }
    }

    fn accept_tcp(&mut self) {
        let accepted = match self.core.tcp_acceptor.as_ref() {
            Some(acceptor) => acceptor.accept(),
            None => return,
        };

        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);

                match TcpChannel::new(stream, &self.core.cfg, &self.core.log) {
                    Ok(channel) => {
                        let channel: ChannelRef = Rc::new(channel);

                        let key = match peer {
                            SocketAddr::V4(addr) => ConnKey::Tcp(addr),
                            _ => ConnKey::Anonymous,
                        };

                        self.core.insert_connection(channel, key);
                    }
                    Err(err) => {
                        logging::warn!(self.core.log, "tcp accept setup failed"; "error" => %err);
                    }
                }
            }
            Err(err) => {
                logging::warn!(self.core.log, "tcp accept failed"; "error" => %err);
            }
        }
    }

    fn read_pulse(&mut self, fd: RawFd) -> Option<Pulse> {
        let mut buf = [0u8; PULSE_SIZE];

        let result = self
            .core
            .pulse_socks
            .get_mut(&fd)
            .map(|stream| stream.read_exact(&mut buf));

        match result {
            Some(Ok(())) => Some(Pulse::decode(&buf)),
            _ => {
                let _ = self.core.dispatch.deregister_fd(fd);
                self.core.pulse_socks.remove(&fd);
                None
            }
        }
    }

    fn handle_pulse(&mut self, pulse: Pulse) {
        use dsibase::wire::PulseCode;

        logging::debug!(self.core.log, "pulse received";
                        "code" => pulse.code, "value" => pulse.value);

        match PulseCode::from_i32(pulse.code) {
            Some(PulseCode::ServerAvailable) => {
                if let Some(endpoint) = self.find_client_by_internal_id(pulse.value) {
                    self.attach_client(endpoint);
                }
            }
            Some(PulseCode::ServerDisconnect) => {
                if let Some(endpoint) = self.find_client_by_internal_id(pulse.value) {
                    self.client_cache.retain(|_, id| *id != endpoint);

                    let CommEngine { core, clients, .. } = self;
                    if let Some(entry) = clients.get_mut(endpoint).and_then(Option::as_mut) {
                        client::detach_interface(&mut *entry.proxy, &mut entry.state, core, true);
                    }
                }
            }
            Some(PulseCode::ClientDetached) => {
                let CommEngine { core, servers, .. } = self;

                for entry in servers.iter_mut().flatten() {
                    if server::handle_client_detached(&mut entry.state, core, pulse.value) {
                        break;
                    }
                }
            }
            None => {
                logging::warn!(self.core.log, "unknown pulse code"; "code" => pulse.code);
            }
        }
    }

    fn find_client_by_internal_id(&self, id: i32) -> Option<EndpointId> {
        self.clients.iter().position(|entry| {
            entry
                .as_ref()
                .map_or(false, |entry| entry.state.id == id)
        })
    }

    /// Start (or restart) the attach handshake of a client.
    pub fn attach_client(&mut self, endpoint: EndpointId) {
        let CommEngine { core, clients, .. } = self;

        let entry = match clients.get_mut(endpoint).and_then(Option::as_mut) {
            Some(entry) => entry,
            None => return,
        };

        if entry.state.connector.is_some() || entry.state.is_connected() {
            return;
        }

        match connect::attach(&mut entry.state, core, endpoint) {
            Progress::Pending => (),
            Progress::Connected => {
                connect::finalize(&mut *entry.proxy, &mut entry.state, core);
            }
            Progress::Failed => {
                connect::fail(&mut *entry.proxy, &mut entry.state, core);
            }
        }
    }

    fn finish_tcp_attach(&mut self, endpoint: EndpointId) {
        let CommEngine { core, clients, .. } = self;

        let entry = match clients.get_mut(endpoint).and_then(Option::as_mut) {
            Some(entry) => entry,
            None => return,
        };

        match connect::on_tcp_reply(&mut entry.state, core) {
            Progress::Connected => {
                connect::finalize(&mut *entry.proxy, &mut entry.state, core);
            }
            _ => {
                connect::fail(&mut *entry.proxy, &mut entry.state, core);
            }
        }
    }

    fn handle_generic_device(&mut self, fd: RawFd, readiness: Ready) {
        let result = if UnixReady::from(readiness).is_error() {
            IoResult::GenericError
        } else if UnixReady::from(readiness).is_hup() && !readiness.is_readable() {
            IoResult::DeviceHungup
        } else if readiness.is_readable() {
            IoResult::DataAvailable
        } else {
            IoResult::CanWriteNow
        };

        let mut device = match self.generic.remove(&fd) {
            Some(device) => device,
            None => return,
        };

        let rearm = (device.handler)(result, self);

        if rearm {
            if !self.generic.contains_key(&fd) {
                self.generic.insert(fd, device);
            }
        } else {
            let _ = self.core.dispatch.deregister_fd(fd);
        }
    }

    /// A connection channel became readable: pull one message off it.
    fn handle_channel_readable(&mut self, fd: RawFd) {
        let channel = match self.core.connections.get(&fd) {
            Some(conn) => conn.channel.clone(),
            None => return,
        };

        let mut hdr_buf = [0u8; HEADER_SIZE];

        if channel.recv_all(&mut hdr_buf).has_failed() {
            self.cleanup_channel(fd);
            return;
        }

        let header = MessageHeader::decode(&hdr_buf);

        if header.magic == 0 {
            // orderly end-of-stream marker
            self.cleanup_channel(fd);
            return;
        }

        if header.magic != MESSAGE_MAGIC {
            logging::error!(self.core.log, "garbage on channel, closing"; "fd" => fd);
            self.cleanup_channel(fd);
            return;
        }

        let payload = match frame::receive_payload(&*channel, &header) {
            Ok(payload) => payload,
            Err(_) => {
                self.cleanup_channel(fd);
                return;
            }
        };

        if header.proto_major != PROTOCOL_VERSION_MAJOR {
            // the message is dropped but the channel survives; the peer
            // may recover within the same major version
            logging::error!(self.core.log, "major protocol version mismatch";
                            "expected" => PROTOCOL_VERSION_MAJOR,
                            "received" => header.proto_major);
            return;
        }

        self.handle_message(header, channel, &payload);
    }

    fn handle_message(&mut self, header: MessageHeader, channel: ChannelRef, payload: &[u8]) {
        logging::debug!(self.core.log, "message";
                        "cmd" => header.cmd,
                        "client_id" => header.client_id.0,
                        "server_id" => header.server_id.0);

        match header.command() {
            Command::ConnectRequest => self.handle_connect_request(header, channel, payload),

            Command::DisconnectRequest => {
                if let Some(endpoint) = self.find_server_by_party(header.server_id) {
                    let CommEngine { core, servers, .. } = self;

                    if let Some(entry) = servers.get_mut(endpoint).and_then(Option::as_mut) {
                        server::handle_disconnect_request(&mut entry.state, core, header.client_id);
                    }
                }
            }

            Command::ConnectResponse => {
                if let Some(endpoint) = self.find_client_by_party(header.client_id) {
                    let CommEngine { core, clients, .. } = self;

                    let entry = match clients.get_mut(endpoint).and_then(Option::as_mut) {
                        Some(entry) => entry,
                        None => return,
                    };

                    if entry.state.connector.is_none() {
                        logging::warn!(entry.state.log, "unexpected connect response");
                        return;
                    }

                    let info = ConnectRequestInfo::decode(payload);

                    match connect::on_connect_response(&mut entry.state, core, &header, info) {
                        Progress::Connected => {
                            connect::finalize(&mut *entry.proxy, &mut entry.state, core);
                        }
                        _ => {
                            connect::fail(&mut *entry.proxy, &mut entry.state, core);
                        }
                    }
                }
            }

            Command::DataRequest => {
                if let Some(endpoint) = self.find_server_by_party(header.server_id) {
                    let CommEngine { core, servers, .. } = self;

                    if let Some(entry) = servers.get_mut(endpoint).and_then(Option::as_mut) {
                        server::handle_data_request(
                            &mut *entry.stub,
                            &mut entry.state,
                            core,
                            &header,
                            payload,
                        );
                    }
                } else {
                    logging::error!(self.core.log, "data request for unknown server";
                                    "server_id" => header.server_id.0);
                }
            }

            Command::DataResponse => {
                if let Some(endpoint) = self.find_client_by_party(header.client_id) {
                    let CommEngine { core, clients, .. } = self;

                    if let Some(entry) = clients.get_mut(endpoint).and_then(Option::as_mut) {
                        client::handle_data_response(
                            &mut *entry.proxy,
                            &mut entry.state,
                            core,
                            &header,
                            payload,
                        );
                    }
                } else {
                    logging::error!(self.core.log, "data response for unknown client";
                                    "client_id" => header.client_id.0);
                }
            }

            Command::Invalid => {
                logging::warn!(self.core.log, "invalid command dropped"; "cmd" => header.cmd);
            }
        }
    }

    fn handle_connect_request(&mut self, header: MessageHeader, channel: ChannelRef, payload: &[u8]) {
        let endpoint = self.find_server_by_party(header.server_id);

        let CommEngine { core, servers, .. } = self;

        match endpoint.and_then(|endpoint| servers.get_mut(endpoint).and_then(Option::as_mut)) {
            Some(entry) => {
                if channel.transport() == Transport::Tcp {
                    let legacy = header.packet_length as usize == CONNECT_INFO_SIZE;
                    let info = TcpConnectRequestInfo::decode(payload);

                    server::handle_connect_request_tcp(
                        &mut entry.state,
                        core,
                        &header,
                        info,
                        &*channel,
                        legacy,
                    );
                } else {
                    let info = ConnectRequestInfo::decode(payload);

                    server::handle_connect_request(&mut entry.state, core, &header, info, &*channel);
                }
            }
            None => {
                logging::error!(core.log, "connect request for unknown server";
                                "server_id" => header.server_id.0);

                // fail the connecting client fast with a zeroed reply
                if channel.transport() == Transport::Tcp
                    && header.packet_length as usize == CONNECT_INFO_SIZE
                {
                    let reply = TcpConnectRequestInfo::default();
                    let _ = channel.send_all(&reply.encode());
                } else {
                    let reply_header = MessageHeader::new(
                        header.server_id,
                        header.client_id,
                        Command::ConnectResponse,
                        PROTOCOL_VERSION_MINOR,
                        CONNECT_INFO_SIZE as u32,
                    );
                    let reply = ConnectRequestInfo::default();
                    let _ = channel.send_vectored(&[&reply_header.encode(), &reply.encode()]);
                }
            }
        }
    }

    /// The channel died: every endpoint still referencing it is detached.
    fn cleanup_channel(&mut self, fd: RawFd) {
        let channel = match self.core.remove_connection(fd) {
            Some(channel) => channel,
            None => return,
        };

        logging::debug!(self.core.log, "cleaning up channel"; "fd" => fd);

        let CommEngine { core, servers, clients, .. } = self;

        for entry in servers.iter_mut().flatten() {
            server::handle_channel_gone(&mut entry.state, core, &channel);
        }

        for entry in clients.iter_mut().flatten() {
            let attached = entry
                .state
                .channel
                .upgrade()
                .map_or(false, |chnl| Rc::ptr_eq(&chnl, &channel));

            if attached {
                client::detach_interface(&mut *entry.proxy, &mut entry.state, core, true);
            }
        }
    }

    /// Server lookup by party id, filling the cache on first use. The
    /// party ids are not known when a server is added, only after
    /// registration.
    fn find_server_by_party(&mut self, id: PartyId) -> Option<EndpointId> {
        if let Some(&endpoint) = self.server_cache.get(&id) {
            if self.servers.get(endpoint).map_or(false, Option::is_some) {
                return Some(endpoint);
            }

            self.server_cache.remove(&id);
        }

        let endpoint = self.servers.iter().position(|entry| {
            entry.as_ref().map_or(false, |entry| {
                entry.state.server_id == id || entry.state.tcp_server_id == id
            })
        })?;

        self.server_cache.insert(id, endpoint);
        Some(endpoint)
    }

    fn find_client_by_party(&mut self, id: PartyId) -> Option<EndpointId> {
        if let Some(&endpoint) = self.client_cache.get(&id) {
            if self.clients.get(endpoint).map_or(false, Option::is_some) {
                return Some(endpoint);
            }

            self.client_cache.remove(&id);
        }

        let endpoint = self
            .clients
            .iter()
            .position(|entry| entry.as_ref().map_or(false, |entry| entry.state.client_id == id))?;

        self.client_cache.insert(id, endpoint);
        Some(endpoint)
    }
}
