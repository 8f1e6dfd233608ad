//! Server-side runtime: the client-connection registry, per-request
//! notification bookkeeping, register sessions, attribute and information
//! emission, and the request unblock/resume mechanism.

use crate::channel::{null_channel_weak, Channel, ChannelWeak};
use crate::engine::EngineCore;
use crate::error::ErrorUtils;
use crate::frame::RequestWriter;
use dsibase::istream::IStream;
use dsibase::logging::{self, Logger};
use dsibase::ostream::OStream;
use dsibase::wire::{
    Command, ConnectRequestInfo, DataState, EventInfo, MessageHeader, RequestType, ResultType,
    TcpConnectRequestInfo, UpdateType, CONNECT_INFO_SIZE,
};
use dsibase::{
    is_attribute_id, is_request_id, InterfaceDescriptor, PartyId, INVALID_ID, INVALID_SEQUENCE_NR,
    INVALID_SESSION_ID, PROTOCOL_VERSION_MINOR,
};
use hashbrown::{HashMap, HashSet};
use std::process;
use std::rc::Rc;

/// A client's standing interest in one response, information or attribute
/// id. `session_id` groups register-notifications, plain notifications
/// carry the invalid session id.
#[derive(Debug, Clone)]
pub struct Notification {
    pub client_id: PartyId,
    pub notify_id: u32,
    pub sequence_nr: i32,
    pub session_id: i32,
}

/// A register session: the server-side grouping handle for notifications
/// registered under one client-chosen sequence number.
#[derive(Debug, Clone)]
struct SessionData {
    session_id: i32,
    client_id: PartyId,
    sequence_nr: i32,
}

/// One connected client of this server.
pub struct ClientConnection {
    pub id: i32,
    pub client_id: PartyId,
    pub server_id: PartyId,
    pub proto_minor: u16,
    pub channel: ChannelWeak,
    pub notification_id: u32,
}

/// Inbound data request as presented to the stub.
pub struct RequestHandle<'p> {
    pub client_id: PartyId,
    pub server_id: PartyId,
    pub proto_minor: u16,
    pub info: EventInfo,
    pub payload: &'p [u8],
}

impl<'p> RequestHandle<'p> {
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.info.request_id
    }

    #[inline]
    pub fn sequence_nr(&self) -> i32 {
        self.info.sequence_nr
    }

    #[inline]
    pub fn istream(&self) -> IStream {
        IStream::new(self.payload)
    }
}

/// The user-implemented half of a service stub. Generated skeletons
/// implement request dispatch and attribute access on top of this.
pub trait Stub: 'static {
    /// Dispatch one request to the user's handler.
    fn process_request(&mut self, request: &RequestHandle, ctx: &mut ServerCtx);

    /// Serialize the current value of an attribute, complete or as the
    /// slice described by the update parameters.
    fn write_attribute(
        &self,
        _id: u32,
        _os: &mut OStream,
        _kind: UpdateType,
        _position: i16,
        _count: i16,
    ) {
    }

    /// Current state of an attribute.
    fn attribute_state(&self, _id: u32) -> DataState {
        DataState::NotAvailable
    }
}

/// Runtime bookkeeping of one server (stub) attached to an engine.
pub struct ServerState {
    pub desc: InterfaceDescriptor,
    pub(crate) log: Logger,
    pub(crate) id: i32,
    pub server_id: PartyId,
    pub tcp_server_id: PartyId,
    pub user_group: String,
    tcp_requested: bool,
    response_map: fn(u32) -> u32,

    connections: Vec<ClientConnection>,
    notifications: Vec<Notification>,
    sessions: Vec<SessionData>,
    active_sessions: HashSet<i32>,
    unblocked: HashMap<i32, Notification>,
    /// Response ids whose request arrived but whose response is still owed.
    pending: HashSet<u32>,

    current_client: PartyId,
    current_sequence: i32,
    response_id: u32,
}

impl ServerState {
    /// `response_map` is the generator-provided mapping from a request id
    /// to its correlated response id (`INVALID_ID` when the request has no
    /// response).
    pub fn new(
        ifname: &str,
        role: &str,
        major: u32,
        minor: u32,
        enable_tcp: bool,
        response_map: fn(u32) -> u32,
    ) -> ServerState {
        ServerState {
            desc: InterfaceDescriptor::new(format!("{}.{}", ifname, role), major, minor),
            log: logging::discard(),
            id: 0,
            server_id: PartyId::default(),
            tcp_server_id: PartyId::default(),
            user_group: String::new(),
            tcp_requested: enable_tcp,
            response_map,
            connections: Vec::new(),
            notifications: Vec::new(),
            sessions: Vec::new(),
            active_sessions: HashSet::new(),
            unblocked: HashMap::new(),
            pending: HashSet::new(),
            current_client: PartyId::default(),
            current_sequence: INVALID_SEQUENCE_NR,
            response_id: INVALID_ID,
        }
    }

    #[inline]
    pub(crate) fn tcp_enabled(&self, force_tcp: bool) -> bool {
        self.tcp_requested || force_tcp
    }

    #[inline]
    pub fn current_sequence(&self) -> i32 {
        self.current_sequence
    }

    fn find_connection(&self, client_id: PartyId) -> Option<usize> {
        self.connections.iter().position(|conn| conn.client_id == client_id)
    }

    fn find_session(&self, sequence_nr: i32, client_id: PartyId) -> Option<i32> {
        if sequence_nr == INVALID_SEQUENCE_NR {
            return None;
        }

        self.sessions
            .iter()
            .rev()
            .find(|session| session.client_id == client_id && session.sequence_nr == sequence_nr)
            .map(|session| session.session_id)
    }

    /// Remove one (or with `None` all) of a client's notifications.
    fn remove_notification(&mut self, client_id: PartyId, id: Option<u32>) {
        self.notifications
            .retain(|n| n.client_id != client_id || id.map_or(false, |id| n.notify_id != id));
    }

    fn remove_session_notifications(&mut self, session_id: i32) {
        self.notifications.retain(|n| n.session_id != session_id);
    }

    fn remove_all_sessions(&mut self, client_id: PartyId) {
        let gone: Vec<i32> = self
            .sessions
            .iter()
            .filter(|s| s.client_id == client_id)
            .map(|s| s.session_id)
            .collect();

        for session_id in gone {
            self.remove_session_notifications(session_id);
        }

        self.sessions.retain(|s| s.client_id != client_id);
    }

    fn remove_unblocked_sessions(&mut self, client_id: PartyId) {
        self.unblocked.retain(|_, n| n.client_id != client_id);
    }

    /// Forget everything related to one client connection.
    fn drop_client(&mut self, index: usize, core: &mut EngineCore) {
        let conn = self.connections.remove(index);

        logging::debug!(self.log, "dropping client connection";
                        "client_id" => conn.client_id.0,
                        "connection_id" => conn.id);

        core.broker.clear_notification(conn.notification_id);

        self.remove_notification(conn.client_id, None);
        self.remove_all_sessions(conn.client_id);
        self.remove_unblocked_sessions(conn.client_id);
    }
}

/// Server context handed to stub callbacks: the engine core plus the
/// server's own runtime state.
pub struct ServerCtx<'a> {
    pub core: &'a mut EngineCore,
    pub state: &'a mut ServerState,
}

impl<'a> ServerCtx<'a> {
    #[inline]
    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.state.desc
    }

    #[inline]
    pub fn current_sequence(&self) -> i32 {
        self.state.current_sequence
    }

    /// Stop the engine loop with the given exit code.
    pub fn stop(&mut self, exitcode: i32) {
        self.core.dispatch.stop(exitcode);
    }

    /// Emit a response or information. Notifications registered under a
    /// session only fire while their session is in the active set; one-shot
    /// response notifications are dropped after firing.
    pub fn send_response(&mut self, response_id: u32, write: &dyn Fn(&mut OStream)) {
        send_keyed(self.state, response_id, response_id, ResultType::Ok, Some(write));
    }

    /// Emit an error for the given update id: request ids produce a
    /// request-error on their correlated response notification, response
    /// ids an invalid-response. The optional error enum value is carried in
    /// the payload.
    pub fn send_error(&mut self, update_id: u32, error: Option<u32>) {
        let write = |os: &mut OStream| {
            if let Some(value) = error {
                os.write_u32(value);
            }
        };

        if is_request_id(update_id) {
            let key = (self.state.response_map)(update_id);
            send_keyed(self.state, key, update_id, ResultType::RequestError, Some(&write));
        } else {
            send_keyed(self.state, update_id, update_id, ResultType::Invalid, Some(&write));
        }
    }

    /// Push an attribute change to every subscriber. The closure serializes
    /// the (partial) value and is only invoked for valid attributes.
    pub fn notify_attribute(
        &mut self,
        id: u32,
        data_state: DataState,
        write: &dyn Fn(&mut OStream),
    ) {
        let result = match data_state {
            DataState::Ok => ResultType::DataOk,
            _ => ResultType::DataInvalid,
        };

        let payload = if data_state == DataState::Ok { Some(write) } else { None };

        send_attribute(self.state, id, result, payload);
    }

    /// Decouple the current request from its response: the pending response
    /// notification moves aside under a fresh handle and the handler may
    /// return. Returns the invalid session id when no response is pending.
    pub fn unblock_request(&mut self) -> i32 {
        let state = &mut *self.state;

        if state.current_sequence == INVALID_SEQUENCE_NR {
            logging::error!(state.log, "unblock_request outside of request processing");
            return INVALID_SESSION_ID;
        }

        let mut handle = INVALID_SESSION_ID;

        if state.response_id != INVALID_ID {
            let position = state.notifications.iter().rposition(|n| {
                n.notify_id == state.response_id
                    && n.session_id == INVALID_SESSION_ID
                    && n.client_id == state.current_client
            });

            if let Some(position) = position {
                handle = self.core.next_id();
                let notification = state.notifications.remove(position);
                state.unblocked.insert(handle, notification);
            }

            state.pending.remove(&state.response_id);
            state.response_id = INVALID_ID;
            state.current_sequence = INVALID_SEQUENCE_NR;
        }

        handle
    }

    /// Resume an unblocked request: the saved notification becomes current
    /// again and the response is emitted the normal way.
    pub fn prepare_response(&mut self, handle: i32) {
        let state = &mut *self.state;

        if state.response_id != INVALID_ID {
            logging::error!(state.log, "prepare_response while a response is pending");
            return;
        }

        if let Some(notification) = state.unblocked.remove(&handle) {
            state.response_id = notification.notify_id;
            state.current_client = notification.client_id;
            state.current_sequence = notification.sequence_nr;
            state.pending.insert(notification.notify_id);
            state.notifications.push(notification);
        }
    }

    /// Session handle of the register session the currently processed
    /// request belongs to, created on demand.
    pub fn register_current_session(&mut self) -> i32 {
        let state = &mut *self.state;

        if let Some(session_id) = state.find_session(state.current_sequence, state.current_client)
        {
            return session_id;
        }

        let session_id = self.core.next_id();
        state.sessions.push(SessionData {
            session_id,
            client_id: state.current_client,
            sequence_nr: state.current_sequence,
        });

        session_id
    }

    /// Mark a register session as a recipient of the next emission.
    pub fn add_active_session(&mut self, session_id: i32) {
        self.state.active_sessions.insert(session_id);
    }

    /// Clear the recipient set after an emission.
    pub fn clear_active_sessions(&mut self) {
        self.state.active_sessions.clear();
    }
}

/// Send on every notification matching `key`, honoring the active-session
/// filter and dropping one-shot records after firing.
fn send_keyed(
    state: &mut ServerState,
    key: u32,
    wire_id: u32,
    result: ResultType,
    write: Option<&dyn Fn(&mut OStream)>,
) {
    let mut stale: Vec<PartyId> = Vec::new();
    let mut index = state.notifications.len();

    while index > 0 {
        index -= 1;

        let n = state.notifications[index].clone();

        if n.notify_id != key {
            continue;
        }

        if n.session_id != INVALID_SESSION_ID && !state.active_sessions.contains(&n.session_id) {
            continue;
        }

        let target = match state.find_connection(n.client_id) {
            Some(at) => {
                let conn = &state.connections[at];
                (conn.channel.upgrade(), conn.server_id, conn.proto_minor)
            }
            None => {
                stale.push(n.client_id);
                continue;
            }
        };

        match target {
            (Some(channel), server_id, proto_minor) => {
                let mut writer = RequestWriter::data_response(
                    channel,
                    state.desc.packed_version(),
                    result,
                    wire_id,
                    n.sequence_nr,
                    n.client_id,
                    server_id,
                    proto_minor,
                );

                if let Some(write) = write {
                    write(&mut writer.ostream());
                }

                if writer.flush().has_failed() {
                    logging::warn!(state.log, "sending response failed";
                                   "id" => wire_id, "client_id" => n.client_id.0);
                }

                if n.sequence_nr != INVALID_SEQUENCE_NR && n.session_id == INVALID_SESSION_ID {
                    // one-shot notification
                    state.notifications.remove(index);
                }
            }
            (None, _, _) => {
                logging::warn!(state.log, "response channel already gone"; "id" => wire_id);
            }
        }
    }

    for client_id in stale {
        state.remove_notification(client_id, None);
    }

    if state.response_id == key {
        state.response_id = INVALID_ID;
    }
    state.pending.remove(&key);
}

/// Send an attribute update to every subscriber of `id`. Attribute
/// notifications are persistent and carry no sequence number.
fn send_attribute(
    state: &mut ServerState,
    id: u32,
    result: ResultType,
    write: Option<&dyn Fn(&mut OStream)>,
) {
    let mut stale: Vec<PartyId> = Vec::new();

    for index in 0..state.notifications.len() {
        let n = state.notifications[index].clone();

        if n.notify_id != id {
            continue;
        }

        let target = match state.find_connection(n.client_id) {
            Some(at) => {
                let conn = &state.connections[at];
                (conn.channel.upgrade(), conn.server_id, conn.proto_minor)
            }
            None => {
                stale.push(n.client_id);
                continue;
            }
        };

        if let (Some(channel), server_id, proto_minor) = target {
            let mut writer = RequestWriter::data_response(
                channel,
                state.desc.packed_version(),
                result,
                id,
                INVALID_SEQUENCE_NR,
                n.client_id,
                server_id,
                proto_minor,
            );

            if let Some(write) = write {
                write(&mut writer.ostream());
            }

            if writer.flush().has_failed() {
                logging::warn!(state.log, "sending attribute update failed";
                               "id" => id, "client_id" => n.client_id.0);
            }
        } else {
            logging::warn!(state.log, "attribute channel already gone"; "id" => id);
        }
    }

    for client_id in stale {
        state.remove_notification(client_id, None);
    }
}

/// Send an error result directly to one client, outside of the
/// notification bookkeeping (busy replies).
fn send_error_to_client(
    state: &mut ServerState,
    client_id: PartyId,
    wire_id: u32,
    result: ResultType,
    sequence_nr: i32,
) {
    let target = match state.find_connection(client_id) {
        Some(at) => {
            let conn = &state.connections[at];
            (conn.channel.upgrade(), conn.server_id, conn.proto_minor)
        }
        None => {
            state.remove_notification(client_id, None);
            return;
        }
    };

    if let (Some(channel), server_id, proto_minor) = target {
        let mut writer = RequestWriter::data_response(
            channel,
            state.desc.packed_version(),
            result,
            wire_id,
            sequence_nr,
            client_id,
            server_id,
            proto_minor,
        );

        writer.ostream().write_u32(0);

        if writer.flush().has_failed() {
            logging::warn!(state.log, "sending error failed"; "id" => wire_id);
        }
    }
}

/// Send the current value (or invalid state) of an attribute to a single
/// new subscriber.
fn send_attribute_to_client(
    stub: &dyn Stub,
    state: &mut ServerState,
    client_id: PartyId,
    id: u32,
) {
    let attr_state = stub.attribute_state(id);

    let result = match attr_state {
        DataState::Ok => ResultType::DataOk,
        DataState::Invalid => ResultType::DataInvalid,
        DataState::NotAvailable => return,
    };

    let target = match state.find_connection(client_id) {
        Some(at) => {
            let conn = &state.connections[at];
            (conn.channel.upgrade(), conn.server_id, conn.proto_minor)
        }
        None => return,
    };

    if let (Some(channel), server_id, proto_minor) = target {
        let mut writer = RequestWriter::data_response(
            channel,
            state.desc.packed_version(),
            result,
            id,
            INVALID_SEQUENCE_NR,
            client_id,
            server_id,
            proto_minor,
        );

        if attr_state == DataState::Ok {
            stub.write_attribute(id, &mut writer.ostream(), UpdateType::Complete, -1, -1);
        }

        if writer.flush().has_failed() {
            logging::warn!(state.log, "sending initial attribute failed"; "id" => id);
        }
    }
}

/// Dispatch one inbound data request.
pub(crate) fn handle_data_request(
    stub: &mut dyn Stub,
    state: &mut ServerState,
    core: &mut EngineCore,
    header: &MessageHeader,
    payload: &[u8],
) {
    if payload.len() < dsibase::wire::EVENT_INFO_SIZE {
        logging::warn!(state.log, "short data request dropped");
        return;
    }

    let mut info_buf = [0u8; dsibase::wire::EVENT_INFO_SIZE];
    info_buf.copy_from_slice(&payload[..dsibase::wire::EVENT_INFO_SIZE]);
    let info = EventInfo::decode(&info_buf);
    let user = &payload[dsibase::wire::EVENT_INFO_SIZE..];

    let expected_minor = state
        .find_connection(header.client_id)
        .map(|at| state.connections[at].proto_minor)
        .unwrap_or(PROTOCOL_VERSION_MINOR);

    if expected_minor != header.proto_minor {
        logging::error!(state.log, "data request with wrong minor protocol version";
                        "expected" => expected_minor, "received" => header.proto_minor);
        return;
    }

    let request_type = match info.request_type() {
        Some(ty) => ty,
        None => {
            logging::error!(state.log, "unknown request type"; "type" => info.ty);
            return;
        }
    };

    logging::debug!(state.log, "data request";
                    "type" => ?request_type,
                    "id" => info.request_id,
                    "sequence" => info.sequence_nr,
                    "client_id" => header.client_id.0);

    match request_type {
        RequestType::Request => {
            let response_id = (state.response_map)(info.request_id);

            // a prior invocation by this client is still unanswered when a
            // request-created response notification (nonzero sequence) is
            // present or the response is parked in an unblocked session
            let outstanding = response_id != INVALID_ID
                && (state.notifications.iter().any(|n| {
                    n.notify_id == response_id
                        && n.client_id == header.client_id
                        && n.session_id == INVALID_SESSION_ID
                        && n.sequence_nr != INVALID_SEQUENCE_NR
                }) || state
                    .unblocked
                    .values()
                    .any(|n| n.notify_id == response_id && n.client_id == header.client_id));

            if outstanding {
                send_error_to_client(
                    state,
                    header.client_id,
                    info.request_id,
                    ResultType::RequestBusy,
                    info.sequence_nr,
                );
                return;
            }

            state.response_id = response_id;

            if response_id != INVALID_ID {
                state.notifications.push(Notification {
                    client_id: header.client_id,
                    notify_id: response_id,
                    sequence_nr: info.sequence_nr,
                    session_id: INVALID_SESSION_ID,
                });
                state.pending.insert(response_id);
            }

            state.current_client = header.client_id;
            state.current_sequence = info.sequence_nr;

            let handle = RequestHandle {
                client_id: header.client_id,
                server_id: header.server_id,
                proto_minor: header.proto_minor,
                info,
                payload: user,
            };

            stub.process_request(
                &handle,
                &mut ServerCtx {
                    core: &mut *core,
                    state: &mut *state,
                },
            );

            if state.response_id != INVALID_ID && state.pending.contains(&state.response_id) {
                logging::warn!(state.log, "response is dangling, consider unblock_request";
                               "id" => info.request_id, "sequence" => info.sequence_nr);
            }

            state.response_id = INVALID_ID;
            state.current_sequence = INVALID_SEQUENCE_NR;
            state.current_client = PartyId::default();
        }

        RequestType::RequestNotify | RequestType::RequestRegisterNotify => {
            let register = request_type == RequestType::RequestRegisterNotify;

            let exists = state.notifications.iter().any(|n| {
                n.client_id == header.client_id
                    && n.notify_id == info.request_id
                    && (!register || n.sequence_nr == info.sequence_nr)
            });

            if !exists {
                let session_id = if register {
                    match state.find_session(info.sequence_nr, header.client_id) {
                        Some(session_id) => session_id,
                        None => {
                            let session_id = core.next_id();
                            state.sessions.push(SessionData {
                                session_id,
                                client_id: header.client_id,
                                sequence_nr: info.sequence_nr,
                            });
                            session_id
                        }
                    }
                } else {
                    INVALID_SESSION_ID
                };

                state.notifications.push(Notification {
                    client_id: header.client_id,
                    notify_id: info.request_id,
                    sequence_nr: if register { info.sequence_nr } else { INVALID_SEQUENCE_NR },
                    session_id,
                });
            }

            if is_attribute_id(info.request_id) {
                send_attribute_to_client(stub, state, header.client_id, info.request_id);
            }
        }

        RequestType::RequestStopNotify | RequestType::RequestStopRegisterNotify => {
            state.remove_notification(header.client_id, Some(info.request_id));
        }

        RequestType::RequestStopAllNotify => {
            state.remove_notification(header.client_id, None);
        }

        RequestType::RequestStopAllRegisterNotify => {
            // every session matching this client and sequence number goes
            let gone: Vec<i32> = state
                .sessions
                .iter()
                .filter(|s| s.client_id == header.client_id && s.sequence_nr == info.sequence_nr)
                .map(|s| s.session_id)
                .collect();

            for session_id in gone {
                state.remove_session_notifications(session_id);
                state.sessions.retain(|s| s.session_id != session_id);
            }
        }

        RequestType::RequestLoadComponent => {
            logging::debug!(state.log, "load component request ignored");
        }
    }
}

/// Accept a local connect request: open the persistent reverse channel,
/// arm the client-detach notification and reply with this server's own
/// endpoint.
pub(crate) fn handle_connect_request(
    state: &mut ServerState,
    core: &mut EngineCore,
    header: &MessageHeader,
    info: ConnectRequestInfo,
    reply_channel: &dyn Channel,
) {
    logging::debug!(state.log, "connect request";
                    "client_id" => header.client_id.0,
                    "peer_pid" => info.pid,
                    "peer_chid" => info.channel);

    // the connection carrying the request may be temporary; the reverse
    // channel is attached through the engine's cache
    let channel = core.attach_local(info.pid, info.channel as i32);
    let proto_minor = header.proto_minor.min(PROTOCOL_VERSION_MINOR);

    let id = core.next_id();
    let notification_id =
        core.broker
            .set_client_detach_notification(header.client_id, core.notify_chid(), id);

    state.connections.push(ClientConnection {
        id,
        client_id: header.client_id,
        server_id: header.server_id,
        proto_minor,
        channel: channel
            .as_ref()
            .map(|chnl| Rc::downgrade(chnl))
            .unwrap_or_else(null_channel_weak),
        notification_id,
    });

    let reply = ConnectRequestInfo {
        pid: process::id(),
        channel: core.local_chid() as u32,
    };

    let reply_header = MessageHeader::new(
        header.server_id,
        header.client_id,
        Command::ConnectResponse,
        proto_minor,
        CONNECT_INFO_SIZE as u32,
    );

    if reply_channel
        .send_vectored(&[&reply_header.encode(), &reply.encode()])
        .has_failed()
    {
        logging::error!(state.log, "error sending connect response");
    }
}

/// Accept a TCP connect request. Legacy peers sent a bare info block and
/// expect a bare reply; modern peers exchange full headers.
pub(crate) fn handle_connect_request_tcp(
    state: &mut ServerState,
    core: &mut EngineCore,
    header: &MessageHeader,
    info: TcpConnectRequestInfo,
    reply_channel: &dyn Channel,
    legacy: bool,
) {
    logging::debug!(state.log, "tcp connect request";
                    "client_id" => header.client_id.0,
                    "legacy" => legacy);

    let mut reply = TcpConnectRequestInfo::default();
    let mut proto_minor = PROTOCOL_VERSION_MINOR;

    if state.tcp_enabled(core.cfg.force_tcp) {
        let channel = core.attach_tcp(info.ip_address, info.port as u16, false);
        proto_minor = header.proto_minor.min(PROTOCOL_VERSION_MINOR);

        let id = core.next_id();
        let notification_id =
            core.broker
                .set_client_detach_notification(header.client_id, core.notify_chid(), id);

        state.connections.push(ClientConnection {
            id,
            client_id: header.client_id,
            server_id: header.server_id,
            proto_minor,
            channel: channel
                .as_ref()
                .map(|chnl| Rc::downgrade(chnl))
                .unwrap_or_else(null_channel_weak),
            notification_id,
        });

        match (reply_channel.local_tcp_addr(), core.ensure_tcp_port()) {
            (Some(addr), Some(port)) => {
                reply.ip_address = u32::from(*addr.ip());
                reply.port = u32::from(port);
            }
            _ => {
                logging::error!(state.log, "error retrieving local tcp endpoint");
            }
        }
    } else {
        logging::error!(state.log, "tcp transport not enabled");
    }

    let sent = if legacy {
        reply_channel.send_all(&reply.encode())
    } else {
        let reply_header = MessageHeader::new(
            header.server_id,
            header.client_id,
            Command::ConnectResponse,
            proto_minor,
            CONNECT_INFO_SIZE as u32,
        );

        reply_channel.send_vectored(&[&reply_header.encode(), &reply.encode()])
    };

    if sent.has_failed() {
        logging::error!(state.log, "error sending tcp connect response");
    }
}

/// Client sent a disconnect request: clear its subscriptions, sessions and
/// connection.
pub(crate) fn handle_disconnect_request(
    state: &mut ServerState,
    core: &mut EngineCore,
    client_id: PartyId,
) {
    if let Some(index) = state.find_connection(client_id) {
        state.drop_client(index, core);
    }
}

/// The servicebroker reported a client as detached (or the channel died).
/// Returns true when the connection belonged to this server.
pub(crate) fn handle_client_detached(
    state: &mut ServerState,
    core: &mut EngineCore,
    connection_id: i32,
) -> bool {
    match state.connections.iter().position(|conn| conn.id == connection_id) {
        Some(index) => {
            state.drop_client(index, core);
            true
        }
        None => false,
    }
}

/// Detach every connection whose channel is the one being cleaned up.
pub(crate) fn handle_channel_gone(
    state: &mut ServerState,
    core: &mut EngineCore,
    channel: &crate::channel::ChannelRef,
) {
    let gone: Vec<i32> = state
        .connections
        .iter()
        .filter(|conn| {
            conn.channel
                .upgrade()
                .map_or(false, |chnl| Rc::ptr_eq(&chnl, channel))
        })
        .map(|conn| conn.id)
        .collect();

    for connection_id in gone {
        handle_client_detached(state, core, connection_id);
    }
}

/// Register this server with the servicebroker, TCP endpoint included when
/// enabled.
pub(crate) fn register_interface(state: &mut ServerState, core: &mut EngineCore) {
    if state.tcp_enabled(core.cfg.force_tcp) {
        match core.ensure_tcp_port() {
            Some(port) => {
                match core
                    .broker
                    .register_interface_tcp(&state.desc, core.cfg.ip_address, port)
                {
                    Ok(server_id) => state.tcp_server_id = server_id,
                    Err(_) => {
                        logging::error!(state.log, "error registering tcp interface");
                    }
                }
            }
            None => {
                logging::error!(state.log, "error starting tcp acceptor");
            }
        }
    }

    match core
        .broker
        .register_interface(&state.desc, core.local_chid(), &state.user_group)
    {
        Ok(server_id) => {
            logging::debug!(state.log, "interface registered"; "server_id" => server_id.0);
            state.server_id = server_id;
        }
        Err(_) => {
            logging::error!(state.log, "error registering interface");
        }
    }
}

/// Drop all client state and take the interface out of the registry.
pub(crate) fn unregister_interface(state: &mut ServerState, core: &mut EngineCore) {
    while let Some(conn) = state.connections.pop() {
        core.broker.clear_notification(conn.notification_id);
        state.remove_notification(conn.client_id, None);
    }

    state.sessions.clear();
    state.unblocked.clear();
    state.pending.clear();

    if state.server_id.is_assigned() {
        core.broker.unregister_interface(state.server_id);
        state.server_id.clear();
    }

    if state.tcp_server_id.is_assigned() {
        core.broker.unregister_interface(state.tcp_server_id);
        state.tcp_server_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::EngineCore;
    use crate::testutil::MockChannel;
    use dsibase::wire::EVENT_INFO_SIZE;
    use dsibase::{RESPONSE_ID_FIRST, REQUEST_ID_FIRST};

    const REQ_PING: u32 = REQUEST_ID_FIRST + 1;
    const RSP_PONG: u32 = RESPONSE_ID_FIRST + 1;

    fn response_map(id: u32) -> u32 {
        match id {
            REQ_PING => RSP_PONG,
            _ => INVALID_ID,
        }
    }

    struct EchoStub {
        requests: usize,
        unblock: bool,
        handle: i32,
    }

    impl Stub for EchoStub {
        fn process_request(&mut self, request: &RequestHandle, ctx: &mut ServerCtx) {
            self.requests += 1;

            assert_eq!(request.request_id(), REQ_PING);

            if self.unblock {
                self.handle = ctx.unblock_request();
            } else {
                ctx.send_response(RSP_PONG, &|os| os.write_str("pong"));
            }
        }
    }

    fn core() -> EngineCore {
        EngineCore::new(Config::default(), logging::discard()).unwrap()
    }

    fn state_with_connection(channel: &std::rc::Rc<MockChannel>) -> ServerState {
        let mut state = ServerState::new("ping", "test", 1, 0, false, response_map);

        state.connections.push(ClientConnection {
            id: 1,
            client_id: PartyId::new(1, 1),
            server_id: PartyId::new(2, 2),
            proto_minor: PROTOCOL_VERSION_MINOR,
            channel: {
                let dyn_channel: std::rc::Rc<dyn Channel> = channel.clone();
                std::rc::Rc::downgrade(&dyn_channel)
            },
            notification_id: 0,
        });

        state
    }

    fn request_header() -> MessageHeader {
        MessageHeader::new(
            PartyId::new(2, 2),
            PartyId::new(1, 1),
            Command::DataRequest,
            PROTOCOL_VERSION_MINOR,
            0,
        )
    }

    fn request_payload(id: u32, sequence_nr: i32) -> Vec<u8> {
        let info = EventInfo::new(1 << 16, RequestType::Request as u32, id, sequence_nr);
        info.encode().to_vec()
    }

    #[test]
    fn test_request_response_cycle() {
        let channel = MockChannel::new();
        let mut state = state_with_connection(&channel);
        let mut core = core();
        let mut stub = EchoStub { requests: 0, unblock: false, handle: 0 };

        let header = request_header();
        handle_data_request(&mut stub, &mut state, &mut core, &header, &request_payload(REQ_PING, 5));

        assert_eq!(stub.requests, 1);
        // the response notification was consumed by the reply
        assert!(state.notifications.is_empty());
        assert!(state.pending.is_empty());

        // response went out with the request's sequence number
        let sent = channel.take_sent();
        let info = MockChannel::event_info(&sent);
        assert_eq!(info.sequence_nr, 5);
        assert_eq!(info.request_id, RSP_PONG);
        assert_eq!(info.result_type(), Some(ResultType::Ok));
    }

    #[test]
    fn test_second_request_is_busy_while_unblocked() {
        let channel = MockChannel::new();
        let mut state = state_with_connection(&channel);
        let mut core = core();
        let mut stub = EchoStub { requests: 0, unblock: true, handle: 0 };

        let header = request_header();
        handle_data_request(&mut stub, &mut state, &mut core, &header, &request_payload(REQ_PING, 5));

        assert_eq!(stub.requests, 1);
        assert_ne!(stub.handle, INVALID_SESSION_ID);
        assert_eq!(state.unblocked.len(), 1);
        channel.take_sent();

        // a second identical request is refused busy without user code
        handle_data_request(&mut stub, &mut state, &mut core, &header, &request_payload(REQ_PING, 6));

        assert_eq!(stub.requests, 1);
        let sent = channel.take_sent();
        let info = MockChannel::event_info(&sent);
        assert_eq!(info.result_type(), Some(ResultType::RequestBusy));
        assert_eq!(info.sequence_nr, 6);

        // resuming restores the notification and the response echoes the
        // original sequence number
        let handle = stub.handle;
        {
            let mut ctx = ServerCtx { core: &mut core, state: &mut state };
            ctx.prepare_response(handle);
            ctx.send_response(RSP_PONG, &|os| os.write_str("late"));
        }

        let sent = channel.take_sent();
        let info = MockChannel::event_info(&sent);
        assert_eq!(info.sequence_nr, 5);
        assert_eq!(info.result_type(), Some(ResultType::Ok));
        assert!(state.unblocked.is_empty());
        assert!(state.notifications.is_empty());
    }

    #[test]
    fn test_notify_dedup() {
        let channel = MockChannel::new();
        let mut state = state_with_connection(&channel);
        let mut core = core();
        let mut stub = EchoStub { requests: 0, unblock: false, handle: 0 };

        let header = request_header();
        let info = EventInfo::new(1 << 16, RequestType::RequestNotify as u32, RSP_PONG, 0);

        handle_data_request(&mut stub, &mut state, &mut core, &header, &info.encode().to_vec());
        handle_data_request(&mut stub, &mut state, &mut core, &header, &info.encode().to_vec());

        assert_eq!(state.notifications.len(), 1);
        assert_eq!(state.notifications[0].session_id, INVALID_SESSION_ID);
    }

    #[test]
    fn test_register_notify_creates_session_and_filters() {
        let channel = MockChannel::new();
        let mut state = state_with_connection(&channel);
        let mut core = core();
        let mut stub = EchoStub { requests: 0, unblock: false, handle: 0 };

        let header = request_header();
        let info = EventInfo::new(1 << 16, RequestType::RequestRegisterNotify as u32, RSP_PONG, 77);

        handle_data_request(&mut stub, &mut state, &mut core, &header, &info.encode().to_vec());

        assert_eq!(state.sessions.len(), 1);
        let session_id = state.sessions[0].session_id;
        assert_eq!(state.notifications[0].session_id, session_id);

        // not in the active set: nothing is emitted
        send_keyed(&mut state, RSP_PONG, RSP_PONG, ResultType::Ok, None);
        assert!(channel.take_sent().is_empty());

        // active: the registered client receives the information
        state.active_sessions.insert(session_id);
        send_keyed(&mut state, RSP_PONG, RSP_PONG, ResultType::Ok, None);
        let sent = channel.take_sent();
        assert!(!sent.is_empty());

        // register notifications are not one-shot
        assert_eq!(state.notifications.len(), 1);
    }

    #[test]
    fn test_stop_all_register_notify_removes_all_matches() {
        let channel = MockChannel::new();
        let mut state = state_with_connection(&channel);
        let mut core = core();
        let mut stub = EchoStub { requests: 0, unblock: false, handle: 0 };
        let client_id = PartyId::new(1, 1);

        // two sessions sharing one sequence number (id wraparound case)
        for session_id in [10, 11].iter() {
            state.sessions.push(SessionData {
                session_id: *session_id,
                client_id,
                sequence_nr: 42,
            });
            state.notifications.push(Notification {
                client_id,
                notify_id: RSP_PONG,
                sequence_nr: 42,
                session_id: *session_id,
            });
        }

        let header = request_header();
        let info = EventInfo::new(
            1 << 16,
            RequestType::RequestStopAllRegisterNotify as u32,
            RSP_PONG,
            42,
        );
        handle_data_request(&mut stub, &mut state, &mut core, &header, &info.encode().to_vec());

        assert!(state.sessions.is_empty());
        assert!(state.notifications.is_empty());
    }

    #[test]
    fn test_disconnect_clears_everything() {
        let channel = MockChannel::new();
        let mut state = state_with_connection(&channel);
        let mut core = core();
        let client_id = PartyId::new(1, 1);

        state.notifications.push(Notification {
            client_id,
            notify_id: RSP_PONG,
            sequence_nr: 1,
            session_id: INVALID_SESSION_ID,
        });
        state.sessions.push(SessionData { session_id: 5, client_id, sequence_nr: 9 });
        state.unblocked.insert(
            17,
            Notification { client_id, notify_id: RSP_PONG, sequence_nr: 1, session_id: INVALID_SESSION_ID },
        );

        handle_disconnect_request(&mut state, &mut core, client_id);

        assert!(state.connections.is_empty());
        assert!(state.notifications.is_empty());
        assert!(state.sessions.is_empty());
        assert!(state.unblocked.is_empty());
    }

    #[test]
    fn test_wrong_minor_version_dropped() {
        let channel = MockChannel::new();
        let mut state = state_with_connection(&channel);
        let mut core = core();
        let mut stub = EchoStub { requests: 0, unblock: false, handle: 0 };

        let mut header = request_header();
        header.proto_minor = PROTOCOL_VERSION_MINOR + 9;

        handle_data_request(&mut stub, &mut state, &mut core, &header, &request_payload(REQ_PING, 1));

        assert_eq!(stub.requests, 0);
        assert!(channel.take_sent().is_empty());
    }

    #[test]
    fn test_short_payload_dropped() {
        let channel = MockChannel::new();
        let mut state = state_with_connection(&channel);
        let mut core = core();
        let mut stub = EchoStub { requests: 0, unblock: false, handle: 0 };

        let header = request_header();
        handle_data_request(&mut stub, &mut state, &mut core, &header, &[0u8; EVENT_INFO_SIZE - 1]);

        assert_eq!(stub.requests, 0);
    }
}
