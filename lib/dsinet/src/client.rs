//! Client-side runtime: request emission, notification management and
//! response dispatch for one proxy attached to an engine.

use crate::channel::{null_channel_weak, ChannelWeak};
use crate::connect::ConnectSm;
use crate::engine::EngineCore;
use crate::error::ErrorUtils;
use crate::frame::RequestWriter;
use dsibase::istream::IStream;
use dsibase::logging::{self, Logger};
use dsibase::ostream::OStream;
use dsibase::wire::{Command, DataState, EventInfo, MessageHeader, RequestType, ResultType};
use dsibase::{InterfaceDescriptor, PartyId, INVALID_ID, INVALID_SEQUENCE_NR};

/// Inbound data response as presented to the proxy.
pub struct ResponseHandle<'p> {
    pub client_id: PartyId,
    pub server_id: PartyId,
    pub proto_minor: u16,
    pub info: EventInfo,
    pub payload: &'p [u8],
}

impl<'p> ResponseHandle<'p> {
    /// Update id of the response, information or attribute.
    #[inline]
    pub fn update_id(&self) -> u32 {
        self.info.request_id
    }

    #[inline]
    pub fn sequence_nr(&self) -> i32 {
        self.info.sequence_nr
    }

    #[inline]
    pub fn result_type(&self) -> Option<ResultType> {
        self.info.result_type()
    }

    /// Attribute state transported by this response.
    #[inline]
    pub fn data_state(&self) -> DataState {
        self.info.data_state()
    }

    #[inline]
    pub fn istream(&self) -> IStream {
        IStream::new(self.payload)
    }
}

/// The user-implemented half of a service proxy. Generated skeletons
/// decode responses and track client attributes on top of this.
pub trait Proxy: 'static {
    /// The attach handshake completed; requests may be sent now.
    fn component_connected(&mut self, _ctx: &mut ClientCtx) {}

    /// The server is gone; client attributes should be reset.
    fn component_disconnected(&mut self, _ctx: &mut ClientCtx) {}

    /// Dispatch one response to the user's handlers.
    fn process_response(&mut self, response: &ResponseHandle, ctx: &mut ClientCtx);
}

/// Runtime bookkeeping of one client (proxy) attached to an engine.
pub struct ClientState {
    pub desc: InterfaceDescriptor,
    pub(crate) log: Logger,
    pub(crate) id: i32,
    pub client_id: PartyId,
    pub server_id: PartyId,
    pub proto_minor: u16,
    pub(crate) channel: ChannelWeak,
    pub(crate) notification_id: u32,
    current_sequence: i32,
    pub(crate) connector: Option<ConnectSm>,
}

impl ClientState {
    pub fn new(ifname: &str, role: &str, major: u32, minor: u32) -> ClientState {
        ClientState {
            desc: InterfaceDescriptor::new(format!("{}.{}", ifname, role), major, minor),
            log: logging::discard(),
            id: 0,
            client_id: PartyId::default(),
            server_id: PartyId::default(),
            proto_minor: 0,
            channel: null_channel_weak(),
            notification_id: 0,
            current_sequence: INVALID_SEQUENCE_NR,
            connector: None,
        }
    }

    /// Sequence number of the response currently being processed.
    #[inline]
    pub fn current_sequence(&self) -> i32 {
        self.current_sequence
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.server_id.is_assigned()
    }

    fn writer(&self, ty: RequestType, id: u32, sequence_nr: i32) -> Option<RequestWriter> {
        match self.channel.upgrade() {
            Some(channel) => Some(RequestWriter::data_request(
                channel,
                self.desc.packed_version(),
                ty,
                id,
                sequence_nr,
                self.client_id,
                self.server_id,
                self.proto_minor,
            )),
            None => {
                logging::error!(self.log, "no channel to server"; "id" => id);
                None
            }
        }
    }
}

/// Client context handed to proxy callbacks: the engine core plus the
/// client's own runtime state.
pub struct ClientCtx<'a> {
    pub core: &'a mut EngineCore,
    pub state: &'a mut ClientState,
}

impl<'a> ClientCtx<'a> {
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

    /// Send a request, returning its freshly assigned sequence number.
    pub fn send_request(&mut self, id: u32, write: &dyn Fn(&mut OStream)) -> i32 {
        let sequence_nr = self.core.next_id();
        self.send_request_with_sequence(id, sequence_nr, write);
        sequence_nr
    }

    /// Send a request under an existing sequence number, e.g. the session
    /// sequence of a register call.
    pub fn send_request_with_sequence(
        &mut self,
        id: u32,
        sequence_nr: i32,
        write: &dyn Fn(&mut OStream),
    ) {
        if let Some(mut writer) = self.state.writer(RequestType::Request, id, sequence_nr) {
            write(&mut writer.ostream());

            if writer.flush().has_failed() {
                logging::warn!(self.state.log, "sending request failed"; "id" => id);
            }
        }
    }

    /// Subscribe to an attribute or response id.
    pub fn notify_on(&mut self, id: u32) {
        self.send_plain(RequestType::RequestNotify, id, INVALID_SEQUENCE_NR);
    }

    /// Drop the subscription on one id.
    pub fn stop_notify(&mut self, id: u32) {
        self.send_plain(RequestType::RequestStopNotify, id, INVALID_SEQUENCE_NR);
    }

    /// Drop every subscription of this client.
    pub fn stop_all_notifies(&mut self) {
        self.send_plain(RequestType::RequestStopAllNotify, INVALID_ID, INVALID_SEQUENCE_NR);
    }

    /// Open a register session over the given information ids. Returns the
    /// session sequence number identifying the registration.
    pub fn register_notify(&mut self, ids: &[u32]) -> i32 {
        let sequence_nr = self.core.next_id();

        for id in ids {
            self.send_plain(RequestType::RequestRegisterNotify, *id, sequence_nr);
        }

        sequence_nr
    }

    /// Remove one id from a register session.
    pub fn stop_register_notify(&mut self, id: u32, session: i32) {
        self.send_plain(RequestType::RequestStopRegisterNotify, id, session);
    }

    /// Tear down a whole register session.
    pub fn stop_all_register_notifies(&mut self, session: i32) {
        self.send_plain(RequestType::RequestStopAllRegisterNotify, INVALID_ID, session);
    }

    fn send_plain(&mut self, ty: RequestType, id: u32, sequence_nr: i32) {
        if let Some(writer) = self.state.writer(ty, id, sequence_nr) {
            if writer.flush().has_failed() {
                logging::warn!(self.state.log, "sending notification request failed";
                               "type" => ?ty, "id" => id);
            }
        }
    }
}

/// Dispatch one inbound data response to the proxy.
pub(crate) fn handle_data_response(
    proxy: &mut dyn Proxy,
    state: &mut ClientState,
    core: &mut EngineCore,
    header: &MessageHeader,
    payload: &[u8],
) {
    if payload.len() < dsibase::wire::EVENT_INFO_SIZE {
        logging::warn!(state.log, "short data response dropped");
        return;
    }

    if state.proto_minor != header.proto_minor {
        logging::error!(state.log, "data response with wrong minor protocol version";
                        "expected" => state.proto_minor, "received" => header.proto_minor);
        return;
    }

    let mut info_buf = [0u8; dsibase::wire::EVENT_INFO_SIZE];
    info_buf.copy_from_slice(&payload[..dsibase::wire::EVENT_INFO_SIZE]);
    let info = EventInfo::decode(&info_buf);

    logging::debug!(state.log, "data response";
                    "id" => info.request_id,
                    "sequence" => info.sequence_nr,
                    "type" => info.ty);

    state.current_sequence = info.sequence_nr;

    let handle = ResponseHandle {
        client_id: header.client_id,
        server_id: header.server_id,
        proto_minor: header.proto_minor,
        info,
        payload: &payload[dsibase::wire::EVENT_INFO_SIZE..],
    };

    proxy.process_response(
        &handle,
        &mut ClientCtx {
            core: &mut *core,
            state: &mut *state,
        },
    );

    state.current_sequence = INVALID_SEQUENCE_NR;
}

/// Ask the servicebroker to fire a pulse once a server for this interface
/// registers.
pub(crate) fn set_server_available_notification(state: &mut ClientState, core: &mut EngineCore) {
    state.notification_id =
        core.broker
            .set_server_available_notification(&state.desc, core.notify_chid(), state.id);

    if state.notification_id == 0 {
        logging::error!(state.log, "error arming server available notification");
    }
}

/// Clear the broker notification currently armed for this client.
pub(crate) fn remove_notification(state: &mut ClientState, core: &mut EngineCore) {
    if state.notification_id != 0 {
        core.broker.clear_notification(state.notification_id);
        state.notification_id = 0;
    }
}

/// Drop the connection to the server: clear broker handles, tell the peer,
/// invoke the disconnect callback and optionally re-arm the
/// server-available pulse for a later reattach.
pub(crate) fn detach_interface(
    proxy: &mut dyn Proxy,
    state: &mut ClientState,
    core: &mut EngineCore,
    reset_notification: bool,
) {
    logging::debug!(state.log, "detaching interface"; "client_id" => state.client_id.0);

    remove_notification(state, core);

    if let Some(connector) = state.connector.take() {
        connector.cancel(core);
    }

    if state.client_id.is_assigned() {
        if let Some(channel) = state.channel.upgrade() {
            let writer = RequestWriter::control(
                channel,
                Command::DisconnectRequest,
                state.client_id,
                state.server_id,
                state.proto_minor,
            );

            if writer.flush().has_failed() {
                logging::debug!(state.log, "disconnect request not deliverable");
            }
        }

        core.broker.detach_interface(state.client_id);
        state.client_id.clear();
    }

    if state.server_id.is_assigned() {
        state.server_id.clear();
        proxy.component_disconnected(&mut ClientCtx {
            core: &mut *core,
            state: &mut *state,
        });
    }

    state.channel = null_channel_weak();
    state.proto_minor = 0;

    if reset_notification && core.active {
        set_server_available_notification(state, core);
    }
}
