//! Client attach state machine. Attaching walks the servicebroker, prefers
//! local transport, falls back to (or is forced onto) TCP, performs the
//! connect-request/connect-response handshake and leaves the client with a
//! working shared channel or cleanly detached.
//!
//! The servicebroker is assumed to be reactive, so its calls stay
//! synchronous; only the TCP connect reply is read asynchronously.

use crate::broker::{ConnectionInfo, TcpConnectionInfo};
use crate::channel::ChannelRef;
use crate::client::{ClientCtx, ClientState, Proxy};
use crate::engine::EngineCore;
use crate::error::ErrorUtils;
use crate::frame::RequestWriter;
use crate::EndpointId;
use dsibase::logging;
use dsibase::wire::{
    Command, ConnectRequestInfo, MessageHeader, TcpConnectRequestInfo, CONNECT_INFO_SIZE,
    HEADER_SIZE, MESSAGE_MAGIC,
};
use dsibase::PROTOCOL_VERSION_MINOR;
use std::os::unix::io::RawFd;
use std::process;
use std::rc::Rc;

/// In-flight attach handshake of one client.
pub(crate) struct ConnectSm {
    conn: ConnectionInfo,
    tcp_conn: Option<TcpConnectionInfo>,
    /// Private channel carrying the TCP connect request.
    channel: Option<ChannelRef>,
    pending_fd: Option<RawFd>,
}

impl ConnectSm {
    /// Abort a handshake that is still waiting for its TCP reply.
    pub(crate) fn cancel(self, core: &mut EngineCore) {
        if let Some(fd) = self.pending_fd {
            core.cancel_pending_connect(fd);
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Progress {
    /// Waiting for the connect response.
    Pending,
    /// Handshake complete, `finalize` may run.
    Connected,
    /// Attach failed, `fail` must run.
    Failed,
}

/// Start the attach sequence for one client.
pub(crate) fn attach(
    state: &mut ClientState,
    core: &mut EngineCore,
    endpoint: EndpointId,
) -> Progress {
    let conn = match core.broker.attach_interface(&state.desc) {
        Ok(conn) => conn,
        Err(_) => {
            logging::debug!(state.log, "no server registered for interface");
            return Progress::Failed;
        }
    };

    logging::debug!(state.log, "attached interface";
                    "client_id" => conn.client_id.0,
                    "server_pid" => conn.server_pid,
                    "node_id" => conn.node_id);

    let mut sm = ConnectSm {
        conn,
        tcp_conn: None,
        channel: None,
        pending_fd: None,
    };

    // TCP transport when forced or when the server lives on another node
    if core.cfg.force_tcp || conn.node_id != 0 {
        match core.broker.attach_interface_tcp(&state.desc) {
            Ok(tcp) => {
                sm.tcp_conn = Some(tcp);

                match core.attach_tcp(tcp.ip_address, tcp.port as u16, true) {
                    Some(channel) => {
                        if send_tcp_connect_request(state, core, &channel, &tcp) {
                            let fd = channel.fd();
                            sm.channel = Some(channel);
                            sm.pending_fd = Some(fd);
                            core.add_pending_connect(fd, endpoint);

                            // the local attach is not needed anymore
                            core.broker.detach_interface(sm.conn.client_id);
                            sm.conn.client_id.clear();

                            state.connector = Some(sm);
                            return Progress::Pending;
                        }
                    }
                    None => {
                        logging::error!(state.log, "error connecting tcp transport";
                                        "ip" => tcp.ip_address, "port" => tcp.port);
                    }
                }
            }
            Err(_) => {
                logging::error!(state.log, "error attaching interface via tcp");
            }
        }
    }

    // local transport for servers on this node
    if sm.conn.client_id.is_assigned() && sm.conn.node_id == 0 {
        match core.attach_local(sm.conn.server_pid, sm.conn.server_chid) {
            Some(channel) => {
                state.client_id = sm.conn.client_id;

                if send_local_connect_request(state, core, &channel, &sm.conn) {
                    if let Some(tcp) = sm.tcp_conn.take() {
                        core.broker.detach_interface(tcp.client_id);
                    }

                    state.connector = Some(sm);
                    return Progress::Pending;
                }

                state.client_id.clear();
            }
            None => {
                logging::error!(state.log, "error connecting local transport";
                                "pid" => sm.conn.server_pid, "chid" => sm.conn.server_chid);
            }
        }
    }

    if let Some(tcp) = sm.tcp_conn {
        core.broker.detach_interface(tcp.client_id);
    }

    if sm.conn.client_id.is_assigned() {
        core.broker.detach_interface(sm.conn.client_id);
    }

    Progress::Failed
}

fn send_local_connect_request(
    state: &ClientState,
    core: &mut EngineCore,
    channel: &ChannelRef,
    conn: &ConnectionInfo,
) -> bool {
    logging::debug!(state.log, "sending connect request";
                    "pid" => process::id(), "chid" => core.local_chid());

    let info = ConnectRequestInfo {
        pid: process::id(),
        channel: core.local_chid() as u32,
    };

    let mut writer = RequestWriter::control(
        channel.clone(),
        Command::ConnectRequest,
        conn.client_id,
        conn.server_id,
        PROTOCOL_VERSION_MINOR,
    );

    writer.ostream().write_raw(&info.encode());

    !writer.flush().has_failed()
}

fn send_tcp_connect_request(
    state: &ClientState,
    core: &mut EngineCore,
    channel: &ChannelRef,
    tcp: &TcpConnectionInfo,
) -> bool {
    let local = match channel.local_tcp_addr() {
        Some(addr) => addr,
        None => return false,
    };

    let port = match core.ensure_tcp_port() {
        Some(port) => port,
        None => return false,
    };

    logging::debug!(state.log, "sending tcp connect request";
                    "ip" => %local.ip(), "port" => port);

    let mut writer = RequestWriter::control(
        channel.clone(),
        Command::ConnectRequest,
        tcp.client_id,
        tcp.server_id,
        PROTOCOL_VERSION_MINOR,
    );

    {
        let mut os = writer.ostream();
        os.write_u32(u32::from(*local.ip()));
        os.write_u32(u32::from(port));
        // the extra word tells the server this is not a legacy-sized request
        os.write_u32(0);
    }

    !writer.flush().has_failed()
}

/// Connect response received over local transport.
pub(crate) fn on_connect_response(
    state: &mut ClientState,
    core: &mut EngineCore,
    header: &MessageHeader,
    info: ConnectRequestInfo,
) -> Progress {
    if info.pid == 0 {
        return Progress::Failed;
    }

    state.server_id = header.server_id;

    match core.attach_local(info.pid, info.channel as i32) {
        Some(channel) => {
            state.channel = Rc::downgrade(&channel);
            state.proto_minor = header.proto_minor.min(PROTOCOL_VERSION_MINOR);
            Progress::Connected
        }
        None => Progress::Failed,
    }
}

/// The private TCP channel became readable: parse the connect reply, which
/// is either a bare info block (legacy peer) or a full header followed by
/// the info block. The first four bytes decide: a value of 0x200 is the
/// message magic, and no server ever advertises 0.0.2.0 as its address.
pub(crate) fn on_tcp_reply(state: &mut ClientState, core: &mut EngineCore) -> Progress {
    let (channel, tcp) = match state.connector.as_ref() {
        Some(sm) => match (&sm.channel, &sm.tcp_conn) {
            (Some(channel), Some(tcp)) => (channel.clone(), *tcp),
            _ => return Progress::Failed,
        },
        None => return Progress::Failed,
    };

    let mut first = [0u8; CONNECT_INFO_SIZE];
    if channel.recv_all(&mut first).has_failed() {
        return Progress::Failed;
    }

    let bare = TcpConnectRequestInfo::decode(&first);

    if bare.ip_address == MESSAGE_MAGIC as u32 {
        // modern reply, the bytes read are the head of the header
        let mut rest = [0u8; HEADER_SIZE];
        if channel.recv_all(&mut rest).has_failed() {
            return Progress::Failed;
        }

        let mut header_buf = [0u8; HEADER_SIZE];
        header_buf[..CONNECT_INFO_SIZE].copy_from_slice(&first);
        header_buf[CONNECT_INFO_SIZE..].copy_from_slice(&rest[..HEADER_SIZE - CONNECT_INFO_SIZE]);

        let header = MessageHeader::decode(&header_buf);
        let info = TcpConnectRequestInfo::decode(&rest[HEADER_SIZE - CONNECT_INFO_SIZE..]);

        if header.command() != Command::ConnectResponse || info.ip_address == 0 {
            return Progress::Failed;
        }

        connect_persistent(state, core, tcp, info, header.proto_minor.min(PROTOCOL_VERSION_MINOR))
    } else if bare.ip_address != 0 {
        // legacy peers speak the current minor version implicitly
        connect_persistent(state, core, tcp, bare, PROTOCOL_VERSION_MINOR)
    } else {
        Progress::Failed
    }
}

fn connect_persistent(
    state: &mut ClientState,
    core: &mut EngineCore,
    tcp: TcpConnectionInfo,
    info: TcpConnectRequestInfo,
    proto_minor: u16,
) -> Progress {
    state.client_id = tcp.client_id;
    state.server_id = tcp.server_id;

    match core.attach_tcp(info.ip_address, info.port as u16, false) {
        Some(channel) => {
            state.channel = Rc::downgrade(&channel);
            state.proto_minor = proto_minor;
            Progress::Connected
        }
        None => Progress::Failed,
    }
}

/// Handshake done: arm the server-disconnect pulse and let the proxy know.
pub(crate) fn finalize(proxy: &mut dyn Proxy, state: &mut ClientState, core: &mut EngineCore) {
    if let Some(sm) = state.connector.take() {
        sm.cancel(core);
    }

    state.notification_id = core.broker.set_server_disconnect_notification(
        state.server_id,
        core.notify_chid(),
        state.id,
    );

    if state.notification_id == 0 {
        logging::error!(state.log, "error arming server disconnect notification");
    }

    logging::debug!(state.log, "component connected";
                    "client_id" => state.client_id.0,
                    "server_id" => state.server_id.0,
                    "proto_minor" => state.proto_minor);

    proxy.component_connected(&mut ClientCtx {
        core: &mut *core,
        state: &mut *state,
    });
}

/// Handshake failed: release remaining broker handles and detach, which
/// re-arms the server-available pulse for a later retry.
pub(crate) fn fail(proxy: &mut dyn Proxy, state: &mut ClientState, core: &mut EngineCore) {
    if let Some(sm) = state.connector.take() {
        if let Some(tcp) = sm.tcp_conn {
            if tcp.client_id.is_assigned() && tcp.client_id != state.client_id {
                core.broker.detach_interface(tcp.client_id);
            }
        }

        if sm.conn.client_id.is_assigned() && sm.conn.client_id != state.client_id {
            core.broker.detach_interface(sm.conn.client_id);
        }

        sm.cancel(core);
    }

    crate::client::detach_interface(proxy, state, core, true);
}
