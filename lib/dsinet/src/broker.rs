//! Servicebroker client. The broker is a separate long-lived daemon
//! reachable over a local socket; all calls are synchronous request/reply
//! exchanges. Notifications armed here arrive later as pulses on the
//! engine's notification acceptor.
//!
//! Frame layout (little-endian): requests are `op:u32, body_len:u32, body`,
//! replies are `status:u32, body` with a fixed body size per operation and
//! status zero meaning success. Strings travel as `len:u32` plus bytes.

use crate::error::{ErrorType, NetError, NetResult};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use dsibase::logging::{self, Logger};
use dsibase::{InterfaceDescriptor, PartyId};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::net::UnixStream;
use std::process;

/// Operation codes of the broker protocol.
pub mod proto {
    pub const REGISTER_INTERFACE: u32 = 1;
    pub const REGISTER_INTERFACE_TCP: u32 = 2;
    pub const UNREGISTER_INTERFACE: u32 = 3;
    pub const ATTACH_INTERFACE: u32 = 4;
    pub const ATTACH_INTERFACE_TCP: u32 = 5;
    pub const DETACH_INTERFACE: u32 = 6;
    pub const SET_SERVER_AVAILABLE_NOTIFICATION: u32 = 7;
    pub const SET_SERVER_DISCONNECT_NOTIFICATION: u32 = 8;
    pub const SET_CLIENT_DETACH_NOTIFICATION: u32 = 9;
    pub const CLEAR_NOTIFICATION: u32 = 10;
}

/// Fixed-size event the broker delivers over a subscriber's notification
/// socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Pulse {
    pub code: i32,
    pub value: i32,
}

pub const PULSE_SIZE: usize = 8;

impl Pulse {
    pub fn encode(&self) -> [u8; PULSE_SIZE] {
        let mut buf = [0u8; PULSE_SIZE];
        LittleEndian::write_i32(&mut buf[..4], self.code);
        LittleEndian::write_i32(&mut buf[4..], self.value);
        buf
    }

    pub fn decode(buf: &[u8; PULSE_SIZE]) -> Pulse {
        Pulse {
            code: LittleEndian::read_i32(&buf[..4]),
            value: LittleEndian::read_i32(&buf[4..]),
        }
    }
}

/// Where an attached service lives, local flavor.
#[derive(Debug, Default, Copy, Clone)]
pub struct ConnectionInfo {
    pub client_id: PartyId,
    pub server_id: PartyId,
    pub server_pid: u32,
    pub server_chid: i32,
    /// Zero when the server runs on this node.
    pub node_id: u32,
}

/// Where an attached service lives, TCP flavor.
#[derive(Debug, Default, Copy, Clone)]
pub struct TcpConnectionInfo {
    pub client_id: PartyId,
    pub server_id: PartyId,
    pub ip_address: u32,
    pub port: u32,
}

struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    fn new(op: u32) -> FrameBuilder {
        let mut buf = Vec::with_capacity(64);
        buf.write_u32::<LittleEndian>(op).expect("frame write");
        // body length backpatched on finish
        buf.write_u32::<LittleEndian>(0).expect("frame write");

        FrameBuilder { buf }
    }

    fn put_u32(mut self, value: u32) -> FrameBuilder {
        self.buf.write_u32::<LittleEndian>(value).expect("frame write");
        self
    }

    fn put_i32(mut self, value: i32) -> FrameBuilder {
        self.buf.write_i32::<LittleEndian>(value).expect("frame write");
        self
    }

    fn put_u64(mut self, value: u64) -> FrameBuilder {
        self.buf.write_u64::<LittleEndian>(value).expect("frame write");
        self
    }

    fn put_str(mut self, value: &str) -> FrameBuilder {
        self.buf
            .write_u32::<LittleEndian>(value.len() as u32)
            .expect("frame write");
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    fn put_descriptor(self, desc: &InterfaceDescriptor) -> FrameBuilder {
        self.put_str(&desc.name).put_u32(desc.major).put_u32(desc.minor)
    }

    fn finish(mut self) -> Vec<u8> {
        let body_len = (self.buf.len() - 8) as u32;
        LittleEndian::write_u32(&mut self.buf[4..8], body_len);
        self.buf
    }
}

/// Client handle to the servicebroker. The connection is opened lazily on
/// the first call and reopened after any transport failure.
pub struct Servicebroker {
    path: String,
    handle: RefCell<Option<UnixStream>>,
    log: Logger,
}

impl Servicebroker {
    pub fn new(path: &str, log: &Logger) -> Servicebroker {
        Servicebroker {
            path: path.to_owned(),
            handle: RefCell::new(None),
            log: log.new(logging::o!("broker" => path.to_owned())),
        }
    }

    /// Close the handle; the next call opens a fresh one.
    pub fn close_handle(&self) {
        self.handle.borrow_mut().take();
    }

    fn call(&self, request: Vec<u8>, reply_len: usize) -> NetResult<Vec<u8>> {
        let mut handle = self.handle.borrow_mut();

        if handle.is_none() {
            match crate::sys::connect_abstract(&self.path) {
                Ok(stream) => *handle = Some(stream),
                Err(err) => {
                    logging::debug!(self.log, "cannot reach servicebroker"; "error" => %err);
                    return Err(NetError::Fatal(ErrorType::Broker));
                }
            }
        }

        let stream = handle.as_mut().expect("broker handle just opened");

        let result = stream.write_all(&request).and_then(|_| {
            let mut reply = vec![0u8; 4 + reply_len];
            stream.read_exact(&mut reply).map(|_| reply)
        });

        match result {
            Ok(reply) => {
                if LittleEndian::read_u32(&reply[..4]) != 0 {
                    return Err(NetError::Fatal(ErrorType::Broker));
                }

                Ok(reply[4..].to_vec())
            }
            Err(err) => {
                logging::warn!(self.log, "servicebroker call failed"; "error" => %err);
                handle.take();
                Err(NetError::Fatal(ErrorType::Broker))
            }
        }
    }

    pub fn register_interface(
        &self,
        desc: &InterfaceDescriptor,
        chid: i32,
        user_group: &str,
    ) -> NetResult<PartyId> {
        let request = FrameBuilder::new(proto::REGISTER_INTERFACE)
            .put_descriptor(desc)
            .put_u32(process::id())
            .put_i32(chid)
            .put_str(user_group)
            .finish();

        let reply = self.call(request, 8)?;
        Ok(PartyId(LittleEndian::read_u64(&reply)))
    }

    pub fn register_interface_tcp(
        &self,
        desc: &InterfaceDescriptor,
        address: Ipv4Addr,
        port: u16,
    ) -> NetResult<PartyId> {
        let request = FrameBuilder::new(proto::REGISTER_INTERFACE_TCP)
            .put_descriptor(desc)
            .put_u32(u32::from(address))
            .put_u32(u32::from(port))
            .finish();

        let reply = self.call(request, 8)?;
        Ok(PartyId(LittleEndian::read_u64(&reply)))
    }

    pub fn unregister_interface(&self, server_id: PartyId) {
        let request = FrameBuilder::new(proto::UNREGISTER_INTERFACE)
            .put_u64(server_id.0)
            .finish();

        if self.call(request, 0).is_err() {
            logging::warn!(self.log, "unregister failed"; "server_id" => server_id.0);
        }
    }

    pub fn attach_interface(&self, desc: &InterfaceDescriptor) -> NetResult<ConnectionInfo> {
        let request = FrameBuilder::new(proto::ATTACH_INTERFACE)
            .put_descriptor(desc)
            .finish();

        let reply = self.call(request, 28)?;

        Ok(ConnectionInfo {
            client_id: PartyId(LittleEndian::read_u64(&reply[..8])),
            server_id: PartyId(LittleEndian::read_u64(&reply[8..16])),
            server_pid: LittleEndian::read_u32(&reply[16..20]),
            server_chid: LittleEndian::read_i32(&reply[20..24]),
            node_id: LittleEndian::read_u32(&reply[24..28]),
        })
    }

    pub fn attach_interface_tcp(&self, desc: &InterfaceDescriptor) -> NetResult<TcpConnectionInfo> {
        let request = FrameBuilder::new(proto::ATTACH_INTERFACE_TCP)
            .put_descriptor(desc)
            .finish();

        let reply = self.call(request, 24)?;

        Ok(TcpConnectionInfo {
            client_id: PartyId(LittleEndian::read_u64(&reply[..8])),
            server_id: PartyId(LittleEndian::read_u64(&reply[8..16])),
            ip_address: LittleEndian::read_u32(&reply[16..20]),
            port: LittleEndian::read_u32(&reply[20..24]),
        })
    }

    pub fn detach_interface(&self, client_id: PartyId) {
        let request = FrameBuilder::new(proto::DETACH_INTERFACE)
            .put_u64(client_id.0)
            .finish();

        if self.call(request, 0).is_err() {
            logging::warn!(self.log, "detach failed"; "client_id" => client_id.0);
        }
    }

    /// Arm a server-available pulse for the described interface, delivered
    /// to `chid` of this process with the given value. Returns zero on
    /// failure.
    pub fn set_server_available_notification(
        &self,
        desc: &InterfaceDescriptor,
        chid: i32,
        value: i32,
    ) -> u32 {
        let request = FrameBuilder::new(proto::SET_SERVER_AVAILABLE_NOTIFICATION)
            .put_descriptor(desc)
            .put_u32(process::id())
            .put_i32(chid)
            .put_i32(value)
            .finish();

        match self.call(request, 4) {
            Ok(reply) => LittleEndian::read_u32(&reply),
            Err(_) => 0,
        }
    }

    /// Arm a pulse fired when the given server unregisters. Returns zero on
    /// failure.
    pub fn set_server_disconnect_notification(
        &self,
        server_id: PartyId,
        chid: i32,
        value: i32,
    ) -> u32 {
        let request = FrameBuilder::new(proto::SET_SERVER_DISCONNECT_NOTIFICATION)
            .put_u64(server_id.0)
            .put_u32(process::id())
            .put_i32(chid)
            .put_i32(value)
            .finish();

        match self.call(request, 4) {
            Ok(reply) => LittleEndian::read_u32(&reply),
            Err(_) => 0,
        }
    }

    /// Arm a pulse fired when the given client detaches. Returns zero on
    /// failure.
    pub fn set_client_detach_notification(&self, client_id: PartyId, chid: i32, value: i32) -> u32 {
        let request = FrameBuilder::new(proto::SET_CLIENT_DETACH_NOTIFICATION)
            .put_u64(client_id.0)
            .put_u32(process::id())
            .put_i32(chid)
            .put_i32(value)
            .finish();

        match self.call(request, 4) {
            Ok(reply) => LittleEndian::read_u32(&reply),
            Err(_) => 0,
        }
    }

    pub fn clear_notification(&self, notification_id: u32) {
        if notification_id == 0 {
            return;
        }

        let request = FrameBuilder::new(proto::CLEAR_NOTIFICATION)
            .put_u32(notification_id)
            .finish();

        if self.call(request, 0).is_err() {
            logging::warn!(self.log, "clear notification failed"; "id" => notification_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_roundtrip() {
        let pulse = Pulse { code: 101, value: -7 };
        assert_eq!(Pulse::decode(&pulse.encode()), pulse);
    }

    #[test]
    fn test_frame_layout() {
        let frame = FrameBuilder::new(proto::DETACH_INTERFACE).put_u64(0x1122).finish();

        assert_eq!(LittleEndian::read_u32(&frame[..4]), proto::DETACH_INTERFACE);
        assert_eq!(LittleEndian::read_u32(&frame[4..8]), 8);
        assert_eq!(LittleEndian::read_u64(&frame[8..]), 0x1122);
    }

    #[test]
    fn test_descriptor_frame() {
        let desc = InterfaceDescriptor::new("ping.pong", 1, 2);
        let frame = FrameBuilder::new(proto::ATTACH_INTERFACE)
            .put_descriptor(&desc)
            .finish();

        assert_eq!(LittleEndian::read_u32(&frame[8..12]), 9);
        assert_eq!(&frame[12..21], b"ping.pong");
        assert_eq!(LittleEndian::read_u32(&frame[21..25]), 1);
        assert_eq!(LittleEndian::read_u32(&frame[25..29]), 2);
    }

    #[test]
    fn test_unreachable_broker() {
        let log = logging::discard();
        let broker = Servicebroker::new("dsi/test/does-not-exist", &log);

        assert!(broker.attach_interface(&InterfaceDescriptor::new("a.b", 1, 0)).is_err());
        assert_eq!(
            broker.set_client_detach_notification(PartyId(1), 3, 4),
            0
        );
    }
}
