//! On-the-wire structures: the fixed message header, the event info block
//! preceding data payloads and the enumerations carried in them. All fields
//! are little-endian.

use crate::{PartyId, INVALID_SEQUENCE_NR, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Magic number identifying a DSI message header. A zeroed type field marks
/// the end of a stream.
pub const MESSAGE_MAGIC: i32 = 0x200;

/// Size of the fixed message header on the wire.
pub const HEADER_SIZE: usize = 40;

/// Size of the event info block preceding data payloads.
pub const EVENT_INFO_SIZE: usize = 16;

/// Header flag bit: at least one more packet of this message follows.
pub const MORE_DATA_FLAG: u32 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum Command {
    Invalid = 0,
    DataRequest = 7,
    DataResponse = 8,
    ConnectRequest = 9,
    DisconnectRequest = 10,
    ConnectResponse = 11,
}

impl Command {
    pub fn from_u32(value: u32) -> Command {
        match value {
            7 => Command::DataRequest,
            8 => Command::DataResponse,
            9 => Command::ConnectRequest,
            10 => Command::DisconnectRequest,
            11 => Command::ConnectResponse,
            _ => Command::Invalid,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum RequestType {
    Request = 0x0100,
    RequestNotify = 0x0101,
    RequestStopNotify = 0x0102,
    RequestLoadComponent = 0x0103,
    RequestStopAllNotify = 0x0104,
    RequestRegisterNotify = 0x0105,
    RequestStopRegisterNotify = 0x0106,
    RequestStopAllRegisterNotify = 0x0107,
}

impl RequestType {
    pub fn from_u32(value: u32) -> Option<RequestType> {
        Some(match value {
            0x0100 => RequestType::Request,
            0x0101 => RequestType::RequestNotify,
            0x0102 => RequestType::RequestStopNotify,
            0x0103 => RequestType::RequestLoadComponent,
            0x0104 => RequestType::RequestStopAllNotify,
            0x0105 => RequestType::RequestRegisterNotify,
            0x0106 => RequestType::RequestStopRegisterNotify,
            0x0107 => RequestType::RequestStopAllRegisterNotify,
            _ => return None,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum ResultType {
    Ok = 0x0200,
    Invalid = 0x0201,
    DataOk = 0x0202,
    DataInvalid = 0x0203,
    RequestError = 0x0204,
    RequestBusy = 0x0205,
}

impl ResultType {
    pub fn from_u32(value: u32) -> Option<ResultType> {
        Some(match value {
            0x0200 => ResultType::Ok,
            0x0201 => ResultType::Invalid,
            0x0202 => ResultType::DataOk,
            0x0203 => ResultType::DataInvalid,
            0x0204 => ResultType::RequestError,
            0x0205 => ResultType::RequestBusy,
            _ => return None,
        })
    }
}

/// State of a notifiable data element.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataState {
    NotAvailable,
    Invalid,
    Ok,
}

impl Default for DataState {
    fn default() -> DataState {
        DataState::NotAvailable
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum UpdateType {
    None = -1,
    Complete = 0,
    Insert = 1,
    Replace = 2,
    Delete = 3,
}

impl UpdateType {
    pub fn from_i32(value: i32) -> UpdateType {
        match value {
            0 => UpdateType::Complete,
            1 => UpdateType::Insert,
            2 => UpdateType::Replace,
            3 => UpdateType::Delete,
            _ => UpdateType::None,
        }
    }
}

/// Pulse codes delivered by the servicebroker on the engine's notification
/// socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum PulseCode {
    ServerAvailable = 100,
    ServerDisconnect = 101,
    ClientDetached = 102,
}

impl PulseCode {
    pub fn from_i32(value: i32) -> Option<PulseCode> {
        Some(match value {
            100 => PulseCode::ServerAvailable,
            101 => PulseCode::ServerDisconnect,
            102 => PulseCode::ClientDetached,
            _ => return None,
        })
    }
}

/// The fixed-layout DSI message header as transferred on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageHeader {
    /// `MESSAGE_MAGIC` for a valid message, zero for the end-of-stream
    /// marker.
    pub magic: i32,
    pub proto_major: u16,
    pub proto_minor: u16,
    pub server_id: PartyId,
    pub client_id: PartyId,
    pub cmd: u32,
    pub flags: u32,
    /// Payload bytes carried by this packet, the header excluded.
    pub packet_length: u32,
}

impl MessageHeader {
    #[inline]
    pub fn new(
        server_id: PartyId,
        client_id: PartyId,
        cmd: Command,
        proto_minor: u16,
        packet_length: u32,
    ) -> MessageHeader {
        MessageHeader {
            magic: MESSAGE_MAGIC,
            proto_major: PROTOCOL_VERSION_MAJOR,
            proto_minor,
            server_id,
            client_id,
            cmd: cmd as u32,
            flags: 0,
            packet_length,
        }
    }

    #[inline]
    pub fn command(&self) -> Command {
        Command::from_u32(self.cmd)
    }

    #[inline]
    pub fn more_data(&self) -> bool {
        self.flags & MORE_DATA_FLAG != 0
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut w = &mut buf[..];
            w.write_i32::<LittleEndian>(self.magic).expect("header write");
            w.write_u16::<LittleEndian>(self.proto_major).expect("header write");
            w.write_u16::<LittleEndian>(self.proto_minor).expect("header write");
            w.write_u64::<LittleEndian>(self.server_id.0).expect("header write");
            w.write_u64::<LittleEndian>(self.client_id.0).expect("header write");
            w.write_u32::<LittleEndian>(self.cmd).expect("header write");
            w.write_u32::<LittleEndian>(self.flags).expect("header write");
            w.write_u32::<LittleEndian>(self.packet_length).expect("header write");
            // trailing 4 reserved bytes stay zero
        }
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> MessageHeader {
        let mut r = Cursor::new(&buf[..]);

        MessageHeader {
            magic: r.read_i32::<LittleEndian>().expect("header read"),
            proto_major: r.read_u16::<LittleEndian>().expect("header read"),
            proto_minor: r.read_u16::<LittleEndian>().expect("header read"),
            server_id: PartyId(r.read_u64::<LittleEndian>().expect("header read")),
            client_id: PartyId(r.read_u64::<LittleEndian>().expect("header read")),
            cmd: r.read_u32::<LittleEndian>().expect("header read"),
            flags: r.read_u32::<LittleEndian>().expect("header read"),
            packet_length: r.read_u32::<LittleEndian>().expect("header read"),
        }
    }
}

/// Event information preceding the payload of data packets. The `ty` slot
/// carries either a request type or a result type depending on the command.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EventInfo {
    /// Interface version, major in the high word, minor in the low word.
    pub if_version: u32,
    pub ty: u32,
    pub request_id: u32,
    pub sequence_nr: i32,
}

impl EventInfo {
    #[inline]
    pub fn new(if_version: u32, ty: u32, request_id: u32, sequence_nr: i32) -> EventInfo {
        EventInfo {
            if_version,
            ty,
            request_id,
            sequence_nr,
        }
    }

    #[inline]
    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_u32(self.ty)
    }

    #[inline]
    pub fn result_type(&self) -> Option<ResultType> {
        ResultType::from_u32(self.ty)
    }

    /// Data state derived from the result type of an attribute update.
    #[inline]
    pub fn data_state(&self) -> DataState {
        match self.result_type() {
            Some(ResultType::DataOk) => DataState::Ok,
            _ => DataState::Invalid,
        }
    }

    pub fn encode(&self) -> [u8; EVENT_INFO_SIZE] {
        let mut buf = [0u8; EVENT_INFO_SIZE];
        {
            let mut w = &mut buf[..];
            w.write_u32::<LittleEndian>(self.if_version).expect("event info write");
            w.write_u32::<LittleEndian>(self.ty).expect("event info write");
            w.write_u32::<LittleEndian>(self.request_id).expect("event info write");
            w.write_i32::<LittleEndian>(self.sequence_nr).expect("event info write");
        }
        buf
    }

    pub fn decode(buf: &[u8; EVENT_INFO_SIZE]) -> EventInfo {
        let mut r = Cursor::new(&buf[..]);

        EventInfo {
            if_version: r.read_u32::<LittleEndian>().expect("event info read"),
            ty: r.read_u32::<LittleEndian>().expect("event info read"),
            request_id: r.read_u32::<LittleEndian>().expect("event info read"),
            sequence_nr: r.read_i32::<LittleEndian>().expect("event info read"),
        }
    }
}

impl Default for EventInfo {
    fn default() -> EventInfo {
        EventInfo::new(0, 0, 0, INVALID_SEQUENCE_NR)
    }
}

/// Connect request payload exchanged over local transport: the client's
/// process id and local channel id.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ConnectRequestInfo {
    pub pid: u32,
    pub channel: u32,
}

/// Connect request payload exchanged over TCP/IP transport.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct TcpConnectRequestInfo {
    pub ip_address: u32,
    pub port: u32,
}

pub const CONNECT_INFO_SIZE: usize = 8;

impl ConnectRequestInfo {
    pub fn encode(&self) -> [u8; CONNECT_INFO_SIZE] {
        let mut buf = [0u8; CONNECT_INFO_SIZE];
        {
            let mut w = &mut buf[..];
            w.write_u32::<LittleEndian>(self.pid).expect("info write");
            w.write_u32::<LittleEndian>(self.channel).expect("info write");
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> ConnectRequestInfo {
        let mut r = Cursor::new(buf);

        ConnectRequestInfo {
            pid: r.read_u32::<LittleEndian>().unwrap_or(0),
            channel: r.read_u32::<LittleEndian>().unwrap_or(0),
        }
    }
}

impl TcpConnectRequestInfo {
    pub fn encode(&self) -> [u8; CONNECT_INFO_SIZE] {
        let mut buf = [0u8; CONNECT_INFO_SIZE];
        {
            let mut w = &mut buf[..];
            w.write_u32::<LittleEndian>(self.ip_address).expect("info write");
            w.write_u32::<LittleEndian>(self.port).expect("info write");
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> TcpConnectRequestInfo {
        let mut r = Cursor::new(buf);

        TcpConnectRequestInfo {
            ip_address: r.read_u32::<LittleEndian>().unwrap_or(0),
            port: r.read_u32::<LittleEndian>().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PartyId;

    #[test]
    fn test_header_roundtrip() {
        let mut hdr = MessageHeader::new(
            PartyId::new(1, 2),
            PartyId::new(3, 4),
            Command::DataRequest,
            1,
            128,
        );
        hdr.flags |= MORE_DATA_FLAG;

        let decoded = MessageHeader::decode(&hdr.encode());

        assert_eq!(decoded, hdr);
        assert_eq!(decoded.magic, MESSAGE_MAGIC);
        assert_eq!(decoded.command(), Command::DataRequest);
        assert!(decoded.more_data());
    }

    #[test]
    fn test_header_magic_offset() {
        let hdr = MessageHeader::new(PartyId(0), PartyId(0), Command::ConnectResponse, 0, 0);
        let buf = hdr.encode();

        // The first four bytes carry the magic, which the legacy connect
        // reply heuristic relies on.
        assert_eq!(&buf[..4], &[0x00, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_event_info_roundtrip() {
        let info = EventInfo::new((2 << 16) | 1, RequestType::Request as u32, 0x42, 17);
        let decoded = EventInfo::decode(&info.encode());

        assert_eq!(decoded, info);
        assert_eq!(decoded.request_type(), Some(RequestType::Request));
    }

    #[test]
    fn test_event_info_result_state() {
        let ok = EventInfo::new(0, ResultType::DataOk as u32, 0, 0);
        let invalid = EventInfo::new(0, ResultType::DataInvalid as u32, 0, 0);

        assert_eq!(ok.data_state(), DataState::Ok);
        assert_eq!(invalid.data_state(), DataState::Invalid);
    }

    #[test]
    fn test_unknown_command_folds_to_invalid() {
        assert_eq!(Command::from_u32(99), Command::Invalid);
        assert_eq!(RequestType::from_u32(0x099), None);
        assert_eq!(ResultType::from_u32(0x0299), None);
    }

    #[test]
    fn test_connect_info_roundtrip() {
        let local = ConnectRequestInfo { pid: 1234, channel: 7 };
        assert_eq!(ConnectRequestInfo::decode(&local.encode()), local);

        let tcp = TcpConnectRequestInfo {
            ip_address: 0x7F00_0001,
            port: 7766,
        };
        assert_eq!(TcpConnectRequestInfo::decode(&tcp.encode()), tcp);
    }
}
