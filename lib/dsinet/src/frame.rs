//! Outbound message assembly and inbound payload reassembly. A message
//! whose payload exceeds the packet capacity is scattered over several
//! packets that repeat the header; only the first packet carries the event
//! info block.

use crate::channel::{Channel, ChannelRef};
use crate::error::{ErrorType, NetError, NetResult};
use dsibase::ostream::OStream;
use dsibase::wire::{
    Command, EventInfo, MessageHeader, RequestType, ResultType, EVENT_INFO_SIZE, HEADER_SIZE,
    MORE_DATA_FLAG,
};
use dsibase::{PartyId, PAYLOAD_SIZE};

/// Writer for one outbound message. The payload is serialized into an
/// internal buffer and scattered onto the channel on `flush`.
pub struct RequestWriter {
    channel: ChannelRef,
    header: MessageHeader,
    info: Option<EventInfo>,
    buf: Vec<u8>,
}

impl RequestWriter {
    /// Writer for a data request carrying a request type.
    pub fn data_request(
        channel: ChannelRef,
        if_version: u32,
        ty: RequestType,
        id: u32,
        sequence_nr: i32,
        client_id: PartyId,
        server_id: PartyId,
        proto_minor: u16,
    ) -> RequestWriter {
        RequestWriter {
            channel,
            header: MessageHeader::new(server_id, client_id, Command::DataRequest, proto_minor, 0),
            info: Some(EventInfo::new(if_version, ty as u32, id, sequence_nr)),
            buf: Vec::new(),
        }
    }

    /// Writer for a data response carrying a result type.
    pub fn data_response(
        channel: ChannelRef,
        if_version: u32,
        result: ResultType,
        id: u32,
        sequence_nr: i32,
        client_id: PartyId,
        server_id: PartyId,
        proto_minor: u16,
    ) -> RequestWriter {
        RequestWriter {
            channel,
            header: MessageHeader::new(server_id, client_id, Command::DataResponse, proto_minor, 0),
            info: Some(EventInfo::new(if_version, result as u32, id, sequence_nr)),
            buf: Vec::new(),
        }
    }

    /// Writer for a control message without event info, e.g. connect and
    /// disconnect requests.
    pub fn control(
        channel: ChannelRef,
        cmd: Command,
        client_id: PartyId,
        server_id: PartyId,
        proto_minor: u16,
    ) -> RequestWriter {
        RequestWriter {
            channel,
            header: MessageHeader::new(server_id, client_id, cmd, proto_minor, 0),
            info: None,
            buf: Vec::new(),
        }
    }

    /// Serializer appending to the payload.
    #[inline]
    pub fn ostream(&mut self) -> OStream {
        OStream::new(&mut self.buf)
    }

    /// Frame the message and send all packets.
    pub fn flush(self) -> NetResult<()> {
        let info_len = if self.info.is_some() { EVENT_INFO_SIZE } else { 0 };
        let total = self.buf.len() + info_len;

        let mut header = self.header;
        let first_len = total.min(PAYLOAD_SIZE);

        header.packet_length = first_len as u32;
        if total > PAYLOAD_SIZE {
            header.flags |= MORE_DATA_FLAG;
        }

        let hdr = header.encode();
        let first_user = first_len - info_len;

        match self.info {
            Some(info) => {
                let info_bytes = info.encode();
                self.channel
                    .send_vectored(&[&hdr, &info_bytes, &self.buf[..first_user]])?;
            }
            None => {
                self.channel.send_vectored(&[&hdr, &self.buf[..first_user]])?;
            }
        }

        // continuation packets repeat the header without event info
        let mut sent = first_user;

        while sent < self.buf.len() {
            let remaining = self.buf.len() - sent;
            let chunk = remaining.min(PAYLOAD_SIZE);

            header.packet_length = chunk as u32;
            if remaining > PAYLOAD_SIZE {
                header.flags |= MORE_DATA_FLAG;
            } else {
                header.flags &= !MORE_DATA_FLAG;
            }

            let hdr = header.encode();
            self.channel.send_vectored(&[&hdr, &self.buf[sent..sent + chunk]])?;

            sent += chunk;
        }

        Ok(())
    }
}

/// Read the complete payload of a message whose header has already been
/// consumed, concatenating continuation packets in arrival order.
pub fn receive_payload(channel: &dyn Channel, header: &MessageHeader) -> NetResult<Vec<u8>> {
    let mut buf = Vec::new();
    let mut current = *header;

    loop {
        let len = current.packet_length as usize;

        if len > PAYLOAD_SIZE {
            return Err(NetError::Fatal(ErrorType::PayloadTooLarge));
        }

        if len > 0 {
            let start = buf.len();
            buf.resize(start + len, 0);
            channel.recv_all(&mut buf[start..])?;
        }

        if !current.more_data() {
            break;
        }

        let mut hdr_buf = [0u8; HEADER_SIZE];
        channel.recv_all(&mut hdr_buf)?;
        current = MessageHeader::decode(&hdr_buf);
    }

    Ok(buf)
}
